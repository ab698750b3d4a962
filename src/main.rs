//! OBD-II Recorder
//!
//! Samples OBD-II parameters at a fixed interval and writes them to a CSV log.
//!
//! Usage:
//!   obd-recorder -i obd2_std_PIDs.csv -o drive.csv -s 0.5

use clap::Parser;
use obd_recorder::{
    catalog, ConfigError, ConnectionError, ConnectionManager, CsvSink, Error, Sampler,
    SamplingConfig, SerialPortProvider, StopHandle,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "obd-recorder")]
#[command(about = "Record OBD-II parameters to a CSV file", long_about = None)]
struct Args {
    /// Reference table of OBD-II PIDs (Mode_hex, PID_hex, Description)
    #[arg(short = 'i', long = "obd2-pid-csv", default_value = "obd2_std_PIDs.csv")]
    obd2_pid_csv: PathBuf,

    /// Output CSV path (default: collected_data/obd2_data_<timestamp>.csv)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seconds between samples
    #[arg(short, long = "sampling-interval", default_value = "1.0")]
    sampling_interval: f64,

    /// Serial port to try; repeat to try several in order (default: discover)
    #[arg(short, long = "port")]
    ports: Vec<String>,

    /// Comma-separated parameter codes to sample (default: whole table)
    #[arg(long, value_delimiter = ',')]
    pids: Vec<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = obd_recorder::elm327::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Per-command and handshake timeout in seconds
    #[arg(long, default_value = "2.0")]
    timeout: f64,

    /// Duration in seconds (optional, runs until Ctrl+C if omitted)
    #[arg(short, long)]
    duration: Option<f64>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Exit successfully when the connection drops mid-run
    #[arg(long)]
    lost_is_graceful: bool,

    /// Sync every record to disk, not just flush it
    #[arg(long)]
    fsync: bool,
}

fn default_output() -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S");
    PathBuf::from("collected_data").join(format!("obd2_data_{}.csv", stamp))
}

fn positive_secs(value: f64, invalid: fn(f64) -> ConfigError) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(value));
    }
    Duration::try_from_secs_f64(value).map_err(|_| invalid(value))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\nError: {}", e);
            if let Error::Connection(ConnectionError::NoDeviceFound) = e {
                eprintln!("Please check:");
                eprintln!("  1. The OBD-II adapter is plugged in and the ignition is on");
                eprintln!("  2. Bluetooth adapters are paired and bound (e.g. /dev/rfcomm0)");
                eprintln!("  3. No other application is using the port");
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(args: Args) -> Result<(), Error> {
    let provider = SerialPortProvider::new(args.baud);

    if args.list_ports {
        let manager = ConnectionManager::new(provider);
        for port in manager.discover_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    let timeout = positive_secs(args.timeout, ConfigError::InvalidTimeout)?;
    let run_for = args
        .duration
        .map(|d| positive_secs(d, ConfigError::InvalidDuration))
        .transpose()?;

    let table = catalog::load_all(&args.obd2_pid_csv)?;
    let parameters = catalog::select(&table, &args.pids)?;
    let config = SamplingConfig::new(args.sampling_interval, parameters)?.with_run_for(run_for);
    let output = args.output.unwrap_or_else(default_output);

    println!("OBD-II Recorder");
    println!("===============");
    println!("Reference table: {}", args.obd2_pid_csv.display());
    println!("Parameters: {}", config.parameters().len());
    println!("Interval: {} s", args.sampling_interval);
    println!("Output file: {}", output.display());
    match run_for {
        Some(d) => println!("Duration: {:.1} seconds", d.as_secs_f64()),
        None => println!("Duration: continuous (Ctrl+C to stop)"),
    }
    println!();

    println!("Connecting...");
    let manager = ConnectionManager::new(provider).with_timeout(timeout);
    let connection = if args.ports.is_empty() {
        manager.discover_and_connect_any()?
    } else {
        manager.discover_and_connect(&args.ports)?
    };
    println!("Connected to {}\n", connection.port_name());

    let sink = CsvSink::create(&output)?.with_fsync(args.fsync);

    // Setup Ctrl+C handler
    let stop = StopHandle::new();
    let s = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping collection...");
        s.stop();
    }) {
        log::warn!("Ctrl+C handler not installed: {}", e);
    }

    let collection_start = std::time::Instant::now();
    let mut sampler = Sampler::new(config, connection, sink).with_stop_handle(stop);

    println!("Starting data collection...");
    println!("Press Ctrl+C to stop\n");

    let result = sampler.run();
    let summary = sampler.summary().clone();

    println!("\nCollection complete!");
    println!("Total samples: {}", summary.samples_written);
    println!("Failed reads: {}", summary.read_failures);
    println!("Dropped samples: {}", summary.sink_failures);
    println!("Overrun ticks: {}", summary.overruns);
    println!("Elapsed time: {:.2} seconds", collection_start.elapsed().as_secs_f64());
    println!("File: {}", output.display());

    match result {
        Err(Error::Connection(ConnectionError::Lost { port, reason })) if args.lost_is_graceful => {
            println!("Connection to {} lost ({}), stopping", port, reason);
            Ok(())
        }
        other => other.map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["obd-recorder"]);
        assert_eq!(args.obd2_pid_csv, PathBuf::from("obd2_std_PIDs.csv"));
        assert_eq!(args.sampling_interval, 1.0);
        assert_eq!(args.baud, 38400);
        assert!(args.ports.is_empty());
        assert!(args.pids.is_empty());
        assert!(args.output.is_none());
    }

    #[test]
    fn test_args_short_flags() {
        let args = Args::parse_from([
            "obd-recorder", "-i", "pids.csv", "-o", "out.csv", "-s", "0.25", "-p", "COM3",
            "-p", "COM4", "--pids", "010C,010D",
        ]);
        assert_eq!(args.output, Some(PathBuf::from("out.csv")));
        assert_eq!(args.sampling_interval, 0.25);
        assert_eq!(args.ports, vec!["COM3", "COM4"]);
        assert_eq!(args.pids, vec!["010C", "010D"]);
    }

    #[test]
    fn test_positive_secs() {
        assert_eq!(
            positive_secs(2.0, ConfigError::InvalidTimeout).unwrap(),
            Duration::from_secs(2)
        );
        assert_eq!(
            positive_secs(0.0, ConfigError::InvalidDuration),
            Err(ConfigError::InvalidDuration(0.0))
        );
        assert!(positive_secs(f64::INFINITY, ConfigError::InvalidTimeout).is_err());
        assert_eq!(
            positive_secs(1e20, ConfigError::InvalidDuration),
            Err(ConfigError::InvalidDuration(1e20))
        );
    }

    #[test]
    fn test_default_output_location() {
        let path = default_output();
        assert!(path.starts_with("collected_data"));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("csv"));
    }
}
