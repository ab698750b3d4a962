//! OBD-II parameter recorder
//!
//! This library polls an ELM327-compatible OBD-II adapter over a serial port
//! at a fixed interval, reads a configurable set of diagnostic parameters and
//! appends each sample (timestamp + one column per parameter) to a CSV log.
//!
//! # Quick Start
//!
//! ## Recording Every Catalog Parameter
//! ```no_run
//! use obd_recorder::{catalog, ConnectionManager, CsvSink, Sampler, SamplingConfig, SerialPortProvider};
//!
//! let parameters = catalog::load_all("obd2_std_PIDs.csv")?;
//! let manager = ConnectionManager::new(SerialPortProvider::default());
//! let connection = manager.discover_and_connect_any()?;
//!
//! let config = SamplingConfig::new(1.0, parameters)?;
//! let sink = CsvSink::create("obd2_data.csv")?;
//! let mut sampler = Sampler::new(config, connection, sink);
//! let summary = sampler.run()?;
//! println!("Wrote {} samples", summary.samples_written);
//! # Ok::<(), obd_recorder::Error>(())
//! ```
//!
//! ## Stopping From Another Thread
//! ```no_run
//! use obd_recorder::{catalog, ConnectionManager, MemorySink, Sampler, SamplingConfig, SerialPortProvider};
//! use std::time::Duration;
//!
//! let catalog = catalog::load_all("obd2_std_PIDs.csv")?;
//! let rpm_and_speed = catalog::select(&catalog, &["010C".into(), "010D".into()])?;
//!
//! let manager = ConnectionManager::new(SerialPortProvider::default());
//! let connection = manager.discover_and_connect(&["/dev/rfcomm0".to_string()])?;
//!
//! let config = SamplingConfig::new(0.5, rpm_and_speed)?;
//! let mut sampler = Sampler::new(config, connection, MemorySink::new());
//! let stop = sampler.stop_handle();
//!
//! std::thread::spawn(move || {
//!     std::thread::sleep(Duration::from_secs(30));
//!     stop.stop();
//! });
//! sampler.run()?;
//! println!("{} samples in memory", sampler.sink().records.len());
//! # Ok::<(), obd_recorder::Error>(())
//! ```

pub mod catalog;
pub mod connection;
pub mod elm327;
pub mod error;
pub mod sampler;
pub mod sink;
pub mod timing;

#[cfg(test)]
mod test_support;

// Re-export public API
pub use catalog::ParameterDescriptor;
pub use connection::{
    ActiveConnection, ConnectionManager, ConnectionState, ParameterValue, PortProvider, Transport,
};
pub use elm327::{Elm327, SerialPortProvider};
pub use error::{CatalogError, ConfigError, ConnectionError, Error, ReadError, Result, SinkError};
pub use sampler::{RunSummary, Sample, Sampler, SamplerState, SamplingConfig, TickOutcome};
pub use sink::{CsvSink, MemorySink, Reading, Sink};
pub use timing::StopHandle;
