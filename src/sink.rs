//! Output sinks for recorded samples
//!
//! The sampler only talks to the [`Sink`] trait. [`CsvSink`] is the file-backed
//! log written by the recorder binary; [`MemorySink`] keeps everything in
//! memory.
//!
//! CSV layout:
//! ```text
//! Timestamp,Engine RPM,Vehicle speed
//! 2024-05-01T14:03:07.123456+02:00,1AF8,32
//! 2024-05-01T14:03:08.123911+02:00,ERR:no_data,33
//! ```

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat};

use crate::connection::ParameterValue;
use crate::error::{ReadError, SinkError};

/// Name of the first column of every log
pub const TIMESTAMP_COLUMN: &str = "Timestamp";

/// Value for one column of a sample
pub type Reading = Result<ParameterValue, ReadError>;

/// Durable, append-only destination for samples
///
/// Implementations must keep records in call order and accept the header
/// exactly once, before the first record.
pub trait Sink {
    /// Write the column header (`Timestamp` followed by `columns`)
    fn write_header(&mut self, columns: &[String]) -> Result<(), SinkError>;

    /// Append one record
    fn append_record(
        &mut self,
        timestamp: DateTime<Local>,
        values: &[Reading],
    ) -> Result<(), SinkError>;

    /// Flush and release the destination; later calls do nothing
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Render a timestamp the way every sink writes it
pub fn format_timestamp(timestamp: &DateTime<Local>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Render one cell; failed reads become `ERR:<code>`
pub fn format_reading(reading: &Reading) -> String {
    match reading {
        Ok(value) => value.to_string(),
        Err(e) => format!("ERR:{}", e.code()),
    }
}

/// Tracks header/record ordering shared by the sink implementations
#[derive(Debug, Default)]
struct HeaderGuard {
    columns: Option<usize>,
    closed: bool,
}

impl HeaderGuard {
    fn on_header(&mut self, columns: usize) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        if self.columns.is_some() {
            return Err(SinkError::HeaderAlreadyWritten);
        }
        self.columns = Some(columns);
        Ok(())
    }

    fn on_record(&self, values: usize) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        match self.columns {
            None => Err(SinkError::MissingHeader),
            Some(expected) if expected != values => Err(SinkError::ColumnMismatch {
                expected,
                actual: values,
            }),
            Some(_) => Ok(()),
        }
    }
}

/// CSV file sink
///
/// Every record is flushed to the operating system before
/// [`Sink::append_record`] returns. Syncing to the storage device is opt-in
/// through [`CsvSink::with_fsync`].
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    guard: HeaderGuard,
    fsync: bool,
    records: u64,
}

impl CsvSink {
    /// Create (or truncate) the log file, creating parent directories
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| SinkError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(open_err)?;

        log::info!("Logging to {}", path.display());
        Ok(Self {
            path,
            writer: csv::Writer::from_writer(file),
            guard: HeaderGuard::default(),
            fsync: false,
            records: 0,
        })
    }

    /// Sync each record to the storage device, not just the OS
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended so far
    pub fn record_count(&self) -> u64 {
        self.records
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        if self.fsync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl Sink for CsvSink {
    fn write_header(&mut self, columns: &[String]) -> Result<(), SinkError> {
        self.guard.on_header(columns.len())?;
        let header = std::iter::once(TIMESTAMP_COLUMN).chain(columns.iter().map(String::as_str));
        self.writer.write_record(header)?;
        self.flush()
    }

    fn append_record(
        &mut self,
        timestamp: DateTime<Local>,
        values: &[Reading],
    ) -> Result<(), SinkError> {
        self.guard.on_record(values.len())?;
        let row = std::iter::once(format_timestamp(&timestamp))
            .chain(values.iter().map(format_reading));
        self.writer.write_record(row)?;
        self.flush()?;
        self.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.guard.closed {
            return Ok(());
        }
        self.guard.closed = true;
        self.flush()?;
        log::info!("Closed {} after {} records", self.path.display(), self.records);
        Ok(())
    }
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct MemorySink {
    pub header: Option<Vec<String>>,
    pub records: Vec<(DateTime<Local>, Vec<Reading>)>,
    guard: HeaderGuard,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.guard.closed
    }
}

impl Sink for MemorySink {
    fn write_header(&mut self, columns: &[String]) -> Result<(), SinkError> {
        self.guard.on_header(columns.len())?;
        let mut header = vec![TIMESTAMP_COLUMN.to_string()];
        header.extend_from_slice(columns);
        self.header = Some(header);
        Ok(())
    }

    fn append_record(
        &mut self,
        timestamp: DateTime<Local>,
        values: &[Reading],
    ) -> Result<(), SinkError> {
        self.guard.on_record(values.len())?;
        self.records.push((timestamp, values.to_vec()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.guard.closed = true;
        Ok(())
    }
}
