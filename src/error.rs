//! Error types for the OBD-II recorder

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to establish or keep the diagnostics connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// No candidate port opened and passed the liveness probe
    #[error("No OBD-II device found on any candidate port")]
    NoDeviceFound,

    /// The connection dropped while sampling
    #[error("Connection to {port} lost: {reason}")]
    Lost { port: String, reason: ReadError },

    /// A connection is already live; close it before connecting again
    #[error("A connection is already active")]
    AlreadyConnected,

    /// Serial port enumeration failed
    #[error("Port discovery failed: {0}")]
    Discovery(String),

    /// A single candidate failed to open or handshake
    #[error("Failed to open {port}: {reason}")]
    Open { port: String, reason: String },
}

/// Failure of a single parameter read
///
/// Recorded in place of the value for that column; never fatal on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// No complete reply before the command timeout
    #[error("timed out waiting for reply")]
    Timeout,

    /// The vehicle answered `NO DATA`
    #[error("no data")]
    NoData,

    /// The adapter rejected the request
    #[error("parameter not supported")]
    Unsupported,

    /// The reply could not be understood
    #[error("malformed reply: {0}")]
    Malformed(String),

    /// The transport went away
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The read was abandoned because sampling was stopped
    #[error("cancelled")]
    Cancelled,
}

impl ReadError {
    /// Stable short code used in the output log
    pub fn code(&self) -> &'static str {
        match self {
            ReadError::Timeout => "timeout",
            ReadError::NoData => "no_data",
            ReadError::Unsupported => "unsupported",
            ReadError::Malformed(_) => "malformed",
            ReadError::Disconnected(_) => "disconnected",
            ReadError::Cancelled => "cancelled",
        }
    }

    /// Whether this error means the connection itself is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ReadError::Disconnected(_))
    }
}

/// Failure to load the parameter reference table
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The table could not be parsed into (mode, pid, description) rows
    #[error("Malformed reference table {path}, line {line}: {reason}")]
    MalformedTable {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    /// The table file could not be read at all
    #[error("Cannot read reference table {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A requested code is not in the catalog
    #[error("Unknown parameter code: {0}")]
    UnknownCode(String),

    /// A code was requested more than once
    #[error("Parameter code requested twice: {0}")]
    DuplicateCode(String),
}

/// Failure of the output sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// The destination could not be created
    #[error("Cannot open output {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A write or flush failed
    #[error("Output write failed: {0}")]
    Write(#[source] io::Error),

    /// No space left on the output device
    #[error("Output storage is full")]
    StorageFull,

    #[error("Header already written")]
    HeaderAlreadyWritten,

    #[error("Record appended before header")]
    MissingHeader,

    #[error("Record has {actual} columns, header has {expected}")]
    ColumnMismatch { expected: usize, actual: usize },

    #[error("Sink is closed")]
    Closed,
}

impl SinkError {
    /// Whether sampling must stop after this error
    ///
    /// Plain write failures are transient: the record is lost but later
    /// records may still get through.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SinkError::Write(_))
    }
}

impl From<io::Error> for SinkError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::StorageFull {
            SinkError::StorageFull
        } else {
            SinkError::Write(err)
        }
    }
}

impl From<csv::Error> for SinkError {
    fn from(err: csv::Error) -> Self {
        match err.into_kind() {
            csv::ErrorKind::Io(e) => e.into(),
            other => SinkError::Write(io::Error::other(format!("{:?}", other))),
        }
    }
}

/// Invalid run configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Sampling interval must be a positive number of seconds, got {0}")]
    InvalidInterval(f64),

    #[error("Timeout must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),

    #[error("Duration must be a positive number of seconds, got {0}")]
    InvalidDuration(f64),
}

/// Any failure that ends a recording run
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Process exit code, distinct per failure kind
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Catalog(_) => 3,
            Error::Connection(ConnectionError::NoDeviceFound) => 4,
            Error::Connection(ConnectionError::Lost { .. }) => 5,
            Error::Sink(_) => 6,
            Error::Connection(_) => 7,
        }
    }
}

/// Result type for recorder operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            Error::Config(ConfigError::InvalidInterval(0.0)),
            Error::Catalog(CatalogError::UnknownCode("01FF".into())),
            Error::Connection(ConnectionError::NoDeviceFound),
            Error::Connection(ConnectionError::Lost {
                port: "A".into(),
                reason: ReadError::Disconnected("gone".into()),
            }),
            Error::Sink(SinkError::Closed),
            Error::Connection(ConnectionError::Discovery("no ports".into())),
        ];
        let mut codes: Vec<i32> = errors.iter().map(Error::exit_code).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_storage_full_is_fatal() {
        let err: SinkError = io::Error::new(io::ErrorKind::StorageFull, "disk full").into();
        assert!(matches!(err, SinkError::StorageFull));
        assert!(err.is_fatal());

        let err: SinkError = io::Error::new(io::ErrorKind::Interrupted, "eintr").into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_read_error_codes() {
        assert_eq!(ReadError::NoData.code(), "no_data");
        assert!(ReadError::Disconnected("eof".into()).is_disconnect());
        assert!(!ReadError::Timeout.is_disconnect());
    }
}
