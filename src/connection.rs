//! Connection management
//!
//! The diagnostics adapter is reached through a [`PortProvider`], which knows
//! how to enumerate ports and open a [`Transport`] on one of them. The
//! [`ConnectionManager`] walks a list of candidate ports, opens each with a
//! bounded handshake and keeps the first one that answers the liveness probe.
//!
//! At most one [`ActiveConnection`] exists per manager. Dropping or closing it
//! releases the port and lets the manager connect again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConnectionError, ReadError};

/// Supported-PIDs request; every compliant ECU answers it
pub const LIVENESS_PROBE: &str = "0100";

/// Default handshake and per-command timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Raw response data for one parameter
///
/// Holds the data bytes of the reply, without the mode/PID echo. Displayed as
/// uppercase hex (`1AF8`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterValue(pub Vec<u8>);

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// An open request/response channel to the diagnostics adapter
pub trait Transport: Send {
    /// Name of the port this transport is bound to
    fn port_name(&self) -> &str;

    /// Request one parameter and wait for its reply
    fn read_parameter(&mut self, code: &str) -> Result<ParameterValue, ReadError>;

    /// Release the underlying port
    fn close(&mut self);
}

/// Source of candidate ports and transports
pub trait PortProvider {
    type Transport: Transport;

    /// Enumerate ports that may host the adapter, most likely first
    fn discover_ports(&self) -> Result<Vec<String>, ConnectionError>;

    /// Open a port and run the adapter handshake within `timeout`
    fn open(&self, port: &str, timeout: Duration) -> Result<Self::Transport, ConnectionError>;
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Finds the adapter and hands out the single live connection
pub struct ConnectionManager<P: PortProvider> {
    provider: P,
    timeout: Duration,
    live: Arc<AtomicBool>,
}

impl<P: PortProvider> ConnectionManager<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            timeout: DEFAULT_TIMEOUT,
            live: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the handshake timeout used for each candidate
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ports reported by the provider
    pub fn discover_ports(&self) -> Result<Vec<String>, ConnectionError> {
        self.provider.discover_ports()
    }

    /// Discover ports, then connect to the first that answers
    pub fn discover_and_connect_any(
        &self,
    ) -> Result<ActiveConnection<P::Transport>, ConnectionError> {
        let ports = self.provider.discover_ports()?;
        log::info!("Candidate ports: {:?}", ports);
        self.discover_and_connect(&ports)
    }

    /// Try each candidate in order and keep the first live one
    ///
    /// Candidates after the first success are never touched.
    pub fn discover_and_connect(
        &self,
        candidates: &[String],
    ) -> Result<ActiveConnection<P::Transport>, ConnectionError> {
        if self.live.load(Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyConnected);
        }

        for port in candidates {
            let mut transport = match self.provider.open(port, self.timeout) {
                Ok(t) => t,
                Err(e) => {
                    log::debug!("Skipping {}: {}", port, e);
                    continue;
                }
            };

            match transport.read_parameter(LIVENESS_PROBE) {
                Ok(_) => {
                    log::info!("Connected to {}", port);
                    self.live.store(true, Ordering::SeqCst);
                    return Ok(ActiveConnection {
                        transport,
                        state: ConnectionState::Connected,
                        live: Arc::clone(&self.live),
                    });
                }
                Err(e) => {
                    log::debug!("{} opened but failed liveness probe: {}", port, e);
                    transport.close();
                }
            }
        }

        Err(ConnectionError::NoDeviceFound)
    }

    /// Whether a connection handed out by this manager is still open
    pub fn is_connected(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// The one live connection to the adapter
///
/// Owns its transport exclusively. A disconnection-class read error moves it
/// to [`ConnectionState::Disconnected`] and releases the port.
pub struct ActiveConnection<T: Transport> {
    transport: T,
    state: ConnectionState,
    live: Arc<AtomicBool>,
}

impl<T: Transport> ActiveConnection<T> {
    pub fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Read one parameter
    pub fn read_parameter(&mut self, code: &str) -> Result<ParameterValue, ReadError> {
        if !self.is_connected() {
            return Err(ReadError::Disconnected("connection closed".to_string()));
        }
        let result = self.transport.read_parameter(code);
        if let Err(e) = &result {
            if e.is_disconnect() {
                log::warn!("Lost connection to {}: {}", self.port_name(), e);
                self.close();
            }
        }
        result
    }

    /// Release the port; later calls do nothing
    pub fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.transport.close();
        self.state = ConnectionState::Disconnected;
        self.live.store(false, Ordering::SeqCst);
        log::info!("Closed connection to {}", self.transport.port_name());
    }
}

impl<T: Transport> Drop for ActiveConnection<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockProvider, MockTransport};

    fn ports(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parameter_value_hex() {
        assert_eq!(ParameterValue(vec![0x1A, 0xF8]).to_string(), "1AF8");
        assert_eq!(ParameterValue(vec![]).to_string(), "");
    }

    #[test]
    fn test_connects_first_live_candidate_only() {
        let provider = MockProvider::new()
            .with_port("A", MockTransport::new("A").failing_probe())
            .with_port("B", MockTransport::new("B"))
            .with_port("C", MockTransport::new("C"));
        let opened = provider.opened();

        let manager = ConnectionManager::new(provider);
        let conn = manager.discover_and_connect(&ports(&["A", "B", "C"])).unwrap();

        assert_eq!(conn.port_name(), "B");
        assert!(conn.is_connected());
        assert_eq!(*opened.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn test_port_that_fails_to_open_is_skipped() {
        let provider = MockProvider::new()
            .with_unopenable_port("A")
            .with_port("B", MockTransport::new("B"));
        let manager = ConnectionManager::new(provider);
        let conn = manager.discover_and_connect(&ports(&["A", "B"])).unwrap();
        assert_eq!(conn.port_name(), "B");
    }

    #[test]
    fn test_no_device_found() {
        let provider = MockProvider::new()
            .with_port("A", MockTransport::new("A").failing_probe())
            .with_unopenable_port("B");
        let manager = ConnectionManager::new(provider);
        let err = manager.discover_and_connect(&ports(&["A", "B"])).err().unwrap();
        assert!(matches!(err, ConnectionError::NoDeviceFound));

        let err = manager.discover_and_connect(&[]).err().unwrap();
        assert!(matches!(err, ConnectionError::NoDeviceFound));
    }

    #[test]
    fn test_failed_probe_closes_transport() {
        let transport = MockTransport::new("A").failing_probe();
        let closes = transport.close_count();
        let manager = ConnectionManager::new(MockProvider::new().with_port("A", transport));
        assert!(manager.discover_and_connect(&ports(&["A"])).is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let transport = MockTransport::new("A");
        let closes = transport.close_count();
        let manager = ConnectionManager::new(MockProvider::new().with_port("A", transport));
        let mut conn = manager.discover_and_connect(&ports(&["A"])).unwrap();
        assert!(manager.is_connected());

        conn.close();
        conn.close();
        drop(conn);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_single_live_connection() {
        let provider = MockProvider::new()
            .with_port("A", MockTransport::new("A"))
            .with_port("B", MockTransport::new("B"));
        let manager = ConnectionManager::new(provider);
        let conn = manager.discover_and_connect(&ports(&["A"])).unwrap();

        let err = manager.discover_and_connect(&ports(&["B"])).err().unwrap();
        assert!(matches!(err, ConnectionError::AlreadyConnected));

        drop(conn);
        let conn = manager.discover_and_connect(&ports(&["B"])).unwrap();
        assert_eq!(conn.port_name(), "B");
    }

    #[test]
    fn test_disconnect_error_closes_connection() {
        let transport = MockTransport::new("A").with_reply(
            "010C",
            Err(ReadError::Disconnected("device removed".into())),
        );
        let manager = ConnectionManager::new(MockProvider::new().with_port("A", transport));
        let mut conn = manager.discover_and_connect(&ports(&["A"])).unwrap();

        assert!(conn.read_parameter("010C").unwrap_err().is_disconnect());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
        assert!(conn.read_parameter("010D").is_err());
    }

    #[test]
    fn test_discover_and_connect_any_uses_provider_order() {
        let provider = MockProvider::new()
            .with_port("/dev/ttyUSB0", MockTransport::new("/dev/ttyUSB0").failing_probe())
            .with_port("/dev/rfcomm0", MockTransport::new("/dev/rfcomm0"));
        let manager = ConnectionManager::new(provider);
        let conn = manager.discover_and_connect_any().unwrap();
        assert_eq!(conn.port_name(), "/dev/rfcomm0");
    }
}
