//! Scripted transports and sinks for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::connection::{ParameterValue, PortProvider, Transport, LIVENESS_PROBE};
use crate::error::{ConnectionError, ReadError, SinkError};
use crate::sink::{Reading, Sink};

/// Transport answering from a fixed table of replies
pub struct MockTransport {
    name: String,
    replies: HashMap<String, Result<ParameterValue, ReadError>>,
    delay: Duration,
    reads: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

impl MockTransport {
    /// Every code answers `00` until told otherwise
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replies: HashMap::new(),
            delay: Duration::ZERO,
            reads: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_reply(mut self, code: &str, reply: Result<ParameterValue, ReadError>) -> Self {
        self.replies.insert(code.to_string(), reply);
        self
    }

    /// Opens fine but is not an OBD adapter
    pub fn failing_probe(self) -> Self {
        self.with_reply(LIVENESS_PROBE, Err(ReadError::Timeout))
    }

    /// Every read blocks for `delay`
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Codes requested so far, probe included
    pub fn reads(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.reads)
    }

    pub fn close_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl Transport for MockTransport {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn read_parameter(&mut self, code: &str) -> Result<ParameterValue, ReadError> {
        self.reads.lock().unwrap().push(code.to_string());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.replies
            .get(code)
            .cloned()
            .unwrap_or_else(|| Ok(ParameterValue(vec![0x00])))
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Provider over a fixed set of mock ports, in insertion order
pub struct MockProvider {
    order: Vec<String>,
    ports: Mutex<HashMap<String, Option<MockTransport>>>,
    opened: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            ports: Mutex::new(HashMap::new()),
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_port(mut self, name: &str, transport: MockTransport) -> Self {
        self.order.push(name.to_string());
        self.ports
            .get_mut()
            .unwrap()
            .insert(name.to_string(), Some(transport));
        self
    }

    /// A port that is listed but cannot be opened
    pub fn with_unopenable_port(mut self, name: &str) -> Self {
        self.order.push(name.to_string());
        self.ports.get_mut().unwrap().insert(name.to_string(), None);
        self
    }

    /// Ports passed to `open`, in call order
    pub fn opened(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.opened)
    }
}

impl PortProvider for MockProvider {
    type Transport = MockTransport;

    fn discover_ports(&self) -> Result<Vec<String>, ConnectionError> {
        Ok(self.order.clone())
    }

    fn open(&self, port: &str, _timeout: Duration) -> Result<MockTransport, ConnectionError> {
        self.opened.lock().unwrap().push(port.to_string());
        let not_openable = || ConnectionError::Open {
            port: port.to_string(),
            reason: "no such port".to_string(),
        };
        self.ports
            .lock()
            .unwrap()
            .get_mut(port)
            .and_then(Option::take)
            .ok_or_else(not_openable)
    }
}

/// Wraps a sink and injects append failures
///
/// `fail` is called with the 1-based append count and may return an error to
/// report instead of appending.
pub struct FailingSink<S, F> {
    pub inner: S,
    fail: F,
    appends: u64,
}

impl<S, F> FailingSink<S, F>
where
    S: Sink,
    F: FnMut(u64) -> Option<SinkError>,
{
    pub fn new(inner: S, fail: F) -> Self {
        Self {
            inner,
            fail,
            appends: 0,
        }
    }
}

impl<S, F> Sink for FailingSink<S, F>
where
    S: Sink,
    F: FnMut(u64) -> Option<SinkError>,
{
    fn write_header(&mut self, columns: &[String]) -> Result<(), SinkError> {
        self.inner.write_header(columns)
    }

    fn append_record(
        &mut self,
        timestamp: DateTime<Local>,
        values: &[Reading],
    ) -> Result<(), SinkError> {
        self.appends += 1;
        match (self.fail)(self.appends) {
            Some(e) => Err(e),
            None => self.inner.append_record(timestamp, values),
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.inner.close()
    }
}
