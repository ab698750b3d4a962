//! ELM327-style serial transport
//!
//! Talks to an ELM327-compatible OBD-II adapter over a serial port (USB or
//! Bluetooth RFCOMM). Each request is the 4-digit parameter code terminated by
//! `\r`; the adapter answers with one or more hex lines followed by the `>`
//! prompt.
//!
//! Replies are not decoded into engineering units. A successful read returns
//! the data bytes that follow the mode/PID echo, e.g. `41 0C 1A F8` for
//! request `010C` yields `[0x1A, 0xF8]`.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort, SerialPortType};

use crate::connection::{ParameterValue, PortProvider, Transport};
use crate::error::{ConnectionError, ReadError};

/// Factory default of most ELM327 clones
pub const DEFAULT_BAUD_RATE: u32 = 38400;

const PROMPT: u8 = b'>';

// Serial read timeout; the command deadline is enforced separately
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Adapter set-up sent after opening the port, in order
const INIT_COMMANDS: &[&str] = &[
    "ATZ",   // reset
    "ATE0",  // echo off
    "ATL0",  // linefeeds off
    "ATSP0", // automatic protocol
];

/// Enumerates OS serial ports and opens ELM327 transports on them
pub struct SerialPortProvider {
    baud_rate: u32,
}

impl SerialPortProvider {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for SerialPortProvider {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

/// Lower ranks are tried first
///
/// USB-serial and Bluetooth-serial ports are where adapters live; on-board
/// UARTs (`ttyS*`, `COM1`) almost never are.
fn port_rank(name: &str, usb_or_bluetooth: bool) -> u8 {
    let name = name.to_ascii_lowercase();
    if usb_or_bluetooth || name.contains("rfcomm") {
        0
    } else if name.contains("ttyusb") || name.contains("ttyacm") || name.contains("usbserial") {
        1
    } else {
        2
    }
}

impl PortProvider for SerialPortProvider {
    type Transport = Elm327;

    fn discover_ports(&self) -> Result<Vec<String>, ConnectionError> {
        let ports =
            serialport::available_ports().map_err(|e| ConnectionError::Discovery(e.to_string()))?;

        let mut ranked: Vec<(u8, String)> = ports
            .into_iter()
            .map(|info| {
                let usb_or_bt = matches!(
                    info.port_type,
                    SerialPortType::UsbPort(_) | SerialPortType::BluetoothPort
                );
                (port_rank(&info.port_name, usb_or_bt), info.port_name)
            })
            .collect();
        ranked.sort_by_key(|(rank, _)| *rank);

        Ok(ranked.into_iter().map(|(_, name)| name).collect())
    }

    fn open(&self, port: &str, timeout: Duration) -> Result<Elm327, ConnectionError> {
        Elm327::open(port, self.baud_rate, timeout)
    }
}

/// An initialised ELM327 adapter on one serial port
pub struct Elm327 {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl Elm327 {
    /// Open `port_name` and run the adapter initialisation
    ///
    /// # Arguments
    /// * `port_name` - OS port name (`/dev/ttyUSB0`, `COM3`, ...)
    /// * `baud_rate` - Serial speed
    /// * `timeout` - Limit for each command, including the reset
    pub fn open(port_name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, ConnectionError> {
        let open_err = |reason: String| ConnectionError::Open {
            port: port_name.to_string(),
            reason,
        };

        let port = serialport::new(port_name, baud_rate)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|e| open_err(e.to_string()))?;

        let mut adapter = Self {
            name: port_name.to_string(),
            port: Some(port),
            timeout,
        };

        for cmd in INIT_COMMANDS {
            let reply = adapter
                .command(cmd)
                .map_err(|e| open_err(format!("{} failed: {}", cmd, e)))?;
            log::debug!("{} {} -> {:?}", port_name, cmd, reply);
        }

        Ok(adapter)
    }

    /// Send one command and collect the reply up to the prompt
    fn command(&mut self, cmd: &str) -> Result<String, ReadError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ReadError::Disconnected("port closed".to_string()))?;

        // Drop stale bytes from an earlier timed-out command
        if let Err(e) = port.clear(ClearBuffer::Input) {
            log::debug!("{}: could not clear input buffer: {}", self.name, e);
        }

        log::trace!("{} <- {:?}", self.name, cmd);
        port.write_all(format!("{}\r", cmd).as_bytes())
            .and_then(|()| port.flush())
            .map_err(io_to_read_error)?;

        let deadline = Instant::now().checked_add(self.timeout);
        let mut reply = Vec::new();
        let mut buf = [0u8; 256];

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ReadError::Timeout);
            }
            match port.read(&mut buf) {
                Ok(0) => return Err(ReadError::Disconnected("port returned EOF".to_string())),
                Ok(n) => {
                    reply.extend_from_slice(&buf[..n]);
                    if let Some(end) = reply.iter().position(|&b| b == PROMPT) {
                        reply.truncate(end);
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_to_read_error(e)),
            }
        }

        let reply = String::from_utf8_lossy(&reply).into_owned();
        log::trace!("{} -> {:?}", self.name, reply);
        Ok(reply)
    }
}

impl Transport for Elm327 {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn read_parameter(&mut self, code: &str) -> Result<ParameterValue, ReadError> {
        let request = RequestCode::parse(code)?;
        let reply = self.command(code)?;
        parse_reply(request, &reply)
    }

    fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            let _ = port.flush();
        }
    }
}

fn io_to_read_error(e: io::Error) -> ReadError {
    match e.kind() {
        io::ErrorKind::TimedOut => ReadError::Timeout,
        _ => ReadError::Disconnected(e.to_string()),
    }
}

/// Mode and PID of a 4-digit request code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestCode {
    mode: u8,
    pid: u8,
}

impl RequestCode {
    fn parse(code: &str) -> Result<Self, ReadError> {
        let invalid = || ReadError::Malformed(format!("invalid request code {:?}", code));
        if code.len() != 4 || !code.is_ascii() {
            return Err(invalid());
        }
        let mode = u8::from_str_radix(&code[..2], 16).map_err(|_| invalid())?;
        let pid = u8::from_str_radix(&code[2..], 16).map_err(|_| invalid())?;
        Ok(Self { mode, pid })
    }
}

/// Extract the data bytes answering `request` from a raw adapter reply
fn parse_reply(request: RequestCode, reply: &str) -> Result<ParameterValue, ReadError> {
    let lines = reply
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("SEARCHING"));

    let mut first_bad = None;
    for line in lines {
        match line {
            "NO DATA" => return Err(ReadError::NoData),
            "?" => return Err(ReadError::Unsupported),
            _ => {}
        }

        let bytes = match decode_hex_line(line) {
            Some(bytes) => bytes,
            None => {
                // Echoed request or an adapter status message
                first_bad.get_or_insert_with(|| line.to_string());
                continue;
            }
        };
        if bytes.len() >= 2 && bytes[0] == request.mode.wrapping_add(0x40) && bytes[1] == request.pid {
            return Ok(ParameterValue(bytes[2..].to_vec()));
        }
    }

    Err(ReadError::Malformed(
        first_bad.unwrap_or_else(|| format!("no reply to {:02X}{:02X}", request.mode, request.pid)),
    ))
}

/// Hex digits with optional spaces, e.g. `41 0C 1A F8`
fn decode_hex_line(line: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = line.bytes().filter(|b| *b != b' ').collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}
