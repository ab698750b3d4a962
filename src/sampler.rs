//! The sampling loop
//!
//! A [`Sampler`] owns the live connection and the sink for the length of a
//! run. Every tick it reads each configured parameter once, in order, stamps
//! the result and appends it to the sink, then sleeps for whatever is left of
//! the interval.
//!
//! ```text
//! Idle --start()--> Running --stop / connection lost / fatal sink error--> Stopped
//! ```
//!
//! Timing rules:
//! - each tick is timed from its own start, so a slow tick never shifts the
//!   ticks after it
//! - a tick that overruns the interval is followed immediately by the next
//! - the sleep between ticks is cut short by [`StopHandle::stop`]
//!
//! The sample timestamp is taken once all reads of the tick have completed.

use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::catalog::{names_of, ParameterDescriptor};
use crate::connection::{ActiveConnection, Transport};
use crate::error::{ConfigError, ConnectionError, Error, ReadError, Result};
use crate::sink::{Reading, Sink};
use crate::timing::{StopHandle, TickTimer, Wait};

/// Run configuration, fixed for the lifetime of a run
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    interval: Duration,
    parameters: Vec<ParameterDescriptor>,
    run_for: Option<Duration>,
}

impl SamplingConfig {
    /// # Arguments
    /// * `interval_secs` - Tick period in seconds, must be positive and finite
    /// * `parameters` - Parameters to read each tick, in column order
    pub fn new(
        interval_secs: f64,
        parameters: Vec<ParameterDescriptor>,
    ) -> std::result::Result<Self, ConfigError> {
        if !interval_secs.is_finite() || interval_secs <= 0.0 {
            return Err(ConfigError::InvalidInterval(interval_secs));
        }
        let interval = Duration::try_from_secs_f64(interval_secs)
            .map_err(|_| ConfigError::InvalidInterval(interval_secs))?;
        Ok(Self {
            interval,
            parameters,
            run_for: None,
        })
    }

    /// Stop on its own after `duration`
    pub fn with_run_for(mut self, duration: Option<Duration>) -> Self {
        self.run_for = duration;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn parameters(&self) -> &[ParameterDescriptor] {
        &self.parameters
    }

    pub fn run_for(&self) -> Option<Duration> {
        self.run_for
    }
}

/// One tick's worth of readings
///
/// `values` has exactly one entry per configured parameter, in order.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: DateTime<Local>,
    pub values: Vec<(ParameterDescriptor, Reading)>,
}

impl Sample {
    pub fn readings(&self) -> Vec<Reading> {
        self.values.iter().map(|(_, r)| r.clone()).collect()
    }
}

/// Sampler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopped,
}

/// What a single tick did
#[derive(Debug)]
pub enum TickOutcome {
    /// A sample was produced and handed to the sink
    Recorded(Sample),
    /// A stop arrived during the read phase; nothing was recorded
    Abandoned,
    /// The connection dropped; the sample was still recorded
    ConnectionLost(Sample),
}

/// Counters for a finished run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Ticks that assembled a sample; a tick abandoned by a stop is not counted
    pub ticks: u64,
    pub samples_written: u64,
    pub read_failures: u64,
    pub sink_failures: u64,
    /// Ticks whose read phase took at least the whole interval
    pub overruns: u64,
}

/// Drives periodic reads across all configured parameters
pub struct Sampler<T: Transport, S: Sink> {
    config: SamplingConfig,
    connection: ActiveConnection<T>,
    sink: S,
    state: SamplerState,
    stop: StopHandle,
    summary: RunSummary,
}

impl<T: Transport, S: Sink> Sampler<T, S> {
    pub fn new(config: SamplingConfig, connection: ActiveConnection<T>, sink: S) -> Self {
        Self {
            config,
            connection,
            sink,
            state: SamplerState::Idle,
            stop: StopHandle::new(),
            summary: RunSummary::default(),
        }
    }

    /// Use an externally created stop signal, e.g. one shared with a Ctrl+C handler
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Handle for stopping the sampler from another thread
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn connection(&self) -> &ActiveConnection<T> {
        &self.connection
    }

    /// Hand back the connection and sink, e.g. to reconnect after a loss
    pub fn into_parts(self) -> (ActiveConnection<T>, S) {
        (self.connection, self.sink)
    }

    /// Move from `Idle` to `Running` and write the log header
    ///
    /// A sampler is single-use. Once `Stopped` (by request, a lost connection
    /// or a fatal sink error) this does nothing, and [`Sampler::run`] returns
    /// the previous summary without reading. Use [`Sampler::into_parts`] and a
    /// new sampler to record again.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SamplerState::Idle {
            return Ok(());
        }
        if !self.connection.is_connected() {
            self.state = SamplerState::Stopped;
            return Err(ConnectionError::Lost {
                port: self.connection.port_name().to_string(),
                reason: ReadError::Disconnected("not connected at start".to_string()),
            }
            .into());
        }

        if let Err(e) = self.sink.write_header(&names_of(&self.config.parameters)) {
            self.state = SamplerState::Stopped;
            return Err(e.into());
        }

        self.state = SamplerState::Running;
        log::info!(
            "Sampling {} parameters every {:?} on {}",
            self.config.parameters.len(),
            self.config.interval,
            self.connection.port_name()
        );
        Ok(())
    }

    /// Request a stop; the sink is closed when the run loop exits
    pub fn stop(&mut self) {
        self.stop.stop();
        if self.state == SamplerState::Idle {
            self.state = SamplerState::Stopped;
        }
    }

    /// Read every parameter once and hand the sample to the sink
    ///
    /// Does not sleep. Read failures stay in their own column. Transient sink
    /// failures are logged and counted; fatal ones stop the sampler and are
    /// returned.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        if self.state != SamplerState::Running {
            return Ok(TickOutcome::Abandoned);
        }
        let mut values = Vec::with_capacity(self.config.parameters.len());
        let mut lost: Option<ReadError> = None;

        for descriptor in &self.config.parameters {
            if self.stop.is_stopped() {
                log::debug!("Stop requested mid-tick, discarding partial sample");
                return Ok(TickOutcome::Abandoned);
            }

            let reading = match &lost {
                // No more reads once the link is gone; keep the column
                Some(reason) => Err(reason.clone()),
                None => self.connection.read_parameter(&descriptor.code),
            };

            if let Err(e) = &reading {
                self.summary.read_failures += 1;
                log::trace!("{} ({}) failed: {}", descriptor.name, descriptor.code, e);
                if e.is_disconnect() && lost.is_none() {
                    lost = Some(e.clone());
                }
            }
            values.push((descriptor.clone(), reading));
        }

        self.summary.ticks += 1;
        let sample = Sample {
            timestamp: Local::now(),
            values,
        };

        match self.sink.append_record(sample.timestamp, &sample.readings()) {
            Ok(()) => self.summary.samples_written += 1,
            Err(e) if e.is_fatal() => {
                log::error!("Output failed, stopping: {}", e);
                self.state = SamplerState::Stopped;
                return Err(e.into());
            }
            Err(e) => {
                self.summary.sink_failures += 1;
                log::warn!("Dropped sample: {}", e);
            }
        }

        Ok(match lost {
            Some(_) => {
                self.state = SamplerState::Stopped;
                TickOutcome::ConnectionLost(sample)
            }
            None => TickOutcome::Recorded(sample),
        })
    }

    /// Start (if idle) and sample until stopped
    ///
    /// Returns the run summary on a requested stop or when the configured run
    /// duration ends. A lost connection returns [`ConnectionError::Lost`]; a
    /// fatal sink error returns that error. The sampler is `Stopped` and the
    /// sink closed in every case.
    pub fn run(&mut self) -> Result<RunSummary> {
        let result = self.run_inner();
        self.state = SamplerState::Stopped;
        if let Err(e) = self.sink.close() {
            log::warn!("Failed to close output: {}", e);
        }
        log::info!("Sampling stopped: {:?}", self.summary);
        result.map(|()| self.summary.clone())
    }

    fn run_inner(&mut self) -> Result<()> {
        self.start()?;
        // A deadline past the end of the clock is no deadline
        let deadline = self
            .config
            .run_for
            .and_then(|d| Instant::now().checked_add(d));
        let interval = self.config.interval;

        while !self.stop.is_stopped() {
            let timer = TickTimer::start();

            match self.tick()? {
                TickOutcome::Recorded(_) => {}
                TickOutcome::Abandoned => break,
                TickOutcome::ConnectionLost(sample) => {
                    let reason = sample
                        .values
                        .iter()
                        .find_map(|(_, r)| r.as_ref().err().filter(|e| e.is_disconnect()).cloned())
                        .unwrap_or_else(|| ReadError::Disconnected("connection lost".to_string()));
                    return Err(Error::Connection(ConnectionError::Lost {
                        port: self.connection.port_name().to_string(),
                        reason,
                    }));
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                log::info!("Run duration reached");
                break;
            }

            let remaining = timer.remaining(interval);
            if remaining.is_zero() {
                self.summary.overruns += 1;
                log::warn!(
                    "Tick took {:?}, longer than the {:?} interval",
                    timer.elapsed(),
                    interval
                );
                continue;
            }
            if self.stop.wait(remaining) == Wait::Stopped {
                break;
            }
        }

        Ok(())
    }
}
