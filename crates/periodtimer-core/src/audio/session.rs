//! Device session lifecycle
//!
//! A [`Session`] owns one direction of one device and moves through
//! `Unopened -> Configured -> Running -> Stopped`, or into `Failed` on a
//! fatal device error. The device stream and its exclusive lease live in a
//! [`DeviceHandle`] guard, so they are released on every exit path: explicit
//! stop, failure, or the session simply going out of scope.

use super::device::{DeviceError, Direction, PcmBackend, PcmStream, PeriodError, XrunKind};
use super::lease::DeviceLease;
use crate::config::{ConfigError, StreamConfig};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Configured,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unopened => "unopened",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors from session operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Recovered xrun; the session is still running
    #[error("{kind} on {device}")]
    Xrun { device: String, kind: XrunKind },

    #[error("cannot {operation} a {state} session on {device}")]
    InvalidState {
        device: String,
        operation: &'static str,
        state: SessionState,
    },

    #[error("cannot {operation} on {device}: it is a {direction} session")]
    WrongDirection {
        device: String,
        operation: &'static str,
        direction: Direction,
    },

    #[error("period block holds {actual} samples, expected {expected}")]
    BlockSize { expected: usize, actual: usize },
}

impl SessionError {
    /// Whether the session survived this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SessionError::Xrun { .. })
    }
}

/// Scoped ownership of an open stream and its device lease
///
/// Dropping the handle stops the stream before the lease is released.
pub struct DeviceHandle {
    stream: Box<dyn PcmStream>,
    _lease: DeviceLease,
}

impl DeviceHandle {
    /// Lease the device, then open the stream
    pub fn acquire(
        backend: &dyn PcmBackend,
        device: &str,
        direction: Direction,
        config: &StreamConfig,
    ) -> Result<Self, DeviceError> {
        let lease = DeviceLease::acquire(backend.name(), device, direction)?;
        let stream = backend.open(device, direction, config)?;
        Ok(Self {
            stream,
            _lease: lease,
        })
    }

    pub fn stream(&mut self) -> &mut dyn PcmStream {
        self.stream.as_mut()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.stream.stop();
    }
}

/// One direction of one audio device
pub struct Session {
    device: String,
    direction: Direction,
    config: Option<StreamConfig>,
    state: SessionState,
    handle: Option<DeviceHandle>,
    xruns: u64,
}

impl Session {
    /// An unopened session
    pub fn new(device: impl Into<String>, direction: Direction) -> Self {
        Self {
            device: device.into(),
            direction,
            config: None,
            state: SessionState::Unopened,
            handle: None,
            xruns: 0,
        }
    }

    /// Create and configure a session in one step
    pub fn open(
        backend: &dyn PcmBackend,
        device: &str,
        direction: Direction,
        config: StreamConfig,
    ) -> Result<Self, SessionError> {
        let mut session = Self::new(device, direction);
        session.configure(backend, config)?;
        Ok(session)
    }

    /// Negotiate `config` with the device
    ///
    /// Invalid geometry is rejected before the device is touched. Device
    /// failures leave the session `Failed`.
    pub fn configure(
        &mut self,
        backend: &dyn PcmBackend,
        config: StreamConfig,
    ) -> Result<(), SessionError> {
        self.expect_state("configure", &[SessionState::Unopened])?;
        config.validate()?;

        match DeviceHandle::acquire(backend, &self.device, self.direction, &config) {
            Ok(handle) => {
                let negotiated = handle.stream.config();
                self.handle = Some(handle);
                self.config = Some(negotiated);
                self.state = SessionState::Configured;
                tracing::info!(
                    backend = backend.name(),
                    device = %self.device,
                    direction = %self.direction,
                    sample_rate = negotiated.sample_rate,
                    channels = negotiated.channels,
                    period_size = negotiated.period_size,
                    period_count = negotiated.period_count,
                    buffer_size = negotiated.buffer_size(),
                    "Session configured"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(device = %self.device, direction = %self.direction, "Open failed: {}", e);
                self.state = SessionState::Failed;
                Err(e.into())
            }
        }
    }

    /// Begin streaming
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.expect_state("start", &[SessionState::Configured])?;
        let result = match self.handle.as_mut() {
            Some(handle) => handle.stream().start(),
            None => Err(DeviceError::Disconnected(self.device.clone())),
        };
        match result {
            Ok(()) => {
                self.state = SessionState::Running;
                tracing::info!(device = %self.device, direction = %self.direction, "Session started");
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Block until one full period has been captured into `block`
    ///
    /// `block` must hold exactly `period_size * channels` samples.
    pub fn read_period(&mut self, block: &mut [i16]) -> Result<(), SessionError> {
        self.check_io("read", Direction::Capture, block.len())?;
        let result = match self.handle.as_mut() {
            Some(handle) => handle.stream().read_period(block),
            None => Err(PeriodError::Fatal(DeviceError::Disconnected(self.device.clone()))),
        };
        self.settle(result)
    }

    /// Block until the device has accepted one full period from `block`
    pub fn write_period(&mut self, block: &[i16]) -> Result<(), SessionError> {
        self.check_io("write", Direction::Playback, block.len())?;
        let result = match self.handle.as_mut() {
            Some(handle) => handle.stream().write_period(block),
            None => Err(PeriodError::Fatal(DeviceError::Disconnected(self.device.clone()))),
        };
        self.settle(result)
    }

    /// Stop streaming and release the device; idempotent
    pub fn stop(&mut self) {
        if matches!(
            self.state,
            SessionState::Configured | SessionState::Running
        ) {
            self.handle = None;
            self.state = SessionState::Stopped;
            tracing::info!(
                device = %self.device,
                direction = %self.direction,
                xruns = self.xruns,
                "Session stopped"
            );
        }
    }

    /// Stop and consume the session
    pub fn close(mut self) -> SessionState {
        self.stop();
        self.state
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Negotiated geometry, once configured
    pub fn config(&self) -> Option<StreamConfig> {
        self.config
    }

    /// Recovered xruns seen so far
    pub fn xruns(&self) -> u64 {
        self.xruns
    }

    /// Device clock at the last completed period, when the backend has one
    pub fn device_time(&self) -> Option<Duration> {
        self.handle.as_ref().and_then(|h| h.stream.device_time())
    }

    /// Whether the device lease is still held
    pub fn holds_device(&self) -> bool {
        self.handle.is_some()
    }

    /// A zeroed block sized for one period
    pub fn period_block(&self) -> Vec<i16> {
        vec![0; self.config.map(|c| c.period_samples()).unwrap_or(0)]
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(SessionError::InvalidState {
            device: self.device.clone(),
            operation,
            state: self.state,
        })
    }

    fn check_io(
        &self,
        operation: &'static str,
        direction: Direction,
        len: usize,
    ) -> Result<(), SessionError> {
        if self.direction != direction {
            return Err(SessionError::WrongDirection {
                device: self.device.clone(),
                operation,
                direction: self.direction,
            });
        }
        self.expect_state(operation, &[SessionState::Running])?;
        let expected = self.config.map(|c| c.period_samples()).unwrap_or(0);
        if len != expected {
            return Err(SessionError::BlockSize {
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    fn settle(&mut self, result: Result<(), PeriodError>) -> Result<(), SessionError> {
        match result {
            Ok(()) => Ok(()),
            Err(PeriodError::Xrun(kind)) => {
                self.xruns += 1;
                Err(SessionError::Xrun {
                    device: self.device.clone(),
                    kind,
                })
            }
            Err(PeriodError::Fatal(e)) => Err(self.fail(e)),
        }
    }

    /// Enter `Failed`, releasing the device
    fn fail(&mut self, error: DeviceError) -> SessionError {
        tracing::error!(
            device = %self.device,
            direction = %self.direction,
            "Session failed: {}",
            error
        );
        self.handle = None;
        self.state = SessionState::Failed;
        SessionError::Device(error)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.device)
            .field("direction", &self.direction)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("xruns", &self.xruns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{Fault, Pacing, SimulatedBackend};

    fn config() -> StreamConfig {
        StreamConfig::new(48000, 2, 64, 2).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let backend = SimulatedBackend::new(Pacing::FreeRunning);
        let mut session = Session::new("session-lifecycle", Direction::Capture);
        assert_eq!(session.state(), SessionState::Unopened);

        session.configure(&backend, config()).unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        assert!(session.holds_device());

        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Running);

        let mut block = session.period_block();
        assert_eq!(block.len(), 128);
        session.read_period(&mut block).unwrap();

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.holds_device());
        assert!(!DeviceLease::is_held(
            "simulated",
            "session-lifecycle",
            Direction::Capture
        ));
    }

    #[test]
    fn test_invalid_config_rejected_before_open() {
        let backend = SimulatedBackend::new(Pacing::FreeRunning);
        let bad = StreamConfig {
            period_size: 0,
            ..config()
        };
        let result = Session::open(&backend, "session-bad-config", Direction::Capture, bad);
        assert_eq!(
            result.unwrap_err(),
            SessionError::Config(ConfigError::ZeroPeriodSize)
        );
        assert!(!DeviceLease::is_held(
            "simulated",
            "session-bad-config",
            Direction::Capture
        ));
    }

    #[test]
    fn test_second_open_is_busy() {
        let backend = SimulatedBackend::new(Pacing::FreeRunning);
        let _first =
            Session::open(&backend, "session-busy", Direction::Playback, config()).unwrap();
        let second = Session::open(&backend, "session-busy", Direction::Playback, config());
        assert!(matches!(
            second,
            Err(SessionError::Device(DeviceError::Busy { .. }))
        ));
    }

    #[test]
    fn test_read_requires_running_capture() {
        let backend = SimulatedBackend::new(Pacing::FreeRunning);
        let mut session =
            Session::open(&backend, "session-not-running", Direction::Capture, config()).unwrap();
        let mut block = session.period_block();
        assert!(matches!(
            session.read_period(&mut block),
            Err(SessionError::InvalidState { .. })
        ));

        session.start().unwrap();
        assert!(matches!(
            session.write_period(&block),
            Err(SessionError::WrongDirection { .. })
        ));
        let mut short = vec![0i16; 10];
        assert_eq!(
            session.read_period(&mut short),
            Err(SessionError::BlockSize {
                expected: 128,
                actual: 10
            })
        );
    }

    #[test]
    fn test_recoverable_xrun_keeps_running() {
        let backend = SimulatedBackend::new(Pacing::FreeRunning)
            .with_fault(Fault::xrun(Direction::Playback, 0));
        let mut session =
            Session::open(&backend, "session-xrun", Direction::Playback, config()).unwrap();
        session.start().unwrap();
        let block = session.period_block();

        let err = session.write_period(&block).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(session.state(), SessionState::Running);
        assert!(session.write_period(&block).is_ok());
        assert_eq!(session.xruns(), 1);
    }

    #[test]
    fn test_fatal_error_fails_and_releases() {
        let backend = SimulatedBackend::new(Pacing::FreeRunning)
            .with_fault(Fault::unrecoverable(Direction::Capture, 1));
        let mut session =
            Session::open(&backend, "session-fatal", Direction::Capture, config()).unwrap();
        session.start().unwrap();
        let mut block = session.period_block();

        session.read_period(&mut block).unwrap();
        let err = session.read_period(&mut block).unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.holds_device());
        assert!(!DeviceLease::is_held(
            "simulated",
            "session-fatal",
            Direction::Capture
        ));

        // Failed is terminal
        session.stop();
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_drop_releases_device() {
        let backend = SimulatedBackend::new(Pacing::FreeRunning);
        {
            let mut session =
                Session::open(&backend, "session-drop", Direction::Capture, config()).unwrap();
            session.start().unwrap();
        }
        assert!(Session::open(&backend, "session-drop", Direction::Capture, config()).is_ok());
    }

    #[test]
    fn test_open_failure_marks_failed() {
        let backend = SimulatedBackend::new(Pacing::FreeRunning).with_devices(["hw:0"]);
        let mut session = Session::new("session-absent", Direction::Capture);
        let err = session.configure(&backend, config()).unwrap_err();
        assert!(matches!(err, SessionError::Device(DeviceError::NotFound(_))));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!DeviceLease::is_held(
            "simulated",
            "session-absent",
            Direction::Capture
        ));
    }
}
