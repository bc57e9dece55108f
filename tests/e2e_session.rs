//! E2E tests for device session lifecycle and exclusive device leases

use periodtimer::audio::simulated::Fault;
use periodtimer::audio::{
    DeviceError, Direction, Pacing, PcmBackend, SessionState, SimulatedBackend, XrunKind,
};
use periodtimer::{ConfigError, Session, SessionError, StreamConfig};
use std::thread;

fn config() -> StreamConfig {
    StreamConfig::new(48000, 2, 256, 4).unwrap()
}

/// Test the full Configured -> Running -> Stopped path
#[test]
fn test_session_lifecycle() {
    let backend = SimulatedBackend::new(Pacing::FreeRunning);
    let mut session =
        Session::open(&backend, "e2e-session-life", Direction::Capture, config()).unwrap();
    assert_eq!(session.state(), SessionState::Configured);
    assert_eq!(session.config().map(|c| c.buffer_size()), Some(1024));

    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Running);

    let mut block = session.period_block();
    assert_eq!(block.len(), 512);
    for _ in 0..10 {
        session.read_period(&mut block).unwrap();
    }

    session.stop();
    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!session.holds_device());
    assert_eq!(session.close(), SessionState::Stopped);
}

/// Test that a second live session on the same device and direction is refused
#[test]
fn test_device_lease_is_exclusive_across_threads() {
    let backend = SimulatedBackend::new(Pacing::FreeRunning);
    let held =
        Session::open(&backend, "e2e-session-shared", Direction::Playback, config()).unwrap();

    let contender = thread::spawn({
        let backend = backend.clone();
        move || Session::open(&backend, "e2e-session-shared", Direction::Playback, config())
    })
    .join()
    .unwrap();
    assert!(matches!(
        contender,
        Err(SessionError::Device(DeviceError::Busy { .. }))
    ));

    // The other direction of the same device is a separate stream
    let capture =
        Session::open(&backend, "e2e-session-shared", Direction::Capture, config()).unwrap();

    drop(held);
    assert!(Session::open(&backend, "e2e-session-shared", Direction::Playback, config()).is_ok());
    drop(capture);
}

/// Test that invalid geometry is rejected before the device is looked at
#[test]
fn test_invalid_config_rejected_before_device() {
    let backend = SimulatedBackend::new(Pacing::FreeRunning).with_devices(["hw:0"]);
    let bad = StreamConfig {
        sample_rate: 48000,
        channels: 2,
        period_size: 256,
        period_count: 1,
    };
    let result = Session::open(&backend, "no-such-device", Direction::Capture, bad);
    assert_eq!(
        result.unwrap_err(),
        SessionError::Config(ConfigError::TooFewPeriods(1))
    );
}

/// Test that unsupported geometry and absent devices are device errors
#[test]
fn test_device_errors_on_open() {
    let backend = SimulatedBackend::new(Pacing::FreeRunning)
        .with_devices(["e2e-session-known"])
        .with_buffer_range(64, 512);

    let absent = Session::open(&backend, "e2e-session-unknown", Direction::Capture, config());
    assert!(matches!(
        absent,
        Err(SessionError::Device(DeviceError::NotFound(_)))
    ));

    let too_big = Session::open(&backend, "e2e-session-known", Direction::Capture, config());
    assert!(matches!(
        too_big,
        Err(SessionError::Device(DeviceError::UnsupportedGeometry { .. }))
    ));
}

/// Test that partial-period I/O is rejected
#[test]
fn test_partial_period_rejected() {
    let backend = SimulatedBackend::new(Pacing::FreeRunning);
    let mut session =
        Session::open(&backend, "e2e-session-partial", Direction::Playback, config()).unwrap();
    session.start().unwrap();

    let short = vec![0i16; 100];
    assert_eq!(
        session.write_period(&short),
        Err(SessionError::BlockSize {
            expected: 512,
            actual: 100
        })
    );
    assert_eq!(session.state(), SessionState::Running);
}

/// Test recoverable and unrecoverable xruns
#[test]
fn test_xrun_recovery_and_failure() {
    let backend = SimulatedBackend::new(Pacing::FreeRunning)
        .with_fault(Fault::xrun(Direction::Capture, 1))
        .with_fault(Fault::unrecoverable(Direction::Capture, 3));
    let mut session =
        Session::open(&backend, "e2e-session-xruns", Direction::Capture, config()).unwrap();
    session.start().unwrap();
    let mut block = session.period_block();

    session.read_period(&mut block).unwrap();
    let xrun = session.read_period(&mut block).unwrap_err();
    assert!(xrun.is_recoverable());
    assert!(matches!(
        xrun,
        SessionError::Xrun {
            kind: XrunKind::Overrun,
            ..
        }
    ));
    assert_eq!(session.state(), SessionState::Running);
    session.read_period(&mut block).unwrap();

    let fatal = session.read_period(&mut block).unwrap_err();
    assert!(!fatal.is_recoverable());
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!session.holds_device());
    assert_eq!(session.xruns(), 1);

    // The device is free again for a new session
    assert!(Session::open(&backend, "e2e-session-xruns", Direction::Capture, config()).is_ok());
}

/// Test that the simulated backend lists its configured devices
#[test]
fn test_list_devices() {
    let backend = SimulatedBackend::new(Pacing::FreeRunning).with_devices(["a", "b"]);
    let devices = backend.list_devices().unwrap();
    let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["a", "b"]);
}
