//! Backend-neutral PCM device interface
//!
//! A [`PcmBackend`] opens [`PcmStream`]s. A stream moves exactly one period
//! of interleaved `i16` frames per call and blocks until the device has
//! delivered or accepted it. Xruns the backend has already recovered from
//! are reported as [`PeriodError::Xrun`]; anything else is fatal.

use crate::config::StreamConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Capture,
    Playback,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Capture => write!(f, "capture"),
            Direction::Playback => write!(f, "playback"),
        }
    }
}

/// Buffer starvation (playback) or overflow (capture)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XrunKind {
    Underrun,
    Overrun,
}

impl XrunKind {
    /// The xrun a direction can suffer
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Capture => XrunKind::Overrun,
            Direction::Playback => XrunKind::Underrun,
        }
    }
}

impl fmt::Display for XrunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XrunKind::Underrun => write!(f, "underrun"),
            XrunKind::Overrun => write!(f, "overrun"),
        }
    }
}

/// Errors that can occur opening or driving a device
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Audio host not available: {0}")]
    HostUnavailable(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device busy: {device} ({direction}) is already open")]
    Busy { device: String, direction: Direction },

    #[error("Unsupported stream geometry on {device}: {reason}")]
    UnsupportedGeometry { device: String, reason: String },

    #[error("Failed to open {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("Stream error on {device}: {reason}")]
    Stream { device: String, reason: String },

    #[error("Unrecoverable {kind} on {device}")]
    Unrecoverable { device: String, kind: XrunKind },

    #[error("Timed out after {timeout_ms} ms waiting for a period on {device}")]
    Timeout { device: String, timeout_ms: u64 },

    #[error("Device {0} disconnected")]
    Disconnected(String),
}

/// Outcome of a failed period transfer
#[derive(Debug, Clone, PartialEq)]
pub enum PeriodError {
    /// The backend already recovered; the stream keeps running
    Xrun(XrunKind),
    /// The stream is unusable
    Fatal(DeviceError),
}

impl From<DeviceError> for PeriodError {
    fn from(e: DeviceError) -> Self {
        PeriodError::Fatal(e)
    }
}

/// Device description for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identifier accepted by [`PcmBackend::open`]
    pub name: String,
    /// Whether this is the host's default device for some direction
    pub is_default: bool,
    /// Maximum capture channels (0 = no capture)
    pub input_channels: u16,
    /// Maximum playback channels (0 = no playback)
    pub output_channels: u16,
    /// Common sample rates the device accepts
    pub sample_rates: Vec<u32>,
    /// Supported buffer range in frames, when the host reports one
    pub buffer_frames: Option<(u32, u32)>,
}

/// An open PCM stream, one direction
pub trait PcmStream: Send {
    /// Geometry actually negotiated with the device
    fn config(&self) -> StreamConfig;

    /// Begin streaming (playback streams pre-prime their buffer first)
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Block until one full period has been captured into `block`
    fn read_period(&mut self, block: &mut [i16]) -> Result<(), PeriodError>;

    /// Block until the device has accepted one full period from `block`
    fn write_period(&mut self, block: &[i16]) -> Result<(), PeriodError>;

    /// Stop streaming and release device resources; idempotent
    fn stop(&mut self);

    /// Device clock at the last completed period, measured from stream start
    ///
    /// `None` when the backend has no device-side timestamps.
    fn device_time(&self) -> Option<Duration> {
        None
    }
}

/// A single audio subsystem able to open streams
pub trait PcmBackend: Send + Sync {
    /// Short name used in logs and device leases
    fn name(&self) -> &'static str;

    /// Negotiate `config` on `device` and return a stopped stream
    fn open(
        &self,
        device: &str,
        direction: Direction,
        config: &StreamConfig,
    ) -> Result<Box<dyn PcmStream>, DeviceError>;

    /// Enumerate available devices
    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xrun_kind_for_direction() {
        assert_eq!(XrunKind::for_direction(Direction::Capture), XrunKind::Overrun);
        assert_eq!(
            XrunKind::for_direction(Direction::Playback),
            XrunKind::Underrun
        );
    }

    #[test]
    fn test_display_names() {
        assert_eq!(Direction::Capture.to_string(), "capture");
        assert_eq!(XrunKind::Underrun.to_string(), "underrun");
        let err = DeviceError::Busy {
            device: "hw:0".into(),
            direction: Direction::Playback,
        };
        assert_eq!(err.to_string(), "Device busy: hw:0 (playback) is already open");
    }
}
