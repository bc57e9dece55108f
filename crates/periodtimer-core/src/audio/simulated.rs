//! Deterministic stand-in audio subsystem
//!
//! Streams complete one period per call, either paced against a monotonic
//! deadline (`start + (n + 1) * period`) like real hardware or free-running
//! for fast tests. Faults can be injected at chosen period indices.
//!
//! The simulated device clock counts completed frames, so its device time
//! is exact. A clock skew makes real-time pacing run slow or fast against
//! the system clock, which shows up as drift.

use super::device::{
    DeviceError, DeviceInfo, Direction, PcmBackend, PcmStream, PeriodError, XrunKind,
};
use super::signal::{SampleSource, ToneGenerator};
use crate::config::{frames_to_duration, StreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How simulated streams spend time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Block until each period's nominal completion deadline
    RealTime,
    /// Complete every period immediately
    FreeRunning,
}

/// What simulated capture streams deliver
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureContent {
    Silence,
    Tone { frequency: f64, amplitude: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Xrun the stream recovers from
    Xrun,
    /// Xrun that leaves the stream unusable
    UnrecoverableXrun,
    /// Device vanishes
    Disconnect,
    /// The period completes, but only after blocking this much longer
    Stall(Duration),
}

/// A fault injected at one period of one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub direction: Direction,
    pub period: u64,
    pub kind: FaultKind,
}

impl Fault {
    pub fn xrun(direction: Direction, period: u64) -> Self {
        Self {
            direction,
            period,
            kind: FaultKind::Xrun,
        }
    }

    pub fn unrecoverable(direction: Direction, period: u64) -> Self {
        Self {
            direction,
            period,
            kind: FaultKind::UnrecoverableXrun,
        }
    }

    pub fn disconnect(direction: Direction, period: u64) -> Self {
        Self {
            direction,
            period,
            kind: FaultKind::Disconnect,
        }
    }

    pub fn stall(direction: Direction, period: u64, extra: Duration) -> Self {
        Self {
            direction,
            period,
            kind: FaultKind::Stall(extra),
        }
    }
}

/// Simulated audio subsystem
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    pacing: Pacing,
    content: CaptureContent,
    faults: Vec<Fault>,
    /// Accepted buffer sizes in frames
    buffer_range: (u64, u64),
    /// When set, only these device names exist
    devices: Option<Vec<String>>,
    /// Device clock error in parts per million (positive = slow device)
    clock_skew_ppm: f64,
    frames_written: Arc<AtomicU64>,
    frames_read: Arc<AtomicU64>,
}

impl SimulatedBackend {
    pub fn new(pacing: Pacing) -> Self {
        Self {
            pacing,
            content: CaptureContent::Silence,
            faults: Vec::new(),
            buffer_range: (16, 1 << 20),
            devices: None,
            clock_skew_ppm: 0.0,
            frames_written: Arc::new(AtomicU64::new(0)),
            frames_read: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_content(mut self, content: CaptureContent) -> Self {
        self.content = content;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn with_buffer_range(mut self, min_frames: u64, max_frames: u64) -> Self {
        self.buffer_range = (min_frames, max_frames);
        self
    }

    pub fn with_devices<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Pace real-time streams as if the device clock ran `ppm` slow
    pub fn with_clock_skew_ppm(mut self, ppm: f64) -> Self {
        self.clock_skew_ppm = ppm;
        self
    }

    /// Frames accepted by all playback streams so far
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    /// Frames delivered by all capture streams so far
    pub fn frames_read(&self) -> u64 {
        self.frames_read.load(Ordering::Relaxed)
    }
}

impl PcmBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn open(
        &self,
        device: &str,
        direction: Direction,
        config: &StreamConfig,
    ) -> Result<Box<dyn PcmStream>, DeviceError> {
        if let Some(devices) = &self.devices {
            if !devices.iter().any(|d| d == device) {
                return Err(DeviceError::NotFound(device.to_string()));
            }
        }

        let (min, max) = self.buffer_range;
        if !(min..=max).contains(&config.buffer_size()) {
            return Err(DeviceError::UnsupportedGeometry {
                device: device.to_string(),
                reason: format!(
                    "buffer of {} frames outside {}..={}",
                    config.buffer_size(),
                    min,
                    max
                ),
            });
        }

        let tone = match self.content {
            CaptureContent::Tone {
                frequency,
                amplitude,
            } if direction == Direction::Capture => {
                Some(ToneGenerator::new(frequency, amplitude, config.sample_rate))
            }
            _ => None,
        };

        let counter = match direction {
            Direction::Capture => Arc::clone(&self.frames_read),
            Direction::Playback => Arc::clone(&self.frames_written),
        };

        Ok(Box::new(SimulatedStream {
            device: device.to_string(),
            direction,
            config: *config,
            pacing: self.pacing,
            clock_scale: 1.0 + self.clock_skew_ppm * 1e-6,
            tone,
            faults: self
                .faults
                .iter()
                .filter(|f| f.direction == direction)
                .copied()
                .collect(),
            started: None,
            period_index: 0,
            broken: None,
            frames: counter,
        }))
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let names = self
            .devices
            .clone()
            .unwrap_or_else(|| vec!["default".to_string()]);
        let buffer_frames = Some((
            self.buffer_range.0.min(u32::MAX as u64) as u32,
            self.buffer_range.1.min(u32::MAX as u64) as u32,
        ));
        Ok(names
            .into_iter()
            .enumerate()
            .map(|(i, name)| DeviceInfo {
                name,
                is_default: i == 0,
                input_channels: 2,
                output_channels: 2,
                sample_rates: vec![44100, 48000, 96000],
                buffer_frames,
            })
            .collect())
    }
}

struct SimulatedStream {
    device: String,
    direction: Direction,
    config: StreamConfig,
    pacing: Pacing,
    clock_scale: f64,
    tone: Option<ToneGenerator>,
    faults: Vec<Fault>,
    started: Option<Instant>,
    period_index: u64,
    broken: Option<DeviceError>,
    frames: Arc<AtomicU64>,
}

impl SimulatedStream {
    /// Wait for the next period deadline and apply any fault scheduled for it
    fn advance(&mut self) -> Result<(), PeriodError> {
        if let Some(err) = &self.broken {
            return Err(PeriodError::Fatal(err.clone()));
        }
        let Some(started) = self.started else {
            return Err(PeriodError::Fatal(DeviceError::Stream {
                device: self.device.clone(),
                reason: "stream not started".into(),
            }));
        };

        let index = self.period_index;
        self.period_index += 1;

        if self.pacing == Pacing::RealTime {
            let frames = (index + 1) * self.config.period_size as u64;
            let nominal = frames_to_duration(frames, self.config.sample_rate);
            let deadline = started + nominal.mul_f64(self.clock_scale);
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
        }

        let Some(fault) = self.faults.iter().find(|f| f.period == index) else {
            return Ok(());
        };
        let kind = XrunKind::for_direction(self.direction);
        match fault.kind {
            FaultKind::Stall(extra) => {
                std::thread::sleep(extra);
                Ok(())
            }
            FaultKind::Xrun => Err(PeriodError::Xrun(kind)),
            FaultKind::UnrecoverableXrun => {
                let err = DeviceError::Unrecoverable {
                    device: self.device.clone(),
                    kind,
                };
                self.broken = Some(err.clone());
                Err(PeriodError::Fatal(err))
            }
            FaultKind::Disconnect => {
                let err = DeviceError::Disconnected(self.device.clone());
                self.broken = Some(err.clone());
                Err(PeriodError::Fatal(err))
            }
        }
    }
}

impl PcmStream for SimulatedStream {
    fn config(&self) -> StreamConfig {
        self.config
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.started = Some(Instant::now());
        Ok(())
    }

    fn read_period(&mut self, block: &mut [i16]) -> Result<(), PeriodError> {
        self.advance()?;
        match self.tone.as_mut() {
            Some(tone) => tone.fill(block, self.config.channels as usize),
            None => block.fill(0),
        }
        self.frames
            .fetch_add(self.config.period_size as u64, Ordering::Relaxed);
        Ok(())
    }

    fn write_period(&mut self, _block: &[i16]) -> Result<(), PeriodError> {
        self.advance()?;
        self.frames
            .fetch_add(self.config.period_size as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stop(&mut self) {
        self.started = None;
    }

    fn device_time(&self) -> Option<Duration> {
        self.started?;
        let frames = self.period_index * self.config.period_size as u64;
        Some(frames_to_duration(frames, self.config.sample_rate))
    }
}
