//! Stream geometry and run configuration
//!
//! [`StreamConfig`] is the validated geometry of one PCM stream. [`RunConfig`]
//! is the flat, serde-backed configuration surface shared by the CLI and
//! JSON config files; it resolves into validated stream configs before any
//! device is opened.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors for invalid parameter combinations, raised before any device opens
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("sample rate must be positive")]
    ZeroSampleRate,

    #[error("channel count must be positive")]
    ZeroChannels,

    #[error("period size must be positive")]
    ZeroPeriodSize,

    #[error("period count must be at least 2, got {0}")]
    TooFewPeriods(u32),

    #[error("duration must be a positive number of seconds, got {0}")]
    InvalidDuration(f64),

    #[error("capture and playback must share a sample rate: capture {capture} Hz, playback {playback} Hz")]
    SampleRateMismatch { capture: u32, playback: u32 },

    #[error("capture and playback must share a channel count: capture {capture}, playback {playback}")]
    ChannelMismatch { capture: u16, playback: u16 },

    #[error("invalid playback source: {0}")]
    Source(String),

    #[error("invalid analysis setting: {0}")]
    Analysis(String),

    #[error("failed to read config {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Geometry of one PCM stream
///
/// `buffer_size()` is always exactly `period_size * period_count` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Interleaved channels per frame
    pub channels: u16,
    /// Frames per period (the unit of I/O)
    pub period_size: u32,
    /// Periods per buffer
    pub period_count: u32,
}

impl StreamConfig {
    /// Build and validate a stream config
    pub fn new(
        sample_rate: u32,
        channels: u16,
        period_size: u32,
        period_count: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            sample_rate,
            channels,
            period_size,
            period_count,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants of the geometry
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        if self.period_size == 0 {
            return Err(ConfigError::ZeroPeriodSize);
        }
        if self.period_count < 2 {
            return Err(ConfigError::TooFewPeriods(self.period_count));
        }
        Ok(())
    }

    /// Total in-flight capacity in frames
    pub fn buffer_size(&self) -> u64 {
        self.period_size as u64 * self.period_count as u64
    }

    /// Interleaved samples in one period
    pub fn period_samples(&self) -> usize {
        self.period_size as usize * self.channels as usize
    }

    /// Interleaved samples in the whole buffer
    pub fn buffer_samples(&self) -> usize {
        self.buffer_size() as usize * self.channels as usize
    }

    /// Nominal duration of one period
    pub fn period_duration(&self) -> Duration {
        frames_to_duration(self.period_size as u64, self.sample_rate)
    }

    /// Nominal duration of the whole buffer
    pub fn buffer_duration(&self) -> Duration {
        frames_to_duration(self.buffer_size(), self.sample_rate)
    }

    /// Number of whole periods that fit in `duration` (rounded down)
    ///
    /// Computed in integer nanoseconds so long runs do not accumulate
    /// floating-point error.
    pub fn periods_in(&self, duration: Duration) -> u64 {
        let frames = duration.as_nanos() * self.sample_rate as u128 / 1_000_000_000;
        u64::try_from(frames / self.period_size as u128).unwrap_or(u64::MAX)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::DEFAULT_SAMPLE_RATE,
            channels: crate::DEFAULT_CHANNELS,
            period_size: crate::DEFAULT_PERIOD_SIZE,
            period_count: crate::DEFAULT_PERIOD_COUNT,
        }
    }
}

/// Convert a frame count to a duration, rounding to the nearest nanosecond
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    let rate = sample_rate.max(1) as u128;
    let nanos = (frames as u128 * 1_000_000_000 + rate / 2) / rate;
    Duration::from_nanos(nanos as u64)
}

/// Paired geometry for a duplex run
///
/// Both sides share sample rate and channel count; period geometry may differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplexConfig {
    pub capture: StreamConfig,
    pub playback: StreamConfig,
}

impl DuplexConfig {
    pub fn new(capture: StreamConfig, playback: StreamConfig) -> Result<Self, ConfigError> {
        capture.validate()?;
        playback.validate()?;
        if capture.sample_rate != playback.sample_rate {
            return Err(ConfigError::SampleRateMismatch {
                capture: capture.sample_rate,
                playback: playback.sample_rate,
            });
        }
        if capture.channels != playback.channels {
            return Err(ConfigError::ChannelMismatch {
                capture: capture.channels,
                playback: playback.channels,
            });
        }
        Ok(Self { capture, playback })
    }
}

/// What a timing run drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Capture,
    Playback,
    #[serde(alias = "capture_playback")]
    Duplex,
}

/// Playback content selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    #[default]
    Silence,
    Tone {
        #[serde(default = "default_tone_frequency")]
        frequency: f64,
        #[serde(default = "default_amplitude")]
        amplitude: f64,
    },
    Mls {
        #[serde(default = "default_mls_order")]
        order: u32,
        #[serde(default = "default_amplitude")]
        amplitude: f64,
    },
}

impl SourceConfig {
    /// Sine tone; unset fields take the defaults (1 kHz at half scale)
    pub fn tone(frequency: Option<f64>, amplitude: Option<f64>) -> Self {
        SourceConfig::Tone {
            frequency: frequency.unwrap_or_else(default_tone_frequency),
            amplitude: amplitude.unwrap_or_else(default_amplitude),
        }
    }

    /// Maximum-length sequence at the default order
    pub fn mls(amplitude: Option<f64>) -> Self {
        SourceConfig::Mls {
            order: default_mls_order(),
            amplitude: amplitude.unwrap_or_else(default_amplitude),
        }
    }
}

fn default_tone_frequency() -> f64 {
    1000.0
}

fn default_amplitude() -> f64 {
    0.5
}

fn default_mls_order() -> u32 {
    crate::MLS_ORDER
}

fn default_device() -> String {
    "default".to_string()
}

fn default_channels() -> u16 {
    crate::DEFAULT_CHANNELS
}

fn default_sample_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

fn default_period_size() -> u32 {
    crate::DEFAULT_PERIOD_SIZE
}

fn default_period_count() -> u32 {
    crate::DEFAULT_PERIOD_COUNT
}

fn default_duration() -> f64 {
    5.0
}

/// Flat run configuration, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_device")]
    pub capture_device: String,
    #[serde(default = "default_device")]
    pub playback_device: String,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_period_size")]
    pub capture_period_size: u32,
    #[serde(default = "default_period_count")]
    pub capture_periods: u32,
    #[serde(default = "default_period_size")]
    pub playback_period_size: u32,
    #[serde(default = "default_period_count")]
    pub playback_periods: u32,
    /// Run duration in seconds
    #[serde(default = "default_duration")]
    pub duration: f64,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub source: SourceConfig,
    /// SCHED_FIFO priority for I/O threads (None = leave scheduling alone)
    #[serde(default)]
    pub realtime_priority: Option<i32>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            capture_device: default_device(),
            playback_device: default_device(),
            channels: default_channels(),
            sample_rate: default_sample_rate(),
            capture_period_size: default_period_size(),
            capture_periods: default_period_count(),
            playback_period_size: default_period_size(),
            playback_periods: default_period_count(),
            duration: default_duration(),
            mode: Mode::default(),
            source: SourceConfig::default(),
            realtime_priority: None,
        }
    }
}

impl RunConfig {
    /// Load a config file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(path = %path.display(), "Loaded run config");
        Ok(config)
    }

    pub fn capture_stream(&self) -> Result<StreamConfig, ConfigError> {
        StreamConfig::new(
            self.sample_rate,
            self.channels,
            self.capture_period_size,
            self.capture_periods,
        )
    }

    pub fn playback_stream(&self) -> Result<StreamConfig, ConfigError> {
        StreamConfig::new(
            self.sample_rate,
            self.channels,
            self.playback_period_size,
            self.playback_periods,
        )
    }

    pub fn duplex(&self) -> Result<DuplexConfig, ConfigError> {
        DuplexConfig::new(self.capture_stream()?, self.playback_stream()?)
    }

    /// Run duration; rejects non-positive values and anything `Duration`
    /// cannot hold
    pub fn run_duration(&self) -> Result<Duration, ConfigError> {
        if self.duration <= 0.0 {
            return Err(ConfigError::InvalidDuration(self.duration));
        }
        Duration::try_from_secs_f64(self.duration)
            .map_err(|_| ConfigError::InvalidDuration(self.duration))
    }
}
