//! Periodtimer Core - Period-granular audio I/O timing and offline analysis
//!
//! This library measures how regularly an audio device completes periods.
//! It drives capture and playback streams one period at a time, records a
//! nominal and a wall-clock timestamp for every period, and analyzes the
//! captured samples or timing records offline (filtering and spectra).

pub mod analysis;
pub mod audio;
pub mod config;
pub mod stop;

pub use analysis::{run_pipeline, AnalysisConfig, AnalysisError, OutputPaths, Stage};
pub use audio::{
    CpalBackend, DuplexRunner, PeriodRecorder, Session, SessionError, SimulatedBackend,
};
#[cfg(target_os = "linux")]
pub use audio::AlsaBackend;
pub use config::{ConfigError, DuplexConfig, Mode, RunConfig, StreamConfig};
pub use stop::StopSignal;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default sample rate for streams and PCM analysis input
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Default interleaved channel count
pub const DEFAULT_CHANNELS: u16 = 2;

/// Default frames per period
pub const DEFAULT_PERIOD_SIZE: u32 = 128;

/// Default periods per buffer
pub const DEFAULT_PERIOD_COUNT: u32 = 2;

/// MLS playback sequence order (2^ORDER - 1 samples)
pub const MLS_ORDER: u32 = 15;
