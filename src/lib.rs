//! Periodtimer - audio period timing measurement
//!
//! This library re-exports the timing engine and analysis pipeline from
//! `periodtimer-core`; the binary adds the command line front end.

pub use periodtimer_core::analysis;
pub use periodtimer_core::audio;
pub use periodtimer_core::config;
pub use periodtimer_core::stop;

pub use periodtimer_core::{
    run_pipeline, AnalysisConfig, AnalysisError, ConfigError, CpalBackend, DuplexConfig,
    DuplexRunner, Mode, OutputPaths, PeriodRecorder, RunConfig, Session, SessionError,
    SimulatedBackend, Stage, StopSignal, StreamConfig,
};
#[cfg(target_os = "linux")]
pub use periodtimer_core::AlsaBackend;
pub use periodtimer_core::{BUILD_DATE, DEFAULT_SAMPLE_RATE, VERSION};
