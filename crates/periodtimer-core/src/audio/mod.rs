//! Audio device I/O and timing
//!
//! This module contains the real-time side of the tool:
//! - Backend-neutral device interface ([`device`])
//! - Direct ALSA backend on Linux (`alsa_pcm`), cpal engine and simulated
//!   stand-in ([`engine`], [`simulated`])
//! - Session lifecycle with exclusive device leases ([`session`], [`lease`])
//! - Period timing recorder and its record format ([`recorder`], [`record`])
//! - Concurrent capture-playback runs ([`duplex`])
//! - Playback test signals ([`signal`])

#[cfg(target_os = "linux")]
pub mod alsa_pcm;
pub mod device;
pub mod duplex;
pub mod engine;
pub mod lease;
pub mod priority;
pub mod record;
pub mod recorder;
pub mod session;
pub mod signal;
pub mod simulated;

#[cfg(target_os = "linux")]
pub use alsa_pcm::AlsaBackend;
pub use device::{DeviceError, DeviceInfo, Direction, PcmBackend, PcmStream, PeriodError, XrunKind};
pub use duplex::{DuplexError, DuplexRunner, DuplexSummary};
pub use engine::CpalBackend;
pub use record::{PeriodRecord, RawSampleWriter, RecordSink, SampleSink, TimingEvent, TimingWriter};
pub use recorder::{PeriodIo, PeriodRecorder, RecorderError, RunSummary};
pub use session::{Session, SessionError, SessionState};
pub use signal::{PlaybackSource, SampleSource};
pub use simulated::{Pacing, SimulatedBackend};
