//! Capture-playback duplex runner
//!
//! Opens a capture and a playback session up front, then drives each on its
//! own I/O thread through a [`PeriodRecorder`]. The two loops share nothing
//! but a stop signal. Captured blocks travel over a bounded channel to the
//! calling thread, which appends them to the raw output sink.

use super::device::{Direction, PcmBackend};
use super::record::{RecordSink, SampleSink};
use super::recorder::{PeriodIo, PeriodRecorder, RecorderError, RunSummary};
use super::session::{Session, SessionError};
use super::signal::SampleSource;
use crate::config::DuplexConfig;
use crate::stop::StopSignal;
use crossbeam_channel::Sender;
use serde::Serialize;
use std::io;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Captured blocks buffered between the capture thread and the writer
const CHANNEL_BLOCKS: usize = 64;

/// Both sides of a duplex run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplexSummary {
    pub capture: RunSummary,
    pub playback: RunSummary,
    /// Interleaved samples appended to the raw output
    pub samples_written: u64,
}

#[derive(Error, Debug)]
pub enum DuplexError {
    #[error("failed to open {side} device {device}: {source}")]
    Open {
        side: Direction,
        device: String,
        source: SessionError,
    },

    #[error("{side} side failed on {device}: {source}")]
    Side {
        side: Direction,
        device: String,
        source: RecorderError,
        summary: Box<DuplexSummary>,
    },

    #[error("failed to write raw output: {source}")]
    Output {
        source: io::Error,
        summary: Box<DuplexSummary>,
    },

    #[error("{side} I/O thread: {reason}")]
    Thread { side: Direction, reason: String },
}

impl DuplexError {
    /// Partial results, when the run got as far as starting
    pub fn summary(&self) -> Option<&DuplexSummary> {
        match self {
            DuplexError::Side { summary, .. } | DuplexError::Output { summary, .. } => {
                Some(summary)
            }
            DuplexError::Open { .. } | DuplexError::Thread { .. } => None,
        }
    }
}

/// Forwards captured blocks to the writer thread
struct ChannelSink {
    tx: Sender<Vec<i16>>,
}

impl SampleSink for ChannelSink {
    fn write_block(&mut self, block: &[i16]) -> io::Result<()> {
        self.tx
            .send(block.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "raw output writer closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs capture and playback concurrently for a fixed duration
#[derive(Debug, Clone)]
pub struct DuplexRunner {
    config: DuplexConfig,
    capture_device: String,
    playback_device: String,
    duration: Duration,
    stop: StopSignal,
    realtime_priority: Option<i32>,
}

impl DuplexRunner {
    pub fn new(
        config: DuplexConfig,
        capture_device: impl Into<String>,
        playback_device: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            config,
            capture_device: capture_device.into(),
            playback_device: playback_device.into(),
            duration,
            stop: StopSignal::new(),
            realtime_priority: None,
        }
    }

    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_realtime_priority(mut self, priority: Option<i32>) -> Self {
        self.realtime_priority = priority;
        self
    }

    /// Run both sides until the duration elapses or either side fails
    ///
    /// Raw output is flushed before any error is returned. When both sides
    /// fail, the one that failed first is reported.
    pub fn run(
        &self,
        backend: &dyn PcmBackend,
        source: &mut dyn SampleSource,
        output: &mut dyn SampleSink,
        capture_records: &mut (dyn RecordSink + Send),
        playback_records: &mut (dyn RecordSink + Send),
    ) -> Result<DuplexSummary, DuplexError> {
        let mut capture = Session::open(
            backend,
            &self.capture_device,
            Direction::Capture,
            self.config.capture,
        )
        .map_err(|source| DuplexError::Open {
            side: Direction::Capture,
            device: self.capture_device.clone(),
            source,
        })?;
        let mut playback = Session::open(
            backend,
            &self.playback_device,
            Direction::Playback,
            self.config.playback,
        )
        .map_err(|source| DuplexError::Open {
            side: Direction::Playback,
            device: self.playback_device.clone(),
            source,
        })?;

        tracing::info!(
            capture = %self.capture_device,
            playback = %self.playback_device,
            duration_secs = self.duration.as_secs_f64(),
            "Starting duplex run"
        );

        let stop = self.stop.child();
        let first_failure: OnceLock<Direction> = OnceLock::new();
        let recorder = PeriodRecorder::new(self.duration)
            .with_stop(stop.clone())
            .with_realtime_priority(self.realtime_priority);
        let (tx, rx) = crossbeam_channel::bounded::<Vec<i16>>(CHANNEL_BLOCKS);

        let outcome = thread::scope(|scope| {
            let capture_session = &mut capture;
            let capture_recorder = recorder.clone();
            let capture_stop = stop.clone();
            let capture_failure = &first_failure;
            let capture_thread = thread::Builder::new()
                .name("capture-io".into())
                .spawn_scoped(scope, move || {
                    let mut sink = ChannelSink { tx };
                    let result = capture_recorder.run(
                        capture_session,
                        PeriodIo::Capture(&mut sink),
                        capture_records,
                    );
                    if result.is_err() {
                        let _ = capture_failure.set(Direction::Capture);
                        capture_stop.raise();
                    }
                    result
                })
                .map_err(|e| DuplexError::Thread {
                    side: Direction::Capture,
                    reason: e.to_string(),
                })?;

            let playback_session = &mut playback;
            let playback_recorder = recorder.clone();
            let playback_stop = stop.clone();
            let playback_failure = &first_failure;
            let playback_thread = thread::Builder::new()
                .name("playback-io".into())
                .spawn_scoped(scope, move || {
                    let result = playback_recorder.run(
                        playback_session,
                        PeriodIo::Playback(source),
                        playback_records,
                    );
                    if result.is_err() {
                        let _ = playback_failure.set(Direction::Playback);
                        playback_stop.raise();
                    }
                    result
                });
            let playback_thread = match playback_thread {
                Ok(handle) => handle,
                Err(e) => {
                    stop.raise();
                    // Drain so the capture thread can finish
                    for _ in rx.iter() {}
                    let _ = capture_thread.join();
                    return Err(DuplexError::Thread {
                        side: Direction::Playback,
                        reason: e.to_string(),
                    });
                }
            };

            // Writer: runs until the capture thread drops its sender
            let mut samples_written = 0u64;
            let mut write_error = None;
            for block in rx.iter() {
                if write_error.is_some() {
                    continue;
                }
                match output.write_block(&block) {
                    Ok(()) => samples_written += block.len() as u64,
                    Err(e) => {
                        tracing::error!(error = %e, "Raw output write failed; stopping run");
                        write_error = Some(e);
                        stop.raise();
                    }
                }
            }
            if let Err(e) = output.flush() {
                write_error.get_or_insert(e);
            }

            let capture_result = capture_thread.join().map_err(|_| DuplexError::Thread {
                side: Direction::Capture,
                reason: "panicked".into(),
            })?;
            let playback_result = playback_thread.join().map_err(|_| DuplexError::Thread {
                side: Direction::Playback,
                reason: "panicked".into(),
            })?;
            Ok((capture_result, playback_result, samples_written, write_error))
        });

        let (capture_result, playback_result, samples_written, write_error) = outcome?;

        let summary = DuplexSummary {
            capture: side_summary(&capture_result),
            playback: side_summary(&playback_result),
            samples_written,
        };

        let failed_side = first_failure.get().copied();
        let failure = match (capture_result, playback_result) {
            (Ok(_), Ok(_)) => None,
            (Err(e), Ok(_)) => Some((Direction::Capture, e)),
            (Ok(_), Err(e)) => Some((Direction::Playback, e)),
            (Err(capture_error), Err(playback_error)) => {
                if failed_side == Some(Direction::Playback) {
                    Some((Direction::Playback, playback_error))
                } else {
                    Some((Direction::Capture, capture_error))
                }
            }
        };

        if let Some((side, error)) = failure {
            let device = match side {
                Direction::Capture => self.capture_device.clone(),
                Direction::Playback => self.playback_device.clone(),
            };
            tracing::error!(%side, device = %device, "Duplex run failed: {}", error);
            return Err(DuplexError::Side {
                side,
                device,
                source: error,
                summary: Box::new(summary),
            });
        }

        if let Some(source) = write_error {
            return Err(DuplexError::Output {
                source,
                summary: Box::new(summary),
            });
        }

        tracing::info!(
            capture_periods = summary.capture.periods_recorded,
            playback_periods = summary.playback.periods_recorded,
            samples_written,
            "Duplex run finished"
        );
        Ok(summary)
    }
}

fn side_summary(result: &Result<RunSummary, RecorderError>) -> RunSummary {
    match result {
        Ok(summary) => summary.clone(),
        Err(e) => e.summary().clone(),
    }
}
