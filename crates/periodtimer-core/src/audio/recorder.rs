//! Period timing recorder
//!
//! Drives a configured [`Session`] one period at a time and timestamps each
//! completion against a monotonic clock. Records stream out as they are
//! produced, so an aborted run still leaves analyzable data behind.

use super::device::{Direction, XrunKind};
use super::priority;
use super::record::{run_header, PeriodRecord, RecordSink, SampleSink, TimingEvent, XrunRecord};
use super::session::{Session, SessionError};
use super::signal::SampleSource;
use crate::config::StreamConfig;
use crate::stop::StopSignal;
use serde::Serialize;
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Where period blocks come from or go to
pub enum PeriodIo<'a> {
    /// Captured blocks are forwarded to the sink
    Capture(&'a mut dyn SampleSink),
    /// Blocks are filled from the source before each write
    Playback(&'a mut dyn SampleSource),
}

impl PeriodIo<'_> {
    fn direction(&self) -> Direction {
        match self {
            PeriodIo::Capture(_) => Direction::Capture,
            PeriodIo::Playback(_) => Direction::Playback,
        }
    }
}

/// Statistics for one recorded run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub device: String,
    pub direction: Direction,
    pub sample_rate: u32,
    pub channels: u16,
    pub period_size: u32,
    pub period_count: u32,
    pub buffer_size: u64,
    pub periods_expected: u64,
    pub periods_recorded: u64,
    pub underruns: u64,
    pub overruns: u64,
    /// Periods whose delta exceeded the whole buffer duration
    pub late_periods: u64,
    pub stopped_early: bool,
    pub elapsed_secs: f64,
    /// Wall minus nominal at the last recorded period
    pub final_drift_us: f64,
    /// Mean of |delta - period|
    pub mean_jitter_us: f64,
    /// Max of |delta - period|
    pub max_jitter_us: f64,
    /// Wall minus device clock at the last recorded period, when known
    pub final_device_drift_us: Option<f64>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl RunSummary {
    fn new(device: &str, direction: Direction, config: &StreamConfig, expected: u64) -> Self {
        Self {
            device: device.to_string(),
            direction,
            sample_rate: config.sample_rate,
            channels: config.channels,
            period_size: config.period_size,
            period_count: config.period_count,
            buffer_size: config.buffer_size(),
            periods_expected: expected,
            periods_recorded: 0,
            underruns: 0,
            overruns: 0,
            late_periods: 0,
            stopped_early: false,
            elapsed_secs: 0.0,
            final_drift_us: 0.0,
            mean_jitter_us: 0.0,
            max_jitter_us: 0.0,
            final_device_drift_us: None,
            finished_at: None,
        }
    }

    /// Total recovered xruns
    pub fn xruns(&self) -> u64 {
        self.underruns + self.overruns
    }

    fn add_period(&mut self, record: &PeriodRecord, period: Duration) {
        let jitter_us = (record.delta.as_secs_f64() - period.as_secs_f64()).abs() * 1e6;
        let n = self.periods_recorded as f64;
        self.mean_jitter_us = (self.mean_jitter_us * n + jitter_us) / (n + 1.0);
        self.max_jitter_us = self.max_jitter_us.max(jitter_us);
        self.final_drift_us = record.drift_secs() * 1e6;
        if let Some(drift) = record.device_drift_secs() {
            self.final_device_drift_us = Some(drift * 1e6);
        }
        self.periods_recorded += 1;
        if record.late {
            self.late_periods += 1;
        }
    }

    fn add_xrun(&mut self, kind: XrunKind) {
        match kind {
            XrunKind::Underrun => self.underruns += 1,
            XrunKind::Overrun => self.overruns += 1,
        }
    }

    fn finish(&mut self, started: Option<Instant>) {
        self.elapsed_secs = started.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0);
        self.finished_at = Some(chrono::Utc::now());
    }
}

/// A run that ended in error; partial output has been flushed
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("{source}")]
    Session {
        source: SessionError,
        summary: Box<RunSummary>,
    },

    #[error("failed to write {what}: {source}")]
    Output {
        what: &'static str,
        source: io::Error,
        summary: Box<RunSummary>,
    },
}

impl RecorderError {
    /// What was recorded before the failure
    pub fn summary(&self) -> &RunSummary {
        match self {
            RecorderError::Session { summary, .. } | RecorderError::Output { summary, .. } => {
                summary
            }
        }
    }
}

/// Drives a session period by period for a fixed duration
#[derive(Debug, Clone)]
pub struct PeriodRecorder {
    duration: Duration,
    stop: StopSignal,
    realtime_priority: Option<i32>,
}

impl PeriodRecorder {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            stop: StopSignal::new(),
            realtime_priority: None,
        }
    }

    /// Stop cooperatively when `stop` is raised (checked between periods)
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_realtime_priority(mut self, priority: Option<i32>) -> Self {
        self.realtime_priority = priority;
        self
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Record one run on a configured session
    ///
    /// Runs `floor(duration * rate / period_size)` periods, or fewer if the
    /// stop signal is raised. Recovered xruns become sentinel events and the
    /// run continues; a fatal error flushes the outputs and is returned with
    /// the partial summary. The session is stopped on every path.
    pub fn run(
        &self,
        session: &mut Session,
        mut io: PeriodIo<'_>,
        records: &mut dyn RecordSink,
    ) -> Result<RunSummary, RecorderError> {
        let direction = session.direction();
        let device = session.device().to_string();
        let Some(config) = session.config() else {
            return Err(RecorderError::Session {
                source: SessionError::InvalidState {
                    device: device.clone(),
                    operation: "record",
                    state: session.state(),
                },
                summary: Box::new(RunSummary::new(
                    &device,
                    direction,
                    &StreamConfig::default(),
                    0,
                )),
            });
        };

        let expected = config.periods_in(self.duration);
        let mut summary = RunSummary::new(&device, direction, &config, expected);

        if io.direction() != direction {
            session.stop();
            return Err(RecorderError::Session {
                source: SessionError::WrongDirection {
                    device,
                    operation: "record",
                    direction,
                },
                summary: Box::new(summary),
            });
        }

        if let Err(e) = records.comment(&run_header(&device, direction, &config)) {
            session.stop();
            return Err(RecorderError::Output {
                what: "timing records",
                source: e,
                summary: Box::new(summary),
            });
        }

        priority::apply(self.realtime_priority);

        if let Err(e) = session.start() {
            session.stop();
            let _ = records.flush();
            return Err(RecorderError::Session {
                source: e,
                summary: Box::new(summary),
            });
        }

        tracing::info!(
            device = %device,
            %direction,
            periods = expected,
            period_us = config.period_duration().as_micros() as u64,
            "Recording period timing"
        );

        let result = self.drive(session, &mut io, records, &config, &mut summary);

        session.stop();
        let flushed = records.flush().and_then(|_| match &mut io {
            PeriodIo::Capture(sink) => sink.flush(),
            PeriodIo::Playback(_) => Ok(()),
        });

        match result {
            Ok(started) => {
                summary.finish(Some(started));
                if let Err(e) = flushed {
                    return Err(RecorderError::Output {
                        what: "run output",
                        source: e,
                        summary: Box::new(summary),
                    });
                }
                tracing::info!(
                    device = %device,
                    %direction,
                    recorded = summary.periods_recorded,
                    xruns = summary.xruns(),
                    late = summary.late_periods,
                    drift_us = summary.final_drift_us,
                    "Recording finished"
                );
                Ok(summary)
            }
            Err((started, error)) => {
                summary.finish(Some(started));
                Err(match error {
                    DriveError::Session(source) => RecorderError::Session {
                        source,
                        summary: Box::new(summary),
                    },
                    DriveError::Output(what, source) => RecorderError::Output {
                        what,
                        source,
                        summary: Box::new(summary),
                    },
                })
            }
        }
    }

    fn drive(
        &self,
        session: &mut Session,
        io: &mut PeriodIo<'_>,
        records: &mut dyn RecordSink,
        config: &StreamConfig,
        summary: &mut RunSummary,
    ) -> Result<Instant, (Instant, DriveError)> {
        let channels = config.channels as usize;
        let period = config.period_duration();
        let buffer = config.buffer_duration();
        let mut block = session.period_block();

        let started = Instant::now();
        let mut previous = Duration::ZERO;

        for index in 0..summary.periods_expected {
            if self.stop.is_raised() {
                summary.stopped_early = true;
                tracing::info!(index, "Stop requested, ending run");
                break;
            }

            let result = match io {
                PeriodIo::Capture(_) => session.read_period(&mut block),
                PeriodIo::Playback(source) => {
                    source.fill(&mut block, channels);
                    session.write_period(&block)
                }
            };
            let wall = started.elapsed();

            let event = match result {
                Ok(()) => {
                    let delta = wall.saturating_sub(previous);
                    previous = wall;
                    let record = PeriodRecord {
                        sequence_index: index,
                        period_size: config.period_size,
                        sample_rate: config.sample_rate,
                        wall,
                        delta,
                        late: delta > buffer,
                        device_time: session.device_time(),
                    };
                    if record.late {
                        tracing::warn!(
                            index,
                            delta_us = delta.as_micros() as u64,
                            buffer_us = buffer.as_micros() as u64,
                            "Late period"
                        );
                    }
                    summary.add_period(&record, period);
                    if let PeriodIo::Capture(sink) = io {
                        sink.write_block(&block)
                            .map_err(|e| (started, DriveError::Output("captured samples", e)))?;
                    }
                    TimingEvent::Period(record)
                }
                Err(SessionError::Xrun { kind, .. }) => {
                    previous = wall;
                    summary.add_xrun(kind);
                    tracing::warn!(index, %kind, device = %session.device(), "Xrun recovered");
                    TimingEvent::Xrun(XrunRecord {
                        sequence_index: index,
                        kind,
                        wall,
                    })
                }
                Err(e) => {
                    summary.stopped_early = true;
                    return Err((started, DriveError::Session(e)));
                }
            };

            records
                .event(&event)
                .map_err(|e| (started, DriveError::Output("timing records", e)))?;
        }

        Ok(started)
    }
}

enum DriveError {
    Session(SessionError),
    Output(&'static str, io::Error),
}
