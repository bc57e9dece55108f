//! Period records and output sinks
//!
//! ## Timing format
//!
//! One line per completed period, whitespace separated, seconds with 9
//! decimals:
//!
//! ```text
//! sequence_index nominal_timestamp wall_timestamp delta
//! ```
//!
//! Lines starting with `#` are comments: a run header, xrun sentinels
//! (`# xrun <index> <kind> <wall>`), and annotations that follow the period
//! line they belong to:
//!
//! ```text
//! # late <index> <delta>
//! # devtime <index> <device> <wall>
//! ```
//!
//! `late` marks a period that completed more than a whole buffer after the
//! previous one. `devtime` pairs the device's own clock with the wall clock
//! for backends that timestamp periods on the device side.
//!
//! ## Raw sample format
//!
//! Signed 16-bit little-endian, interleaved, frame-sequential.

use super::device::{Direction, XrunKind};
use crate::config::{frames_to_duration, StreamConfig};
use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

/// Format a duration as seconds with nanosecond precision
pub fn format_seconds(duration: Duration) -> String {
    format!("{}.{:09}", duration.as_secs(), duration.subsec_nanos())
}

/// Timing of one completed period I/O call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodRecord {
    pub sequence_index: u64,
    pub period_size: u32,
    pub sample_rate: u32,
    /// Monotonic time since the run started
    pub wall: Duration,
    /// `wall` minus the previous record's `wall`
    pub delta: Duration,
    /// Completed later than a whole buffer after the previous period
    pub late: bool,
    /// Device clock at completion, from stream start
    pub device_time: Option<Duration>,
}

impl PeriodRecord {
    /// Reference position in frames, exact integer arithmetic
    pub fn nominal_frames(&self) -> u64 {
        self.sequence_index * self.period_size as u64
    }

    pub fn nominal(&self) -> Duration {
        frames_to_duration(self.nominal_frames(), self.sample_rate)
    }

    /// Measured minus nominal position, in seconds
    pub fn drift_secs(&self) -> f64 {
        self.wall.as_secs_f64() - self.nominal_frames() as f64 / self.sample_rate.max(1) as f64
    }

    /// Wall minus device clock, in seconds
    pub fn device_drift_secs(&self) -> Option<f64> {
        self.device_time
            .map(|device| self.wall.as_secs_f64() - device.as_secs_f64())
    }

    /// `# late` comment for a late period
    pub fn late_line(&self) -> Option<String> {
        self.late.then(|| {
            format!(
                "# late {} {}",
                self.sequence_index,
                format_seconds(self.delta)
            )
        })
    }

    /// `# devtime` comment when a device timestamp is known
    pub fn device_time_line(&self) -> Option<String> {
        self.device_time.map(|device| {
            format!(
                "# devtime {} {} {}",
                self.sequence_index,
                format_seconds(device),
                format_seconds(self.wall)
            )
        })
    }
}

impl fmt::Display for PeriodRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.sequence_index,
            format_seconds(self.nominal()),
            format_seconds(self.wall),
            format_seconds(self.delta)
        )
    }
}

/// A recovered xrun at one period index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XrunRecord {
    pub sequence_index: u64,
    pub kind: XrunKind,
    pub wall: Duration,
}

impl fmt::Display for XrunRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "# xrun {} {} {}",
            self.sequence_index,
            self.kind,
            format_seconds(self.wall)
        )
    }
}

/// Anything the recorder emits, in completion order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingEvent {
    Period(PeriodRecord),
    Xrun(XrunRecord),
}

impl fmt::Display for TimingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimingEvent::Period(record) => record.fmt(f),
            TimingEvent::Xrun(xrun) => xrun.fmt(f),
        }
    }
}

/// Comment line describing a run
pub fn run_header(device: &str, direction: Direction, config: &StreamConfig) -> String {
    format!(
        "# periodtimer {} {} device={} rate={} channels={} period={} periods={} buffer={} started={}",
        crate::VERSION,
        direction,
        device,
        config.sample_rate,
        config.channels,
        config.period_size,
        config.period_count,
        config.buffer_size(),
        chrono::Local::now().to_rfc3339()
    )
}

/// Destination for timing events
pub trait RecordSink {
    fn comment(&mut self, line: &str) -> io::Result<()>;
    fn event(&mut self, event: &TimingEvent) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Line writer that flushes after every line
pub struct TimingWriter<W: Write> {
    out: W,
}

impl<W: Write> TimingWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RecordSink for TimingWriter<W> {
    fn comment(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.out, "{}", line)?;
        self.out.flush()
    }

    fn event(&mut self, event: &TimingEvent) -> io::Result<()> {
        writeln!(self.out, "{}", event)?;
        if let TimingEvent::Period(record) = event {
            for line in [record.late_line(), record.device_time_line()]
                .into_iter()
                .flatten()
            {
                writeln!(self.out, "{}", line)?;
            }
        }
        self.out.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl RecordSink for Vec<TimingEvent> {
    fn comment(&mut self, _line: &str) -> io::Result<()> {
        Ok(())
    }

    fn event(&mut self, event: &TimingEvent) -> io::Result<()> {
        self.push(*event);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Destination for captured sample blocks
pub trait SampleSink: Send {
    fn write_block(&mut self, block: &[i16]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Writes blocks as raw signed 16-bit little-endian PCM
pub struct RawSampleWriter<W: Write + Send> {
    out: W,
    bytes: Vec<u8>,
    samples_written: u64,
}

impl<W: Write + Send> RawSampleWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            bytes: Vec::new(),
            samples_written: 0,
        }
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> SampleSink for RawSampleWriter<W> {
    fn write_block(&mut self, block: &[i16]) -> io::Result<()> {
        self.bytes.clear();
        self.bytes.reserve(block.len() * 2);
        for sample in block {
            self.bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.out.write_all(&self.bytes)?;
        self.samples_written += block.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Discards samples
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn write_block(&mut self, _block: &[i16]) -> io::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SampleSink for Vec<i16> {
    fn write_block(&mut self, block: &[i16]) -> io::Result<()> {
        self.extend_from_slice(block);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64, wall_ms: u64, delta_ms: u64) -> PeriodRecord {
        PeriodRecord {
            sequence_index: index,
            period_size: 480,
            sample_rate: 48000,
            wall: Duration::from_millis(wall_ms),
            delta: Duration::from_millis(delta_ms),
            late: false,
            device_time: None,
        }
    }

    #[test]
    fn test_period_line_format() {
        let line = record(3, 31, 11).to_string();
        assert_eq!(line, "3 0.030000000 0.031000000 0.011000000");
    }

    #[test]
    fn test_nominal_step_is_exact_in_frames() {
        let config = StreamConfig::new(48000, 2, 256, 4).unwrap();
        for i in 0..1000u64 {
            let a = PeriodRecord {
                sequence_index: i,
                period_size: config.period_size,
                sample_rate: config.sample_rate,
                wall: Duration::ZERO,
                delta: Duration::ZERO,
                late: false,
                device_time: None,
            };
            let b = PeriodRecord {
                sequence_index: i + 1,
                ..a
            };
            assert_eq!(b.nominal_frames() - a.nominal_frames(), 256);
        }
    }

    #[test]
    fn test_drift() {
        let r = record(100, 1002, 10);
        approx::assert_abs_diff_eq!(r.drift_secs(), 0.002, epsilon = 1e-12);
    }

    #[test]
    fn test_xrun_sentinel_format() {
        let xrun = XrunRecord {
            sequence_index: 7,
            kind: XrunKind::Underrun,
            wall: Duration::from_micros(70_500),
        };
        assert_eq!(xrun.to_string(), "# xrun 7 underrun 0.070500000");
    }

    #[test]
    fn test_timing_writer_streams_lines() {
        let mut writer = TimingWriter::new(Vec::new());
        writer.comment("# header").unwrap();
        writer.event(&TimingEvent::Period(record(0, 10, 10))).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(text, "# header\n0 0.000000000 0.010000000 0.010000000\n");
    }

    #[test]
    fn test_late_period_is_flagged_in_stream() {
        let late = PeriodRecord {
            late: true,
            ..record(5, 500, 400)
        };
        let mut writer = TimingWriter::new(Vec::new());
        writer.event(&TimingEvent::Period(late)).unwrap();
        writer.event(&TimingEvent::Period(record(6, 510, 10))).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(
            text,
            "5 0.050000000 0.500000000 0.400000000\n\
             # late 5 0.400000000\n\
             6 0.060000000 0.510000000 0.010000000\n"
        );
    }

    #[test]
    fn test_device_time_annotation() {
        let timed = PeriodRecord {
            device_time: Some(Duration::from_micros(19_990)),
            ..record(1, 20, 10)
        };
        assert_eq!(
            timed.device_time_line().as_deref(),
            Some("# devtime 1 0.019990000 0.020000000")
        );
        approx::assert_abs_diff_eq!(
            timed.device_drift_secs().unwrap(),
            10e-6,
            epsilon = 1e-12
        );
        assert_eq!(record(1, 20, 10).device_time_line(), None);
    }

    #[test]
    fn test_raw_writer_little_endian() {
        let mut writer = RawSampleWriter::new(Vec::new());
        writer.write_block(&[1, -2, 0x1234]).unwrap();
        assert_eq!(writer.samples_written(), 3);
        assert_eq!(
            writer.into_inner(),
            vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]
        );
    }

    #[test]
    fn test_run_header_is_comment() {
        let config = StreamConfig::new(48000, 2, 256, 4).unwrap();
        let header = run_header("hw:0", Direction::Capture, &config);
        assert!(header.starts_with("# periodtimer"));
        assert!(header.contains("buffer=1024"));
    }
}
