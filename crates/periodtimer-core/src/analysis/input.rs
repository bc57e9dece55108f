//! Analysis input readers
//!
//! Three formats are understood:
//! - `s16le`: raw signed 16-bit little-endian interleaved PCM, as written by
//!   the duplex runner; samples are scaled to -1.0..1.0
//! - `text`: one frame per line, whitespace-separated values
//! - `timing`: period timing records; becomes two channels sampled once per
//!   period: jitter (`delta - period`) and drift (`wall - nominal`), both in
//!   microseconds. Periods missing from the sequence (lost to an xrun) hold
//!   the previous period's values so the series stays uniformly sampled.

use super::demux::Interleaved;
use super::AnalysisError;
use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    #[default]
    S16le,
    Text,
    Timing,
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputFormat::S16le => write!(f, "s16le"),
            InputFormat::Text => write!(f, "text"),
            InputFormat::Timing => write!(f, "timing"),
        }
    }
}

impl FromStr for InputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s16le" | "raw" => Ok(InputFormat::S16le),
            "text" | "txt" => Ok(InputFormat::Text),
            "timing" => Ok(InputFormat::Timing),
            other => Err(ConfigError::Analysis(format!("unknown input format: {}", other))),
        }
    }
}

/// Decode `bytes` in `format`
///
/// `channels` and `sample_rate` describe PCM and text input; timing input
/// carries its own geometry.
pub fn read(
    bytes: &[u8],
    format: InputFormat,
    channels: usize,
    sample_rate: f64,
) -> Result<Interleaved, AnalysisError> {
    match format {
        InputFormat::S16le => read_s16le(bytes, channels, sample_rate),
        InputFormat::Text => read_text(as_text(bytes)?, channels, sample_rate),
        InputFormat::Timing => read_timing(as_text(bytes)?),
    }
}

fn as_text(bytes: &[u8]) -> Result<&str, AnalysisError> {
    std::str::from_utf8(bytes)
        .map_err(|e| AnalysisError::MalformedInput(format!("input is not UTF-8 text: {}", e)))
}

pub fn read_s16le(
    bytes: &[u8],
    channels: usize,
    sample_rate: f64,
) -> Result<Interleaved, AnalysisError> {
    if bytes.len() % 2 != 0 {
        return Err(AnalysisError::MalformedInput(format!(
            "truncated input: {} bytes is not a whole number of 16-bit samples",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f64 / 32768.0)
        .collect();
    Ok(Interleaved {
        samples,
        channels,
        sample_rate,
    })
}

pub fn read_text(
    text: &str,
    channels: usize,
    sample_rate: f64,
) -> Result<Interleaved, AnalysisError> {
    let mut samples = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let start = samples.len();
        for token in line.split_whitespace() {
            let value: f64 = token.parse().map_err(|_| {
                AnalysisError::MalformedInput(format!(
                    "line {}: not a number: {:?}",
                    number + 1,
                    token
                ))
            })?;
            samples.push(value);
        }
        let found = samples.len() - start;
        if found != channels {
            return Err(AnalysisError::MalformedInput(format!(
                "line {}: {} values, expected {}",
                number + 1,
                found,
                channels
            )));
        }
    }
    Ok(Interleaved {
        samples,
        channels,
        sample_rate,
    })
}

struct TimingLine {
    index: u64,
    nominal: f64,
    wall: f64,
    delta: f64,
}

/// Geometry from a `# periodtimer ...` header line
fn header_period(line: &str) -> Option<f64> {
    let mut rate = None;
    let mut period = None;
    for token in line.split_whitespace() {
        if let Some(value) = token.strip_prefix("rate=") {
            rate = value.parse::<f64>().ok();
        } else if let Some(value) = token.strip_prefix("period=") {
            period = value.parse::<f64>().ok();
        }
    }
    match (rate, period) {
        (Some(rate), Some(period)) if rate > 0.0 && period > 0.0 => Some(period / rate),
        _ => None,
    }
}

/// Longest run of missing periods filled in by holding
const MAX_HELD_PERIODS: u64 = 1 << 20;

pub fn read_timing(text: &str) -> Result<Interleaved, AnalysisError> {
    let mut period = None;
    let mut lines = Vec::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            if period.is_none() && line.starts_with("# periodtimer") {
                period = header_period(line);
            }
            continue;
        }

        let malformed = |what: &str| {
            AnalysisError::MalformedInput(format!("line {}: {}", number + 1, what))
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(malformed(&format!(
                "{} fields, expected 4 (index nominal wall delta)",
                fields.len()
            )));
        }
        let index = fields[0]
            .parse::<u64>()
            .map_err(|_| malformed("bad sequence index"))?;
        if let Some(previous) = lines.last().map(|l: &TimingLine| l.index) {
            if index <= previous {
                return Err(malformed(&format!(
                    "sequence index {} does not follow {}",
                    index, previous
                )));
            }
            if index - previous - 1 > MAX_HELD_PERIODS {
                return Err(malformed(&format!(
                    "{} periods missing before index {}",
                    index - previous - 1,
                    index
                )));
            }
        }
        let mut values = [0.0f64; 3];
        for (value, field) in values.iter_mut().zip(&fields[1..]) {
            *value = field
                .parse()
                .map_err(|_| malformed(&format!("not a number: {:?}", field)))?;
        }
        lines.push(TimingLine {
            index,
            nominal: values[0],
            wall: values[1],
            delta: values[2],
        });
    }

    if lines.is_empty() {
        return Err(AnalysisError::MalformedInput(
            "no period records in timing input".into(),
        ));
    }

    let period = match period {
        Some(period) => period,
        None => derive_period(&lines).ok_or_else(|| {
            AnalysisError::MalformedInput(
                "cannot determine the period: no header and fewer than two records".into(),
            )
        })?,
    };

    let mut samples = Vec::with_capacity(lines.len() * 2);
    let mut previous: Option<&TimingLine> = None;
    for line in &lines {
        if let Some(previous) = previous {
            let missing = line.index - previous.index - 1;
            if missing > 0 {
                tracing::debug!(
                    from = previous.index + 1,
                    missing,
                    "Holding values across missing periods"
                );
                let held = [samples[samples.len() - 2], samples[samples.len() - 1]];
                for _ in 0..missing {
                    samples.extend_from_slice(&held);
                }
            }
        }
        samples.push((line.delta - period) * 1e6);
        samples.push((line.wall - line.nominal) * 1e6);
        previous = Some(line);
    }
    Ok(Interleaved {
        samples,
        channels: 2,
        sample_rate: 1.0 / period,
    })
}

fn derive_period(lines: &[TimingLine]) -> Option<f64> {
    let first = lines.first()?;
    let last = lines.last()?;
    if last.index <= first.index {
        return None;
    }
    let period = (last.nominal - first.nominal) / (last.index - first.index) as f64;
    (period > 0.0).then_some(period)
}
