//! Transform stage
//!
//! Single-sided amplitude spectrum of one channel. Only bins `0..=N/2` are
//! emitted; the mirrored negative frequencies carry no extra information
//! for real input.

use super::AnalysisError;
use crate::config::ConfigError;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Taper applied before the transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Rectangular,
    #[default]
    Hann,
}

impl Window {
    /// Coefficients for `len` samples (periodic Hann)
    pub fn coefficients(&self, len: usize) -> Vec<f64> {
        match self {
            Window::Rectangular => vec![1.0; len],
            Window::Hann => (0..len)
                .map(|i| {
                    0.5 * (1.0 - (std::f64::consts::TAU * i as f64 / len as f64).cos())
                })
                .collect(),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::Rectangular => write!(f, "rectangular"),
            Window::Hann => write!(f, "hann"),
        }
    }
}

impl FromStr for Window {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rectangular" | "rect" | "none" => Ok(Window::Rectangular),
            "hann" | "hanning" => Ok(Window::Hann),
            other => Err(ConfigError::Analysis(format!("unknown window: {}", other))),
        }
    }
}

/// One output bin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumBin {
    pub frequency: f64,
    pub magnitude: f64,
}

/// Amplitude spectrum of `data` sampled at `sample_rate`
///
/// With `size` set, the transform length is fixed: longer input is
/// truncated and shorter input zero-padded. Otherwise the whole input is
/// transformed. Magnitudes are normalized by the window's coherent gain, so
/// a full-scale sinusoid centred on a bin reads as its amplitude.
pub fn spectrum(
    data: &[f64],
    sample_rate: f64,
    size: Option<usize>,
    window: Window,
) -> Result<Vec<SpectrumBin>, AnalysisError> {
    if data.is_empty() {
        return Err(AnalysisError::MalformedInput(
            "no samples to transform".into(),
        ));
    }
    let n = size.unwrap_or(data.len());
    if n == 0 {
        return Err(AnalysisError::Config(ConfigError::Analysis(
            "transform size must be positive".into(),
        )));
    }

    let used = data.len().min(n);
    if window == Window::Hann && used < 2 {
        return Err(AnalysisError::MalformedInput(format!(
            "hann window needs at least 2 samples, got {}",
            used
        )));
    }
    let coefficients = window.coefficients(used);
    let gain: f64 = coefficients.iter().sum();

    let mut buffer: Vec<Complex<f64>> = data[..used]
        .iter()
        .zip(&coefficients)
        .map(|(&x, &w)| Complex::new(x * w, 0.0))
        .collect();
    buffer.resize(n, Complex::new(0.0, 0.0));

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    let half = n / 2;
    let resolution = sample_rate / n as f64;
    let bins = buffer
        .iter()
        .take(half + 1)
        .enumerate()
        .map(|(k, c)| {
            // DC and (even-length) Nyquist have no mirrored twin
            let single = k == 0 || (n % 2 == 0 && k == half);
            let scale = if gain > 0.0 {
                if single {
                    1.0 / gain
                } else {
                    2.0 / gain
                }
            } else {
                0.0
            };
            SpectrumBin {
                frequency: k as f64 * resolution,
                magnitude: c.norm() * scale,
            }
        })
        .collect();
    Ok(bins)
}

/// Index of the largest magnitude, ignoring DC
pub fn peak_bin(bins: &[SpectrumBin]) -> Option<usize> {
    bins.iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.magnitude.total_cmp(&b.1.magnitude))
        .map(|(i, _)| i)
}
