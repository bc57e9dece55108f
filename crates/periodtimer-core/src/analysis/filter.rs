//! Fixed IIR filter stage
//!
//! RBJ cookbook biquads run as Direct Form II transposed, cascaded
//! `sections` times. Every run starts from zero state and the output has
//! exactly the input's length: no trimming, no look-ahead.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Response shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    #[default]
    LowPass,
    /// Constant 0 dB peak gain band-pass centred on the cutoff
    BandPass,
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKind::LowPass => write!(f, "lowpass"),
            FilterKind::BandPass => write!(f, "bandpass"),
        }
    }
}

impl FromStr for FilterKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lowpass" | "low-pass" => Ok(FilterKind::LowPass),
            "bandpass" | "band-pass" => Ok(FilterKind::BandPass),
            other => Err(ConfigError::Analysis(format!("unknown filter kind: {}", other))),
        }
    }
}

/// Filter design parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub kind: FilterKind,
    /// Cutoff (or centre) as a fraction of the sample rate, in (0, 0.5)
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,
    #[serde(default = "default_q")]
    pub q: f64,
    /// Number of identical biquads in series
    #[serde(default = "default_sections")]
    pub sections: u32,
}

fn default_cutoff() -> f64 {
    0.05
}

fn default_q() -> f64 {
    std::f64::consts::FRAC_1_SQRT_2
}

fn default_sections() -> u32 {
    1
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            kind: FilterKind::default(),
            cutoff: default_cutoff(),
            q: default_q(),
            sections: default_sections(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cutoff > 0.0 && self.cutoff < 0.5) {
            return Err(ConfigError::Analysis(format!(
                "filter cutoff must be a fraction of the sample rate in (0, 0.5), got {}",
                self.cutoff
            )));
        }
        if !(self.q.is_finite() && self.q > 0.0) {
            return Err(ConfigError::Analysis(format!(
                "filter Q must be positive, got {}",
                self.q
            )));
        }
        if self.sections == 0 {
            return Err(ConfigError::Analysis(
                "filter needs at least one section".into(),
            ));
        }
        Ok(())
    }

    /// Design the biquad for one section
    pub fn design(&self) -> Result<Biquad, ConfigError> {
        self.validate()?;
        Ok(match self.kind {
            FilterKind::LowPass => Biquad::low_pass(self.cutoff, self.q),
            FilterKind::BandPass => Biquad::band_pass(self.cutoff, self.q),
        })
    }
}

/// Normalized biquad coefficients (a0 = 1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Biquad {
    /// RBJ low-pass at `cutoff` cycles per sample
    pub fn low_pass(cutoff: f64, q: f64) -> Self {
        let omega = std::f64::consts::TAU * cutoff;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        Self {
            b0: (1.0 - cos_omega) / 2.0 / a0,
            b1: (1.0 - cos_omega) / a0,
            b2: (1.0 - cos_omega) / 2.0 / a0,
            a1: -2.0 * cos_omega / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// RBJ band-pass (0 dB peak) centred at `center` cycles per sample
    pub fn band_pass(center: f64, q: f64) -> Self {
        let omega = std::f64::consts::TAU * center;
        let cos_omega = omega.cos();
        let alpha = omega.sin() / (2.0 * q);

        let a0 = 1.0 + alpha;
        Self {
            b0: alpha / a0,
            b1: 0.0,
            b2: -alpha / a0,
            a1: -2.0 * cos_omega / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Filter `input` from zero state
    pub fn process(&self, input: &[f64]) -> Vec<f64> {
        let mut z1 = 0.0;
        let mut z2 = 0.0;
        input
            .iter()
            .map(|&x| {
                let y = self.b0 * x + z1;
                z1 = self.b1 * x - self.a1 * y + z2;
                z2 = self.b2 * x - self.a2 * y;
                y
            })
            .collect()
    }

    /// Magnitude response at `frequency` cycles per sample
    pub fn magnitude_at(&self, frequency: f64) -> f64 {
        let w = std::f64::consts::TAU * frequency;
        let (c1, s1) = (w.cos(), w.sin());
        let (c2, s2) = ((2.0 * w).cos(), (2.0 * w).sin());
        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);
        (num_re.hypot(num_im)) / (den_re.hypot(den_im))
    }
}

/// Run the configured cascade over one channel
pub fn apply(config: &FilterConfig, input: &[f64]) -> Result<Vec<f64>, ConfigError> {
    let biquad = config.design()?;
    let mut output = biquad.process(input);
    for _ in 1..config.sections {
        output = biquad.process(&output);
    }
    Ok(output)
}
