//! Offline analysis of captured streams
//!
//! A capture file is decoded ([`input`]), split per channel ([`demux`]),
//! optionally trimmed and faded in, then fed to five independent stages:
//! two filtered channels ([`filter`]), the spectrum of the reference
//! channel, and the spectra of both filtered channels ([`spectrum`]).
//! Stage failures are local: one stage failing never suppresses another
//! stage whose inputs are valid.

pub mod demux;
pub mod filter;
pub mod input;
pub mod output;
pub mod spectrum;

pub use filter::{FilterConfig, FilterKind};
pub use input::InputFormat;
pub use spectrum::{SpectrumBin, Window};

use crate::config::ConfigError;
use demux::Interleaved;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Stage-local analysis errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("input has {available} channel(s), channel {channel} is required")]
    MissingChannel { channel: usize, available: usize },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("{stage} stage panicked")]
    Panicked { stage: Stage },
}

/// The five pipeline outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Filtered1,
    Filtered2,
    Spectrum,
    FilteredSpectrum1,
    FilteredSpectrum2,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Filtered1,
        Stage::Filtered2,
        Stage::Spectrum,
        Stage::FilteredSpectrum1,
        Stage::FilteredSpectrum2,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Filtered1 => write!(f, "filtered-1"),
            Stage::Filtered2 => write!(f, "filtered-2"),
            Stage::Spectrum => write!(f, "spectrum"),
            Stage::FilteredSpectrum1 => write!(f, "filtered-spectrum-1"),
            Stage::FilteredSpectrum2 => write!(f, "filtered-spectrum-2"),
        }
    }
}

fn default_channels() -> u16 {
    crate::DEFAULT_CHANNELS
}

fn default_sample_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

/// Analysis settings, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub format: InputFormat,
    /// Interleaved channels in PCM and text input
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Frame rate of PCM and text input; timing input carries its own
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Fixed transform length; `None` transforms the whole channel
    #[serde(default)]
    pub fft_size: Option<usize>,
    #[serde(default)]
    pub window: Window,
    #[serde(default)]
    pub filter: FilterConfig,
    /// Seconds dropped from the start of every channel
    #[serde(default)]
    pub skip_secs: Option<f64>,
    /// Seconds of linear fade-in after the skip
    #[serde(default)]
    pub fade_secs: Option<f64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            format: InputFormat::default(),
            channels: default_channels(),
            sample_rate: default_sample_rate(),
            fft_size: None,
            window: Window::default(),
            filter: FilterConfig::default(),
            skip_secs: None,
            fade_secs: None,
        }
    }
}

impl AnalysisConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let load_error = |reason: String| ConfigError::Load {
            path: path.display().to_string(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|e| load_error(e.to_string()))?;
        tracing::info!(path = %path.display(), "Loaded analysis config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.fft_size == Some(0) {
            return Err(ConfigError::Analysis(
                "transform size must be positive".into(),
            ));
        }
        for (name, value) in [("skip", self.skip_secs), ("fade", self.fade_secs)] {
            if let Some(secs) = value {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(ConfigError::Analysis(format!(
                        "{} must be a non-negative number of seconds, got {}",
                        name, secs
                    )));
                }
            }
        }
        self.filter.validate()
    }

    /// Effective (skip, fade) in seconds
    ///
    /// Timing input defaults to skipping 0.5 s and fading in over 1 s, which
    /// hides the start-up transient of a fresh stream. Sample input is left
    /// untouched unless asked.
    pub fn conditioning(&self) -> (f64, f64) {
        let (skip, fade) = match self.format {
            InputFormat::Timing => (0.5, 1.0),
            InputFormat::S16le | InputFormat::Text => (0.0, 0.0),
        };
        (self.skip_secs.unwrap_or(skip), self.fade_secs.unwrap_or(fade))
    }
}

/// Drop `skip_secs` of leading samples, then ramp the next `fade_secs` in
/// linearly from zero
pub fn condition(
    data: &[f64],
    sample_rate: f64,
    skip_secs: f64,
    fade_secs: f64,
) -> Result<Vec<f64>, AnalysisError> {
    let skip = (skip_secs * sample_rate).round() as usize;
    let fade = (fade_secs * sample_rate).round() as usize;
    if skip >= data.len() {
        return Err(AnalysisError::MalformedInput(format!(
            "nothing left after skipping {} of {} samples",
            skip,
            data.len()
        )));
    }

    let mut out = data[skip..].to_vec();
    if fade >= 2 {
        let denominator = (fade - 1) as f64;
        for (i, x) in out.iter_mut().take(fade).enumerate() {
            *x *= i as f64 / denominator;
        }
    }
    Ok(out)
}

/// Everything the pipeline computes for one input
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub filtered_1: Result<Vec<f64>, AnalysisError>,
    pub filtered_2: Result<Vec<f64>, AnalysisError>,
    pub spectrum: Result<Vec<SpectrumBin>, AnalysisError>,
    pub filtered_spectrum_1: Result<Vec<SpectrumBin>, AnalysisError>,
    pub filtered_spectrum_2: Result<Vec<SpectrumBin>, AnalysisError>,
}

impl AnalysisResult {
    fn failed(error: AnalysisError) -> Self {
        Self {
            filtered_1: Err(error.clone()),
            filtered_2: Err(error.clone()),
            spectrum: Err(error.clone()),
            filtered_spectrum_1: Err(error.clone()),
            filtered_spectrum_2: Err(error),
        }
    }

    pub fn error(&self, stage: Stage) -> Option<&AnalysisError> {
        match stage {
            Stage::Filtered1 => self.filtered_1.as_ref().err(),
            Stage::Filtered2 => self.filtered_2.as_ref().err(),
            Stage::Spectrum => self.spectrum.as_ref().err(),
            Stage::FilteredSpectrum1 => self.filtered_spectrum_1.as_ref().err(),
            Stage::FilteredSpectrum2 => self.filtered_spectrum_2.as_ref().err(),
        }
    }
}

/// Channels after demux and conditioning
struct Prepared {
    channels: Vec<Vec<f64>>,
    sample_rate: f64,
}

impl Prepared {
    fn channel(&self, index: usize) -> Result<&[f64], AnalysisError> {
        self.channels
            .get(index)
            .map(Vec::as_slice)
            .ok_or(AnalysisError::MissingChannel {
                channel: index + 1,
                available: self.channels.len(),
            })
    }
}

fn prepare(bytes: &[u8], config: &AnalysisConfig) -> Result<Prepared, AnalysisError> {
    config.validate()?;
    let interleaved: Interleaved = input::read(
        bytes,
        config.format,
        config.channels as usize,
        config.sample_rate as f64,
    )?;
    let (skip, fade) = config.conditioning();
    let channels = demux::demux(&interleaved)?
        .iter()
        .map(|channel| condition(channel, interleaved.sample_rate, skip, fade))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(
        channels = channels.len(),
        frames = channels.first().map_or(0, Vec::len),
        sample_rate = interleaved.sample_rate,
        "Prepared analysis input"
    );
    Ok(Prepared {
        channels,
        sample_rate: interleaved.sample_rate,
    })
}

fn filtered(
    prepared: &Prepared,
    index: usize,
    config: &AnalysisConfig,
) -> Result<Vec<f64>, AnalysisError> {
    Ok(filter::apply(&config.filter, prepared.channel(index)?)?)
}

fn filtered_spectrum(
    prepared: &Prepared,
    index: usize,
    config: &AnalysisConfig,
) -> Result<Vec<SpectrumBin>, AnalysisError> {
    let data = filtered(prepared, index, config)?;
    spectrum::spectrum(&data, prepared.sample_rate, config.fft_size, config.window)
}

fn joined<T>(
    stage: Stage,
    result: std::thread::Result<Result<T, AnalysisError>>,
) -> Result<T, AnalysisError> {
    result.unwrap_or_else(|_| {
        tracing::error!(%stage, "Analysis stage panicked");
        Err(AnalysisError::Panicked { stage })
    })
}

/// Run all five stages over a decoded capture
///
/// Input errors fail every stage. A missing second channel fails only the
/// stages that need it.
pub fn analyze(bytes: &[u8], config: &AnalysisConfig) -> AnalysisResult {
    let prepared = match prepare(bytes, config) {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::error!(error = %e, "Analysis input rejected");
            return AnalysisResult::failed(e);
        }
    };
    let prepared = &prepared;

    std::thread::scope(|s| {
        let f1 = s.spawn(move || filtered(prepared, 0, config));
        let f2 = s.spawn(move || filtered(prepared, 1, config));
        let sp = s.spawn(move || {
            spectrum::spectrum(
                prepared.channel(0)?,
                prepared.sample_rate,
                config.fft_size,
                config.window,
            )
        });
        let fs1 = s.spawn(move || filtered_spectrum(prepared, 0, config));
        let fs2 = s.spawn(move || filtered_spectrum(prepared, 1, config));

        AnalysisResult {
            filtered_1: joined(Stage::Filtered1, f1.join()),
            filtered_2: joined(Stage::Filtered2, f2.join()),
            spectrum: joined(Stage::Spectrum, sp.join()),
            filtered_spectrum_1: joined(Stage::FilteredSpectrum1, fs1.join()),
            filtered_spectrum_2: joined(Stage::FilteredSpectrum2, fs2.join()),
        }
    })
}

/// Destination file for each stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub filtered_1: PathBuf,
    pub filtered_2: PathBuf,
    pub spectrum: PathBuf,
    pub filtered_spectrum_1: PathBuf,
    pub filtered_spectrum_2: PathBuf,
}

impl OutputPaths {
    pub fn path(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Filtered1 => &self.filtered_1,
            Stage::Filtered2 => &self.filtered_2,
            Stage::Spectrum => &self.spectrum,
            Stage::FilteredSpectrum1 => &self.filtered_spectrum_1,
            Stage::FilteredSpectrum2 => &self.filtered_spectrum_2,
        }
    }
}

/// Outcome of one stage: lines written, or why nothing was
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub path: PathBuf,
    pub result: Result<usize, AnalysisError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(|s| s.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (Stage, &AnalysisError)> + '_ {
        self.stages
            .iter()
            .filter_map(|s| s.result.as_ref().err().map(|e| (s.stage, e)))
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Read `input`, run every stage and write each successful stage to its path
///
/// Only invalid settings abort the whole run. Failed stages leave no file
/// behind; their errors are in the report.
pub fn run_pipeline(
    input: &Path,
    outputs: &OutputPaths,
    config: &AnalysisConfig,
) -> Result<PipelineReport, ConfigError> {
    config.validate()?;

    let result = match std::fs::read(input) {
        Ok(bytes) => {
            tracing::info!(
                path = %input.display(),
                bytes = bytes.len(),
                format = %config.format,
                "Analyzing capture"
            );
            analyze(&bytes, config)
        }
        Err(e) => AnalysisResult::failed(AnalysisError::Read {
            path: input.display().to_string(),
            reason: e.to_string(),
        }),
    };

    let stages = Stage::ALL
        .iter()
        .map(|&stage| {
            let path = outputs.path(stage);
            let written = match stage {
                Stage::Filtered1 => output::write_series_file(path, &result.filtered_1),
                Stage::Filtered2 => output::write_series_file(path, &result.filtered_2),
                Stage::Spectrum => output::write_spectrum_file(path, &result.spectrum),
                Stage::FilteredSpectrum1 => {
                    output::write_spectrum_file(path, &result.filtered_spectrum_1)
                }
                Stage::FilteredSpectrum2 => {
                    output::write_spectrum_file(path, &result.filtered_spectrum_2)
                }
            };
            match &written {
                Ok(lines) => {
                    tracing::info!(%stage, path = %path.display(), lines, "Wrote analysis output")
                }
                Err(e) => tracing::error!(%stage, error = %e, "Analysis stage failed"),
            }
            StageReport {
                stage,
                path: path.to_path_buf(),
                result: written,
            }
        })
        .collect();

    Ok(PipelineReport { stages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn text_config(channels: u16, sample_rate: u32) -> AnalysisConfig {
        AnalysisConfig {
            format: InputFormat::Text,
            channels,
            sample_rate,
            ..Default::default()
        }
    }

    fn text_input(frames: &[[f64; 2]]) -> Vec<u8> {
        frames
            .iter()
            .map(|f| format!("{} {}\n", f[0], f[1]))
            .collect::<String>()
            .into_bytes()
    }

    #[test]
    fn test_condition_skip_and_fade() {
        let out = condition(&[1.0; 10], 2.0, 1.0, 2.0).unwrap();
        assert_eq!(out.len(), 8);
        assert_abs_diff_eq!(out[0], 0.0);
        assert_abs_diff_eq!(out[1], 1.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[3], 1.0);
        assert_abs_diff_eq!(out[7], 1.0);
    }

    #[test]
    fn test_condition_identity_by_default() {
        let data = [0.1, -0.2, 0.3];
        assert_eq!(condition(&data, 48000.0, 0.0, 0.0).unwrap(), data.to_vec());
    }

    #[test]
    fn test_condition_skip_everything() {
        assert!(matches!(
            condition(&[1.0; 4], 1.0, 4.0, 0.0),
            Err(AnalysisError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_timing_defaults_condition() {
        let config = AnalysisConfig {
            format: InputFormat::Timing,
            ..Default::default()
        };
        assert_eq!(config.conditioning(), (0.5, 1.0));
        let explicit = AnalysisConfig {
            skip_secs: Some(0.0),
            ..config
        };
        assert_eq!(explicit.conditioning(), (0.0, 1.0));
        assert_eq!(AnalysisConfig::default().conditioning(), (0.0, 0.0));
    }

    #[test]
    fn test_analyze_all_stages() {
        let frames: Vec<[f64; 2]> = (0..256).map(|i| [i as f64 * 0.001, -0.5]).collect();
        let result = analyze(&text_input(&frames), &text_config(2, 1000));
        for stage in Stage::ALL {
            assert!(result.error(stage).is_none(), "{} failed", stage);
        }
        assert_eq!(result.filtered_1.as_ref().unwrap().len(), 256);
        assert_eq!(result.spectrum.as_ref().unwrap().len(), 129);
    }

    #[test]
    fn test_empty_input_fails_every_stage() {
        let result = analyze(b"", &text_config(2, 1000));
        for stage in Stage::ALL {
            assert!(matches!(
                result.error(stage),
                Some(AnalysisError::MalformedInput(_))
            ));
        }
    }

    #[test]
    fn test_mono_input_fails_second_channel_only() {
        let result = analyze(b"0.1\n0.2\n0.3\n0.4\n", &text_config(1, 1000));
        assert!(result.filtered_1.is_ok());
        assert!(result.spectrum.is_ok());
        assert!(result.filtered_spectrum_1.is_ok());
        let missing = AnalysisError::MissingChannel {
            channel: 2,
            available: 1,
        };
        assert_eq!(result.filtered_2, Err(missing.clone()));
        assert_eq!(result.filtered_spectrum_2, Err(missing));
    }

    #[test]
    fn test_invalid_config_fails_every_stage() {
        let config = AnalysisConfig {
            fft_size: Some(0),
            ..text_config(2, 1000)
        };
        let result = analyze(b"1 2\n", &config);
        assert!(matches!(
            result.error(Stage::Spectrum),
            Some(AnalysisError::Config(ConfigError::Analysis(_)))
        ));
    }

    #[test]
    fn test_analysis_config_json_defaults() {
        let config: AnalysisConfig = serde_json::from_str(r#"{"format": "timing"}"#).unwrap();
        assert_eq!(config.format, InputFormat::Timing);
        assert_eq!(config.channels, 2);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.window, Window::Hann);
        assert_eq!(config.filter, FilterConfig::default());
    }

    #[test]
    fn test_stage_names() {
        let names: Vec<String> = Stage::ALL.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            [
                "filtered-1",
                "filtered-2",
                "spectrum",
                "filtered-spectrum-1",
                "filtered-spectrum-2"
            ]
        );
    }
}
