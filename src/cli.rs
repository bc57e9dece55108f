//! CLI command definitions using clap

use clap::{Args, Parser, Subcommand, ValueEnum};
use periodtimer::analysis::{FilterKind, InputFormat, Window};
use periodtimer::audio::simulated::{CaptureContent, Pacing};
use periodtimer::audio::{CpalBackend, PcmBackend, SimulatedBackend};
use periodtimer::config::SourceConfig;
use periodtimer::{AnalysisConfig, ConfigError, Mode, OutputPaths, RunConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "periodtimer")]
#[command(about = "Measure audio period timing and analyze captured streams")]
pub struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record one timestamp per period on a capture, playback or duplex stream
    Timing(TimingArgs),

    /// Filter and transform a capture into five output tables
    Analyze(AnalyzeArgs),

    /// List audio devices
    Devices {
        #[arg(long, value_enum, default_value_t = BackendArg::Alsa)]
        backend: BackendArg,

        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Capture,
    Playback,
    Duplex,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Capture => Mode::Capture,
            ModeArg::Playback => Mode::Playback,
            ModeArg::Duplex => Mode::Duplex,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    /// Direct ALSA PCM with exact period geometry (Linux only)
    Alsa,
    /// Host audio subsystem through cpal
    Cpal,
    /// Real-time paced stand-in; captures a 1 kHz tone
    Simulated,
}

impl BackendArg {
    pub fn create(self) -> Box<dyn PcmBackend> {
        match self {
            #[cfg(target_os = "linux")]
            BackendArg::Alsa => Box::new(periodtimer::audio::AlsaBackend::new()),
            #[cfg(not(target_os = "linux"))]
            BackendArg::Alsa => {
                tracing::warn!("ALSA is only available on Linux; using cpal");
                Box::new(CpalBackend::new())
            }
            BackendArg::Cpal => Box::new(CpalBackend::new()),
            BackendArg::Simulated => Box::new(
                SimulatedBackend::new(Pacing::RealTime).with_content(CaptureContent::Tone {
                    frequency: 1000.0,
                    amplitude: 0.5,
                }),
            ),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceArg {
    Silence,
    Tone,
    /// Looped maximum-length sequence
    Mls,
}

#[derive(Args, Debug)]
pub struct TimingArgs {
    /// Stream direction (defaults to the config file's, then capture)
    #[arg(value_enum)]
    pub mode: Option<ModeArg>,

    /// JSON run config; options given here override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Device for both directions
    #[arg(long, short)]
    pub device: Option<String>,

    #[arg(long)]
    pub capture_device: Option<String>,

    #[arg(long)]
    pub playback_device: Option<String>,

    /// Frames per period for both directions
    #[arg(long, short)]
    pub period_size: Option<u32>,

    /// Periods per buffer for both directions
    #[arg(long, short = 'n')]
    pub periods: Option<u32>,

    #[arg(long)]
    pub capture_period_size: Option<u32>,

    #[arg(long)]
    pub capture_periods: Option<u32>,

    #[arg(long)]
    pub playback_period_size: Option<u32>,

    #[arg(long)]
    pub playback_periods: Option<u32>,

    #[arg(long, short)]
    pub channels: Option<u16>,

    #[arg(long, short = 'r')]
    pub sample_rate: Option<u32>,

    /// Run length in seconds
    #[arg(long, short = 't')]
    pub duration: Option<f64>,

    /// Playback content
    #[arg(long, value_enum)]
    pub source: Option<SourceArg>,

    /// Tone frequency in Hz (with --source tone)
    #[arg(long)]
    pub tone_frequency: Option<f64>,

    /// Peak amplitude, 0.0 to 1.0 (with --source tone or mls)
    #[arg(long)]
    pub amplitude: Option<f64>,

    #[arg(long, value_enum, default_value_t = BackendArg::Alsa)]
    pub backend: BackendArg,

    /// SCHED_FIFO priority for the I/O threads
    #[arg(long)]
    pub realtime_priority: Option<i32>,

    /// Raw s16le capture output
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Timing records (stdout when omitted)
    #[arg(long)]
    pub timing: Option<PathBuf>,

    /// Playback-side timing records of a duplex run (discarded when omitted)
    #[arg(long)]
    pub playback_timing: Option<PathBuf>,

    /// Write the run summary as JSON
    #[arg(long)]
    pub summary: Option<PathBuf>,
}

impl TimingArgs {
    /// Config file (or defaults) with command line overrides applied
    pub fn resolve(&self) -> Result<RunConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };

        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(device) = &self.device {
            config.capture_device = device.clone();
            config.playback_device = device.clone();
        }
        if let Some(device) = &self.capture_device {
            config.capture_device = device.clone();
        }
        if let Some(device) = &self.playback_device {
            config.playback_device = device.clone();
        }
        if let Some(size) = self.period_size {
            config.capture_period_size = size;
            config.playback_period_size = size;
        }
        if let Some(count) = self.periods {
            config.capture_periods = count;
            config.playback_periods = count;
        }
        if let Some(size) = self.capture_period_size {
            config.capture_period_size = size;
        }
        if let Some(count) = self.capture_periods {
            config.capture_periods = count;
        }
        if let Some(size) = self.playback_period_size {
            config.playback_period_size = size;
        }
        if let Some(count) = self.playback_periods {
            config.playback_periods = count;
        }
        if let Some(channels) = self.channels {
            config.channels = channels;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(duration) = self.duration {
            config.duration = duration;
        }
        if let Some(source) = self.source {
            config.source = match source {
                SourceArg::Silence => SourceConfig::Silence,
                SourceArg::Tone => SourceConfig::tone(self.tone_frequency, self.amplitude),
                SourceArg::Mls => SourceConfig::mls(self.amplitude),
            };
        }
        if self.realtime_priority.is_some() {
            config.realtime_priority = self.realtime_priority;
        }

        config.run_duration()?;
        match config.mode {
            Mode::Capture => {
                config.capture_stream()?;
            }
            Mode::Playback => {
                config.playback_stream()?;
            }
            Mode::Duplex => {
                config.duplex()?;
            }
        }
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Capture file
    pub input: PathBuf,

    /// Filtered channel 1 (`index value` lines)
    pub filtered_1: PathBuf,

    /// Filtered channel 2 (`index value` lines)
    pub filtered_2: PathBuf,

    /// Spectrum of channel 1 (`frequency magnitude` lines)
    pub spectrum: PathBuf,

    /// Spectrum of filtered channel 1
    pub filtered_spectrum_1: PathBuf,

    /// Spectrum of filtered channel 2
    pub filtered_spectrum_2: PathBuf,

    /// JSON analysis config; options given here override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Input format: s16le, text or timing
    #[arg(long, short)]
    pub format: Option<InputFormat>,

    /// Interleaved channels in PCM and text input
    #[arg(long, short)]
    pub channels: Option<u16>,

    /// Frame rate of PCM and text input
    #[arg(long, short = 'r')]
    pub sample_rate: Option<u32>,

    /// Fixed transform length (whole input when omitted)
    #[arg(long, short = 'N')]
    pub fft_size: Option<usize>,

    /// hann or rectangular
    #[arg(long)]
    pub window: Option<Window>,

    /// lowpass or bandpass
    #[arg(long)]
    pub filter: Option<FilterKind>,

    /// Cutoff (or centre) as a fraction of the sample rate
    #[arg(long)]
    pub cutoff: Option<f64>,

    #[arg(long)]
    pub q: Option<f64>,

    /// Biquads in series
    #[arg(long)]
    pub sections: Option<u32>,

    /// Seconds dropped from the start
    #[arg(long)]
    pub skip: Option<f64>,

    /// Seconds of linear fade-in after the skip
    #[arg(long)]
    pub fade: Option<f64>,
}

impl AnalyzeArgs {
    pub fn resolve(&self) -> Result<AnalysisConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::from_file(path)?,
            None => AnalysisConfig::default(),
        };

        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(channels) = self.channels {
            config.channels = channels;
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if self.fft_size.is_some() {
            config.fft_size = self.fft_size;
        }
        if let Some(window) = self.window {
            config.window = window;
        }
        if let Some(kind) = self.filter {
            config.filter.kind = kind;
        }
        if let Some(cutoff) = self.cutoff {
            config.filter.cutoff = cutoff;
        }
        if let Some(q) = self.q {
            config.filter.q = q;
        }
        if let Some(sections) = self.sections {
            config.filter.sections = sections;
        }
        if self.skip.is_some() {
            config.skip_secs = self.skip;
        }
        if self.fade.is_some() {
            config.fade_secs = self.fade;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn outputs(&self) -> OutputPaths {
        OutputPaths {
            filtered_1: self.filtered_1.clone(),
            filtered_2: self.filtered_2.clone(),
            spectrum: self.spectrum.clone(),
            filtered_spectrum_1: self.filtered_spectrum_1.clone(),
            filtered_spectrum_2: self.filtered_spectrum_2.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(args: &[&str]) -> TimingArgs {
        let cli = Cli::try_parse_from([&["periodtimer", "timing"][..], args].concat()).unwrap();
        match cli.command {
            Commands::Timing(args) => args,
            other => panic!("unexpected command: {:?}", other),
        }
    }

    fn analyze(args: &[&str]) -> AnalyzeArgs {
        let base = ["periodtimer", "analyze", "in.raw", "f1", "f2", "sp", "fs1", "fs2"];
        let cli = Cli::try_parse_from([&base[..], args].concat()).unwrap();
        match cli.command {
            Commands::Analyze(args) => args,
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_timing_defaults() {
        let config = timing(&[]).resolve().unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn test_backend_defaults_to_alsa() {
        assert_eq!(timing(&[]).backend, BackendArg::Alsa);
        assert_eq!(timing(&["--backend", "cpal"]).backend, BackendArg::Cpal);
        assert_eq!(BackendArg::Simulated.create().name(), "simulated");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_alsa_backend_is_direct() {
        assert_eq!(BackendArg::Alsa.create().name(), "alsa");
    }

    #[test]
    fn test_timing_overrides() {
        let config = timing(&[
            "duplex", "-d", "hw:1", "-p", "256", "-n", "4", "-r", "44100", "-t", "300",
            "--playback-periods", "3", "--source", "tone",
        ])
        .resolve()
        .unwrap();
        assert_eq!(config.mode, Mode::Duplex);
        assert_eq!(config.capture_device, "hw:1");
        assert_eq!(config.playback_device, "hw:1");
        assert_eq!(config.capture_period_size, 256);
        assert_eq!(config.capture_periods, 4);
        assert_eq!(config.playback_periods, 3);
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.duration, 300.0);
        assert_eq!(config.source, SourceConfig::tone(None, None));
    }

    #[test]
    fn test_timing_invalid_geometry_rejected() {
        assert_eq!(
            timing(&["-n", "1"]).resolve(),
            Err(ConfigError::TooFewPeriods(1))
        );
        assert_eq!(
            timing(&["-t", "0"]).resolve(),
            Err(ConfigError::InvalidDuration(0.0))
        );
        assert_eq!(
            timing(&["-t", "1e20"]).resolve(),
            Err(ConfigError::InvalidDuration(1e20))
        );
    }

    #[test]
    fn test_analyze_overrides() {
        let args = analyze(&[
            "--format", "timing", "-N", "4096", "--window", "rectangular", "--filter",
            "bandpass", "--cutoff", "0.1", "--sections", "2",
        ]);
        let config = args.resolve().unwrap();
        assert_eq!(config.format, InputFormat::Timing);
        assert_eq!(config.fft_size, Some(4096));
        assert_eq!(config.window, Window::Rectangular);
        assert_eq!(config.filter.kind, FilterKind::BandPass);
        assert_eq!(config.filter.sections, 2);
        assert_eq!(args.outputs().spectrum, PathBuf::from("sp"));
    }

    #[test]
    fn test_analyze_rejects_bad_values() {
        assert!(Cli::try_parse_from([
            "periodtimer", "analyze", "in", "a", "b", "c", "d", "e", "--window", "kaiser",
        ])
        .is_err());
        assert!(matches!(
            analyze(&["--cutoff", "0.7"]).resolve(),
            Err(ConfigError::Analysis(_))
        ));
    }
}
