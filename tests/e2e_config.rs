//! E2E tests for run and analysis configuration files

use periodtimer::analysis::{FilterKind, InputFormat, Window};
use periodtimer::config::SourceConfig;
use periodtimer::{AnalysisConfig, ConfigError, Mode, RunConfig, StreamConfig};
use std::io::Write;
use std::time::Duration;

fn write_json(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// Test that buffer size is always period size times period count
#[test]
fn test_buffer_size_property() {
    for period in [1u32, 64, 128, 256, 441, 480, 1024, 4096] {
        for count in 2u32..=8 {
            let config = StreamConfig::new(48000, 2, period, count).unwrap();
            assert_eq!(config.buffer_size(), period as u64 * count as u64);
            assert_eq!(
                config.buffer_samples(),
                period as usize * count as usize * 2
            );
        }
    }
}

/// Test that a partial run config file keeps defaults for missing fields
#[test]
fn test_run_config_file() {
    let file = write_json(
        r#"{
            "capture_device": "hw:1,0",
            "mode": "duplex",
            "playback_period_size": 512,
            "playback_periods": 3,
            "duration": 300,
            "source": {"kind": "tone", "frequency": 440}
        }"#,
    );
    let config = RunConfig::from_file(file.path()).unwrap();

    assert_eq!(config.capture_device, "hw:1,0");
    assert_eq!(config.playback_device, "default");
    assert_eq!(config.mode, Mode::Duplex);
    assert_eq!(config.sample_rate, 48000);
    assert_eq!(config.channels, 2);
    assert_eq!(config.run_duration().unwrap(), Duration::from_secs(300));
    assert_eq!(config.source, SourceConfig::tone(Some(440.0), None));

    let duplex = config.duplex().unwrap();
    assert_eq!(duplex.capture.buffer_size(), 256);
    assert_eq!(duplex.playback.buffer_size(), 1536);
}

/// Test that unreadable and malformed files are config errors
#[test]
fn test_bad_config_files() {
    let missing = RunConfig::from_file(std::path::Path::new("/nonexistent/periodtimer.json"));
    assert!(matches!(missing, Err(ConfigError::Load { .. })));

    let garbage = write_json("{ not json");
    assert!(matches!(
        RunConfig::from_file(garbage.path()),
        Err(ConfigError::Load { .. })
    ));
}

/// Test that the analysis config file round-trips through serde with defaults
#[test]
fn test_analysis_config_file() {
    let file = write_json(
        r#"{
            "format": "text",
            "channels": 1,
            "window": "rectangular",
            "fft_size": 1024,
            "filter": {"kind": "bandpass", "cutoff": 0.1},
            "skip_secs": 0.25
        }"#,
    );
    let config = AnalysisConfig::from_file(file.path()).unwrap();

    assert_eq!(config.format, InputFormat::Text);
    assert_eq!(config.channels, 1);
    assert_eq!(config.window, Window::Rectangular);
    assert_eq!(config.fft_size, Some(1024));
    assert_eq!(config.filter.kind, FilterKind::BandPass);
    assert_eq!(config.filter.sections, 1);
    assert_eq!(config.conditioning(), (0.25, 0.0));
    assert!(config.validate().is_ok());
}

/// Test that invalid analysis settings are rejected
#[test]
fn test_invalid_analysis_settings() {
    let negative_skip = AnalysisConfig {
        skip_secs: Some(-1.0),
        ..Default::default()
    };
    assert!(matches!(
        negative_skip.validate(),
        Err(ConfigError::Analysis(_))
    ));

    let no_channels = AnalysisConfig {
        channels: 0,
        ..Default::default()
    };
    assert_eq!(no_channels.validate(), Err(ConfigError::ZeroChannels));
}
