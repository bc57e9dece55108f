//! E2E tests for the offline analysis pipeline
//!
//! Runs the full read-analyze-write path against files in a temp directory.

use approx::assert_abs_diff_eq;
use periodtimer::analysis::{AnalysisError, InputFormat, Window};
use periodtimer::audio::record::NullSink;
use periodtimer::audio::simulated::Fault;
use periodtimer::audio::{Direction, Pacing, PeriodIo, SimulatedBackend, TimingWriter};
use periodtimer::{
    run_pipeline, AnalysisConfig, OutputPaths, PeriodRecorder, Session, Stage, StreamConfig,
};
use std::path::Path;
use std::time::Duration;

fn outputs(dir: &Path) -> OutputPaths {
    OutputPaths {
        filtered_1: dir.join("filtered-1.txt"),
        filtered_2: dir.join("filtered-2.txt"),
        spectrum: dir.join("spectrum.txt"),
        filtered_spectrum_1: dir.join("filtered-spectrum-1.txt"),
        filtered_spectrum_2: dir.join("filtered-spectrum-2.txt"),
    }
}

/// Interleaved stereo s16le: a tone on channel 1, a quieter one on channel 2
fn stereo_tone(frequency: f64, rate: f64, frames: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frames * 4);
    for i in 0..frames {
        let phase = std::f64::consts::TAU * frequency * i as f64 / rate;
        let left = (phase.sin() * 0.5 * 32767.0).round() as i16;
        let right = (phase.sin() * 0.25 * 32767.0).round() as i16;
        bytes.extend_from_slice(&left.to_le_bytes());
        bytes.extend_from_slice(&right.to_le_bytes());
    }
    bytes
}

fn read_table(path: &Path) -> Vec<(f64, f64)> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let mut fields = line.split_whitespace();
            let a = fields.next().unwrap().parse().unwrap();
            let b = fields.next().unwrap().parse().unwrap();
            assert!(fields.next().is_none());
            (a, b)
        })
        .collect()
}

/// Test that a 1 kHz tone at 48 kHz with N = 4096 peaks in bin 85
#[test]
fn test_tone_spectrum_peak() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.raw");
    std::fs::write(&input, stereo_tone(1000.0, 48000.0, 8192)).unwrap();

    let config = AnalysisConfig {
        fft_size: Some(4096),
        ..Default::default()
    };
    let paths = outputs(dir.path());
    let report = run_pipeline(&input, &paths, &config).unwrap();
    assert!(report.is_success(), "{:?}", report);

    let spectrum = read_table(&paths.spectrum);
    assert_eq!(spectrum.len(), 2049);
    let (peak, _) = spectrum
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1))
        .unwrap();
    assert_eq!(peak, 85);
    let bin_width = 48000.0 / 4096.0;
    assert!((spectrum[peak].0 - 1000.0).abs() <= bin_width);

    // Filtered channels keep the input length
    assert_eq!(read_table(&paths.filtered_1).len(), 8192);
    let filtered_2 = read_table(&paths.filtered_2);
    assert_eq!(filtered_2.len(), 8192);
    assert_eq!(filtered_2[8191].0, 8191.0);
}

/// Test that the default low-pass keeps a tone below cutoff in both channels
#[test]
fn test_filtered_spectra_follow_channels() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.raw");
    // 480 Hz sits well under the default cutoff of 0.05 * 48 kHz
    std::fs::write(&input, stereo_tone(480.0, 48000.0, 4800)).unwrap();

    let config = AnalysisConfig {
        window: Window::Rectangular,
        ..Default::default()
    };
    let paths = outputs(dir.path());
    run_pipeline(&input, &paths, &config).unwrap();

    // 4800 samples at 48 kHz: 10 Hz bins, 480 Hz is bin 48
    let fs1 = read_table(&paths.filtered_spectrum_1);
    let fs2 = read_table(&paths.filtered_spectrum_2);
    assert_eq!(fs1.len(), 2401);
    assert_abs_diff_eq!(fs1[48].0, 480.0, epsilon = 1e-9);
    assert!(fs1[48].1 > 0.4);
    assert!(fs2[48].1 > 0.2 && fs2[48].1 < fs1[48].1);
}

/// Test that an empty capture fails every stage and writes no files
#[test]
fn test_empty_capture_fails_every_stage() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("empty.raw");
    std::fs::write(&input, b"").unwrap();

    let paths = outputs(dir.path());
    let report = run_pipeline(&input, &paths, &AnalysisConfig::default()).unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failures().count(), 5);
    for stage in Stage::ALL {
        let stage_report = report.stage(stage).unwrap();
        assert!(matches!(
            stage_report.result,
            Err(AnalysisError::MalformedInput(_))
        ));
        assert!(!paths.path(stage).exists(), "{} was written", stage);
    }
}

/// Test that a truncated frame is malformed input
#[test]
fn test_trailing_partial_frame_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("partial.raw");
    let mut bytes = stereo_tone(1000.0, 48000.0, 16);
    bytes.extend_from_slice(&[0x01, 0x00]);
    std::fs::write(&input, bytes).unwrap();

    let report = run_pipeline(&input, &outputs(dir.path()), &AnalysisConfig::default()).unwrap();
    assert_eq!(report.failures().count(), 5);
}

/// Test that a mono capture only fails the stages that need channel 2
#[test]
fn test_mono_capture_is_stage_local_failure() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("mono.raw");
    let mono: Vec<u8> = (0..2048i16).flat_map(|i| (i % 64).to_le_bytes()).collect();
    std::fs::write(&input, mono).unwrap();

    let config = AnalysisConfig {
        channels: 1,
        ..Default::default()
    };
    let paths = outputs(dir.path());
    let report = run_pipeline(&input, &paths, &config).unwrap();

    let failed: Vec<Stage> = report.failures().map(|(stage, _)| stage).collect();
    assert_eq!(failed, [Stage::Filtered2, Stage::FilteredSpectrum2]);
    assert!(paths.filtered_1.exists());
    assert!(paths.spectrum.exists());
    assert!(paths.filtered_spectrum_1.exists());
    assert!(!paths.filtered_2.exists());
    assert!(!paths.filtered_spectrum_2.exists());
}

/// Test that identical input gives byte-identical output files
#[test]
fn test_outputs_are_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("capture.raw");
    std::fs::write(&input, stereo_tone(2500.0, 48000.0, 3000)).unwrap();
    let config = AnalysisConfig {
        fft_size: Some(2048),
        ..Default::default()
    };

    let first = dir.path().join("first");
    let second = dir.path().join("second");
    std::fs::create_dir(&first).unwrap();
    std::fs::create_dir(&second).unwrap();
    run_pipeline(&input, &outputs(&first), &config).unwrap();
    run_pipeline(&input, &outputs(&second), &config).unwrap();

    for stage in Stage::ALL {
        let a = std::fs::read(outputs(&first).path(stage)).unwrap();
        let b = std::fs::read(outputs(&second).path(stage)).unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b, "{} differs between runs", stage);
    }
}

/// Test that a missing input file fails every stage with a read error
#[test]
fn test_missing_input_file() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_pipeline(
        &dir.path().join("absent.raw"),
        &outputs(dir.path()),
        &AnalysisConfig::default(),
    )
    .unwrap();
    assert!(report
        .failures()
        .all(|(_, e)| matches!(e, AnalysisError::Read { .. })));
    assert_eq!(report.failures().count(), 5);
}

/// Test that the recorder's timing output feeds straight into the pipeline
#[test]
fn test_timing_records_analyze() {
    let backend = SimulatedBackend::new(Pacing::FreeRunning);
    let config = StreamConfig::new(48000, 2, 480, 2).unwrap();
    let mut session =
        Session::open(&backend, "e2e-analysis-timing", Direction::Capture, config).unwrap();
    let mut records = TimingWriter::new(Vec::new());
    PeriodRecorder::new(Duration::from_secs(4))
        .run(&mut session, PeriodIo::Capture(&mut NullSink), &mut records)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("timing.txt");
    std::fs::write(&input, records.into_inner()).unwrap();

    let analysis = AnalysisConfig {
        format: InputFormat::Timing,
        ..Default::default()
    };
    let paths = outputs(dir.path());
    let report = run_pipeline(&input, &paths, &analysis).unwrap();
    assert!(report.is_success(), "{:?}", report);

    // 400 periods at 100 Hz, less the default 0.5 s skip
    let filtered = read_table(&paths.filtered_2);
    assert_eq!(filtered.len(), 350);
    let spectrum = read_table(&paths.spectrum);
    assert_eq!(spectrum.len(), 176);
    assert_abs_diff_eq!(spectrum[175].0, 50.0, epsilon = 1e-6);
}

/// Test that a period lost to an xrun keeps the analyzed series uniform
#[test]
fn test_timing_records_with_xrun_analyze() {
    let backend = SimulatedBackend::new(Pacing::FreeRunning)
        .with_fault(Fault::xrun(Direction::Capture, 100));
    let config = StreamConfig::new(48000, 2, 480, 2).unwrap();
    let mut session =
        Session::open(&backend, "e2e-analysis-xrun", Direction::Capture, config).unwrap();
    let mut records = TimingWriter::new(Vec::new());
    let summary = PeriodRecorder::new(Duration::from_secs(4))
        .run(&mut session, PeriodIo::Capture(&mut NullSink), &mut records)
        .unwrap();
    assert_eq!(summary.overruns, 1);

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("timing.txt");
    let text = records.into_inner();
    assert!(String::from_utf8_lossy(&text).contains("# xrun 100 overrun"));
    std::fs::write(&input, text).unwrap();

    let analysis = AnalysisConfig {
        format: InputFormat::Timing,
        ..Default::default()
    };
    let paths = outputs(dir.path());
    let report = run_pipeline(&input, &paths, &analysis).unwrap();
    assert!(report.is_success(), "{:?}", report);

    // Period 100 is held, so the series still spans 400 periods
    assert_eq!(read_table(&paths.filtered_2).len(), 350);
    let spectrum = read_table(&paths.spectrum);
    assert_eq!(spectrum.len(), 176);
    assert_abs_diff_eq!(spectrum[175].0, 50.0, epsilon = 1e-6);
}
