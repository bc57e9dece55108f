//! Periodtimer - audio period timing measurement
//!
//! Entry point for the command line tool. Timing records and listings go to
//! stdout; logs go to stderr.

mod cli;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, FromArgMatches};
use cli::{AnalyzeArgs, BackendArg, Cli, Commands, TimingArgs};
use periodtimer::audio::record::NullSink;
use periodtimer::audio::{
    Direction, PeriodIo, PlaybackSource, RawSampleWriter, SampleSink, TimingWriter,
};
use periodtimer::{
    run_pipeline, ConfigError, DuplexRunner, Mode, PeriodRecorder, Session, StopSignal,
};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let version = format!("{} (built {})", periodtimer::VERSION, periodtimer::BUILD_DATE);
    let matches = Cli::command().version(version).get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            if is_config_error(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("periodtimer={level},periodtimer_core={level}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn is_config_error(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| cause.downcast_ref::<ConfigError>().is_some())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Timing(args) => run_timing(&args),
        Commands::Analyze(args) => run_analyze(&args),
        Commands::Devices { backend, json } => list_devices(backend, json),
    }
}

/// Text sink for timing records
fn text_output(path: Option<&Path>, default: Box<dyn Write + Send>) -> Result<Box<dyn Write + Send>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(default),
    }
}

fn raw_output(path: Option<&Path>) -> Result<Box<dyn SampleSink>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Ok(Box::new(RawSampleWriter::new(BufWriter::new(file))))
        }
        None => Ok(Box::new(NullSink)),
    }
}

fn write_summary<T: serde::Serialize>(path: Option<&Path>, summary: &T) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json + "\n")
        .with_context(|| format!("Failed to write summary {}", path.display()))?;
    info!(path = %path.display(), "Wrote run summary");
    Ok(())
}

fn run_timing(args: &TimingArgs) -> Result<()> {
    // Everything that can be rejected is rejected before a device opens
    let config = args.resolve().context("Invalid timing configuration")?;
    let duration = config.run_duration()?;
    let mut source = PlaybackSource::from_config(&config.source, config.sample_rate)
        .context("Invalid playback source")?;

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        info!("Stop requested");
        handler_stop.raise();
    })
    .context("Failed to install Ctrl+C handler")?;

    let backend = args.backend.create();
    let mut records = TimingWriter::new(text_output(
        args.timing.as_deref(),
        Box::new(io::stdout()),
    )?);
    let mut raw = raw_output(args.output.as_deref())?;

    match config.mode {
        Mode::Capture | Mode::Playback => {
            let (direction, device, stream) = if config.mode == Mode::Capture {
                (
                    Direction::Capture,
                    &config.capture_device,
                    config.capture_stream()?,
                )
            } else {
                (
                    Direction::Playback,
                    &config.playback_device,
                    config.playback_stream()?,
                )
            };

            let mut session = Session::open(backend.as_ref(), device, direction, stream)
                .with_context(|| format!("Failed to open {} device {}", direction, device))?;
            let recorder = PeriodRecorder::new(duration)
                .with_stop(stop)
                .with_realtime_priority(config.realtime_priority);
            let io = match direction {
                Direction::Capture => PeriodIo::Capture(raw.as_mut()),
                Direction::Playback => PeriodIo::Playback(&mut source),
            };

            let outcome = recorder.run(&mut session, io, &mut records);
            let summary = match &outcome {
                Ok(summary) => summary,
                Err(e) => e.summary(),
            };
            write_summary(args.summary.as_deref(), summary)?;
            if summary.xruns() > 0 {
                warn!(
                    underruns = summary.underruns,
                    overruns = summary.overruns,
                    "Run had xruns"
                );
            }
            outcome.with_context(|| format!("{} run on {} failed", direction, device))?;
        }
        Mode::Duplex => {
            let runner = DuplexRunner::new(
                config.duplex()?,
                &config.capture_device,
                &config.playback_device,
                duration,
            )
            .with_stop(stop)
            .with_realtime_priority(config.realtime_priority);
            let mut playback_records = TimingWriter::new(text_output(
                args.playback_timing.as_deref(),
                Box::new(io::sink()),
            )?);

            let outcome = runner.run(
                backend.as_ref(),
                &mut source,
                raw.as_mut(),
                &mut records,
                &mut playback_records,
            );
            let summary = match &outcome {
                Ok(summary) => Some(summary),
                Err(e) => e.summary(),
            };
            if let Some(summary) = summary {
                write_summary(args.summary.as_deref(), summary)?;
            }
            outcome.context("Duplex run failed")?;
        }
    }
    Ok(())
}

fn run_analyze(args: &AnalyzeArgs) -> Result<()> {
    let config = args.resolve().context("Invalid analysis configuration")?;
    let report = run_pipeline(&args.input, &args.outputs(), &config)?;

    let failures: Vec<String> = report
        .failures()
        .map(|(stage, e)| format!("{}: {}", stage, e))
        .collect();
    if !failures.is_empty() {
        bail!(
            "{} of {} analysis stages failed: {}",
            failures.len(),
            report.stages.len(),
            failures.join("; ")
        );
    }
    Ok(())
}

fn list_devices(backend: BackendArg, json: bool) -> Result<()> {
    let backend = backend.create();
    let devices = backend
        .list_devices()
        .with_context(|| format!("Failed to list {} devices", backend.name()))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &devices)?;
        writeln!(out)?;
        return Ok(());
    }

    if devices.is_empty() {
        writeln!(out, "No audio devices found")?;
        return Ok(());
    }
    for device in &devices {
        let rates: Vec<String> = device.sample_rates.iter().map(u32::to_string).collect();
        let buffer = device
            .buffer_frames
            .map(|(min, max)| format!("{}..{}", min, max))
            .unwrap_or_else(|| "unknown".to_string());
        writeln!(
            out,
            "{}{}  in={} out={} rates={} buffer={}",
            device.name,
            if device.is_default { " (default)" } else { "" },
            device.input_channels,
            device.output_channels,
            rates.join(","),
            buffer
        )?;
    }
    Ok(())
}
