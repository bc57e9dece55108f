//! Direct ALSA PCM backend
//!
//! Opens the PCM in blocking mode and sets period size and period count as
//! hardware parameters, then reads back what the driver actually applied.
//! One `readi`/`writei` call moves one period, so no ring buffer is needed
//! between the device and the recorder.
//!
//! Device timestamps come from the PCM status (`audio_htstamp`) with
//! timestamping enabled in the software parameters.

use super::device::{
    DeviceError, DeviceInfo, Direction, PcmBackend, PcmStream, PeriodError, XrunKind,
};
use crate::config::StreamConfig;
use alsa::device_name::HintIter;
use alsa::pcm::{Access, Format, Frames, HwParams, State, PCM};
use alsa::ValueOr;
use std::time::Duration;

/// Rates checked for device listings
const COMMON_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// ALSA PCM devices, addressed by ALSA name (`default`, `hw:1,0`, ...)
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaBackend;

impl AlsaBackend {
    pub fn new() -> Self {
        Self
    }
}

fn alsa_direction(direction: Direction) -> alsa::Direction {
    match direction {
        Direction::Capture => alsa::Direction::Capture,
        Direction::Playback => alsa::Direction::Playback,
    }
}

/// `timespec` fields as a duration; negative parts read as zero
fn timespec_duration(secs: i64, nanos: i64) -> Duration {
    let secs = u64::try_from(secs).unwrap_or(0);
    let nanos = u32::try_from(nanos).unwrap_or(0).min(999_999_999);
    Duration::new(secs, nanos)
}

/// Geometry the driver settled on, read back after `hw_params`
fn negotiated(pcm: &PCM, device: &str) -> Result<StreamConfig, DeviceError> {
    let unsupported = |e: alsa::Error| DeviceError::UnsupportedGeometry {
        device: device.to_string(),
        reason: e.to_string(),
    };
    let hwp = pcm.hw_params_current().map_err(unsupported)?;
    let period = hwp.get_period_size().map_err(unsupported)?;
    let buffer = hwp.get_buffer_size().map_err(unsupported)?;
    let rate = hwp.get_rate().map_err(unsupported)?;
    let channels = hwp.get_channels().map_err(unsupported)?;

    if period <= 0 || buffer < period {
        return Err(DeviceError::UnsupportedGeometry {
            device: device.to_string(),
            reason: format!("driver reported period {} / buffer {}", period, buffer),
        });
    }
    Ok(StreamConfig {
        sample_rate: rate,
        channels: channels as u16,
        period_size: period as u32,
        period_count: (buffer / period) as u32,
    })
}

fn configure(
    pcm: &PCM,
    device: &str,
    direction: Direction,
    config: &StreamConfig,
) -> Result<StreamConfig, DeviceError> {
    let unsupported = |what: &str, e: alsa::Error| DeviceError::UnsupportedGeometry {
        device: device.to_string(),
        reason: format!("{}: {}", what, e),
    };

    {
        let hwp = HwParams::any(pcm).map_err(|e| unsupported("hw params", e))?;
        hwp.set_channels(config.channels as u32)
            .map_err(|e| unsupported("channels", e))?;
        hwp.set_rate(config.sample_rate, ValueOr::Nearest)
            .map_err(|e| unsupported("sample rate", e))?;
        hwp.set_format(Format::s16())
            .map_err(|e| unsupported("format S16", e))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| unsupported("interleaved access", e))?;
        hwp.set_period_size(config.period_size as Frames, ValueOr::Nearest)
            .map_err(|e| unsupported("period size", e))?;
        hwp.set_periods(config.period_count, ValueOr::Nearest)
            .map_err(|e| unsupported("period count", e))?;
        pcm.hw_params(&hwp)
            .map_err(|e| unsupported("apply hw params", e))?;
    }

    let applied = negotiated(pcm, device)?;
    if applied.sample_rate != config.sample_rate || applied.channels != config.channels {
        return Err(DeviceError::UnsupportedGeometry {
            device: device.to_string(),
            reason: format!(
                "requested {} Hz x {} channels, device runs {} Hz x {}",
                config.sample_rate, config.channels, applied.sample_rate, applied.channels
            ),
        });
    }
    if applied.period_size != config.period_size || applied.period_count != config.period_count {
        tracing::warn!(
            device,
            %direction,
            requested_period = config.period_size,
            requested_periods = config.period_count,
            period = applied.period_size,
            periods = applied.period_count,
            "Driver adjusted period geometry"
        );
    }

    let swp = pcm
        .sw_params_current()
        .map_err(|e| unsupported("sw params", e))?;
    swp.set_tstamp_mode(true)
        .map_err(|e| unsupported("timestamp mode", e))?;
    if direction == Direction::Playback {
        // Start once all but one period is queued
        let threshold = (applied.buffer_size() - applied.period_size as u64) as Frames;
        swp.set_start_threshold(threshold)
            .map_err(|e| unsupported("start threshold", e))?;
    }
    pcm.sw_params(&swp)
        .map_err(|e| unsupported("apply sw params", e))?;

    Ok(applied)
}

impl PcmBackend for AlsaBackend {
    fn name(&self) -> &'static str {
        "alsa"
    }

    fn open(
        &self,
        device: &str,
        direction: Direction,
        config: &StreamConfig,
    ) -> Result<Box<dyn PcmStream>, DeviceError> {
        let pcm = PCM::new(device, alsa_direction(direction), false).map_err(|e| {
            DeviceError::Open {
                device: device.to_string(),
                reason: e.to_string(),
            }
        })?;
        let applied = configure(&pcm, device, direction, config)?;
        tracing::debug!(
            device,
            %direction,
            sample_rate = applied.sample_rate,
            channels = applied.channels,
            period_size = applied.period_size,
            period_count = applied.period_count,
            buffer_size = applied.buffer_size(),
            "Hardware parameters applied"
        );
        Ok(Box::new(AlsaStream {
            pcm,
            device: device.to_string(),
            direction,
            config: applied,
            origin: None,
            device_time: None,
            stopped: false,
        }))
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let hints = HintIter::new_str(None, "pcm")
            .map_err(|e| DeviceError::HostUnavailable(e.to_string()))?;

        let mut infos = Vec::new();
        for hint in hints {
            let Some(name) = hint.name else {
                continue;
            };
            // `None` means both directions
            let capture = hint.direction != Some(alsa::Direction::Playback);
            let playback = hint.direction != Some(alsa::Direction::Capture);

            let mut info = DeviceInfo {
                is_default: name == "default",
                name,
                input_channels: 0,
                output_channels: 0,
                sample_rates: Vec::new(),
                buffer_frames: None,
            };
            if capture {
                fill_ranges(&mut info, Direction::Capture);
            }
            if playback {
                fill_ranges(&mut info, Direction::Playback);
            }
            infos.push(info);
        }
        Ok(infos)
    }
}

/// Fill in channel, rate and buffer limits; devices that are busy or
/// refuse to open are listed without them
fn fill_ranges(info: &mut DeviceInfo, direction: Direction) {
    let Ok(pcm) = PCM::new(&info.name, alsa_direction(direction), true) else {
        return;
    };
    let Ok(hwp) = HwParams::any(&pcm) else {
        return;
    };

    let channels = hwp.get_channels_max().unwrap_or(0).min(u16::MAX as u32) as u16;
    match direction {
        Direction::Capture => info.input_channels = channels,
        Direction::Playback => info.output_channels = channels,
    }

    if let (Ok(min), Ok(max)) = (hwp.get_rate_min(), hwp.get_rate_max()) {
        for rate in COMMON_RATES {
            if (min..=max).contains(&rate) && !info.sample_rates.contains(&rate) {
                info.sample_rates.push(rate);
            }
        }
        info.sample_rates.sort_unstable();
    }

    if let (Ok(min), Ok(max)) = (hwp.get_buffer_size_min(), hwp.get_buffer_size_max()) {
        let clamp = |frames: Frames| u32::try_from(frames.max(0)).unwrap_or(u32::MAX);
        info.buffer_frames.get_or_insert((clamp(min), clamp(max)));
    }
}

/// An open ALSA PCM driven one period per call
pub struct AlsaStream {
    pcm: PCM,
    device: String,
    direction: Direction,
    config: StreamConfig,
    /// `audio_htstamp` of the first completed period
    origin: Option<Duration>,
    device_time: Option<Duration>,
    stopped: bool,
}

impl AlsaStream {
    fn stream_error(&self, e: alsa::Error) -> DeviceError {
        DeviceError::Stream {
            device: self.device.clone(),
            reason: e.to_string(),
        }
    }

    /// Queue silence up to the start threshold
    fn prime(&self) -> Result<(), DeviceError> {
        let io = self.pcm.io_i16().map_err(|e| self.stream_error(e))?;
        let silence = vec![0i16; self.config.period_samples()];
        for _ in 1..self.config.period_count {
            io.writei(&silence).map_err(|e| self.stream_error(e))?;
        }
        Ok(())
    }

    /// Classify a failed transfer and recover from xruns
    fn recover(&self, e: alsa::Error) -> PeriodError {
        let kind = XrunKind::for_direction(self.direction);
        match self.pcm.state() {
            State::Disconnected => {
                return PeriodError::Fatal(DeviceError::Disconnected(self.device.clone()))
            }
            State::XRun | State::Suspended => {}
            _ => return PeriodError::Fatal(self.stream_error(e)),
        }

        let restarted = self.pcm.try_recover(e, true).and_then(|()| match self.direction {
            Direction::Capture => self.pcm.start(),
            Direction::Playback => Ok(()),
        });
        if let Err(e) = restarted {
            tracing::error!(device = %self.device, %kind, "Xrun recovery failed: {}", e);
            return PeriodError::Fatal(DeviceError::Unrecoverable {
                device: self.device.clone(),
                kind,
            });
        }
        if self.direction == Direction::Playback {
            if let Err(e) = self.prime() {
                return PeriodError::Fatal(e);
            }
        }
        PeriodError::Xrun(kind)
    }

    /// Record the device clock for the period that just completed
    fn stamp(&mut self) {
        let Ok(status) = self.pcm.status() else {
            self.device_time = None;
            return;
        };
        let ts = status.get_audio_htstamp();
        let audio = timespec_duration(i64::from(ts.tv_sec), i64::from(ts.tv_nsec));
        let origin = *self.origin.get_or_insert(audio);
        self.device_time = Some(audio.saturating_sub(origin));
    }
}

impl PcmStream for AlsaStream {
    fn config(&self) -> StreamConfig {
        self.config
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        match self.direction {
            Direction::Capture => self.pcm.start().map_err(|e| self.stream_error(e))?,
            Direction::Playback => self.prime()?,
        }
        tracing::debug!(device = %self.device, direction = %self.direction, "PCM started");
        Ok(())
    }

    fn read_period(&mut self, block: &mut [i16]) -> Result<(), PeriodError> {
        let channels = self.config.channels as usize;
        let mut done = 0;
        {
            let io = self
                .pcm
                .io_i16()
                .map_err(|e| PeriodError::Fatal(self.stream_error(e)))?;
            while done < block.len() {
                match io.readi(&mut block[done..]) {
                    Ok(frames) => done += frames * channels,
                    Err(e) => return Err(self.recover(e)),
                }
            }
        }
        self.stamp();
        Ok(())
    }

    fn write_period(&mut self, block: &[i16]) -> Result<(), PeriodError> {
        let channels = self.config.channels as usize;
        let mut done = 0;
        {
            let io = self
                .pcm
                .io_i16()
                .map_err(|e| PeriodError::Fatal(self.stream_error(e)))?;
            while done < block.len() {
                match io.writei(&block[done..]) {
                    Ok(frames) => done += frames * channels,
                    Err(e) => return Err(self.recover(e)),
                }
            }
        }
        self.stamp();
        Ok(())
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(e) = self.pcm.drop() {
            tracing::debug!(device = %self.device, "PCM drop failed: {}", e);
        }
        tracing::debug!(device = %self.device, direction = %self.direction, "PCM stopped");
    }

    fn device_time(&self) -> Option<Duration> {
        self.device_time
    }
}

impl Drop for AlsaStream {
    fn drop(&mut self) {
        self.stop();
    }
}
