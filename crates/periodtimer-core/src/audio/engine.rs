//! cpal audio engine
//!
//! Bridges cpal's callback-driven streams into blocking period I/O:
//! - Each stream gets a ring buffer holding exactly one device buffer
//!   (`period_size * period_count` frames)
//! - The capture callback pushes whole frames; no room left = overrun
//! - The playback callback pops and zero-fills; starvation = underrun
//! - Every callback sends a tick that wakes the blocked reader/writer
//!
//! `cpal::Stream` is not `Send`, so each stream lives on a holder thread
//! commanded over a channel. The period I/O side only touches the ring
//! buffer halves and atomics.
//!
//! cpal exposes a single `BufferSize::Fixed` figure. Its ALSA host takes it
//! as the whole hardware buffer and splits it into four periods, so on
//! Linux only `period_count == 4` can be honoured here; other counts need
//! the direct ALSA backend. Other hosts take the figure as the callback
//! period.
//!
//! Device timestamps are the callbacks' capture/playback instants,
//! measured from the first callback.

use super::device::{
    DeviceError, DeviceInfo, Direction, PcmBackend, PcmStream, PeriodError, XrunKind,
};
use crate::config::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, SampleFormat, SampleRate, SupportedBufferSize};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Common sample rates checked for device listings
const COMMON_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// Grace added to the buffer duration before a blocked call gives up
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Periods per buffer cpal's ALSA host configures
#[cfg(target_os = "linux")]
pub const ALSA_HOST_PERIODS: u32 = 4;

/// Stored in the device clock before the first callback
const NO_DEVICE_TIME: u64 = u64::MAX;

/// The `BufferSize::Fixed` value that yields `config` on this host
fn fixed_frames(device: &str, config: &StreamConfig) -> Result<u32, DeviceError> {
    #[cfg(target_os = "linux")]
    {
        if config.period_count != ALSA_HOST_PERIODS {
            return Err(DeviceError::UnsupportedGeometry {
                device: device.to_string(),
                reason: format!(
                    "cpal drives ALSA with {} periods per buffer, {} requested; use the alsa backend",
                    ALSA_HOST_PERIODS, config.period_count
                ),
            });
        }
        u32::try_from(config.buffer_size()).map_err(|_| DeviceError::UnsupportedGeometry {
            device: device.to_string(),
            reason: format!("buffer of {} frames is too large", config.buffer_size()),
        })
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = device;
        Ok(config.period_size)
    }
}

/// The host's default audio subsystem (ALSA on Linux)
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn host() -> Host {
        cpal::default_host()
    }

    fn find_device(host: &Host, name: &str, direction: Direction) -> Result<Device, DeviceError> {
        if name == "default" {
            let device = match direction {
                Direction::Capture => host.default_input_device(),
                Direction::Playback => host.default_output_device(),
            };
            return device.ok_or_else(|| DeviceError::NotFound(name.to_string()));
        }

        let devices = match direction {
            Direction::Capture => host.input_devices(),
            Direction::Playback => host.output_devices(),
        }
        .map_err(|e| DeviceError::HostUnavailable(e.to_string()))?
        .collect::<Vec<_>>();

        devices
            .into_iter()
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))
    }

    /// Check that the device can run `config` as 16-bit PCM with a fixed
    /// buffer request of `frames`
    fn check_geometry(
        device: &Device,
        name: &str,
        direction: Direction,
        config: &StreamConfig,
        frames: u32,
    ) -> Result<(), DeviceError> {
        let ranges: Vec<_> = match direction {
            Direction::Capture => device
                .supported_input_configs()
                .map(|c| c.collect())
                .map_err(|e| DeviceError::Open {
                    device: name.to_string(),
                    reason: e.to_string(),
                })?,
            Direction::Playback => device
                .supported_output_configs()
                .map(|c| c.collect())
                .map_err(|e| DeviceError::Open {
                    device: name.to_string(),
                    reason: e.to_string(),
                })?,
        };

        let rate = config.sample_rate;
        let matching: Vec<_> = ranges
            .iter()
            .filter(|r| {
                r.channels() == config.channels
                    && r.sample_format() == SampleFormat::I16
                    && (r.min_sample_rate().0..=r.max_sample_rate().0).contains(&rate)
            })
            .collect();

        if matching.is_empty() {
            return Err(DeviceError::UnsupportedGeometry {
                device: name.to_string(),
                reason: format!(
                    "no 16-bit {} config with {} channels at {} Hz",
                    direction, config.channels, rate
                ),
            });
        }

        let mut reported = None;
        for range in &matching {
            match *range.buffer_size() {
                SupportedBufferSize::Unknown => return Ok(()),
                SupportedBufferSize::Range { min, max } => {
                    if (min..=max).contains(&frames) {
                        return Ok(());
                    }
                    reported = Some((min, max));
                }
            }
        }

        let (min, max) = reported.unwrap_or((0, 0));
        Err(DeviceError::UnsupportedGeometry {
            device: name.to_string(),
            reason: format!(
                "fixed buffer request of {} frames outside supported {}..={}",
                frames, min, max
            ),
        })
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open(
        &self,
        device: &str,
        direction: Direction,
        config: &StreamConfig,
    ) -> Result<Box<dyn PcmStream>, DeviceError> {
        let frames = fixed_frames(device, config)?;
        let host = Self::host();
        let handle = Self::find_device(&host, device, direction)?;
        Self::check_geometry(&handle, device, direction, config, frames)?;
        tracing::debug!(
            device,
            %direction,
            sample_rate = config.sample_rate,
            channels = config.channels,
            period_size = config.period_size,
            period_count = config.period_count,
            fixed_frames = frames,
            "Geometry supported"
        );
        Ok(Box::new(CpalStream::spawn(
            handle,
            device.to_string(),
            direction,
            *config,
            frames,
        )?))
    }

    fn list_devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let host = Self::host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let devices = host
            .devices()
            .map_err(|e| DeviceError::HostUnavailable(e.to_string()))?;

        let mut infos = Vec::new();
        for device in devices {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let is_default = default_input.as_deref() == Some(name.as_str())
                || default_output.as_deref() == Some(name.as_str());

            let input_channels = device
                .default_input_config()
                .map(|c| c.channels())
                .unwrap_or(0);
            let output_channels = device
                .default_output_config()
                .map(|c| c.channels())
                .unwrap_or(0);

            let mut sample_rates = Vec::new();
            let mut buffer_frames = None;
            let ranges = device
                .supported_output_configs()
                .map(|c| c.collect::<Vec<_>>())
                .or_else(|_| device.supported_input_configs().map(|c| c.collect()))
                .unwrap_or_default();
            for range in ranges {
                for &rate in &COMMON_RATES {
                    if (range.min_sample_rate().0..=range.max_sample_rate().0).contains(&rate)
                        && !sample_rates.contains(&rate)
                    {
                        sample_rates.push(rate);
                    }
                }
                if let SupportedBufferSize::Range { min, max } = *range.buffer_size() {
                    buffer_frames.get_or_insert((min, max));
                }
            }
            sample_rates.sort_unstable();

            infos.push(DeviceInfo {
                name,
                is_default,
                input_channels,
                output_channels,
                sample_rates,
                buffer_frames,
            });
        }
        Ok(infos)
    }
}

enum HolderCommand {
    Play(Sender<Result<(), DeviceError>>),
    Stop,
}

/// The period I/O side of the ring buffer
enum RingEnd {
    Capture(HeapCons<i16>),
    Playback(HeapProd<i16>),
}

/// The device callback side of the ring buffer
enum CallbackEnd {
    Input(HeapProd<i16>),
    Output(HeapCons<i16>),
}

/// An open cpal stream driven through blocking period I/O
pub struct CpalStream {
    device: String,
    direction: Direction,
    config: StreamConfig,
    ring: RingEnd,
    ticks: Receiver<()>,
    errors: Receiver<String>,
    /// Xruns counted by the callback
    xruns: Arc<AtomicU64>,
    /// Xruns already reported to the caller
    seen_xruns: u64,
    /// Nanoseconds of device time at the latest callback
    device_clock: Arc<AtomicU64>,
    commands: Option<Sender<HolderCommand>>,
    holder: Option<JoinHandle<()>>,
    timeout: Duration,
}

impl CpalStream {
    fn spawn(
        device: Device,
        name: String,
        direction: Direction,
        config: StreamConfig,
        frames: u32,
    ) -> Result<Self, DeviceError> {
        let (tick_tx, tick_rx) = crossbeam_channel::bounded::<()>(1);
        let (error_tx, error_rx) = crossbeam_channel::bounded::<String>(8);
        let (command_tx, command_rx) = crossbeam_channel::bounded::<HolderCommand>(4);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), DeviceError>>(1);
        let xruns = Arc::new(AtomicU64::new(0));
        let device_clock = Arc::new(AtomicU64::new(NO_DEVICE_TIME));

        let ring = HeapRb::<i16>::new(config.buffer_samples());
        let (producer, consumer) = ring.split();
        let (ring_end, callback_end) = match direction {
            Direction::Capture => (RingEnd::Capture(consumer), CallbackEnd::Input(producer)),
            Direction::Playback => (RingEnd::Playback(producer), CallbackEnd::Output(consumer)),
        };

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: SampleRate(config.sample_rate),
            buffer_size: BufferSize::Fixed(frames),
        };

        let thread_name = format!("cpal-{}", direction);
        let holder_name = name.clone();
        let callback_xruns = Arc::clone(&xruns);
        let callback_clock = Arc::clone(&device_clock);
        let holder = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let built = build_stream(
                    &device,
                    &holder_name,
                    &stream_config,
                    callback_end,
                    callback_xruns,
                    callback_clock,
                    tick_tx,
                    error_tx,
                );
                let stream = match built {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(command) = command_rx.recv() {
                    match command {
                        HolderCommand::Play(reply) => {
                            let result = stream.play().map_err(|e| DeviceError::Stream {
                                device: holder_name.clone(),
                                reason: e.to_string(),
                            });
                            let _ = reply.send(result);
                        }
                        HolderCommand::Stop => break,
                    }
                }

                let _ = stream.pause();
                drop(stream);
                tracing::debug!(device = %holder_name, "Stream holder exiting");
            })
            .map_err(|e| DeviceError::Open {
                device: name.clone(),
                reason: format!("failed to spawn stream thread: {}", e),
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = holder.join();
                return Err(e);
            }
            Err(_) => {
                let _ = holder.join();
                return Err(DeviceError::Open {
                    device: name,
                    reason: "stream thread exited during setup".into(),
                });
            }
        }

        Ok(Self {
            device: name,
            direction,
            config,
            ring: ring_end,
            ticks: tick_rx,
            errors: error_rx,
            xruns,
            seen_xruns: 0,
            device_clock,
            commands: Some(command_tx),
            holder: Some(holder),
            timeout: config.buffer_duration() * 4 + TIMEOUT_GRACE,
        })
    }

    fn check_stream_error(&self) -> Result<(), PeriodError> {
        match self.errors.try_recv() {
            Ok(reason) => Err(PeriodError::Fatal(DeviceError::Stream {
                device: self.device.clone(),
                reason,
            })),
            Err(_) => Ok(()),
        }
    }

    /// New xruns since the last call
    fn take_xrun(&mut self) -> bool {
        let count = self.xruns.load(Ordering::Acquire);
        if count != self.seen_xruns {
            self.seen_xruns = count;
            return true;
        }
        false
    }

    fn wait_tick(&self) -> Result<(), PeriodError> {
        match self.ticks.recv_timeout(self.timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(PeriodError::Fatal(DeviceError::Timeout {
                device: self.device.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            })),
            Err(RecvTimeoutError::Disconnected) => Err(PeriodError::Fatal(
                DeviceError::Disconnected(self.device.clone()),
            )),
        }
    }

    /// Fill the playback ring with silence up to the start threshold
    /// (buffer minus one period)
    fn prime(&mut self) {
        let RingEnd::Playback(producer) = &mut self.ring else {
            return;
        };
        let target = self.config.buffer_samples() - self.config.period_samples();
        let silence = vec![0i16; target.saturating_sub(producer.occupied_len())];
        producer.push_slice(&silence);
    }
}

fn build_stream(
    device: &Device,
    name: &str,
    config: &cpal::StreamConfig,
    ring: CallbackEnd,
    xruns: Arc<AtomicU64>,
    clock: Arc<AtomicU64>,
    ticks: Sender<()>,
    errors: Sender<String>,
) -> Result<cpal::Stream, DeviceError> {
    let channels = config.channels.max(1) as usize;
    let device_name = name.to_string();
    let on_error = move |err: cpal::StreamError| {
        tracing::error!(device = %device_name, "Stream error: {}", err);
        let _ = errors.try_send(err.to_string());
    };

    let input_clock = Arc::clone(&clock);
    let mut input_origin: Option<cpal::StreamInstant> = None;
    let mut output_origin: Option<cpal::StreamInstant> = None;

    let result = match ring {
        CallbackEnd::Input(mut producer) => device.build_input_stream(
            config,
            move |data: &[i16], info: &cpal::InputCallbackInfo| {
                let capture = info.timestamp().capture;
                let origin = *input_origin.get_or_insert(capture);
                store_device_time(&input_clock, capture.duration_since(&origin));
                let room = producer.vacant_len() / channels * channels;
                let pushed = producer.push_slice(&data[..room.min(data.len())]);
                if pushed < data.len() {
                    xruns.fetch_add(1, Ordering::Release);
                }
                let _ = ticks.try_send(());
            },
            on_error,
            None,
        ),
        CallbackEnd::Output(mut consumer) => device.build_output_stream(
            config,
            move |data: &mut [i16], info: &cpal::OutputCallbackInfo| {
                let playback = info.timestamp().playback;
                let origin = *output_origin.get_or_insert(playback);
                store_device_time(&clock, playback.duration_since(&origin));
                let popped = consumer.pop_slice(data);
                if popped < data.len() {
                    data[popped..].fill(0);
                    xruns.fetch_add(1, Ordering::Release);
                }
                let _ = ticks.try_send(());
            },
            on_error,
            None,
        ),
    };

    result.map_err(|e| DeviceError::Open {
        device: name.to_string(),
        reason: e.to_string(),
    })
}

fn store_device_time(clock: &AtomicU64, elapsed: Option<Duration>) {
    if let Some(elapsed) = elapsed {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(NO_DEVICE_TIME - 1);
        clock.store(nanos, Ordering::Release);
    }
}

impl PcmStream for CpalStream {
    fn config(&self) -> StreamConfig {
        self.config
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        self.prime();
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| DeviceError::Disconnected(self.device.clone()))?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        commands
            .send(HolderCommand::Play(reply_tx))
            .map_err(|_| DeviceError::Disconnected(self.device.clone()))?;
        reply_rx
            .recv_timeout(self.timeout)
            .map_err(|_| DeviceError::Timeout {
                device: self.device.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;
        tracing::debug!(device = %self.device, direction = %self.direction, "Stream playing");
        Ok(())
    }

    fn read_period(&mut self, block: &mut [i16]) -> Result<(), PeriodError> {
        if !matches!(self.ring, RingEnd::Capture(_)) {
            return Err(PeriodError::Fatal(DeviceError::Stream {
                device: self.device.clone(),
                reason: "read on a playback stream".into(),
            }));
        }
        loop {
            self.check_stream_error()?;
            if self.take_xrun() {
                // Resync: drop stale frames so the next read is current
                if let RingEnd::Capture(consumer) = &mut self.ring {
                    let mut stale = consumer.occupied_len();
                    while stale > 0 {
                        let n = stale.min(block.len());
                        let popped = consumer.pop_slice(&mut block[..n]);
                        if popped == 0 {
                            break;
                        }
                        stale -= popped;
                    }
                }
                return Err(PeriodError::Xrun(XrunKind::Overrun));
            }
            if let RingEnd::Capture(consumer) = &mut self.ring {
                if consumer.occupied_len() >= block.len() {
                    consumer.pop_slice(block);
                    return Ok(());
                }
            }
            self.wait_tick()?;
        }
    }

    fn write_period(&mut self, block: &[i16]) -> Result<(), PeriodError> {
        if !matches!(self.ring, RingEnd::Playback(_)) {
            return Err(PeriodError::Fatal(DeviceError::Stream {
                device: self.device.clone(),
                reason: "write on a capture stream".into(),
            }));
        }
        loop {
            self.check_stream_error()?;
            if self.take_xrun() {
                // Re-prime so playback restarts from the start threshold
                self.prime();
                return Err(PeriodError::Xrun(XrunKind::Underrun));
            }
            if let RingEnd::Playback(producer) = &mut self.ring {
                if producer.vacant_len() >= block.len() {
                    producer.push_slice(block);
                    return Ok(());
                }
            }
            self.wait_tick()?;
        }
    }

    fn device_time(&self) -> Option<Duration> {
        match self.device_clock.load(Ordering::Acquire) {
            NO_DEVICE_TIME => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    fn stop(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(HolderCommand::Stop);
        }
        if let Some(holder) = self.holder.take() {
            if holder.join().is_err() {
                tracing::error!(device = %self.device, "Stream holder thread panicked");
            }
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop();
    }
}
