//! Playback test signals
//!
//! Generates the content a playback stream writes each period: silence, a
//! sine tone, or a fixed test buffer looped (a maximum-length sequence by
//! default). Mono signals are written identically to every channel.

use crate::config::{ConfigError, SourceConfig};

/// Anything that can fill one interleaved period block
pub trait SampleSource: Send {
    fn fill(&mut self, block: &mut [i16], channels: usize);
}

/// Convert a normalized sample (-1.0..=1.0) to signed 16-bit
pub fn to_i16(sample: f64) -> i16 {
    (sample * i16::MAX as f64)
        .round()
        .clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Phase-accumulating sine generator
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    frequency: f64,
    amplitude: f64,
    phase: f64,
    step: f64,
}

impl ToneGenerator {
    /// # Example
    /// ```
    /// use periodtimer_core::audio::signal::ToneGenerator;
    ///
    /// let mut tone = ToneGenerator::new(1000.0, 0.5, 48000);
    /// assert_eq!(tone.next_sample(), 0.0);
    /// ```
    pub fn new(frequency: f64, amplitude: f64, sample_rate: u32) -> Self {
        Self {
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase: 0.0,
            step: std::f64::consts::TAU * frequency / sample_rate.max(1) as f64,
        }
    }

    pub fn next_sample(&mut self) -> f64 {
        let sample = self.phase.sin() * self.amplitude;
        self.phase = (self.phase + self.step) % std::f64::consts::TAU;
        sample
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }
}

impl SampleSource for ToneGenerator {
    fn fill(&mut self, block: &mut [i16], channels: usize) {
        for frame in block.chunks_mut(channels.max(1)) {
            let sample = to_i16(self.next_sample());
            frame.fill(sample);
        }
    }
}

/// MLS (Maximum Length Sequence) generator
///
/// Produces a bipolar pseudo-random sequence of length 2^order - 1 from a
/// Galois LFSR. Looped on playback it gives a broadband, exactly periodic
/// test buffer.
#[derive(Debug, Clone)]
pub struct MlsGenerator {
    order: u32,
    sequence: Vec<i16>,
}

impl MlsGenerator {
    /// # Errors
    /// Orders outside 2..=15 are rejected
    pub fn new(order: u32, amplitude: f64) -> Result<Self, ConfigError> {
        if !(2..=15).contains(&order) {
            return Err(ConfigError::Source(format!(
                "MLS order must be between 2 and 15, got {}",
                order
            )));
        }
        let level = to_i16(amplitude.clamp(0.0, 1.0));
        let length = (1usize << order) - 1;

        // Galois feedback masks for maximal-length polynomials (Xilinx XAPP052)
        let mask: u32 = match order {
            2 => 0x3,
            3 => 0x6,
            4 => 0xC,
            5 => 0x14,
            6 => 0x30,
            7 => 0x60,
            8 => 0xB8,
            9 => 0x110,
            10 => 0x240,
            11 => 0x500,
            12 => 0xE08,
            13 => 0x1C80,
            14 => 0x3802,
            _ => 0x6000,
        };

        let mut lfsr: u32 = 1;
        let sequence = (0..length)
            .map(|_| {
                let output = lfsr & 1;
                lfsr >>= 1;
                if output == 1 {
                    lfsr ^= mask;
                    level
                } else {
                    -level
                }
            })
            .collect();

        Ok(Self { order, sequence })
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn sequence(&self) -> &[i16] {
        &self.sequence
    }

    pub fn into_sequence(self) -> Vec<i16> {
        self.sequence
    }
}

/// Content written by a playback session
#[derive(Debug, Clone)]
pub enum PlaybackSource {
    Silence,
    Tone(ToneGenerator),
    /// Mono buffer repeated end to end
    Looped { buffer: Vec<i16>, position: usize },
}

impl PlaybackSource {
    pub fn from_config(config: &SourceConfig, sample_rate: u32) -> Result<Self, ConfigError> {
        match *config {
            SourceConfig::Silence => Ok(PlaybackSource::Silence),
            SourceConfig::Tone {
                frequency,
                amplitude,
            } => {
                let nyquist = sample_rate as f64 / 2.0;
                if !(frequency > 0.0 && frequency < nyquist) {
                    return Err(ConfigError::Source(format!(
                        "tone frequency {} Hz outside (0, {}) Hz",
                        frequency, nyquist
                    )));
                }
                Ok(PlaybackSource::Tone(ToneGenerator::new(
                    frequency,
                    amplitude,
                    sample_rate,
                )))
            }
            SourceConfig::Mls { order, amplitude } => {
                let mls = MlsGenerator::new(order, amplitude)?;
                Ok(PlaybackSource::looped(mls.into_sequence()))
            }
        }
    }

    /// Loop `buffer`; an empty buffer plays silence
    pub fn looped(buffer: Vec<i16>) -> Self {
        if buffer.is_empty() {
            return PlaybackSource::Silence;
        }
        PlaybackSource::Looped {
            buffer,
            position: 0,
        }
    }
}

impl SampleSource for PlaybackSource {
    fn fill(&mut self, block: &mut [i16], channels: usize) {
        match self {
            PlaybackSource::Silence => block.fill(0),
            PlaybackSource::Tone(tone) => tone.fill(block, channels),
            PlaybackSource::Looped { buffer, position } => {
                for frame in block.chunks_mut(channels.max(1)) {
                    frame.fill(buffer[*position]);
                    *position = (*position + 1) % buffer.len();
                }
            }
        }
    }
}
