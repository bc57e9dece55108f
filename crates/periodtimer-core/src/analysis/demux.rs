//! Demux stage: interleaved frames to per-channel sequences

use super::AnalysisError;

/// Interleaved samples as read from an input file
#[derive(Debug, Clone, PartialEq)]
pub struct Interleaved {
    pub samples: Vec<f64>,
    pub channels: usize,
    /// Frames per second (not necessarily an integer for timing input)
    pub sample_rate: f64,
}

impl Interleaved {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Split interleaved frames into one sequence per channel
///
/// Empty input and trailing partial frames are malformed.
pub fn demux(input: &Interleaved) -> Result<Vec<Vec<f64>>, AnalysisError> {
    if input.channels == 0 {
        return Err(AnalysisError::MalformedInput(
            "input declares zero channels".into(),
        ));
    }
    if input.samples.is_empty() {
        return Err(AnalysisError::MalformedInput("input is empty".into()));
    }
    let remainder = input.samples.len() % input.channels;
    if remainder != 0 {
        return Err(AnalysisError::MalformedInput(format!(
            "truncated input: {} samples is not a whole number of {}-channel frames ({} left over)",
            input.samples.len(),
            input.channels,
            remainder
        )));
    }

    let mut channels = vec![Vec::with_capacity(input.frames()); input.channels];
    for frame in input.samples.chunks_exact(input.channels) {
        for (channel, &sample) in channels.iter_mut().zip(frame) {
            channel.push(sample);
        }
    }
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interleaved(samples: Vec<f64>, channels: usize) -> Interleaved {
        Interleaved {
            samples,
            channels,
            sample_rate: 48000.0,
        }
    }

    #[test]
    fn test_splits_channels() {
        let input = interleaved(vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0], 2);
        let channels = demux(&input).unwrap();
        assert_eq!(channels, vec![vec![1.0, 2.0, 3.0], vec![-1.0, -2.0, -3.0]]);
    }

    #[test]
    fn test_empty_is_malformed() {
        let result = demux(&interleaved(Vec::new(), 2));
        assert!(matches!(result, Err(AnalysisError::MalformedInput(_))));
    }

    #[test]
    fn test_partial_frame_is_malformed() {
        let result = demux(&interleaved(vec![1.0, 2.0, 3.0], 2));
        assert!(matches!(result, Err(AnalysisError::MalformedInput(_))));
    }

    #[test]
    fn test_mono() {
        let channels = demux(&interleaved(vec![0.5; 4], 1)).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].len(), 4);
    }
}
