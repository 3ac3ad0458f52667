//! Mixed audio frame with metadata.

use std::sync::Arc;
use std::time::Duration;

use crate::format::{encode_le, CanonicalFormat};

/// One mixed frame produced by an [`OutputMix`](crate::OutputMix).
///
/// Samples are signed values at the canonical depth, stored in an
/// `Arc<Vec<i32>>` for zero-copy sharing between multiple sinks.
///
/// # Example
///
/// ```
/// use conference_mixer::{AudioChunk, CanonicalFormat};
/// use std::time::Duration;
///
/// let chunk = AudioChunk::new(vec![0; 160], None, CanonicalFormat::DEFAULT);
/// assert_eq!(chunk.duration(), Duration::from_millis(20));
///
/// // Samples are Arc-wrapped for efficient sharing
/// let chunk2 = chunk.clone();  // Cheap clone - shares sample data
/// ```
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mixed samples, interleaved when the format has several channels.
    ///
    /// Wrapped in `Arc` for zero-copy sharing between sinks.
    pub samples: Arc<Vec<i32>>,

    /// Timestamp of the first contributing buffer, if it carried one.
    pub timestamp: Option<Duration>,

    /// Format the samples are in.
    pub format: CanonicalFormat,
}

impl AudioChunk {
    /// Creates a new `AudioChunk` with the given parameters.
    pub fn new(samples: Vec<i32>, timestamp: Option<Duration>, format: CanonicalFormat) -> Self {
        Self {
            samples: Arc::new(samples),
            timestamp,
            format,
        }
    }

    /// Returns the duration of this audio chunk.
    ///
    /// Calculated from the number of samples, sample rate, and channel count.
    pub fn duration(&self) -> Duration {
        if self.format.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / f64::from(self.format.sample_rate))
    }

    /// Returns the number of audio frames in this chunk.
    ///
    /// A frame contains one sample per channel.
    pub fn frame_count(&self) -> usize {
        if self.format.channels == 0 {
            return 0;
        }
        self.samples.len() / usize::from(self.format.channels)
    }

    /// Returns `true` if this chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Encodes the samples as signed little-endian bytes at the chunk's depth.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_le(&self.samples, self.format.depth, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleDepth;

    #[test]
    fn test_duration_mono_8khz() {
        let chunk = AudioChunk::new(vec![0; 800], None, CanonicalFormat::DEFAULT);
        assert_eq!(chunk.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_duration_stereo_48khz() {
        let format = CanonicalFormat::new(48000, SampleDepth::Bits16, 2);
        let chunk = AudioChunk::new(vec![0; 9600], None, format);
        // 9600 samples / 2 channels = 4800 frames / 48000 Hz = 100ms
        assert_eq!(chunk.duration(), Duration::from_millis(100));
        assert_eq!(chunk.frame_count(), 4800);
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = AudioChunk::new(vec![], None, CanonicalFormat::DEFAULT);
        assert!(chunk.is_empty());
        assert_eq!(chunk.frame_count(), 0);
        assert_eq!(chunk.duration(), Duration::ZERO);
    }

    #[test]
    fn test_to_le_bytes_uses_depth() {
        let format = CanonicalFormat::new(8000, SampleDepth::Bits8, 1);
        let chunk = AudioChunk::new(vec![1, -1], None, format);
        assert_eq!(chunk.to_le_bytes(), vec![0x01, 0xff]);

        let chunk = AudioChunk::new(vec![300], None, CanonicalFormat::DEFAULT);
        assert_eq!(chunk.to_le_bytes(), vec![0x2c, 0x01]);
    }
}
