//! Configuration types for mixers and mix sessions.

use std::time::Duration;

use crate::format::CanonicalFormat;

/// Default number of idle buffers kept per pool size class.
pub(crate) const DEFAULT_POOL_BUFFERS_PER_CLASS: usize = 8;

/// Which stream notifications drive a read cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleTrigger {
    /// Any contributing stream's notification runs a cycle.
    ///
    /// Slow streams simply contribute less (zero padded) per cycle.
    #[default]
    AnyStream,

    /// Only the first contributing stream drives cycles; the others are read
    /// whenever it does.
    ///
    /// Useful when one stream (typically the local capture) has a steady
    /// clock and the rest are jittery network streams.
    PrimaryStream,
}

/// Configuration for an [`AudioMixer`](crate::AudioMixer).
///
/// Use [`MixerConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use conference_mixer::{CanonicalFormat, MixerConfig, SampleDepth};
///
/// let config = MixerConfig {
///     default_format: CanonicalFormat::new(16000, SampleDepth::Bits16, 1),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Format used when no connected source advertises a usable one.
    ///
    /// Default: 8000 Hz, 16-bit, mono
    pub default_format: CanonicalFormat,

    /// Buffer length applied to every source when none reports one.
    ///
    /// Default: 20ms
    pub default_buffer_length: Duration,

    /// Idle buffers kept per size class by the sample buffer pool.
    ///
    /// Default: 8
    pub pool_buffers_per_class: usize,

    /// Which notifications run a read cycle.
    ///
    /// Default: [`CycleTrigger::AnyStream`]
    pub trigger: CycleTrigger,

    /// Largest per-stream sample buffer one read cycle may request.
    ///
    /// A stream delivering more samples in one cycle fails that cycle with
    /// [`MixerError::BufferAllocation`], which ends every session reading the
    /// mixer.
    /// Default: 2^31 samples
    ///
    /// [`MixerError::BufferAllocation`]: crate::MixerError::BufferAllocation
    pub max_buffer_samples: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            default_format: CanonicalFormat::DEFAULT,
            default_buffer_length: Duration::from_millis(20),
            pool_buffers_per_class: DEFAULT_POOL_BUFFERS_PER_CLASS,
            trigger: CycleTrigger::AnyStream,
            max_buffer_samples: crate::pool::MAX_BUFFER_SAMPLES,
        }
    }
}

/// Configuration for a [`MixSession`](crate::MixSession).
///
/// # Example
///
/// ```
/// use conference_mixer::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig {
///     sink_retry_delay: Duration::from_millis(10),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the channel between the read cycle and the router.
    ///
    /// The read cycle never blocks; when the channel is full the chunk is
    /// dropped and a [`MixerEvent::ChunkDropped`] is emitted.
    /// Default: 256 chunks
    ///
    /// [`MixerEvent::ChunkDropped`]: crate::MixerEvent::ChunkDropped
    pub chunk_channel_capacity: usize,

    /// Number of retry attempts for failed sink writes.
    ///
    /// Default: 3
    pub sink_retry_attempts: u32,

    /// Initial delay between sink retry attempts.
    ///
    /// Uses exponential backoff (delay doubles each attempt).
    /// Default: 100ms
    pub sink_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_channel_capacity: 256,
            sink_retry_attempts: 3,
            sink_retry_delay: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixer_config_defaults() {
        let config = MixerConfig::default();
        assert_eq!(config.default_format, CanonicalFormat::DEFAULT);
        assert_eq!(config.default_buffer_length, Duration::from_millis(20));
        assert_eq!(config.trigger, CycleTrigger::AnyStream);
        assert_eq!(config.max_buffer_samples, 1 << 31);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.chunk_channel_capacity, 256);
        assert_eq!(config.sink_retry_attempts, 3);
        assert_eq!(config.sink_retry_delay, Duration::from_millis(100));
    }
}
