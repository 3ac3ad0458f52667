//! Input source abstraction.
//!
//! The mixer consumes producers through two traits:
//!
//! - [`InputSource`]: lifecycle (connect/start), format control and
//!   buffering-depth control of a producer
//! - [`PushStream`]: one elementary stream of a source, delivering
//!   [`MediaBuffer`]s and notifying readiness through a [`TransferHandler`]
//!
//! Compressed sources are adapted by a [`Transcoder`] created on demand by a
//! [`TranscoderFactory`].

mod mock;
mod source_id;

pub use mock::MockSource;
pub use source_id::SourceId;

use std::sync::Arc;
use std::time::Duration;

use crate::format::AudioFormat;
use crate::SourceError;

/// Readiness notification installed on a [`PushStream`].
///
/// The producer invokes it from its own thread whenever new data can be read.
/// The read cycle runs synchronously inside that call, so producers must not
/// hold their own locks while invoking it.
pub type TransferHandler = Arc<dyn Fn() + Send + Sync>;

/// Per-buffer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// No real data this cycle. Distinct from real data that is all zeros.
    pub silence: bool,
    /// The buffer carries nothing and must be ignored.
    pub discard: bool,
}

/// A buffer of raw media read from (or produced by) a [`PushStream`].
#[derive(Debug, Clone, Default)]
pub struct MediaBuffer {
    /// Raw sample bytes.
    pub data: Vec<u8>,
    /// Format of `data` when it differs from the stream's format.
    pub format: Option<AudioFormat>,
    /// Buffer flags.
    pub flags: BufferFlags,
    /// Presentation timestamp, if known.
    pub timestamp: Option<Duration>,
}

impl MediaBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the buffer for reuse, keeping the data allocation.
    pub fn reset(&mut self) {
        self.data.clear();
        self.format = None;
        self.flags = BufferFlags::default();
        self.timestamp = None;
    }

    /// Returns `true` if the buffer is flagged as silence.
    pub fn is_silence(&self) -> bool {
        self.flags.silence
    }

    /// Returns `true` if the buffer is flagged as discard.
    pub fn is_discard(&self) -> bool {
        self.flags.discard
    }
}

/// An elementary push-style audio stream.
///
/// # Implementation Notes
///
/// - `read` must never block; it returns whatever is available (possibly
///   nothing, leaving `buffer.data` empty)
/// - `set_transfer_handler` replaces any previously installed handler;
///   `None` removes it
pub trait PushStream: Send + Sync {
    /// Format of the data this stream delivers.
    fn format(&self) -> AudioFormat;

    /// Reads the currently available data into `buffer`.
    ///
    /// `buffer` arrives reset; implementations fill `data` and may set the
    /// flags, the per-buffer format and the timestamp.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] if the stream cannot be read. The mixer
    /// treats this stream as non-contributing for the cycle.
    fn read(&self, buffer: &mut MediaBuffer) -> Result<(), SourceError>;

    /// Installs (or removes) the readiness notification.
    fn set_transfer_handler(&self, handler: Option<TransferHandler>);
}

/// An external producer of one or more [`PushStream`]s.
///
/// Methods take `&self`; implementations use interior mutability. The mixer
/// reference counts its own connect/start state and calls each source's
/// `connect`/`start` at most once per transition.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use conference_mixer::{AudioFormat, AudioMixer, InputSource, MockSource};
///
/// let mixer = AudioMixer::builder().build();
/// let mic = Arc::new(MockSource::new("mic", AudioFormat::pcm_le(8000, 16, 1)));
/// let id = mixer.add_input_source(mic, None).unwrap();
/// assert_eq!(mixer.source_count(), 1);
/// # let _ = id;
/// ```
pub trait InputSource: Send + Sync {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> &str;

    /// Connects to the producer.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] if the producer cannot be reached. The
    /// mixer drops the source and keeps mixing the others.
    fn connect(&self) -> Result<(), SourceError>;

    /// Disconnects from the producer.
    fn disconnect(&self);

    /// Starts delivering data.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] if the producer cannot start.
    fn start(&self) -> Result<(), SourceError>;

    /// Stops delivering data.
    fn stop(&self);

    /// The elementary streams of a connected source.
    fn streams(&self) -> Vec<Arc<dyn PushStream>>;

    /// The native format currently advertised, if known.
    fn format(&self) -> Option<AudioFormat>;

    /// Asks the source to switch its output format.
    ///
    /// Default implementation refuses.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] when the source keeps its current format.
    fn set_format(&self, format: &AudioFormat) -> Result<(), SourceError> {
        let _ = format;
        Err(SourceError::custom("format is fixed"))
    }

    /// Current buffering depth, if the source exposes one.
    fn buffer_length(&self) -> Option<Duration> {
        None
    }

    /// Sets the buffering depth. Default implementation ignores it.
    fn set_buffer_length(&self, length: Duration) {
        let _ = length;
    }
}

/// An adapter converting a source to a format the mixer can convert.
///
/// The transcoder owns the wrapped source's lifecycle: connecting the
/// transcoder connects the source behind it.
pub trait Transcoder: InputSource {
    /// Whether `connect` is slow enough to run on a background task.
    ///
    /// Asynchronously connecting transcoders join the mix when their connect
    /// completes; the mixer never waits for them.
    fn connects_asynchronously(&self) -> bool {
        false
    }
}

/// Creates [`Transcoder`]s for sources whose native format the mixer cannot
/// convert on its own.
pub trait TranscoderFactory: Send + Sync {
    /// Creates a transcoder wrapping `source`.
    ///
    /// # Errors
    ///
    /// Returns a [`SourceError`] if no transcoder exists for the format.
    fn create(&self, source: Arc<dyn InputSource>) -> Result<Arc<dyn Transcoder>, SourceError>;
}

/// Address of the object behind a trait object, for identity comparison.
pub(crate) fn thin_ptr<T: ?Sized>(arc: &Arc<T>) -> *const () {
    Arc::as_ptr(arc).cast::<()>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_buffer_reset_keeps_allocation() {
        let mut buffer = MediaBuffer::new();
        buffer.data.extend_from_slice(&[1, 2, 3, 4]);
        buffer.flags.silence = true;
        buffer.timestamp = Some(Duration::from_millis(5));
        let capacity = buffer.data.capacity();

        buffer.reset();
        assert!(buffer.data.is_empty());
        assert_eq!(buffer.data.capacity(), capacity);
        assert!(!buffer.is_silence());
        assert!(buffer.timestamp.is_none());
    }

    #[test]
    fn test_thin_ptr_identity() {
        let a: Arc<dyn InputSource> = Arc::new(MockSource::new("a", AudioFormat::pcm_le(8000, 16, 1)));
        let b = Arc::clone(&a);
        let c: Arc<dyn InputSource> = Arc::new(MockSource::new("a", AudioFormat::pcm_le(8000, 16, 1)));
        assert_eq!(thin_ptr(&a), thin_ptr(&b));
        assert_ne!(thin_ptr(&a), thin_ptr(&c));
    }

    #[test]
    fn test_traits_are_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn InputSource>();
        assert_send_sync::<dyn PushStream>();
        assert_send_sync::<dyn Transcoder>();
    }
}
