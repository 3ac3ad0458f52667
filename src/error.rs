//! Error types for conference-mixer.
//!
//! Errors are split into two categories:
//! - **Fatal errors** ([`MixerError`]): returned from mixer operations that
//!   cannot proceed (duplicate registration, buffer exhaustion, ...)
//! - **Recoverable events**: per-source runtime issues surfaced via
//!   [`EventCallback`](crate::EventCallback) while every other participant's
//!   mix keeps running
//!
//! [`SourceError`] and [`SinkError`] are the errors external collaborators
//! report back to the mixer.

/// Errors returned by the mixer and its read loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MixerError {
    /// A format the mixer cannot convert (bit depth, encoding, channels).
    #[error("unsupported format: {format} ({reason})")]
    UnsupportedFormat {
        /// Description of the offending format.
        format: String,
        /// Which attribute could not be handled.
        reason: String,
    },

    /// An input source failed to connect.
    #[error("source '{source_name}' failed to connect: {reason}")]
    SourceConnectFailed {
        /// Name of the source.
        source_name: String,
        /// Why it failed.
        reason: String,
    },

    /// A transcoder for an input source could not be created or connected.
    #[error("transcoder for source '{source_name}' failed: {reason}")]
    TranscoderCreationFailed {
        /// Name of the transcoded source.
        source_name: String,
        /// Why it failed.
        reason: String,
    },

    /// The same input source object was registered twice.
    #[error("input source '{source_name}' is already registered")]
    DuplicateSource {
        /// Name of the duplicated source.
        source_name: String,
    },

    /// A required sample buffer could not be allocated.
    #[error("failed to allocate a buffer of {requested} samples")]
    BufferAllocation {
        /// Requested buffer size in samples.
        requested: usize,
    },

    /// A sink failed during initialization.
    #[error("sink '{sink_name}' failed to start: {reason}")]
    SinkStartFailed {
        /// Name of the sink that failed.
        sink_name: String,
        /// Why the sink failed to start.
        reason: String,
    },
}

impl MixerError {
    /// Creates an unsupported format error.
    pub fn unsupported(format: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            format: format.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for failures that must propagate to the owning session.
    ///
    /// A fatal error raised by a read cycle is recorded on every attached
    /// [`OutputMix`](crate::OutputMix) and ends its [`MixSession`](crate::MixSession).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BufferAllocation { .. })
    }
}

/// Errors reported by an [`InputSource`](crate::InputSource) or
/// [`PushStream`](crate::PushStream) implementation.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Connecting to the source failed.
    #[error("connect failed: {reason}")]
    ConnectFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// Reading from a stream failed.
    #[error("read failed: {reason}")]
    ReadFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// The operation requires a connected source.
    #[error("source is not connected")]
    NotConnected,

    /// Error raised by the mixer when the source is itself a mix.
    #[error(transparent)]
    Mixer(#[from] MixerError),

    /// Custom error for user-implemented sources.
    #[error("{0}")]
    Custom(String),
}

impl SourceError {
    /// Creates a custom source error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Creates a connect failed error with the given reason.
    pub fn connect_failed(reason: impl Into<String>) -> Self {
        Self::ConnectFailed {
            reason: reason.into(),
        }
    }

    /// Creates a read failed error with the given reason.
    pub fn read_failed(reason: impl Into<String>) -> Self {
        Self::ReadFailed {
            reason: reason.into(),
        }
    }
}

/// Errors that can occur within a [`Sink`](crate::Sink) implementation.
///
/// Sink errors are recoverable - the router will emit a
/// [`MixerEvent::SinkError`](crate::MixerEvent::SinkError) and may retry.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// A write operation failed.
    #[error("write failed: {reason}")]
    WriteFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// The receiving channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Custom error for user-implemented sinks.
    #[error("{0}")]
    Custom(String),
}

impl SinkError {
    /// Creates a custom sink error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Creates a write failed error with the given reason.
    pub fn write_failed(reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            reason: reason.into(),
        }
    }
}
