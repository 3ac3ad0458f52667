//! Runtime events for monitoring mixer health.
//!
//! Events are non-fatal notifications about mixer behavior. Mixing
//! continues after events are emitted - they're for logging/metrics,
//! not error handling.

use std::sync::Arc;

use crate::format::CanonicalFormat;
use crate::output::OutputMixId;
use crate::source::SourceId;

/// Runtime events emitted by an [`AudioMixer`](crate::AudioMixer) and its
/// sessions.
///
/// These are informational events, not errors. Every other participant's
/// mix keeps running after any event is emitted. Use the [`EventCallback`]
/// to log these or update metrics.
///
/// # Example
///
/// ```
/// use conference_mixer::MixerEvent;
///
/// fn handle_event(event: MixerEvent) {
///     match event {
///         MixerEvent::SourceDropped { source_id, reason } => {
///             eprintln!("Source {} dropped: {}", source_id, reason);
///         }
///         MixerEvent::SampleRateMismatch { source_id, expected, actual } => {
///             eprintln!("Source {} runs at {} Hz, mixing at {} Hz", source_id, actual, expected);
///         }
///         MixerEvent::ChunkDropped { output } => {
///             eprintln!("Consumer of {} is falling behind", output);
///         }
///         other => eprintln!("{:?}", other),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub enum MixerEvent {
    /// An input source was registered.
    SourceAdded {
        /// Handle of the new source.
        source_id: SourceId,
        /// Name the source reported.
        name: String,
    },

    /// An input source was removed and torn down.
    SourceRemoved {
        /// Handle of the removed source.
        source_id: SourceId,
    },

    /// A source failed to connect (or its transcoder failed) and is
    /// excluded from every further cycle.
    SourceDropped {
        /// Handle of the failed source.
        source_id: SourceId,
        /// Why it was dropped.
        reason: String,
    },

    /// A stream delivered data the mixer cannot convert this cycle.
    UnsupportedFormat {
        /// Source owning the stream.
        source_id: SourceId,
        /// Description of the offending format.
        format: String,
    },

    /// A stream runs at a different rate than the canonical format.
    ///
    /// Emitted once per source and rate. No resampling is performed.
    SampleRateMismatch {
        /// Source owning the stream.
        source_id: SourceId,
        /// Canonical sample rate.
        expected: u32,
        /// Rate the stream delivers.
        actual: u32,
    },

    /// A (new) canonical format was chosen and a read loop created for it.
    FormatNegotiated {
        /// The negotiated format.
        format: CanonicalFormat,
    },

    /// An asynchronously connecting transcoder finished and joined the mix.
    TranscoderConnected {
        /// Source the transcoder belongs to.
        source_id: SourceId,
    },

    /// A read cycle was aborted by a resource failure.
    ///
    /// This is the only event backed by a fatal [`MixerError`](crate::MixerError).
    CycleFailed {
        /// Description of the failure.
        error: String,
    },

    /// A mixed chunk was dropped because the session channel was full.
    ChunkDropped {
        /// Output mix whose consumer fell behind.
        output: OutputMixId,
    },

    /// A sink call failed for one listener's session.
    ///
    /// Writes are retried according to [`SessionConfig`](crate::SessionConfig);
    /// every failed attempt is reported.
    SinkError {
        /// Output mix the session forwards.
        output: OutputMixId,
        /// Name of the sink that errored.
        sink_name: String,
        /// Description of the error.
        error: String,
    },

    /// A sink gave up on a frame after its last retry.
    ///
    /// The other sinks of the session still received it.
    FrameAbandoned {
        /// Output mix the frame was mixed for.
        output: OutputMixId,
        /// Name of the sink that missed the frame.
        sink_name: String,
    },
}

/// Callback type for receiving runtime events.
///
/// Register an event callback via [`AudioMixerBuilder::on_event()`] to
/// receive notifications about dropped sources, format negotiation and sink
/// errors.
///
/// [`AudioMixerBuilder::on_event()`]: crate::AudioMixerBuilder::on_event
///
/// # Example
///
/// ```
/// use conference_mixer::AudioMixer;
///
/// let mixer = AudioMixer::builder()
///     .on_event(|event| {
///         tracing::warn!(?event, "mixer event");
///     })
///     .build();
/// # drop(mixer);
/// ```
pub type EventCallback = Arc<dyn Fn(MixerEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// This is a convenience function for creating event callbacks without
/// manually wrapping in `Arc`.
///
/// # Example
///
/// ```
/// use conference_mixer::{event_callback, MixerEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(MixerEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Invokes an optional callback.
pub(crate) fn emit(callback: Option<&EventCallback>, event: MixerEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixer_event_debug() {
        let event = MixerEvent::SampleRateMismatch {
            source_id: SourceId::new(3),
            expected: 8000,
            actual: 48000,
        };
        let debug = format!("{:?}", event);
        assert!(debug.contains("SampleRateMismatch"));
        assert!(debug.contains("48000"));
    }

    #[test]
    fn test_sink_events_name_the_listener() {
        let output = OutputMixId::next();
        let event = MixerEvent::FrameAbandoned {
            output,
            sink_name: "recorder".to_string(),
        };
        match event.clone() {
            MixerEvent::FrameAbandoned { output: id, sink_name } => {
                assert_eq!(id, output);
                assert_eq!(sink_name, "recorder");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        emit(
            Some(&callback),
            MixerEvent::CycleFailed {
                error: "oom".into(),
            },
        );
        assert!(called.load(Ordering::SeqCst));
    }
}
