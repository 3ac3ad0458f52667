//! Destinations for a listener's mixed audio.
//!
//! A [`MixSession`](crate::MixSession) hands every frame of its output mix to
//! each of its [`Sink`]s, tagged with the [`OutputMixId`] it was mixed for.
//! A single sink (a call recorder, say) can therefore be shared by the
//! sessions of several listeners and still tell their audio apart.
//!
//! Cycles in which nobody contributed produce no frame. A sink instead hears
//! [`Sink::on_silence`] once when its listener's mix goes quiet, which is
//! where an encoder would switch to comfort noise or pause transmission.
//! The next mixed frame ends the quiet period.

mod channel;

pub use channel::ChannelSink;

use crate::{AudioChunk, OutputMixId, SinkError};
use async_trait::async_trait;

/// Receives the mixed frames of one or more output mixes.
///
/// Every method takes `&self` and runs on the session's router task. Writes
/// for one session arrive in mix order; writes from different sessions
/// sharing a sink may interleave.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use async_trait::async_trait;
/// use conference_mixer::{AudioChunk, OutputMixId, Sink, SinkError};
///
/// /// Counts mixed frames and quiet periods across listeners.
/// #[derive(Default)]
/// struct Meter {
///     frames: AtomicU64,
///     quiet: AtomicU64,
/// }
///
/// #[async_trait]
/// impl Sink for Meter {
///     fn name(&self) -> &str {
///         "meter"
///     }
///
///     async fn write(&self, _output: OutputMixId, _chunk: &AudioChunk) -> Result<(), SinkError> {
///         self.frames.fetch_add(1, Ordering::Relaxed);
///         Ok(())
///     }
///
///     async fn on_silence(&self, _output: OutputMixId) -> Result<(), SinkError> {
///         self.quiet.fetch_add(1, Ordering::Relaxed);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs and [`MixerEvent`](crate::MixerEvent)s.
    fn name(&self) -> &str;

    /// Called once per session, before `output` starts mixing.
    ///
    /// An error aborts [`MixSession::start`](crate::MixSession::start) with
    /// [`MixerError::SinkStartFailed`](crate::MixerError::SinkStartFailed).
    async fn on_start(&self, _output: OutputMixId) -> Result<(), SinkError> {
        Ok(())
    }

    /// Receives one mixed frame of `output`.
    ///
    /// A failed write is retried with backoff as configured by
    /// [`SessionConfig`](crate::SessionConfig). When the attempts run out the
    /// frame is abandoned for this sink only and a
    /// [`MixerEvent::FrameAbandoned`](crate::MixerEvent::FrameAbandoned) is
    /// emitted.
    async fn write(&self, output: OutputMixId, chunk: &AudioChunk) -> Result<(), SinkError>;

    /// `output` produced a cycle without contributors after audible frames
    /// (or before the first one). Not retried.
    async fn on_silence(&self, _output: OutputMixId) -> Result<(), SinkError> {
        Ok(())
    }

    /// Called once when the session for `output` ends, including after a
    /// fatal mixer error.
    async fn on_stop(&self, _output: OutputMixId) -> Result<(), SinkError> {
        Ok(())
    }
}
