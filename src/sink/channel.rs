use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::sink::Sink;
use crate::{AudioChunk, OutputMixId, SinkError};

/// What a [`ChannelSink`] does when its channel has no room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overflow {
    Wait,
    Drop,
}

/// Forwards a listener's mixed frames into a tokio mpsc channel.
///
/// By default a full channel holds the router until the receiver catches up.
/// The session keeps mixing meanwhile and sheds frames at its own channel,
/// reported as [`MixerEvent::ChunkDropped`](crate::MixerEvent::ChunkDropped).
/// A [`lossy`](ChannelSink::lossy) sink drops the frame at once instead,
/// which suits a real-time consumer that would rather skip than lag.
///
/// Quiet periods are not forwarded; the receiver simply sees no frames.
///
/// # Example
///
/// ```
/// use conference_mixer::{AudioChunk, ChannelSink};
/// use tokio::sync::mpsc;
///
/// let (tx, _rx) = mpsc::channel::<AudioChunk>(50);
/// let sink = ChannelSink::lossy(tx).named("bob-playout");
/// assert_eq!(sink.dropped(), 0);
/// ```
pub struct ChannelSink {
    name: String,
    sender: mpsc::Sender<AudioChunk>,
    overflow: Overflow,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// A sink that waits for room in the channel.
    pub fn new(sender: mpsc::Sender<AudioChunk>) -> Self {
        Self::with_overflow(sender, Overflow::Wait)
    }

    /// A sink that drops frames the channel has no room for.
    pub fn lossy(sender: mpsc::Sender<AudioChunk>) -> Self {
        Self::with_overflow(sender, Overflow::Drop)
    }

    fn with_overflow(sender: mpsc::Sender<AudioChunk>, overflow: Overflow) -> Self {
        Self {
            name: "channel".to_string(),
            sender,
            overflow,
            dropped: AtomicU64::new(0),
        }
    }

    /// Renames the sink for logs and events.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Frames a lossy sink dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, output: OutputMixId, chunk: &AudioChunk) -> Result<(), SinkError> {
        match self.overflow {
            Overflow::Wait => self
                .sender
                .send(chunk.clone())
                .await
                .map_err(|_| SinkError::ChannelClosed),
            Overflow::Drop => match self.sender.try_send(chunk.clone()) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(sink = %self.name, %output, "receiver full, frame skipped");
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(SinkError::ChannelClosed),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioMixer, CanonicalFormat};

    fn frame(first: i32) -> AudioChunk {
        AudioChunk::new(vec![first; 160], None, CanonicalFormat::DEFAULT)
    }

    fn output() -> OutputMixId {
        AudioMixer::builder().build().create_output_mix().id()
    }

    #[tokio::test]
    async fn test_lossy_sink_skips_when_receiver_lags() {
        let (tx, mut rx) = mpsc::channel::<AudioChunk>(1);
        let sink = ChannelSink::lossy(tx);
        let id = output();

        for first in 1..=3 {
            sink.write(id, &frame(first)).await.unwrap();
        }
        assert_eq!(sink.dropped(), 2);
        assert_eq!(rx.recv().await.unwrap().samples[0], 1);
    }

    #[tokio::test]
    async fn test_waiting_sink_delivers_everything_in_order() {
        let (tx, mut rx) = mpsc::channel::<AudioChunk>(1);
        let sink = ChannelSink::new(tx);
        let id = output();

        let reader = tokio::spawn(async move {
            let mut firsts = Vec::new();
            while let Some(chunk) = rx.recv().await {
                firsts.push(chunk.samples[0]);
            }
            firsts
        });
        for first in 1..=3 {
            sink.write(id, &frame(first)).await.unwrap();
        }
        drop(sink);
        assert_eq!(reader.await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_an_error_in_both_modes() {
        let id = output();
        for lossy in [false, true] {
            let (tx, rx) = mpsc::channel::<AudioChunk>(4);
            drop(rx);
            let sink = if lossy { ChannelSink::lossy(tx) } else { ChannelSink::new(tx) };
            assert!(matches!(sink.write(id, &frame(0)).await, Err(SinkError::ChannelClosed)));
        }
    }

    #[test]
    fn test_named() {
        let (tx, _rx) = mpsc::channel::<AudioChunk>(1);
        assert_eq!(ChannelSink::new(tx).named("speaker").name(), "speaker");
    }
}
