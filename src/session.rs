//! Mix session management: one output mix feeding a set of sinks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::event::{emit, EventCallback};
use crate::output::{Frame, OutputMix};
use crate::pipeline::{Delivery, Router, RouterCommand};
use crate::sink::Sink;
use crate::source::{InputSource, TransferHandler};
use crate::{MixerError, MixerEvent, SessionConfig};

/// Only `Stop` travels on the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 1;

/// Statistics about a mix session.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Mixed frames handed to the router.
    pub chunks_forwarded: u64,
    /// Mixed frames dropped because the router channel was full.
    pub chunks_dropped: u64,
    /// Total samples forwarded.
    pub samples_mixed: u64,
    /// Cycles in which nobody contributed to this listener's mix.
    pub silent_cycles: u64,
    /// Frame writes a sink gave up on after its last retry, summed over sinks.
    pub frames_abandoned: u64,
}

/// State shared by the session handle, its transfer handler and its router.
pub(crate) struct SessionState {
    pub running: AtomicBool,
    released: AtomicBool,
    quiet: AtomicBool,
    fatal: Mutex<Option<MixerError>>,
    pub chunks_forwarded: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub samples_mixed: AtomicU64,
    pub silent_cycles: AtomicU64,
    pub frames_abandoned: AtomicU64,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            released: AtomicBool::new(false),
            quiet: AtomicBool::new(false),
            fatal: Mutex::new(None),
            chunks_forwarded: AtomicU64::new(0),
            chunks_dropped: AtomicU64::new(0),
            samples_mixed: AtomicU64::new(0),
            silent_cycles: AtomicU64::new(0),
            frames_abandoned: AtomicU64::new(0),
        }
    }

    /// Records the first fatal error and marks the session as ended.
    fn fail(&self, error: MixerError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(error);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn error(&self) -> Option<MixerError> {
        self.fatal.lock().clone()
    }
}

/// Handle to a running mix session.
///
/// A session connects and starts an [`OutputMix`] and forwards every mixed
/// frame to its sinks. The read cycle never waits for sinks: frames pass
/// through a bounded channel to a router task, and a full channel drops the
/// frame instead of blocking.
///
/// A fatal mixer error ends the session on its own. The sinks are stopped,
/// the output is released, [`is_running`](MixSession::is_running) turns
/// `false` and [`stop`](MixSession::stop) returns the error.
///
/// # Lifecycle
///
/// 1. Created by [`MixSession::start()`]
/// 2. Mixed frames flow to the sinks in the background
/// 3. Call [`stop()`](MixSession::stop) for graceful shutdown
/// 4. Dropping the `MixSession` also stops it (but prefer explicit `stop()`)
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use conference_mixer::{
///     AudioChunk, AudioFormat, AudioMixer, ChannelSink, MixSession, MockSource, SessionConfig,
/// };
/// use tokio::sync::mpsc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), conference_mixer::MixerError> {
/// let mixer = AudioMixer::builder().build();
/// let peer = Arc::new(MockSource::new("peer", AudioFormat::pcm_le(8000, 16, 1)));
/// mixer.add_input_source(peer.clone(), None)?;
///
/// let (tx, mut rx) = mpsc::channel::<AudioChunk>(16);
/// let session = MixSession::start(
///     mixer.create_output_mix(),
///     vec![Arc::new(ChannelSink::new(tx))],
///     SessionConfig::default(),
/// )
/// .await?;
///
/// peer.push_samples(&[7; 160]);
/// let chunk = rx.recv().await.unwrap();
/// assert_eq!(chunk.samples.len(), 160);
///
/// session.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct MixSession {
    output: OutputMix,
    state: Arc<SessionState>,
    router_cmd_tx: mpsc::Sender<RouterCommand>,
    router_handle: Option<JoinHandle<()>>,
}

impl MixSession {
    /// Starts forwarding `output` to `sinks`.
    ///
    /// Starts every sink, spawns the router task on the current runtime, then
    /// connects and starts the output mix.
    ///
    /// # Errors
    ///
    /// Returns [`MixerError::SinkStartFailed`] if any sink fails to start.
    pub async fn start(
        output: OutputMix,
        sinks: Vec<Arc<dyn Sink>>,
        config: SessionConfig,
    ) -> Result<Self, MixerError> {
        let event_callback = output.event_callback();
        let state = Arc::new(SessionState::new());
        let router = Router::new(
            output.id(),
            sinks,
            config.clone(),
            Arc::clone(&state),
            event_callback.clone(),
        );
        router.start_sinks().await?;

        let (delivery_tx, delivery_rx) = mpsc::channel(config.chunk_channel_capacity.max(1));
        let (router_cmd_tx, router_cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let router_handle = {
            let output = output.clone();
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                router.run(delivery_rx, router_cmd_rx).await;
                // A fatal error stops the router from the cycle side, which
                // cannot release the output itself.
                if state.error().is_some() {
                    release(&output, &state);
                }
            })
        };

        output.connect();
        output.set_transfer_handler(Some(forwarder(
            &output,
            delivery_tx,
            router_cmd_tx.clone(),
            &state,
            event_callback,
        )));

        if let Err(e) = output.start() {
            release(&output, &state);
            let _ = router_cmd_tx.send(RouterCommand::Stop).await;
            let _ = router_handle.await;
            return Err(MixerError::SourceConnectFailed {
                source_name: output.name().to_string(),
                reason: e.to_string(),
            });
        }
        tracing::info!(output = %output.id(), format = %output.format(), "mix session started");

        Ok(Self {
            output,
            state,
            router_cmd_tx,
            router_handle: Some(router_handle),
        })
    }

    /// The output mix this session forwards, for mute and DTMF control.
    pub fn output(&self) -> &OutputMix {
        &self.output
    }

    /// Returns `true` until the session is stopped or fails.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// The fatal error that ended the session, if any.
    pub fn error(&self) -> Option<MixerError> {
        self.state.error()
    }

    /// Returns current session statistics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            chunks_forwarded: self.state.chunks_forwarded.load(Ordering::SeqCst),
            chunks_dropped: self.state.chunks_dropped.load(Ordering::SeqCst),
            samples_mixed: self.state.samples_mixed.load(Ordering::SeqCst),
            silent_cycles: self.state.silent_cycles.load(Ordering::SeqCst),
            frames_abandoned: self.state.frames_abandoned.load(Ordering::SeqCst),
        }
    }

    /// Stops the session.
    ///
    /// This will:
    /// 1. Stop and disconnect the output mix
    /// 2. Deliver whatever is still queued to the sinks
    /// 3. Call `on_stop()` on all sinks
    /// 4. Wait for the router task to complete
    ///
    /// # Errors
    ///
    /// Returns the fatal [`MixerError`] if the session had already failed.
    pub async fn stop(mut self) -> Result<(), MixerError> {
        self.stop_internal().await
    }

    async fn stop_internal(&mut self) -> Result<(), MixerError> {
        let Some(handle) = self.router_handle.take() else {
            return Ok(());
        };
        self.state.running.store(false, Ordering::SeqCst);
        release(&self.output, &self.state);

        // Fails once the router has exited on its own.
        let _ = self.router_cmd_tx.send(RouterCommand::Stop).await;
        let _ = handle.await;

        match self.state.error() {
            Some(error) => {
                tracing::warn!(output = %self.output.id(), error = %error, "mix session ended by fatal error");
                Err(error)
            }
            None => {
                tracing::info!(output = %self.output.id(), "mix session stopped");
                Ok(())
            }
        }
    }
}

impl Drop for MixSession {
    fn drop(&mut self) {
        if self.router_handle.take().is_some() {
            // Dropped without stop(): the router finishes in the background.
            self.state.running.store(false, Ordering::SeqCst);
            release(&self.output, &self.state);
            let _ = self.router_cmd_tx.try_send(RouterCommand::Stop);
        }
    }
}

/// Detaches the session from its output, once.
fn release(output: &OutputMix, state: &SessionState) {
    if state.released.swap(true, Ordering::SeqCst) {
        return;
    }
    output.set_transfer_handler(None);
    output.stop();
    output.disconnect();
}

/// Builds the transfer handler pulling each cycle's result into the router
/// channel. Runs inside the read cycle, so it never blocks.
///
/// Consecutive silent cycles reach the router as one [`Delivery::Silence`].
fn forwarder(
    output: &OutputMix,
    delivery_tx: mpsc::Sender<Delivery>,
    router_cmd_tx: mpsc::Sender<RouterCommand>,
    state: &Arc<SessionState>,
    event_callback: Option<EventCallback>,
) -> TransferHandler {
    let weak = output.downgrade();
    let output_id = output.id();
    let state = Arc::clone(state);
    Arc::new(move || {
        if !state.running.load(Ordering::SeqCst) {
            return;
        }
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let delivery = match OutputMix::from_shared(shared).take_frame() {
            None => return,
            Some(Frame::Failed(error)) => {
                tracing::error!(output = %output_id, error = %error, "mix session failed");
                state.fail(error);
                let _ = router_cmd_tx.try_send(RouterCommand::Stop);
                return;
            }
            Some(Frame::Empty) => {
                state.silent_cycles.fetch_add(1, Ordering::SeqCst);
                if state.quiet.swap(true, Ordering::SeqCst) {
                    return;
                }
                Delivery::Silence
            }
            Some(Frame::Mixed(chunk)) => {
                state.quiet.store(false, Ordering::SeqCst);
                Delivery::Frame(chunk)
            }
        };

        let samples = match &delivery {
            Delivery::Frame(chunk) => chunk.samples.len() as u64,
            Delivery::Silence => 0,
        };
        match delivery_tx.try_send(delivery) {
            Ok(()) if samples > 0 => {
                state.chunks_forwarded.fetch_add(1, Ordering::SeqCst);
                state.samples_mixed.fetch_add(samples, Ordering::SeqCst);
            }
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(Delivery::Silence)) => {
                // Announce the quiet period on a later silent cycle.
                state.quiet.store(false, Ordering::SeqCst);
            }
            Err(TrySendError::Full(Delivery::Frame(_))) => {
                state.chunks_dropped.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(output = %output_id, "router channel full, dropping chunk");
                emit(
                    event_callback.as_ref(),
                    MixerEvent::ChunkDropped { output: output_id },
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AudioChunk, AudioFormat, AudioMixer, ChannelSink, MixerConfig, MockSource, OutputMixId, SinkError};
    use async_trait::async_trait;

    struct FailingStartSink;

    #[async_trait]
    impl Sink for FailingStartSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn on_start(&self, _output: OutputMixId) -> Result<(), SinkError> {
            Err(SinkError::custom("no device"))
        }

        async fn write(&self, _output: OutputMixId, _chunk: &AudioChunk) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[test]
    fn test_session_state_new() {
        let state = SessionState::new();
        assert!(state.running.load(Ordering::SeqCst));
        assert_eq!(state.chunks_forwarded.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_session_stats_default() {
        let stats = SessionStats::default();
        assert_eq!(stats.chunks_forwarded, 0);
        assert_eq!(stats.chunks_dropped, 0);
        assert_eq!(stats.samples_mixed, 0);
    }

    #[tokio::test]
    async fn test_sink_start_failure_is_fatal() {
        let mixer = AudioMixer::builder().build();
        let output = mixer.create_output_mix();
        let result = MixSession::start(
            output.clone(),
            vec![Arc::new(FailingStartSink)],
            SessionConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(MixerError::SinkStartFailed { .. })));
        assert!(!output.is_connected());
    }

    #[tokio::test]
    async fn test_full_channel_drops_chunks() {
        let mixer = AudioMixer::builder().build();
        let source = Arc::new(MockSource::new("a", AudioFormat::pcm_le(8000, 16, 1)));
        mixer.add_input_source(source.clone(), None).unwrap();

        // The user channel is never drained, so the router blocks on its
        // first write and the one-slot session channel fills up.
        let (tx, _rx) = mpsc::channel::<AudioChunk>(1);
        let config = SessionConfig {
            chunk_channel_capacity: 1,
            ..Default::default()
        };
        let session = MixSession::start(
            mixer.create_output_mix(),
            vec![Arc::new(ChannelSink::new(tx))],
            config,
        )
        .await
        .unwrap();

        for _ in 0..8 {
            source.push_samples(&[1; 160]);
        }
        let stats = session.stats();
        assert_eq!(stats.chunks_forwarded + stats.chunks_dropped, 8);
        assert!(stats.chunks_dropped > 0);

        assert!(session.output().is_started());
        drop(session);
        assert!(!source.is_started());
    }

    #[tokio::test]
    async fn test_quiet_run_is_forwarded_once() {
        let mixer = AudioMixer::builder().build();
        let source = Arc::new(MockSource::new("a", AudioFormat::pcm_le(8000, 16, 1)));
        mixer.add_input_source(source.clone(), None).unwrap();
        let (tx, _rx) = mpsc::channel::<AudioChunk>(8);
        let session = MixSession::start(
            mixer.create_output_mix(),
            vec![Arc::new(ChannelSink::new(tx))],
            SessionConfig::default(),
        )
        .await
        .unwrap();

        source.push_samples(&[4; 160]);
        for _ in 0..3 {
            source.push_silence(160);
        }
        source.push_samples(&[4; 160]);

        let stats = session.stats();
        assert_eq!(stats.chunks_forwarded, 2);
        assert_eq!(stats.silent_cycles, 3);
        assert_eq!(stats.chunks_dropped, 0);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_allocation_failure_tears_session_down() {
        let mixer = AudioMixer::builder()
            .with_config(MixerConfig {
                max_buffer_samples: 160,
                ..Default::default()
            })
            .build();
        let source = Arc::new(MockSource::new("a", AudioFormat::pcm_le(8000, 16, 1)));
        mixer.add_input_source(source.clone(), None).unwrap();
        let (tx, mut rx) = mpsc::channel::<AudioChunk>(8);
        let session = MixSession::start(
            mixer.create_output_mix(),
            vec![Arc::new(ChannelSink::new(tx))],
            SessionConfig::default(),
        )
        .await
        .unwrap();

        source.push_samples(&[1; 160]);
        assert!(session.is_running());
        source.push_samples(&[1; 161]);
        assert!(!session.is_running());
        assert!(matches!(
            session.error(),
            Some(MixerError::BufferAllocation { requested: 161 })
        ));

        // The router stops on its own and releases the output.
        assert_eq!(rx.recv().await.map(|c| c.samples.len()), Some(160));
        assert!(rx.recv().await.is_none());
        assert!(!session.output().is_connected());
        assert!(!source.is_connected());

        let err = session.stop().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
