//! Per-session task delivering one output mix to its sinks.
//!
//! The read cycle hands the router a [`Delivery`] per cycle through the
//! session channel. Frames go to every sink concurrently, each with its own
//! retry budget, so a slow or failing sink delays only itself. A frame a
//! sink still refuses after its last attempt is abandoned for that sink and
//! counted against the listener's session.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;

use crate::event::{emit, EventCallback};
use crate::output::OutputMixId;
use crate::session::SessionState;
use crate::sink::Sink;
use crate::{AudioChunk, MixerError, MixerEvent, SessionConfig};

/// What one cycle produced for the session's listener.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// A mixed frame.
    Frame(AudioChunk),
    /// The mix went quiet: a cycle without contributors.
    Silence,
}

pub(crate) enum RouterCommand {
    /// Deliver what is queued, stop the sinks and exit.
    Stop,
}

pub(crate) struct Router {
    output: OutputMixId,
    sinks: Vec<Arc<dyn Sink>>,
    config: SessionConfig,
    state: Arc<SessionState>,
    on_event: Option<EventCallback>,
}

impl Router {
    pub(crate) fn new(
        output: OutputMixId,
        sinks: Vec<Arc<dyn Sink>>,
        config: SessionConfig,
        state: Arc<SessionState>,
        on_event: Option<EventCallback>,
    ) -> Self {
        Self {
            output,
            sinks,
            config,
            state,
            on_event,
        }
    }

    fn sink_failed(&self, sink: &dyn Sink, error: String) {
        emit(
            self.on_event.as_ref(),
            MixerEvent::SinkError {
                output: self.output,
                sink_name: sink.name().to_string(),
                error,
            },
        );
    }

    /// Starts every sink in order.
    ///
    /// If one fails, the sinks already started are stopped again.
    pub(crate) async fn start_sinks(&self) -> Result<(), MixerError> {
        for (started, sink) in self.sinks.iter().enumerate() {
            if let Err(e) = sink.on_start(self.output).await {
                tracing::warn!(output = %self.output, sink = sink.name(), error = %e, "sink failed to start");
                for earlier in &self.sinks[..started] {
                    let _ = earlier.on_stop(self.output).await;
                }
                return Err(MixerError::SinkStartFailed {
                    sink_name: sink.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn stop_sinks(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.on_stop(self.output).await {
                self.sink_failed(sink.as_ref(), format!("stop failed: {e}"));
            }
        }
    }

    /// Writes one frame to `sink`, backing off between attempts.
    async fn write_frame(&self, sink: &dyn Sink, chunk: &AudioChunk) {
        let attempts = self.config.sink_retry_attempts.max(1);
        let mut delay = self.config.sink_retry_delay;
        for attempt in 1..=attempts {
            match sink.write(self.output, chunk).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(output = %self.output, sink = sink.name(), attempt, error = %e, "sink write failed");
                    self.sink_failed(sink, e.to_string());
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        self.state.frames_abandoned.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(output = %self.output, sink = sink.name(), "frame abandoned");
        emit(
            self.on_event.as_ref(),
            MixerEvent::FrameAbandoned {
                output: self.output,
                sink_name: sink.name().to_string(),
            },
        );
    }

    async fn announce_silence(&self, sink: &dyn Sink) {
        if let Err(e) = sink.on_silence(self.output).await {
            self.sink_failed(sink, e.to_string());
        }
    }

    /// Hands one delivery to every sink concurrently.
    pub(crate) async fn deliver(&self, delivery: &Delivery) {
        match delivery {
            Delivery::Frame(chunk) => {
                join_all(self.sinks.iter().map(|sink| self.write_frame(sink.as_ref(), chunk))).await;
            }
            Delivery::Silence => {
                join_all(self.sinks.iter().map(|sink| self.announce_silence(sink.as_ref()))).await;
            }
        }
    }

    /// Delivers until stopped or until the cycle side hangs up, then stops
    /// the sinks.
    pub(crate) async fn run(
        self,
        mut deliveries: mpsc::Receiver<Delivery>,
        mut commands: mpsc::Receiver<RouterCommand>,
    ) {
        loop {
            tokio::select! {
                Some(delivery) = deliveries.recv() => self.deliver(&delivery).await,
                Some(RouterCommand::Stop) = commands.recv() => {
                    while let Ok(delivery) = deliveries.try_recv() {
                        self.deliver(&delivery).await;
                    }
                    break;
                }
                else => break,
            }
        }

        self.stop_sinks().await;
        tracing::debug!(output = %self.output, sinks = self.sinks.len(), "router finished");
    }
}
