//! Builder pattern for `AudioMixer`.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::mixer::{AudioMixer, MixerShared};
use crate::source::{InputSource, TranscoderFactory};
use crate::{event_callback, EventCallback, MixerConfig, MixerEvent};

/// Builder for configuring an [`AudioMixer`].
///
/// Use [`AudioMixer::builder()`] to create a new builder.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use conference_mixer::{AudioFormat, AudioMixer, MixerConfig, MockSource};
///
/// let mic = Arc::new(MockSource::new("mic", AudioFormat::pcm_le(16000, 16, 1)));
///
/// let mixer = AudioMixer::builder()
///     .capture_source(mic)
///     .with_config(MixerConfig::default())
///     .on_event(|e| tracing::warn!(?e, "mixer event"))
///     .build();
///
/// // The playback mix hears everyone except the local microphone.
/// let playback = mixer.local_output_mix().unwrap();
/// # drop(playback);
/// ```
#[must_use]
pub struct AudioMixerBuilder {
    capture_source: Option<Arc<dyn InputSource>>,
    config: MixerConfig,
    transcoder_factory: Option<Arc<dyn TranscoderFactory>>,
    runtime: Option<Handle>,
    event_callback: Option<EventCallback>,
}

impl Default for AudioMixerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioMixerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            capture_source: None,
            config: MixerConfig::default(),
            transcoder_factory: None,
            runtime: None,
            event_callback: None,
        }
    }

    /// Set the local capture source.
    ///
    /// It is registered first, and the mixer's
    /// [`local_output_mix`](AudioMixer::local_output_mix) excludes it. Output
    /// mixes substitute DTMF tones or silence for this source when asked to.
    pub fn capture_source(mut self, source: Arc<dyn InputSource>) -> Self {
        self.capture_source = Some(source);
        self
    }

    /// Set custom mixer configuration.
    pub fn with_config(mut self, config: MixerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the factory creating transcoders for sources in formats the mixer
    /// cannot convert itself.
    ///
    /// Without a factory such sources are rejected at registration.
    pub fn transcoder_factory(mut self, factory: Arc<dyn TranscoderFactory>) -> Self {
        self.transcoder_factory = Some(factory);
        self
    }

    /// Set the runtime that runs background transcoder connects.
    ///
    /// Default: the runtime current at [`build()`](Self::build), if any.
    /// Without a runtime, transcoders connect on the calling thread.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Set a callback to receive runtime events.
    ///
    /// Events include dropped sources, format warnings, negotiated formats
    /// and sink errors. The callback runs on mixer and audio threads and must
    /// not call back into the mixer.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(MixerEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    /// Builds the mixer.
    pub fn build(self) -> AudioMixer {
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        tracing::debug!(
            default_format = %self.config.default_format,
            trigger = ?self.config.trigger,
            capture = self.capture_source.is_some(),
            transcoding = self.transcoder_factory.is_some(),
            "building mixer"
        );
        AudioMixer::from_shared(MixerShared::new(
            self.config,
            self.transcoder_factory,
            runtime,
            self.event_callback,
            self.capture_source,
        ))
    }
}
