//! Per-listener output mixes.
//!
//! An [`OutputMix`] receives every [`SampleSet`] its mixer's read loop
//! publishes and computes one listener-specific frame from it. Per entry,
//! in order:
//!
//! 1. a source registered as excluded from this mix is dropped
//! 2. the capture source is replaced by the next queued DTMF tone while this
//!    mix is sending DTMF
//! 3. the capture source is dropped while this mix is muted
//!
//! Because exclusion comes first, the local playback mix (which excludes the
//! capture source) never plays DTMF.
//!
//! The remaining contributions are summed with [`mix_into`]. Mixing happens
//! during delivery into the output's own buffer, so consumers never see the
//! read loop's pool buffers.
//!
//! A fatal read cycle error fails every started mix: it produces no further
//! frames until it is stopped and started again, and [`OutputMix::error`]
//! reports what happened.
//!
//! An `OutputMix` is itself an [`InputSource`] with one [`PushStream`], so a
//! mix can feed another mixer.

mod mix;

pub use mix::{mix, mix_into, mix_pair};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::chunk::AudioChunk;
use crate::dtmf::DtmfTone;
use crate::event::EventCallback;
use crate::format::{encode_le, AudioFormat, CanonicalFormat};
use crate::mixer::{AudioMixer, MixerShared};
use crate::pipeline::SampleSet;
use crate::source::{InputSource, MediaBuffer, PushStream, SourceId, TransferHandler};
use crate::{MixerError, SourceError};

/// Identity of an [`OutputMix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputMixId(u64);

impl OutputMixId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for OutputMixId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "output-{}", self.0)
    }
}

/// What a consumer finds when it takes an output's pending frame.
pub(crate) enum Frame {
    /// The cycle produced audio.
    Mixed(AudioChunk),
    /// The cycle had no contributors.
    Empty,
    /// A fatal cycle error ended this mix.
    Failed(MixerError),
}

/// A per-listener mix of an [`AudioMixer`]'s sources.
///
/// Cloning is cheap and yields another handle to the same mix.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use conference_mixer::{AudioFormat, AudioMixer, MockSource};
///
/// let mixer = AudioMixer::builder().build();
/// let alice = Arc::new(MockSource::new("alice", AudioFormat::pcm_le(8000, 16, 1)));
/// let bob = Arc::new(MockSource::new("bob", AudioFormat::pcm_le(8000, 16, 1)));
///
/// // Alice's mix must not echo Alice back to her.
/// let for_alice = mixer.create_output_mix();
/// mixer.add_input_source(alice.clone(), Some(&for_alice)).unwrap();
/// mixer.add_input_source(bob.clone(), None).unwrap();
///
/// for_alice.connect();
/// for_alice.start().unwrap();
///
/// alice.push_samples(&[1000; 160]);
/// bob.push_samples(&[200; 160]);
///
/// let chunk = for_alice.read_chunk().unwrap();
/// assert!(chunk.samples.iter().all(|&s| s == 200));
/// ```
#[derive(Clone)]
pub struct OutputMix {
    shared: Arc<OutputShared>,
}

impl OutputMix {
    pub(crate) fn new(mixer: Arc<MixerShared>, id: OutputMixId) -> Self {
        let format = mixer.default_format();
        let shared = Arc::new_cyclic(|this| OutputShared {
            id,
            name: id.to_string(),
            mixer,
            state: Mutex::new(OutputState::new(format)),
            handler: Mutex::new(None),
            frames_mixed: AtomicU64::new(0),
            this: this.clone(),
        });
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<OutputShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<OutputShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn event_callback(&self) -> Option<EventCallback> {
        self.shared.mixer.event_callback()
    }

    pub(crate) fn set_transfer_handler(&self, handler: Option<TransferHandler>) {
        PushStream::set_transfer_handler(self.shared.as_ref(), handler);
    }

    /// Identity of this mix.
    pub fn id(&self) -> OutputMixId {
        self.shared.id
    }

    /// The mixer this output reads from.
    pub fn mixer(&self) -> AudioMixer {
        AudioMixer::from_shared(Arc::clone(&self.shared.mixer))
    }

    /// Connects to the mixer. The first connected output connects every
    /// source.
    pub fn connect(&self) {
        self.shared.connect();
    }

    /// Disconnects from the mixer, stopping first if needed.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Starts receiving cycles.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotConnected`] if the output is not connected.
    pub fn start(&self) -> Result<(), SourceError> {
        self.shared.start()
    }

    /// Stops receiving cycles.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Returns `true` while connected.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    /// Returns `true` while started.
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Substitutes silence for the capture source in this mix.
    pub fn set_mute(&self, mute: bool) {
        self.shared.state.lock().mute = mute;
    }

    /// Returns `true` if the capture source is muted in this mix.
    pub fn is_mute(&self) -> bool {
        self.shared.state.lock().mute
    }

    /// Queues a DTMF tone. One tone replaces the capture source per cycle.
    pub fn add_dtmf(&self, tone: DtmfTone) {
        self.shared.state.lock().tones.push_back(tone);
    }

    /// Returns `true` while tones are queued.
    pub fn is_sending_dtmf(&self) -> bool {
        !self.shared.state.lock().tones.is_empty()
    }

    /// Registers a source with the mixer, excluded from this mix.
    ///
    /// # Errors
    ///
    /// See [`AudioMixer::add_input_source`].
    pub fn add_input_source(&self, source: Arc<dyn InputSource>) -> Result<SourceId, MixerError> {
        self.mixer().add_input_source(source, Some(self))
    }

    /// Takes the pending mixed frame.
    ///
    /// Returns `None` if no frame was mixed since the last read, if the last
    /// cycle had no contributors, or if the mix has failed. A frame not read
    /// before the next cycle is replaced.
    pub fn read_chunk(&self) -> Option<AudioChunk> {
        match self.take_frame()? {
            Frame::Mixed(chunk) => Some(chunk),
            Frame::Empty | Frame::Failed(_) => None,
        }
    }

    pub(crate) fn take_frame(&self) -> Option<Frame> {
        let mut state = self.shared.state.lock();
        if let Some(error) = &state.fatal {
            return Some(Frame::Failed(error.clone()));
        }
        if !std::mem::take(&mut state.ready) {
            return None;
        }
        if state.discard {
            return Some(Frame::Empty);
        }
        Some(Frame::Mixed(AudioChunk::new(
            state.frame.clone(),
            state.timestamp,
            state.format,
        )))
    }

    /// The fatal error that ended this mix, if any.
    ///
    /// Cleared when the mix is started again.
    pub fn error(&self) -> Option<MixerError> {
        self.shared.state.lock().fatal.clone()
    }

    /// Format of the frames this output produces.
    pub fn format(&self) -> CanonicalFormat {
        self.shared.state.lock().format
    }

    /// Number of non-empty frames mixed so far.
    pub fn frames_mixed(&self) -> u64 {
        self.shared.frames_mixed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for OutputMix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("OutputMix")
            .field("id", &self.shared.id)
            .field("connected", &state.connected)
            .field("started", &state.started)
            .field("mute", &state.mute)
            .finish_non_exhaustive()
    }
}

struct OutputState {
    connected: bool,
    started: bool,
    mute: bool,
    tones: VecDeque<DtmfTone>,
    frame: Vec<i32>,
    ready: bool,
    discard: bool,
    timestamp: Option<Duration>,
    format: CanonicalFormat,
    acc: Vec<f64>,
    tone: Vec<i32>,
    fatal: Option<MixerError>,
}

impl OutputState {
    fn new(format: CanonicalFormat) -> Self {
        Self {
            connected: false,
            started: false,
            mute: false,
            tones: VecDeque::new(),
            frame: Vec::new(),
            ready: false,
            discard: false,
            timestamp: None,
            format,
            acc: Vec::new(),
            tone: Vec::new(),
            fatal: None,
        }
    }
}

pub(crate) struct OutputShared {
    id: OutputMixId,
    name: String,
    mixer: Arc<MixerShared>,
    state: Mutex<OutputState>,
    handler: Mutex<Option<TransferHandler>>,
    frames_mixed: AtomicU64,
    this: Weak<OutputShared>,
}

impl OutputShared {
    pub(crate) fn id(&self) -> OutputMixId {
        self.id
    }

    fn connect(&self) {
        {
            let mut state = self.state.lock();
            if state.connected {
                return;
            }
            state.connected = true;
        }
        self.mixer.connect();
    }

    fn disconnect(&self) {
        self.stop();
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
        }
        self.mixer.disconnect();
    }

    fn start(&self) -> Result<(), SourceError> {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(SourceError::NotConnected);
            }
            if state.started {
                return Ok(());
            }
            state.started = true;
            state.fatal = None;
        }
        let Some(this) = self.this.upgrade() else {
            return Ok(());
        };
        let format = self.mixer.attach_output(this);
        self.state.lock().format = format;
        tracing::debug!(output = %self.id, format = %format, "output mix started");
        Ok(())
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            state.ready = false;
        }
        self.mixer.detach_output(self.id);
        tracing::debug!(output = %self.id, "output mix stopped");
    }

    /// Mixes one published set and notifies the consumer.
    pub(crate) fn deliver(&self, set: &SampleSet, format: CanonicalFormat, capture: Option<SourceId>) {
        {
            let mut guard = self.state.lock();
            if !guard.started || guard.fatal.is_some() {
                return;
            }
            let state = &mut *guard;
            let id = self.id;
            let is_capture = |source_id: SourceId| capture == Some(source_id);

            let capture_present = set
                .entries
                .iter()
                .any(|e| is_capture(e.source_id) && e.exclude_from != Some(id));
            let tone_active = capture_present
                && match state.tones.pop_front() {
                    Some(tone) => {
                        tone.render_into(format.sample_rate, format.depth, format.channels, &mut state.tone);
                        tracing::trace!(output = %id, %tone, "injecting dtmf tone");
                        true
                    }
                    None => false,
                };

            let len = if tone_active {
                set.max_count.max(state.tone.len())
            } else {
                set.max_count
            };
            let muted = state.mute;
            let tone = state.tone.as_slice();
            let inputs = set.entries.iter().filter_map(|entry| {
                if entry.exclude_from == Some(id) {
                    return None;
                }
                if is_capture(entry.source_id) {
                    if tone_active {
                        return Some(tone);
                    }
                    if muted {
                        return None;
                    }
                }
                entry.samples.as_deref()
            });

            let contributors = mix_into(inputs, len, format.depth, &mut state.acc, &mut state.frame);
            state.ready = true;
            state.discard = contributors == 0;
            state.timestamp = set.timestamp;
            state.format = format;
            if contributors > 0 {
                self.frames_mixed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.notify();
    }

    /// Records a fatal cycle error and notifies the consumer once.
    pub(crate) fn fail(&self, error: &MixerError) {
        {
            let mut state = self.state.lock();
            if !state.started || state.fatal.is_some() {
                return;
            }
            state.fatal = Some(error.clone());
            state.ready = false;
        }
        tracing::error!(output = %self.id, error = %error, "output mix failed");
        self.notify();
    }

    fn notify(&self) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Arc<Self> {
        AudioMixer::builder().build().create_output_mix().shared
    }

    /// An output flagged connected and started without touching its mixer.
    #[cfg(test)]
    pub(crate) fn started_for_tests() -> Arc<Self> {
        let shared = Self::detached_for_tests();
        {
            let mut state = shared.state.lock();
            state.connected = true;
            state.started = true;
        }
        shared
    }
}

impl PushStream for OutputShared {
    fn format(&self) -> AudioFormat {
        self.state.lock().format.to_audio_format()
    }

    fn read(&self, buffer: &mut MediaBuffer) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        if let Some(error) = &state.fatal {
            return Err(error.clone().into());
        }
        if !std::mem::take(&mut state.ready) {
            return Ok(());
        }
        buffer.timestamp = state.timestamp;
        if state.discard {
            buffer.flags.discard = true;
            return Ok(());
        }
        encode_le(&state.frame, state.format.depth, &mut buffer.data);
        buffer.format = Some(state.format.to_audio_format());
        Ok(())
    }

    fn set_transfer_handler(&self, handler: Option<TransferHandler>) {
        *self.handler.lock() = handler;
    }
}

impl InputSource for OutputMix {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn connect(&self) -> Result<(), SourceError> {
        self.shared.connect();
        Ok(())
    }

    fn disconnect(&self) {
        self.shared.disconnect();
    }

    fn start(&self) -> Result<(), SourceError> {
        self.shared.start()
    }

    fn stop(&self) {
        self.shared.stop();
    }

    fn streams(&self) -> Vec<Arc<dyn PushStream>> {
        if !self.is_connected() {
            return Vec::new();
        }
        vec![Arc::clone(&self.shared) as Arc<dyn PushStream>]
    }

    fn format(&self) -> Option<AudioFormat> {
        Some(self.shared.state.lock().format.to_audio_format())
    }

    fn set_format(&self, format: &AudioFormat) -> Result<(), SourceError> {
        let current = self.shared.state.lock().format.to_audio_format();
        if *format == current {
            Ok(())
        } else {
            Err(SourceError::custom("output mix format follows its mixer"))
        }
    }
}
