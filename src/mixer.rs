//! The top-level mixer coordinating sources, the read loop and output mixes.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::builder::AudioMixerBuilder;
use crate::config::MixerConfig;
use crate::event::{emit, EventCallback, MixerEvent};
use crate::format::CanonicalFormat;
use crate::output::{OutputMix, OutputMixId, OutputShared};
use crate::pipeline::{
    needs_transcoder, CancelToken, Link, LoopId, PendingConnect, ReadLoop, Registry, SourceEntry,
    StreamSlot,
};
use crate::pool::{PoolStats, SampleBufferPool};
use crate::source::{thin_ptr, InputSource, SourceId, Transcoder, TranscoderFactory};
use crate::{MixerError, SourceError};

/// Mixes a dynamic set of input sources into any number of per-listener
/// [`OutputMix`]es.
///
/// Cloning is cheap and yields another handle to the same mixer.
///
/// # Lifecycle
///
/// Connect and start are reference counted across output mixes: the first
/// connected output connects every source, the first started output starts
/// them, and the last one to disconnect tears everything down. Sources added
/// or removed at any time are brought to the mixer's current state.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use conference_mixer::{AudioFormat, AudioMixer, MockSource};
///
/// let mixer = AudioMixer::builder().build();
/// let a = Arc::new(MockSource::new("a", AudioFormat::pcm_le(8000, 16, 1)));
/// let b = Arc::new(MockSource::new("b", AudioFormat::pcm_le(8000, 16, 1)));
/// mixer.add_input_source(a.clone(), None).unwrap();
/// mixer.add_input_source(b.clone(), None).unwrap();
///
/// let output = mixer.create_output_mix();
/// output.connect();
/// output.start().unwrap();
///
/// a.push_samples(&[100; 4]);
/// assert_eq!(output.read_chunk().unwrap().samples.as_slice(), &[100; 4]);
/// ```
#[derive(Clone)]
pub struct AudioMixer {
    shared: Arc<MixerShared>,
}

impl AudioMixer {
    /// Creates a builder for configuring a mixer.
    pub fn builder() -> AudioMixerBuilder {
        AudioMixerBuilder::new()
    }

    pub(crate) fn from_shared(shared: Arc<MixerShared>) -> Self {
        Self { shared }
    }

    /// Registers an input source.
    ///
    /// A source registered with `exclude_from` contributes to every output
    /// mix except that one. The source is connected and started right away
    /// if the mixer is.
    ///
    /// # Errors
    ///
    /// - [`MixerError::DuplicateSource`] if this exact source object is
    ///   already registered
    /// - [`MixerError::UnsupportedFormat`] if the source advertises a format
    ///   the mixer cannot convert and no transcoder factory is configured
    pub fn add_input_source(
        &self,
        source: Arc<dyn InputSource>,
        exclude_from: Option<&OutputMix>,
    ) -> Result<SourceId, MixerError> {
        self.shared.add_input_source(source, exclude_from.map(OutputMix::id))
    }

    /// Removes every source matching `predicate`. Returns how many were
    /// removed.
    ///
    /// Removed sources are absent from the next read cycle and are stopped
    /// and disconnected before this returns.
    pub fn remove_input_sources<P>(&self, predicate: P) -> usize
    where
        P: FnMut(&dyn InputSource) -> bool,
    {
        self.shared.remove_input_sources(predicate)
    }

    /// Removes one source by object identity. Returns `true` if it was
    /// registered.
    pub fn remove_input_source<S: InputSource + ?Sized>(&self, source: &Arc<S>) -> bool {
        let needle = thin_ptr(source);
        let removed = self
            .shared
            .remove_input_sources(|s| std::ptr::from_ref(s).cast::<()>() == needle);
        removed > 0
    }

    /// Adds one connect reference. The first connects every source.
    pub fn connect(&self) {
        self.shared.connect();
    }

    /// Drops one connect reference. The last disconnects every source.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Starts the sources on behalf of read loop `loop_id`.
    ///
    /// Calls carrying a superseded loop or a generation not newer than the
    /// last applied one are ignored.
    pub fn start(&self, loop_id: LoopId, generation: u64) {
        let mut state = self.shared.state.lock();
        self.shared.apply_start(&mut state, loop_id, generation);
    }

    /// Stops the sources on behalf of read loop `loop_id`.
    ///
    /// Stale calls are ignored the same way as for [`start`](Self::start).
    pub fn stop(&self, loop_id: LoopId, generation: u64) {
        let mut state = self.shared.state.lock();
        self.shared.apply_stop(&mut state, loop_id, generation);
    }

    /// Creates a new output mix.
    pub fn create_output_mix(&self) -> OutputMix {
        OutputMix::new(Arc::clone(&self.shared), OutputMixId::next())
    }

    /// The playback mix excluding the capture source, if the mixer was built
    /// with one.
    ///
    /// The mix lives as long as some handle to it does; once every handle is
    /// dropped the next call returns a fresh mix with the same exclusion.
    pub fn local_output_mix(&self) -> Option<OutputMix> {
        let id = self.shared.local_output_id?;
        let mut slot = self.shared.local_output.lock();
        if let Some(shared) = slot.upgrade() {
            return Some(OutputMix::from_shared(shared));
        }
        let output = OutputMix::new(Arc::clone(&self.shared), id);
        *slot = output.downgrade();
        Some(output)
    }

    /// Handle of the capture source passed to the builder.
    pub fn capture_source(&self) -> Option<SourceId> {
        self.shared.capture
    }

    /// The transcoder created for `source`, if it needed one.
    pub fn transcoder_for<S: InputSource + ?Sized>(&self, source: &Arc<S>) -> Option<Arc<dyn Transcoder>> {
        let state = self.shared.state.lock();
        state.registry.find(source).and_then(|e| e.transcoder.clone())
    }

    /// The format outputs currently mix in.
    pub fn canonical_format(&self) -> CanonicalFormat {
        let state = self.shared.state.lock();
        match &state.read_loop {
            Some(read_loop) => read_loop.format(),
            None => self.shared.negotiate(&state.registry),
        }
    }

    /// Number of registered sources, failed ones included.
    pub fn source_count(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    /// Returns `true` while at least one connect reference is held.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected > 0
    }

    /// Returns `true` while the sources are started.
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Identity of the current read loop, if one exists.
    pub fn read_loop_id(&self) -> Option<LoopId> {
        self.shared.state.lock().read_loop.as_ref().map(|rl| rl.id())
    }

    /// Sample buffer pool counters.
    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }
}

impl std::fmt::Debug for AudioMixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("AudioMixer")
            .field("sources", &state.registry.len())
            .field("connected", &state.connected)
            .field("started", &state.started)
            .field("read_loop", &state.read_loop.as_ref().map(|rl| rl.id()))
            .finish_non_exhaustive()
    }
}

struct MixerState {
    registry: Registry,
    /// Connect references held by outputs and callers.
    connected: usize,
    started: bool,
    /// Newest start/stop generation applied.
    started_generation: u64,
    /// Buffer length every source was equalized to on first connect.
    buffer_length: Option<Duration>,
    read_loop: Option<Arc<ReadLoop>>,
}

pub(crate) struct MixerShared {
    config: MixerConfig,
    pool: Arc<SampleBufferPool>,
    factory: Option<Arc<dyn TranscoderFactory>>,
    runtime: Option<Handle>,
    on_event: Option<EventCallback>,
    capture: Option<SourceId>,
    local_output_id: Option<OutputMixId>,
    local_output: Mutex<Weak<OutputShared>>,
    state: Mutex<MixerState>,
    this: Weak<MixerShared>,
}

impl MixerShared {
    pub(crate) fn new(
        config: MixerConfig,
        factory: Option<Arc<dyn TranscoderFactory>>,
        runtime: Option<Handle>,
        on_event: Option<EventCallback>,
        capture_source: Option<Arc<dyn InputSource>>,
    ) -> Arc<Self> {
        let mut registry = Registry::default();
        let mut capture = None;
        let mut local_output_id = None;
        if let Some(source) = capture_source {
            let local = OutputMixId::next();
            let entry = SourceEntry::new(source, Some(local));
            tracing::info!(source = %entry.id, name = %entry.name(), "capture source registered");
            emit(
                on_event.as_ref(),
                MixerEvent::SourceAdded {
                    source_id: entry.id,
                    name: entry.name().to_string(),
                },
            );
            capture = Some(entry.id);
            local_output_id = Some(local);
            registry.insert(entry);
        }

        let pool = Arc::new(SampleBufferPool::with_max_samples(
            config.pool_buffers_per_class,
            config.max_buffer_samples,
        ));
        Arc::new_cyclic(|this| Self {
            config,
            pool,
            factory,
            runtime,
            on_event,
            capture,
            local_output_id,
            local_output: Mutex::new(Weak::new()),
            state: Mutex::new(MixerState {
                registry,
                connected: 0,
                started: false,
                started_generation: 0,
                buffer_length: None,
                read_loop: None,
            }),
            this: this.clone(),
        })
    }

    pub(crate) fn default_format(&self) -> CanonicalFormat {
        self.config.default_format
    }

    pub(crate) fn event_callback(&self) -> Option<EventCallback> {
        self.on_event.clone()
    }

    fn add_input_source(
        &self,
        source: Arc<dyn InputSource>,
        exclude_from: Option<OutputMixId>,
    ) -> Result<SourceId, MixerError> {
        let name = source.name().to_string();
        let (id, pending) = {
            let mut state = self.state.lock();
            if state.registry.contains(&source) {
                return Err(MixerError::DuplicateSource { source_name: name });
            }
            if self.factory.is_none() {
                if let Some(format) = source.format().filter(|f| needs_transcoder(Some(f))) {
                    return Err(MixerError::unsupported(&format, "no transcoder factory configured"));
                }
            }

            let mut entry = SourceEntry::new(source, exclude_from);
            let id = entry.id;
            tracing::info!(source = %id, name = %name, "input source added");
            emit(
                self.on_event.as_ref(),
                MixerEvent::SourceAdded {
                    source_id: id,
                    name,
                },
            );

            let pending = if state.connected > 0 {
                self.connect_entry(&mut entry, state.started, state.buffer_length)
            } else {
                None
            };
            state.registry.insert(entry);
            self.refresh_read_loop(&mut state, false);
            (id, pending)
        };

        if let Some(pending) = pending {
            self.launch_connect(id, pending);
        }
        Ok(id)
    }

    fn remove_input_sources<P>(&self, predicate: P) -> usize
    where
        P: FnMut(&dyn InputSource) -> bool,
    {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.registry.remove_where(predicate);
            if !removed.is_empty() {
                self.refresh_read_loop(&mut state, false);
            }
            removed
        };

        let count = removed.len();
        for mut entry in removed {
            entry.disconnect();
            tracing::info!(source = %entry.id, name = %entry.name(), "input source removed");
            emit(
                self.on_event.as_ref(),
                MixerEvent::SourceRemoved {
                    source_id: entry.id,
                },
            );
        }
        count
    }

    pub(crate) fn connect(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.connected += 1;
            if state.connected > 1 {
                return;
            }

            let mut pending = Vec::new();
            for entry in state.registry.iter_mut() {
                if let Some(p) = self.connect_entry(entry, false, None) {
                    pending.push((entry.id, p));
                }
            }
            state.buffer_length = Some(self.equalize_buffer_lengths(&state.registry));
            self.refresh_read_loop(&mut state, false);
            tracing::info!(sources = state.registry.len(), "mixer connected");
            pending
        };

        for (id, p) in pending {
            self.launch_connect(id, p);
        }
    }

    pub(crate) fn disconnect(&self) {
        let mut state = self.state.lock();
        if state.connected == 0 {
            return;
        }
        state.connected -= 1;
        if state.connected > 0 {
            return;
        }

        if let Some(read_loop) = state.read_loop.take() {
            read_loop.close();
        }
        for entry in state.registry.iter_mut() {
            entry.disconnect();
        }
        state.started = false;
        state.started_generation = 0;
        state.buffer_length = None;
        tracing::info!("mixer disconnected");
    }

    /// Attaches a started output to the current read loop, creating the loop
    /// if needed. Returns the format the output will receive.
    pub(crate) fn attach_output(&self, output: Arc<OutputShared>) -> CanonicalFormat {
        let mut state = self.state.lock();
        let Some(read_loop) = self.refresh_read_loop(&mut state, true) else {
            return self.config.default_format;
        };
        if let Some(generation) = read_loop.attach(output) {
            self.apply_start(&mut state, read_loop.id(), generation);
        }
        state.read_loop.as_ref().map_or(read_loop.format(), |rl| rl.format())
    }

    pub(crate) fn detach_output(&self, id: OutputMixId) {
        let mut state = self.state.lock();
        let Some(read_loop) = state.read_loop.clone() else {
            return;
        };
        if let Some(generation) = read_loop.detach(id) {
            self.apply_stop(&mut state, read_loop.id(), generation);
        }
    }

    fn is_current(state: &MixerState, loop_id: LoopId, generation: u64, action: &str) -> bool {
        let current = state.read_loop.as_ref().map(|rl| rl.id());
        if current != Some(loop_id) || generation <= state.started_generation {
            tracing::debug!(
                read_loop = %loop_id,
                generation,
                applied = state.started_generation,
                action,
                "ignoring stale request"
            );
            return false;
        }
        true
    }

    fn apply_start(&self, state: &mut MixerState, loop_id: LoopId, generation: u64) {
        if !Self::is_current(state, loop_id, generation, "start") {
            return;
        }
        state.started_generation = generation;
        if state.started {
            return;
        }
        state.started = true;

        let mut dropped = false;
        for entry in state.registry.iter_mut() {
            if let Err(e) = entry.start() {
                self.fail_entry(entry, &e);
                dropped = true;
            }
        }
        tracing::info!(read_loop = %loop_id, generation, "mixer started");
        if dropped {
            self.refresh_read_loop(state, false);
        }
    }

    fn apply_stop(&self, state: &mut MixerState, loop_id: LoopId, generation: u64) {
        if !Self::is_current(state, loop_id, generation, "stop") {
            return;
        }
        state.started_generation = generation;
        if !state.started {
            return;
        }
        state.started = false;
        for entry in state.registry.iter_mut() {
            entry.stop();
        }
        tracing::info!(read_loop = %loop_id, generation, "mixer stopped");
    }

    /// Connects one entry and brings it to the current start state.
    ///
    /// Returns the pending connect of an asynchronously connecting
    /// transcoder; the caller launches it once the registry lock is released.
    fn connect_entry(
        &self,
        entry: &mut SourceEntry,
        started: bool,
        buffer_length: Option<Duration>,
    ) -> Option<PendingConnect> {
        match entry.connect(self.factory.as_ref()) {
            Ok(Some(pending)) => {
                tracing::debug!(source = %entry.id, name = %entry.name(), "transcoder connecting in background");
                Some(pending)
            }
            Ok(None) => {
                if entry.is_connected() {
                    self.entry_connected(entry, started, buffer_length);
                }
                None
            }
            Err(e) => {
                self.fail_entry(entry, &e);
                None
            }
        }
    }

    fn entry_connected(&self, entry: &mut SourceEntry, started: bool, buffer_length: Option<Duration>) {
        if let Some(length) = buffer_length {
            entry.active().set_buffer_length(length);
        }
        tracing::info!(source = %entry.id, name = %entry.name(), format = ?entry.format(), "input source connected");
        if started {
            if let Err(e) = entry.start() {
                self.fail_entry(entry, &e);
            }
        }
    }

    fn fail_entry(&self, entry: &mut SourceEntry, error: &MixerError) {
        tracing::error!(source = %entry.id, name = %entry.name(), error = %error, "input source dropped");
        entry.disconnect();
        entry.link = Link::Failed;
        emit(
            self.on_event.as_ref(),
            MixerEvent::SourceDropped {
                source_id: entry.id,
                reason: error.to_string(),
            },
        );
    }

    /// Applies one buffer length to every connected source.
    fn equalize_buffer_lengths(&self, registry: &Registry) -> Duration {
        let length = registry
            .iter()
            .filter(|e| e.is_connected())
            .find_map(|e| e.active().buffer_length())
            .unwrap_or(self.config.default_buffer_length);
        for entry in registry.iter().filter(|e| e.is_connected()) {
            entry.active().set_buffer_length(length);
        }
        tracing::debug!(?length, "buffer lengths equalized");
        length
    }

    /// Picks the mixing format: the first connected source advertising a
    /// usable signed little-endian format, else the configured default.
    fn negotiate(&self, registry: &Registry) -> CanonicalFormat {
        registry
            .iter()
            .filter(|e| e.is_connected())
            .filter_map(SourceEntry::format)
            .find_map(|f| CanonicalFormat::try_from(&f).ok())
            .unwrap_or(self.config.default_format)
    }

    /// Asks connected linear sources in another format to switch.
    ///
    /// A refusal is remembered, so a source is asked again only once the
    /// canonical format changes.
    fn request_format(registry: &mut Registry, canonical: CanonicalFormat) {
        let target = canonical.to_audio_format();
        for entry in registry.iter_mut().filter(|e| e.is_connected()) {
            let Some(format) = entry.format() else {
                continue;
            };
            if !format.matches(&target)
                || CanonicalFormat::try_from(&format).ok() == Some(canonical)
                || entry.format_refused == Some(canonical)
            {
                continue;
            }
            match entry.active().set_format(&target) {
                Ok(()) => {
                    entry.format_refused = None;
                    tracing::debug!(source = %entry.id, from = %format, to = %target, "source switched format");
                }
                Err(e) => {
                    entry.format_refused = Some(canonical);
                    tracing::warn!(
                        source = %entry.id,
                        format = %format,
                        canonical = %canonical,
                        error = %e,
                        "source kept its format"
                    );
                }
            }
        }
    }

    fn stream_slots(registry: &Registry) -> Vec<StreamSlot> {
        registry
            .iter()
            .flat_map(|entry| {
                entry.streams().into_iter().map(move |stream| StreamSlot {
                    source_id: entry.id,
                    exclude_from: entry.exclude_from,
                    stream,
                })
            })
            .collect()
    }

    /// Re-negotiates the format and hands the current stream list to the
    /// read loop.
    ///
    /// A format change replaces the loop, migrating its outputs. With
    /// `create` unset no loop is created when none exists.
    fn refresh_read_loop(&self, state: &mut MixerState, create: bool) -> Option<Arc<ReadLoop>> {
        let format = self.negotiate(&state.registry);
        Self::request_format(&mut state.registry, format);
        let read_loop = match state.read_loop.take() {
            Some(current) if current.format() == format => current,
            Some(old) => {
                let read_loop = self.new_read_loop(format);
                old.close();
                old.migrate_outputs(&read_loop);
                tracing::info!(
                    from = %old.format(),
                    to = %format,
                    read_loop = %read_loop.id(),
                    "canonical format changed"
                );
                read_loop
            }
            None if create => {
                state.started_generation = 0;
                let read_loop = self.new_read_loop(format);
                tracing::info!(format = %format, read_loop = %read_loop.id(), "canonical format negotiated");
                read_loop
            }
            None => return None,
        };

        read_loop.set_streams(Self::stream_slots(&state.registry));
        state.read_loop = Some(Arc::clone(&read_loop));
        Some(read_loop)
    }

    fn new_read_loop(&self, format: CanonicalFormat) -> Arc<ReadLoop> {
        emit(self.on_event.as_ref(), MixerEvent::FormatNegotiated { format });
        ReadLoop::new(
            format,
            self.config.trigger,
            self.capture,
            Arc::clone(&self.pool),
            self.on_event.clone(),
        )
    }

    /// Runs a transcoder connect off the control path.
    ///
    /// Uses the mixer's runtime, falling back to the ambient one; without
    /// any runtime the connect runs inline.
    fn launch_connect(&self, id: SourceId, pending: PendingConnect) {
        let this = self.this.clone();
        let task = move || {
            let PendingConnect { token, transcoder } = pending;
            let result = transcoder.connect();
            match this.upgrade() {
                Some(shared) => shared.transcoder_connected(id, &token, transcoder, result),
                None => {
                    if result.is_ok() {
                        transcoder.disconnect();
                    }
                }
            }
        };

        match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => drop(handle.spawn_blocking(task)),
            None => task(),
        }
    }

    /// Folds a finished background connect back into the registry.
    fn transcoder_connected(
        &self,
        id: SourceId,
        token: &CancelToken,
        transcoder: Arc<dyn Transcoder>,
        result: Result<(), SourceError>,
    ) {
        let mut state = self.state.lock();
        let started = state.started;
        let buffer_length = state.buffer_length;
        let entry = state
            .registry
            .get_mut(id)
            .filter(|e| matches!(&e.link, Link::Connecting(t) if t.same(token)))
            .filter(|_| !token.is_cancelled());
        let Some(entry) = entry else {
            drop(state);
            tracing::debug!(source = %id, "discarding stale transcoder connect");
            if result.is_ok() {
                transcoder.disconnect();
            }
            return;
        };

        match result {
            Ok(()) => {
                entry.link = Link::Connected;
                self.entry_connected(entry, started, buffer_length);
                emit(self.on_event.as_ref(), MixerEvent::TranscoderConnected { source_id: id });
                self.refresh_read_loop(&mut state, false);
            }
            Err(e) => {
                let error = MixerError::TranscoderCreationFailed {
                    source_name: entry.name().to_string(),
                    reason: e.to_string(),
                };
                entry.link = Link::Failed;
                tracing::error!(source = %id, error = %error, "input source dropped");
                emit(
                    self.on_event.as_ref(),
                    MixerEvent::SourceDropped {
                        source_id: id,
                        reason: error.to_string(),
                    },
                );
            }
        }
    }
}
