//! Registered input sources and their connect/start lifecycle.
//!
//! The registry is an arena of [`SourceEntry`] values keyed by [`SourceId`].
//! It is only ever mutated by the mixer while holding its registry lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::format::{AudioFormat, CanonicalFormat, PcmLayout};
use crate::output::OutputMixId;
use crate::source::{thin_ptr, InputSource, PushStream, SourceId, Transcoder, TranscoderFactory};
use crate::MixerError;

/// Cancellation flag shared between the registry and a background connect.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Connection state of one registered source.
#[derive(Debug, Clone, Default)]
pub(crate) enum Link {
    #[default]
    Idle,
    /// A transcoder is connecting on a background task.
    Connecting(CancelToken),
    Connected,
    /// Connect or transcoder creation failed; excluded from cycles.
    Failed,
}

/// A transcoder connect that has to run off the control path.
pub(crate) struct PendingConnect {
    pub(crate) token: CancelToken,
    pub(crate) transcoder: Arc<dyn Transcoder>,
}

impl std::fmt::Debug for PendingConnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnect")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

pub(crate) struct SourceEntry {
    pub(crate) id: SourceId,
    pub(crate) source: Arc<dyn InputSource>,
    pub(crate) exclude_from: Option<OutputMixId>,
    pub(crate) transcoder: Option<Arc<dyn Transcoder>>,
    pub(crate) link: Link,
    pub(crate) started: bool,
    /// Canonical format this source last refused to switch to.
    pub(crate) format_refused: Option<CanonicalFormat>,
}

impl SourceEntry {
    pub(crate) fn new(source: Arc<dyn InputSource>, exclude_from: Option<OutputMixId>) -> Self {
        Self {
            id: SourceId::next(),
            source,
            exclude_from,
            transcoder: None,
            link: Link::Idle,
            started: false,
            format_refused: None,
        }
    }

    /// The object the mixer actually reads: the transcoder if there is one.
    pub(crate) fn active(&self) -> Arc<dyn InputSource> {
        match &self.transcoder {
            Some(transcoder) => Arc::clone(transcoder) as Arc<dyn InputSource>,
            None => Arc::clone(&self.source),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected)
    }

    pub(crate) fn name(&self) -> &str {
        self.source.name()
    }

    /// Format of the active source.
    pub(crate) fn format(&self) -> Option<AudioFormat> {
        self.active().format()
    }

    /// Streams of the active source, empty unless connected.
    pub(crate) fn streams(&self) -> Vec<Arc<dyn PushStream>> {
        if self.is_connected() {
            self.active().streams()
        } else {
            Vec::new()
        }
    }

    /// Connects the source, creating its transcoder first if needed.
    ///
    /// Returns `Ok(Some(_))` when the transcoder must connect asynchronously;
    /// the entry is then [`Link::Connecting`] until the mixer folds the
    /// completion back in.
    pub(crate) fn connect(
        &mut self,
        factory: Option<&Arc<dyn TranscoderFactory>>,
    ) -> Result<Option<PendingConnect>, MixerError> {
        if !matches!(self.link, Link::Idle | Link::Failed) {
            return Ok(None);
        }
        let result = self.try_connect(factory);
        if result.is_err() {
            self.link = Link::Failed;
        }
        result
    }

    fn try_connect(
        &mut self,
        factory: Option<&Arc<dyn TranscoderFactory>>,
    ) -> Result<Option<PendingConnect>, MixerError> {
        if !needs_transcoder(self.source.format().as_ref()) {
            self.source
                .connect()
                .map_err(|e| MixerError::SourceConnectFailed {
                    source_name: self.name().to_string(),
                    reason: e.to_string(),
                })?;
            self.link = Link::Connected;
            return Ok(None);
        }

        let transcoder = match &self.transcoder {
            Some(transcoder) => Arc::clone(transcoder),
            None => {
                let factory = factory.ok_or_else(|| MixerError::TranscoderCreationFailed {
                    source_name: self.name().to_string(),
                    reason: "no transcoder factory configured".into(),
                })?;
                let transcoder = factory.create(Arc::clone(&self.source)).map_err(|e| {
                    MixerError::TranscoderCreationFailed {
                        source_name: self.name().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                self.transcoder = Some(Arc::clone(&transcoder));
                transcoder
            }
        };

        if transcoder.connects_asynchronously() {
            let token = CancelToken::default();
            self.link = Link::Connecting(token.clone());
            return Ok(Some(PendingConnect { token, transcoder }));
        }

        transcoder
            .connect()
            .map_err(|e| MixerError::TranscoderCreationFailed {
                source_name: self.name().to_string(),
                reason: e.to_string(),
            })?;
        self.link = Link::Connected;
        Ok(None)
    }

    /// Starts the active source if connected and not yet started.
    pub(crate) fn start(&mut self) -> Result<(), MixerError> {
        if !self.is_connected() || self.started {
            return Ok(());
        }
        self.active()
            .start()
            .map_err(|e| MixerError::SourceConnectFailed {
                source_name: self.name().to_string(),
                reason: format!("start failed: {e}"),
            })?;
        self.started = true;
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if self.started {
            self.started = false;
            self.active().stop();
        }
    }

    /// Stops and disconnects, cancelling a pending background connect.
    pub(crate) fn disconnect(&mut self) {
        self.stop();
        match std::mem::take(&mut self.link) {
            Link::Connected => self.active().disconnect(),
            Link::Connecting(token) => token.cancel(),
            Link::Idle | Link::Failed => {}
        }
    }
}

/// Returns `true` if the conversion table cannot handle `format` directly.
pub(crate) fn needs_transcoder(format: Option<&AudioFormat>) -> bool {
    format.is_some_and(|f| PcmLayout::of(f).is_err())
}

/// Arena of registered sources in registration order.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Vec<SourceEntry>,
}

impl Registry {
    /// Returns `true` if this exact source object is registered.
    pub(crate) fn contains<S: ?Sized>(&self, source: &Arc<S>) -> bool {
        let needle = thin_ptr(source);
        self.entries.iter().any(|e| thin_ptr(&e.source) == needle)
    }

    pub(crate) fn insert(&mut self, entry: SourceEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn get_mut(&mut self, id: SourceId) -> Option<&mut SourceEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    pub(crate) fn find<S: ?Sized>(&self, source: &Arc<S>) -> Option<&SourceEntry> {
        let needle = thin_ptr(source);
        self.entries.iter().find(|e| thin_ptr(&e.source) == needle)
    }

    /// Removes every entry whose source matches `predicate`.
    ///
    /// The removed entries are returned untouched; the caller tears them
    /// down after releasing the registry lock.
    pub(crate) fn remove_where<P>(&mut self, mut predicate: P) -> Vec<SourceEntry>
    where
        P: FnMut(&dyn InputSource) -> bool,
    {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if predicate(self.entries[i].source.as_ref()) {
                removed.push(self.entries.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SourceEntry> {
        self.entries.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut SourceEntry> {
        self.entries.iter_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
