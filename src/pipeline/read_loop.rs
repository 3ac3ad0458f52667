//! The push-driven read cycle.
//!
//! A [`ReadLoop`] installs a transfer handler on every contributing stream.
//! Whenever a producer signals new data, the cycle runs synchronously in the
//! producer's thread:
//!
//! 1. read whatever every stream has available
//! 2. convert it to the canonical format into pool buffers
//! 3. zero-pad everything to the cycle's maximum sample count
//! 4. deliver the set to every attached output, then return the buffers
//!
//! The cycle lock serializes overlapping notifications, so exactly one
//! [`SampleSet`] is ever in flight. A cycle that fails with a fatal
//! [`MixerError`] fails every attached output instead of publishing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::CycleTrigger;
use crate::event::{emit, EventCallback, MixerEvent};
use crate::format::{decode_into, AudioFormat, CanonicalFormat, PcmLayout};
use crate::output::{OutputMixId, OutputShared};
use crate::pipeline::sample_set::{SampleEntry, SampleSet};
use crate::pool::SampleBufferPool;
use crate::source::{thin_ptr, MediaBuffer, PushStream, SourceId, TransferHandler};
use crate::MixerError;

/// Identity of one read loop instance.
///
/// Every canonical format change creates a loop under a fresh id, so a
/// start/stop addressed to a superseded loop can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u64);

impl LoopId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for LoopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// A stream the loop reads, with the registration it came from.
#[derive(Clone)]
pub(crate) struct StreamSlot {
    pub(crate) source_id: SourceId,
    pub(crate) exclude_from: Option<OutputMixId>,
    pub(crate) stream: Arc<dyn PushStream>,
}

impl StreamSlot {
    fn key(&self) -> usize {
        thin_ptr(&self.stream) as usize
    }
}

/// Conditions reported once per source rather than every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FormatWarning {
    Rate(SourceId, u32),
    Unsupported(SourceId, u16, u16),
}

struct CycleState {
    streams: Vec<StreamSlot>,
    buffer: MediaBuffer,
    set: SampleSet,
    warned: HashSet<FormatWarning>,
}

#[derive(Default)]
struct Outputs {
    list: Vec<Arc<OutputShared>>,
    generation: u64,
}

pub(crate) struct ReadLoop {
    id: LoopId,
    format: CanonicalFormat,
    trigger: CycleTrigger,
    capture: Option<SourceId>,
    pool: Arc<SampleBufferPool>,
    on_event: Option<EventCallback>,
    cycle: Mutex<CycleState>,
    outputs: Mutex<Outputs>,
    this: Weak<ReadLoop>,
}

impl ReadLoop {
    pub(crate) fn new(
        format: CanonicalFormat,
        trigger: CycleTrigger,
        capture: Option<SourceId>,
        pool: Arc<SampleBufferPool>,
        on_event: Option<EventCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: LoopId::next(),
            format,
            trigger,
            capture,
            pool,
            on_event,
            cycle: Mutex::new(CycleState {
                streams: Vec::new(),
                buffer: MediaBuffer::new(),
                set: SampleSet::default(),
                warned: HashSet::new(),
            }),
            outputs: Mutex::new(Outputs::default()),
            this: this.clone(),
        })
    }

    pub(crate) fn id(&self) -> LoopId {
        self.id
    }

    pub(crate) fn format(&self) -> CanonicalFormat {
        self.format
    }

    #[cfg(test)]
    pub(crate) fn stream_count(&self) -> usize {
        self.cycle.lock().streams.len()
    }

    /// Replaces the stream list, moving transfer handlers accordingly.
    ///
    /// Takes the cycle lock, so an in-flight cycle completes with the old
    /// list and the next one sees the new list.
    pub(crate) fn set_streams(&self, streams: Vec<StreamSlot>) {
        let mut cycle = self.cycle.lock();
        let old = std::mem::replace(&mut cycle.streams, streams);

        for slot in &old {
            if !cycle.streams.iter().any(|s| s.key() == slot.key()) {
                slot.stream.set_transfer_handler(None);
            }
        }
        for slot in &cycle.streams {
            if !old.iter().any(|s| s.key() == slot.key()) {
                slot.stream.set_transfer_handler(Some(self.handler_for(slot.key())));
            }
        }
        tracing::trace!(read_loop = %self.id, streams = cycle.streams.len(), "streams updated");
    }

    /// Detaches from every stream.
    pub(crate) fn close(&self) {
        self.set_streams(Vec::new());
    }

    fn handler_for(&self, key: usize) -> TransferHandler {
        let this = self.this.clone();
        Arc::new(move || {
            if let Some(read_loop) = this.upgrade() {
                read_loop.run_cycle(key);
            }
        })
    }

    /// Attaches an output. Returns a start generation if it is the first.
    pub(crate) fn attach(&self, output: Arc<OutputShared>) -> Option<u64> {
        let mut outputs = self.outputs.lock();
        if outputs.list.iter().any(|o| Arc::ptr_eq(o, &output)) {
            return None;
        }
        outputs.list.push(output);
        if outputs.list.len() == 1 {
            outputs.generation += 1;
            Some(outputs.generation)
        } else {
            None
        }
    }

    /// Detaches an output. Returns a stop generation if it was the last.
    pub(crate) fn detach(&self, id: OutputMixId) -> Option<u64> {
        let mut outputs = self.outputs.lock();
        let before = outputs.list.len();
        outputs.list.retain(|o| o.id() != id);
        if before > 0 && outputs.list.is_empty() {
            outputs.generation += 1;
            Some(outputs.generation)
        } else {
            None
        }
    }

    /// Moves every attached output (and the generation counter) to `to`.
    pub(crate) fn migrate_outputs(&self, to: &ReadLoop) {
        let moved = std::mem::take(&mut *self.outputs.lock());
        let mut target = to.outputs.lock();
        target.generation = target.generation.max(moved.generation);
        target.list.extend(moved.list);
    }

    /// Runs one cycle on behalf of the stream identified by `key`.
    pub(crate) fn run_cycle(&self, key: usize) {
        let mut cycle = self.cycle.lock();
        if self.trigger == CycleTrigger::PrimaryStream
            && cycle.streams.first().map(StreamSlot::key) != Some(key)
        {
            return;
        }

        let state = &mut *cycle;
        match self.read_streams(state) {
            Ok(true) => self.publish(&state.set),
            Ok(false) => {}
            Err(e) => {
                tracing::error!(read_loop = %self.id, error = %e, "read cycle aborted");
                emit(
                    self.on_event.as_ref(),
                    MixerEvent::CycleFailed {
                        error: e.to_string(),
                    },
                );
                if e.is_fatal() {
                    self.fail_outputs(&e);
                }
            }
        }
        state.set.release(&self.pool);
    }

    /// Reads and converts every stream into `state.set`.
    ///
    /// Returns `Ok(false)` when no stream delivered anything.
    fn read_streams(&self, state: &mut CycleState) -> Result<bool, MixerError> {
        let CycleState {
            streams,
            buffer,
            set,
            warned,
        } = state;

        let mut max_count = 0;
        for slot in streams.iter() {
            buffer.reset();
            let samples = match slot.stream.read(buffer) {
                Ok(()) => self.convert(slot, buffer, warned, &mut max_count, &mut set.timestamp)?,
                Err(e) => {
                    tracing::debug!(source = %slot.source_id, error = %e, "stream read failed");
                    None
                }
            };
            set.entries.push(SampleEntry {
                source_id: slot.source_id,
                exclude_from: slot.exclude_from,
                samples,
            });
        }

        set.max_count = max_count;
        if max_count == 0 {
            return Ok(false);
        }
        set.pad();
        tracing::trace!(
            read_loop = %self.id,
            streams = set.entries.len(),
            samples = max_count,
            "sample set built"
        );
        Ok(true)
    }

    fn convert(
        &self,
        slot: &StreamSlot,
        buffer: &mut MediaBuffer,
        warned: &mut HashSet<FormatWarning>,
        max_count: &mut usize,
        timestamp: &mut Option<std::time::Duration>,
    ) -> Result<Option<Vec<i32>>, MixerError> {
        if buffer.is_discard() || buffer.data.is_empty() {
            return Ok(None);
        }
        let format = buffer.format.take().unwrap_or_else(|| slot.stream.format());
        let Some(layout) = self.check_format(slot.source_id, &format, warned) else {
            return Ok(None);
        };

        let count = buffer.data.len() / layout.depth.bytes();
        *max_count = (*max_count).max(count);
        // Silence still counts towards the cycle length.
        if buffer.is_silence() || count == 0 {
            return Ok(None);
        }

        let mut samples = self.pool.allocate(count)?;
        decode_into(layout, &buffer.data, self.format.depth, &mut samples);
        if timestamp.is_none() {
            *timestamp = buffer.timestamp;
        }
        Ok(Some(samples))
    }

    fn check_format(
        &self,
        source_id: SourceId,
        format: &AudioFormat,
        warned: &mut HashSet<FormatWarning>,
    ) -> Option<PcmLayout> {
        let layout = PcmLayout::of(format)
            .ok()
            .filter(|_| format.channels == self.format.channels);
        let Some(layout) = layout else {
            let key = FormatWarning::Unsupported(source_id, format.sample_size_bits, format.channels);
            if warned.insert(key) {
                tracing::warn!(source = %source_id, format = %format, "unsupported stream format, skipping");
                emit(
                    self.on_event.as_ref(),
                    MixerEvent::UnsupportedFormat {
                        source_id,
                        format: format.to_string(),
                    },
                );
            }
            return None;
        };

        if format.sample_rate != self.format.sample_rate
            && warned.insert(FormatWarning::Rate(source_id, format.sample_rate))
        {
            tracing::warn!(
                source = %source_id,
                expected = self.format.sample_rate,
                actual = format.sample_rate,
                "sample rate mismatch, mixing without resampling"
            );
            emit(
                self.on_event.as_ref(),
                MixerEvent::SampleRateMismatch {
                    source_id,
                    expected: self.format.sample_rate,
                    actual: format.sample_rate,
                },
            );
        }
        Some(layout)
    }

    fn publish(&self, set: &SampleSet) {
        let outputs = self.outputs.lock();
        for output in &outputs.list {
            output.deliver(set, self.format, self.capture);
        }
    }

    fn fail_outputs(&self, error: &MixerError) {
        let outputs = self.outputs.lock();
        for output in &outputs.list {
            output.fail(error);
        }
    }
}
