//! Reusable per-cycle sample buffers.
//!
//! Each read cycle needs one sample array per contributing stream. The pool
//! keeps returned arrays on fixed-capacity free lists keyed by power-of-two
//! size class, so a steady-state conference allocates nothing per cycle.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::MixerError;

/// Smallest size class, as a power of two (64 samples).
const MIN_CLASS_SHIFT: u32 = 6;

/// Number of size classes (up to 2^31 samples).
const CLASS_COUNT: usize = 26;

/// Largest buffer any pool hands out, in samples.
pub(crate) const MAX_BUFFER_SAMPLES: usize = 1 << (CLASS_COUNT - 1 + MIN_CLASS_SHIFT as usize);

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created with a fresh allocation.
    pub fresh_allocations: u64,
    /// Allocations served from a free list.
    pub reused: u64,
    /// Buffers returned to a free list.
    pub returned: u64,
    /// Returned buffers dropped because their free list was full.
    pub discarded: u64,
}

/// Pool of `i32` sample buffers.
///
/// Functionally equivalent to allocating a fresh `vec![0; n]` every time.
///
/// # Example
///
/// ```
/// use conference_mixer::SampleBufferPool;
///
/// let pool = SampleBufferPool::new(4);
/// let buffer = pool.allocate(160).unwrap();
/// assert_eq!(buffer.len(), 160);
/// pool.deallocate(buffer);
///
/// let again = pool.allocate(160).unwrap();
/// assert_eq!(pool.stats().fresh_allocations, 1);
/// # drop(again);
/// ```
pub struct SampleBufferPool {
    classes: Mutex<Vec<Vec<Vec<i32>>>>,
    per_class: usize,
    max_samples: usize,
    fresh_allocations: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

impl SampleBufferPool {
    /// Creates a pool keeping at most `per_class` idle buffers per size class.
    pub fn new(per_class: usize) -> Self {
        Self::with_max_samples(per_class, MAX_BUFFER_SAMPLES)
    }

    /// Creates a pool that refuses requests above `max_samples`.
    ///
    /// A refused request fails the same way an exhausted allocator does.
    pub fn with_max_samples(per_class: usize, max_samples: usize) -> Self {
        // Free lists are reserved up front and never grow past `per_class`.
        let classes = (0..CLASS_COUNT)
            .map(|_| Vec::with_capacity(per_class))
            .collect();
        Self {
            classes: Mutex::new(classes),
            per_class,
            max_samples: max_samples.min(MAX_BUFFER_SAMPLES),
            fresh_allocations: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Returns a zeroed buffer of length `min_size`.
    ///
    /// The buffer's capacity is at least `min_size`; a fresh allocation
    /// happens only when no pooled buffer qualifies.
    ///
    /// # Errors
    ///
    /// Returns [`MixerError::BufferAllocation`] if `min_size` exceeds the
    /// pool's limit or memory for a new buffer cannot be reserved.
    pub fn allocate(&self, min_size: usize) -> Result<Vec<i32>, MixerError> {
        if min_size > self.max_samples {
            return Err(MixerError::BufferAllocation {
                requested: min_size,
            });
        }
        let class = class_for_request(min_size)?;

        let pooled = {
            let mut classes = self.classes.lock();
            classes[class..].iter_mut().find_map(Vec::pop)
        };

        let mut buffer = match pooled {
            Some(buffer) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                let mut buffer = Vec::new();
                buffer
                    .try_reserve_exact(1usize << (class as u32 + MIN_CLASS_SHIFT))
                    .map_err(|_| MixerError::BufferAllocation {
                        requested: min_size,
                    })?;
                self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
                buffer
            }
        };

        buffer.clear();
        buffer.resize(min_size, 0);
        Ok(buffer)
    }

    /// Returns a buffer to the pool.
    ///
    /// Buffers too small for the smallest class, or arriving when their
    /// class is full, are dropped.
    pub fn deallocate(&self, mut buffer: Vec<i32>) {
        let Some(class) = class_for_capacity(buffer.capacity()) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };
        buffer.clear();

        let mut classes = self.classes.lock();
        let list = &mut classes[class];
        if list.len() < self.per_class {
            list.push(buffer);
            self.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(classes);
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of idle buffers currently pooled.
    pub fn idle(&self) -> usize {
        self.classes.lock().iter().map(Vec::len).sum()
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            fresh_allocations: self.fresh_allocations.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for SampleBufferPool {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_POOL_BUFFERS_PER_CLASS)
    }
}

impl std::fmt::Debug for SampleBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBufferPool")
            .field("per_class", &self.per_class)
            .field("max_samples", &self.max_samples)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Smallest class whose buffers hold `size` samples.
fn class_for_request(size: usize) -> Result<usize, MixerError> {
    let shift = size.max(1).next_power_of_two().trailing_zeros();
    let class = shift.saturating_sub(MIN_CLASS_SHIFT) as usize;
    if class >= CLASS_COUNT {
        return Err(MixerError::BufferAllocation { requested: size });
    }
    Ok(class)
}

/// Largest class every buffer of `capacity` can serve.
fn class_for_capacity(capacity: usize) -> Option<usize> {
    if capacity < (1 << MIN_CLASS_SHIFT) {
        return None;
    }
    let shift = usize::BITS - 1 - capacity.leading_zeros();
    Some(((shift - MIN_CLASS_SHIFT) as usize).min(CLASS_COUNT - 1))
}
