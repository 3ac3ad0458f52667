//! One read cycle's snapshot of converted samples.

use std::time::Duration;

use crate::output::OutputMixId;
use crate::pool::SampleBufferPool;
use crate::source::SourceId;

/// Samples one stream contributed to a cycle.
#[derive(Debug)]
pub(crate) struct SampleEntry {
    pub(crate) source_id: SourceId,
    pub(crate) exclude_from: Option<OutputMixId>,
    /// `None` when the stream delivered silence or nothing usable.
    pub(crate) samples: Option<Vec<i32>>,
}

/// A cycle's per-stream sample arrays, all padded to `max_count`.
///
/// Sample arrays are pool buffers; [`release`](Self::release) hands them back
/// once every output has consumed the set.
#[derive(Debug, Default)]
pub(crate) struct SampleSet {
    pub(crate) entries: Vec<SampleEntry>,
    pub(crate) max_count: usize,
    pub(crate) timestamp: Option<Duration>,
}

impl SampleSet {
    /// Zero-pads every contribution to `max_count`.
    pub(crate) fn pad(&mut self) {
        let max = self.max_count;
        for samples in self.entries.iter_mut().filter_map(|e| e.samples.as_mut()) {
            if samples.len() < max {
                samples.resize(max, 0);
            }
        }
    }

    /// Number of entries carrying samples.
    #[cfg(test)]
    pub(crate) fn contributing(&self) -> usize {
        self.entries.iter().filter(|e| e.samples.is_some()).count()
    }

    /// Returns every sample array to the pool, keeping the entry list for reuse.
    pub(crate) fn release(&mut self, pool: &SampleBufferPool) {
        for entry in self.entries.drain(..) {
            if let Some(samples) = entry.samples {
                pool.deallocate(samples);
            }
        }
        self.max_count = 0;
        self.timestamp = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, samples: Option<Vec<i32>>) -> SampleEntry {
        SampleEntry {
            source_id: SourceId::new(id),
            exclude_from: None,
            samples,
        }
    }

    #[test]
    fn test_pad_extends_short_entries() {
        let mut set = SampleSet {
            entries: vec![entry(1, Some(vec![1; 6])), entry(2, Some(vec![2; 2])), entry(3, None)],
            max_count: 6,
            timestamp: None,
        };
        set.pad();
        assert_eq!(set.entries[1].samples.as_deref(), Some(&[2, 2, 0, 0, 0, 0][..]));
        assert!(set.entries[2].samples.is_none());
        assert_eq!(set.contributing(), 2);
    }

    #[test]
    fn test_release_returns_buffers() {
        let pool = SampleBufferPool::new(4);
        let mut set = SampleSet {
            entries: vec![entry(1, Some(pool.allocate(64).unwrap())), entry(2, None)],
            max_count: 64,
            timestamp: Some(Duration::from_millis(1)),
        };
        set.release(&pool);
        assert!(set.entries.is_empty());
        assert_eq!(set.max_count, 0);
        assert_eq!(pool.idle(), 1);
    }
}
