//! Per-input timeframe slicer.
//!
//! Groups consecutive blocks of one `(equipment, link)` source that share a
//! timeframe id into a [`DataSet`]. A slice closes when the source's
//! timeframe changes, when the undefined id shows up (each such block is
//! published alone), on inactivity timeout, or when the aggregator flushes.

use readout_core::block::{DataBlock, UNDEFINED_LINK_ID, UNDEFINED_TIMEFRAME_ID};
use readout_core::rdh::MAX_LINK_ID;
use readout_core::DataSet;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum SlicerError {
    #[error("wrong link id {0} > {MAX_LINK_ID}")]
    LinkIdOutOfRange(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SourceId {
    equipment_id: i32,
    link_id: i32,
}

struct PartialSlice {
    open: Option<DataSet>,
    timeframe_id: u64,
    /// Monotonic seconds of the last append, for the inactivity timeout.
    last_append: f64,
}

/// Slicer state for one aggregator input.
#[derive(Default)]
pub struct DataBlockSlicer {
    partials: HashMap<SourceId, PartialSlice>,
    completed: VecDeque<DataSet>,
}

impl DataBlockSlicer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block to its source's open slice, closing the previous
    /// slice first if the timeframe changed (or is undefined). Returns the
    /// open slice's new size.
    pub fn append(&mut self, block: DataBlock, now: f64) -> Result<usize, SlicerError> {
        let header = block.header();
        let source = SourceId {
            equipment_id: header.equipment_id,
            link_id: header.link_id,
        };
        if source.link_id != UNDEFINED_LINK_ID && source.link_id > i32::from(MAX_LINK_ID) {
            error!(link_id = source.link_id, "wrong link id in block header");
            return Err(SlicerError::LinkIdOutOfRange(source.link_id));
        }

        let partial = self.partials.entry(source).or_insert(PartialSlice {
            open: None,
            timeframe_id: UNDEFINED_TIMEFRAME_ID,
            last_append: now,
        });

        if partial.open.is_some()
            && (partial.timeframe_id != header.timeframe_id
                || header.timeframe_id == UNDEFINED_TIMEFRAME_ID)
        {
            // The current slice is complete.
            if let Some(done) = partial.open.take() {
                self.completed.push_back(done);
            }
        }

        let open = partial.open.get_or_insert_with(DataSet::new);
        open.push(block);
        partial.timeframe_id = header.timeframe_id;
        partial.last_append = now;
        Ok(open.len())
    }

    /// Close every partial whose last append is at or before `cutoff`.
    /// Returns the number of slices closed.
    pub fn complete_on_timeout(&mut self, cutoff: f64) -> usize {
        let mut closed = 0;
        for partial in self.partials.values_mut() {
            if partial.open.is_some() && partial.last_append <= cutoff {
                if let Some(done) = partial.open.take() {
                    self.completed.push_back(done);
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Take the oldest completed slice; with `include_incomplete`, fall
    /// back to surrendering some open partial. Repeated calls with
    /// `include_incomplete` drain every partial.
    pub fn pop_slice(&mut self, include_incomplete: bool) -> Option<DataSet> {
        if let Some(slice) = self.completed.pop_front() {
            return Some(slice);
        }
        if include_incomplete {
            for partial in self.partials.values_mut() {
                if let Some(open) = partial.open.take() {
                    return Some(open);
                }
            }
        }
        None
    }

    /// Put a slice back at the front of the completed queue (output queue
    /// refused it).
    pub(crate) fn requeue_front(&mut self, slice: DataSet) {
        self.completed.push_front(slice);
    }

    /// Number of sources with an open partial slice.
    #[must_use]
    pub fn open_partials(&self) -> usize {
        self.partials.values().filter(|p| p.open.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_core::block::BLOCK_HEADER_RESERVED;
    use readout_pool::MemoryPool;
    use std::sync::Arc;

    fn pool() -> Arc<MemoryPool> {
        MemoryPool::new(16, 4096, BLOCK_HEADER_RESERVED).unwrap()
    }

    fn block(pool: &Arc<MemoryPool>, equipment: i32, link: i32, timeframe: u64) -> DataBlock {
        let b = DataBlock::new(pool.wrap(pool.acquire().unwrap()));
        b.set_equipment_id(equipment);
        b.set_link_id(link);
        b.set_timeframe_id(timeframe);
        b
    }

    #[test]
    fn test_timeframe_change_closes_slice() {
        // blocks {A, A, B} from one source -> data sets of sizes {2, 1}
        let pool = pool();
        let mut slicer = DataBlockSlicer::new();
        assert_eq!(slicer.append(block(&pool, 1, 0, 5), 0.0).unwrap(), 1);
        assert_eq!(slicer.append(block(&pool, 1, 0, 5), 0.1).unwrap(), 2);
        assert_eq!(slicer.append(block(&pool, 1, 0, 6), 0.2).unwrap(), 1);

        let first = slicer.pop_slice(false).unwrap();
        assert_eq!(first.len(), 2);
        assert!(slicer.pop_slice(false).is_none());
        let second = slicer.pop_slice(true).unwrap();
        assert_eq!(second.len(), 1);
        assert!(slicer.pop_slice(true).is_none());
    }

    #[test]
    fn test_undefined_timeframe_publishes_alone() {
        let pool = pool();
        let mut slicer = DataBlockSlicer::new();
        slicer
            .append(block(&pool, 1, 0, UNDEFINED_TIMEFRAME_ID), 0.0)
            .unwrap();
        // a second undefined block closes the first immediately
        slicer
            .append(block(&pool, 1, 0, UNDEFINED_TIMEFRAME_ID), 0.1)
            .unwrap();
        let first = slicer.pop_slice(false).unwrap();
        assert_eq!(first.len(), 1);
        let second = slicer.pop_slice(true).unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_sources_slice_independently() {
        // L1,T7 | L2,T7 | L1,T7 | L2,T8: L2's slice closes, L1's stays open
        let pool = pool();
        let mut slicer = DataBlockSlicer::new();
        slicer.append(block(&pool, 1, 1, 7), 0.0).unwrap();
        slicer.append(block(&pool, 1, 2, 7), 0.1).unwrap();
        slicer.append(block(&pool, 1, 1, 7), 0.2).unwrap();
        slicer.append(block(&pool, 1, 2, 8), 0.3).unwrap();

        let closed = slicer.pop_slice(false).unwrap();
        assert_eq!(closed.len(), 2);
        assert_eq!(closed.blocks()[0].header().link_id, 2);
        assert!(slicer.pop_slice(false).is_none());
        assert_eq!(slicer.open_partials(), 2);

        // flush surrenders L1's open pair and L2's open single
        let mut flushed: Vec<usize> = Vec::new();
        while let Some(s) = slicer.pop_slice(true) {
            flushed.push(s.len());
        }
        flushed.sort_unstable();
        assert_eq!(flushed, vec![1, 2]);
    }

    #[test]
    fn test_timeout_closes_idle_partials() {
        let pool = pool();
        let mut slicer = DataBlockSlicer::new();
        slicer.append(block(&pool, 1, 0, 3), 10.0).unwrap();
        slicer.append(block(&pool, 1, 1, 3), 11.0).unwrap();

        // cutoff between the two appends: only link 0 times out
        assert_eq!(slicer.complete_on_timeout(10.5), 1);
        let closed = slicer.pop_slice(false).unwrap();
        assert_eq!(closed.blocks()[0].header().link_id, 0);
        assert_eq!(slicer.open_partials(), 1);
    }

    #[test]
    fn test_link_id_out_of_range_is_fatal() {
        let pool = pool();
        let mut slicer = DataBlockSlicer::new();
        let err = slicer
            .append(block(&pool, 1, i32::from(MAX_LINK_ID) + 1, 1), 0.0)
            .unwrap_err();
        assert!(matches!(err, SlicerError::LinkIdOutOfRange(_)));
        // undefined link id is accepted
        slicer
            .append(block(&pool, 1, UNDEFINED_LINK_ID, 1), 0.0)
            .unwrap();
    }

    #[test]
    fn test_pages_return_to_pool_when_sets_drop() {
        let pool = pool();
        let mut slicer = DataBlockSlicer::new();
        for tf in [1u64, 1, 2, 3] {
            slicer.append(block(&pool, 1, 0, tf), 0.0).unwrap();
        }
        while slicer.pop_slice(true).is_some() {}
        assert_eq!(pool.available(), 16);
    }
}
