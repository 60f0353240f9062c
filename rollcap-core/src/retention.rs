//! Retention buffer: the ordered queue of finalized segments kept on disk.
//!
//! `max_retained = ceil(window / segment_length)` (at least 1). The active
//! segment is never in this buffer and never counts toward the bound.
//!
//! A segment is only evicted once its merge state is settled (merged or
//! permanently failed), so eviction cannot delete a file the merger still
//! has to read.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{Result, RollcapError};
use crate::segment::{MergeState, Segment};
use crate::store::ContainerStore;

pub struct RetentionManager {
    store: Arc<dyn ContainerStore>,
    max_retained: usize,
    buffer: VecDeque<Segment>,
    evicted_total: u64,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn ContainerStore>, max_retained: usize) -> Self {
        let max_retained = max_retained.max(1);
        Self {
            store,
            max_retained,
            buffer: VecDeque::with_capacity(max_retained + 1),
            evicted_total: 0,
        }
    }

    pub fn max_retained(&self) -> usize {
        self.max_retained
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.buffer.iter()
    }

    /// Append a finalized segment; evict the head if the bound is exceeded.
    pub fn admit(&mut self, segment: Segment) -> Result<Option<Segment>> {
        if !segment.finalized {
            return Err(RollcapError::RetentionInvariantViolation(format!(
                "segment {} admitted before it was finalized",
                segment.index
            )));
        }
        if let Some(back) = self.buffer.back() {
            if segment.index <= back.index {
                error!(
                    segment = segment.index,
                    tail = back.index,
                    "segment admitted out of order; retention accounting is inconsistent"
                );
            }
        }
        debug!(segment = segment.index, retained = self.buffer.len() + 1, "segment admitted");
        self.buffer.push_back(segment);

        if self.buffer.len() <= self.max_retained {
            return Ok(None);
        }
        let evicted = self.evict_head()?;
        if self.buffer.len() > self.max_retained {
            error!(
                retained = self.buffer.len(),
                max = self.max_retained,
                "retention buffer over capacity"
            );
        }
        Ok(evicted)
    }

    /// Evict settled heads until one more segment fits under the bound.
    pub fn make_room(&mut self) -> Result<Vec<Segment>> {
        let mut evicted = Vec::new();
        while self.buffer.len() >= self.max_retained {
            match self.evict_head()? {
                Some(segment) => evicted.push(segment),
                None => break,
            }
        }
        Ok(evicted)
    }

    /// Update the merge state of a buffered segment.
    pub fn mark(&mut self, index: u64, state: MergeState) -> bool {
        match self.buffer.iter_mut().find(|s| s.index == index) {
            Some(segment) => {
                segment.merge_state = state;
                true
            }
            None => false,
        }
    }

    /// Remove every buffered segment. With `delete` the files go too.
    pub fn drain(&mut self, delete: bool) -> Vec<Segment> {
        let drained: Vec<Segment> = self.buffer.drain(..).collect();
        if delete {
            for segment in &drained {
                if let Err(e) = self.store.delete(&segment.handle) {
                    warn!(segment = segment.index, error = %e, "failed to delete retained segment");
                }
            }
        }
        drained
    }

    fn evict_head(&mut self) -> Result<Option<Segment>> {
        let Some(head) = self.buffer.front() else {
            return Ok(None);
        };
        if head.merge_state == MergeState::Pending {
            error!(
                segment = head.index,
                "cannot evict segment still pending merge, holding it past the window"
            );
            return Ok(None);
        }
        if let Err(e) = self.store.delete(&head.handle) {
            return Err(RollcapError::SegmentIo {
                index: head.index,
                message: format!("eviction failed: {e}"),
            });
        }
        let evicted = self.buffer.pop_front();
        if let Some(segment) = &evicted {
            self.evicted_total += 1;
            debug!(
                segment = segment.index,
                merge_state = ?segment.merge_state,
                "segment evicted"
            );
        }
        Ok(evicted)
    }
}
