//! LBA allocators used by the offload poller
//!
//! `SlotAllocator` goes to the free list for every LBA. `LbaBucketAllocator`
//! keeps a small local cache per size class and talks to the free list in
//! batches, one transaction per refill or flush instead of one per LBA.
//! Both are owned by a single poller thread and take no locks of their own.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{TierError, TierResult};
use crate::freelist::FreeList;
use crate::record::Lba;

/// Source of LBAs for device writes.
pub trait LbaAllocator {
    /// An LBA able to hold `io_size` bytes.
    fn allocate(&mut self, io_size: usize) -> TierResult<Lba>;

    /// Give back an LBA that held `io_size` bytes.
    fn release(&mut self, lba: Lba, io_size: usize) -> TierResult<()>;

    /// Return any locally cached LBAs to the free list.
    fn flush(&mut self) -> TierResult<()> {
        Ok(())
    }
}

impl<A: LbaAllocator + ?Sized> LbaAllocator for Box<A> {
    fn allocate(&mut self, io_size: usize) -> TierResult<Lba> {
        (**self).allocate(io_size)
    }

    fn release(&mut self, lba: Lba, io_size: usize) -> TierResult<()> {
        (**self).release(lba, io_size)
    }

    fn flush(&mut self) -> TierResult<()> {
        (**self).flush()
    }
}

/// Pops and pushes straight through one free-list slot.
pub struct SlotAllocator {
    free_list: Arc<FreeList>,
    slot: usize,
}

impl SlotAllocator {
    pub fn new(free_list: Arc<FreeList>, slot: usize) -> Self {
        Self { free_list, slot }
    }
}

impl LbaAllocator for SlotAllocator {
    fn allocate(&mut self, _io_size: usize) -> TierResult<Lba> {
        self.free_list.pop_from(self.slot).map(Lba)
    }

    fn release(&mut self, lba: Lba, _io_size: usize) -> TierResult<()> {
        self.free_list.push_to(self.slot, lba.get())
    }
}

/// Fixed-capacity local cache of LBAs for one size class.
#[derive(Debug)]
struct LbaBucket {
    lbas: Vec<u64>,
    capacity: usize,
}

impl LbaBucket {
    fn new(capacity: usize) -> Self {
        Self { lbas: Vec::with_capacity(capacity), capacity }
    }

    fn is_full(&self) -> bool {
        self.lbas.len() >= self.capacity
    }
}

/// Per-size-class LBA caches in front of the free list.
///
/// `allocate` serves from the class bucket and refills it with half its
/// capacity when empty; `release` caches locally and flushes the older half
/// when the bucket is full. Cached LBAs are only in memory: anything still
/// cached at a crash is recovered by `FreeList::reclaim_unreferenced`.
pub struct LbaBucketAllocator {
    free_list: Arc<FreeList>,
    slot: usize,
    class_bytes: usize,
    buckets: Vec<LbaBucket>,
}

impl LbaBucketAllocator {
    pub fn new(free_list: Arc<FreeList>, slot: usize, classes: usize, class_bytes: usize, capacity: usize) -> Self {
        let classes = classes.max(1);
        let capacity = capacity.max(2);
        Self {
            free_list,
            slot,
            class_bytes: class_bytes.max(1),
            buckets: (0..classes).map(|_| LbaBucket::new(capacity)).collect(),
        }
    }

    fn class_of(&self, io_size: usize) -> TierResult<usize> {
        let class = io_size.saturating_sub(1) / self.class_bytes;
        if class >= self.buckets.len() {
            return Err(TierError::OversizedValue {
                size: io_size,
                max: self.buckets.len() * self.class_bytes,
            });
        }
        Ok(class)
    }

    /// LBAs currently cached across all classes.
    pub fn cached(&self) -> usize {
        self.buckets.iter().map(|b| b.lbas.len()).sum()
    }
}

impl LbaAllocator for LbaBucketAllocator {
    fn allocate(&mut self, io_size: usize) -> TierResult<Lba> {
        let class = self.class_of(io_size)?;
        let bucket = &mut self.buckets[class];
        if bucket.lbas.is_empty() {
            let want = (bucket.capacity / 2).max(1);
            match self.free_list.pop_batch(self.slot, want) {
                Ok(mut refill) => {
                    // Serve the lowest first.
                    refill.reverse();
                    debug!(class, count = refill.len(), "refilled lba bucket");
                    bucket.lbas.extend(refill);
                }
                Err(TierError::AllocationExhausted { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        if let Some(lba) = bucket.lbas.pop() {
            return Ok(Lba(lba));
        }

        // Free list is dry: take from any class.
        let borrowed = self.buckets.iter_mut().enumerate().find_map(|(from, b)| b.lbas.pop().map(|lba| (from, lba)));
        match borrowed {
            Some((from, lba)) => {
                debug!(class, from, lba, "borrowed lba from sibling bucket");
                Ok(Lba(lba))
            }
            None => Err(TierError::AllocationExhausted { resource: "lba", limit: self.free_list.max_lba() }),
        }
    }

    fn release(&mut self, lba: Lba, io_size: usize) -> TierResult<()> {
        if lba.get() >= self.free_list.max_lba() {
            return Err(TierError::InvalidLba { lba: lba.get(), max_lba: self.free_list.max_lba() });
        }
        let class = self.class_of(io_size.min(self.buckets.len() * self.class_bytes))?;
        let bucket = &mut self.buckets[class];
        if bucket.is_full() {
            let half = bucket.capacity / 2;
            let flushed: Vec<u64> = bucket.lbas.drain(..half).collect();
            self.free_list.push_batch(self.slot, &flushed)?;
            debug!(class, count = flushed.len(), "flushed lba bucket");
        }
        bucket.lbas.push(lba.get());
        Ok(())
    }

    fn flush(&mut self) -> TierResult<()> {
        for bucket in &mut self.buckets {
            if bucket.lbas.is_empty() {
                continue;
            }
            self.free_list.push_batch(self.slot, &bucket.lbas)?;
            bucket.lbas.clear();
        }
        Ok(())
    }
}

impl Drop for LbaBucketAllocator {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, cached = self.cached(), "failed to return cached lbas");
        }
    }
}
