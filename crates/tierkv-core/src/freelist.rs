//! Persistent free list of LBAs
//!
//! The free list hands out LBAs in `[0, max_lba)`. Reclaimed LBAs wait in
//! one of `N` slot queues; when a slot runs dry the shared bump cursor
//! yields the next never-used LBA, and once that reaches `max_lba` other
//! slots are raided before `AllocationExhausted` is reported.
//!
//! Every push and pop is one journal transaction, appended and persisted
//! before the in-memory queues change. Lock order is slot, then bump
//! cursor, then journal; at most one slot lock is held at a time except in
//! `reclaim_unreferenced` and `checkpoint`, which take all of them in
//! index order.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashSet;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::{TierError, TierResult};
use crate::format::{Decoder, Encoder, JournalRecord};
use crate::pool::PmemPool;

/// Layout name of the free-list pool
pub const FREE_LIST_LAYOUT: &str = "tierkv-freelist";

/// Pool bytes charged per queued LBA (an `{lba, next}` entry)
pub const FREE_ENTRY_BYTES: u64 = 16;

/// Most LBAs carried by one `Push` record written in bulk
pub const PUSH_RECORD_LBAS: usize = 64 * 1024;

const REC_INIT: u8 = 1;
const REC_SET_MAX: u8 = 2;
const REC_PUSH: u8 = 3;
const REC_POP: u8 = 4;

/// Records in the free-list journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreeListRecord {
    Init { max_lba: u64, slots: u32 },
    SetMaxLba { max_lba: u64 },
    /// LBAs appended to the back of `slot`
    Push { slot: u32, lbas: Vec<u64> },
    /// `reclaimed` taken from the front of `slot`, plus `bump_count` LBAs
    /// bumped starting at `bump_from`
    Pop { slot: u32, reclaimed: Vec<u64>, bump_from: u64, bump_count: u64 },
}

impl JournalRecord for FreeListRecord {
    fn encode(&self, enc: &mut Encoder) {
        match self {
            FreeListRecord::Init { max_lba, slots } => {
                enc.put_u8(REC_INIT);
                enc.put_u64(*max_lba);
                enc.put_u32(*slots);
            }
            FreeListRecord::SetMaxLba { max_lba } => {
                enc.put_u8(REC_SET_MAX);
                enc.put_u64(*max_lba);
            }
            FreeListRecord::Push { slot, lbas } => {
                enc.put_u8(REC_PUSH);
                enc.put_u32(*slot);
                enc.put_u64_list(lbas);
            }
            FreeListRecord::Pop { slot, reclaimed, bump_from, bump_count } => {
                enc.put_u8(REC_POP);
                enc.put_u32(*slot);
                enc.put_u64_list(reclaimed);
                enc.put_u64(*bump_from);
                enc.put_u64(*bump_count);
            }
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> TierResult<Self> {
        match dec.get_u8()? {
            REC_INIT => Ok(FreeListRecord::Init { max_lba: dec.get_u64()?, slots: dec.get_u32()? }),
            REC_SET_MAX => Ok(FreeListRecord::SetMaxLba { max_lba: dec.get_u64()? }),
            REC_PUSH => Ok(FreeListRecord::Push { slot: dec.get_u32()?, lbas: dec.get_u64_list()? }),
            REC_POP => Ok(FreeListRecord::Pop {
                slot: dec.get_u32()?,
                reclaimed: dec.get_u64_list()?,
                bump_from: dec.get_u64()?,
                bump_count: dec.get_u64()?,
            }),
            other => Err(dec.corrupted(format!("unknown free-list record {}", other))),
        }
    }
}

/// In-memory state rebuilt from the journal.
#[derive(Debug, Default)]
struct Root {
    max_lba: u64,
    next_unallocated: u64,
    slots: Vec<VecDeque<u64>>,
}

impl Root {
    fn apply(&mut self, record: &FreeListRecord) {
        match record {
            FreeListRecord::Init { max_lba, slots } => {
                self.max_lba = *max_lba;
                self.next_unallocated = 0;
                self.slots = (0..(*slots).max(1)).map(|_| VecDeque::new()).collect();
            }
            FreeListRecord::SetMaxLba { max_lba } => self.max_lba = *max_lba,
            FreeListRecord::Push { slot, lbas } => {
                if let Some(queue) = self.slots.get_mut(*slot as usize) {
                    queue.extend(lbas.iter().copied());
                }
            }
            FreeListRecord::Pop { slot, reclaimed, bump_from, bump_count } => {
                if let Some(queue) = self.slots.get_mut(*slot as usize) {
                    take_from(queue, reclaimed);
                }
                self.next_unallocated = self.next_unallocated.max(bump_from + bump_count);
            }
        }
    }
}

/// Remove `lbas` from `queue`; they are normally its first entries.
fn take_from(queue: &mut VecDeque<u64>, lbas: &[u64]) {
    for lba in lbas {
        if queue.front() == Some(lba) {
            queue.pop_front();
        } else if let Some(pos) = queue.iter().position(|x| x == lba) {
            queue.remove(pos);
        }
    }
}

struct Bump {
    next_unallocated: u64,
}

/// Crash-safe LBA free list with per-slot queues.
pub struct FreeList {
    max_lba: AtomicU64,
    slots: Vec<Mutex<VecDeque<u64>>>,
    bump: Mutex<Bump>,
    journal: Mutex<PmemPool<FreeListRecord>>,
}

/// Open the free list at `path`, creating it with an empty bump range
/// `[0, max_lba)` if it does not exist.
///
/// Reopening is idempotent. A larger `max_lba` grows the range; the slot
/// count of an existing list is kept.
pub fn init_free_list(path: &Path, capacity_bytes: u64, max_lba: u64, slots: u32) -> TierResult<FreeList> {
    FreeList::open_or_create(path, capacity_bytes, max_lba, slots)
}

impl FreeList {
    pub fn open_or_create(path: &Path, capacity_bytes: u64, max_lba: u64, slots: u32) -> TierResult<Self> {
        let (mut pool, replay) = PmemPool::open_or_create(path, FREE_LIST_LAYOUT, capacity_bytes)?;

        let mut root = Root::default();
        let mut initialised = false;
        for records in &replay.transactions {
            for record in records {
                if matches!(record, FreeListRecord::Init { .. }) {
                    initialised = true;
                }
                root.apply(record);
            }
        }

        if !initialised {
            let init = FreeListRecord::Init { max_lba, slots: slots.max(1) };
            pool.commit(std::slice::from_ref(&init))?;
            root.apply(&init);
            info!(path = %path.display(), max_lba, slots, "created free list");
        } else {
            if root.slots.len() != slots.max(1) as usize {
                warn!(path = %path.display(), stored = root.slots.len(), requested = slots, "keeping stored free-list slot count");
            }
            if max_lba > root.max_lba {
                let grow = FreeListRecord::SetMaxLba { max_lba };
                pool.commit(std::slice::from_ref(&grow))?;
                info!(path = %path.display(), from = root.max_lba, to = max_lba, "grew free-list range");
                root.apply(&grow);
            } else if max_lba < root.max_lba {
                return Err(TierError::InvalidConfig(format!(
                    "free list at {} covers {} LBAs; device now provides only {}",
                    path.display(),
                    root.max_lba,
                    max_lba
                )));
            }
        }

        let queued: u64 = root.slots.iter().map(|q| q.len() as u64).sum();
        pool.charge(queued * FREE_ENTRY_BYTES);
        debug!(path = %path.display(), queued, next_unallocated = root.next_unallocated, "opened free list");

        Ok(Self {
            max_lba: AtomicU64::new(root.max_lba),
            slots: root.slots.into_iter().map(Mutex::new).collect(),
            bump: Mutex::new(Bump { next_unallocated: root.next_unallocated }),
            journal: Mutex::new(pool),
        })
    }

    pub fn max_lba(&self) -> u64 {
        self.max_lba.load(Ordering::Acquire)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// First LBA the bump cursor has not handed out yet.
    pub fn next_unallocated(&self) -> u64 {
        self.bump.lock().next_unallocated
    }

    /// LBAs waiting in slot queues.
    pub fn free_count(&self) -> usize {
        self.slots.iter().map(|s| s.lock().len()).sum()
    }

    /// LBAs that can still be handed out: queued plus never bumped.
    pub fn available(&self) -> u64 {
        let bumpable = self.max_lba().saturating_sub(self.next_unallocated());
        self.free_count() as u64 + bumpable
    }

    fn slot_index(&self, slot: usize) -> usize {
        slot % self.slots.len()
    }

    fn check_lba(&self, lba: u64) -> TierResult<()> {
        let max_lba = self.max_lba();
        if lba >= max_lba {
            return Err(TierError::InvalidLba { lba, max_lba });
        }
        Ok(())
    }

    /// Push to slot 0.
    pub fn push(&self, lba: u64) -> TierResult<()> {
        self.push_batch(0, &[lba])
    }

    /// Pop from slot 0.
    pub fn pop(&self) -> TierResult<u64> {
        self.pop_from(0)
    }

    pub fn push_to(&self, slot: usize, lba: u64) -> TierResult<()> {
        self.push_batch(slot, &[lba])
    }

    pub fn pop_from(&self, slot: usize) -> TierResult<u64> {
        let mut lbas = self.pop_batch(slot, 1)?;
        lbas.pop().ok_or(TierError::AllocationExhausted {
            resource: "lba",
            limit: self.max_lba(),
        })
    }

    /// Append `lbas` to `slot` in one transaction.
    pub fn push_batch(&self, slot: usize, lbas: &[u64]) -> TierResult<()> {
        if lbas.is_empty() {
            return Ok(());
        }
        for &lba in lbas {
            self.check_lba(lba)?;
        }
        let slot = self.slot_index(slot);

        {
            let mut queue = self.slots[slot].lock();
            let mut journal = self.journal.lock();
            let reservation = journal.reserve(lbas.len() as u64 * FREE_ENTRY_BYTES).map_err(|_| {
                TierError::AllocationExhausted { resource: "free-list pool", limit: journal.capacity() }
            })?;
            let record = FreeListRecord::Push { slot: slot as u32, lbas: lbas.to_vec() };
            if let Err(err) = journal.commit(std::slice::from_ref(&record)) {
                journal.cancel(reservation);
                return Err(err);
            }
            journal.publish(reservation);
            queue.extend(lbas.iter().copied());
        }

        debug!(slot, count = lbas.len(), first = lbas[0], "pushed free lbas");
        self.maybe_checkpoint();
        Ok(())
    }

    /// Take up to `count` LBAs for `slot`.
    ///
    /// Order: the slot's own queue, the bump cursor, then other slots.
    /// Returns fewer than `count` only when the whole range is in use, and
    /// `AllocationExhausted` when not even one LBA is left.
    pub fn pop_batch(&self, slot: usize, count: usize) -> TierResult<Vec<u64>> {
        let slot = self.slot_index(slot);
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return Ok(out);
        }

        {
            let mut queue = self.slots[slot].lock();
            let reclaimed: Vec<u64> = queue.iter().take(count).copied().collect();
            let want_bump = (count - reclaimed.len()) as u64;

            let mut bump = self.bump.lock();
            let bump_from = bump.next_unallocated;
            let bump_count = want_bump.min(self.max_lba().saturating_sub(bump_from));

            if !reclaimed.is_empty() || bump_count > 0 {
                let record = FreeListRecord::Pop {
                    slot: slot as u32,
                    reclaimed: reclaimed.clone(),
                    bump_from,
                    bump_count,
                };
                let mut journal = self.journal.lock();
                journal.commit(std::slice::from_ref(&record))?;
                journal.release(reclaimed.len() as u64 * FREE_ENTRY_BYTES);
                drop(journal);

                queue.drain(..reclaimed.len());
                bump.next_unallocated = bump_from + bump_count;
                out.extend(reclaimed);
                out.extend(bump_from..bump_from + bump_count);
            }
        }

        if out.len() < count {
            self.steal(slot, count - out.len(), &mut out)?;
        }

        if out.is_empty() {
            return Err(TierError::AllocationExhausted { resource: "lba", limit: self.max_lba() });
        }
        debug!(slot, count = out.len(), first = out[0], "popped lbas");
        self.maybe_checkpoint();
        Ok(out)
    }

    /// Raid other slots, one at a time, for up to `want` LBAs.
    fn steal(&self, home: usize, mut want: usize, out: &mut Vec<u64>) -> TierResult<()> {
        let n = self.slots.len();
        for step in 1..n {
            if want == 0 {
                break;
            }
            let victim = (home + step) % n;
            let mut queue = self.slots[victim].lock();
            if queue.is_empty() {
                continue;
            }
            let taken: Vec<u64> = queue.iter().take(want).copied().collect();
            let record = FreeListRecord::Pop {
                slot: victim as u32,
                reclaimed: taken.clone(),
                bump_from: 0,
                bump_count: 0,
            };
            let mut journal = self.journal.lock();
            journal.commit(std::slice::from_ref(&record))?;
            journal.release(taken.len() as u64 * FREE_ENTRY_BYTES);
            drop(journal);

            queue.drain(..taken.len());
            want -= taken.len();
            debug!(home, victim, count = taken.len(), "stole free lbas");
            out.extend(taken);
        }
        Ok(())
    }

    /// Return to the free list every LBA below the bump cursor that is
    /// neither queued nor in `referenced`. Returns how many were recovered.
    ///
    /// Run once at open, before any allocation, to recover LBAs lost by a
    /// crash mid-transition or held by a volatile bucket.
    pub fn reclaim_unreferenced(&self, referenced: &HashSet<u64>) -> TierResult<usize> {
        let mut queues: Vec<MutexGuard<'_, VecDeque<u64>>> = self.slots.iter().map(|s| s.lock()).collect();
        let bump = self.bump.lock();

        let queued: HashSet<u64> = queues.iter().flat_map(|q| q.iter().copied()).collect();
        let lost: Vec<u64> = (0..bump.next_unallocated)
            .filter(|lba| !queued.contains(lba) && !referenced.contains(lba))
            .collect();
        if lost.is_empty() {
            return Ok(0);
        }

        // One transaction per chunk; a crash part way leaves the rest for
        // the next open to find.
        let mut journal = self.journal.lock();
        for chunk in lost.chunks(PUSH_RECORD_LBAS) {
            let reservation = journal.reserve(chunk.len() as u64 * FREE_ENTRY_BYTES)?;
            let record = FreeListRecord::Push { slot: 0, lbas: chunk.to_vec() };
            if let Err(err) = journal.commit(std::slice::from_ref(&record)) {
                journal.cancel(reservation);
                return Err(err);
            }
            journal.publish(reservation);
            queues[0].extend(chunk.iter().copied());
        }

        warn!(count = lost.len(), first = lost[0], "reclaimed unreferenced lbas");
        Ok(lost.len())
    }

    /// Rewrite the journal as `Init` plus the current queues and cursor.
    pub fn checkpoint(&self) -> TierResult<()> {
        let queues: Vec<MutexGuard<'_, VecDeque<u64>>> = self.slots.iter().map(|s| s.lock()).collect();
        let bump = self.bump.lock();
        let mut journal = self.journal.lock();

        let mut snapshot = vec![FreeListRecord::Init {
            max_lba: self.max_lba(),
            slots: queues.len() as u32,
        }];
        if bump.next_unallocated > 0 {
            snapshot.push(FreeListRecord::Pop {
                slot: 0,
                reclaimed: Vec::new(),
                bump_from: 0,
                bump_count: bump.next_unallocated,
            });
        }
        for (slot, queue) in queues.iter().enumerate() {
            let lbas: Vec<u64> = queue.iter().copied().collect();
            for chunk in lbas.chunks(PUSH_RECORD_LBAS) {
                snapshot.push(FreeListRecord::Push { slot: slot as u32, lbas: chunk.to_vec() });
            }
        }
        journal.checkpoint(&snapshot)
    }

    fn maybe_checkpoint(&self) {
        if !self.journal.lock().needs_checkpoint() {
            return;
        }
        if let Err(err) = self.checkpoint() {
            warn!(error = %err, "free-list checkpoint failed");
        }
    }

    pub fn set_checkpoint_threshold(&self, bytes: u64) {
        self.journal.lock().set_checkpoint_threshold(bytes);
    }

    pub fn journal_bytes(&self) -> u64 {
        self.journal.lock().journal_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const CAP: u64 = 1 << 20;

    fn fresh(dir: &TempDir, max_lba: u64, slots: u32) -> FreeList {
        init_free_list(&dir.path().join("freelist.pool"), CAP, max_lba, slots).unwrap()
    }

    #[test]
    fn test_push_then_pop_returns_same_lba() {
        let dir = TempDir::new().unwrap();
        let list = fresh(&dir, 16, 1);
        list.push(5).unwrap();
        assert_eq!(list.pop().unwrap(), 5);
    }

    #[test]
    fn test_bump_yields_full_range_then_exhausts() {
        let dir = TempDir::new().unwrap();
        let m = 8;
        let list = fresh(&dir, m, 1);
        for expected in 0..m {
            assert_eq!(list.pop().unwrap(), expected);
        }
        assert!(matches!(
            list.pop(),
            Err(TierError::AllocationExhausted { resource: "lba", limit: 8 })
        ));
    }

    #[test]
    fn test_push_out_of_range_rejected() {
        let dir = TempDir::new().unwrap();
        let list = fresh(&dir, 4, 1);
        assert!(matches!(list.push(4), Err(TierError::InvalidLba { lba: 4, max_lba: 4 })));
        assert_eq!(list.free_count(), 0);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let list = fresh(&dir, 10, 2);
            assert_eq!(list.pop_batch(0, 4).unwrap(), vec![0, 1, 2, 3]);
            list.push_to(1, 2).unwrap();
            list.push_to(0, 0).unwrap();
        }
        let list = fresh(&dir, 10, 2);
        assert_eq!(list.next_unallocated(), 4);
        assert_eq!(list.free_count(), 2);
        assert_eq!(list.pop_from(0).unwrap(), 0);
        // Slot 0 empty: the bump cursor comes before stealing.
        assert_eq!(list.pop_from(0).unwrap(), 4);
        assert_eq!(list.pop_from(1).unwrap(), 2);
    }

    #[test]
    fn test_steals_when_range_is_used_up() {
        let dir = TempDir::new().unwrap();
        let list = fresh(&dir, 3, 2);
        assert_eq!(list.pop_batch(0, 3).unwrap(), vec![0, 1, 2]);
        list.push_to(1, 1).unwrap();

        assert_eq!(list.pop_from(0).unwrap(), 1);
        assert!(list.pop_from(0).is_err());
    }

    #[test]
    fn test_partial_batch_at_end_of_range() {
        let dir = TempDir::new().unwrap();
        let list = fresh(&dir, 5, 1);
        assert_eq!(list.pop_batch(0, 3).unwrap().len(), 3);
        assert_eq!(list.pop_batch(0, 3).unwrap(), vec![3, 4]);
        assert!(list.pop_batch(0, 3).is_err());
    }

    #[test]
    fn test_grows_but_never_shrinks() {
        let dir = TempDir::new().unwrap();
        drop(fresh(&dir, 4, 1));
        let grown = fresh(&dir, 6, 1);
        assert_eq!(grown.max_lba(), 6);
        drop(grown);

        let result = init_free_list(&dir.path().join("freelist.pool"), CAP, 2, 1);
        assert!(matches!(result, Err(TierError::InvalidConfig(_))));
    }

    #[test]
    fn test_reclaim_unreferenced() {
        let dir = TempDir::new().unwrap();
        let list = fresh(&dir, 8, 1);
        list.pop_batch(0, 5).unwrap(); // 0..5 handed out
        list.push(4).unwrap();

        let referenced: HashSet<u64> = [0, 2].into_iter().collect();
        assert_eq!(list.reclaim_unreferenced(&referenced).unwrap(), 2);
        // Nothing left to recover on a second pass.
        assert_eq!(list.reclaim_unreferenced(&referenced).unwrap(), 0);

        let mut free: Vec<u64> = (0..3).map(|_| list.pop().unwrap()).collect();
        free.sort_unstable();
        assert_eq!(free, vec![1, 3, 4]);
    }

    #[test]
    fn test_checkpoint_keeps_state() {
        let dir = TempDir::new().unwrap();
        {
            let list = fresh(&dir, 64, 2);
            for _ in 0..20 {
                let lba = list.pop().unwrap();
                list.push_to(1, lba).unwrap();
            }
            let before = list.journal_bytes();
            list.checkpoint().unwrap();
            assert!(list.journal_bytes() < before);
        }
        let list = fresh(&dir, 64, 2);
        assert_eq!(list.free_count(), 20);
        assert_eq!(list.next_unallocated(), 20);
    }

    #[test]
    fn test_large_queue_is_written_in_bounded_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("freelist.pool");
        let total = 2 * PUSH_RECORD_LBAS as u64 + 1000;
        {
            let list = init_free_list(&path, 8 << 20, total, 1).unwrap();
            assert_eq!(list.pop_batch(0, total as usize).unwrap().len() as u64, total);
            assert_eq!(list.reclaim_unreferenced(&HashSet::new()).unwrap() as u64, total);
            list.checkpoint().unwrap();
        }

        let (_pool, replay) = PmemPool::<FreeListRecord>::open(&path, FREE_LIST_LAYOUT).unwrap();
        let pushes: Vec<usize> = replay
            .transactions
            .iter()
            .flatten()
            .filter_map(|r| match r {
                FreeListRecord::Push { lbas, .. } => Some(lbas.len()),
                _ => None,
            })
            .collect();
        assert_eq!(pushes, vec![PUSH_RECORD_LBAS, PUSH_RECORD_LBAS, 1000]);

        let list = init_free_list(&path, 8 << 20, total, 1).unwrap();
        assert_eq!(list.free_count() as u64, total);
        assert_eq!(list.next_unallocated(), total);
        assert_eq!(list.pop().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_slots_never_share_an_lba() {
        let dir = TempDir::new().unwrap();
        let list = Arc::new(fresh(&dir, 400, 4));

        let handles: Vec<_> = (0..4)
            .map(|slot| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..100 {
                        got.push(list.pop_from(slot).unwrap());
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert!(list.pop().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_no_double_allocation(ops in proptest::collection::vec(any::<bool>(), 1..120)) {
            let dir = TempDir::new().unwrap();
            let list = fresh(&dir, 16, 2);
            let mut held: Vec<u64> = Vec::new();

            for pop in ops {
                if pop || held.is_empty() {
                    match list.pop_from(held.len() % 2) {
                        Ok(lba) => {
                            prop_assert!(!held.contains(&lba), "lba {} handed out twice", lba);
                            prop_assert!(lba < 16);
                            held.push(lba);
                        }
                        Err(TierError::AllocationExhausted { .. }) => prop_assert_eq!(held.len(), 16),
                        Err(e) => return Err(TestCaseError::fail(e.to_string())),
                    }
                } else if let Some(lba) = held.pop() {
                    list.push_to(lba as usize % 2, lba).unwrap();
                }
            }
        }
    }
}
