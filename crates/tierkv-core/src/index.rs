//! Tier index: the trie plus the crash-consistent location transitions
//!
//! Every change of a record's location is one `Set` record committed to the
//! index pool before the in-memory trie is touched, so tag and pointer
//! always change together. An offload runs in two halves:
//!
//! 1. `begin_offload` marks the record with a volatile pending update and
//!    hands back the bytes to write. Nothing persistent changes.
//! 2. `commit_offload` (device write succeeded) commits `OnDisk(lba)`,
//!    releases the PMEM copy in the same commit, and returns any LBA the
//!    new one supersedes. `abort_offload` (write failed) just clears the
//!    pending mark and returns the LBA for the caller to free.
//!
//! A crash between the halves leaves the old location intact; the freshly
//! allocated LBA is unreferenced and goes back to the free list on the next
//! open.

use std::path::Path;

use hashbrown::HashSet;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{TierError, TierResult};
use crate::format::{Decoder, Encoder, JournalRecord};
use crate::pool::PmemPool;
use crate::record::{Lba, LocationTag, PendingUpdate, PmemValue, ValueLocation};
use crate::trie::TrieIndex;

/// Layout name of the index pool
pub const INDEX_LAYOUT: &str = "tierkv-index";

const REC_GEOMETRY: u8 = 1;
const REC_SET: u8 = 2;

/// Records in the index pool journal.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexRecord {
    /// Written once on create; reopening with other geometry is refused
    Geometry { key_size: u32, allocation_unit: u32 },
    /// Tag and payload of one key, committed as a unit
    Set { key: Vec<u8>, location: ValueLocation, size: u64 },
}

impl JournalRecord for IndexRecord {
    fn encode(&self, enc: &mut Encoder) {
        match self {
            IndexRecord::Geometry { key_size, allocation_unit } => {
                enc.put_u8(REC_GEOMETRY);
                enc.put_u32(*key_size);
                enc.put_u32(*allocation_unit);
            }
            IndexRecord::Set { key, location, size } => {
                enc.put_u8(REC_SET);
                enc.put_bytes(key);
                location.encode(enc);
                enc.put_u64(*size);
            }
        }
    }

    fn decode(dec: &mut Decoder<'_>) -> TierResult<Self> {
        match dec.get_u8()? {
            REC_GEOMETRY => Ok(IndexRecord::Geometry {
                key_size: dec.get_u32()?,
                allocation_unit: dec.get_u32()?,
            }),
            REC_SET => Ok(IndexRecord::Set {
                key: dec.get_bytes()?,
                location: ValueLocation::decode(dec)?,
                size: dec.get_u64()?,
            }),
            other => Err(dec.corrupted(format!("unknown index record {}", other))),
        }
    }
}

/// Location summary returned by `resolve`; cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub tag: LocationTag,
    pub lba: Option<Lba>,
    pub size: usize,
    pub pending: bool,
}

/// Outcome of `verify_coherence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coherence {
    pub pmem_records: usize,
    pub disk_records: usize,
}

pub struct TierIndex {
    trie: TrieIndex,
    pool: PmemPool<IndexRecord>,
    key_size: usize,
    allocation_unit: usize,
    next_handle: u64,
}

impl TierIndex {
    /// Open or create the index pool at `path` and rebuild the trie from it.
    pub fn open(path: &Path, config: &Config) -> TierResult<Self> {
        let (mut pool, replay) = PmemPool::<IndexRecord>::open_or_create(path, INDEX_LAYOUT, config.pmem_pool_size)?;
        pool.set_checkpoint_threshold(config.journal_checkpoint_bytes);

        let geometry = IndexRecord::Geometry {
            key_size: config.key_size as u32,
            allocation_unit: config.allocation_unit_size as u32,
        };

        let mut trie = TrieIndex::new(config.key_size);
        let mut next_handle = 1u64;
        let mut saw_geometry = false;
        let mut applied = 0usize;

        for records in replay.transactions {
            for record in records {
                match record {
                    IndexRecord::Geometry { .. } => {
                        if record != geometry {
                            return Err(TierError::LayoutMismatch {
                                path: path.to_path_buf(),
                                expected: format!("{:?}", geometry),
                                found: format!("{:?}", record),
                            });
                        }
                        saw_geometry = true;
                    }
                    IndexRecord::Set { key, location, size } => {
                        if let ValueLocation::InPmem(value) = &location {
                            next_handle = next_handle.max(value.handle + 1);
                        }
                        let slot = trie.lookup(&key)?;
                        slot.location = location;
                        slot.size = size as usize;
                        applied += 1;
                    }
                }
            }
        }

        if !saw_geometry {
            pool.commit(std::slice::from_ref(&geometry))?;
        }

        let mut used = 0u64;
        trie.for_each_occupied(|_, rec| used += rec.location.pmem_bytes());
        pool.charge(used);

        info!(path = %path.display(), applied, pmem_bytes = used, "opened tier index");

        Ok(Self {
            trie,
            pool,
            key_size: config.key_size,
            allocation_unit: config.allocation_unit_size,
            next_handle,
        })
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn allocation_unit(&self) -> usize {
        self.allocation_unit
    }

    fn check_value(&self, value: &[u8]) -> TierResult<()> {
        if value.len() > self.allocation_unit {
            return Err(TierError::OversizedValue {
                size: value.len(),
                max: self.allocation_unit,
            });
        }
        Ok(())
    }

    /// Store `value` inline in PMEM.
    ///
    /// Returns the LBA the key occupied if it was on disk; the caller owns
    /// freeing it.
    pub fn put_inline(&mut self, key: &[u8], value: &[u8]) -> TierResult<Option<Lba>> {
        self.check_value(value)?;
        let record = self.trie.lookup(key)?;
        if record.is_pending() {
            return Err(TierError::TransitionPending);
        }

        let reservation = self.pool.reserve(value.len() as u64)?;
        record.pending_alloc = Some(reservation);

        let location = ValueLocation::InPmem(PmemValue {
            handle: self.next_handle,
            bytes: value.to_vec(),
        });
        let set = IndexRecord::Set {
            key: key.to_vec(),
            location: location.clone(),
            size: value.len() as u64,
        };

        let committed = self.pool.commit(std::slice::from_ref(&set));
        let Some(reservation) = record.pending_alloc.take() else {
            return Err(TierError::TransitionPending);
        };
        if let Err(err) = committed {
            self.pool.cancel(reservation);
            return Err(err);
        }
        self.pool.publish(reservation);
        self.next_handle += 1;

        let old = std::mem::replace(&mut record.location, location);
        record.size = value.len();
        self.pool.release(old.pmem_bytes());
        trace!(key_len = key.len(), size = value.len(), "stored value inline");

        self.maybe_checkpoint();
        Ok(old.lba())
    }

    /// Bytes of a PMEM-resident value.
    pub fn read_inline(&self, key: &[u8]) -> TierResult<Vec<u8>> {
        match self.trie.get(key)?.map(|rec| &rec.location) {
            Some(ValueLocation::InPmem(value)) => Ok(value.bytes.clone()),
            _ => Err(TierError::NotFound),
        }
    }

    pub fn resolve(&self, key: &[u8]) -> TierResult<Resolved> {
        Ok(match self.trie.get(key)? {
            Some(rec) => Resolved {
                tag: rec.tag(),
                lba: rec.location.lba(),
                size: rec.size,
                pending: rec.is_pending(),
            },
            None => Resolved { tag: LocationTag::Empty, lba: None, size: 0, pending: false },
        })
    }

    /// Full location of `key` (clones PMEM bytes).
    pub fn location(&self, key: &[u8]) -> TierResult<ValueLocation> {
        Ok(self.trie.get(key)?.map(|rec| rec.location.clone()).unwrap_or_default())
    }

    /// Mark `key` as being written to `lba` and return the bytes to write.
    ///
    /// `value` replaces the current contents; without it the PMEM bytes are
    /// offloaded. Persistent state is unchanged.
    pub fn begin_offload(&mut self, key: &[u8], lba: Lba, value: Option<&[u8]>) -> TierResult<Vec<u8>> {
        if let Some(value) = value {
            self.check_value(value)?;
        }
        let record = self.trie.lookup(key)?;
        if record.is_pending() {
            return Err(TierError::TransitionPending);
        }

        let payload = match (value, &record.location) {
            (Some(value), _) => value.to_vec(),
            (None, ValueLocation::InPmem(current)) => current.bytes.clone(),
            (None, _) => return Err(TierError::NotFound),
        };

        record.pending_update = Some(PendingUpdate { lba, size: payload.len() });
        trace!(key_len = key.len(), lba = lba.get(), size = payload.len(), "offload started");
        Ok(payload)
    }

    /// Publish a finished offload: the record moves to `OnDisk`.
    ///
    /// Returns the LBA the record pointed at before, if any.
    pub fn commit_offload(&mut self, key: &[u8]) -> TierResult<Option<Lba>> {
        let record = self.trie.lookup(key)?;
        let Some(pending) = record.pending_update else {
            return Err(TierError::NotFound);
        };

        let set = IndexRecord::Set {
            key: key.to_vec(),
            location: ValueLocation::OnDisk(pending.lba),
            size: pending.size as u64,
        };
        // On failure the pending mark stays so the caller can abort.
        self.pool.commit(std::slice::from_ref(&set))?;

        record.pending_update = None;
        let old = std::mem::replace(&mut record.location, ValueLocation::OnDisk(pending.lba));
        record.size = pending.size;
        // The PMEM copy is cancelled by the same commit.
        self.pool.release(old.pmem_bytes());

        let superseded = old.lba();
        debug!(key_len = key.len(), lba = pending.lba.get(), superseded = ?superseded.map(Lba::get), "offload committed");

        self.maybe_checkpoint();
        Ok(superseded)
    }

    /// Drop the pending mark after a failed write; returns its LBA.
    pub fn abort_offload(&mut self, key: &[u8]) -> TierResult<Option<Lba>> {
        let record = self.trie.lookup(key)?;
        let lba = record.pending_update.take().map(|p| p.lba);
        if let Some(lba) = lba {
            debug!(key_len = key.len(), lba = lba.get(), "offload aborted");
        }
        Ok(lba)
    }

    /// Set `key` to EMPTY. Returns the LBA it held if it was on disk.
    pub fn remove(&mut self, key: &[u8]) -> TierResult<Option<Lba>> {
        let record = self.trie.lookup(key)?;
        if record.is_pending() {
            return Err(TierError::TransitionPending);
        }
        if record.location.is_empty() {
            return Err(TierError::NotFound);
        }

        let set = IndexRecord::Set {
            key: key.to_vec(),
            location: ValueLocation::Empty,
            size: 0,
        };
        self.pool.commit(std::slice::from_ref(&set))?;

        let old = std::mem::take(&mut record.location);
        record.size = 0;
        self.pool.release(old.pmem_bytes());
        trace!(key_len = key.len(), tag = ?old.tag(), "removed value");

        self.maybe_checkpoint();
        Ok(old.lba())
    }

    /// Every LBA referenced by a DISK record.
    pub fn disk_lbas(&self) -> HashSet<u64> {
        let mut lbas = HashSet::new();
        self.trie.for_each_occupied(|_, rec| {
            if let Some(lba) = rec.location.lba() {
                lbas.insert(lba.get());
            }
        });
        lbas
    }

    /// Check every record: tag and payload agree, DISK LBAs lie in
    /// `[0, max_lba)`, and no LBA is referenced twice.
    pub fn verify_coherence(&self, max_lba: Option<u64>) -> TierResult<Coherence> {
        let mut report = Coherence::default();
        let mut seen = HashSet::new();
        let mut failure: Option<TierError> = None;

        self.trie.for_each_occupied(|key, rec| {
            if failure.is_some() {
                return;
            }
            if !rec.is_coherent(max_lba) {
                failure = Some(match (rec.location.lba(), max_lba) {
                    (Some(lba), Some(max)) => TierError::InvalidLba { lba: lba.get(), max_lba: max },
                    _ => TierError::JournalCorrupted {
                        path: self.pool.path().to_path_buf(),
                        offset: 0,
                        reason: format!("incoherent record for key {:02x?}", key),
                    },
                });
                return;
            }
            match rec.location.tag() {
                LocationTag::Pmem => report.pmem_records += 1,
                LocationTag::Disk => {
                    report.disk_records += 1;
                    if let Some(lba) = rec.location.lba() {
                        if !seen.insert(lba.get()) {
                            failure = Some(TierError::JournalCorrupted {
                                path: self.pool.path().to_path_buf(),
                                offset: 0,
                                reason: format!("{} referenced by more than one key", lba),
                            });
                        }
                    }
                }
                LocationTag::Empty => {}
            }
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Rewrite the index journal as one snapshot of all non-empty records.
    pub fn checkpoint(&mut self) -> TierResult<()> {
        let mut snapshot = vec![IndexRecord::Geometry {
            key_size: self.key_size as u32,
            allocation_unit: self.allocation_unit as u32,
        }];
        self.trie.for_each_occupied(|key, rec| {
            snapshot.push(IndexRecord::Set {
                key: key.to_vec(),
                location: rec.location.clone(),
                size: rec.size as u64,
            });
        });
        self.pool.checkpoint(&snapshot)
    }

    fn maybe_checkpoint(&mut self) {
        if self.pool.needs_checkpoint() {
            if let Err(err) = self.checkpoint() {
                warn!(path = %self.pool.path().display(), error = %err, "index checkpoint failed");
            }
        }
    }

    pub fn pmem_used(&self) -> u64 {
        self.pool.used()
    }

    pub fn journal_bytes(&self) -> u64 {
        self.pool.journal_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> Config {
        let mut cfg = Config::minimal();
        cfg.key_size = 2;
        cfg.allocation_unit_size = 4096;
        cfg
    }

    fn open(dir: &TempDir) -> TierIndex {
        TierIndex::open(&dir.path().join("index.pool"), &config()).unwrap()
    }

    #[test]
    fn test_put_inline_then_read() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir);

        assert_eq!(index.put_inline(b"k1", b"hello").unwrap(), None);
        assert_eq!(index.read_inline(b"k1").unwrap(), b"hello");
        assert_eq!(index.resolve(b"k1").unwrap().tag, LocationTag::Pmem);
        assert_eq!(index.pmem_used(), 5);

        // Overwrite releases the old bytes.
        index.put_inline(b"k1", b"hi").unwrap();
        assert_eq!(index.pmem_used(), 2);
    }

    #[test]
    fn test_oversized_value_rejected() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir);
        let big = vec![0u8; 4097];
        assert!(matches!(index.put_inline(b"k1", &big), Err(TierError::OversizedValue { .. })));
        assert!(matches!(
            index.begin_offload(b"k1", Lba(0), Some(big.as_slice())),
            Err(TierError::OversizedValue { .. })
        ));
        assert_eq!(index.resolve(b"k1").unwrap().tag, LocationTag::Empty);
    }

    #[test]
    fn test_offload_commit_moves_to_disk() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir);
        index.put_inline(b"k1", b"payload").unwrap();

        let bytes = index.begin_offload(b"k1", Lba(3), None).unwrap();
        assert_eq!(bytes, b"payload");
        assert!(index.resolve(b"k1").unwrap().pending);
        // Still PMEM until the commit.
        assert_eq!(index.resolve(b"k1").unwrap().tag, LocationTag::Pmem);
        assert!(matches!(index.put_inline(b"k1", b"x"), Err(TierError::TransitionPending)));

        assert_eq!(index.commit_offload(b"k1").unwrap(), None);
        let r = index.resolve(b"k1").unwrap();
        assert_eq!((r.tag, r.lba, r.size, r.pending), (LocationTag::Disk, Some(Lba(3)), 7, false));
        assert_eq!(index.pmem_used(), 0);
    }

    #[test]
    fn test_abort_leaves_location_unchanged() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir);
        index.put_inline(b"k1", b"payload").unwrap();

        index.begin_offload(b"k1", Lba(1), None).unwrap();
        assert_eq!(index.abort_offload(b"k1").unwrap(), Some(Lba(1)));
        assert_eq!(index.read_inline(b"k1").unwrap(), b"payload");
        assert!(!index.resolve(b"k1").unwrap().pending);
    }

    #[test]
    fn test_disk_update_is_copy_on_write() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir);
        index.begin_offload(b"k1", Lba(0), Some(&b"v1"[..])).unwrap();
        index.commit_offload(b"k1").unwrap();

        index.begin_offload(b"k1", Lba(1), Some(&b"v2!"[..])).unwrap();
        assert_eq!(index.commit_offload(b"k1").unwrap(), Some(Lba(0)));
        assert_eq!(index.resolve(b"k1").unwrap().size, 3);
    }

    #[test]
    fn test_begin_offload_on_empty_without_value() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir);
        assert!(matches!(index.begin_offload(b"k1", Lba(0), None), Err(TierError::NotFound)));
    }

    #[test]
    fn test_remove_semantics() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir);
        assert!(matches!(index.remove(b"k1"), Err(TierError::NotFound)));

        index.put_inline(b"k1", b"abc").unwrap();
        assert_eq!(index.remove(b"k1").unwrap(), None);
        assert_eq!(index.pmem_used(), 0);

        index.begin_offload(b"k2", Lba(2), Some(&b"xyz"[..])).unwrap();
        index.commit_offload(b"k2").unwrap();
        assert_eq!(index.remove(b"k2").unwrap(), Some(Lba(2)));
        assert_eq!(index.resolve(b"k2").unwrap().tag, LocationTag::Empty);
    }

    #[test]
    fn test_reopen_replays_state() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = open(&dir);
            index.put_inline(b"aa", b"inline").unwrap();
            index.begin_offload(b"bb", Lba(5), Some(&b"disk"[..])).unwrap();
            index.commit_offload(b"bb").unwrap();
            index.put_inline(b"cc", b"gone").unwrap();
            index.remove(b"cc").unwrap();
            // In flight at crash time: never committed.
            index.put_inline(b"dd", b"pmem").unwrap();
            index.begin_offload(b"dd", Lba(6), None).unwrap();
        }

        let index = open(&dir);
        assert_eq!(index.read_inline(b"aa").unwrap(), b"inline");
        assert_eq!(index.resolve(b"bb").unwrap().lba, Some(Lba(5)));
        assert_eq!(index.resolve(b"cc").unwrap().tag, LocationTag::Empty);
        let dd = index.resolve(b"dd").unwrap();
        assert_eq!((dd.tag, dd.pending), (LocationTag::Pmem, false));
        assert_eq!(index.pmem_used(), 10);

        let lbas = index.disk_lbas();
        assert_eq!(lbas.len(), 1);
        assert!(lbas.contains(&5));
    }

    #[test]
    fn test_torn_commit_keeps_old_location() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.pool");
        let (before, after) = {
            let mut index = open(&dir);
            index.put_inline(b"bb", b"payload").unwrap();
            index.begin_offload(b"bb", Lba(2), None).unwrap();
            let before = index.journal_bytes();
            index.commit_offload(b"bb").unwrap();
            (before, index.journal_bytes())
        };

        // Crash halfway through the offload commit frame.
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(before + (after - before) / 2).unwrap();
        drop(file);

        let index = open(&dir);
        let r = index.resolve(b"bb").unwrap();
        assert_eq!((r.tag, r.lba), (LocationTag::Pmem, None));
        assert_eq!(index.read_inline(b"bb").unwrap(), b"payload");
        assert!(index.disk_lbas().is_empty());
        assert_eq!(index.verify_coherence(Some(4)).unwrap(), Coherence { pmem_records: 1, disk_records: 0 });
    }

    #[test]
    fn test_geometry_mismatch_refused() {
        let dir = TempDir::new().unwrap();
        drop(open(&dir));

        let mut other = config();
        other.key_size = 4;
        let result = TierIndex::open(&dir.path().join("index.pool"), &other);
        assert!(matches!(result, Err(TierError::LayoutMismatch { .. })));
    }

    #[test]
    fn test_verify_coherence() {
        let dir = TempDir::new().unwrap();
        let mut index = open(&dir);
        index.put_inline(b"aa", b"x").unwrap();
        index.begin_offload(b"bb", Lba(3), Some(&b"y"[..])).unwrap();
        index.commit_offload(b"bb").unwrap();

        let report = index.verify_coherence(Some(4)).unwrap();
        assert_eq!(report, Coherence { pmem_records: 1, disk_records: 1 });
        assert!(matches!(index.verify_coherence(Some(3)), Err(TierError::InvalidLba { lba: 3, max_lba: 3 })));
    }

    #[test]
    fn test_checkpoint_preserves_state() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = open(&dir);
            for i in 0..50u8 {
                index.put_inline(&[b'k', i], &[i; 16]).unwrap();
            }
            for i in 0..25u8 {
                index.remove(&[b'k', i]).unwrap();
            }
            let before = index.journal_bytes();
            index.checkpoint().unwrap();
            assert!(index.journal_bytes() < before);
        }
        let index = open(&dir);
        assert!(matches!(index.read_inline(&[b'k', 0]), Err(TierError::NotFound)));
        assert_eq!(index.read_inline(&[b'k', 30]).unwrap(), vec![30u8; 16]);
        assert_eq!(index.pmem_used(), 25 * 16);
    }

    #[test]
    fn test_checkpoint_larger_than_one_frame() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.pool");
        {
            let mut index = open(&dir);
            index.pool.set_frame_budget(4096);
            for i in 0..40u8 {
                index.put_inline(&[b'v', i], &vec![i; 1000]).unwrap();
            }
            index.checkpoint().unwrap();
        }

        let (_pool, replay) = PmemPool::<IndexRecord>::open(&path, INDEX_LAYOUT).unwrap();
        assert!(replay.transactions.len() >= 10);

        let index = open(&dir);
        for i in 0..40u8 {
            assert_eq!(index.read_inline(&[b'v', i]).unwrap(), vec![i; 1000]);
        }
        assert_eq!(index.pmem_used(), 40 * 1000);
    }
}
