//! Persistent pool: a named, sized file holding a transaction journal
//!
//! Every mutation of persistent state goes through `commit`, which appends
//! exactly one checksummed transaction frame and persists it before
//! returning. The caller updates its in-memory mirror only after `commit`
//! returns `Ok`; on reopen the journal is replayed to rebuild that mirror.
//!
//! Recovery stops at the first frame that is torn or fails its checksum and
//! truncates the file there. Frames after a damaged one are never applied:
//! a later transaction may depend on the lost one.
//!
//! Capacity accounting follows a reserve/publish/cancel model. A
//! reservation is volatile; only what is published after a successful
//! commit counts as used.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{TierError, TierResult};
use crate::format::{
    decode_frame, decode_records, encode_frame, encode_record_batches, encode_records, FrameKind,
    JournalRecord, PoolIdentity, MAX_FRAME_PAYLOAD, POOL_FORMAT_VERSION,
};
use crate::persist::{persist, persist_dir};

/// Volatile handle for capacity set aside ahead of a commit.
///
/// Hand it back through `publish` once the commit succeeded or through
/// `cancel` when it did not.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation must be published or cancelled"]
pub struct Reservation {
    id: u64,
    bytes: u64,
}

impl Reservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// What `open` found in an existing journal.
#[derive(Debug)]
pub struct Replay<R> {
    /// Transactions in commit order
    pub transactions: Vec<Vec<R>>,
    /// Bytes cut from the tail because of a torn or corrupt frame
    pub truncated_bytes: u64,
}

/// A journal-backed pool file for records of type `R`.
pub struct PmemPool<R: JournalRecord> {
    file: File,
    path: PathBuf,
    layout: String,
    capacity: u64,
    /// Bytes of intact journal on disk
    journal_bytes: u64,
    next_txid: u64,
    used: u64,
    reserved: u64,
    next_reservation: u64,
    checkpoint_threshold: u64,
    /// Payload bytes a checkpoint packs into one frame
    frame_budget: usize,
    _records: PhantomData<fn() -> R>,
}

impl<R: JournalRecord> PmemPool<R> {
    /// Create a new pool. Fails if `path` already exists.
    ///
    /// The header frame is written to a temporary file and renamed into
    /// place, so a pool file without a header never appears.
    pub fn create(path: &Path, layout: &str, capacity: u64) -> TierResult<Self> {
        if path.exists() {
            return Err(TierError::io_at(
                path,
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
                "pool already exists",
            ));
        }

        let identity = PoolIdentity {
            layout: layout.to_string(),
            capacity,
            version: POOL_FORMAT_VERSION,
        };
        let header = encode_frame(FrameKind::Header, 0, &identity.encode())?;
        let header_len = header.len() as u64;
        write_atomically(path, &[header])?;

        let file = open_for_append(path)?;
        info!(path = %path.display(), layout, capacity, "created pool");

        Ok(Self::assemble(file, path, layout, capacity, header_len, 1))
    }

    /// Open an existing pool, replaying its journal.
    ///
    /// Returns the pool and every intact transaction in commit order.
    pub fn open(path: &Path, layout: &str) -> TierResult<(Self, Replay<R>)> {
        let mut data = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(|e| TierError::io_at(path, e, "failed to read pool"))?;

        let path_buf = path.to_path_buf();
        let first = decode_frame(&data, 0, &path_buf)?;
        if first.kind != FrameKind::Header {
            return Err(TierError::JournalCorrupted {
                path: path_buf,
                offset: 0,
                reason: "pool does not start with a header frame".into(),
            });
        }
        let identity = PoolIdentity::decode(first.payload)?;
        if identity.layout != layout {
            return Err(TierError::LayoutMismatch {
                path: path_buf,
                expected: layout.to_string(),
                found: identity.layout,
            });
        }
        if identity.version != POOL_FORMAT_VERSION {
            return Err(TierError::JournalCorrupted {
                path: path_buf,
                offset: 0,
                reason: format!("unsupported pool format version {}", identity.version),
            });
        }

        let mut offset = first.encoded_len();
        let mut last_txid = first.txid;
        let mut transactions = Vec::new();

        while offset < data.len() {
            let frame = match decode_frame(&data, offset, &path_buf) {
                Ok(frame) => frame,
                Err(err) => {
                    // Crash point: everything from here on is discarded.
                    warn!(path = %path.display(), offset, error = %err, "discarding damaged journal tail");
                    break;
                }
            };
            if frame.kind != FrameKind::Transaction {
                return Err(TierError::JournalCorrupted {
                    path: path_buf,
                    offset: offset as u64,
                    reason: "header frame in the middle of a journal".into(),
                });
            }
            let records = decode_records::<R>(frame.payload).map_err(|err| match err {
                TierError::JournalCorrupted { offset: inner, reason, .. } => TierError::JournalCorrupted {
                    path: path_buf.clone(),
                    offset: offset as u64 + inner,
                    reason,
                },
                other => other,
            })?;
            last_txid = last_txid.max(frame.txid);
            transactions.push(records);
            offset += frame.encoded_len();
        }

        let truncated_bytes = (data.len() - offset) as u64;
        if truncated_bytes > 0 {
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| TierError::io_at(path, e, "failed to open pool for truncation"))?;
            file.set_len(offset as u64)
                .map_err(|e| TierError::io_at(path, e, "failed to truncate pool"))?;
            persist(&file).map_err(|e| TierError::io_at(path, e, "failed to persist truncation"))?;
            warn!(path = %path.display(), truncated_bytes, "truncated pool journal to last intact frame");
        }

        let file = open_for_append(path)?;
        debug!(path = %path.display(), transactions = transactions.len(), "replayed pool journal");

        let pool = Self::assemble(file, path, layout, identity.capacity, offset as u64, last_txid + 1);
        Ok((pool, Replay { transactions, truncated_bytes }))
    }

    /// Open `path` if it exists, otherwise create it.
    pub fn open_or_create(path: &Path, layout: &str, capacity: u64) -> TierResult<(Self, Replay<R>)> {
        if path.exists() {
            Self::open(path, layout)
        } else {
            let pool = Self::create(path, layout, capacity)?;
            Ok((pool, Replay { transactions: Vec::new(), truncated_bytes: 0 }))
        }
    }

    fn assemble(file: File, path: &Path, layout: &str, capacity: u64, journal_bytes: u64, next_txid: u64) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            layout: layout.to_string(),
            capacity,
            journal_bytes,
            next_txid,
            used: 0,
            reserved: 0,
            next_reservation: 1,
            checkpoint_threshold: (capacity / 4).max(64 * 1024),
            frame_budget: MAX_FRAME_PAYLOAD,
            _records: PhantomData,
        }
    }

    /// Append `records` as one transaction and persist it.
    ///
    /// Returns the transaction id. An empty slice commits nothing.
    pub fn commit(&mut self, records: &[R]) -> TierResult<u64> {
        if records.is_empty() {
            return Ok(self.next_txid.saturating_sub(1));
        }
        let txid = self.next_txid;
        let frame = encode_frame(FrameKind::Transaction, txid, &encode_records(records))?;

        if let Err(e) = self.file.write_all(&frame).and_then(|_| persist(&self.file)) {
            // Cut any partial frame so later commits do not land behind it.
            if let Err(trunc) = self.file.set_len(self.journal_bytes) {
                warn!(path = %self.path.display(), error = %trunc, "failed to roll back partial frame");
            }
            return Err(TierError::io_at(&self.path, e, "journal commit failed"));
        }

        self.journal_bytes += frame.len() as u64;
        self.next_txid += 1;
        Ok(txid)
    }

    /// Set capacity aside for a pending commit.
    pub fn reserve(&mut self, bytes: u64) -> TierResult<Reservation> {
        if self.used + self.reserved + bytes > self.capacity {
            return Err(TierError::AllocationExhausted {
                resource: "pmem pool",
                limit: self.capacity,
            });
        }
        self.reserved += bytes;
        let id = self.next_reservation;
        self.next_reservation += 1;
        Ok(Reservation { id, bytes })
    }

    /// Turn a reservation into used capacity.
    pub fn publish(&mut self, reservation: Reservation) {
        self.reserved = self.reserved.saturating_sub(reservation.bytes);
        self.used += reservation.bytes;
    }

    /// Drop a reservation without using it.
    pub fn cancel(&mut self, reservation: Reservation) {
        self.reserved = self.reserved.saturating_sub(reservation.bytes);
    }

    /// Return published capacity.
    pub fn release(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }

    /// Account capacity that replay found in use.
    pub fn charge(&mut self, bytes: u64) {
        self.used += bytes;
    }

    /// Rewrite the journal as a header plus `snapshot`.
    ///
    /// Uses write-temp / persist / rename / persist-dir. A crash before the
    /// rename leaves the old journal in place; after it, the snapshot.
    pub fn checkpoint(&mut self, snapshot: &[R]) -> TierResult<()> {
        let identity = PoolIdentity {
            layout: self.layout.clone(),
            capacity: self.capacity,
            version: POOL_FORMAT_VERSION,
        };

        let mut frames = vec![encode_frame(FrameKind::Header, 0, &identity.encode())?];
        let mut txid = self.next_txid;
        for payload in encode_record_batches(snapshot, self.frame_budget) {
            frames.push(encode_frame(FrameKind::Transaction, txid, &payload)?);
            txid += 1;
        }
        let new_len: u64 = frames.iter().map(|f| f.len() as u64).sum();
        let old_len = self.journal_bytes;

        write_atomically(&self.path, &frames)?;
        self.file = open_for_append(&self.path)?;
        self.journal_bytes = new_len;
        self.next_txid = txid;

        info!(
            path = %self.path.display(),
            old_len,
            new_len,
            records = snapshot.len(),
            frames = frames.len() - 1,
            "checkpointed pool"
        );
        Ok(())
    }

    /// True once the journal has grown past the checkpoint threshold.
    pub fn needs_checkpoint(&self) -> bool {
        self.journal_bytes > self.checkpoint_threshold
    }

    pub fn set_checkpoint_threshold(&mut self, bytes: u64) {
        self.checkpoint_threshold = bytes;
    }

    /// Cap on the payload of each checkpoint frame, at most `MAX_FRAME_PAYLOAD`.
    pub fn set_frame_budget(&mut self, bytes: usize) {
        self.frame_budget = bytes.min(MAX_FRAME_PAYLOAD);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &str {
        &self.layout
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    pub fn journal_bytes(&self) -> u64 {
        self.journal_bytes
    }
}

fn open_for_append(path: &Path) -> TierResult<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| TierError::io_at(path, e, "failed to open pool"))
}

/// Write `frames` to a sibling temp file, persist it and rename it over `path`.
fn write_atomically(path: &Path, frames: &[Vec<u8>]) -> TierResult<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| TierError::io_at(&tmp_path, e, "failed to create temp pool"))?;
        for frame in frames {
            tmp.write_all(frame)
                .map_err(|e| TierError::io_at(&tmp_path, e, "failed to write temp pool"))?;
        }
        persist(&tmp).map_err(|e| TierError::io_at(&tmp_path, e, "failed to persist temp pool"))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| TierError::io_at(path, e, "failed to rename temp pool"))?;

    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
        persist_dir(dir).map_err(|e| TierError::io_at(dir, e, "failed to persist pool directory"))?;
    }
    Ok(())
}
