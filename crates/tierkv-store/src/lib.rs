//! TierKV store surface
//!
//! `TierStore` owns one store directory: the index pool, the free-list
//! pool and, when a block device is attached, the offload poller thread.
//! Offload calls are asynchronous and report through a completion
//! callback; the `*_blocking` helpers wrap them for callers that would
//! rather wait.
//!
//! ```text
//! <dir>/index.pool      trie root and value location records
//! <dir>/freelist.pool   LBA free list
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use tierkv_core::bucket::{LbaAllocator, LbaBucketAllocator, SlotAllocator};
use tierkv_core::device::BlockDevice;
use tierkv_core::freelist::{init_free_list, FreeList};
use tierkv_core::index::TierIndex;
use tierkv_core::poller::{request_queue, OffloadCompletion, OffloadPoller, OffloadRequest, PollerHandle, PollerStatsSnapshot};
use tierkv_core::record::ValueLocation;

pub use tierkv_core::{Config, OffloadOp, TierError, TierResult};

pub const INDEX_POOL_FILE: &str = "index.pool";
pub const FREE_LIST_POOL_FILE: &str = "freelist.pool";

/// Offload machinery present only when a device is attached.
struct Offload {
    free_list: Arc<FreeList>,
    requests: Sender<OffloadRequest>,
    poller: Option<PollerHandle>,
    blocks_per_unit: u64,
}

/// A tiered key/value store rooted at one directory.
///
/// All methods take `&self`. The index is shared with the poller thread
/// behind a mutex; offload requests travel over a bounded queue.
pub struct TierStore {
    index: Arc<Mutex<TierIndex>>,
    offload: Option<Offload>,
    path: PathBuf,
    config: Config,
}

impl TierStore {
    /// Open or create a store in `dir`.
    ///
    /// Without a device the store keeps every value in PMEM and offload
    /// requests complete with `OffloadDisabled`.
    pub fn open<P: AsRef<Path>>(dir: P, config: Config, device: Option<Box<dyn BlockDevice>>) -> TierResult<Self> {
        config.validate().map_err(TierError::InvalidConfig)?;
        let path = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path).map_err(|e| TierError::io_at(&path, e, "failed to create store directory"))?;

        let index = TierIndex::open(&path.join(INDEX_POOL_FILE), &config)?;

        let Some(device) = device else {
            info!(path = %path.display(), "opened store without block device; offload disabled");
            return Ok(Self { index: Arc::new(Mutex::new(index)), offload: None, path, config });
        };

        let geometry = device.geometry();
        let blocks_per_unit = config.blocks_per_unit(geometry.block_size);
        let max_lba = geometry.total_blocks / blocks_per_unit;
        if max_lba == 0 {
            return Err(TierError::InvalidConfig(format!(
                "device of {} blocks cannot hold one {} byte allocation unit",
                geometry.total_blocks, config.allocation_unit_size
            )));
        }

        let free_list = init_free_list(
            &path.join(FREE_LIST_POOL_FILE),
            config.free_list_pool_size,
            max_lba,
            config.free_list_slots,
        )?;
        free_list.set_checkpoint_threshold(config.journal_checkpoint_bytes);

        // LBAs lost between a commit and a free-list push come back here.
        let reclaimed = free_list.reclaim_unreferenced(&index.disk_lbas())?;
        let coherence = index.verify_coherence(Some(free_list.max_lba()))?;
        info!(
            path = %path.display(),
            max_lba = free_list.max_lba(),
            blocks_per_unit,
            pmem_records = coherence.pmem_records,
            disk_records = coherence.disk_records,
            reclaimed,
            "opened store"
        );

        let free_list = Arc::new(free_list);
        let allocator: Box<dyn LbaAllocator + Send> = if config.use_lba_buckets {
            Box::new(LbaBucketAllocator::new(
                Arc::clone(&free_list),
                0,
                config.bucket_classes,
                config.bucket_class_bytes,
                config.bucket_capacity,
            ))
        } else {
            Box::new(SlotAllocator::new(Arc::clone(&free_list), 0))
        };

        let index = Arc::new(Mutex::new(index));
        let (requests, queue) = request_queue(config.request_queue_depth);
        let poller = OffloadPoller::new(Arc::clone(&index), device, allocator, queue, &config).spawn()?;

        Ok(Self {
            index,
            offload: Some(Offload { free_list, requests, poller: Some(poller), blocks_per_unit }),
            path,
            config,
        })
    }

    /// Read `key` from block storage; the value arrives in the completion.
    pub fn get<F>(&self, key: &[u8], callback: F)
    where
        F: FnOnce(OffloadCompletion) + Send + 'static,
    {
        self.submit(OffloadRequest::get(key.to_vec(), Box::new(callback)));
    }

    /// Write `value` (or, with `None`, the current PMEM copy) to block
    /// storage and point the key at it.
    pub fn update<F>(&self, key: &[u8], value: Option<Vec<u8>>, callback: F)
    where
        F: FnOnce(OffloadCompletion) + Send + 'static,
    {
        self.submit(OffloadRequest::update(key.to_vec(), value, Box::new(callback)));
    }

    /// Reset `key` to EMPTY, returning any LBA it held to the free list.
    pub fn remove<F>(&self, key: &[u8], callback: F)
    where
        F: FnOnce(OffloadCompletion) + Send + 'static,
    {
        self.submit(OffloadRequest::remove(key.to_vec(), Box::new(callback)));
    }

    fn submit(&self, request: OffloadRequest) {
        let Some(offload) = &self.offload else {
            request.complete(Err(TierError::OffloadDisabled));
            return;
        };
        if let Err(rejected) = offload.requests.send(request) {
            rejected.into_inner().complete(Err(TierError::QueueClosed));
        }
    }

    pub fn get_blocking(&self, key: &[u8], timeout: Duration) -> TierResult<Vec<u8>> {
        let value = self.wait(timeout, |cb| self.get(key, cb))?;
        value.ok_or(TierError::NotFound)
    }

    pub fn update_blocking(&self, key: &[u8], value: Option<Vec<u8>>, timeout: Duration) -> TierResult<()> {
        self.wait(timeout, |cb| self.update(key, value, cb)).map(|_| ())
    }

    pub fn remove_blocking(&self, key: &[u8], timeout: Duration) -> TierResult<()> {
        self.wait(timeout, |cb| self.remove(key, cb)).map(|_| ())
    }

    /// Issue a request and wait for its completion. A completion arriving
    /// after the timeout lands in a dropped channel.
    fn wait<S>(&self, timeout: Duration, issue: S) -> TierResult<Option<Vec<u8>>>
    where
        S: FnOnce(Box<dyn FnOnce(OffloadCompletion) + Send>),
    {
        let (tx, rx) = channel::bounded(1);
        issue(Box::new(move |completion: OffloadCompletion| {
            let _ = tx.send(completion.result);
        }));
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(channel::RecvTimeoutError::Timeout) => Err(TierError::Timeout { waited_ms: timeout.as_millis() as u64 }),
            Err(channel::RecvTimeoutError::Disconnected) => Err(TierError::QueueClosed),
        }
    }

    /// Store `value` inline in PMEM. A key that was on disk gives its LBA
    /// back to the free list.
    pub fn put_inline(&self, key: &[u8], value: &[u8]) -> TierResult<()> {
        let displaced = self.index.lock().put_inline(key, value)?;
        if let Some(lba) = displaced {
            match &self.offload {
                Some(offload) => offload.free_list.push(lba.get())?,
                None => warn!(lba = lba.get(), "displaced lba with no free list attached"),
            }
        }
        Ok(())
    }

    /// PMEM-resident value of `key`; `NotFound` if it is empty or on disk.
    pub fn get_inline(&self, key: &[u8]) -> TierResult<Vec<u8>> {
        self.index.lock().read_inline(key)
    }

    pub fn location(&self, key: &[u8]) -> TierResult<ValueLocation> {
        self.index.lock().location(key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn offload_enabled(&self) -> bool {
        self.offload.is_some()
    }

    /// Poller counters, if a device is attached.
    pub fn stats(&self) -> Option<PollerStatsSnapshot> {
        self.offload.as_ref()?.poller.as_ref().map(PollerHandle::stats)
    }

    /// LBAs currently queued on the free list.
    pub fn free_lba_count(&self) -> usize {
        self.offload.as_ref().map_or(0, |o| o.free_list.free_count())
    }

    /// Size of the LBA space, 0 without a device.
    pub fn max_lba(&self) -> u64 {
        self.offload.as_ref().map_or(0, |o| o.free_list.max_lba())
    }

    pub fn blocks_per_unit(&self) -> u64 {
        self.offload.as_ref().map_or(0, |o| o.blocks_per_unit)
    }

    pub fn pmem_used(&self) -> u64 {
        self.index.lock().pmem_used()
    }

    /// Stop the poller after it drains, then compact both pools.
    pub fn close(mut self) -> TierResult<()> {
        self.stop_poller();
        self.index.lock().checkpoint()?;
        if let Some(offload) = &self.offload {
            offload.free_list.checkpoint()?;
        }
        info!(path = %self.path.display(), "closed store");
        Ok(())
    }

    fn stop_poller(&mut self) {
        if let Some(handle) = self.offload.as_mut().and_then(|o| o.poller.take()) {
            handle.shutdown();
        }
    }
}

impl Drop for TierStore {
    fn drop(&mut self) {
        self.stop_poller();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tierkv_core::MemBlockDevice;

    fn config() -> Config {
        let mut config = Config::minimal();
        config.key_size = 4;
        config
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut bad = config();
        bad.key_size = 0;
        assert!(matches!(TierStore::open(dir.path(), bad, None), Err(TierError::InvalidConfig(_))));
    }

    #[test]
    fn test_device_too_small_for_one_unit() {
        let dir = TempDir::new().unwrap();
        let device = MemBlockDevice::new(512, 4);
        let result = TierStore::open(dir.path(), config(), Some(Box::new(device)));
        assert!(matches!(result, Err(TierError::InvalidConfig(_))));
    }

    #[test]
    fn test_geometry_derived_from_device() {
        let dir = TempDir::new().unwrap();
        let store = TierStore::open(dir.path(), config(), Some(Box::new(MemBlockDevice::new(512, 80)))).unwrap();
        assert_eq!(store.blocks_per_unit(), 8);
        assert_eq!(store.max_lba(), 10);
        assert!(store.offload_enabled());
        store.close().unwrap();
    }

    #[test]
    fn test_inline_without_device() {
        let dir = TempDir::new().unwrap();
        let store = TierStore::open(dir.path(), config(), None).unwrap();
        store.put_inline(b"key1", b"value").unwrap();
        assert_eq!(store.get_inline(b"key1").unwrap(), b"value");
        assert_eq!(store.max_lba(), 0);
        assert!(store.stats().is_none());
        assert!(matches!(
            store.update_blocking(b"key1", None, Duration::from_secs(1)),
            Err(TierError::OffloadDisabled)
        ));
    }
}
