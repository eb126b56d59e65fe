//! TierKV Core: Tiered PMEM/NVMe Key-Value Engine
//!
//! Values start in a persistent-memory pool and are offloaded to block
//! storage by a single poller thread. A fixed-depth trie maps keys to
//! location records; every location change is a journaled transaction,
//! so a crash leaves each record either fully old or fully new.
//!
//! # Architecture
//!
//! - **Index**: byte-wise trie over fixed-size keys, persisted in a journaled pool
//! - **Free list**: persistent LBA queues with a bump range and slot stealing
//! - **Buckets**: per-size-class LBA caches in front of the free list
//! - **Poller**: non-blocking GET/UPDATE/REMOVE state machine over a `BlockDevice`
//!
//! The store surface (open/close, async calls, blocking helpers) lives in
//! the `tierkv-store` crate.

pub mod bucket;
pub mod composite;
pub mod config;
pub mod device;
pub mod error;
pub mod file_device;
pub mod format;
pub mod freelist;
pub mod index;
pub mod mem_device;
pub mod persist;
pub mod poller;
pub mod pool;
pub mod record;
pub mod trie;

// Re-export key types for convenience
pub use bucket::{LbaAllocator, LbaBucketAllocator, SlotAllocator};
pub use composite::CompositeDevice;
pub use config::Config;
pub use device::{BlockDevice, DeviceGeometry, DeviceStatsSnapshot, DmaBuffer, IoCompletion, IoRequest};
pub use error::{IoKind, TierError, TierResult};
pub use file_device::FileBlockDevice;
pub use freelist::{init_free_list, FreeList};
pub use index::{Resolved, TierIndex};
pub use mem_device::MemBlockDevice;
pub use poller::{
    request_queue, CompletionCallback, OffloadCompletion, OffloadOp, OffloadPoller, OffloadRequest, PollerHandle,
    PollerStatsSnapshot,
};
pub use record::{Lba, LocationTag, ValueLocation};
