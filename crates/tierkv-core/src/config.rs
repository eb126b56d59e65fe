//! Configuration management for TierKV
//!
//! Provides presets for different hardware classes and a validation pass
//! that every store runs before touching a pool file.

use std::time::Duration;

/// TierKV configuration with hardware-class presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Uniform key length in bytes; also the trie depth
    pub key_size: usize,
    /// Bytes covered by one LBA on the block device
    pub allocation_unit_size: usize,
    /// Capacity of the index pool (inline PMEM values are charged here)
    pub pmem_pool_size: u64,
    /// Capacity of the free-list pool file
    pub free_list_pool_size: u64,
    /// Number of independent free-list slots
    pub free_list_slots: u32,
    /// LBAs held by one bucket before it flushes back to the free list
    pub bucket_capacity: usize,
    /// Number of size classes in the bucket allocator
    pub bucket_classes: usize,
    /// Width of one bucket size class in bytes
    pub bucket_class_bytes: usize,
    /// Route poller allocations through per-thread LBA buckets
    pub use_lba_buckets: bool,
    /// Maximum requests drained from the queue per poller iteration
    pub dequeue_limit: usize,
    /// Bound of the request queue feeding the poller
    pub request_queue_depth: usize,
    /// Pause taken by an idle poller iteration
    pub idle_backoff: Duration,
    /// Journal size that triggers a checkpoint rewrite
    pub journal_checkpoint_bytes: u64,
    /// Stripe width for RAID0 composite devices, in device blocks
    pub raid0_stripe_blocks: u64,
    /// Persist file-backed device writes before completing them
    pub sync_device_writes: bool,
}

impl Config {
    /// Server-class: large pools, 16 KiB allocation units, deep queues
    pub fn server() -> Self {
        Self {
            key_size: 16,
            allocation_unit_size: 16 * 1024,
            pmem_pool_size: 8 * 1024 * 1024 * 1024,
            free_list_pool_size: 1024 * 1024 * 1024,
            free_list_slots: 8,
            bucket_capacity: 1024,
            bucket_classes: 8,
            bucket_class_bytes: 4096,
            use_lba_buckets: false,
            dequeue_limit: 1024,
            request_queue_depth: 64 * 1024,
            idle_backoff: Duration::from_micros(50),
            journal_checkpoint_bytes: 256 * 1024 * 1024,
            raid0_stripe_blocks: 128,
            sync_device_writes: true,
        }
    }

    /// Workstation-class: single NVMe drive, moderate pools
    pub fn workstation() -> Self {
        Self {
            key_size: 16,
            allocation_unit_size: 16 * 1024,
            pmem_pool_size: 1024 * 1024 * 1024,
            free_list_pool_size: 128 * 1024 * 1024,
            free_list_slots: 4,
            bucket_capacity: 512,
            bucket_classes: 8,
            bucket_class_bytes: 4096,
            use_lba_buckets: false,
            dequeue_limit: 512,
            request_queue_depth: 8 * 1024,
            idle_backoff: Duration::from_micros(100),
            journal_checkpoint_bytes: 64 * 1024 * 1024,
            raid0_stripe_blocks: 128,
            sync_device_writes: true,
        }
    }

    /// Minimal: tiny pools for tests and embedded use
    pub fn minimal() -> Self {
        Self {
            key_size: 8,
            allocation_unit_size: 4096,
            pmem_pool_size: 16 * 1024 * 1024,
            free_list_pool_size: 4 * 1024 * 1024,
            free_list_slots: 1,
            bucket_capacity: 64,
            bucket_classes: 4,
            bucket_class_bytes: 4096,
            use_lba_buckets: false,
            dequeue_limit: 64,
            request_queue_depth: 256,
            idle_backoff: Duration::from_micros(200),
            journal_checkpoint_bytes: 4 * 1024 * 1024,
            raid0_stripe_blocks: 8,
            sync_device_writes: false,
        }
    }

    /// Blocks of `block_size` needed to hold one allocation unit (rounded up).
    pub fn blocks_per_unit(&self, block_size: u32) -> u64 {
        let block = block_size as u64;
        (self.allocation_unit_size as u64 + block - 1) / block
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.key_size == 0 || self.key_size > 64 {
            return Err("key_size must be in [1, 64]".into());
        }
        if self.allocation_unit_size < 512 || !self.allocation_unit_size.is_power_of_two() {
            return Err("allocation_unit_size must be a power of two >= 512".into());
        }
        if self.pmem_pool_size < 1024 * 1024 {
            return Err("pmem_pool_size must be >= 1MB".into());
        }
        if self.free_list_pool_size < 64 * 1024 {
            return Err("free_list_pool_size must be >= 64KB".into());
        }
        if self.free_list_slots == 0 || self.free_list_slots > 256 {
            return Err("free_list_slots must be in [1, 256]".into());
        }
        if self.bucket_capacity < 2 {
            return Err("bucket_capacity must be >= 2".into());
        }
        if self.bucket_classes == 0 || self.bucket_class_bytes == 0 {
            return Err("bucket_classes and bucket_class_bytes must be > 0".into());
        }
        if self.bucket_classes * self.bucket_class_bytes < self.allocation_unit_size {
            return Err("bucket classes must cover one allocation unit".into());
        }
        if self.dequeue_limit == 0 {
            return Err("dequeue_limit must be > 0".into());
        }
        if self.request_queue_depth == 0 {
            return Err("request_queue_depth must be > 0".into());
        }
        if self.journal_checkpoint_bytes < 64 * 1024 {
            return Err("journal_checkpoint_bytes must be >= 64KB".into());
        }
        if self.raid0_stripe_blocks == 0 {
            return Err("raid0_stripe_blocks must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}
