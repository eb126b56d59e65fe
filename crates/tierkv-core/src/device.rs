//! Block device interface
//!
//! The poller talks to storage only through `BlockDevice`. Submission never
//! blocks: a request is queued and its outcome is collected later through
//! `poll_completions`, tagged with the token given at submit time.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{IoKind, TierError, TierResult};

/// Caller-chosen tag tying a completion to its request.
pub type IoToken = u64;

/// Device properties queried once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub block_size: u32,
    pub buffer_alignment: usize,
    pub total_blocks: u64,
}

impl DeviceGeometry {
    /// Whole blocks needed for `bytes`.
    pub fn blocks_for(&self, bytes: usize) -> u64 {
        let block = self.block_size as u64;
        (bytes as u64 + block - 1) / block
    }

    /// `bytes` rounded up to whole blocks.
    pub fn aligned_size(&self, bytes: usize) -> usize {
        (self.blocks_for(bytes) * self.block_size as u64) as usize
    }

    /// Reject requests that run past the end of the device.
    pub fn check_range(&self, kind: IoKind, block_offset: u64, block_count: u64) -> TierResult<()> {
        let end = block_offset.checked_add(block_count);
        if block_count == 0 || end.map_or(true, |end| end > self.total_blocks) {
            return Err(TierError::DeviceIo {
                op: kind,
                block_offset,
                message: format!("{} blocks outside device of {} blocks", block_count, self.total_blocks),
            });
        }
        Ok(())
    }
}

/// Zeroed I/O buffer whose data starts on a `buffer_alignment` boundary.
///
/// Backed by an over-allocated `Vec`; the aligned window starts at `offset`.
pub struct DmaBuffer {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl DmaBuffer {
    pub fn new(len: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let storage = vec![0u8; len + alignment - 1];
        let misalign = storage.as_ptr() as usize % alignment;
        let offset = if misalign == 0 { 0 } else { alignment - misalign };
        Self { storage, offset, len }
    }

    /// A buffer of whole blocks able to hold `bytes`.
    pub fn for_bytes(geometry: &DeviceGeometry, bytes: usize) -> Self {
        Self::new(geometry.aligned_size(bytes.max(1)), geometry.buffer_alignment)
    }

    /// Block-rounded buffer holding a copy of `data`, zero padded.
    pub fn from_slice(geometry: &DeviceGeometry, data: &[u8]) -> Self {
        let mut buf = Self::for_bytes(geometry, data.len());
        buf.as_mut_slice()[..data.len()].copy_from_slice(data);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }

    pub fn is_aligned(&self, alignment: usize) -> bool {
        self.as_slice().as_ptr() as usize % alignment.max(1) == 0
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer").field("len", &self.len).finish()
    }
}

/// One submitted block operation.
#[derive(Debug)]
pub struct IoRequest {
    pub token: IoToken,
    pub kind: IoKind,
    pub block_offset: u64,
    pub block_count: u64,
    /// Source for writes, destination for reads
    pub buffer: DmaBuffer,
}

/// Outcome of an `IoRequest`, carrying its buffer back.
#[derive(Debug)]
pub struct IoCompletion {
    pub token: IoToken,
    pub kind: IoKind,
    pub block_offset: u64,
    pub result: TierResult<()>,
    pub buffer: DmaBuffer,
}

impl IoCompletion {
    pub fn for_request(request: IoRequest, result: TierResult<()>) -> Self {
        Self {
            token: request.token,
            kind: request.kind,
            block_offset: request.block_offset,
            result,
            buffer: request.buffer,
        }
    }
}

/// Per-device I/O counters.
#[derive(Debug, Default)]
pub struct DeviceStats {
    reads_completed: AtomicU64,
    writes_completed: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    submitted: AtomicU64,
    reaped: AtomicU64,
}

/// Point-in-time copy of `DeviceStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatsSnapshot {
    pub reads_completed: u64,
    pub writes_completed: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub outstanding: u64,
}

impl DeviceStats {
    pub fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, kind: IoKind, ok: bool) {
        let counter = match (kind, ok) {
            (IoKind::Read, true) => &self.reads_completed,
            (IoKind::Write, true) => &self.writes_completed,
            (IoKind::Read, false) => &self.read_errors,
            (IoKind::Write, false) => &self.write_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outstanding(&self) -> u64 {
        self.submitted
            .load(Ordering::Relaxed)
            .saturating_sub(self.reaped.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            reads_completed: self.reads_completed.load(Ordering::Relaxed),
            writes_completed: self.writes_completed.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            outstanding: self.outstanding(),
        }
    }
}

/// Asynchronous block storage.
pub trait BlockDevice: Send {
    fn geometry(&self) -> DeviceGeometry;

    /// Queue `request`. An `Err` means it was rejected outright and no
    /// completion will follow.
    fn submit(&mut self, request: IoRequest) -> TierResult<()>;

    /// Move finished operations into `out`; returns how many were added.
    fn poll_completions(&mut self, out: &mut Vec<IoCompletion>) -> usize;

    /// Submitted operations whose completion has not been polled yet.
    fn outstanding(&self) -> usize;

    fn stats(&self) -> DeviceStatsSnapshot;

    fn submit_read(&mut self, token: IoToken, block_offset: u64, buffer: DmaBuffer) -> TierResult<()> {
        let block_count = buffer.len() as u64 / self.geometry().block_size as u64;
        self.submit(IoRequest { token, kind: IoKind::Read, block_offset, block_count, buffer })
    }

    fn submit_write(&mut self, token: IoToken, block_offset: u64, buffer: DmaBuffer) -> TierResult<()> {
        let block_count = buffer.len() as u64 / self.geometry().block_size as u64;
        self.submit(IoRequest { token, kind: IoKind::Write, block_offset, block_count, buffer })
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn geometry(&self) -> DeviceGeometry {
        (**self).geometry()
    }

    fn submit(&mut self, request: IoRequest) -> TierResult<()> {
        (**self).submit(request)
    }

    fn poll_completions(&mut self, out: &mut Vec<IoCompletion>) -> usize {
        (**self).poll_completions(out)
    }

    fn outstanding(&self) -> usize {
        (**self).outstanding()
    }

    fn stats(&self) -> DeviceStatsSnapshot {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> DeviceGeometry {
        DeviceGeometry { block_size: 512, buffer_alignment: 4096, total_blocks: 1024 }
    }

    #[test]
    fn test_buffer_alignment_and_rounding() {
        let geo = geometry();
        let buf = DmaBuffer::for_bytes(&geo, 1000);
        assert_eq!(buf.len(), 1024);
        assert!(buf.is_aligned(4096));
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_slice_pads_with_zeros() {
        let buf = DmaBuffer::from_slice(&geometry(), b"abc");
        assert_eq!(buf.len(), 512);
        assert_eq!(&buf.as_slice()[..3], b"abc");
        assert_eq!(buf.as_slice()[3], 0);
    }

    #[test]
    fn test_range_check() {
        let geo = geometry();
        assert!(geo.check_range(IoKind::Read, 1020, 4).is_ok());
        assert!(geo.check_range(IoKind::Read, 1021, 4).is_err());
        assert!(geo.check_range(IoKind::Write, 0, 0).is_err());
        assert!(geo.check_range(IoKind::Write, u64::MAX, 2).is_err());
    }

    #[test]
    fn test_stats_track_outstanding() {
        let stats = DeviceStats::default();
        stats.record_submit();
        stats.record_submit();
        stats.record_completion(IoKind::Write, true);
        let snap = stats.snapshot();
        assert_eq!(snap.writes_completed, 1);
        assert_eq!(snap.outstanding, 1);
        stats.record_completion(IoKind::Read, false);
        assert_eq!(stats.snapshot().read_errors, 1);
        assert_eq!(stats.outstanding(), 0);
    }
}
