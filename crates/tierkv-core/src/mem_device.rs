//! In-memory block device
//!
//! Data lives in a shared `Vec<u8>`; cloning the handle shares the device,
//! so a test can keep one clone for fault injection and inspection while
//! the poller owns another. Operations take effect at submit time and their
//! completions are released on the next `poll_completions`, unless
//! completions are being held back.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{BlockDevice, DeviceGeometry, DeviceStats, DeviceStatsSnapshot, IoCompletion, IoRequest};
use crate::error::{IoKind, TierError, TierResult};

#[derive(Debug, Default)]
struct Faults {
    fail_writes: u32,
    fail_reads: u32,
    reject_submits: u32,
}

struct MemState {
    data: Vec<u8>,
    ready: VecDeque<IoCompletion>,
    hold_completions: bool,
    faults: Faults,
    reads_submitted: u64,
    writes_submitted: u64,
}

#[derive(Clone)]
pub struct MemBlockDevice {
    geometry: DeviceGeometry,
    state: Arc<Mutex<MemState>>,
    stats: Arc<DeviceStats>,
}

impl MemBlockDevice {
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        let geometry = DeviceGeometry {
            block_size,
            buffer_alignment: block_size as usize,
            total_blocks,
        };
        let state = MemState {
            data: vec![0u8; block_size as usize * total_blocks as usize],
            ready: VecDeque::new(),
            hold_completions: false,
            faults: Faults::default(),
            reads_submitted: 0,
            writes_submitted: 0,
        };
        Self {
            geometry,
            state: Arc::new(Mutex::new(state)),
            stats: Arc::new(DeviceStats::default()),
        }
    }

    /// Complete the next `n` writes with a device error, leaving data untouched.
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().faults.fail_writes = n;
    }

    /// Complete the next `n` reads with a device error.
    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().faults.fail_reads = n;
    }

    /// Reject the next `n` submissions synchronously.
    pub fn reject_next_submits(&self, n: u32) {
        self.state.lock().faults.reject_submits = n;
    }

    /// While held, completions pile up instead of being reaped.
    pub fn hold_completions(&self, hold: bool) {
        self.state.lock().hold_completions = hold;
    }

    pub fn reads_submitted(&self) -> u64 {
        self.state.lock().reads_submitted
    }

    pub fn writes_submitted(&self) -> u64 {
        self.state.lock().writes_submitted
    }

    /// Copy of `len` bytes starting at `block`.
    pub fn read_raw(&self, block: u64, len: usize) -> Vec<u8> {
        let start = block as usize * self.geometry.block_size as usize;
        let state = self.state.lock();
        let end = (start + len).min(state.data.len());
        state.data[start.min(end)..end].to_vec()
    }
}

impl BlockDevice for MemBlockDevice {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn submit(&mut self, mut request: IoRequest) -> TierResult<()> {
        let mut state = self.state.lock();
        if state.faults.reject_submits > 0 {
            state.faults.reject_submits -= 1;
            return Err(TierError::DeviceIo {
                op: request.kind,
                block_offset: request.block_offset,
                message: "submission queue rejected request".into(),
            });
        }
        self.geometry.check_range(request.kind, request.block_offset, request.block_count)?;

        let block = self.geometry.block_size as usize;
        let start = request.block_offset as usize * block;
        let len = (request.block_count as usize * block).min(request.buffer.len());

        let result = match request.kind {
            IoKind::Write => {
                state.writes_submitted += 1;
                if state.faults.fail_writes > 0 {
                    state.faults.fail_writes -= 1;
                    Err("injected write failure")
                } else {
                    state.data[start..start + len].copy_from_slice(&request.buffer.as_slice()[..len]);
                    Ok(())
                }
            }
            IoKind::Read => {
                state.reads_submitted += 1;
                if state.faults.fail_reads > 0 {
                    state.faults.fail_reads -= 1;
                    Err("injected read failure")
                } else {
                    request.buffer.as_mut_slice()[..len].copy_from_slice(&state.data[start..start + len]);
                    Ok(())
                }
            }
        };

        let result = result.map_err(|message| TierError::DeviceIo {
            op: request.kind,
            block_offset: request.block_offset,
            message: message.to_string(),
        });
        self.stats.record_submit();
        state.ready.push_back(IoCompletion::for_request(request, result));
        Ok(())
    }

    fn poll_completions(&mut self, out: &mut Vec<IoCompletion>) -> usize {
        let mut state = self.state.lock();
        if state.hold_completions {
            return 0;
        }
        let n = state.ready.len();
        for completion in state.ready.drain(..) {
            self.stats.record_completion(completion.kind, completion.result.is_ok());
            out.push(completion);
        }
        n
    }

    fn outstanding(&self) -> usize {
        self.stats.outstanding() as usize
    }

    fn stats(&self) -> DeviceStatsSnapshot {
        self.stats.snapshot()
    }
}
