//! Offload poller: the single-threaded tiering engine
//!
//! Each iteration drains a bounded batch of requests, runs the synchronous
//! part of each (lookup, LBA allocation, at most one device submit), then
//! reaps device completions and finishes the requests they belong to. The
//! poller never blocks on I/O; a request waiting for the device simply
//! stays in `in_flight` across iterations.
//!
//! Request states:
//!
//! ```text
//! RECEIVED -> LOCATED -> READING | WRITING | FREEING -> COMPLETED | FAILED
//! ```
//!
//! Requests on one key run in submission order: while a key has a device
//! operation in flight, later requests for it wait in a per-key queue.
//! Every request gets exactly one completion callback.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::device::{BlockDevice, DeviceGeometry, DmaBuffer, IoCompletion, IoToken};
use crate::error::{TierError, TierResult};
use crate::index::TierIndex;
use crate::record::{Lba, LocationTag};
use crate::bucket::LbaAllocator;

/// Operation carried by an offload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffloadOp {
    Get,
    Update,
    Remove,
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Located,
    Reading,
    Writing,
    Freeing,
    Completed,
    Failed,
}

/// Delivered once per request.
#[derive(Debug)]
pub struct OffloadCompletion {
    pub op: OffloadOp,
    pub key: Vec<u8>,
    /// Value bytes for a successful GET, `None` otherwise
    pub result: TierResult<Option<Vec<u8>>>,
}

impl OffloadCompletion {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value_size(&self) -> usize {
        match &self.result {
            Ok(Some(value)) => value.len(),
            _ => 0,
        }
    }
}

pub type CompletionCallback = Box<dyn FnOnce(OffloadCompletion) + Send + 'static>;

pub struct OffloadRequest {
    pub op: OffloadOp,
    pub key: Vec<u8>,
    /// New value for UPDATE; without one the PMEM copy is offloaded
    pub value: Option<Vec<u8>>,
    pub callback: CompletionCallback,
}

impl OffloadRequest {
    pub fn get(key: Vec<u8>, callback: CompletionCallback) -> Self {
        Self { op: OffloadOp::Get, key, value: None, callback }
    }

    pub fn update(key: Vec<u8>, value: Option<Vec<u8>>, callback: CompletionCallback) -> Self {
        Self { op: OffloadOp::Update, key, value, callback }
    }

    pub fn remove(key: Vec<u8>, callback: CompletionCallback) -> Self {
        Self { op: OffloadOp::Remove, key, value: None, callback }
    }

    /// Fire the callback with `result`, consuming the request.
    pub fn complete(self, result: TierResult<Option<Vec<u8>>>) {
        (self.callback)(OffloadCompletion { op: self.op, key: self.key, result });
    }
}

impl std::fmt::Debug for OffloadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadRequest")
            .field("op", &self.op)
            .field("key_len", &self.key.len())
            .field("value_len", &self.value.as_ref().map(Vec::len))
            .finish()
    }
}

/// Bounded request queue feeding a poller.
pub fn request_queue(depth: usize) -> (Sender<OffloadRequest>, Receiver<OffloadRequest>) {
    channel::bounded(depth)
}

/// Counters per terminal state and per operation.
#[derive(Debug, Default)]
pub struct PollerStats {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    gets: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
    parked: AtomicU64,
    iterations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollerStatsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub gets: u64,
    pub updates: u64,
    pub removes: u64,
    pub parked: u64,
    pub iterations: u64,
}

impl PollerStats {
    pub fn snapshot(&self) -> PollerStatsSnapshot {
        PollerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
        }
    }

    fn record_op(&self, op: OffloadOp) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let counter = match op {
            OffloadOp::Get => &self.gets,
            OffloadOp::Update => &self.updates,
            OffloadOp::Remove => &self.removes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A request waiting on the device.
struct InFlight {
    request: OffloadRequest,
    state: RequestState,
    lba: Lba,
    size: usize,
    /// Size of the value the new LBA supersedes, for releasing it
    superseded_size: usize,
}

/// Tiering engine over a block device and an LBA allocator.
pub struct OffloadPoller<D: BlockDevice, A: LbaAllocator> {
    index: Arc<Mutex<TierIndex>>,
    device: D,
    allocator: A,
    queue: Receiver<OffloadRequest>,
    geometry: DeviceGeometry,
    blocks_per_unit: u64,
    dequeue_limit: usize,
    idle_backoff: Duration,
    in_flight: HashMap<IoToken, InFlight>,
    /// Keys with a device operation in flight, and requests queued behind it
    busy_keys: HashMap<Vec<u8>, VecDeque<OffloadRequest>>,
    next_token: IoToken,
    reaped: Vec<IoCompletion>,
    disconnected: bool,
    stats: Arc<PollerStats>,
}

impl<D: BlockDevice, A: LbaAllocator> OffloadPoller<D, A> {
    pub fn new(index: Arc<Mutex<TierIndex>>, device: D, allocator: A, queue: Receiver<OffloadRequest>, config: &Config) -> Self {
        let geometry = device.geometry();
        let blocks_per_unit = config.blocks_per_unit(geometry.block_size);
        Self {
            index,
            device,
            allocator,
            queue,
            geometry,
            blocks_per_unit,
            dequeue_limit: config.dequeue_limit,
            idle_backoff: config.idle_backoff,
            in_flight: HashMap::new(),
            busy_keys: HashMap::new(),
            next_token: 1,
            reaped: Vec::new(),
            disconnected: false,
            stats: Arc::new(PollerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PollerStats> {
        Arc::clone(&self.stats)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Requests waiting behind an in-flight operation on the same key.
    pub fn parked(&self) -> usize {
        self.busy_keys.values().map(VecDeque::len).sum()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// True when nothing is queued, parked or waiting on the device.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.busy_keys.is_empty() && self.queue.is_empty()
    }

    /// One iteration: dequeue up to `dequeue_limit` requests, then reap
    /// device completions. Returns the amount of work done.
    pub fn process(&mut self) -> usize {
        self.stats.iterations.fetch_add(1, Ordering::Relaxed);
        let mut work = 0;
        while work < self.dequeue_limit {
            match self.queue.try_recv() {
                Ok(request) => {
                    self.dispatch(request);
                    work += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        work + self.poll_device()
    }

    /// Loop until `shutdown` is set, then drain queued and in-flight work.
    /// Also returns once every sender is gone and nothing is left to do.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        loop {
            let work = self.process();
            let stopping = shutdown.load(Ordering::Acquire) || self.disconnected;
            if stopping && self.is_idle() {
                break;
            }
            if work == 0 {
                thread::sleep(self.idle_backoff);
            }
        }
        if let Err(err) = self.allocator.flush() {
            warn!(error = %err, "failed to flush allocator on poller exit");
        }
        info!(stats = ?self.stats.snapshot(), "offload poller stopped");
    }

    fn dispatch(&mut self, request: OffloadRequest) {
        self.stats.record_op(request.op);
        trace!(op = ?request.op, key_len = request.key.len(), state = ?RequestState::Received, "request received");
        if let Some(waiting) = self.busy_keys.get_mut(&request.key) {
            self.stats.parked.fetch_add(1, Ordering::Relaxed);
            waiting.push_back(request);
            return;
        }
        self.start(request);
    }

    /// Run the synchronous part of `request`. Returns true if it is now
    /// waiting on the device, in which case its key is marked busy.
    fn start(&mut self, request: OffloadRequest) -> bool {
        let resolved = self.index.lock().resolve(&request.key);
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                self.fail(request, err);
                return false;
            }
        };
        trace!(op = ?request.op, tag = ?resolved.tag, state = ?RequestState::Located, "request located");

        match request.op {
            OffloadOp::Get => match (resolved.tag, resolved.lba) {
                (LocationTag::Disk, Some(lba)) => self.start_read(request, lba, resolved.size),
                // PMEM reads are served before requests reach the poller.
                _ => {
                    self.fail(request, TierError::NotFound);
                    false
                }
            },
            OffloadOp::Update => {
                let superseded_size = if resolved.tag == LocationTag::Disk { resolved.size } else { 0 };
                match (resolved.tag, request.value.is_some()) {
                    (LocationTag::Empty, false) => {
                        self.fail(request, TierError::NotFound);
                        false
                    }
                    (LocationTag::Disk, false) => {
                        // Already offloaded; nothing to write.
                        self.succeed(request, None);
                        false
                    }
                    _ => self.start_write(request, superseded_size),
                }
            }
            OffloadOp::Remove => {
                trace!(key_len = request.key.len(), state = ?RequestState::Freeing, "freeing");
                self.free(request, resolved.size);
                false
            }
        }
    }

    fn next_token(&mut self) -> IoToken {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        token
    }

    fn start_read(&mut self, request: OffloadRequest, lba: Lba, size: usize) -> bool {
        let token = self.next_token();
        let buffer = DmaBuffer::for_bytes(&self.geometry, size);
        if let Err(err) = self.device.submit_read(token, lba.block_offset(self.blocks_per_unit), buffer) {
            self.fail(request, err);
            return false;
        }
        trace!(token, lba = lba.get(), state = ?RequestState::Reading, "read submitted");
        self.busy_keys.entry(request.key.clone()).or_default();
        self.in_flight.insert(token, InFlight { request, state: RequestState::Reading, lba, size, superseded_size: 0 });
        true
    }

    fn start_write(&mut self, request: OffloadRequest, superseded_size: usize) -> bool {
        let current = match &request.value {
            Some(value) => Ok(value.len()),
            None => self.index.lock().resolve(&request.key).map(|resolved| resolved.size),
        };
        let io_size = match current {
            Ok(size) => size,
            Err(err) => {
                self.fail(request, err);
                return false;
            }
        };
        let max = self.blocks_per_unit as usize * self.geometry.block_size as usize;
        if io_size > max {
            self.fail(request, TierError::OversizedValue { size: io_size, max });
            return false;
        }

        let lba = match self.allocator.allocate(io_size) {
            Ok(lba) => lba,
            Err(err) => {
                self.fail(request, err);
                return false;
            }
        };

        let payload = self.index.lock().begin_offload(&request.key, lba, request.value.as_deref());
        let payload = match payload {
            Ok(payload) => payload,
            Err(err) => {
                self.release_lba(lba, io_size);
                self.fail(request, err);
                return false;
            }
        };

        let token = self.next_token();
        let buffer = DmaBuffer::from_slice(&self.geometry, &payload);
        if let Err(err) = self.device.submit_write(token, lba.block_offset(self.blocks_per_unit), buffer) {
            self.abort_write(&request.key, lba, io_size);
            self.fail(request, err);
            return false;
        }
        trace!(token, lba = lba.get(), size = payload.len(), state = ?RequestState::Writing, "write submitted");
        self.busy_keys.entry(request.key.clone()).or_default();
        self.in_flight.insert(
            token,
            InFlight { request, state: RequestState::Writing, lba, size: payload.len(), superseded_size },
        );
        true
    }

    fn free(&mut self, request: OffloadRequest, size: usize) {
        let removed = self.index.lock().remove(&request.key);
        match removed {
            Ok(Some(lba)) => {
                self.release_lba(lba, size);
                self.succeed(request, None);
            }
            Ok(None) => self.succeed(request, None),
            Err(err) => self.fail(request, err),
        }
    }

    /// Undo `begin_offload` and hand the LBA back.
    fn abort_write(&mut self, key: &[u8], lba: Lba, io_size: usize) {
        let aborted = self.index.lock().abort_offload(key);
        if let Err(err) = aborted {
            error!(error = %err, lba = lba.get(), "failed to clear pending offload");
        }
        self.release_lba(lba, io_size);
    }

    fn release_lba(&mut self, lba: Lba, io_size: usize) {
        // A lost release is recovered by the reclaim pass at next open.
        if let Err(err) = self.allocator.release(lba, io_size) {
            error!(error = %err, lba = lba.get(), "failed to release lba");
        }
    }

    /// Reap device completions and finish their requests.
    fn poll_device(&mut self) -> usize {
        let mut reaped = std::mem::take(&mut self.reaped);
        let n = self.device.poll_completions(&mut reaped);
        for completion in reaped.drain(..) {
            let Some(flight) = self.in_flight.remove(&completion.token) else {
                warn!(token = completion.token, "completion for unknown token");
                continue;
            };
            let key = flight.request.key.clone();
            self.complete_io(flight, completion);
            self.resume(&key);
        }
        self.reaped = reaped;
        n
    }

    fn complete_io(&mut self, flight: InFlight, completion: IoCompletion) {
        let InFlight { request, state, lba, size, superseded_size } = flight;
        match (state, completion.result) {
            (RequestState::Reading, Ok(())) => {
                let bytes = completion.buffer.as_slice()[..size].to_vec();
                self.succeed(request, Some(bytes));
            }
            (RequestState::Writing, Ok(())) => {
                let committed = self.index.lock().commit_offload(&request.key);
                match committed {
                    Ok(superseded) => {
                        if let Some(old) = superseded {
                            self.release_lba(old, superseded_size);
                        }
                        self.succeed(request, None);
                    }
                    Err(err) => {
                        self.abort_write(&request.key, lba, size);
                        self.fail(request, err);
                    }
                }
            }
            (RequestState::Writing, Err(err)) => {
                self.abort_write(&request.key, lba, size);
                self.fail(request, err);
            }
            (_, Err(err)) => self.fail(request, err),
            (state, Ok(())) => {
                error!(?state, "device completion in unexpected state");
                self.fail(request, TierError::NotFound);
            }
        }
    }

    /// Start requests parked behind `key` until one goes to the device.
    fn resume(&mut self, key: &[u8]) {
        loop {
            let next = self.busy_keys.get_mut(key).and_then(VecDeque::pop_front);
            match next {
                Some(request) => {
                    if self.start(request) {
                        return;
                    }
                }
                None => {
                    self.busy_keys.remove(key);
                    return;
                }
            }
        }
    }

    fn succeed(&self, request: OffloadRequest, value: Option<Vec<u8>>) {
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        trace!(op = ?request.op, state = ?RequestState::Completed, "request completed");
        request.complete(Ok(value));
    }

    fn fail(&self, request: OffloadRequest, err: TierError) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        debug!(op = ?request.op, error = %err, state = ?RequestState::Failed, "request failed");
        request.complete(Err(err));
    }
}

impl<D, A> OffloadPoller<D, A>
where
    D: BlockDevice + 'static,
    A: LbaAllocator + Send + 'static,
{
    /// Run the poller on its own thread.
    pub fn spawn(mut self) -> TierResult<PollerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let stats = self.stats();

        let thread = thread::Builder::new()
            .name("tierkv-poller".to_string())
            .spawn(move || self.run(&flag))
            .map_err(|e| TierError::Io {
                path: None,
                kind: std::io::ErrorKind::Other,
                message: format!("failed to spawn poller thread: {}", e),
            })?;

        Ok(PollerHandle { shutdown, thread: Some(thread), stats })
    }
}

/// Handle to a poller thread. Dropping it stops the poller after it has
/// drained its work.
pub struct PollerHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    stats: Arc<PollerStats>,
}

impl PollerHandle {
    /// Request shutdown and wait for the poller to drain and exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("offload poller thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn stats(&self) -> PollerStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
