//! File-backed block device
//!
//! A dedicated worker thread performs positional reads and writes; the
//! poller only pushes requests into one channel and drains completions from
//! another, so it never waits on the file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use tracing::{debug, error, info};

use crate::device::{BlockDevice, DeviceGeometry, DeviceStats, DeviceStatsSnapshot, IoCompletion, IoRequest};
use crate::error::{IoKind, TierError, TierResult};
use crate::persist::persist;

pub struct FileBlockDevice {
    geometry: DeviceGeometry,
    path: PathBuf,
    requests: Option<Sender<IoRequest>>,
    completions: Receiver<IoCompletion>,
    worker: Option<thread::JoinHandle<()>>,
    stats: Arc<DeviceStats>,
}

impl FileBlockDevice {
    /// Create (or resize) a device file of `total_blocks` blocks.
    pub fn create(path: &Path, block_size: u32, total_blocks: u64, sync_writes: bool) -> TierResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| TierError::io_at(path, e, "failed to create device file"))?;
        file.set_len(block_size as u64 * total_blocks)
            .map_err(|e| TierError::io_at(path, e, "failed to size device file"))?;
        Self::start(path, file, block_size, total_blocks, sync_writes)
    }

    /// Open an existing device file; its length determines the block count.
    pub fn open(path: &Path, block_size: u32, sync_writes: bool) -> TierResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TierError::io_at(path, e, "failed to open device file"))?;
        let len = file
            .metadata()
            .map_err(|e| TierError::io_at(path, e, "failed to stat device file"))?
            .len();
        Self::start(path, file, block_size, len / block_size as u64, sync_writes)
    }

    fn start(path: &Path, file: File, block_size: u32, total_blocks: u64, sync_writes: bool) -> TierResult<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(TierError::InvalidConfig(format!("block size {} is not a power of two", block_size)));
        }
        let geometry = DeviceGeometry {
            block_size,
            buffer_alignment: block_size as usize,
            total_blocks,
        };
        let (req_tx, req_rx) = channel::unbounded::<IoRequest>();
        let (done_tx, done_rx) = channel::unbounded::<IoCompletion>();

        let worker_path = path.to_path_buf();
        let worker = thread::Builder::new()
            .name("tierkv-io".to_string())
            .spawn(move || io_worker(file, worker_path, geometry, sync_writes, req_rx, done_tx))
            .map_err(|e| TierError::io_at(path, e, "failed to spawn device worker"))?;

        info!(path = %path.display(), block_size, total_blocks, sync_writes, "opened file device");
        Ok(Self {
            geometry,
            path: path.to_path_buf(),
            requests: Some(req_tx),
            completions: done_rx,
            worker: Some(worker),
            stats: Arc::new(DeviceStats::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_worker(
    file: File,
    path: PathBuf,
    geometry: DeviceGeometry,
    sync_writes: bool,
    requests: Receiver<IoRequest>,
    completions: Sender<IoCompletion>,
) {
    let block = geometry.block_size as u64;
    // Exits once the device handle drops its sender.
    while let Ok(mut request) = requests.recv() {
        let offset = request.block_offset * block;
        let len = (request.block_count * block) as usize;
        let outcome = match request.kind {
            IoKind::Write => write_at(&file, &request.buffer.as_slice()[..len], offset).and_then(|_| {
                if sync_writes {
                    persist(&file)
                } else {
                    Ok(())
                }
            }),
            IoKind::Read => read_at(&file, &mut request.buffer.as_mut_slice()[..len], offset),
        };
        let result = outcome.map_err(|e| TierError::DeviceIo {
            op: request.kind,
            block_offset: request.block_offset,
            message: e.to_string(),
        });
        if let Err(err) = &result {
            error!(path = %path.display(), error = %err, "device i/o failed");
        }
        if completions.send(IoCompletion::for_request(request, result)).is_err() {
            break;
        }
    }
    debug!(path = %path.display(), "device worker exiting");
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        let rest = buf;
        buf = &mut rest[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::WriteZero));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

impl BlockDevice for FileBlockDevice {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn submit(&mut self, request: IoRequest) -> TierResult<()> {
        self.geometry.check_range(request.kind, request.block_offset, request.block_count)?;
        if request.buffer.len() < (request.block_count * self.geometry.block_size as u64) as usize {
            return Err(TierError::DeviceIo {
                op: request.kind,
                block_offset: request.block_offset,
                message: format!("buffer of {} bytes too small for {} blocks", request.buffer.len(), request.block_count),
            });
        }
        let sender = self.requests.as_ref().ok_or(TierError::QueueClosed)?;
        let (kind, block_offset) = (request.kind, request.block_offset);
        sender.send(request).map_err(|_| TierError::DeviceIo {
            op: kind,
            block_offset,
            message: "device worker has stopped".into(),
        })?;
        self.stats.record_submit();
        Ok(())
    }

    fn poll_completions(&mut self, out: &mut Vec<IoCompletion>) -> usize {
        let mut n = 0;
        loop {
            match self.completions.try_recv() {
                Ok(completion) => {
                    self.stats.record_completion(completion.kind, completion.result.is_ok());
                    out.push(completion);
                    n += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
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

impl Drop for FileBlockDevice {
    fn drop(&mut self) {
        // Closing the request channel stops the worker after queued work.
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DmaBuffer;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn wait_for(dev: &mut FileBlockDevice, n: usize) -> Vec<IoCompletion> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut done = Vec::new();
        while done.len() < n && Instant::now() < deadline {
            if dev.poll_completions(&mut done) == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        done
    }

    #[test]
    fn test_write_read_through_worker() {
        let dir = TempDir::new().unwrap();
        let mut dev = FileBlockDevice::create(&dir.path().join("dev.img"), 512, 64, true).unwrap();
        let geo = dev.geometry();

        dev.submit_write(1, 10, DmaBuffer::from_slice(&geo, b"persisted")).unwrap();
        let done = wait_for(&mut dev, 1);
        assert!(done[0].result.is_ok());

        dev.submit_read(2, 10, DmaBuffer::for_bytes(&geo, 9)).unwrap();
        let done = wait_for(&mut dev, 1);
        assert_eq!(done[0].token, 2);
        assert_eq!(&done[0].buffer.as_slice()[..9], b"persisted");
        assert_eq!(dev.outstanding(), 0);
    }

    #[test]
    fn test_reopen_sees_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.img");
        {
            let mut dev = FileBlockDevice::create(&path, 512, 16, false).unwrap();
            let geo = dev.geometry();
            dev.submit_write(1, 3, DmaBuffer::from_slice(&geo, b"again")).unwrap();
            wait_for(&mut dev, 1);
        }
        let mut dev = FileBlockDevice::open(&path, 512, false).unwrap();
        assert_eq!(dev.geometry().total_blocks, 16);
        let geo = dev.geometry();
        dev.submit_read(1, 3, DmaBuffer::for_bytes(&geo, 5)).unwrap();
        let done = wait_for(&mut dev, 1);
        assert_eq!(&done[0].buffer.as_slice()[..5], b"again");
    }

    #[test]
    fn test_rejects_out_of_range() {
        let dir = TempDir::new().unwrap();
        let mut dev = FileBlockDevice::create(&dir.path().join("dev.img"), 512, 4, false).unwrap();
        let geo = dev.geometry();
        assert!(dev.submit_write(1, 4, DmaBuffer::for_bytes(&geo, 512)).is_err());
    }
}
