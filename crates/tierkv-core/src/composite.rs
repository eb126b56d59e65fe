//! Multi-device topologies: JBOD concatenation and RAID0 striping
//!
//! A request is split into per-member segments, each submitted with a
//! private token. When the last segment of a request completes, one
//! completion is reported for the original token; read data is gathered
//! back into the caller's buffer first. Any failed segment fails the whole
//! request.

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::device::{BlockDevice, DeviceGeometry, DeviceStats, DeviceStatsSnapshot, DmaBuffer, IoCompletion, IoRequest, IoToken};
use crate::error::{IoKind, TierError, TierResult};

#[derive(Debug, Clone)]
enum Layout {
    /// First block of each member in the combined address space
    Jbod { starts: Vec<u64> },
    Raid0 { stripe_blocks: u64 },
}

/// One slice of a parent request on a member device.
#[derive(Debug, Clone, Copy)]
struct Segment {
    member: usize,
    member_block: u64,
    /// Offset into the parent buffer, in blocks
    parent_block: u64,
    block_count: u64,
}

struct Parent {
    kind: IoKind,
    block_offset: u64,
    buffer: DmaBuffer,
    remaining: usize,
    error: Option<TierError>,
}

pub struct CompositeDevice {
    members: Vec<Box<dyn BlockDevice>>,
    layout: Layout,
    geometry: DeviceGeometry,
    next_token: IoToken,
    parents: HashMap<IoToken, Parent>,
    /// (member, member token) -> (parent token, segment)
    segments: HashMap<(usize, IoToken), (IoToken, Segment)>,
    scratch: Vec<IoCompletion>,
    stats: DeviceStats,
}

impl CompositeDevice {
    /// Members laid end to end.
    pub fn jbod(members: Vec<Box<dyn BlockDevice>>) -> TierResult<Self> {
        let (block_size, alignment) = common_geometry(&members)?;
        let mut starts = Vec::with_capacity(members.len());
        let mut total = 0u64;
        for member in &members {
            starts.push(total);
            total += member.geometry().total_blocks;
        }
        let geometry = DeviceGeometry { block_size, buffer_alignment: alignment, total_blocks: total };
        Ok(Self::assemble(members, Layout::Jbod { starts }, geometry))
    }

    /// Stripes of `stripe_blocks` dealt round-robin across members.
    /// Capacity is limited by the smallest member.
    pub fn raid0(members: Vec<Box<dyn BlockDevice>>, stripe_blocks: u64) -> TierResult<Self> {
        if stripe_blocks == 0 {
            return Err(TierError::InvalidConfig("raid0 stripe must be at least one block".into()));
        }
        let (block_size, alignment) = common_geometry(&members)?;
        let smallest = members.iter().map(|m| m.geometry().total_blocks).min().unwrap_or(0);
        let per_member = smallest / stripe_blocks * stripe_blocks;
        let geometry = DeviceGeometry {
            block_size,
            buffer_alignment: alignment,
            total_blocks: per_member * members.len() as u64,
        };
        Ok(Self::assemble(members, Layout::Raid0 { stripe_blocks }, geometry))
    }

    fn assemble(members: Vec<Box<dyn BlockDevice>>, layout: Layout, geometry: DeviceGeometry) -> Self {
        debug!(members = members.len(), total_blocks = geometry.total_blocks, ?layout, "assembled composite device");
        Self {
            members,
            layout,
            geometry,
            next_token: 1,
            parents: HashMap::new(),
            segments: HashMap::new(),
            scratch: Vec::new(),
            stats: DeviceStats::default(),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Split `[block_offset, block_offset + block_count)` into member segments.
    fn split(&self, block_offset: u64, block_count: u64) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut block = block_offset;
        let mut done = 0u64;
        while done < block_count {
            let left = block_count - done;
            let (member, member_block, run) = match &self.layout {
                Layout::Jbod { starts } => {
                    let member = starts.partition_point(|&s| s <= block) - 1;
                    let end = starts.get(member + 1).copied().unwrap_or(self.geometry.total_blocks);
                    (member, block - starts[member], left.min(end - block))
                }
                Layout::Raid0 { stripe_blocks } => {
                    let n = self.members.len() as u64;
                    let stripe = block / stripe_blocks;
                    let within = block % stripe_blocks;
                    let member = (stripe % n) as usize;
                    let member_block = (stripe / n) * stripe_blocks + within;
                    (member, member_block, left.min(stripe_blocks - within))
                }
            };
            out.push(Segment { member, member_block, parent_block: done, block_count: run });
            block += run;
            done += run;
        }
        out
    }

    fn finish(parent: Parent, token: IoToken) -> IoCompletion {
        IoCompletion {
            token,
            kind: parent.kind,
            block_offset: parent.block_offset,
            result: parent.error.map_or(Ok(()), Err),
            buffer: parent.buffer,
        }
    }
}

fn common_geometry(members: &[Box<dyn BlockDevice>]) -> TierResult<(u32, usize)> {
    let first = members
        .first()
        .ok_or_else(|| TierError::InvalidConfig("composite device needs at least one member".into()))?
        .geometry();
    let mut alignment = first.buffer_alignment;
    for member in members {
        let geo = member.geometry();
        if geo.block_size != first.block_size {
            return Err(TierError::InvalidConfig(format!(
                "member block sizes differ: {} vs {}",
                first.block_size, geo.block_size
            )));
        }
        alignment = alignment.max(geo.buffer_alignment);
    }
    Ok((first.block_size, alignment))
}

impl BlockDevice for CompositeDevice {
    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn submit(&mut self, request: IoRequest) -> TierResult<()> {
        self.geometry.check_range(request.kind, request.block_offset, request.block_count)?;
        let block = self.geometry.block_size as usize;
        let segments = self.split(request.block_offset, request.block_count);

        let mut parent = Parent {
            kind: request.kind,
            block_offset: request.block_offset,
            buffer: request.buffer,
            remaining: 0,
            error: None,
        };

        let mut submitted = Vec::with_capacity(segments.len());
        for seg in &segments {
            let len = seg.block_count as usize * block;
            let start = seg.parent_block as usize * block;
            let mut buffer = DmaBuffer::new(len, self.geometry.buffer_alignment);
            if request.kind == IoKind::Write {
                buffer.as_mut_slice().copy_from_slice(&parent.buffer.as_slice()[start..start + len]);
            }
            let token = self.next_token;
            self.next_token += 1;
            let sub = IoRequest {
                token,
                kind: request.kind,
                block_offset: seg.member_block,
                block_count: seg.block_count,
                buffer,
            };
            match self.members[seg.member].submit(sub) {
                Ok(()) => {
                    submitted.push((seg.member, token, *seg));
                    parent.remaining += 1;
                }
                Err(err) => {
                    if submitted.is_empty() {
                        return Err(err);
                    }
                    // Earlier segments are already queued; report through the completion.
                    warn!(member = seg.member, error = %err, "segment submit failed");
                    parent.error = Some(err);
                    break;
                }
            }
        }

        for (member, token, seg) in submitted {
            self.segments.insert((member, token), (request.token, seg));
        }
        self.parents.insert(request.token, parent);
        self.stats.record_submit();
        Ok(())
    }

    fn poll_completions(&mut self, out: &mut Vec<IoCompletion>) -> usize {
        let block = self.geometry.block_size as usize;
        let mut reported = 0;
        for member in 0..self.members.len() {
            self.scratch.clear();
            self.members[member].poll_completions(&mut self.scratch);
            for done in self.scratch.drain(..) {
                let Some((parent_token, seg)) = self.segments.remove(&(member, done.token)) else {
                    continue;
                };
                let Some(parent) = self.parents.get_mut(&parent_token) else {
                    continue;
                };
                match done.result {
                    Ok(()) if parent.kind == IoKind::Read => {
                        let start = seg.parent_block as usize * block;
                        let len = seg.block_count as usize * block;
                        parent.buffer.as_mut_slice()[start..start + len].copy_from_slice(&done.buffer.as_slice()[..len]);
                    }
                    Ok(()) => {}
                    Err(err) => {
                        parent.error.get_or_insert(err);
                    }
                }
                parent.remaining -= 1;
                if parent.remaining == 0 {
                    if let Some(parent) = self.parents.remove(&parent_token) {
                        let completion = Self::finish(parent, parent_token);
                        self.stats.record_completion(completion.kind, completion.result.is_ok());
                        out.push(completion);
                        reported += 1;
                    }
                }
            }
        }
        reported
    }

    fn outstanding(&self) -> usize {
        self.parents.len()
    }

    fn stats(&self) -> DeviceStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_device::MemBlockDevice;

    fn members(n: usize, blocks: u64) -> (Vec<MemBlockDevice>, Vec<Box<dyn BlockDevice>>) {
        let devs: Vec<MemBlockDevice> = (0..n).map(|_| MemBlockDevice::new(512, blocks)).collect();
        let boxed = devs.iter().map(|d| Box::new(d.clone()) as Box<dyn BlockDevice>).collect();
        (devs, boxed)
    }

    fn drain(dev: &mut CompositeDevice) -> Vec<IoCompletion> {
        let mut out = Vec::new();
        dev.poll_completions(&mut out);
        out
    }

    fn pattern(blocks: usize) -> Vec<u8> {
        (0..blocks * 512).map(|i| (i / 512) as u8 + 1).collect()
    }

    #[test]
    fn test_jbod_spans_members() {
        let (mems, boxed) = members(2, 8);
        let mut dev = CompositeDevice::jbod(boxed).unwrap();
        assert_eq!(dev.geometry().total_blocks, 16);
        let geo = dev.geometry();

        // Blocks 6..10 cross from member 0 into member 1.
        dev.submit_write(7, 6, DmaBuffer::from_slice(&geo, &pattern(4))).unwrap();
        let done = drain(&mut dev);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].token, 7);
        assert!(done[0].result.is_ok());
        assert_eq!(mems[0].read_raw(6, 1)[0], 1);
        assert_eq!(mems[1].read_raw(0, 1)[0], 3);

        dev.submit_read(8, 6, DmaBuffer::for_bytes(&geo, 4 * 512)).unwrap();
        let done = drain(&mut dev);
        assert_eq!(done[0].buffer.as_slice(), &pattern(4)[..]);
    }

    #[test]
    fn test_raid0_stripes_round_robin() {
        let (mems, boxed) = members(2, 8);
        let mut dev = CompositeDevice::raid0(boxed, 2).unwrap();
        assert_eq!(dev.geometry().total_blocks, 16);
        let geo = dev.geometry();

        dev.submit_write(1, 0, DmaBuffer::from_slice(&geo, &pattern(6))).unwrap();
        assert_eq!(drain(&mut dev).len(), 1);
        // Stripes: [0,1]->m0@0, [2,3]->m1@0, [4,5]->m0@2
        assert_eq!(mems[0].read_raw(0, 1)[0], 1);
        assert_eq!(mems[1].read_raw(0, 1)[0], 3);
        assert_eq!(mems[0].read_raw(2, 1)[0], 5);

        dev.submit_read(2, 1, DmaBuffer::for_bytes(&geo, 4 * 512)).unwrap();
        let done = drain(&mut dev);
        assert_eq!(done[0].buffer.as_slice(), &pattern(6)[512..5 * 512]);
    }

    #[test]
    fn test_member_failure_fails_request() {
        let (mems, boxed) = members(2, 8);
        let mut dev = CompositeDevice::raid0(boxed, 1).unwrap();
        let geo = dev.geometry();
        mems[1].fail_next_writes(1);

        dev.submit_write(3, 0, DmaBuffer::from_slice(&geo, &pattern(2))).unwrap();
        let done = drain(&mut dev);
        assert_eq!(done.len(), 1);
        assert!(matches!(done[0].result, Err(TierError::DeviceIo { .. })));
        assert_eq!(dev.outstanding(), 0);
        assert_eq!(dev.stats().write_errors, 1);
    }

    #[test]
    fn test_mixed_block_sizes_rejected() {
        let boxed: Vec<Box<dyn BlockDevice>> = vec![
            Box::new(MemBlockDevice::new(512, 8)),
            Box::new(MemBlockDevice::new(4096, 8)),
        ];
        assert!(CompositeDevice::jbod(boxed).is_err());
        assert!(CompositeDevice::jbod(Vec::new()).is_err());
    }
}
