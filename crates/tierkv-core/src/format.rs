//! Binary format of TierKV pool journals
//!
//! A pool file is a sequence of frames:
//! FrameHeader (32 bytes) + payload
//!
//! The first frame of every pool is a `Header` frame naming the layout and
//! capacity. Every later frame is a `Transaction` frame whose payload is a
//! record count followed by that many encoded records. A transaction frame
//! is the unit of atomicity: replay applies all of its records or none.

use std::path::PathBuf;

use crate::error::{TierError, TierResult};

/// Magic bytes identifying a journal frame: "TKVJ"
pub const FRAME_MAGIC: [u8; 4] = *b"TKVJ";

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 32;

/// Upper bound on one frame payload; larger lengths are treated as corruption
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;

/// Pool format version written into header frames
pub const POOL_FORMAT_VERSION: u16 = 1;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Pool identity: layout name, capacity, format version
    Header = 1,
    /// One atomic group of records
    Transaction = 2,
}

impl FrameKind {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(FrameKind::Header),
            2 => Some(FrameKind::Transaction),
            _ => None,
        }
    }
}

/// Fixed-size header in front of every frame
///
/// Layout:
///   [0..4]   magic:    [u8;4] - "TKVJ"
///   [4..8]   length:   u32    - payload length in bytes
///   [8..12]  checksum: u32    - CRC32C of payload bytes
///   [12]     kind:     u8     - FrameKind
///   [13..16] reserved: [u8;3]
///   [16..24] txid:     u64    - monotonic transaction id
///   [24..32] padding:  [u8;8]
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub kind: u8,
    pub txid: u64,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, txid: u64, payload: &[u8]) -> Self {
        Self {
            magic: FRAME_MAGIC,
            length: payload.len() as u32,
            checksum: crc32c::crc32c(payload),
            kind: kind as u8,
            txid,
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.kind;
        buf[16..24].copy_from_slice(&self.txid.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        let mut txid = [0u8; 8];
        txid.copy_from_slice(&buf[16..24]);
        Self {
            magic,
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            checksum: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            kind: buf[12],
            txid: u64::from_le_bytes(txid),
        }
    }
}

/// A frame decoded from a byte buffer, borrowing its payload
#[derive(Debug)]
pub struct Frame<'a> {
    pub kind: FrameKind,
    pub txid: u64,
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// Total bytes this frame occupies in the journal.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Build a complete frame (header + payload) ready to append.
pub fn encode_frame(kind: FrameKind, txid: u64, payload: &[u8]) -> TierResult<Vec<u8>> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(TierError::OversizedValue {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }
    let header = FrameHeader::new(kind, txid, payload);
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode the frame that starts at `offset` within `data`.
///
/// `path` is only used for error context.
pub fn decode_frame<'a>(data: &'a [u8], offset: usize, path: &PathBuf) -> TierResult<Frame<'a>> {
    let remaining = data.len().saturating_sub(offset);
    if remaining < FRAME_HEADER_SIZE {
        return Err(TierError::TornWrite {
            path: path.clone(),
            expected_size: FRAME_HEADER_SIZE as u32,
            available_bytes: remaining as u64,
            offset: offset as u64,
        });
    }

    let mut hdr_buf = [0u8; FRAME_HEADER_SIZE];
    hdr_buf.copy_from_slice(&data[offset..offset + FRAME_HEADER_SIZE]);
    let header = FrameHeader::from_bytes(&hdr_buf);

    if header.magic != FRAME_MAGIC {
        return Err(TierError::NoMagicFound {
            path: path.clone(),
            offset: offset as u64,
            found_bytes: header.magic,
        });
    }

    let length = header.length as usize;
    if length > MAX_FRAME_PAYLOAD {
        return Err(TierError::JournalCorrupted {
            path: path.clone(),
            offset: offset as u64,
            reason: format!("frame length {} exceeds maximum {}", length, MAX_FRAME_PAYLOAD),
        });
    }

    let payload_start = offset + FRAME_HEADER_SIZE;
    if data.len() - payload_start < length {
        return Err(TierError::TornWrite {
            path: path.clone(),
            expected_size: header.length,
            available_bytes: (data.len() - payload_start) as u64,
            offset: payload_start as u64,
        });
    }

    let payload = &data[payload_start..payload_start + length];
    let computed = crc32c::crc32c(payload);
    if computed != header.checksum {
        return Err(TierError::ChecksumMismatch {
            path: path.clone(),
            expected: header.checksum,
            actual: computed,
            offset: payload_start as u64,
        });
    }

    let kind = FrameKind::from_u8(header.kind).ok_or_else(|| TierError::JournalCorrupted {
        path: path.clone(),
        offset: (offset + 12) as u64,
        reason: format!("unknown frame kind {}", header.kind),
    })?;

    Ok(Frame { kind, txid: header.txid, payload })
}

/// Little-endian field writer for record payloads
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed (u32) byte string.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed (u32) list of u64.
    pub fn put_u64_list(&mut self, values: &[u64]) {
        self.put_u32(values.len() as u32);
        for v in values {
            self.put_u64(*v);
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked reader over a record payload
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> TierResult<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(TierError::JournalCorrupted {
                path: PathBuf::from("<frame>"),
                offset: self.pos as u64,
                reason: format!("need {} bytes, {} left", n, self.data.len() - self.pos),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> TierResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> TierResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> TierResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> TierResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn get_bytes(&mut self) -> TierResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_u64_list(&mut self) -> TierResult<Vec<u64>> {
        let len = self.get_u32()? as usize;
        if len > (self.data.len() - self.pos) / 8 {
            return Err(self.corrupted(format!("u64 list of {} entries overruns payload", len)));
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.get_u64()?);
        }
        Ok(out)
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.data.len()
    }

    pub fn corrupted(&self, reason: String) -> TierError {
        TierError::JournalCorrupted {
            path: PathBuf::from("<frame>"),
            offset: self.pos as u64,
            reason,
        }
    }
}

/// A record type that can live in a pool journal.
pub trait JournalRecord: Sized {
    fn encode(&self, enc: &mut Encoder);
    fn decode(dec: &mut Decoder<'_>) -> TierResult<Self>;
}

/// Encode a transaction payload: count(u32) + records.
pub fn encode_records<R: JournalRecord>(records: &[R]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_u32(records.len() as u32);
    for record in records {
        record.encode(&mut enc);
    }
    enc.finish()
}

/// Encode `records` as a run of transaction payloads, each filled up to
/// `budget` bytes. A record larger than `budget` gets a payload of its own.
pub fn encode_record_batches<R: JournalRecord>(records: &[R], budget: usize) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    let mut current = vec![0u8; 4];
    let mut count: u32 = 0;

    for record in records {
        let mut enc = Encoder::new();
        record.encode(&mut enc);
        let bytes = enc.finish();
        if count > 0 && current.len() + bytes.len() > budget {
            current[..4].copy_from_slice(&count.to_le_bytes());
            payloads.push(std::mem::replace(&mut current, vec![0u8; 4]));
            count = 0;
        }
        current.extend_from_slice(&bytes);
        count += 1;
    }

    if count > 0 {
        current[..4].copy_from_slice(&count.to_le_bytes());
        payloads.push(current);
    }
    payloads
}

/// Decode a transaction payload produced by `encode_records`.
pub fn decode_records<R: JournalRecord>(payload: &[u8]) -> TierResult<Vec<R>> {
    let mut dec = Decoder::new(payload);
    let count = dec.get_u32()? as usize;
    let mut records = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        records.push(R::decode(&mut dec)?);
    }
    if !dec.is_exhausted() {
        return Err(dec.corrupted("trailing bytes after last record".to_string()));
    }
    Ok(records)
}

/// Identity stored in a pool's header frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolIdentity {
    pub layout: String,
    pub capacity: u64,
    pub version: u16,
}

impl PoolIdentity {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes(self.layout.as_bytes());
        enc.put_u64(self.capacity);
        enc.put_u16(self.version);
        enc.finish()
    }

    pub fn decode(payload: &[u8]) -> TierResult<Self> {
        let mut dec = Decoder::new(payload);
        let layout = dec.get_bytes()?;
        let layout = String::from_utf8(layout)
            .map_err(|_| dec.corrupted("layout name is not UTF-8".to_string()))?;
        let capacity = dec.get_u64()?;
        let version = dec.get_u16()?;
        Ok(Self { layout, capacity, version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sample {
        tag: u8,
        lbas: Vec<u64>,
        blob: Vec<u8>,
    }

    impl JournalRecord for Sample {
        fn encode(&self, enc: &mut Encoder) {
            enc.put_u8(self.tag);
            enc.put_u64_list(&self.lbas);
            enc.put_bytes(&self.blob);
        }

        fn decode(dec: &mut Decoder<'_>) -> TierResult<Self> {
            Ok(Sample {
                tag: dec.get_u8()?,
                lbas: dec.get_u64_list()?,
                blob: dec.get_bytes()?,
            })
        }
    }

    fn path() -> PathBuf {
        PathBuf::from("<test>")
    }

    #[test]
    fn test_header_layout_is_32_bytes() {
        let header = FrameHeader::new(FrameKind::Transaction, 7, b"abc");
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
        let back = FrameHeader::from_bytes(&bytes);
        assert_eq!(back.txid, 7);
        assert_eq!(back.length, 3);
        assert_eq!(back.kind, FrameKind::Transaction as u8);
    }

    #[test]
    fn test_frame_with_records_decodes() {
        let records = vec![
            Sample { tag: 1, lbas: vec![0, 1, 2], blob: b"k1".to_vec() },
            Sample { tag: 2, lbas: vec![], blob: vec![] },
        ];
        let payload = encode_records(&records);
        let frame_bytes = encode_frame(FrameKind::Transaction, 3, &payload).unwrap();

        let frame = decode_frame(&frame_bytes, 0, &path()).unwrap();
        assert_eq!(frame.kind, FrameKind::Transaction);
        assert_eq!(frame.txid, 3);
        assert_eq!(frame.encoded_len(), frame_bytes.len());

        let decoded: Vec<Sample> = decode_records(frame.payload).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_record_batches_respect_budget() {
        let records: Vec<Sample> = (0..10u8)
            .map(|tag| Sample { tag, lbas: vec![tag as u64; 4], blob: vec![tag; 20] })
            .collect();
        // Each record encodes to 1 + 4 + 32 + 4 + 20 = 61 bytes.
        let payloads = encode_record_batches(&records, 4 + 3 * 61);
        assert_eq!(payloads.len(), 4);
        assert!(payloads.iter().all(|p| p.len() <= 4 + 3 * 61));

        let decoded: Vec<Sample> = payloads
            .iter()
            .flat_map(|p| decode_records::<Sample>(p).unwrap())
            .collect();
        assert_eq!(decoded, records);

        // Smaller than one record: one record per payload.
        assert_eq!(encode_record_batches(&records, 8).len(), 10);
        assert!(encode_record_batches::<Sample>(&[], 1024).is_empty());
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = encode_frame(FrameKind::Transaction, 1, b"payload").unwrap();
        data[0] = 0xFF;
        assert!(matches!(decode_frame(&data, 0, &path()), Err(TierError::NoMagicFound { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = encode_frame(FrameKind::Transaction, 1, b"payload").unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(decode_frame(&data, 0, &path()), Err(TierError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_frame_is_torn() {
        let data = encode_frame(FrameKind::Transaction, 1, b"0123456789").unwrap();
        let cut = &data[..data.len() - 4];
        assert!(matches!(decode_frame(cut, 0, &path()), Err(TierError::TornWrite { .. })));
        assert!(matches!(decode_frame(&data[..10], 0, &path()), Err(TierError::TornWrite { .. })));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut payload = encode_records(&[Sample { tag: 9, lbas: vec![5], blob: vec![1] }]);
        payload.push(0);
        let result: TierResult<Vec<Sample>> = decode_records(&payload);
        assert!(matches!(result, Err(TierError::JournalCorrupted { .. })));
    }

    #[test]
    fn test_list_length_overrun_rejected() {
        let mut enc = Encoder::new();
        enc.put_u32(1);
        enc.put_u8(1);
        enc.put_u32(1_000_000); // claims a million lbas
        let result: TierResult<Vec<Sample>> = decode_records(&enc.finish());
        assert!(result.is_err());
    }

    #[test]
    fn test_pool_identity_roundtrip() {
        let id = PoolIdentity { layout: "tierkv-index".into(), capacity: 1 << 30, version: POOL_FORMAT_VERSION };
        assert_eq!(PoolIdentity::decode(&id.encode()).unwrap(), id);
    }
}
