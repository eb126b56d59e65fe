//! Per-key value location records
//!
//! A `ValueLocation` is a tagged variant: the tier and the pointer into that
//! tier are one value, so a record can never claim `DISK` without an LBA or
//! `PMEM` without its bytes.

use std::fmt;

use crate::error::TierResult;
use crate::format::{Decoder, Encoder};
use crate::pool::Reservation;

/// Logical block address in allocation units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lba(pub u64);

impl Lba {
    pub fn get(self) -> u64 {
        self.0
    }

    /// First device block of this LBA.
    pub fn block_offset(self, blocks_per_unit: u64) -> u64 {
        self.0 * blocks_per_unit
    }
}

impl fmt::Display for Lba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lba:{}", self.0)
    }
}

/// Which tier currently holds a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationTag {
    Empty,
    Pmem,
    Disk,
}

/// A value resident in the persistent memory pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmemValue {
    /// Pool allocation id; never 0
    pub handle: u64,
    pub bytes: Vec<u8>,
}

/// Where a key's value lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValueLocation {
    #[default]
    Empty,
    InPmem(PmemValue),
    OnDisk(Lba),
}

const TAG_EMPTY: u8 = 0;
const TAG_PMEM: u8 = 1;
const TAG_DISK: u8 = 2;

impl ValueLocation {
    pub fn tag(&self) -> LocationTag {
        match self {
            ValueLocation::Empty => LocationTag::Empty,
            ValueLocation::InPmem(_) => LocationTag::Pmem,
            ValueLocation::OnDisk(_) => LocationTag::Disk,
        }
    }

    pub fn lba(&self) -> Option<Lba> {
        match self {
            ValueLocation::OnDisk(lba) => Some(*lba),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ValueLocation::Empty)
    }

    /// Bytes this location holds in the pmem pool.
    pub fn pmem_bytes(&self) -> u64 {
        match self {
            ValueLocation::InPmem(value) => value.bytes.len() as u64,
            _ => 0,
        }
    }

    /// Tag byte followed by the payload of that arm.
    pub(crate) fn encode(&self, enc: &mut Encoder) {
        match self {
            ValueLocation::Empty => enc.put_u8(TAG_EMPTY),
            ValueLocation::InPmem(value) => {
                enc.put_u8(TAG_PMEM);
                enc.put_u64(value.handle);
                enc.put_bytes(&value.bytes);
            }
            ValueLocation::OnDisk(lba) => {
                enc.put_u8(TAG_DISK);
                enc.put_u64(lba.0);
            }
        }
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>) -> TierResult<Self> {
        match dec.get_u8()? {
            TAG_EMPTY => Ok(ValueLocation::Empty),
            TAG_PMEM => {
                let handle = dec.get_u64()?;
                let bytes = dec.get_bytes()?;
                Ok(ValueLocation::InPmem(PmemValue { handle, bytes }))
            }
            TAG_DISK => Ok(ValueLocation::OnDisk(Lba(dec.get_u64()?))),
            other => Err(dec.corrupted(format!("unknown location tag {}", other))),
        }
    }
}

/// A device write in flight for this record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingUpdate {
    /// Freshly allocated LBA the write targets
    pub lba: Lba,
    /// Logical size of the value being written
    pub size: usize,
}

/// One slot of a trie leaf.
///
/// `pending_alloc` and `pending_update` are volatile; they are `None`
/// whenever no transition is running, and always after a restart.
#[derive(Debug, Default)]
pub struct ValueRecord {
    pub location: ValueLocation,
    /// Logical value length
    pub size: usize,
    pub pending_alloc: Option<Reservation>,
    pub pending_update: Option<PendingUpdate>,
}

impl ValueRecord {
    pub fn tag(&self) -> LocationTag {
        self.location.tag()
    }

    pub fn is_pending(&self) -> bool {
        self.pending_alloc.is_some() || self.pending_update.is_some()
    }

    /// Tag and payload agree, and a disk LBA lies in `[0, max_lba)`.
    pub fn is_coherent(&self, max_lba: Option<u64>) -> bool {
        match &self.location {
            ValueLocation::Empty => self.size == 0,
            ValueLocation::InPmem(value) => value.handle != 0 && value.bytes.len() == self.size,
            ValueLocation::OnDisk(lba) => max_lba.map_or(true, |max| lba.0 < max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_offset() {
        assert_eq!(Lba(0).block_offset(8), 0);
        assert_eq!(Lba(3).block_offset(8), 24);
        assert_eq!(Lba(5).to_string(), "lba:5");
    }

    #[test]
    fn test_location_encoding() {
        let cases = [
            ValueLocation::Empty,
            ValueLocation::InPmem(PmemValue { handle: 7, bytes: b"abc".to_vec() }),
            ValueLocation::OnDisk(Lba(42)),
        ];
        for loc in cases {
            let mut enc = Encoder::new();
            loc.encode(&mut enc);
            let bytes = enc.finish();
            let back = ValueLocation::decode(&mut Decoder::new(&bytes)).unwrap();
            assert_eq!(back, loc);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let bytes = [9u8];
        assert!(ValueLocation::decode(&mut Decoder::new(&bytes)).is_err());
    }

    #[test]
    fn test_coherence() {
        let mut rec = ValueRecord::default();
        assert!(rec.is_coherent(Some(4)));

        rec.location = ValueLocation::OnDisk(Lba(3));
        rec.size = 100;
        assert!(rec.is_coherent(Some(4)));
        assert!(!rec.is_coherent(Some(3)));

        rec.location = ValueLocation::InPmem(PmemValue { handle: 0, bytes: vec![0; 100] });
        assert!(!rec.is_coherent(None));
    }
}
