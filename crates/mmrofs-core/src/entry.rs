//! On-flash entry records and the entry state machine.
//!
//! The header region is a dense table of packed 32-byte little-endian
//! records. Every lifecycle transition of a record is realized by
//! programming its state byte to a value whose 1-bits are a strict subset of
//! the previous value, so any transition is legal under the NOR 1→0 rule and
//! a power cut can never leave a state byte that gains bits.

use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Size of the header region holding the entry table.
pub const HEADER_SIZE: u32 = 0x1_0000;
/// First byte of the data region.
pub const DATA_REGION_START: u32 = HEADER_SIZE;
/// Smallest unit the flash can return to all-ones.
pub const ERASE_BLOCK_SIZE: u32 = 4096;
/// Size of one packed entry record.
pub const ENTRY_SIZE: usize = 32;
/// Total entry slots in the header region.
pub const ENTRY_COUNT: u32 = HEADER_SIZE / ENTRY_SIZE as u32;
/// First usable slot. The first erase block of the header is reserved and
/// its slots are treated as non-existent.
pub const FIRST_ENTRY: u32 = ERASE_BLOCK_SIZE / ENTRY_SIZE as u32;
/// Longest permitted filename, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

/// Sentinel for "no entry" in `old_entry` / `dst_entry`.
pub const ENTRY_NONE: u32 = 0xFFFF_FFFF;
/// Sentinel for an mtime that has never been programmed.
pub const MTIME_UNSET: u32 = 0xFFFF_FFFF;
/// Low bits that are all set while `size` holds a provisional capacity.
pub const CAPACITY_MASK_BITS: u32 = 0xFFF;

/// Byte offset of the `size` field within an entry record.
pub(crate) const SIZE_FIELD_OFFSET: u32 = 12;
/// Byte offset of the `mtime` field within an entry record.
pub(crate) const MTIME_FIELD_OFFSET: u32 = 16;

/// Position of an entry in its lifecycle. The byte values are the wire
/// encoding; successors always clear a strict superset of zero bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    /// Slot unused; the full 32 bytes are 0xFF.
    Free = 0xFF,
    /// Slot claimed; the record body is being programmed.
    Allocating = 0x7F,
    /// Record body complete; the extent may still be being filled.
    PendingData = 0x3F,
    /// Committing: superseded entries are being tombstoned.
    TombstoningOld = 0x1F,
    /// Extent complete, unique owner of the name; mtime may be unset.
    Active = 0x0F,
    /// Finalized with committed mtime and exact size.
    Valid = 0x07,
    /// Logically deleted.
    Tombstone = 0x03,
    /// Not usable.
    BadBlock = 0x01,
    /// Known-garbage content; not live.
    Erased = 0x00,
}

impl EntryState {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0xFF => Some(Self::Free),
            0x7F => Some(Self::Allocating),
            0x3F => Some(Self::PendingData),
            0x1F => Some(Self::TombstoningOld),
            0x0F => Some(Self::Active),
            0x07 => Some(Self::Valid),
            0x03 => Some(Self::Tombstone),
            0x01 => Some(Self::BadBlock),
            0x00 => Some(Self::Erased),
            _ => None,
        }
    }
}

/// True for the states observable by applications.
pub fn state_is_live(state: u8) -> bool {
    state == EntryState::Active as u8 || state == EntryState::Valid as u8
}

/// Round up to the next erase-block boundary. Computed in u64 because
/// corrupt records can carry sizes near `u32::MAX`.
pub fn align_up_4k(v: u64) -> u64 {
    (v + (ERASE_BLOCK_SIZE as u64 - 1)) & !(ERASE_BLOCK_SIZE as u64 - 1)
}

/// True while `size` still holds a provisional capacity rather than an
/// exact byte count.
pub fn is_capacity_mask(size: u32) -> bool {
    size & CAPACITY_MASK_BITS == CAPACITY_MASK_BITS
}

/// One packed 32-byte directory record, exactly as stored in the header
/// region.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RawEntry {
    pub state: u8,
    /// Format version; 0xFF while unused, 0x00 once the body is written.
    pub reserved_v: u8,
    pub name_len: U16<LittleEndian>,
    pub name_hash: U32<LittleEndian>,
    /// Partition-relative byte offset of the data extent.
    pub offset: U32<LittleEndian>,
    /// `name_len + payload bytes`, or a capacity mask while building.
    pub size: U32<LittleEndian>,
    pub mtime: U32<LittleEndian>,
    pub ctime: U32<LittleEndian>,
    /// Index of the live entry this version supersedes, or `ENTRY_NONE`.
    pub old_entry: U32<LittleEndian>,
    /// Index of an entry displaced at a rename destination, or `ENTRY_NONE`.
    pub dst_entry: U32<LittleEndian>,
}

const _: () = assert!(std::mem::size_of::<RawEntry>() == ENTRY_SIZE);

impl RawEntry {
    /// Compose a record in the ALLOCATING state, ready for the body program.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name_len: u16,
        name_hash: u32,
        offset: u32,
        size: u32,
        mtime: u32,
        ctime: u32,
        old_entry: u32,
        dst_entry: u32,
    ) -> Self {
        Self {
            state: EntryState::Allocating as u8,
            reserved_v: 0x00,
            name_len: U16::new(name_len),
            name_hash: U32::new(name_hash),
            offset: U32::new(offset),
            size: U32::new(size),
            mtime: U32::new(mtime),
            ctime: U32::new(ctime),
            old_entry: U32::new(old_entry),
            dst_entry: U32::new(dst_entry),
        }
    }

    pub fn is_live(&self) -> bool {
        state_is_live(self.state)
    }

    /// Bytes of the data region covered by this entry's extent.
    pub fn alloc_len(&self) -> u64 {
        align_up_4k(self.size.get() as u64)
    }

    /// Structural validation of a record claiming a live or committing
    /// state. Records that fail this are tombstoned on sight.
    pub fn validate(&self, partition_size: u32) -> bool {
        let name_len = self.name_len.get() as u32;
        if name_len == 0 || name_len > MAX_FILENAME_LEN as u32 {
            return false;
        }
        if self.size.get() < name_len {
            return false;
        }
        let offset = self.offset.get();
        if offset < DATA_REGION_START || offset % ERASE_BLOCK_SIZE != 0 {
            return false;
        }
        if offset as u64 + self.alloc_len() > partition_size as u64 {
            return false;
        }
        let old = self.old_entry.get();
        if old != ENTRY_NONE && old >= ENTRY_COUNT {
            return false;
        }
        let dst = self.dst_entry.get();
        if dst != ENTRY_NONE && dst >= ENTRY_COUNT {
            return false;
        }
        true
    }
}
