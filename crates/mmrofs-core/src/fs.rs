//! Mounted filesystem state and entry-table access.
//!
//! `Mmrofs` owns the partition, the allocation hint, the sliding data-read
//! window and the wall clock. Mounting binds the partition, bootstraps the
//! clock from stored timestamps if the host clock is unset, and runs the
//! recovery scan before any caller can observe the tree.

use tracing::info;
use zerocopy::{AsBytes, FromBytes};

use crate::clock::WallClock;
use crate::entry::{
    EntryState, RawEntry, ENTRY_COUNT, ENTRY_SIZE, ERASE_BLOCK_SIZE, FIRST_ENTRY, HEADER_SIZE,
    MTIME_FIELD_OFFSET, SIZE_FIELD_OFFSET,
};
use crate::error::{FsError, Result};
use crate::flash::Flash;
use crate::hash::fnv1a32;
use crate::window::DataWindow;

pub struct Mmrofs<F: Flash> {
    flash: F,
    partition_size: u32,
    /// Allocation hint: scanning for a FREE slot starts here.
    next_free: u32,
    window: DataWindow,
    clock: Box<dyn WallClock>,
}

impl<F: Flash> std::fmt::Debug for Mmrofs<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmrofs")
            .field("partition_size", &self.partition_size)
            .field("next_free", &self.next_free)
            .finish()
    }
}

/// One live file as yielded by a directory scan.
#[derive(Debug, Clone)]
pub struct LiveFile {
    pub index: u32,
    pub entry: RawEntry,
    pub name: Vec<u8>,
}

/// Per-state slot counts over the whole entry table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub free: u32,
    pub incomplete: u32,
    pub active: u32,
    pub valid: u32,
    pub tombstone: u32,
    pub bad_block: u32,
    pub erased: u32,
    pub unknown: u32,
}

impl ScanStats {
    pub fn live(&self) -> u32 {
        self.active + self.valid
    }
}

impl<F: Flash> Mmrofs<F> {
    /// Bind a partition and bring it to a consistent state. Runs the clock
    /// bootstrap and the recovery scan; returns only once every entry is in
    /// a terminal or live state.
    pub fn mount(flash: F, clock: Box<dyn WallClock>) -> Result<Self> {
        let partition_size = flash.size();
        if partition_size < HEADER_SIZE + ERASE_BLOCK_SIZE {
            return Err(FsError::PartitionTooSmall {
                size: partition_size,
            });
        }
        if partition_size % ERASE_BLOCK_SIZE != 0 {
            return Err(FsError::InvalidArgument("partition size not erase-block aligned"));
        }

        let mut fs = Self {
            flash,
            partition_size,
            next_free: FIRST_ENTRY,
            window: DataWindow::new(),
            clock,
        };
        fs.init_clock()?;
        fs.recover()?;
        info!(
            partition_size,
            entries = ENTRY_COUNT - FIRST_ENTRY,
            next_free = fs.next_free,
            "mounted"
        );
        Ok(fs)
    }

    /// Release the partition, e.g. to remount it.
    pub fn into_flash(self) -> F {
        self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn partition_size(&self) -> u32 {
        self.partition_size
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now()
    }

    pub(crate) fn clock(&self) -> &dyn WallClock {
        &*self.clock
    }

    pub(crate) fn set_next_free_hint(&mut self, idx: u32) {
        self.next_free = idx;
    }

    // ---- entry table I/O ------------------------------------------------

    fn entry_offset(index: u32) -> u32 {
        index * ENTRY_SIZE as u32
    }

    pub(crate) fn entry_raw(&self, index: u32) -> Result<[u8; ENTRY_SIZE]> {
        if index >= ENTRY_COUNT {
            return Err(FsError::Io("entry index out of range"));
        }
        let mut raw = [0u8; ENTRY_SIZE];
        self.flash.read(Self::entry_offset(index), &mut raw)?;
        Ok(raw)
    }

    /// Read one directory record. The header region is served directly from
    /// flash; it is never cached.
    pub fn entry(&self, index: u32) -> Result<RawEntry> {
        let raw = self.entry_raw(index)?;
        RawEntry::read_from(&raw[..]).ok_or(FsError::Io("entry decode failed"))
    }

    pub(crate) fn entry_program_state(&mut self, index: u32, state: EntryState) -> Result<()> {
        self.flash
            .program(Self::entry_offset(index), &[state as u8])
    }

    /// Program bytes 1..32 of a record. The state byte must already have
    /// been programmed to ALLOCATING.
    pub(crate) fn entry_program_body(&mut self, index: u32, entry: &RawEntry) -> Result<()> {
        self.flash
            .program(Self::entry_offset(index) + 1, &entry.as_bytes()[1..])
    }

    pub(crate) fn entry_program_size(&mut self, index: u32, size: u32) -> Result<()> {
        self.flash
            .program(Self::entry_offset(index) + SIZE_FIELD_OFFSET, &size.to_le_bytes())
    }

    pub(crate) fn entry_program_mtime(&mut self, index: u32, mtime: u32) -> Result<()> {
        self.flash
            .program(Self::entry_offset(index) + MTIME_FIELD_OFFSET, &mtime.to_le_bytes())
    }

    // ---- data region I/O ------------------------------------------------

    /// Read from the data region through the sliding window.
    pub fn data_read(&mut self, off: u32, buf: &mut [u8]) -> Result<()> {
        self.window.read(&self.flash, off, buf)
    }

    pub(crate) fn data_program(&mut self, off: u32, data: &[u8]) -> Result<()> {
        self.flash.program(off, data)?;
        self.window.invalidate(off, data.len() as u32);
        Ok(())
    }

    pub(crate) fn data_erase(&mut self, off: u32, len: u32) -> Result<()> {
        self.flash.erase(off, len)?;
        self.window.invalidate(off, len);
        Ok(())
    }

    /// Filename bytes of an entry's extent.
    pub fn read_name(&mut self, entry: &RawEntry) -> Result<Vec<u8>> {
        let mut name = vec![0u8; entry.name_len.get() as usize];
        self.data_read(entry.offset.get(), &mut name)?;
        Ok(name)
    }

    /// Payload bytes of an entry's extent, per its recorded size.
    pub fn read_payload(&mut self, entry: &RawEntry) -> Result<Vec<u8>> {
        let name_len = entry.name_len.get() as u32;
        let mut payload = vec![0u8; (entry.size.get() - name_len) as usize];
        self.data_read(entry.offset.get() + name_len, &mut payload)?;
        Ok(payload)
    }

    // ---- lookup and scans -----------------------------------------------

    /// Resolve a name to its live entry. Live entries that fail structural
    /// validation are tombstoned on sight.
    pub fn lookup(&mut self, name: &[u8]) -> Result<Option<(u32, RawEntry)>> {
        let hash = fnv1a32(name);
        for i in FIRST_ENTRY..ENTRY_COUNT {
            let e = self.entry(i)?;
            if !e.is_live() {
                continue;
            }
            if e.name_hash.get() != hash || e.name_len.get() as usize != name.len() {
                continue;
            }
            if !e.validate(self.partition_size) {
                self.entry_program_state(i, EntryState::Tombstone)?;
                continue;
            }
            if self.read_name(&e)? == name {
                return Ok(Some((i, e)));
            }
        }
        Ok(None)
    }

    /// Next live, structurally valid entry at or after `from`, in index
    /// order. Invalid entries are skipped, not repaired; lookup owns that.
    pub fn next_live_entry(&mut self, from: u32) -> Result<Option<LiveFile>> {
        for i in from.max(FIRST_ENTRY)..ENTRY_COUNT {
            let e = self.entry(i)?;
            if !e.is_live() || !e.validate(self.partition_size) {
                continue;
            }
            let name = self.read_name(&e)?;
            return Ok(Some(LiveFile {
                index: i,
                entry: e,
                name,
            }));
        }
        Ok(None)
    }

    /// Claim the first FREE slot at or after the allocation hint. A slot
    /// whose state byte reads FREE but whose body is not all-ones is marked
    /// ERASED and skipped.
    pub(crate) fn alloc_entry(&mut self) -> Result<u32> {
        for i in self.next_free.max(FIRST_ENTRY)..ENTRY_COUNT {
            let raw = self.entry_raw(i)?;
            if raw[0] != EntryState::Free as u8 {
                continue;
            }
            if raw.iter().any(|&b| b != 0xFF) {
                self.entry_program_state(i, EntryState::Erased)?;
                continue;
            }
            self.next_free = i + 1;
            return Ok(i);
        }
        Err(FsError::NoSpace)
    }

    /// Count every slot by state, for diagnostics.
    pub fn scan_stats(&self) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        for i in FIRST_ENTRY..ENTRY_COUNT {
            let raw = self.entry_raw(i)?;
            match EntryState::from_byte(raw[0]) {
                Some(EntryState::Free) => stats.free += 1,
                Some(EntryState::Allocating)
                | Some(EntryState::PendingData)
                | Some(EntryState::TombstoningOld) => stats.incomplete += 1,
                Some(EntryState::Active) => stats.active += 1,
                Some(EntryState::Valid) => stats.valid += 1,
                Some(EntryState::Tombstone) => stats.tombstone += 1,
                Some(EntryState::BadBlock) => stats.bad_block += 1,
                Some(EntryState::Erased) => stats.erased += 1,
                None => stats.unknown += 1,
            }
        }
        Ok(stats)
    }
}
