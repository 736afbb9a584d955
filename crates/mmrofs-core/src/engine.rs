//! Transactional update engine.
//!
//! Every operation is a fixed sequence of flash programs in which each step
//! either leaves the previous file version visible or makes the new one
//! visible; the single program of the TOMBSTONING_OLD state byte is the
//! commit point. A power cut at any step leaves a state the recovery
//! scanner drives to exactly one of those two outcomes.

use tracing::debug;

use crate::entry::{
    align_up_4k, is_capacity_mask, EntryState, RawEntry, ENTRY_COUNT, ENTRY_NONE,
    MAX_FILENAME_LEN, MTIME_UNSET,
};
use crate::error::{FsError, Result};
use crate::flash::Flash;
use crate::fs::Mmrofs;
use crate::hash::fnv1a32;

/// Extent copies run through this much stack at a time.
const COPY_CHUNK: usize = 256;

/// A committed (ACTIVE) file version, as tracked by an open writer.
#[derive(Debug, Clone, Copy)]
pub struct FileCommit {
    /// Entry index of the version.
    pub entry: u32,
    /// Extent offset.
    pub offset: u32,
    /// Payload bytes present so far.
    pub data_size: u32,
}

impl<F: Flash> Mmrofs<F> {
    /// Claim a FREE slot and walk it to PENDING_DATA with the given body.
    fn create_entry_slot(&mut self, entry: &RawEntry) -> Result<u32> {
        let slot = self.alloc_entry()?;
        self.entry_program_state(slot, EntryState::Allocating)?;
        if let Err(e) = self.entry_program_body(slot, entry) {
            let _ = self.entry_program_state(slot, EntryState::Tombstone);
            return Err(e);
        }
        if let Err(e) = self.entry_program_state(slot, EntryState::PendingData) {
            let _ = self.entry_program_state(slot, EntryState::Tombstone);
            return Err(e);
        }
        Ok(slot)
    }

    /// The commit sequence: make `new_slot` the owner of its name and
    /// retire the versions it supersedes.
    pub(crate) fn tombstone_old_flow(
        &mut self,
        new_slot: u32,
        old_slot: u32,
        dst_slot: u32,
    ) -> Result<()> {
        self.entry_program_state(new_slot, EntryState::TombstoningOld)?;
        self.entry_program_state(old_slot, EntryState::Tombstone)?;
        if dst_slot != ENTRY_NONE && dst_slot < ENTRY_COUNT {
            self.entry_program_state(dst_slot, EntryState::Tombstone)?;
        }
        self.entry_program_state(new_slot, EntryState::Active)
    }

    fn check_name(name: &[u8]) -> Result<()> {
        if name.is_empty() || name.len() > MAX_FILENAME_LEN {
            return Err(FsError::InvalidArgument("filename length out of range"));
        }
        Ok(())
    }

    /// Provisional capacity for a building file and the extent allocation
    /// carrying it. The capacity must be >= the eventual exact size with
    /// all low bits set, or finalization could not program it in place.
    fn provisional_capacity(total: u64) -> Result<(u32, u64)> {
        let capacity = total | crate::entry::CAPACITY_MASK_BITS as u64;
        if capacity >= u32::MAX as u64 {
            return Err(FsError::NoSpace);
        }
        Ok((capacity as u32, align_up_4k(capacity + 1)))
    }

    /// First write of a brand-new file. Leaves the entry ACTIVE with a
    /// capacity-masked size; `finalize` commits the exact size and mtime.
    pub fn create_file(&mut self, name: &[u8], data: &[u8]) -> Result<FileCommit> {
        Self::check_name(name)?;
        let total = name.len() as u64 + data.len() as u64;
        let (capacity, alloc) = Self::provisional_capacity(total)?;

        let offset = self.find_free_extent(alloc)?;
        self.data_erase(offset, alloc as u32)?;

        let entry = RawEntry::new(
            name.len() as u16,
            fnv1a32(name),
            offset,
            capacity,
            MTIME_UNSET,
            self.now(),
            ENTRY_NONE,
            ENTRY_NONE,
        );
        let slot = self.create_entry_slot(&entry)?;

        if let Err(e) = self
            .data_program(offset, name)
            .and_then(|_| self.data_program(offset + name.len() as u32, data))
        {
            let _ = self.entry_program_state(slot, EntryState::Tombstone);
            return Err(e);
        }
        self.entry_program_state(slot, EntryState::Active)?;

        debug!(name = %String::from_utf8_lossy(name), slot, offset, "created file");
        Ok(FileCommit {
            entry: slot,
            offset,
            data_size: data.len() as u32,
        })
    }

    /// First write of an update to an existing file: retain the first
    /// `keep` payload bytes of the old version and append `data` after
    /// them. Retaining the full payload can go in place if the flash
    /// behind the extent allows it; anything shorter must relocate, since
    /// the replaced bytes cannot be reprogrammed under the 1→0 rule. The
    /// superseded version is retired by the tombstone-old flow.
    pub fn update_file(
        &mut self,
        old_index: u32,
        name: &[u8],
        keep: u32,
        old_ctime: u32,
        data: &[u8],
    ) -> Result<FileCommit> {
        Self::check_name(name)?;
        let old = self.entry(old_index)?;
        if is_capacity_mask(old.size.get()) {
            return Err(FsError::Io("prior size not finalized"));
        }
        let old_payload = old.size.get() - old.name_len.get() as u32;
        if keep > old_payload {
            return Err(FsError::InvalidArgument("retained size exceeds prior payload"));
        }
        let old_data_size = keep;
        let name_len = name.len() as u32;
        let new_total = name_len as u64 + old_data_size as u64 + data.len() as u64;
        let old_alloc = old.alloc_len();

        let (capacity, new_alloc) = Self::provisional_capacity(new_total)?;

        if keep == old_payload
            && self
                .space_after_free(old.offset.get(), old_alloc, capacity as u64 + 1)?
        {
            // Append in place: the filename and prior payload stay put.
            let offset = old.offset.get();
            if new_alloc > old_alloc {
                self.data_erase(offset + old_alloc as u32, (new_alloc - old_alloc) as u32)?;
            }

            let entry = RawEntry::new(
                name_len as u16,
                fnv1a32(name),
                offset,
                capacity,
                MTIME_UNSET,
                old_ctime,
                old_index,
                ENTRY_NONE,
            );
            let slot = self.create_entry_slot(&entry)?;
            self.data_program(offset + name_len + old_data_size, data)?;
            self.tombstone_old_flow(slot, old_index, ENTRY_NONE)?;

            debug!(
                name = %String::from_utf8_lossy(name),
                slot, offset, "updated file in place"
            );
            Ok(FileCommit {
                entry: slot,
                offset,
                data_size: old_data_size + data.len() as u32,
            })
        } else {
            // Relocate: fresh extent, copy name + prior payload, append.
            let offset = self.find_free_extent(new_alloc)?;
            self.data_erase(offset, new_alloc as u32)?;

            let entry = RawEntry::new(
                name_len as u16,
                fnv1a32(name),
                offset,
                capacity,
                MTIME_UNSET,
                old_ctime,
                old_index,
                ENTRY_NONE,
            );
            let slot = self.create_entry_slot(&entry)?;
            self.data_program(offset, name)?;
            self.copy_extent(
                old.offset.get() + old.name_len.get() as u32,
                offset + name_len,
                old_data_size,
            )?;
            self.data_program(offset + name_len + old_data_size, data)?;
            self.tombstone_old_flow(slot, old_index, ENTRY_NONE)?;

            debug!(
                name = %String::from_utf8_lossy(name),
                slot, offset, "updated file via relocation"
            );
            Ok(FileCommit {
                entry: slot,
                offset,
                data_size: old_data_size + data.len() as u32,
            })
        }
    }

    /// Subsequent write on an open writer. Within the current allocation
    /// this is a plain tail program; past it, the file grows through a new
    /// entry with a widened capacity mask.
    pub fn extend_file(
        &mut self,
        cur: &FileCommit,
        name: &[u8],
        data: &[u8],
    ) -> Result<FileCommit> {
        let e = self.entry(cur.entry)?;
        let name_len = name.len() as u32;
        let new_data_size = cur.data_size + data.len() as u32;
        let new_total = name_len as u64 + new_data_size as u64;
        let cur_alloc = e.alloc_len();

        if new_total <= cur_alloc {
            self.data_program(cur.offset + name_len + cur.data_size, data)?;
            return Ok(FileCommit {
                entry: cur.entry,
                offset: cur.offset,
                data_size: new_data_size,
            });
        }

        let (capacity, grow_alloc) = Self::provisional_capacity(new_total)?;

        if self.space_after_free(cur.offset, cur_alloc, capacity as u64 + 1)? {
            self.data_erase(cur.offset + cur_alloc as u32, (grow_alloc - cur_alloc) as u32)?;
            let entry = RawEntry::new(
                name_len as u16,
                fnv1a32(name),
                cur.offset,
                capacity,
                MTIME_UNSET,
                e.ctime.get(),
                cur.entry,
                ENTRY_NONE,
            );
            let slot = self.create_entry_slot(&entry)?;
            self.data_program(cur.offset + name_len + cur.data_size, data)?;
            self.tombstone_old_flow(slot, cur.entry, ENTRY_NONE)?;

            debug!(slot, offset = cur.offset, "grew file in place");
            Ok(FileCommit {
                entry: slot,
                offset: cur.offset,
                data_size: new_data_size,
            })
        } else {
            let offset = self.find_free_extent(grow_alloc)?;
            self.data_erase(offset, grow_alloc as u32)?;
            let entry = RawEntry::new(
                name_len as u16,
                fnv1a32(name),
                offset,
                capacity,
                MTIME_UNSET,
                e.ctime.get(),
                cur.entry,
                ENTRY_NONE,
            );
            let slot = self.create_entry_slot(&entry)?;
            self.data_program(offset, name)?;
            self.copy_extent(cur.offset + name_len, offset + name_len, cur.data_size)?;
            self.data_program(offset + name_len + cur.data_size, data)?;
            self.tombstone_old_flow(slot, cur.entry, ENTRY_NONE)?;

            debug!(slot, offset, "grew file via relocation");
            Ok(FileCommit {
                entry: slot,
                offset,
                data_size: new_data_size,
            })
        }
    }

    /// Close-time commit: program mtime, the exact size, and VALID.
    pub fn finalize(&mut self, entry: u32, name_len: usize, data_size: u32) -> Result<()> {
        let now = self.now();
        self.entry_program_mtime(entry, now)?;
        self.entry_program_size(entry, name_len as u32 + data_size)?;
        self.entry_program_state(entry, EntryState::Valid)
    }

    /// Delete: one 1→0 state program, inherently atomic.
    pub fn remove_file(&mut self, name: &[u8]) -> Result<()> {
        Self::check_name(name)?;
        let (index, _) = self.lookup(name)?.ok_or(FsError::NotFound)?;
        self.entry_program_state(index, EntryState::Tombstone)?;
        debug!(name = %String::from_utf8_lossy(name), index, "unlinked file");
        Ok(())
    }

    /// Rename `src` to `dst`, displacing any live `dst`. The new version
    /// carries the source's ctime and an exact (never masked) size.
    pub fn rename_file(&mut self, src: &[u8], dst: &[u8]) -> Result<()> {
        Self::check_name(src)?;
        Self::check_name(dst)?;

        let (src_index, src_entry) = self.lookup(src)?.ok_or(FsError::NotFound)?;
        if is_capacity_mask(src_entry.size.get()) {
            return Err(FsError::Io("source size not finalized"));
        }
        let dst_index = self.lookup(dst)?.map(|(i, _)| i).unwrap_or(ENTRY_NONE);

        let src_data_size = src_entry.size.get() - src_entry.name_len.get() as u32;
        let new_total = dst.len() as u64 + src_data_size as u64;
        let alloc = align_up_4k(new_total);

        let offset = self.find_free_extent(alloc)?;
        self.data_erase(offset, alloc as u32)?;

        let entry = RawEntry::new(
            dst.len() as u16,
            fnv1a32(dst),
            offset,
            new_total as u32,
            MTIME_UNSET,
            src_entry.ctime.get(),
            src_index,
            dst_index,
        );
        let slot = self.create_entry_slot(&entry)?;
        self.data_program(offset, dst)?;
        self.copy_extent(
            src_entry.offset.get() + src_entry.name_len.get() as u32,
            offset + dst.len() as u32,
            src_data_size,
        )?;

        self.tombstone_old_flow(slot, src_index, dst_index)?;
        let now = self.now();
        self.entry_program_mtime(slot, now)?;
        self.entry_program_state(slot, EntryState::Valid)?;

        debug!(
            src = %String::from_utf8_lossy(src),
            dst = %String::from_utf8_lossy(dst),
            slot,
            "renamed file"
        );
        Ok(())
    }

    fn copy_extent(&mut self, mut src: u32, mut dst: u32, len: u32) -> Result<()> {
        let mut buf = [0u8; COPY_CHUNK];
        let mut remaining = len as usize;
        while remaining > 0 {
            let chunk = remaining.min(COPY_CHUNK);
            self.data_read(src, &mut buf[..chunk])?;
            self.data_program(dst, &buf[..chunk])?;
            src += chunk as u32;
            dst += chunk as u32;
            remaining -= chunk;
        }
        Ok(())
    }
}
