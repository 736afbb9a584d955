//! Boot-time recovery.
//!
//! Runs once at mount, before any descriptor exists. Every entry is driven
//! to a terminal or live state: uncommitted versions are tombstoned,
//! interrupted commits are completed, capacity-masked and torn sizes are
//! reconstructed from the extent, and unfinalized entries are promoted to
//! VALID. Each fix is itself a legal 1→0 program, so recovery interrupted
//! by another power cut simply resumes on the next boot.

use tracing::{info, warn};
use zerocopy::FromBytes;

use crate::clock::CLOCK_SENTINEL;
use crate::entry::{
    is_capacity_mask, state_is_live, EntryState, RawEntry, ENTRY_COUNT, ENTRY_NONE, FIRST_ENTRY,
    MTIME_UNSET,
};
use crate::error::{FsError, Result};
use crate::flash::Flash;
use crate::fs::Mmrofs;

/// Backward extent scans run through this much stack at a time.
const SCAN_CHUNK: usize = 64;

impl<F: Flash> Mmrofs<F> {
    pub(crate) fn recover(&mut self) -> Result<()> {
        let mut first_free = ENTRY_COUNT;

        for i in FIRST_ENTRY..ENTRY_COUNT {
            let raw = self.entry_raw(i)?;
            let entry =
                RawEntry::read_from(&raw[..]).ok_or(FsError::Io("entry decode failed"))?;

            match EntryState::from_byte(raw[0]) {
                Some(EntryState::Free) => {
                    if raw.iter().any(|&b| b != 0xFF) {
                        self.entry_program_state(i, EntryState::Erased)?;
                    } else if i < first_free {
                        first_free = i;
                    }
                }

                Some(EntryState::Allocating) | Some(EntryState::PendingData) => {
                    warn!(index = i, state = raw[0], "tombstoning uncommitted entry");
                    self.entry_program_state(i, EntryState::Tombstone)?;
                }

                Some(EntryState::TombstoningOld) => {
                    if !entry.validate(self.partition_size()) {
                        self.entry_program_state(i, EntryState::Tombstone)?;
                        continue;
                    }
                    info!(index = i, "completing interrupted commit");
                    self.tombstone_if_live(entry.old_entry.get())?;
                    self.tombstone_if_live(entry.dst_entry.get())?;
                    self.entry_program_state(i, EntryState::Active)?;
                    let entry = self.entry(i)?;
                    self.recover_active(i, entry)?;
                }

                Some(EntryState::Active) => {
                    self.recover_active(i, entry)?;
                }

                Some(EntryState::Valid) => {
                    if !entry.validate(self.partition_size()) {
                        warn!(index = i, "tombstoning structurally invalid entry");
                        self.entry_program_state(i, EntryState::Tombstone)?;
                    }
                }

                Some(EntryState::Tombstone)
                | Some(EntryState::BadBlock)
                | Some(EntryState::Erased) => {}

                None => {
                    warn!(index = i, state = raw[0], "unknown state byte, marking erased");
                    self.entry_program_state(i, EntryState::Erased)?;
                }
            }
        }

        self.set_next_free_hint(first_free);
        Ok(())
    }

    fn tombstone_if_live(&mut self, index: u32) -> Result<()> {
        if index == ENTRY_NONE || index >= ENTRY_COUNT {
            return Ok(());
        }
        let raw = self.entry_raw(index)?;
        if state_is_live(raw[0]) {
            self.entry_program_state(index, EntryState::Tombstone)?;
        }
        Ok(())
    }

    /// An entry that became visible but was never finalized. Reconstruct
    /// the exact size from the extent, then commit or repair the mtime.
    fn recover_active(&mut self, index: u32, mut entry: RawEntry) -> Result<()> {
        if !entry.validate(self.partition_size()) {
            self.entry_program_state(index, EntryState::Tombstone)?;
            return Ok(());
        }

        let inferred = self.infer_extent_size(&entry)?;
        let size = entry.size.get();
        if is_capacity_mask(size) {
            if inferred != size {
                self.entry_program_size(index, inferred)?;
                entry.size.set(inferred);
            }
        } else if inferred < size && size - inferred > 2 {
            // An exact size should match the extent almost exactly; a long
            // all-ones tail below it means the size program was torn.
            warn!(index, recorded = size, inferred, "torn size, rewriting");
            self.entry_program_size(index, inferred)?;
            entry.size.set(inferred);
        }

        if entry.mtime.get() == MTIME_UNSET {
            // Never programmed, so an in-place program is safe.
            let now = self.now();
            self.entry_program_mtime(index, now)?;
            self.entry_program_state(index, EntryState::Valid)?;
            info!(index, "promoted entry to valid");
            return Ok(());
        }

        // A programmed mtime may itself be torn and cannot be patched under
        // the 1→0 rule; the only safe repair is a fresh entry for the same
        // extent with a trusted mtime.
        match self.alloc_entry() {
            Ok(slot) => {
                let now = self.now();
                let replacement = RawEntry::new(
                    entry.name_len.get(),
                    entry.name_hash.get(),
                    entry.offset.get(),
                    entry.size.get(),
                    now,
                    entry.ctime.get(),
                    index,
                    ENTRY_NONE,
                );
                self.entry_program_state(slot, EntryState::Allocating)?;
                self.entry_program_body(slot, &replacement)?;
                self.entry_program_state(slot, EntryState::PendingData)?;
                self.tombstone_old_flow(slot, index, ENTRY_NONE)?;
                // The mtime was written this boot; trust it.
                self.entry_program_state(slot, EntryState::Valid)?;
                info!(index, slot, "re-allocated entry over possibly torn mtime");
            }
            Err(FsError::NoSpace) => {
                warn!(index, "no free slot to repair torn mtime, leaving active");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Scan the extent backward for the last programmed byte; the exact
    /// size is everything up to and including it, and never less than the
    /// filename.
    fn infer_extent_size(&mut self, entry: &RawEntry) -> Result<u32> {
        let offset = entry.offset.get() as u64;
        let floor = offset + entry.name_len.get() as u64;
        let mut pos = offset + entry.alloc_len();
        let mut buf = [0u8; SCAN_CHUNK];

        while pos > floor {
            let chunk_start = pos.saturating_sub(SCAN_CHUNK as u64).max(floor);
            let chunk = (pos - chunk_start) as usize;
            self.data_read(chunk_start as u32, &mut buf[..chunk])?;
            if let Some(j) = buf[..chunk].iter().rposition(|&b| b != 0xFF) {
                return Ok((chunk_start + j as u64 - offset) as u32 + 1);
            }
            pos = chunk_start;
        }
        Ok(entry.name_len.get() as u32)
    }

    /// Clock bootstrap: a host that boots without walltime gets the newest
    /// timestamp stored in the tree, keeping ctime ≤ mtime ≤ now roughly
    /// monotonic across reboots of a clockless device.
    pub(crate) fn init_clock(&mut self) -> Result<()> {
        if self.now() >= CLOCK_SENTINEL {
            return Ok(());
        }

        let mut max_time = 0u32;
        for i in FIRST_ENTRY..ENTRY_COUNT {
            let e = self.entry(i)?;
            if !e.is_live() {
                continue;
            }
            let mtime = e.mtime.get();
            if mtime != MTIME_UNSET {
                max_time = max_time.max(mtime);
            }
            let ctime = e.ctime.get();
            if ctime != 0xFFFF_FFFF {
                max_time = max_time.max(ctime);
            }
        }

        if max_time > 0 {
            self.clock().set(max_time);
            info!(walltime = max_time, "clock initialized from stored timestamps");
        }
        Ok(())
    }
}
