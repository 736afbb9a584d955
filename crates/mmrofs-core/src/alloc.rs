//! Data-region allocation.
//!
//! Extents are erase-block aligned and first-fit allocated. Entries in the
//! TOMBSTONING_OLD state count as occupying their extent so an in-progress
//! commit can never be clobbered by a concurrent-looking allocation after a
//! crash.

use crate::entry::{align_up_4k, state_is_live, EntryState, DATA_REGION_START, ENTRY_COUNT, FIRST_ENTRY};
use crate::error::{FsError, Result};
use crate::flash::Flash;
use crate::fs::Mmrofs;

impl<F: Flash> Mmrofs<F> {
    /// Every `(start, end)` interval occupied by an entry whose extent must
    /// be preserved, unsorted.
    fn occupied_extents(&self) -> Result<Vec<(u64, u64)>> {
        let mut ranges = Vec::new();
        for i in FIRST_ENTRY..ENTRY_COUNT {
            let e = self.entry(i)?;
            if !state_is_live(e.state) && e.state != EntryState::TombstoningOld as u8 {
                continue;
            }
            let offset = e.offset.get();
            if offset < DATA_REGION_START {
                continue;
            }
            ranges.push((offset as u64, offset as u64 + e.alloc_len()));
        }
        Ok(ranges)
    }

    /// First-fit: the lowest erase-block-aligned gap of `needed` bytes in
    /// the data region.
    pub(crate) fn find_free_extent(&mut self, needed: u64) -> Result<u32> {
        let alloc = align_up_4k(needed);
        let mut ranges = self.occupied_extents()?;
        ranges.sort_unstable_by_key(|r| r.0);

        let mut candidate = DATA_REGION_START as u64;
        for (start, end) in ranges {
            if candidate + alloc <= start {
                break;
            }
            if end > candidate {
                candidate = end;
            }
        }
        if candidate + alloc > self.partition_size() as u64 {
            return Err(FsError::NoSpace);
        }
        Ok(candidate as u32)
    }

    /// Whether the extent at `offset` can grow in place to hold
    /// `needed_total` bytes: the tail must not overlap any live extent and
    /// must actually read as all-ones on flash.
    pub(crate) fn space_after_free(
        &mut self,
        offset: u32,
        current_alloc: u64,
        needed_total: u64,
    ) -> Result<bool> {
        let new_alloc = align_up_4k(needed_total);
        if new_alloc <= current_alloc {
            return Ok(true);
        }

        let extra_start = offset as u64 + current_alloc;
        let extra_end = offset as u64 + new_alloc;
        if extra_end > self.partition_size() as u64 {
            return Ok(false);
        }

        // The grown entry's own interval ends exactly at `extra_start`, so
        // it never trips this test.
        for (start, end) in self.occupied_extents()? {
            if start < extra_end && end > extra_start {
                return Ok(false);
            }
        }

        let mut buf = [0u8; 64];
        let mut pos = extra_start;
        while pos < extra_end {
            let chunk = buf.len().min((extra_end - pos) as usize);
            self.data_read(pos as u32, &mut buf[..chunk])?;
            if buf[..chunk].iter().any(|&b| b != 0xFF) {
                return Ok(false);
            }
            pos += chunk as u64;
        }
        Ok(true)
    }
}
