//! Sliding read window over the data region.
//!
//! Data-region reads are served from a single 64 KiB window, rebound on
//! demand; a read crossing a window boundary is split across two bindings.
//! Unlike the header mapping, the window caches flash content, so any
//! program or erase touching its range must invalidate it.

use crate::error::Result;
use crate::flash::Flash;

/// Window coverage. Matches the header size; both regions page in 64 KiB.
pub(crate) const WINDOW_SIZE: u32 = 0x1_0000;

pub(crate) struct DataWindow {
    buf: Vec<u8>,
    base: u32,
    filled: usize,
    valid: bool,
}

impl DataWindow {
    pub fn new() -> Self {
        Self {
            buf: vec![0xFF; WINDOW_SIZE as usize],
            base: 0,
            filled: 0,
            valid: false,
        }
    }

    /// Bind the window containing `off`, reloading from flash if needed.
    fn bind<F: Flash>(&mut self, flash: &F, off: u32) -> Result<()> {
        let base = off & !(WINDOW_SIZE - 1);
        if self.valid && self.base == base {
            return Ok(());
        }
        self.valid = false;
        let avail = (flash.size() - base).min(WINDOW_SIZE) as usize;
        flash.read(base, &mut self.buf[..avail])?;
        self.base = base;
        self.filled = avail;
        self.valid = true;
        Ok(())
    }

    pub fn read<F: Flash>(&mut self, flash: &F, mut off: u32, out: &mut [u8]) -> Result<()> {
        if off as u64 + out.len() as u64 > flash.size() as u64 {
            return Err(crate::error::FsError::Io("read beyond end of partition"));
        }
        let mut out = out;
        while !out.is_empty() {
            self.bind(flash, off)?;
            let in_window = (off - self.base) as usize;
            let n = out.len().min(self.filled - in_window);
            out[..n].copy_from_slice(&self.buf[in_window..in_window + n]);
            out = &mut out[n..];
            off += n as u32;
        }
        Ok(())
    }

    /// Drop the window if `[off, off + len)` overlaps its coverage.
    pub fn invalidate(&mut self, off: u32, len: u32) {
        if !self.valid {
            return;
        }
        let end = off as u64 + len as u64;
        let window_end = self.base as u64 + self.filled as u64;
        if (off as u64) < window_end && end > self.base as u64 {
            self.valid = false;
        }
    }
}
