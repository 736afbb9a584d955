//! File-backed partition images.
//!
//! The host analogue of a memory-mapped flash partition: the image file is
//! mapped read-write and reads come straight from the mapping. Programs
//! enforce the same 1→0 rule as real NOR so that an image exercised on the
//! host behaves byte-for-byte like the device.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::info;

use crate::entry::{ERASE_BLOCK_SIZE, HEADER_SIZE};
use crate::error::{FsError, Result};
use crate::flash::{check_erase_args, check_range, Flash};

pub struct FileFlash {
    mmap: MmapMut,
    len: u32,
    path: PathBuf,
}

impl FileFlash {
    /// Create (or recreate) an image file of `size` bytes, fully erased.
    pub fn create<P: AsRef<Path>>(path: P, size: u32) -> Result<Self> {
        if size % ERASE_BLOCK_SIZE != 0 {
            return Err(FsError::InvalidArgument("image size not erase-block aligned"));
        }
        if size < HEADER_SIZE + ERASE_BLOCK_SIZE {
            return Err(FsError::PartitionTooSmall { size });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size as u64)?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap.fill(0xFF);
        mmap.flush()?;
        info!(path = %path.as_ref().display(), size, "created partition image");

        Ok(Self {
            mmap,
            len: size,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing image file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len > u32::MAX as u64 || len % ERASE_BLOCK_SIZE as u64 != 0 {
            return Err(FsError::InvalidArgument("image size not erase-block aligned"));
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap,
            len: len as u32,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Flash for FileFlash {
    fn size(&self) -> u32 {
        self.len
    }

    fn read(&self, off: u32, buf: &mut [u8]) -> Result<()> {
        check_range(self.len, off, buf.len())?;
        let off = off as usize;
        buf.copy_from_slice(&self.mmap[off..off + buf.len()]);
        Ok(())
    }

    fn program(&mut self, off: u32, data: &[u8]) -> Result<()> {
        check_range(self.len, off, data.len())?;
        let base = off as usize;
        for (i, &b) in data.iter().enumerate() {
            let cur = self.mmap[base + i];
            if b & !cur != 0 {
                return Err(FsError::Io("program would set erased bits"));
            }
            self.mmap[base + i] = b;
        }
        self.mmap.flush_range(base, data.len())?;
        Ok(())
    }

    fn erase(&mut self, off: u32, len: u32) -> Result<()> {
        check_erase_args(self.len, off, len)?;
        let off = off as usize;
        self.mmap[off..off + len as usize].fill(0xFF);
        self.mmap.flush_range(off, len as usize)?;
        Ok(())
    }
}
