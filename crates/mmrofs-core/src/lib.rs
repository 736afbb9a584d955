//! # mmrofs-core
//!
//! Crash-safe, write-rare filesystem core for raw NOR flash.
//!
//! A partition is split into a 64 KiB header region (a dense table of packed
//! 32-byte entry records) and an erase-block-aligned data region of file
//! extents. Files are created, updated, renamed and deleted through a
//! transactional engine in which every step is a single flash program that
//! either leaves the previous version visible or commits the new one; the
//! recovery scanner at mount drives any interrupted operation to exactly
//! one of those outcomes.
//!
//! The physical constraints of NOR flash shape everything here: bits only
//! program 1→0, erase is destructive and 4 KiB-coarse, and a power cut can
//! land between any two flash operations.
//!
//! ## Example
//!
//! ```
//! use mmrofs_core::{Mmrofs, RamFlash, SystemClock};
//!
//! let flash = RamFlash::new(0x2_0000);
//! let mut fs = Mmrofs::mount(flash, Box::new(SystemClock::new())).unwrap();
//!
//! let c = fs.create_file(b"greeting", b"hello").unwrap();
//! fs.finalize(c.entry, b"greeting".len(), c.data_size).unwrap();
//!
//! let (_, entry) = fs.lookup(b"greeting").unwrap().unwrap();
//! assert_eq!(fs.read_payload(&entry).unwrap(), b"hello");
//! ```

mod alloc;
mod clock;
mod engine;
mod entry;
mod error;
mod flash;
mod fs;
mod hash;
mod image;
mod recover;
mod window;

pub use clock::{FixedClock, SystemClock, WallClock, CLOCK_SENTINEL};
pub use engine::FileCommit;
pub use entry::{
    align_up_4k, is_capacity_mask, state_is_live, EntryState, RawEntry, CAPACITY_MASK_BITS,
    DATA_REGION_START, ENTRY_COUNT, ENTRY_NONE, ENTRY_SIZE, ERASE_BLOCK_SIZE, FIRST_ENTRY,
    HEADER_SIZE, MAX_FILENAME_LEN, MTIME_UNSET,
};
pub use error::{FsError, Result};
pub use flash::{Flash, RamFlash};
pub use fs::{LiveFile, Mmrofs, ScanStats};
pub use image::FileFlash;
pub use hash::fnv1a32;
