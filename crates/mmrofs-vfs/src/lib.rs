//! # mmrofs-vfs
//!
//! File-descriptor layer over the MMROFS core: stream-style
//! open/read/write/close plus stat, lseek, unlink, rename and directory
//! scans, the way a host VFS brokers them.
//!
//! The whole surface serializes behind one lock (single-writer,
//! many-reader); cross-operation atomicity comes from the core's flash
//! state machine, not from anything here. A writer descriptor moves through
//! three states: *pending-new* (no entry yet), *pending-update* (a live
//! entry exists but is not yet superseded) and *committed* (a new live
//! entry is in place, finalized at close).

mod options;

use std::io::SeekFrom;
use std::sync::Mutex;

use bitflags::bitflags;
use tracing::debug;

use mmrofs_core::{is_capacity_mask, FileCommit, Flash, FsError, Mmrofs, Result, WallClock};

pub use mmrofs_core::{FsError as VfsError, SystemClock};
pub use options::MountOptions;

bitflags! {
    /// Open modes. `READ`-only resolves an existing file; any `WRITE` open
    /// supersedes the current version on first write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Create the file if it does not exist (write modes only).
        const CREATE = 1 << 2;
        /// Discard the previous content instead of appending after it.
        const TRUNCATE = 1 << 3;
    }
}

/// Index into the descriptor table.
pub type Fd = usize;
/// Index into the directory-handle table.
pub type DirHandle = usize;

/// What `stat`/`fstat` report. `mtime` is 0 while unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub size: u32,
    pub mtime: u32,
    pub ctime: u32,
}

/// One directory scan result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub index: u32,
}

#[derive(Debug, Clone, Copy)]
enum FdState {
    PendingNew,
    PendingUpdate {
        old_entry: u32,
        /// Payload bytes of the old version to retain, or `None` when the
        /// prior size is still capacity-masked and unknowable.
        keep: Option<u32>,
        old_ctime: u32,
    },
    Committed(FileCommit),
}

#[derive(Debug, Clone)]
struct FileDesc {
    name: Vec<u8>,
    flags: OpenFlags,
    cursor: u32,
    state: FdState,
}

struct Inner<F: Flash> {
    fs: Mmrofs<F>,
    fds: Vec<Option<FileDesc>>,
    dirs: Vec<Option<u32>>,
}

pub struct Vfs<F: Flash> {
    inner: Mutex<Inner<F>>,
}

/// Strip a single leading `/` and bounds-check the name. The namespace is
/// flat; further separators are just name bytes.
fn normalize_name(path: &str) -> Result<Vec<u8>> {
    let name = path.strip_prefix('/').unwrap_or(path).as_bytes();
    if name.is_empty() || name.len() > mmrofs_core::MAX_FILENAME_LEN {
        return Err(FsError::InvalidArgument("filename length out of range"));
    }
    Ok(name.to_vec())
}

impl<F: Flash> Vfs<F> {
    /// Mount with the system clock.
    pub fn mount(flash: F, options: MountOptions) -> Result<Self> {
        Self::mount_with_clock(flash, options, Box::new(SystemClock::new()))
    }

    pub fn mount_with_clock(
        flash: F,
        options: MountOptions,
        clock: Box<dyn WallClock>,
    ) -> Result<Self> {
        if options.max_files == 0 {
            return Err(FsError::InvalidArgument("max_files must be at least 1"));
        }
        let fs = Mmrofs::mount(flash, clock)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                fs,
                fds: vec![None; options.max_files],
                dirs: vec![None; options.max_dirs],
            }),
        })
    }

    /// Tear down the descriptor layer and hand the partition back.
    pub fn into_flash(self) -> F {
        self.inner
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .fs
            .into_flash()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<F>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<Fd> {
        let name = normalize_name(path)?;
        if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE) {
            return Err(FsError::InvalidArgument("no access mode requested"));
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        let existing = inner.fs.lookup(&name)?;

        let slot = inner
            .fds
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyOpen)?;

        let state = if !flags.contains(OpenFlags::WRITE) {
            let (index, e) = existing.ok_or(FsError::NotFound)?;
            FdState::Committed(FileCommit {
                entry: index,
                offset: e.offset.get(),
                data_size: e.size.get() - e.name_len.get() as u32,
            })
        } else if let Some((index, e)) = existing {
            let keep = if flags.contains(OpenFlags::TRUNCATE) {
                Some(0)
            } else if !is_capacity_mask(e.size.get()) {
                Some(e.size.get() - e.name_len.get() as u32)
            } else {
                None
            };
            FdState::PendingUpdate {
                old_entry: index,
                keep,
                old_ctime: e.ctime.get(),
            }
        } else if flags.contains(OpenFlags::CREATE) {
            FdState::PendingNew
        } else {
            return Err(FsError::NotFound);
        };

        debug!(path, ?flags, fd = slot, "opened");
        inner.fds[slot] = Some(FileDesc {
            name,
            flags,
            cursor: 0,
            state,
        });
        Ok(slot)
    }

    /// Serve bytes from the committed extent at the read cursor. Pending
    /// writer descriptors have nothing to read yet and return 0.
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let desc = inner
            .fds
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadFd)?;

        let FdState::Committed(c) = desc.state else {
            return Ok(0);
        };
        if desc.cursor >= c.data_size {
            return Ok(0);
        }

        let n = buf.len().min((c.data_size - desc.cursor) as usize);
        let pos = c.offset + desc.name.len() as u32 + desc.cursor;
        inner.fs.data_read(pos, &mut buf[..n])?;
        desc.cursor += n as u32;
        Ok(n)
    }

    /// Append `data`. The first write on a writer runs the create or update
    /// flow; later writes program past the current tail, growing the file
    /// through a new entry when the allocation runs out. Partial writes do
    /// not happen: the full range is programmed or the call fails.
    pub fn write(&self, fd: Fd, data: &[u8]) -> Result<usize> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let desc = inner
            .fds
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadFd)?;
        if !desc.flags.contains(OpenFlags::WRITE) {
            return Err(FsError::BadFd);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let commit = match desc.state {
            FdState::PendingNew => inner.fs.create_file(&desc.name, data)?,
            FdState::PendingUpdate {
                old_entry,
                keep,
                old_ctime,
            } => {
                let keep = keep.ok_or(FsError::Io("prior size not finalized"))?;
                inner
                    .fs
                    .update_file(old_entry, &desc.name, keep, old_ctime, data)?
            }
            FdState::Committed(c) => inner.fs.extend_file(&c, &desc.name, data)?,
        };
        desc.state = FdState::Committed(commit);
        Ok(data.len())
    }

    /// Finalize a committed writer (mtime, exact size, VALID). A writer
    /// that never wrote created no entry, so there is nothing to do.
    pub fn close(&self, fd: Fd) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let desc = inner
            .fds
            .get_mut(fd)
            .ok_or(FsError::BadFd)?
            .take()
            .ok_or(FsError::BadFd)?;

        if desc.flags.contains(OpenFlags::WRITE) {
            if let FdState::Committed(c) = desc.state {
                inner.fs.finalize(c.entry, desc.name.len(), c.data_size)?;
            }
        }
        debug!(fd, "closed");
        Ok(())
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let name = normalize_name(path)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let (_, e) = inner.fs.lookup(&name)?.ok_or(FsError::NotFound)?;
        Ok(entry_stat(&e))
    }

    pub fn fstat(&self, fd: Fd) -> Result<Stat> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let desc = inner
            .fds
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadFd)?;
        match desc.state {
            FdState::Committed(c) => {
                let e = inner.fs.entry(c.entry)?;
                Ok(entry_stat(&e))
            }
            _ => Ok(Stat {
                size: 0,
                mtime: 0,
                ctime: 0,
            }),
        }
    }

    /// Move the read cursor. Writes are append-only, so a write-only
    /// descriptor has no cursor to move.
    pub fn lseek(&self, fd: Fd, pos: SeekFrom) -> Result<u32> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let desc = inner
            .fds
            .get_mut(fd)
            .and_then(Option::as_mut)
            .ok_or(FsError::BadFd)?;
        if !desc.flags.contains(OpenFlags::READ) {
            return Err(FsError::NotSeekable);
        }

        let size = match desc.state {
            FdState::Committed(c) => c.data_size,
            _ => 0,
        };
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => desc.cursor as i64 + d,
            SeekFrom::End(d) => size as i64 + d,
        };
        if target < 0 || target > size as i64 {
            return Err(FsError::InvalidArgument("seek out of range"));
        }
        desc.cursor = target as u32;
        Ok(desc.cursor)
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let name = normalize_name(path)?;
        self.lock().fs.remove_file(&name)
    }

    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let src = normalize_name(src)?;
        let dst = normalize_name(dst)?;
        self.lock().fs.rename_file(&src, &dst)
    }

    pub fn opendir(&self) -> Result<DirHandle> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let slot = inner
            .dirs
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyOpen)?;
        inner.dirs[slot] = Some(0);
        Ok(slot)
    }

    /// Next live, structurally valid file in index order, or `None` at the
    /// end of the table.
    pub fn readdir(&self, dir: DirHandle) -> Result<Option<DirEntry>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let cursor = *inner
            .dirs
            .get(dir)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadFd)?;

        match inner.fs.next_live_entry(cursor)? {
            Some(f) => {
                inner.dirs[dir] = Some(f.index + 1);
                Ok(Some(DirEntry {
                    name: String::from_utf8_lossy(&f.name).into_owned(),
                    index: f.index,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn closedir(&self, dir: DirHandle) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner
            .dirs
            .get_mut(dir)
            .ok_or(FsError::BadFd)?
            .take()
            .ok_or(FsError::BadFd)?;
        Ok(())
    }
}

fn entry_stat(e: &mmrofs_core::RawEntry) -> Stat {
    Stat {
        size: e.size.get() - e.name_len.get() as u32,
        mtime: if e.mtime.get() == mmrofs_core::MTIME_UNSET {
            0
        } else {
            e.mtime.get()
        },
        ctime: e.ctime.get(),
    }
}
