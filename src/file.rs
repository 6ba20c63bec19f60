//! Convenience file handles over the engine surface.
//!
//! `BufferedFile` goes through the page cache and completes on the
//! sleepable ring. `DmaFile` opens with O_DIRECT, classifies its reads and
//! writes as pollable so they complete on the busy-poll ring, and enforces
//! the block alignment direct I/O requires. Both resolve their path once
//! at open; the owned string travels with each open/unlink command and is
//! freed when that command is released.

use crate::buffer::{AlignedBuf, IovecArray};
use crate::engine::future::{BufRingFuture, IoFuture};
use crate::engine::{Engine, Pollable};
use crate::error::{Error, Result};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Flags for opening a file, mapped onto the O_* constants at open time.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    create: bool,
    truncate: bool,
    append: bool,
    dsync: bool,
    sync: bool,
    excl: bool,
    noatime: bool,
    mode: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
            dsync: false,
            sync: false,
            excl: false,
            noatime: false,
            mode: 0o644,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Synchronize data (not metadata) on every write.
    pub fn dsync(mut self, dsync: bool) -> Self {
        self.dsync = dsync;
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn excl(mut self, excl: bool) -> Self {
        self.excl = excl;
        self
    }

    pub fn noatime(mut self, noatime: bool) -> Self {
        self.noatime = noatime;
        self
    }

    /// Permission bits applied when the open creates the file.
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn open_flags(&self, direct: bool) -> i32 {
        let mut flags = if self.read && self.write {
            libc::O_RDWR
        } else if self.write {
            libc::O_WRONLY
        } else {
            libc::O_RDONLY
        };
        flags |= libc::O_CLOEXEC;
        if self.create {
            flags |= libc::O_CREAT;
        }
        if self.truncate {
            flags |= libc::O_TRUNC;
        }
        if self.append {
            flags |= libc::O_APPEND;
        }
        if self.dsync {
            flags |= libc::O_DSYNC;
        }
        if self.sync {
            flags |= libc::O_SYNC;
        }
        if self.excl {
            flags |= libc::O_EXCL;
        }
        if self.noatime {
            flags |= libc::O_NOATIME;
        }
        if direct {
            flags |= libc::O_DIRECT;
        }
        flags
    }

    pub(crate) fn create_mode(&self) -> u32 {
        self.mode
    }
}

/// State shared by both file flavors.
struct FileInner {
    fd: RawFd,
    path: PathBuf,
    engine: Engine,
}

impl FileInner {
    fn open(engine: &Engine, path: &Path, opts: &OpenOptions, direct: bool) -> Result<FileInner> {
        let fd = engine
            .open_at(path, opts.open_flags(direct), opts.create_mode())?
            .wait()?;
        Ok(FileInner {
            fd,
            path: path.to_path_buf(),
            engine: engine.clone(),
        })
    }

    fn data_sync(&self) -> Result<IoFuture> {
        self.engine.data_sync(self.fd)
    }

    fn pre_allocate(&self, size: u64, offset: u64) -> Result<IoFuture> {
        self.engine.pre_allocate(self.fd, size, offset)
    }

    fn remove(&self) -> Result<IoFuture> {
        self.engine.unlink(&self.path)
    }

    fn close(self) -> Result<IoFuture> {
        self.engine.close_fd(self.fd)
    }

    fn read_vectored_at(&self, bufs: &mut [AlignedBuf], offset: u64) -> Result<IoFuture> {
        let iovecs = IovecArray::new(bufs)?;
        self.engine.read_vectored(self.fd, iovecs, to_offset(offset)?)
    }

    fn write_vectored_at(&self, bufs: &mut [AlignedBuf], offset: u64) -> Result<IoFuture> {
        let iovecs = IovecArray::new(bufs)?;
        self.engine
            .write_vectored(self.fd, iovecs, to_offset(offset)?)
    }
}

fn to_offset(offset: u64) -> Result<i64> {
    i64::try_from(offset)
        .map_err(|_| Error::InvalidArgument(format!("offset {} exceeds the file range", offset)))
}

fn checked_len(buf: &AlignedBuf, len: usize) -> Result<u32> {
    if len > buf.len() {
        return Err(Error::InvalidArgument(format!(
            "length {} exceeds the buffer capacity {}",
            len,
            buf.len()
        )));
    }
    Ok(len as u32)
}

/// A file doing ordinary page-cache I/O.
pub struct BufferedFile {
    inner: FileInner,
}

impl BufferedFile {
    /// Open (and possibly create) the file, blocking on the open.
    pub fn open(engine: &Engine, path: impl AsRef<Path>, opts: &OpenOptions) -> Result<BufferedFile> {
        Ok(BufferedFile {
            inner: FileInner::open(engine, path.as_ref(), opts, false)?,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Read up to `len` bytes at `offset` into the buffer. The buffer must
    /// outlive the returned future.
    pub fn read_at(&self, buf: &mut AlignedBuf, offset: u64, len: usize) -> Result<IoFuture> {
        let len = checked_len(buf, len)?;
        self.inner
            .engine
            .read(self.inner.fd, buf.addr(), to_offset(offset)?, len, Pollable::NonPollable)
    }

    /// Write `len` bytes from the buffer at `offset`.
    pub fn write_at(&self, buf: &AlignedBuf, offset: u64, len: usize) -> Result<IoFuture> {
        let len = checked_len(buf, len)?;
        self.inner
            .engine
            .write(self.inner.fd, buf.addr(), to_offset(offset)?, len, Pollable::NonPollable)
    }

    pub fn read_vectored_at(&self, bufs: &mut [AlignedBuf], offset: u64) -> Result<IoFuture> {
        self.inner.read_vectored_at(bufs, offset)
    }

    pub fn write_vectored_at(&self, bufs: &mut [AlignedBuf], offset: u64) -> Result<IoFuture> {
        self.inner.write_vectored_at(bufs, offset)
    }

    /// Read at `offset` into a kernel-selected buffer from the engine's
    /// buffer ring.
    pub fn read_buf_ring(&self, offset: u64) -> Result<BufRingFuture> {
        self.inner
            .engine
            .read_buf_ring(self.inner.fd, to_offset(offset)?, Pollable::NonPollable)
    }

    pub fn data_sync(&self) -> Result<IoFuture> {
        self.inner.data_sync()
    }

    pub fn pre_allocate(&self, size: u64, offset: u64) -> Result<IoFuture> {
        self.inner.pre_allocate(size, offset)
    }

    /// Unlink the file's name; the handle stays usable until closed.
    pub fn remove(&self) -> Result<IoFuture> {
        self.inner.remove()
    }

    /// Close the descriptor asynchronously, consuming the handle.
    pub fn close(self) -> Result<IoFuture> {
        self.inner.close()
    }
}

/// A file opened for direct, unbuffered I/O. Reads and writes bypass the
/// page cache, must be block-aligned, and complete on the busy-poll ring.
pub struct DmaFile {
    inner: FileInner,
}

impl DmaFile {
    /// Required alignment of buffers, offsets and lengths.
    pub const ALIGNMENT: usize = 512;

    pub fn open(engine: &Engine, path: impl AsRef<Path>, opts: &OpenOptions) -> Result<DmaFile> {
        Ok(DmaFile {
            inner: FileInner::open(engine, path.as_ref(), opts, true)?,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn read_at(&self, buf: &mut AlignedBuf, offset: u64, len: usize) -> Result<IoFuture> {
        let len = checked_len(buf, len)?;
        check_dma_alignment(buf.addr(), offset, len as usize)?;
        self.inner
            .engine
            .read(self.inner.fd, buf.addr(), to_offset(offset)?, len, Pollable::Pollable)
    }

    pub fn write_at(&self, buf: &AlignedBuf, offset: u64, len: usize) -> Result<IoFuture> {
        let len = checked_len(buf, len)?;
        check_dma_alignment(buf.addr(), offset, len as usize)?;
        self.inner
            .engine
            .write(self.inner.fd, buf.addr(), to_offset(offset)?, len, Pollable::Pollable)
    }

    pub fn data_sync(&self) -> Result<IoFuture> {
        self.inner.data_sync()
    }

    pub fn pre_allocate(&self, size: u64, offset: u64) -> Result<IoFuture> {
        self.inner.pre_allocate(size, offset)
    }

    pub fn remove(&self) -> Result<IoFuture> {
        self.inner.remove()
    }

    pub fn close(self) -> Result<IoFuture> {
        self.inner.close()
    }

    /// Round `v` up to the next multiple of `align` (a power of two).
    pub fn align_up(v: u64, align: u64) -> u64 {
        (v + align - 1) & !(align - 1)
    }

    /// Round `v` down to a multiple of `align` (a power of two).
    pub fn align_down(v: u64, align: u64) -> u64 {
        v & !(align - 1)
    }
}

fn check_dma_alignment(addr: u64, offset: u64, len: usize) -> Result<()> {
    let align = DmaFile::ALIGNMENT as u64;
    if addr % align != 0 {
        return Err(Error::InvalidArgument(format!(
            "direct I/O buffer address must be {}-byte aligned",
            align
        )));
    }
    if offset % align != 0 {
        return Err(Error::InvalidArgument(format!(
            "direct I/O offset must be a multiple of {}",
            align
        )));
    }
    if len as u64 % align != 0 {
        return Err(Error::InvalidArgument(format!(
            "direct I/O length must be a multiple of {}",
            align
        )));
    }
    Ok(())
}
