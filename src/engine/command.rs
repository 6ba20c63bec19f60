//! In-flight operation records.
//!
//! A command carries everything one submission entry needs, plus the
//! result sink and any storage that must outlive the kernel's use of it
//! (the path string of an open/unlink, the iovec list of a vectored op).
//! That storage is freed when the command is released from the pool,
//! never later.

use crate::buffer::IovecArray;
use crate::engine::future::Sink;
use crate::ring::sq::Sqe;
use crate::sys;
use std::ffi::CString;
use std::os::unix::io::RawFd;

/// Whether a file's reads and writes may complete through the busy-poll
/// ring. Files opened for direct, unbuffered I/O qualify; everything else
/// takes the interrupt-driven path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pollable {
    Pollable,
    NonPollable,
}

/// Owned storage referenced by the submission entry.
pub(crate) enum Keep {
    None,
    Path(CString),
    Iovecs(IovecArray),
}

/// One outstanding operation.
pub(crate) struct Command {
    pub op: u8,
    pub sqe_flags: u8,
    pub rw_flags: u32,
    pub fd: RawFd,
    pub addr: u64,
    pub len: u32,
    pub offset: u64,
    pub buf_index: u16,
    pub file_index: u32,
    pub pollable: Pollable,
    pub sink: Sink,
    /// Released together with the command; the kernel reads through
    /// `addr` until the completion arrives.
    _keep: Keep,
}

#[allow(clippy::too_many_arguments)]
impl Command {
    fn init(
        op: u8,
        sqe_flags: u8,
        rw_flags: u32,
        fd: RawFd,
        addr: u64,
        len: u32,
        offset: u64,
        buf_index: u16,
        pollable: Pollable,
        sink: Sink,
        keep: Keep,
    ) -> Command {
        Command {
            op,
            sqe_flags,
            rw_flags,
            fd,
            addr,
            len,
            offset,
            buf_index,
            file_index: 0,
            pollable,
            sink,
            _keep: keep,
        }
    }

    pub(crate) fn read(
        fd: RawFd,
        addr: u64,
        len: u32,
        offset: u64,
        pollable: Pollable,
        sink: Sink,
    ) -> Command {
        Self::init(
            sys::IORING_OP_READ,
            0,
            0,
            fd,
            addr,
            len,
            offset,
            0,
            pollable,
            sink,
            Keep::None,
        )
    }

    pub(crate) fn write(
        fd: RawFd,
        addr: u64,
        len: u32,
        offset: u64,
        pollable: Pollable,
        sink: Sink,
    ) -> Command {
        Self::init(
            sys::IORING_OP_WRITE,
            0,
            0,
            fd,
            addr,
            len,
            offset,
            0,
            pollable,
            sink,
            Keep::None,
        )
    }

    pub(crate) fn read_vectored(fd: RawFd, iovecs: IovecArray, offset: u64, sink: Sink) -> Command {
        let addr = iovecs.addr();
        let count = iovecs.count() as u32;
        Self::init(
            sys::IORING_OP_READV,
            0,
            0,
            fd,
            addr,
            count,
            offset,
            0,
            Pollable::NonPollable,
            sink,
            Keep::Iovecs(iovecs),
        )
    }

    pub(crate) fn write_vectored(fd: RawFd, iovecs: IovecArray, offset: u64, sink: Sink) -> Command {
        let addr = iovecs.addr();
        let count = iovecs.count() as u32;
        Self::init(
            sys::IORING_OP_WRITEV,
            0,
            0,
            fd,
            addr,
            count,
            offset,
            0,
            Pollable::NonPollable,
            sink,
            Keep::Iovecs(iovecs),
        )
    }

    pub(crate) fn read_fixed(
        fd: RawFd,
        addr: u64,
        len: u32,
        offset: u64,
        buf_index: u16,
        pollable: Pollable,
        sink: Sink,
    ) -> Command {
        Self::init(
            sys::IORING_OP_READ_FIXED,
            0,
            0,
            fd,
            addr,
            len,
            offset,
            buf_index,
            pollable,
            sink,
            Keep::None,
        )
    }

    pub(crate) fn write_fixed(
        fd: RawFd,
        addr: u64,
        len: u32,
        offset: u64,
        buf_index: u16,
        pollable: Pollable,
        sink: Sink,
    ) -> Command {
        Self::init(
            sys::IORING_OP_WRITE_FIXED,
            0,
            0,
            fd,
            addr,
            len,
            offset,
            buf_index,
            pollable,
            sink,
            Keep::None,
        )
    }

    /// A read the kernel satisfies from the registered buffer ring
    /// identified by `bgid`.
    pub(crate) fn read_buf_ring(
        fd: RawFd,
        len: u32,
        offset: u64,
        bgid: u16,
        pollable: Pollable,
        sink: Sink,
    ) -> Command {
        Self::init(
            sys::IORING_OP_READ,
            sys::IOSQE_BUFFER_SELECT,
            0,
            fd,
            0,
            len,
            offset,
            bgid,
            pollable,
            sink,
            Keep::None,
        )
    }

    pub(crate) fn open_at(path: CString, open_flags: i32, mode: u32, sink: Sink) -> Command {
        let addr = path.as_ptr() as u64;
        Self::init(
            sys::IORING_OP_OPENAT,
            0,
            open_flags as u32,
            libc::AT_FDCWD,
            addr,
            mode,
            0,
            0,
            Pollable::NonPollable,
            sink,
            Keep::Path(path),
        )
    }

    pub(crate) fn close_fd(fd: RawFd, sink: Sink) -> Command {
        Self::init(
            sys::IORING_OP_CLOSE,
            0,
            0,
            fd,
            0,
            0,
            0,
            0,
            Pollable::NonPollable,
            sink,
            Keep::None,
        )
    }

    pub(crate) fn data_sync(fd: RawFd, sink: Sink) -> Command {
        Self::init(
            sys::IORING_OP_FSYNC,
            0,
            sys::IORING_FSYNC_DATASYNC,
            fd,
            0,
            0,
            0,
            0,
            Pollable::NonPollable,
            sink,
            Keep::None,
        )
    }

    pub(crate) fn pre_allocate(fd: RawFd, size: u64, offset: u64, sink: Sink) -> Command {
        Self::init(
            sys::IORING_OP_FALLOCATE,
            0,
            0,
            fd,
            size,
            0,
            offset,
            0,
            Pollable::NonPollable,
            sink,
            Keep::None,
        )
    }

    pub(crate) fn unlink(path: CString, sink: Sink) -> Command {
        let addr = path.as_ptr() as u64;
        Self::init(
            sys::IORING_OP_UNLINKAT,
            0,
            0,
            libc::AT_FDCWD,
            addr,
            0,
            0,
            0,
            Pollable::NonPollable,
            sink,
            Keep::Path(path),
        )
    }

    pub(crate) fn no_op(sink: Sink) -> Command {
        Self::init(
            sys::IORING_OP_NOP,
            0,
            0,
            -1,
            0,
            0,
            0,
            0,
            Pollable::NonPollable,
            sink,
            Keep::None,
        )
    }

    /// The loop's wakeup read on its eventfd.
    pub(crate) fn event_fd_read(event_fd: RawFd, buf_addr: u64) -> Command {
        Self::init(
            sys::IORING_OP_READ,
            0,
            0,
            event_fd,
            buf_addr,
            8,
            0,
            0,
            Pollable::NonPollable,
            Sink::EventFd,
            Keep::None,
        )
    }

    /// Only plain reads and writes are eligible for busy-poll routing.
    pub(crate) fn is_plain_rw(&self) -> bool {
        self.op == sys::IORING_OP_READ || self.op == sys::IORING_OP_WRITE
    }

    pub(crate) fn to_sqe(&self, token: u32) -> Sqe {
        Sqe {
            op: self.op,
            flags: self.sqe_flags,
            rw_flags: self.rw_flags,
            fd: self.fd,
            addr: self.addr,
            len: self.len,
            offset: self.offset,
            user_data: token as u64,
            buf_index: self.buf_index,
            file_index: self.file_index,
        }
    }
}
