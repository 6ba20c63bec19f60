//! Native io_uring syscall layer.
//!
//! Everything that crosses the kernel boundary lives here: ring setup and
//! teardown (io_uring_setup plus the ring memory mappings), the enter and
//! register syscalls, eventfd creation, page size, aligned allocation and
//! the minimum-kernel-version check. The rest of the crate treats these as
//! opaque primitives and never issues a syscall directly.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

// Submission/completion entry sizes, fixed by the kernel ABI.
pub(crate) const SQE_SIZE: usize = 64;
pub(crate) const CQE_SIZE: usize = 16;

// Opcodes used by the engine.
pub(crate) const IORING_OP_NOP: u8 = 0;
pub(crate) const IORING_OP_READV: u8 = 1;
pub(crate) const IORING_OP_WRITEV: u8 = 2;
pub(crate) const IORING_OP_FSYNC: u8 = 3;
pub(crate) const IORING_OP_READ_FIXED: u8 = 4;
pub(crate) const IORING_OP_WRITE_FIXED: u8 = 5;
pub(crate) const IORING_OP_FALLOCATE: u8 = 17;
pub(crate) const IORING_OP_OPENAT: u8 = 18;
pub(crate) const IORING_OP_CLOSE: u8 = 19;
pub(crate) const IORING_OP_READ: u8 = 22;
pub(crate) const IORING_OP_WRITE: u8 = 23;
pub(crate) const IORING_OP_UNLINKAT: u8 = 36;

// Setup flags.
pub(crate) const IORING_SETUP_IOPOLL: u32 = 1 << 0;
pub(crate) const IORING_SETUP_SQPOLL: u32 = 1 << 1;
pub(crate) const IORING_SETUP_SQ_AFF: u32 = 1 << 2;
pub(crate) const IORING_SETUP_CQSIZE: u32 = 1 << 3;
pub(crate) const IORING_SETUP_CLAMP: u32 = 1 << 4;
pub(crate) const IORING_SETUP_ATTACH_WQ: u32 = 1 << 5;

// Features reported by setup.
pub(crate) const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;

// Enter flags.
pub(crate) const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
pub(crate) const IORING_ENTER_SQ_WAKEUP: u32 = 1 << 1;

// SQ ring flags word.
pub(crate) const IORING_SQ_NEED_WAKEUP: u32 = 1 << 0;

// Per-SQE flags.
pub(crate) const IOSQE_BUFFER_SELECT: u8 = 1 << 5;

// CQE flags.
pub(crate) const IORING_CQE_F_BUFFER: u32 = 1 << 0;
pub(crate) const IORING_CQE_BUFFER_SHIFT: u32 = 16;

// Register opcodes.
pub(crate) const IORING_REGISTER_PBUF_RING: u32 = 22;
pub(crate) const IORING_UNREGISTER_PBUF_RING: u32 = 23;

// Mapping offsets for the three ring regions.
const IORING_OFF_SQ_RING: i64 = 0;
const IORING_OFF_CQ_RING: i64 = 0x0800_0000;
const IORING_OFF_SQES: i64 = 0x1000_0000;

// Fsync flags word.
pub(crate) const IORING_FSYNC_DATASYNC: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct SqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct CqringOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub resv2: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqringOffsets,
    pub cq_off: CqringOffsets,
}

/// Registration record for a provided buffer ring.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub(crate) struct IoUringBufReg {
    pub ring_addr: u64,
    pub ring_entries: u32,
    pub bgid: u16,
    pub flags: u16,
    pub resv: [u64; 3],
}

/// One kernel ring pair: the descriptor returned by setup, the mapped
/// regions, and the parameters needed to find the head/tail/mask words
/// inside them. Destroyed with [`close_ring`].
#[derive(Debug)]
pub(crate) struct RawRing {
    pub fd: RawFd,
    pub params: IoUringParams,
    pub sq_ring_ptr: *mut u8,
    pub sq_ring_len: usize,
    pub cq_ring_ptr: *mut u8,
    pub cq_ring_len: usize,
    pub sqes_ptr: *mut u8,
    pub sqes_len: usize,
    pub single_mmap: bool,
}

// The mapped regions are handed to exactly one Ring, which is owned by the
// loop thread after startup.
unsafe impl Send for RawRing {}

#[cfg(test)]
impl RawRing {
    /// Duplicate the descriptor for tests that fabricate ring memory and
    /// keep the backing storage alongside the ring under test.
    pub(crate) fn clone_for_test(&self) -> RawRing {
        RawRing {
            fd: self.fd,
            params: self.params,
            sq_ring_ptr: self.sq_ring_ptr,
            sq_ring_len: self.sq_ring_len,
            cq_ring_ptr: self.cq_ring_ptr,
            cq_ring_len: self.cq_ring_len,
            sqes_ptr: self.sqes_ptr,
            sqes_len: self.sqes_len,
            single_mmap: self.single_mmap,
        }
    }
}

/// Set up an io_uring instance and map its three regions.
pub(crate) fn setup_ring(
    entries: u32,
    flags: u32,
    sq_thread_idle: u32,
    sq_thread_cpu: u32,
    cq_entries: u32,
    wq_fd: u32,
) -> io::Result<RawRing> {
    let mut params = IoUringParams {
        flags,
        sq_thread_cpu,
        sq_thread_idle,
        cq_entries,
        wq_fd,
        ..Default::default()
    };

    let fd = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_long,
            &mut params as *mut IoUringParams,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = fd as RawFd;

    let sq_ring_len = params.sq_off.array as usize + params.sq_entries as usize * 4;
    let cq_ring_len = params.cq_off.cqes as usize + params.cq_entries as usize * CQE_SIZE;
    let sqes_len = params.sq_entries as usize * SQE_SIZE;
    let single_mmap = params.features & IORING_FEAT_SINGLE_MMAP != 0;

    let sq_map_len = if single_mmap {
        sq_ring_len.max(cq_ring_len)
    } else {
        sq_ring_len
    };

    let sq_ring_ptr = match map_region(fd, sq_map_len, IORING_OFF_SQ_RING) {
        Ok(p) => p,
        Err(e) => {
            unsafe { libc::close(fd) };
            return Err(e);
        }
    };

    let cq_ring_ptr = if single_mmap {
        sq_ring_ptr
    } else {
        match map_region(fd, cq_ring_len, IORING_OFF_CQ_RING) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    libc::munmap(sq_ring_ptr as *mut libc::c_void, sq_map_len);
                    libc::close(fd);
                }
                return Err(e);
            }
        }
    };

    let sqes_ptr = match map_region(fd, sqes_len, IORING_OFF_SQES) {
        Ok(p) => p,
        Err(e) => {
            unsafe {
                libc::munmap(sq_ring_ptr as *mut libc::c_void, sq_map_len);
                if !single_mmap {
                    libc::munmap(cq_ring_ptr as *mut libc::c_void, cq_ring_len);
                }
                libc::close(fd);
            }
            return Err(e);
        }
    };

    Ok(RawRing {
        fd,
        params,
        sq_ring_ptr,
        sq_ring_len: sq_map_len,
        cq_ring_ptr,
        cq_ring_len,
        sqes_ptr,
        sqes_len,
        single_mmap,
    })
}

fn map_region(fd: RawFd, len: usize, offset: i64) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr as *mut u8)
    }
}

/// Unmap the ring regions and close the ring descriptor.
pub(crate) fn close_ring(ring: &RawRing) {
    unsafe {
        libc::munmap(ring.sq_ring_ptr as *mut libc::c_void, ring.sq_ring_len);
        if !ring.single_mmap {
            libc::munmap(ring.cq_ring_ptr as *mut libc::c_void, ring.cq_ring_len);
        }
        libc::munmap(ring.sqes_ptr as *mut libc::c_void, ring.sqes_len);
        libc::close(ring.fd);
    }
}

/// io_uring_enter: hand submissions to the kernel and optionally wait for
/// completions. EINTR is reported as zero progress so the caller retries
/// on its next pass instead of treating a signal as a failure.
pub(crate) fn enter(fd: RawFd, to_submit: u32, min_complete: u32, flags: u32) -> io::Result<u32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd as libc::c_long,
            to_submit as libc::c_long,
            min_complete as libc::c_long,
            flags as libc::c_long,
            ptr::null::<libc::sigset_t>(),
            0 as libc::c_long,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(ret as u32)
}

/// io_uring_register for buffer-ring registration and teardown.
pub(crate) fn register(
    fd: RawFd,
    opcode: u32,
    arg: *const libc::c_void,
    nr_args: u32,
) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            fd as libc::c_long,
            opcode as libc::c_long,
            arg,
            nr_args as libc::c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create the wakeup eventfd.
pub(crate) fn event_fd() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Add `value` to an eventfd counter, waking any ring read armed on it.
pub(crate) fn event_fd_write(fd: RawFd, value: u64) -> io::Result<()> {
    let ret = unsafe {
        libc::write(
            fd,
            &value as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// System page size.
pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Allocate a zeroed region with the given alignment.
pub(crate) fn alloc_zeroed_aligned(len: usize, align: usize) -> io::Result<*mut u8> {
    let layout = Layout::from_size_align(len, align)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "aligned allocation failed",
        ));
    }
    Ok(ptr)
}

pub(crate) fn dealloc_aligned(ptr: *mut u8, len: usize, align: usize) {
    // Layout was validated at allocation time.
    if let Ok(layout) = Layout::from_size_align(len, align) {
        unsafe { dealloc(ptr, layout) };
    }
}

/// Kernel release string from uname.
pub(crate) fn kernel_version() -> io::Result<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::uname(&mut uts) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Ok(release.to_string_lossy().into_owned())
}

/// Whether the kernel release is at least 5.11, the floor for the
/// operation set this engine submits.
pub(crate) fn kernel_supported(release: &str) -> bool {
    let components: Vec<&str> = release.split('.').collect();
    if components.len() < 3 {
        return false;
    }

    let major: u32 = match components[0].parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    if major <= 4 {
        return false;
    }
    if major > 5 {
        return true;
    }

    let minor: u32 = match components[1].parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    minor >= 11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_struct_sizes() {
        // Fixed kernel ABI layouts; a mismatch here corrupts every ring access.
        assert_eq!(std::mem::size_of::<SqringOffsets>(), 40);
        assert_eq!(std::mem::size_of::<CqringOffsets>(), 40);
        assert_eq!(std::mem::size_of::<IoUringParams>(), 120);
        assert_eq!(std::mem::size_of::<IoUringBufReg>(), 40);
    }

    #[test]
    fn test_kernel_supported() {
        assert!(!kernel_supported("4.4.0"));
        assert!(!kernel_supported("5.10.3"));
        assert!(kernel_supported("5.11.0"));
        assert!(kernel_supported("5.19.0-rc1"));
        assert!(kernel_supported("6.1.0-13-amd64"));
        // Malformed or truncated release strings are rejected.
        assert!(!kernel_supported("6.5"));
        assert!(!kernel_supported("linux"));
    }
}
