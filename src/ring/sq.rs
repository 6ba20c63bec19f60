//! Submission queue over a mapped SQ ring.
//!
//! The queue keeps local head/tail copies and only touches the shared
//! words when publishing (tail, release) or refreshing after an enter
//! (head, acquire). Entries are written in place at `tail & mask`; a full
//! ring forces a submit before the next entry is written, so backpressure
//! is blocking at the engine boundary and nothing is ever dropped.

use crate::error::{Error, Result};
use crate::ring::mem::RingMem;
use crate::sys::{self, RawRing};
use std::os::unix::io::RawFd;

// Byte offsets inside one 64-byte submission entry.
const SQE_OP_CODE: usize = 0;
const SQE_FLAGS: usize = 1;
const SQE_IOPRIO: usize = 2;
const SQE_FD: usize = 4;
const SQE_OFFSET: usize = 8;
const SQE_ADDRESS: usize = 16;
const SQE_LEN: usize = 24;
const SQE_RW_FLAGS: usize = 28;
const SQE_USER_DATA: usize = 32;
const SQE_BUF_INDEX: usize = 40;
const SQE_PERSONALITY: usize = 42;
const SQE_FILE_INDEX: usize = 44;

/// The fields of one submission entry, as populated from a command.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Sqe {
    pub op: u8,
    pub flags: u8,
    pub rw_flags: u32,
    pub fd: RawFd,
    pub addr: u64,
    pub len: u32,
    pub offset: u64,
    pub user_data: u64,
    pub buf_index: u16,
    pub file_index: u32,
}

pub(crate) struct SubmissionQueue {
    mem: RingMem,
    sqes: RingMem,
    head_off: usize,
    tail_off: usize,
    flags_off: usize,
    ring_entries: u32,
    ring_mask: u32,
    head: u32,
    tail: u32,
    ring_fd: RawFd,
    ring_flags: u32,
}

impl SubmissionQueue {
    pub(crate) fn new(raw: &RawRing) -> Self {
        let mem = RingMem::new(raw.sq_ring_ptr, raw.sq_ring_len);
        let sqes = RingMem::new(raw.sqes_ptr, raw.sqes_len);
        let off = &raw.params.sq_off;

        let ring_entries = mem.load_u32(off.ring_entries as usize);
        let ring_mask = mem.load_u32(off.ring_mask as usize);
        let head = mem.load_u32(off.head as usize);
        let tail = mem.load_u32(off.tail as usize);

        // Start from clean entries and an identity-mapped index array.
        sqes.zero(0, sqes.len());
        for i in 0..ring_entries {
            mem.store_u32(off.array as usize + i as usize * 4, i);
        }

        Self {
            mem,
            sqes,
            head_off: off.head as usize,
            tail_off: off.tail as usize,
            flags_off: off.flags as usize,
            ring_entries,
            ring_mask,
            head,
            tail,
            ring_fd: raw.fd,
            ring_flags: raw.params.flags,
        }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.ring_entries
    }

    pub(crate) fn pending(&self) -> u32 {
        self.tail.wrapping_sub(self.head)
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending() > 0
    }

    /// Sequence counter of the next entry slot; together with the
    /// completion head this counts operations still inside the kernel.
    pub(crate) fn tail(&self) -> u32 {
        self.tail
    }

    fn is_io_poll(&self) -> bool {
        self.ring_flags & sys::IORING_SETUP_IOPOLL != 0
    }

    fn is_sq_poll(&self) -> bool {
        self.ring_flags & sys::IORING_SETUP_SQPOLL != 0
    }

    /// Write one entry into the ring, forcing a submit first when the ring
    /// is at capacity. Returns whether a forced submit happened.
    pub(crate) fn enqueue(&mut self, e: &Sqe) -> Result<bool> {
        let forced = self.pending() == self.ring_entries;
        if forced {
            self.submit()?;
            if self.pending() == self.ring_entries {
                // Published but nothing reclaimed; writing now would
                // overwrite an entry the kernel has not consumed.
                return Err(Error::RingFull);
            }
        }

        let slot = (self.tail & self.ring_mask) as usize * sys::SQE_SIZE;
        self.write_sqe(slot, e);
        self.tail = self.tail.wrapping_add(1);
        Ok(forced)
    }

    fn write_sqe(&mut self, slot: usize, e: &Sqe) {
        self.sqes.store_u8(slot + SQE_OP_CODE, e.op);
        self.sqes.store_u8(slot + SQE_FLAGS, e.flags);
        self.sqes.store_u16(slot + SQE_IOPRIO, 0);
        self.sqes.store_u32(slot + SQE_FD, e.fd as u32);
        self.sqes.store_u64(slot + SQE_OFFSET, e.offset);
        self.sqes.store_u64(slot + SQE_ADDRESS, e.addr);
        self.sqes.store_u32(slot + SQE_LEN, e.len);
        self.sqes.store_u32(slot + SQE_RW_FLAGS, e.rw_flags);
        self.sqes.store_u64(slot + SQE_USER_DATA, e.user_data);
        self.sqes.store_u16(slot + SQE_BUF_INDEX, e.buf_index);
        self.sqes.store_u16(slot + SQE_PERSONALITY, 0);
        self.sqes.store_u32(slot + SQE_FILE_INDEX, e.file_index);
    }

    /// Publish pending entries to the kernel. Busy-poll rings always ask
    /// for at least one completion since nothing else reaps them; ordinary
    /// rings request none.
    pub(crate) fn submit(&mut self) -> Result<u32> {
        let to_submit = self.pending();
        if self.is_io_poll() {
            self.publish_and_enter(to_submit, 1, sys::IORING_ENTER_GETEVENTS)
        } else if to_submit > 0 {
            self.publish_and_enter(to_submit, 0, 0)
        } else {
            Ok(0)
        }
    }

    /// Publish pending entries and block until at least one completion is
    /// available. This is the loop's parking path.
    pub(crate) fn submit_and_wait(&mut self) -> Result<u32> {
        let to_submit = self.pending();
        self.publish_and_enter(to_submit, 1, sys::IORING_ENTER_GETEVENTS)
    }

    fn publish_and_enter(&mut self, to_submit: u32, min_complete: u32, flags: u32) -> Result<u32> {
        self.mem.store_u32_release(self.tail_off, self.tail);

        let mut flags = flags;
        let mut need_enter = true;
        let mut ret = to_submit;
        if self.is_sq_poll() {
            // The kernel thread consumes entries by itself unless idle.
            need_enter = min_complete > 0;
            if self.mem.load_u32_acquire(self.flags_off) & sys::IORING_SQ_NEED_WAKEUP != 0 {
                flags |= sys::IORING_ENTER_SQ_WAKEUP;
                need_enter = true;
            }
        }

        if need_enter {
            ret = sys::enter(self.ring_fd, to_submit, min_complete, flags)
                .map_err(|e| Error::from_errno(e.raw_os_error().unwrap_or(libc::EINVAL)))?;
        }

        self.head = self.mem.load_u32_acquire(self.head_off);
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::test_support::fake_ring;

    fn sqe(user_data: u64) -> Sqe {
        Sqe {
            op: sys::IORING_OP_READ,
            fd: 3,
            addr: 0x1000,
            len: 512,
            offset: 4096,
            user_data,
            ..Default::default()
        }
    }

    #[test]
    fn test_sqe_byte_layout() {
        let fake = fake_ring(4, 0);
        let mut sq = SubmissionQueue::new(&fake.raw);

        let e = Sqe {
            op: sys::IORING_OP_WRITE,
            flags: sys::IOSQE_BUFFER_SELECT,
            rw_flags: 0x11,
            fd: 7,
            addr: 0xabcd_ef01_2345,
            len: 4096,
            offset: 0x10_0000,
            user_data: 99,
            buf_index: 3,
            file_index: 5,
        };
        sq.enqueue(&e).unwrap();

        let m = fake.sqes.mem();
        assert_eq!(m.load_u8(0), sys::IORING_OP_WRITE);
        assert_eq!(m.load_u8(1), sys::IOSQE_BUFFER_SELECT);
        assert_eq!(m.load_u16(2), 0);
        assert_eq!(m.load_u32(4), 7);
        assert_eq!(m.load_u64(8), 0x10_0000);
        assert_eq!(m.load_u64(16), 0xabcd_ef01_2345);
        assert_eq!(m.load_u32(24), 4096);
        assert_eq!(m.load_u32(28), 0x11);
        assert_eq!(m.load_u64(32), 99);
        assert_eq!(m.load_u16(40), 3);
        assert_eq!(m.load_u16(42), 0);
        assert_eq!(m.load_u32(44), 5);
    }

    #[test]
    fn test_full_ring_forces_submit_before_next_entry() {
        let fake = fake_ring(4, sys::IORING_SETUP_SQPOLL);
        let mut sq = SubmissionQueue::new(&fake.raw);

        for i in 0..4 {
            assert!(!sq.enqueue(&sqe(i)).unwrap());
        }
        assert_eq!(sq.pending(), 4);

        // Pretend the kernel-side poller consumed everything.
        let head_off = fake.raw.params.sq_off.head as usize;
        fake.sq_mem.mem().store_u32(head_off, 4);

        // The 5th entry forces a submit (a no-syscall publish under
        // SQPOLL) and then lands in slot 0 again.
        assert!(sq.enqueue(&sqe(4)).unwrap());
        assert_eq!(sq.pending(), 1);
        assert_eq!(fake.sqes.mem().load_u64(32), 4);

        // The published tail is visible to the kernel side.
        let tail_off = fake.raw.params.sq_off.tail as usize;
        assert_eq!(fake.sq_mem.mem().load_u32(tail_off), 4);
    }

    #[test]
    fn test_forced_submit_without_progress_is_ring_full() {
        let fake = fake_ring(2, sys::IORING_SETUP_SQPOLL);
        let mut sq = SubmissionQueue::new(&fake.raw);

        sq.enqueue(&sqe(0)).unwrap();
        sq.enqueue(&sqe(1)).unwrap();

        // Kernel head unchanged: the forced submit publishes but reclaims
        // nothing, so the enqueue must fail rather than overwrite.
        let err = sq.enqueue(&sqe(2)).unwrap_err();
        assert!(matches!(err, Error::RingFull));
        assert_eq!(sq.pending(), 2);
    }

    #[test]
    fn test_submit_noop_when_empty() {
        let fake = fake_ring(4, 0);
        let mut sq = SubmissionQueue::new(&fake.raw);
        // Nothing pending and not busy-poll: no syscall, no progress.
        assert_eq!(sq.submit().unwrap(), 0);
    }
}
