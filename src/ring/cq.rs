//! Completion queue over a mapped CQ ring.
//!
//! Entries are consumed from the local head up to the kernel-published
//! tail. The head is released back to the kernel immediately after each
//! entry is read, before the callback runs, so the slot can be reused as
//! soon as possible.

use crate::ring::mem::RingMem;
use crate::sys::{self, RawRing};

const CQE_USER_DATA: usize = 0;
const CQE_RES: usize = 8;
const CQE_FLAGS: usize = 12;

pub(crate) struct CompletionQueue {
    mem: RingMem,
    head_off: usize,
    tail_off: usize,
    cqes_off: usize,
    ring_mask: u32,
    head: u32,
}

impl CompletionQueue {
    pub(crate) fn new(raw: &RawRing) -> Self {
        let mem = RingMem::new(raw.cq_ring_ptr, raw.cq_ring_len);
        let off = &raw.params.cq_off;
        let ring_mask = mem.load_u32(off.ring_mask as usize);
        let head = mem.load_u32(off.head as usize);

        Self {
            mem,
            head_off: off.head as usize,
            tail_off: off.tail as usize,
            cqes_off: off.cqes as usize,
            ring_mask,
            head,
        }
    }

    pub(crate) fn has_completions(&self) -> bool {
        self.head != self.mem.load_u32_acquire(self.tail_off)
    }

    pub(crate) fn head(&self) -> u32 {
        self.head
    }

    /// Consume every currently-published entry, invoking the callback with
    /// `(result, flags, user_data)` per entry. Returns how many were seen.
    pub(crate) fn process<F: FnMut(i32, u32, u64)>(&mut self, mut f: F) -> usize {
        let tail = self.mem.load_u32_acquire(self.tail_off);
        let mut seen = 0;
        while self.head != tail {
            let slot = self.cqes_off + (self.head & self.ring_mask) as usize * sys::CQE_SIZE;

            let user_data = self.mem.load_u64(slot + CQE_USER_DATA);
            let res = self.mem.load_u32(slot + CQE_RES) as i32;
            let flags = self.mem.load_u32(slot + CQE_FLAGS);

            self.head = self.head.wrapping_add(1);
            self.mem.store_u32_release(self.head_off, self.head);
            seen += 1;
            f(res, flags, user_data);
        }
        seen
    }
}
