//! Provided buffer ring registered with the kernel.
//!
//! One contiguous page-aligned region holds the descriptor array followed
//! by the buffer storage. The kernel selects a buffer for a completion and
//! reports its id in the CQE flags; the consumer hands the id back through
//! `recycle`, which re-publishes the descriptor with a release-ordered
//! tail store. A buffer id is never visible to the kernel twice without an
//! intervening recycle.

use crate::config::BufRingSpec;
use crate::error::{Error, Result};
use crate::ring::mem::RingMem;
use crate::sys;
use std::os::unix::io::RawFd;
use tracing::warn;

// Descriptor layout inside the shared ring: addr(8) len(4) bid(2) resv(2).
const BUF_DESC_SIZE: usize = 16;
const DESC_LEN: usize = 8;
const DESC_BID: usize = 12;
// The kernel's ring header shares storage with entry 0; the tail lives in
// its resv field.
const TAIL_OFF: usize = 14;

pub(crate) struct BufRing {
    region: *mut u8,
    region_len: usize,
    region_align: usize,
    entries: u16,
    buffer_size: usize,
    bgid: u16,
    tail: u16,
    /// Which buffer ids are currently visible to the kernel.
    armed: Box<[bool]>,
    armed_count: u16,
    registered: bool,
    freed: bool,
}

// The ring region is owned by this value and only mutated on the loop
// thread; results read buffer contents through raw pointers they carry.
unsafe impl Send for BufRing {}

impl BufRing {
    /// Allocate, arm and register a buffer ring on `ring_fd`.
    pub(crate) fn new(ring_fd: RawFd, spec: &BufRingSpec) -> Result<Self> {
        let mut ring = Self::with_region(spec)?;

        let reg = sys::IoUringBufReg {
            ring_addr: ring.region as u64,
            ring_entries: ring.entries as u32,
            bgid: ring.bgid,
            ..Default::default()
        };
        if let Err(e) = sys::register(
            ring_fd,
            sys::IORING_REGISTER_PBUF_RING,
            &reg as *const sys::IoUringBufReg as *const libc::c_void,
            1,
        ) {
            ring.free_region();
            return Err(Error::Setup(e));
        }
        ring.registered = true;
        Ok(ring)
    }

    /// Allocate the shared region and arm every buffer, without telling the
    /// kernel about it. Registration is the only kernel interaction in
    /// construction, so tests exercise the full arming path through this.
    pub(crate) fn with_region(spec: &BufRingSpec) -> Result<Self> {
        if spec.count == 0 || !spec.count.is_power_of_two() {
            return Err(Error::InvalidArgument(
                "buffer ring entry count must be a non-zero power of two".into(),
            ));
        }
        if spec.buf_size == 0 {
            return Err(Error::InvalidArgument(
                "buffer ring buffer size must be non-zero".into(),
            ));
        }

        let count = spec.count as usize;
        let region_len = count * BUF_DESC_SIZE + count * spec.buf_size;
        let region_align = sys::page_size();
        let region =
            sys::alloc_zeroed_aligned(region_len, region_align).map_err(Error::Setup)?;

        let mut ring = Self {
            region,
            region_len,
            region_align,
            entries: spec.count,
            buffer_size: spec.buf_size,
            bgid: spec.bgid,
            tail: 0,
            armed: vec![false; count].into_boxed_slice(),
            armed_count: 0,
            registered: false,
            freed: false,
        };

        for bid in 0..spec.count {
            ring.write_descriptor(ring.tail.wrapping_add(bid), bid);
            ring.armed[bid as usize] = true;
        }
        ring.armed_count = spec.count;
        ring.tail = spec.count;
        // One publish makes all initial buffers selectable at once.
        ring.mem().store_u16_release(TAIL_OFF, ring.tail);

        Ok(ring)
    }

    fn mem(&self) -> RingMem {
        RingMem::new(self.region, self.region_len)
    }

    fn mask(&self) -> u16 {
        self.entries - 1
    }

    fn write_descriptor(&self, slot: u16, bid: u16) {
        let base = (slot & self.mask()) as usize * BUF_DESC_SIZE;
        let mem = self.mem();
        mem.store_u64(base, self.buffer_addr(bid));
        mem.store_u32(base + DESC_LEN, self.buffer_size as u32);
        mem.store_u16(base + DESC_BID, bid);
    }

    fn buffer_addr(&self, bid: u16) -> u64 {
        self.buffer_ptr(bid) as u64
    }

    /// Pointer to the storage of buffer `bid`.
    pub(crate) fn buffer_ptr(&self, bid: u16) -> *mut u8 {
        let buffers_base = self.entries as usize * BUF_DESC_SIZE;
        unsafe {
            self.region
                .add(buffers_base + bid as usize * self.buffer_size)
        }
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Count of buffers currently selectable by the kernel.
    pub(crate) fn armed(&self) -> u16 {
        self.armed_count
    }

    /// Record that the kernel consumed `bid` for a completion.
    pub(crate) fn note_selected(&mut self, bid: u16) {
        if bid as usize >= self.armed.len() || !self.armed[bid as usize] {
            warn!(bid, "kernel selected a buffer id that was not armed");
            return;
        }
        self.armed[bid as usize] = false;
        self.armed_count -= 1;
    }

    /// Re-publish a consumed buffer id as selectable.
    pub(crate) fn recycle(&mut self, bid: u16) {
        if bid as usize >= self.armed.len() {
            warn!(bid, "recycle of an out-of-range buffer id");
            return;
        }
        debug_assert!(
            !self.armed[bid as usize],
            "buffer {} armed twice without a consume",
            bid
        );
        if self.armed[bid as usize] {
            return;
        }

        self.write_descriptor(self.tail, bid);
        self.armed[bid as usize] = true;
        self.armed_count += 1;
        self.tail = self.tail.wrapping_add(1);
        self.mem().store_u16_release(TAIL_OFF, self.tail);
    }

    /// Unregister from the kernel and free the region.
    pub(crate) fn close(&mut self, ring_fd: RawFd) {
        if self.registered {
            let reg = sys::IoUringBufReg {
                bgid: self.bgid,
                ..Default::default()
            };
            if let Err(e) = sys::register(
                ring_fd,
                sys::IORING_UNREGISTER_PBUF_RING,
                &reg as *const sys::IoUringBufReg as *const libc::c_void,
                1,
            ) {
                warn!(bgid = self.bgid, error = %e, "buffer ring unregister failed");
            }
            self.registered = false;
        }
        self.free_region();
    }

    fn free_region(&mut self) {
        if !self.freed {
            sys::dealloc_aligned(self.region, self.region_len, self.region_align);
            self.freed = true;
        }
    }
}

impl Drop for BufRing {
    fn drop(&mut self) {
        // Unregistration needs the ring fd and happens in close(); a drop
        // without close only reclaims the memory.
        self.free_region();
    }
}
