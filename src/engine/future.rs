//! One-shot result delivery.
//!
//! Every scheduled operation settles exactly one sink. The caller side of
//! a sink is a future that can be awaited or waited on synchronously; the
//! engine side settles it from the loop thread when the completion entry
//! arrives. Integer sinks are pooled since nearly every operation produces
//! one; buffer-ring results carry their own payload and are not.

use crate::engine::{Engine, RingSide};
use crate::error::{Error, ErrorKind, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};
use tracing::warn;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

enum State<T> {
    Pending(Option<Waker>),
    Ready(Result<T>),
    Finished,
}

/// An exactly-once-settled result slot shared between one caller handle
/// and one in-flight command.
pub(crate) struct OneShot<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> OneShot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending(None)),
            cond: Condvar::new(),
        }
    }

    /// Deliver the result. Settling an already-settled slot is a protocol
    /// bug upstream; the late value is discarded.
    pub(crate) fn settle(&self, result: Result<T>) {
        let mut state = lock(&self.state);
        match &mut *state {
            State::Pending(waker) => {
                let waker = waker.take();
                *state = State::Ready(result);
                drop(state);
                self.cond.notify_all();
                if let Some(w) = waker {
                    w.wake();
                }
            }
            _ => {
                debug_assert!(false, "result slot settled twice");
                warn!("discarding a second settlement of a result slot");
            }
        }
    }

    fn wait(&self) -> Result<T> {
        let mut state = lock(&self.state);
        loop {
            if matches!(*state, State::Ready(_)) {
                match std::mem::replace(&mut *state, State::Finished) {
                    State::Ready(r) => return r,
                    _ => unreachable!(),
                }
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Result<T>> {
        let mut state = lock(&self.state);
        match &mut *state {
            State::Pending(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Ready(_) => match std::mem::replace(&mut *state, State::Finished) {
                State::Ready(r) => Poll::Ready(r),
                _ => unreachable!(),
            },
            State::Finished => Poll::Pending,
        }
    }

    fn is_reusable(&self) -> bool {
        matches!(*lock(&self.state), State::Ready(_) | State::Finished)
    }

    fn reset(&self) {
        *lock(&self.state) = State::Pending(None);
    }
}

/// Recycler for the common integer-result slots.
pub(crate) struct SinkPool {
    free: Mutex<Vec<Arc<OneShot<i32>>>>,
    capacity: usize,
}

impl SinkPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Arc::new(OneShot::new())).collect();
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    pub(crate) fn acquire(&self) -> Arc<OneShot<i32>> {
        lock(&self.free)
            .pop()
            .unwrap_or_else(|| Arc::new(OneShot::new()))
    }

    /// Return a slot once its result has been delivered and the other
    /// holder is gone. Called by whichever side observes it is last; when
    /// both race, the slot simply falls out of the pool and is replaced by
    /// a fresh allocation later.
    pub(crate) fn reclaim(&self, slot: Arc<OneShot<i32>>) {
        if Arc::strong_count(&slot) == 1 && slot.is_reusable() {
            slot.reset();
            let mut free = lock(&self.free);
            if free.len() < self.capacity {
                free.push(slot);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        lock(&self.free).len()
    }
}

/// The engine-side half of a result: where a completed command delivers.
pub(crate) enum Sink {
    Int {
        slot: Arc<OneShot<i32>>,
        pool: Arc<SinkPool>,
    },
    BufRing(Arc<OneShot<BufRingResult>>),
    /// The loop's own wakeup read; completions re-arm it, nothing settles.
    EventFd,
}

impl Sink {
    pub(crate) fn succeed_int(self, value: i32) {
        match self {
            Sink::Int { slot, pool } => {
                slot.settle(Ok(value));
                pool.reclaim(slot);
            }
            Sink::BufRing(slot) => {
                warn!("buffer-select read completed without a selected buffer");
                slot.settle(Err(Error::Kernel {
                    kind: ErrorKind::InvalidBuffer,
                    errno: libc::ENOBUFS,
                }));
            }
            Sink::EventFd => {}
        }
    }

    pub(crate) fn succeed_buf(self, result: BufRingResult) {
        match self {
            Sink::BufRing(slot) => slot.settle(Ok(result)),
            Sink::Int { slot, pool } => {
                warn!("buffer-selected completion for a plain operation");
                slot.settle(Err(Error::Kernel {
                    kind: ErrorKind::InvalidBuffer,
                    errno: libc::ENOBUFS,
                }));
                pool.reclaim(slot);
            }
            Sink::EventFd => {}
        }
    }

    pub(crate) fn fail(self, err: Error) {
        match self {
            Sink::Int { slot, pool } => {
                slot.settle(Err(err));
                pool.reclaim(slot);
            }
            Sink::BufRing(slot) => slot.settle(Err(err)),
            Sink::EventFd => {}
        }
    }

    pub(crate) fn is_event_fd(&self) -> bool {
        matches!(self, Sink::EventFd)
    }
}

/// The asynchronous result of a scheduled operation carrying an integer
/// payload (byte count, new descriptor, or zero).
///
/// Await it from async code or call [`wait`](IoFuture::wait) to block the
/// current thread. Dropping it without consuming abandons the result; the
/// operation itself still runs to completion.
pub struct IoFuture {
    slot: Option<Arc<OneShot<i32>>>,
    pool: Option<Arc<SinkPool>>,
}

impl IoFuture {
    pub(crate) fn pooled(slot: Arc<OneShot<i32>>, pool: Arc<SinkPool>) -> Self {
        Self {
            slot: Some(slot),
            pool: Some(pool),
        }
    }

    /// Block the calling thread until the operation settles.
    pub fn wait(mut self) -> Result<i32> {
        let slot = self.slot.take().expect("result slot already consumed");
        let result = slot.wait();
        if let Some(pool) = self.pool.take() {
            pool.reclaim(slot);
        }
        result
    }
}

impl Future for IoFuture {
    type Output = Result<i32>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.slot {
            Some(slot) => slot.poll_take(cx),
            None => Poll::Pending,
        }
    }
}

impl Drop for IoFuture {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Some(pool) = self.pool.take() {
                pool.reclaim(slot);
            }
        }
    }
}

impl std::fmt::Debug for IoFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoFuture").finish_non_exhaustive()
    }
}

/// The asynchronous result of a buffer-select read.
pub struct BufRingFuture {
    slot: Option<Arc<OneShot<BufRingResult>>>,
}

impl BufRingFuture {
    pub(crate) fn new(slot: Arc<OneShot<BufRingResult>>) -> Self {
        Self { slot: Some(slot) }
    }

    /// Block the calling thread until the read settles.
    pub fn wait(mut self) -> Result<BufRingResult> {
        let slot = self.slot.take().expect("result slot already consumed");
        slot.wait()
    }
}

impl Future for BufRingFuture {
    type Output = Result<BufRingResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.slot {
            Some(slot) => slot.poll_take(cx),
            None => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for BufRingFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufRingFuture").finish_non_exhaustive()
    }
}

/// Bytes delivered through a kernel-selected buffer.
///
/// The data lives in buffer-ring memory owned by the engine. Dropping the
/// result (or calling [`close`](BufRingResult::close)) recycles the buffer
/// id back to the kernel; until then the buffer cannot be selected again.
/// Consume results before shutting the engine down; the backing memory is
/// released with the rings.
pub struct BufRingResult {
    ptr: *const u8,
    len: usize,
    bid: u16,
    side: RingSide,
    engine: Engine,
    recycled: bool,
}

// The buffer id is un-armed while this result holds it, so the kernel
// cannot write the region concurrently; the engine handle keeps the
// mapping alive.
unsafe impl Send for BufRingResult {}

impl BufRingResult {
    pub(crate) fn new(ptr: *const u8, len: usize, bid: u16, side: RingSide, engine: Engine) -> Self {
        Self {
            ptr,
            len,
            bid,
            side,
            engine,
            recycled: false,
        }
    }

    /// The bytes the kernel read into the selected buffer.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Which buffer the kernel picked.
    pub fn buffer_id(&self) -> u16 {
        self.bid
    }

    /// Recycle the buffer now instead of at drop.
    pub fn close(mut self) {
        self.recycle_now();
    }

    fn recycle_now(&mut self) {
        if self.recycled {
            return;
        }
        self.recycled = true;
        let side = self.side;
        let bid = self.bid;
        // After shutdown the buffer ring is gone with the engine; nothing
        // to hand back.
        let _ = self
            .engine
            .execute(Box::new(move |r| r.ring_mut(side).recycle_buffer(bid)));
    }
}

impl std::ops::Deref for BufRingResult {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for BufRingResult {
    fn drop(&mut self) {
        self.recycle_now();
    }
}

impl std::fmt::Debug for BufRingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufRingResult")
            .field("len", &self.len)
            .field("buffer_id", &self.bid)
            .finish()
    }
}
