//! One kernel ring pair and the correlation state for the operations
//! routed to it.
//!
//! A `Ring` composes the submission and completion queues over one mapped
//! ring, an optional registered buffer ring, the token sequencer and the
//! token-to-command table. Tokens are 32-bit wrapping sequence numbers;
//! wrap-around is safe because a token is retired long before the sequence
//! comes back around, with outstanding work bounded by ring capacity.

pub(crate) mod buf_ring;
pub(crate) mod cq;
pub(crate) mod mem;
pub(crate) mod sq;

use crate::engine::future::BufRingResult;
use crate::engine::pool::CommandPool;
use crate::engine::{Engine, RingSide};
use crate::error::{Error, ErrorKind, Result};
use crate::sys::{self, RawRing};
use buf_ring::BufRing;
use cq::CompletionQueue;
use sq::SubmissionQueue;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DrainOutcome {
    pub count: usize,
    /// The loop's wakeup read completed and needs re-arming.
    pub rearm_eventfd: bool,
}

pub(crate) struct Ring {
    raw: RawRing,
    sq: SubmissionQueue,
    cq: CompletionQueue,
    buf_ring: Option<BufRing>,
    inflight: HashMap<u32, usize>,
    sequencer: u32,
    side: RingSide,
    closed: bool,
}

impl Ring {
    /// Set up a kernel ring with the configured parameters plus
    /// `extra_flags` (the poll ring adds IOPOLL here).
    pub(crate) fn new(
        cfg: &crate::config::EngineConfig,
        extra_flags: u32,
        side: RingSide,
    ) -> Result<Ring> {
        let raw = sys::setup_ring(
            cfg.entries,
            cfg.setup_flags() | extra_flags,
            cfg.sq_thread_idle,
            cfg.sq_thread_cpu,
            cfg.cq_entries(),
            cfg.wq_fd(),
        )
        .map_err(Error::Setup)?;

        let buf_ring = match &cfg.buf_ring {
            Some(spec) => match BufRing::new(raw.fd, spec) {
                Ok(b) => Some(b),
                Err(e) => {
                    sys::close_ring(&raw);
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(Self::assemble(raw, buf_ring, side))
    }

    fn assemble(raw: RawRing, buf_ring: Option<BufRing>, side: RingSide) -> Ring {
        let sq = SubmissionQueue::new(&raw);
        let cq = CompletionQueue::new(&raw);
        let capacity = sq.capacity() as usize;
        Ring {
            raw,
            sq,
            cq,
            buf_ring,
            inflight: HashMap::with_capacity(capacity),
            sequencer: 0,
            side,
            closed: false,
        }
    }

    /// Assemble a ring over caller-provided regions; used by tests that
    /// fabricate ring memory instead of asking the kernel for it.
    #[cfg(test)]
    pub(crate) fn for_test(raw: RawRing, buf_ring: Option<BufRing>, side: RingSide) -> Ring {
        Self::assemble(raw, buf_ring, side)
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.raw.fd
    }

    /// Mint a token, register the command under it, and write its entry
    /// into the submission ring. Returns whether a forced submit happened.
    pub(crate) fn submit_command(&mut self, key: usize, pool: &CommandPool) -> Result<bool> {
        let token = self.sequencer;
        self.sequencer = self.sequencer.wrapping_add(1);

        let Some(sqe) = pool.sqe_for(key, token) else {
            warn!(key, "submitting a command that is no longer in the pool");
            return Ok(false);
        };

        self.inflight.insert(token, key);
        match self.sq.enqueue(&sqe) {
            Ok(forced) => Ok(forced),
            Err(e) => {
                self.inflight.remove(&token);
                Err(e)
            }
        }
    }

    /// Drain all visible completions, delivering each to its command.
    pub(crate) fn drain(&mut self, pool: &CommandPool, engine: &Engine) -> DrainOutcome {
        let mut rearm_eventfd = false;
        let Ring {
            cq,
            inflight,
            buf_ring,
            side,
            ..
        } = self;
        let side = *side;

        let count = cq.process(|res, flags, user_data| {
            let token = user_data as u32;
            let Some(key) = inflight.remove(&token) else {
                warn!(token, "completion for an unknown token");
                return;
            };
            let Some(cmd) = pool.take(key) else {
                warn!(token, key, "completion for a released command");
                return;
            };

            if cmd.sink.is_event_fd() {
                rearm_eventfd = true;
                return;
            }

            if res >= 0 {
                if flags & sys::IORING_CQE_F_BUFFER != 0 {
                    let bid = (flags >> sys::IORING_CQE_BUFFER_SHIFT) as u16;
                    match buf_ring {
                        Some(br) => {
                            br.note_selected(bid);
                            debug_assert!(res as usize <= br.buffer_size());
                            let result = BufRingResult::new(
                                br.buffer_ptr(bid),
                                res as usize,
                                bid,
                                side,
                                engine.clone(),
                            );
                            cmd.sink.succeed_buf(result);
                        }
                        None => {
                            warn!(bid, "buffer-selected completion without a buffer ring");
                            cmd.sink.fail(Error::Kernel {
                                kind: ErrorKind::InvalidBuffer,
                                errno: libc::ENOBUFS,
                            });
                        }
                    }
                } else {
                    cmd.sink.succeed_int(res);
                }
            } else {
                cmd.sink.fail(Error::from_errno(-res));
            }
        });

        DrainOutcome {
            count,
            rearm_eventfd,
        }
    }

    /// Hand a consumed buffer id back to the kernel's selectable set.
    pub(crate) fn recycle_buffer(&mut self, bid: u16) {
        match &mut self.buf_ring {
            Some(br) => br.recycle(bid),
            None => warn!(bid, "recycle on a ring without a buffer ring"),
        }
    }

    pub(crate) fn submit(&mut self) -> Result<u32> {
        self.sq.submit()
    }

    pub(crate) fn submit_and_wait(&mut self) -> Result<u32> {
        self.sq.submit_and_wait()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.sq.has_pending()
    }

    pub(crate) fn has_completions(&self) -> bool {
        self.cq.has_completions()
    }

    /// Entries handed to this ring but not yet reaped, counting entries
    /// still pending submission as well.
    pub(crate) fn in_kernel(&self) -> u32 {
        self.sq.tail().wrapping_sub(self.cq.head())
    }

    pub(crate) fn has_in_kernel(&self) -> bool {
        self.in_kernel() != 0
    }

    #[cfg(test)]
    pub(crate) fn buf_ring(&self) -> Option<&BufRing> {
        self.buf_ring.as_ref()
    }

    /// Fail everything still registered; used on teardown after the final
    /// drain so no sink is left permanently pending.
    pub(crate) fn abort_inflight(&mut self, pool: &CommandPool) {
        for (token, key) in self.inflight.drain() {
            if let Some(cmd) = pool.take(key) {
                debug!(token, "aborting an operation at ring close");
                cmd.sink.fail(Error::Shutdown);
            }
        }
    }

    /// Flush, tear down the buffer ring if one was constructed, unmap and
    /// close the kernel ring.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sq.submit() {
            debug!(error = %e, "final flush failed at ring close");
        }
        // Guarded: not every construction carries a buffer ring.
        if let Some(br) = &mut self.buf_ring {
            br.close(self.raw.fd);
        }
        self.buf_ring = None;
        sys::close_ring(&self.raw);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{fake_ring, push_cqe};
    use super::*;
    use crate::config::BufRingSpec;
    use crate::engine::command::{Command, Pollable};
    use crate::engine::future::{BufRingFuture, IoFuture, OneShot, Sink, SinkPool};
    use std::sync::Arc;

    fn int_sink(pool: &Arc<SinkPool>) -> (Sink, IoFuture) {
        let slot = pool.acquire();
        (
            Sink::Int {
                slot: slot.clone(),
                pool: pool.clone(),
            },
            IoFuture::pooled(slot, pool.clone()),
        )
    }

    #[test]
    fn test_kernel_error_settles_sink_and_frees_command() {
        let mut fake = fake_ring(4, 0);
        let mut ring = Ring::for_test(fake.raw.clone_for_test(), None, RingSide::Sleepable);
        let pool = CommandPool::new(4);
        let sinks = Arc::new(SinkPool::new(4));
        let engine = Engine::test_stub();

        let (sink, fut) = int_sink(&sinks);
        let key = pool.insert(Command::read(3, 0x1000, 512, 0, Pollable::NonPollable, sink));
        ring.submit_command(key, &pool).unwrap();
        assert_eq!(pool.len(), 1);

        // The kernel reports EINVAL for token 0.
        push_cqe(&mut fake, 0, -22, 0);
        let outcome = ring.drain(&pool, &engine);
        assert_eq!(outcome.count, 1);

        let err = fut.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptedSubmission);
        assert_eq!(err.errno(), Some(22));

        // The command slot is free for the next borrower.
        assert_eq!(pool.len(), 0);
        let key2 = pool.insert(Command::no_op(Sink::EventFd));
        assert_eq!(key2, key);
    }

    #[test]
    fn test_tokens_complete_exactly_once() {
        let mut fake = fake_ring(4, 0);
        let mut ring = Ring::for_test(fake.raw.clone_for_test(), None, RingSide::Sleepable);
        let pool = CommandPool::new(4);
        let sinks = Arc::new(SinkPool::new(4));
        let engine = Engine::test_stub();

        let (sink, fut) = int_sink(&sinks);
        let key = pool.insert(Command::read(3, 0x1000, 512, 0, Pollable::NonPollable, sink));
        ring.submit_command(key, &pool).unwrap();

        // The same token delivered twice: the second is dropped.
        push_cqe(&mut fake, 0, 512, 0);
        push_cqe(&mut fake, 0, 512, 0);
        let outcome = ring.drain(&pool, &engine);
        assert_eq!(outcome.count, 2);
        assert_eq!(fut.wait().unwrap(), 512);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_unknown_token_is_skipped() {
        let mut fake = fake_ring(4, 0);
        let mut ring = Ring::for_test(fake.raw.clone_for_test(), None, RingSide::Sleepable);
        let pool = CommandPool::new(4);
        let engine = Engine::test_stub();

        push_cqe(&mut fake, 999, 1, 0);
        let outcome = ring.drain(&pool, &engine);
        assert_eq!(outcome.count, 1);
    }

    #[test]
    fn test_buffer_selected_completion_resolves_buffer() {
        let mut fake = fake_ring(4, 0);
        let spec = BufRingSpec::new(4096, 4);
        let br = BufRing::with_region(&spec).unwrap();
        // Pretend the kernel filled buffer 2 with known bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(b"ring data".as_ptr(), br.buffer_ptr(2), 9);
        }
        let mut ring = Ring::for_test(fake.raw.clone_for_test(), Some(br), RingSide::Sleepable);
        let pool = CommandPool::new(4);
        let engine = Engine::test_stub();

        let slot = Arc::new(OneShot::new());
        let fut = BufRingFuture::new(slot.clone());
        let key = pool.insert(Command::read_buf_ring(
            3,
            4096,
            0,
            0,
            Pollable::NonPollable,
            Sink::BufRing(slot),
        ));
        ring.submit_command(key, &pool).unwrap();

        push_cqe(
            &mut fake,
            0,
            9,
            sys::IORING_CQE_F_BUFFER | (2 << sys::IORING_CQE_BUFFER_SHIFT),
        );
        ring.drain(&pool, &engine);

        assert_eq!(ring.buf_ring().unwrap().armed(), 3);
        let result = fut.wait().unwrap();
        assert_eq!(result.buffer_id(), 2);
        assert_eq!(result.as_slice(), b"ring data");
        drop(result);
    }

    #[test]
    fn test_eventfd_completion_requests_rearm() {
        let mut fake = fake_ring(4, 0);
        let mut ring = Ring::for_test(fake.raw.clone_for_test(), None, RingSide::Sleepable);
        let pool = CommandPool::new(4);
        let engine = Engine::test_stub();

        let key = pool.insert(Command::event_fd_read(5, 0x3000));
        ring.submit_command(key, &pool).unwrap();
        assert!(ring.has_in_kernel());

        push_cqe(&mut fake, 0, 8, 0);
        let outcome = ring.drain(&pool, &engine);
        assert!(outcome.rearm_eventfd);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_abort_inflight_fails_pending_sinks() {
        let fake = fake_ring(4, 0);
        let mut ring = Ring::for_test(fake.raw.clone_for_test(), None, RingSide::Sleepable);
        let pool = CommandPool::new(4);
        let sinks = Arc::new(SinkPool::new(4));

        let (sink, fut) = int_sink(&sinks);
        let key = pool.insert(Command::read(3, 0x1000, 512, 0, Pollable::NonPollable, sink));
        ring.submit_command(key, &pool).unwrap();

        ring.abort_inflight(&pool);
        assert!(matches!(fut.wait(), Err(Error::Shutdown)));
        assert_eq!(pool.len(), 0);
    }
}
