//! The engine's loop thread.
//!
//! Exactly one thread runs here per engine. It is the only writer of ring
//! memory, the correlation tables, and submitted commands; everything else
//! reaches it through the task queue. Each pass drains completions and
//! tasks to a fixed point, then submits whatever is pending. The loop may
//! park in the kernel wait only when there is provably nothing to do, and
//! it never exits on a failure short of an explicit stop.

use crate::engine::command::Command;
use crate::engine::{lock, Engine, RingSide, Shared, STATE_AWAKE, STATE_STOP, STATE_WAIT};
use crate::error::Error;
use crate::ring::Ring;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pause after a loop-level failure before resuming; keeps one poisoned
/// pass from spinning the thread at full speed.
const FAILURE_PAUSE: Duration = Duration::from_secs(1);

pub(crate) struct Reactor {
    pub(crate) sleepable: Ring,
    pub(crate) poll: Ring,
    shared: Arc<Shared>,
    event_fd: RawFd,
    /// Target of the wakeup read; the value itself is never inspected.
    event_fd_buf: Box<u64>,
    eventfd_armed: bool,
}

impl Reactor {
    pub(crate) fn new(sleepable: Ring, poll: Ring, shared: Arc<Shared>, event_fd: RawFd) -> Self {
        Self {
            sleepable,
            poll,
            shared,
            event_fd,
            event_fd_buf: Box::new(0),
            eventfd_armed: false,
        }
    }

    pub(crate) fn ring_mut(&mut self, side: RingSide) -> &mut Ring {
        match side {
            RingSide::Sleepable => &mut self.sleepable,
            RingSide::Poll => &mut self.poll,
        }
    }

    fn engine(&self) -> Engine {
        Engine::from_shared(self.shared.clone())
    }

    /// Route and enqueue a borrowed command; scheduling tasks land here.
    pub(crate) fn register_command(&mut self, key: usize) {
        let shared = self.shared.clone();
        let Some((is_plain_rw, pollable)) = shared.pool.route_info(key) else {
            warn!(key, "task for a command that is no longer in the pool");
            return;
        };

        let side = if is_plain_rw && pollable == crate::engine::command::Pollable::Pollable {
            RingSide::Poll
        } else {
            RingSide::Sleepable
        };

        if let Err(e) = self.ring_mut(side).submit_command(key, &shared.pool) {
            if let Some(cmd) = shared.pool.take(key) {
                warn!(key, error = %e, "could not enqueue operation");
                cmd.sink.fail(e);
            }
        }
    }

    /// Keep a read armed on the eventfd so a parked kernel wait can be
    /// broken by any waker thread.
    fn arm_event_fd_read(&mut self) {
        let addr = &*self.event_fd_buf as *const u64 as u64;
        let key = self
            .shared
            .pool
            .insert(Command::event_fd_read(self.event_fd, addr));
        match self.sleepable.submit_command(key, &self.shared.pool) {
            Ok(_) => self.eventfd_armed = true,
            Err(e) => {
                self.shared.pool.take(key);
                error!(error = %e, "failed to arm the wakeup read");
            }
        }
    }

    fn process_completions(&mut self) -> usize {
        let engine = self.engine();
        let sleepable = self.sleepable.drain(&self.shared.pool, &engine);
        let poll = self.poll.drain(&self.shared.pool, &engine);

        if sleepable.rearm_eventfd {
            self.eventfd_armed = false;
            if self.shared.state() != STATE_STOP {
                self.arm_event_fd_read();
            }
        }
        sleepable.count + poll.count
    }

    fn run_all_tasks(&mut self) -> bool {
        let shared = self.shared.clone();
        let mut ran = false;
        loop {
            let Some(task) = lock(&shared.tasks).pop_front() else {
                return ran;
            };
            ran = true;
            if catch_unwind(AssertUnwindSafe(|| task(self))).is_err() {
                error!("engine task panicked, pausing before resuming");
                std::thread::sleep(FAILURE_PAUSE);
            }
        }
    }

    fn submit_io(&mut self) {
        if self.sleepable.has_pending() {
            if let Err(e) = self.sleepable.submit() {
                handle_loop_error(&e);
            }
        }
        // The poll ring is driven even without new entries: its
        // completions only surface through the enter syscall.
        if self.poll.has_pending() || self.poll.has_in_kernel() {
            if let Err(e) = self.poll.submit() {
                handle_loop_error(&e);
            }
        }
    }

    /// One drain-to-fixed-point pass followed by a submit. Returns whether
    /// anything was processed.
    fn drain(&mut self) -> bool {
        let mut any = false;
        loop {
            let processed = self.process_completions();
            let ran = self.run_all_tasks();
            if processed == 0 && !ran {
                break;
            }
            any = true;
        }
        self.submit_io();
        any
    }

    /// The loop may block in the kernel wait only with no queued tasks, no
    /// unread completions, and no busy-poll work outstanding.
    fn can_sleep(&self) -> bool {
        !self.shared.has_tasks()
            && !self.sleepable.has_completions()
            && !self.poll.has_completions()
            && !self.poll.has_in_kernel()
    }

    /// In-kernel operations on the blocking ring besides the wakeup read.
    fn outstanding_sleepable(&self) -> u32 {
        self.sleepable
            .in_kernel()
            .saturating_sub(self.eventfd_armed as u32)
    }

    /// Run everything queued or outstanding to quiescence. Nothing
    /// submitted before the stop request may be lost, so this waits out
    /// in-kernel operations instead of abandoning them.
    fn final_drain(&mut self) {
        loop {
            self.drain();

            let quiet = !self.shared.has_tasks()
                && !self.sleepable.has_completions()
                && !self.poll.has_completions();
            if quiet && self.outstanding_sleepable() == 0 && !self.poll.has_in_kernel() {
                break;
            }
            if quiet && self.outstanding_sleepable() > 0 && !self.poll.has_in_kernel() {
                // Only blocking-ring work is left; wait for it instead of
                // spinning.
                if let Err(e) = self.sleepable.submit_and_wait() {
                    handle_loop_error(&e);
                }
            }
        }
    }

    fn close(&mut self) {
        debug!(live_commands = self.shared.pool.len(), "closing rings");
        self.sleepable.abort_inflight(&self.shared.pool);
        self.poll.abort_inflight(&self.shared.pool);
        self.sleepable.close();
        self.poll.close();
    }
}

pub(crate) fn run(mut reactor: Reactor) {
    let shared = reactor.shared.clone();
    info!(
        entries = shared.config.entries,
        sq_poll = shared.config.sq_poll,
        buf_ring = shared.config.buf_ring.is_some(),
        "engine loop started"
    );

    reactor.arm_event_fd_read();
    let sleep_timeout = shared.config.sleep_timeout;
    let mut last_park = Instant::now();

    loop {
        let _ = shared.state.compare_exchange(
            STATE_AWAKE,
            STATE_WAIT,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if shared.state() == STATE_WAIT
            && reactor.can_sleep()
            && last_park.elapsed() >= sleep_timeout
        {
            if let Err(e) = reactor.sleepable.submit_and_wait() {
                handle_loop_error(&e);
            }
            last_park = Instant::now();
        }

        let _ = shared.state.compare_exchange(
            STATE_WAIT,
            STATE_AWAKE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        reactor.drain();

        if shared.state() == STATE_STOP {
            reactor.final_drain();
            reactor.close();
            break;
        }
    }

    info!("engine loop stopped");
}

fn handle_loop_error(err: &Error) {
    error!(error = %err, "engine loop failure, pausing before resuming");
    std::thread::sleep(FAILURE_PAUSE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::command::{Command, Pollable};
    use crate::engine::future::{IoFuture, Sink};
    use crate::ring::test_support::{fake_ring, push_cqe, FakeRing};
    use crate::sys;
    use std::sync::atomic::AtomicUsize;

    /// A reactor over fabricated ring memory. Both fakes carry the SQPOLL
    /// flag so submits publish without crossing into the kernel.
    struct Fixture {
        reactor: Reactor,
        sleepable: FakeRing,
        poll: FakeRing,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let sleepable = fake_ring(4, sys::IORING_SETUP_SQPOLL);
        let poll = fake_ring(4, sys::IORING_SETUP_SQPOLL);
        let engine = Engine::test_stub();
        let reactor = Reactor::new(
            Ring::for_test(sleepable.raw.clone_for_test(), None, RingSide::Sleepable),
            Ring::for_test(poll.raw.clone_for_test(), None, RingSide::Poll),
            engine.shared.clone(),
            -1,
        );
        Fixture {
            reactor,
            sleepable,
            poll,
            engine,
        }
    }

    fn int_sink(engine: &Engine) -> (Sink, IoFuture) {
        let slot = engine.shared.sinks.acquire();
        (
            Sink::Int {
                slot: slot.clone(),
                pool: engine.shared.sinks.clone(),
            },
            IoFuture::pooled(slot, engine.shared.sinks.clone()),
        )
    }

    #[test]
    fn test_pollable_reads_route_to_poll_ring() {
        let mut fx = fixture();
        let (sink, _fut) = int_sink(&fx.engine);

        let key = fx
            .engine
            .shared
            .pool
            .insert(Command::read(3, 0x1000, 512, 0, Pollable::Pollable, sink));
        fx.reactor.register_command(key);

        assert!(fx.reactor.poll.has_in_kernel());
        assert!(!fx.reactor.sleepable.has_in_kernel());
    }

    #[test]
    fn test_non_pollable_and_non_rw_route_to_sleepable_ring() {
        let mut fx = fixture();

        let (sink, _fut) = int_sink(&fx.engine);
        let read = fx
            .engine
            .shared
            .pool
            .insert(Command::read(3, 0x1000, 512, 0, Pollable::NonPollable, sink));
        fx.reactor.register_command(read);

        let (sink, _fut) = int_sink(&fx.engine);
        let sync = fx.engine.shared.pool.insert(Command::data_sync(3, sink));
        fx.reactor.register_command(sync);

        assert_eq!(fx.reactor.sleepable.in_kernel(), 2);
        assert!(!fx.reactor.poll.has_in_kernel());
    }

    #[test]
    fn test_drain_runs_queued_tasks_to_fixed_point() {
        let mut fx = fixture();
        let hits = Arc::new(AtomicUsize::new(0));

        // The first task queues a second one; a single drain pass must
        // still run both.
        let outer = hits.clone();
        let inner = hits.clone();
        let engine = fx.engine.clone();
        fx.engine
            .execute(Box::new(move |_| {
                outer.fetch_add(1, Ordering::SeqCst);
                let inner = inner.clone();
                let _ = engine.execute(Box::new(move |_| {
                    inner.fetch_add(1, Ordering::SeqCst);
                }));
            }))
            .unwrap();

        assert!(fx.reactor.drain());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!fx.reactor.drain());
    }

    #[test]
    fn test_can_sleep_predicate() {
        let mut fx = fixture();
        assert!(fx.reactor.can_sleep());

        // A queued task keeps the loop awake.
        fx.engine.execute(Box::new(|_| {})).unwrap();
        assert!(!fx.reactor.can_sleep());
        fx.reactor.drain();
        assert!(fx.reactor.can_sleep());

        // So does anything outstanding on the busy-poll ring, which has
        // no wake path of its own.
        let (sink, fut) = int_sink(&fx.engine);
        let key = fx
            .engine
            .shared
            .pool
            .insert(Command::write(3, 0x2000, 512, 0, Pollable::Pollable, sink));
        fx.reactor.register_command(key);
        assert!(!fx.reactor.can_sleep());

        push_cqe(&mut fx.poll, 0, 512, 0);
        fx.reactor.drain();
        assert!(fx.reactor.can_sleep());
        assert_eq!(fut.wait().unwrap(), 512);
    }

    #[test]
    fn test_final_drain_delivers_outstanding_work() {
        let mut fx = fixture();

        let (sink, fut) = int_sink(&fx.engine);
        let key = fx
            .engine
            .shared
            .pool
            .insert(Command::read(3, 0x1000, 512, 0, Pollable::NonPollable, sink));
        fx.reactor.register_command(key);
        push_cqe(&mut fx.sleepable, 0, 512, 0);

        // A task queued before the stop must run too.
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = ran.clone();
        fx.engine
            .execute(Box::new(move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        fx.reactor.final_drain();

        assert_eq!(fut.wait().unwrap(), 512);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(fx.engine.shared.pool.len(), 0);
    }
}
