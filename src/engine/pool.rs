//! Command pool.
//!
//! In-flight commands live in a slab: borrowing is an insert that returns
//! the slot key, releasing is a remove that drops the command and every
//! field with it, so no state leaks into the next borrower. The slab keeps
//! a warm reserve sized for the configured ring depth and only allocates
//! past it under sustained overload.

use crate::engine::command::{Command, Pollable};
use crate::ring::sq::Sqe;
use slab::Slab;
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct CommandPool {
    inner: Mutex<Slab<Command>>,
}

impl CommandPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Slab::with_capacity(capacity)),
        }
    }

    /// Borrow a slot and populate it; returns the pool key used as the
    /// command's identity until release.
    pub(crate) fn insert(&self, cmd: Command) -> usize {
        lock(&self.inner).insert(cmd)
    }

    /// Release the slot, taking the command out. Returns `None` if the key
    /// is stale, which means a completion was delivered twice upstream.
    pub(crate) fn take(&self, key: usize) -> Option<Command> {
        lock(&self.inner).try_remove(key)
    }

    /// The submission entry for a borrowed command.
    pub(crate) fn sqe_for(&self, key: usize, token: u32) -> Option<Sqe> {
        lock(&self.inner).get(key).map(|cmd| cmd.to_sqe(token))
    }

    /// Routing inputs of a borrowed command.
    pub(crate) fn route_info(&self, key: usize) -> Option<(bool, Pollable)> {
        lock(&self.inner)
            .get(key)
            .map(|cmd| (cmd.is_plain_rw(), cmd.pollable))
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::future::Sink;

    #[test]
    fn test_insert_take_reuses_slots() {
        let pool = CommandPool::new(4);

        let k1 = pool.insert(Command::no_op(Sink::EventFd));
        let k2 = pool.insert(Command::close_fd(9, Sink::EventFd));
        assert_ne!(k1, k2);
        assert_eq!(pool.len(), 2);

        let cmd = pool.take(k1).unwrap();
        assert_eq!(cmd.op, crate::sys::IORING_OP_NOP);
        assert_eq!(pool.len(), 1);

        // A released key cannot deliver twice.
        assert!(pool.take(k1).is_none());

        // The freed slot is reused for the next borrow.
        let k3 = pool.insert(Command::no_op(Sink::EventFd));
        assert_eq!(k3, k1);
    }

    #[test]
    fn test_sqe_for_borrowed_command() {
        let pool = CommandPool::new(4);
        let key = pool.insert(Command::read(
            3,
            0x1000,
            512,
            0,
            Pollable::NonPollable,
            Sink::EventFd,
        ));

        let sqe = pool.sqe_for(key, 77).unwrap();
        assert_eq!(sqe.user_data, 77);
        assert_eq!(sqe.fd, 3);

        let (is_rw, pollable) = pool.route_info(key).unwrap();
        assert!(is_rw);
        assert_eq!(pollable, Pollable::NonPollable);

        pool.take(key).unwrap();
        assert!(pool.sqe_for(key, 0).is_none());
        assert!(pool.route_info(key).is_none());
    }
}
