//! The dual-ring engine.
//!
//! An [`Engine`] is an explicit, cloneable handle to one loop thread that
//! owns two kernel rings: a sleepable ring that parks in the kernel wait
//! and is woken through an eventfd, and a busy-poll ring for direct-I/O
//! reads and writes on pollable files. Scheduling calls may be made from
//! any thread; each returns an asynchronous result immediately and the
//! loop thread does every ring mutation.
//!
//! Routing: plain reads and writes on pollable files go to the poll ring;
//! every other operation, including all opens, closes, syncs, allocations
//! and unlinks, goes to the sleepable ring.

pub(crate) mod command;
pub(crate) mod event_loop;
pub(crate) mod future;
pub(crate) mod pool;

use crate::buffer::IovecArray;
use crate::config::EngineConfig;
use crate::engine::command::Command;
use crate::engine::event_loop::Reactor;
use crate::engine::future::{BufRingFuture, IoFuture, OneShot, Sink, SinkPool};
use crate::engine::pool::CommandPool;
use crate::error::{Error, Result};
use crate::ring::Ring;
use crate::sys;
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::warn;

pub use command::Pollable;

pub(crate) const STATE_WAIT: u8 = 0;
pub(crate) const STATE_AWAKE: u8 = 1;
pub(crate) const STATE_STOP: u8 = 2;

/// Which physical ring an operation was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RingSide {
    Sleepable,
    Poll,
}

/// Work executed on the loop thread.
pub(crate) type Task = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) struct Shared {
    pub(crate) state: AtomicU8,
    pub(crate) tasks: Mutex<VecDeque<Task>>,
    pub(crate) pool: CommandPool,
    pub(crate) sinks: Arc<SinkPool>,
    pub(crate) config: EngineConfig,
    event_fd: RawFd,
    sleepable_fd: RawFd,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    loop_id: OnceLock<ThreadId>,
}

impl Shared {
    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn has_tasks(&self) -> bool {
        !lock(&self.tasks).is_empty()
    }
}

/// Handle to a running engine. Clones share the same loop thread; pass one
/// to every collaborator instead of stashing an instance in a global.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Start configuring an engine.
    pub fn builder() -> crate::config::EngineBuilder {
        crate::config::EngineBuilder::new()
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Engine {
        Engine { shared }
    }

    /// Create both rings and spawn the loop thread. Called by the builder
    /// after validation and the kernel-version check.
    pub(crate) fn start(config: EngineConfig) -> Result<Engine> {
        let event_fd = sys::event_fd().map_err(Error::Setup)?;

        let sleepable = match Ring::new(&config, 0, RingSide::Sleepable) {
            Ok(ring) => ring,
            Err(e) => {
                sys::close_fd(event_fd);
                return Err(e);
            }
        };
        let poll = match Ring::new(&config, sys::IORING_SETUP_IOPOLL, RingSide::Poll) {
            Ok(ring) => ring,
            Err(e) => {
                let mut sleepable = sleepable;
                sleepable.close();
                sys::close_fd(event_fd);
                return Err(e);
            }
        };

        let command_capacity = config.entries as usize * 2;
        let shared = Arc::new(Shared {
            state: AtomicU8::new(STATE_AWAKE),
            tasks: Mutex::new(VecDeque::new()),
            pool: CommandPool::new(command_capacity),
            sinks: Arc::new(SinkPool::new(128)),
            config,
            event_fd,
            sleepable_fd: sleepable.fd(),
            loop_thread: Mutex::new(None),
            loop_id: OnceLock::new(),
        });

        let reactor = Reactor::new(sleepable, poll, shared.clone(), event_fd);
        let handle = thread::Builder::new()
            .name("io-engine".into())
            .spawn(move || event_loop::run(reactor))
            .map_err(Error::Setup)?;

        let _ = shared.loop_id.set(handle.thread().id());
        *lock(&shared.loop_thread) = Some(handle);

        Ok(Engine { shared })
    }

    fn in_loop(&self) -> bool {
        self.shared.loop_id.get().copied() == Some(thread::current().id())
    }

    /// Run `task` on the loop thread. From the loop thread itself the task
    /// is queued without a wake and runs within the current drain pass;
    /// from any other thread a parked loop is woken, once per busy period.
    pub(crate) fn execute(&self, task: Task) -> Result<()> {
        if self.shared.state() == STATE_STOP {
            return Err(Error::Shutdown);
        }
        lock(&self.shared.tasks).push_back(task);
        if !self.in_loop() {
            self.wake();
        }
        Ok(())
    }

    fn wake(&self) {
        if self
            .shared
            .state
            .compare_exchange(STATE_WAIT, STATE_AWAKE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Err(e) = sys::event_fd_write(self.shared.event_fd, 1) {
                warn!(error = %e, "wakeup write failed");
            }
        }
    }

    fn submit(&self, cmd: Command) -> Result<()> {
        let key = self.shared.pool.insert(cmd);
        if let Err(e) = self.execute(Box::new(move |r: &mut Reactor| r.register_command(key))) {
            // Never reached the loop; free the slot so nothing leaks.
            self.shared.pool.take(key);
            return Err(e);
        }
        Ok(())
    }

    fn int_sink(&self) -> (Sink, IoFuture) {
        let slot = self.shared.sinks.acquire();
        let sink = Sink::Int {
            slot: slot.clone(),
            pool: self.shared.sinks.clone(),
        };
        (sink, IoFuture::pooled(slot, self.shared.sinks.clone()))
    }

    /// Read `len` bytes from `fd` at `offset` into the caller's buffer.
    /// The buffer must stay alive and unmoved until the future settles.
    pub fn read(
        &self,
        fd: RawFd,
        buf_addr: u64,
        offset: i64,
        len: u32,
        pollable: Pollable,
    ) -> Result<IoFuture> {
        validate_buffer(buf_addr, offset)?;
        let (sink, fut) = self.int_sink();
        self.submit(Command::read(fd, buf_addr, len, offset as u64, pollable, sink))?;
        Ok(fut)
    }

    /// Write `len` bytes from the caller's buffer to `fd` at `offset`.
    pub fn write(
        &self,
        fd: RawFd,
        buf_addr: u64,
        offset: i64,
        len: u32,
        pollable: Pollable,
    ) -> Result<IoFuture> {
        validate_buffer(buf_addr, offset)?;
        let (sink, fut) = self.int_sink();
        self.submit(Command::write(fd, buf_addr, len, offset as u64, pollable, sink))?;
        Ok(fut)
    }

    /// Scatter a read across the iovec list.
    pub fn read_vectored(&self, fd: RawFd, iovecs: IovecArray, offset: i64) -> Result<IoFuture> {
        validate_offset(offset)?;
        let (sink, fut) = self.int_sink();
        self.submit(Command::read_vectored(fd, iovecs, offset as u64, sink))?;
        Ok(fut)
    }

    /// Gather a write from the iovec list.
    pub fn write_vectored(&self, fd: RawFd, iovecs: IovecArray, offset: i64) -> Result<IoFuture> {
        validate_offset(offset)?;
        let (sink, fut) = self.int_sink();
        self.submit(Command::write_vectored(fd, iovecs, offset as u64, sink))?;
        Ok(fut)
    }

    /// Read through a buffer registered with the kernel at `buf_index`.
    pub fn read_fixed(
        &self,
        fd: RawFd,
        buf_addr: u64,
        offset: i64,
        len: u32,
        buf_index: u16,
        pollable: Pollable,
    ) -> Result<IoFuture> {
        validate_buffer(buf_addr, offset)?;
        let (sink, fut) = self.int_sink();
        self.submit(Command::read_fixed(
            fd,
            buf_addr,
            len,
            offset as u64,
            buf_index,
            pollable,
            sink,
        ))?;
        Ok(fut)
    }

    /// Write through a buffer registered with the kernel at `buf_index`.
    pub fn write_fixed(
        &self,
        fd: RawFd,
        buf_addr: u64,
        offset: i64,
        len: u32,
        buf_index: u16,
        pollable: Pollable,
    ) -> Result<IoFuture> {
        validate_buffer(buf_addr, offset)?;
        let (sink, fut) = self.int_sink();
        self.submit(Command::write_fixed(
            fd,
            buf_addr,
            len,
            offset as u64,
            buf_index,
            pollable,
            sink,
        ))?;
        Ok(fut)
    }

    /// Read at `offset` letting the kernel pick a buffer from the
    /// registered buffer ring; the result carries the selected buffer.
    pub fn read_buf_ring(&self, fd: RawFd, offset: i64, pollable: Pollable) -> Result<BufRingFuture> {
        validate_offset(offset)?;
        let spec = self.shared.config.buf_ring.ok_or_else(|| {
            Error::InvalidArgument("engine was built without a buffer ring".into())
        })?;

        let slot = Arc::new(OneShot::new());
        let fut = BufRingFuture::new(slot.clone());
        self.submit(Command::read_buf_ring(
            fd,
            spec.buf_size as u32,
            offset as u64,
            spec.bgid,
            pollable,
            Sink::BufRing(slot),
        ))?;
        Ok(fut)
    }

    /// Open a file; the future resolves to the new descriptor.
    pub fn open_at(&self, path: &Path, open_flags: i32, mode: u32) -> Result<IoFuture> {
        let path = path_to_cstring(path)?;
        let (sink, fut) = self.int_sink();
        self.submit(Command::open_at(path, open_flags, mode, sink))?;
        Ok(fut)
    }

    /// Close a descriptor asynchronously.
    pub fn close_fd(&self, fd: RawFd) -> Result<IoFuture> {
        let (sink, fut) = self.int_sink();
        self.submit(Command::close_fd(fd, sink))?;
        Ok(fut)
    }

    /// Flush file data to the device (fdatasync semantics).
    pub fn data_sync(&self, fd: RawFd) -> Result<IoFuture> {
        let (sink, fut) = self.int_sink();
        self.submit(Command::data_sync(fd, sink))?;
        Ok(fut)
    }

    /// Preallocate `size` bytes from `offset` so later writes in that
    /// range cannot fail for lack of space.
    pub fn pre_allocate(&self, fd: RawFd, size: u64, offset: u64) -> Result<IoFuture> {
        let (sink, fut) = self.int_sink();
        self.submit(Command::pre_allocate(fd, size, offset, sink))?;
        Ok(fut)
    }

    /// Remove a name from the filesystem.
    pub fn unlink(&self, path: &Path) -> Result<IoFuture> {
        let path = path_to_cstring(path)?;
        let (sink, fut) = self.int_sink();
        self.submit(Command::unlink(path, sink))?;
        Ok(fut)
    }

    /// Submit a no-op through the full scheduling path; completes with 0.
    pub fn no_op(&self) -> Result<IoFuture> {
        let (sink, fut) = self.int_sink();
        self.submit(Command::no_op(sink))?;
        Ok(fut)
    }

    /// Descriptor of the sleepable ring, for collaborators that issue
    /// their own registration calls against it.
    pub fn sleepable_ring_fd(&self) -> RawFd {
        self.shared.sleepable_fd
    }

    /// Stop the engine: queued tasks run, outstanding operations complete
    /// and deliver, then both rings are closed and the loop thread joins.
    /// Idempotent; scheduling after this fails with a shutdown error.
    pub fn shutdown(&self) {
        let prev = self.shared.state.swap(STATE_STOP, Ordering::AcqRel);
        if prev != STATE_STOP {
            if let Err(e) = sys::event_fd_write(self.shared.event_fd, 1) {
                warn!(error = %e, "shutdown wakeup write failed");
            }
        }
        let handle = lock(&self.shared.loop_thread).take();
        if let Some(handle) = handle {
            let _ = handle.join();
            sys::close_fd(self.shared.event_fd);
        }
    }

    #[cfg(test)]
    pub(crate) fn test_stub() -> Engine {
        use std::time::Duration;
        Engine {
            shared: Arc::new(Shared {
                state: AtomicU8::new(STATE_AWAKE),
                tasks: Mutex::new(VecDeque::new()),
                pool: CommandPool::new(4),
                sinks: Arc::new(SinkPool::new(4)),
                config: EngineConfig {
                    entries: 4,
                    sq_poll: false,
                    sq_thread_idle: 0,
                    sq_aff: false,
                    sq_thread_cpu: 0,
                    cq_size: None,
                    clamp: false,
                    attach_wq: None,
                    buf_ring: None,
                    sleep_timeout: Duration::ZERO,
                },
                event_fd: -1,
                sleepable_fd: -1,
                loop_thread: Mutex::new(None),
                loop_id: OnceLock::new(),
            }),
        }
    }
}

fn validate_offset(offset: i64) -> Result<()> {
    if offset < 0 {
        return Err(Error::InvalidArgument(format!(
            "offset must be non-negative, got {}",
            offset
        )));
    }
    Ok(())
}

fn validate_buffer(buf_addr: u64, offset: i64) -> Result<()> {
    if buf_addr == 0 {
        return Err(Error::InvalidArgument("buffer address is null".into()));
    }
    validate_offset(offset)
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidArgument("path contains an interior NUL byte".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_validation_rejects_null_buffer() {
        let err = validate_buffer(0, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptedSubmission);
    }

    #[test]
    fn test_validation_rejects_negative_offset() {
        assert!(validate_buffer(0x1000, -1).is_err());
        assert!(validate_offset(-512).is_err());
        assert!(validate_offset(0).is_ok());
        assert!(validate_buffer(0x1000, i64::MAX).is_ok());
    }

    #[test]
    fn test_path_conversion() {
        assert!(path_to_cstring(Path::new("/tmp/a")).is_ok());
        let with_nul = std::ffi::OsStr::from_bytes(b"/tmp/\0bad");
        assert!(path_to_cstring(Path::new(with_nul)).is_err());
    }

    #[test]
    fn test_stub_rejects_after_stop() {
        let engine = Engine::test_stub();
        engine.shared.state.store(STATE_STOP, Ordering::Release);
        let err = engine.execute(Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[test]
    fn test_read_buf_ring_requires_configuration() {
        let engine = Engine::test_stub();
        let err = engine
            .read_buf_ring(1, 0, Pollable::NonPollable)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptedSubmission);
    }
}
