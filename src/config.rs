//! Engine configuration.
//!
//! A builder collects the ring setup parameters, validates them, and
//! constructs the engine. Validation failures and the minimum-kernel check
//! both happen before any ring is created.

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::sys;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Entry-count cap for a single ring.
pub const MAX_ENTRIES: u32 = 4096;

/// Parameters of the registered buffer ring shared with the kernel.
#[derive(Debug, Clone, Copy)]
pub struct BufRingSpec {
    /// Size of each buffer in bytes.
    pub buf_size: usize,
    /// Number of buffers; must be a power of two.
    pub count: u16,
    /// Buffer group id used on buffer-select reads.
    pub bgid: u16,
}

impl BufRingSpec {
    /// A spec with the default buffer group id.
    pub fn new(buf_size: usize, count: u16) -> Self {
        Self {
            buf_size,
            count,
            bgid: 0,
        }
    }
}

/// Builder for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    entries: u32,
    sq_poll: bool,
    sq_thread_idle: u32,
    sq_aff: bool,
    sq_thread_cpu: u32,
    cq_size: Option<u32>,
    clamp: bool,
    attach_wq: Option<RawFd>,
    buf_ring: Option<BufRingSpec>,
    sleep_timeout: Duration,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            entries: 4096,
            sq_poll: false,
            sq_thread_idle: 0,
            sq_aff: false,
            sq_thread_cpu: 0,
            cq_size: None,
            clamp: false,
            attach_wq: None,
            buf_ring: None,
            sleep_timeout: Duration::ZERO,
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of submission entries per ring; a power of two up to 4096.
    pub fn entries(mut self, entries: u32) -> Self {
        self.entries = entries;
        self
    }

    /// Enable kernel-side submission polling with the given idle timeout.
    /// A polling kernel thread consumes entries without an enter syscall
    /// per submission, at the cost of a busy CPU while active.
    pub fn sq_poll(mut self, idle_ms: u32) -> Self {
        self.sq_poll = true;
        self.sq_thread_idle = idle_ms;
        self
    }

    /// Bind the submission-polling kernel thread to a CPU. Only meaningful
    /// together with [`sq_poll`](Self::sq_poll).
    pub fn sq_poll_cpu(mut self, cpu: u32) -> Self {
        self.sq_aff = true;
        self.sq_thread_cpu = cpu;
        self
    }

    /// Request a completion queue larger than the submission queue.
    pub fn cq_size(mut self, cq_size: u32) -> Self {
        self.cq_size = Some(cq_size);
        self
    }

    /// Clamp oversized entry counts instead of failing setup.
    pub fn clamp(mut self) -> Self {
        self.clamp = true;
        self
    }

    /// Share the async worker backend of an existing ring.
    pub fn attach_wq(mut self, ring_fd: RawFd) -> Self {
        self.attach_wq = Some(ring_fd);
        self
    }

    /// Register a buffer ring on both rings for buffer-select reads.
    pub fn buf_ring(mut self, spec: BufRingSpec) -> Self {
        self.buf_ring = Some(spec);
        self
    }

    /// How long the loop spins after going idle before it parks in the
    /// kernel wait. Zero parks immediately.
    pub fn sleep_timeout(mut self, timeout: Duration) -> Self {
        self.sleep_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.entries == 0 || !self.entries.is_power_of_two() || self.entries > MAX_ENTRIES {
            return Err(Error::InvalidArgument(format!(
                "entries must be a power of two up to {}, got {}",
                MAX_ENTRIES, self.entries
            )));
        }
        if let Some(cq_size) = self.cq_size {
            if cq_size < self.entries {
                return Err(Error::InvalidArgument(format!(
                    "cq_size {} must be at least the entry count {}",
                    cq_size, self.entries
                )));
            }
        }
        if self.sq_aff && !self.sq_poll {
            return Err(Error::InvalidArgument(
                "sq_poll_cpu is only meaningful together with sq_poll".into(),
            ));
        }
        if let Some(spec) = &self.buf_ring {
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
        }
        Ok(())
    }

    /// Validate, check the running kernel, create both rings and start the
    /// loop thread.
    pub fn build(self) -> Result<Engine> {
        self.validate()?;

        let release = sys::kernel_version().map_err(Error::Setup)?;
        if !sys::kernel_supported(&release) {
            return Err(Error::UnsupportedKernel(release));
        }

        Engine::start(EngineConfig {
            entries: self.entries,
            sq_poll: self.sq_poll,
            sq_thread_idle: self.sq_thread_idle,
            sq_aff: self.sq_aff,
            sq_thread_cpu: self.sq_thread_cpu,
            cq_size: self.cq_size,
            clamp: self.clamp,
            attach_wq: self.attach_wq,
            buf_ring: self.buf_ring,
            sleep_timeout: self.sleep_timeout,
        })
    }
}

/// Resolved configuration handed to the engine.
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    pub entries: u32,
    pub sq_poll: bool,
    pub sq_thread_idle: u32,
    pub sq_aff: bool,
    pub sq_thread_cpu: u32,
    pub cq_size: Option<u32>,
    pub clamp: bool,
    pub attach_wq: Option<RawFd>,
    pub buf_ring: Option<BufRingSpec>,
    pub sleep_timeout: Duration,
}

impl EngineConfig {
    /// Base setup flags; the poll ring adds IOPOLL on top.
    pub(crate) fn setup_flags(&self) -> u32 {
        let mut flags = 0;
        if self.sq_poll {
            flags |= sys::IORING_SETUP_SQPOLL;
        }
        if self.sq_aff {
            flags |= sys::IORING_SETUP_SQ_AFF;
        }
        if self.cq_size.is_some() {
            flags |= sys::IORING_SETUP_CQSIZE;
        }
        if self.clamp {
            flags |= sys::IORING_SETUP_CLAMP;
        }
        if self.attach_wq.is_some() {
            flags |= sys::IORING_SETUP_ATTACH_WQ;
        }
        flags
    }

    pub(crate) fn cq_entries(&self) -> u32 {
        self.cq_size.unwrap_or(0)
    }

    pub(crate) fn wq_fd(&self) -> u32 {
        self.attach_wq.unwrap_or(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_builder_is_valid() {
        assert!(EngineBuilder::default().validate().is_ok());
    }

    #[test]
    fn test_entries_must_be_power_of_two() {
        assert!(EngineBuilder::new().entries(100).validate().is_err());
        assert!(EngineBuilder::new().entries(0).validate().is_err());
        assert!(EngineBuilder::new().entries(8192).validate().is_err());
        assert!(EngineBuilder::new().entries(16).validate().is_ok());
    }

    #[test]
    fn test_cq_size_must_cover_entries() {
        assert!(EngineBuilder::new()
            .entries(128)
            .cq_size(64)
            .validate()
            .is_err());
        assert!(EngineBuilder::new()
            .entries(128)
            .cq_size(256)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_affinity_requires_sq_poll() {
        assert!(EngineBuilder::new().sq_poll_cpu(1).validate().is_err());
        assert!(EngineBuilder::new()
            .sq_poll(1000)
            .sq_poll_cpu(1)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_buf_ring_spec_validation() {
        assert!(EngineBuilder::new()
            .buf_ring(BufRingSpec::new(4096, 3))
            .validate()
            .is_err());
        assert!(EngineBuilder::new()
            .buf_ring(BufRingSpec::new(0, 4))
            .validate()
            .is_err());
        assert!(EngineBuilder::new()
            .buf_ring(BufRingSpec::new(4096, 4))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_setup_flags() {
        let cfg = EngineConfig {
            entries: 64,
            sq_poll: true,
            sq_thread_idle: 100,
            sq_aff: true,
            sq_thread_cpu: 2,
            cq_size: Some(128),
            clamp: true,
            attach_wq: None,
            buf_ring: None,
            sleep_timeout: Duration::ZERO,
        };
        let flags = cfg.setup_flags();
        assert!(flags & sys::IORING_SETUP_SQPOLL != 0);
        assert!(flags & sys::IORING_SETUP_SQ_AFF != 0);
        assert!(flags & sys::IORING_SETUP_CQSIZE != 0);
        assert!(flags & sys::IORING_SETUP_CLAMP != 0);
        assert!(flags & sys::IORING_SETUP_ATTACH_WQ == 0);
        assert_eq!(cfg.cq_entries(), 128);
    }
}
