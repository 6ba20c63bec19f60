//! furrow: asynchronous file I/O on io_uring.
//!
//! A single background loop thread owns two kernel rings and turns
//! scheduling calls into submission entries: a sleepable ring that parks
//! in the kernel wait and wakes through an eventfd, and a busy-poll ring
//! for direct-I/O reads and writes. Callers get a one-shot result handle
//! back immediately and may block on it or await it.
//!
//! ```no_run
//! use furrow::{AlignedBuf, BufferedFile, Engine, OpenOptions};
//!
//! let engine = Engine::builder().entries(128).build()?;
//! let file = BufferedFile::open(&engine, "/tmp/data.bin", &OpenOptions::new())?;
//!
//! let mut buf = AlignedBuf::page_aligned(4096)?;
//! let read = file.read_at(&mut buf, 0, 4096)?.wait()?;
//! println!("read {} bytes", read);
//!
//! engine.shutdown();
//! # Ok::<(), furrow::Error>(())
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("this crate drives io_uring and only builds on Linux");

mod buffer;
mod config;
mod engine;
mod error;
mod file;
mod ring;
mod sys;

pub use buffer::{AlignedBuf, IovecArray};
pub use config::{BufRingSpec, EngineBuilder, MAX_ENTRIES};
pub use engine::future::{BufRingFuture, BufRingResult, IoFuture};
pub use engine::{Engine, Pollable};
pub use error::{Error, ErrorKind, Result};
pub use file::{BufferedFile, DmaFile, OpenOptions};
