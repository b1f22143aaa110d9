//! miniloop: a minimal readiness-based I/O reactor
//!
//! This crate provides a small, single-threaded event loop layered with a
//! backpressure-aware streaming reader for socket-like descriptors:
//!
//! - [`EventLoop`] blocks on the kernel readiness facility (epoll) and
//!   dispatches each ready event to its registered callback
//! - [`EventSource`] is one registered interest (readable, writable, or a
//!   timer) with a suspend/resume/cancel lifecycle
//! - [`SocketSource`] consumes readiness signals, performs non-blocking reads,
//!   and forwards byte chunks to a [`Downstream`] consumer through a
//!   demand/acknowledgement protocol, throttling its own registration when the
//!   consumer is not keeping up
//!
//! The crate is Linux-only; the kqueue backend for other Unix systems is
//! structurally identical and intentionally out of scope.
//!
//! ## Scheduling model
//!
//! Everything is single-threaded and cooperative. One thread owns an
//! [`EventLoop`] and drives it by calling [`EventLoop::run`] in a loop; every
//! callback executes synchronously on that thread, one at a time. The only
//! blocking operation is the kernel wait inside `run`; a callback that blocks
//! stalls the loop and every source sharing it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use miniloop::EventLoop;
//!
//! let event_loop = EventLoop::new("worker-0").unwrap();
//! let timer = event_loop
//!     .on_timeout(std::time::Duration::from_millis(100), |_| println!("tick"))
//!     .unwrap();
//! timer.resume().unwrap();
//! loop {
//!     event_loop.run();
//! }
//! ```

#![deny(warnings)]

pub mod config;
pub mod reactor;
pub mod socket;
pub mod source;
pub mod stream;

// Re-export core types
pub use reactor::EventLoop;
pub use socket::{set_nonblocking, FdSocket, ReadOutcome, Socket, SocketSource};
pub use source::EventSource;
pub use stream::{Ack, Downstream};

/// Error types for the reactor
pub mod error {
    use std::os::unix::io::RawFd;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("failed to create kernel event queue: {0}")]
        Setup(#[source] std::io::Error),

        #[error("failed to create timer descriptor: {0}")]
        Timer(#[source] std::io::Error),

        #[error("failed to register descriptor {fd}: {source}")]
        Register {
            fd: RawFd,
            #[source]
            source: std::io::Error,
        },

        #[error("failed to update registration for descriptor {fd}: {source}")]
        Rearm {
            fd: RawFd,
            #[source]
            source: std::io::Error,
        },

        #[error("event loop has been dropped")]
        LoopGone,
    }

    pub type Result<T> = std::result::Result<T, Error>;

    /// Convert a raw errno into the `std::io` error the public API reports.
    pub(crate) fn errno_io(errno: nix::errno::Errno) -> std::io::Error {
        std::io::Error::from_raw_os_error(errno as i32)
    }
}
