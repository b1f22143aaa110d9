//! Event source lifecycle: one registered interest with suspend/resume/cancel.
//!
//! A source starts inactive: it exists in the kernel but delivers nothing
//! until resumed. `suspend` masks delivery without discarding the
//! registration, `resume` re-enables it, and `cancel` is terminal: it clears
//! the loop's arena slot synchronously, so a kernel event already queued for
//! the source resolves to nothing instead of a dead object.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use nix::sys::epoll::EpollFlags;
use nix::sys::timerfd::TimerFd;

use crate::error::{errno_io, Error, Result};
use crate::reactor::{pack_tag, LoopInner};

/// The condition a source is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterestKind {
    Readable,
    Writable,
    Timer,
}

impl InterestKind {
    fn flags(self) -> EpollFlags {
        match self {
            // Timer sources are readiness on the timer descriptor.
            InterestKind::Readable | InterestKind::Timer => EpollFlags::EPOLLIN,
            InterestKind::Writable => EpollFlags::EPOLLOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Active,
    Suspended,
    Cancelled,
}

pub(crate) struct SourceInner {
    owner: Weak<LoopInner>,
    fd: RawFd,
    kind: InterestKind,
    /// Keeps the timer descriptor alive for timer sources.
    timer: Option<TimerFd>,
    key: usize,
    generation: u32,
    state: Cell<Lifecycle>,
    callback: RefCell<Box<dyn FnMut(bool)>>,
}

impl SourceInner {
    pub(crate) fn new(
        owner: Weak<LoopInner>,
        fd: RawFd,
        kind: InterestKind,
        timer: Option<TimerFd>,
        key: usize,
        generation: u32,
        callback: Box<dyn FnMut(bool)>,
    ) -> Self {
        Self {
            owner,
            fd,
            kind,
            timer,
            key,
            generation,
            state: Cell::new(Lifecycle::Created),
            callback: RefCell::new(callback),
        }
    }

    fn tag(&self) -> u64 {
        pack_tag(self.key, self.generation)
    }

    /// Invoke the owned callback for one dispatched readiness event.
    ///
    /// Cancelled sources swallow the event: the kernel may have queued it
    /// before cancellation ran.
    pub(crate) fn signal(&self, hangup_or_error: bool) {
        if self.state.get() == Lifecycle::Cancelled {
            return;
        }
        if self.timer.is_some() {
            // Drain the expiration counter so the level-triggered
            // registration does not stay readable forever.
            let mut expirations = [0u8; 8];
            let _ = nix::unistd::read(self.fd, &mut expirations);
        }
        (self.callback.borrow_mut())(hangup_or_error);
    }
}

/// A cancellable, suspendable registration of interest in one condition on
/// one descriptor.
///
/// All methods are synchronous and safe to call from inside any readiness
/// callback on the owning thread, including this source's own.
pub struct EventSource {
    inner: Rc<SourceInner>,
}

impl EventSource {
    pub(crate) fn from_inner(inner: Rc<SourceInner>) -> Self {
        Self { inner }
    }

    /// Enable kernel delivery for this source's interest.
    ///
    /// The first call after creation starts delivery; calling on an active
    /// source is a no-op, and a cancelled source stays cancelled.
    pub fn resume(&self) -> Result<()> {
        match self.inner.state.get() {
            Lifecycle::Active | Lifecycle::Cancelled => Ok(()),
            Lifecycle::Created | Lifecycle::Suspended => {
                let owner = self.inner.owner.upgrade().ok_or(Error::LoopGone)?;
                owner
                    .rearm(self.inner.fd, self.inner.kind.flags(), self.inner.tag())
                    .map_err(|e| Error::Rearm {
                        fd: self.inner.fd,
                        source: errno_io(e),
                    })?;
                self.inner.state.set(Lifecycle::Active);
                Ok(())
            }
        }
    }

    /// Mask kernel delivery without discarding the registration.
    ///
    /// No-op unless the source is currently active. The kernel still reports
    /// error/hangup conditions on a masked registration; those arrive as a
    /// signal with the hangup flag set.
    pub fn suspend(&self) -> Result<()> {
        match self.inner.state.get() {
            Lifecycle::Active => {
                let owner = self.inner.owner.upgrade().ok_or(Error::LoopGone)?;
                owner
                    .rearm(self.inner.fd, EpollFlags::empty(), self.inner.tag())
                    .map_err(|e| Error::Rearm {
                        fd: self.inner.fd,
                        source: errno_io(e),
                    })?;
                self.inner.state.set(Lifecycle::Suspended);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Permanently remove the registration. Idempotent.
    ///
    /// The arena slot is cleared synchronously, before anything else can run,
    /// so a kernel event already queued for this source is dropped at
    /// dispatch instead of being delivered. Cancellation is reported to the
    /// callback as one final signal with the flag set, unless `cancel` is
    /// invoked from inside the callback itself, which already knows.
    pub fn cancel(&self) {
        if self.inner.state.get() == Lifecycle::Cancelled {
            return;
        }
        self.inner.state.set(Lifecycle::Cancelled);
        if let Some(owner) = self.inner.owner.upgrade() {
            owner.deregister(self.inner.key, self.inner.generation, self.inner.fd);
        }
        if let Ok(mut callback) = self.inner.callback.try_borrow_mut() {
            (callback)(true);
        }
    }

    /// Whether the source has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.get() == Lifecycle::Cancelled
    }
}
