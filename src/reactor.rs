//! The event loop: kernel readiness wait and dispatch.
//!
//! An [`EventLoop`] owns the epoll handle for its whole lifetime (the
//! descriptor is closed when the loop is dropped) plus a fixed-capacity batch
//! buffer of raw kernel events. Each `run` cycle blocks until at least one
//! event is ready, then dispatches every ready event in kernel-delivery order
//! to its associated [`EventSource`].
//!
//! Sources are resolved through an arena rather than a raw back-reference
//! embedded in the kernel event: the epoll tag packs a slot index and a
//! generation counter, and cancellation clears the slot. A pending kernel
//! event whose slot is missing or whose generation is stale therefore
//! resolves to "no source" and is skipped silently, never to freed memory
//! and never to an unrelated source that happens to reuse the slot.

use std::cell::{Cell, RefCell};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use slab::Slab;

use crate::config;
use crate::error::{errno_io, Error, Result};
use crate::source::{EventSource, InterestKind, SourceInner};

/// A single-threaded readiness-based event loop.
///
/// Cloning yields another handle to the same loop; exactly one thread is
/// expected to drive [`run`](EventLoop::run).
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

pub(crate) struct LoopInner {
    /// Diagnostic label, carried through log lines.
    label: String,
    epoll: Epoll,
    /// Batch buffer reused across `run` cycles.
    events: RefCell<Vec<EpollEvent>>,
    sources: RefCell<Slab<Registration>>,
    generation: Cell<u32>,
}

struct Registration {
    generation: u32,
    source: Rc<SourceInner>,
}

/// Pack a slot index and its generation into the epoll `u64` tag.
pub(crate) fn pack_tag(key: usize, generation: u32) -> u64 {
    ((generation as u64) << 32) | key as u64
}

fn unpack_tag(tag: u64) -> (usize, u32) {
    ((tag & u32::MAX as u64) as usize, (tag >> 32) as u32)
}

fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    // The registry removes a descriptor from epoll before its owner closes
    // it, so the borrow never outlives the open descriptor.
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl EventLoop {
    /// Create a new event loop with the given diagnostic label.
    ///
    /// Fails if the kernel event queue cannot be created; this is a
    /// recoverable error at the call site.
    pub fn new(label: &str) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| Error::Setup(errno_io(e)))?;
        Ok(Self {
            inner: Rc::new(LoopInner {
                label: label.to_string(),
                epoll,
                events: RefCell::new(vec![EpollEvent::empty(); config::MAX_EVENTS_PER_CYCLE]),
                sources: RefCell::new(Slab::new()),
                generation: Cell::new(0),
            }),
        })
    }

    /// The loop's diagnostic label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Register interest in `fd` becoming readable.
    ///
    /// The returned source does not deliver events until
    /// [`resume`](EventSource::resume) is called. The callback receives `true`
    /// when the event carries a kernel error/hangup condition or when the
    /// source is cancelled, `false` for plain readiness.
    pub fn on_readable<F>(&self, fd: RawFd, callback: F) -> Result<EventSource>
    where
        F: FnMut(bool) + 'static,
    {
        self.register(fd, InterestKind::Readable, None, Box::new(callback))
    }

    /// Register interest in `fd` becoming writable.
    pub fn on_writable<F>(&self, fd: RawFd, callback: F) -> Result<EventSource>
    where
        F: FnMut(bool) + 'static,
    {
        self.register(fd, InterestKind::Writable, None, Box::new(callback))
    }

    /// Register a repeating timer with the given interval.
    ///
    /// The timer is backed by its own descriptor and fires every `interval`
    /// once resumed. Expirations that accumulate while the source is
    /// suspended coalesce into a single signal on resume.
    pub fn on_timeout<F>(&self, interval: Duration, callback: F) -> Result<EventSource>
    where
        F: FnMut(bool) + 'static,
    {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|e| Error::Timer(errno_io(e)))?;
        timer
            .set(
                Expiration::Interval(TimeSpec::from_duration(interval)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(|e| Error::Timer(errno_io(e)))?;
        let fd = timer.as_fd().as_raw_fd();
        self.register(fd, InterestKind::Timer, Some(timer), Box::new(callback))
    }

    fn register(
        &self,
        fd: RawFd,
        kind: InterestKind,
        timer: Option<TimerFd>,
        callback: Box<dyn FnMut(bool)>,
    ) -> Result<EventSource> {
        let mut sources = self.inner.sources.borrow_mut();
        let generation = self.inner.generation.get().wrapping_add(1);
        self.inner.generation.set(generation);

        let entry = sources.vacant_entry();
        let key = entry.key();
        debug_assert!(key <= u32::MAX as usize, "source arena exceeded tag range");

        // Registered with an empty interest mask: present in the kernel but
        // delivering nothing until the source is resumed. The kernel still
        // reports error/hangup on a masked registration, which dispatch
        // forwards as a hangup signal.
        self.inner
            .epoll
            .add(borrowed(fd), EpollEvent::new(EpollFlags::empty(), pack_tag(key, generation)))
            .map_err(|e| Error::Register {
                fd,
                source: errno_io(e),
            })?;

        let source = Rc::new(SourceInner::new(
            Rc::downgrade(&self.inner),
            fd,
            kind,
            timer,
            key,
            generation,
            callback,
        ));
        entry.insert(Registration {
            generation,
            source: source.clone(),
        });
        tracing::debug!(
            "loop `{}` registered {:?} source for fd {}",
            self.inner.label,
            kind,
            fd
        );
        Ok(EventSource::from_inner(source))
    }

    /// Block until at least one event is ready, then dispatch the whole
    /// batch. Returns the number of sources signalled; returns `0` early if
    /// the wait was interrupted by a signal.
    ///
    /// A kernel wait failure is unrecoverable and panics: it indicates a
    /// misused or corrupted kernel handle, not a data-dependent condition.
    /// Calling `run` from inside a readiness callback is a misuse and also
    /// panics.
    pub fn run(&self) -> usize {
        self.run_inner(EpollTimeout::NONE)
    }

    /// Like [`run`](EventLoop::run), but gives up after `timeout` when
    /// nothing becomes ready.
    pub fn run_timeout(&self, timeout: Duration) -> usize {
        // The kernel timeout is in milliseconds and caps at i32::MAX.
        let capped = timeout.min(Duration::from_millis(i32::MAX as u64));
        let timeout = EpollTimeout::try_from(capped).unwrap_or(EpollTimeout::ZERO);
        self.run_inner(timeout)
    }

    fn run_inner(&self, timeout: EpollTimeout) -> usize {
        let mut events = self
            .inner
            .events
            .try_borrow_mut()
            .expect("EventLoop::run invoked from inside a readiness callback");

        let ready = match self.inner.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => return 0,
            Err(e) => panic!(
                "kernel wait failed on event loop `{}`: {}",
                self.inner.label, e
            ),
        };

        let mut signalled = 0;
        for event in events.iter().take(ready) {
            let (key, generation) = unpack_tag(event.data());
            let source = {
                let sources = self.inner.sources.borrow();
                sources
                    .get(key)
                    .filter(|r| r.generation == generation)
                    .map(|r| r.source.clone())
            };
            // A missing or recycled slot means the source was cancelled after
            // the kernel queued this event; skipping it is expected.
            let Some(source) = source else { continue };
            let hangup = event
                .events()
                .intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);
            source.signal(hangup);
            signalled += 1;
        }
        signalled
    }
}

impl LoopInner {
    /// Replace the interest mask for an already-registered descriptor.
    pub(crate) fn rearm(&self, fd: RawFd, flags: EpollFlags, tag: u64) -> std::result::Result<(), Errno> {
        let mut event = EpollEvent::new(flags, tag);
        self.epoll.modify(borrowed(fd), &mut event)
    }

    /// Remove a source's registration: clear the arena slot first so a
    /// pending kernel event can no longer resolve to it, then drop the
    /// kernel-side registration.
    pub(crate) fn deregister(&self, key: usize, generation: u32, fd: RawFd) {
        let removed = {
            let mut sources = self.sources.borrow_mut();
            match sources.get(key) {
                Some(r) if r.generation == generation => {
                    sources.remove(key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            if let Err(e) = self.epoll.delete(borrowed(fd)) {
                // The descriptor may already be gone (closed by its owner);
                // the slot is cleared either way.
                tracing::debug!("loop `{}` could not delete fd {} from epoll: {}", self.label, fd, e);
            }
            tracing::debug!("loop `{}` deregistered fd {}", self.label, fd);
        }
    }
}
