//! Socket-to-stream adapter with demand-driven flow control.
//!
//! A [`SocketSource`] subscribes to read-readiness on one descriptor,
//! performs one non-blocking read per signal, and forwards the bytes to a
//! [`Downstream`] consumer. Flow control is the point: at most one chunk is
//! outstanding at any time, a readiness signal that arrives while the
//! consumer has not acknowledged is only counted, and once
//! [`EXCESS_SIGNAL_THRESHOLD`](crate::config::EXCESS_SIGNAL_THRESHOLD)
//! consecutive signals go ignored the underlying registration is suspended
//! until the acknowledgement resumes it.

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use bytes::BytesMut;
use nix::errno::Errno;

use crate::config;
use crate::error::{errno_io, Result};
use crate::reactor::EventLoop;
use crate::source::EventSource;
use crate::stream::{Ack, Downstream};

/// Result of one non-blocking read attempt.
pub enum ReadOutcome {
    /// `n` bytes were read; zero means end-of-data.
    Read(usize),
    /// The descriptor was not actually ready (spurious wakeup). Not an error.
    WouldBlock,
}

/// The socket capability consumed by [`SocketSource`].
///
/// `read` must never block the caller; a descriptor that is not ready
/// reports [`ReadOutcome::WouldBlock`].
pub trait Socket {
    /// The kernel descriptor readiness is registered on.
    fn descriptor(&self) -> RawFd;

    /// Total byte length for bounded sources such as files; `None` for
    /// open-ended streams.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Read into `buf` without blocking.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;

    /// Release the descriptor.
    fn close(&mut self);
}

/// A [`Socket`] over an owned non-blocking descriptor, optionally bounded.
pub struct FdSocket {
    fd: Option<OwnedFd>,
    size: Option<u64>,
}

impl FdSocket {
    /// Wrap an open-ended descriptor such as a pipe or socket.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd: Some(fd), size: None }
    }

    /// Wrap a descriptor with a known total byte length.
    pub fn bounded(fd: OwnedFd, size: u64) -> Self {
        Self {
            fd: Some(fd),
            size: Some(size),
        }
    }
}

impl Socket for FdSocket {
    fn descriptor(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let Some(fd) = self.fd.as_ref() else {
            return Ok(ReadOutcome::Read(0));
        };
        match nix::unistd::read(fd.as_raw_fd(), buf) {
            Ok(n) => Ok(ReadOutcome::Read(n)),
            Err(Errno::EAGAIN) => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(errno_io(e)),
        }
    }

    fn close(&mut self) {
        self.fd = None;
    }
}

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(errno_io)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(errno_io)?;
    Ok(())
}

/// Backpressure-aware adapter from a [`Socket`] to a [`Downstream`] stream.
pub struct SocketSource {
    state: Rc<RefCell<Inner>>,
}

struct Inner {
    socket: Option<Box<dyn Socket>>,
    source: Option<EventSource>,
    downstream: Option<Box<dyn Downstream>>,
    /// Reused for every read; its allocation is reclaimed once the previous
    /// chunk has been dropped by the consumer.
    buf: BytesMut,
    buf_size: usize,
    /// Bytes left to deliver for bounded sources; may go negative when a
    /// read crosses the boundary, treated as "nothing left".
    remaining: Option<i64>,
    closed: bool,
    /// At most one read-result is awaiting downstream acknowledgement.
    downstream_ready: bool,
    /// Set while the consumer is checked out for a delivery. An error raised
    /// during that window (a synchronously failed acknowledgement) is stashed
    /// in `pending_error` and flushed when the delivery returns.
    delivering: bool,
    pending_error: Option<io::Error>,
    suspended: bool,
    /// Consecutive readiness signals received while the downstream was not
    /// ready.
    excess_signals: u32,
    /// Keeps the loop alive while the stream is open.
    _event_loop: EventLoop,
}

impl SocketSource {
    /// Turn `socket` into a stream source on `event_loop` with the default
    /// read-buffer size.
    ///
    /// The source stays suspended until a consumer [`attach`]es.
    ///
    /// [`attach`]: SocketSource::attach
    pub fn new(event_loop: &EventLoop, socket: Box<dyn Socket>) -> Result<Self> {
        Self::with_buffer_size(event_loop, socket, config::DEFAULT_READ_BUFFER_SIZE)
    }

    /// Like [`new`](SocketSource::new) with an explicit buffer size.
    pub fn with_buffer_size(
        event_loop: &EventLoop,
        socket: Box<dyn Socket>,
        buffer_size: usize,
    ) -> Result<Self> {
        let fd = socket.descriptor();
        let remaining = socket.size().map(|s| s as i64);
        let state = Rc::new(RefCell::new(Inner {
            socket: Some(socket),
            source: None,
            downstream: None,
            buf: BytesMut::with_capacity(buffer_size),
            buf_size: buffer_size,
            remaining,
            closed: false,
            downstream_ready: true,
            delivering: false,
            pending_error: None,
            suspended: true,
            excess_signals: 0,
            _event_loop: event_loop.clone(),
        }));

        let weak = Rc::downgrade(&state);
        let source = event_loop.on_readable(fd, move |hangup_or_cancel| {
            if let Some(state) = weak.upgrade() {
                Self::on_signal(&state, hangup_or_cancel);
            }
        })?;
        state.borrow_mut().source = Some(source);
        Ok(Self { state })
    }

    /// Set the downstream consumer and start (or restart) delivery.
    ///
    /// If the stream already closed, the consumer is handed its close
    /// notification immediately and nothing is stored.
    pub fn attach(&self, mut downstream: Box<dyn Downstream>) {
        let mut inner = self.state.borrow_mut();
        if inner.closed {
            drop(inner);
            downstream.close();
            return;
        }
        inner.downstream = Some(downstream);
        inner.resume_source();
    }

    /// Tear the stream down: cancel the readiness source, close the socket,
    /// close the downstream, drop the references. Idempotent, and safe to
    /// call from inside a readiness callback or a downstream delivery.
    pub fn close(&self) {
        Self::close_state(&self.state);
    }

    /// Whether the stream has terminated.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    fn on_signal(state: &Rc<RefCell<Inner>>, hangup_or_cancel: bool) {
        if state.borrow().closed {
            return;
        }
        if hangup_or_cancel {
            // The descriptor is gone or the source was cancelled; no more
            // signals will ever arrive.
            Self::close_state(state);
            return;
        }
        let read_now = {
            let mut inner = state.borrow_mut();
            if inner.downstream_ready && inner.downstream.is_some() {
                inner.excess_signals = 0;
                true
            } else {
                inner.excess_signals += 1;
                if inner.excess_signals >= config::EXCESS_SIGNAL_THRESHOLD {
                    inner.suspend_source();
                }
                false
            }
        };
        if read_now {
            Self::read_data(state);
        }
    }

    /// One non-blocking read, performed only on a fresh readiness signal.
    fn read_data(state: &Rc<RefCell<Inner>>) {
        let outcome = {
            let mut inner = state.borrow_mut();
            let Inner {
                socket, buf, buf_size, ..
            } = &mut *inner;
            let Some(socket) = socket.as_mut() else { return };
            buf.reserve(*buf_size);
            buf.resize(*buf_size, 0);
            socket.read(&mut buf[..])
        };
        match outcome {
            Err(error) => {
                // Delegated: the consumer's owner decides whether a read
                // failure ends the stream.
                Self::deliver_error(state, error);
            }
            Ok(ReadOutcome::WouldBlock) => {
                // Spurious wakeup. Same treatment as an unready downstream,
                // minus the excess accounting: just make sure the source is
                // armed for the next cycle.
                state.borrow_mut().resume_source();
            }
            Ok(ReadOutcome::Read(0)) => Self::close_state(state),
            Ok(ReadOutcome::Read(n)) => Self::forward(state, n),
        }
    }

    /// Hand the first `read_len` bytes of the buffer downstream, bounded by
    /// `remaining` for finite sources.
    fn forward(state: &Rc<RefCell<Inner>>, read_len: usize) {
        let (chunk, ack) = {
            let mut inner = state.borrow_mut();
            let forward_len = match inner.remaining {
                Some(remaining) => {
                    let len = (read_len as i64).min(remaining.max(0)) as usize;
                    inner.remaining = Some(remaining - read_len as i64);
                    len
                }
                None => read_len,
            };
            if forward_len == 0 {
                // Bounded source already drained; nothing left to deliver.
                drop(inner);
                Self::close_state(state);
                return;
            }
            inner.buf.truncate(forward_len);
            let chunk = inner.buf.split().freeze();
            inner.downstream_ready = false;
            let close_after = inner.remaining.map_or(false, |r| r <= 0);
            let weak = Rc::downgrade(state);
            let ack = Ack::new(move |result| {
                if let Some(state) = weak.upgrade() {
                    Self::on_ack(&state, close_after, result);
                }
            });
            (chunk, ack)
        };
        Self::deliver(state, move |downstream| downstream.next_chunk(chunk, ack));
    }

    fn on_ack(state: &Rc<RefCell<Inner>>, close_after: bool, result: io::Result<()>) {
        match result {
            Ok(()) => {
                {
                    let mut inner = state.borrow_mut();
                    if inner.closed {
                        return;
                    }
                    inner.downstream_ready = true;
                    inner.excess_signals = 0;
                    if !close_after {
                        inner.resume_source();
                    }
                }
                if close_after {
                    Self::close_state(state);
                }
            }
            Err(error) => {
                // The consumer refused the chunk; surface that on its error
                // channel and leave the source as-is.
                Self::deliver_error(state, error);
            }
        }
    }

    /// Surface `error` on the consumer's error channel.
    ///
    /// When the consumer is currently checked out for a delivery (the error
    /// came from inside it, through a synchronously failed acknowledgement),
    /// the error is stashed and flushed by [`deliver`](Self::deliver) as soon
    /// as the consumer returns, so it reaches the error channel exactly once
    /// instead of being dropped.
    fn deliver_error(state: &Rc<RefCell<Inner>>, error: io::Error) {
        {
            let mut inner = state.borrow_mut();
            if inner.delivering {
                inner.pending_error = Some(error);
                return;
            }
        }
        Self::deliver(state, move |downstream| downstream.error(error));
    }

    /// Run `f` against the downstream without holding the state borrow, so
    /// the consumer may resolve the acknowledgement or close the stream from
    /// inside the call.
    fn deliver(state: &Rc<RefCell<Inner>>, f: impl FnOnce(&mut dyn Downstream)) {
        let taken = {
            let mut inner = state.borrow_mut();
            let taken = inner.downstream.take();
            if taken.is_some() {
                inner.delivering = true;
            }
            taken
        };
        let Some(mut downstream) = taken else {
            tracing::debug!("dropping stream event: no downstream attached");
            return;
        };
        f(&mut *downstream);
        let pending = {
            let mut inner = state.borrow_mut();
            inner.delivering = false;
            inner.pending_error.take()
        };
        if let Some(error) = pending {
            downstream.error(error);
        }
        let mut inner = state.borrow_mut();
        if inner.closed {
            // close ran while the consumer was borrowed out; it still owes
            // the consumer exactly one close notification.
            drop(inner);
            downstream.close();
        } else if inner.downstream.is_none() {
            inner.downstream = Some(downstream);
        }
    }

    fn close_state(state: &Rc<RefCell<Inner>>) {
        let (source, socket, downstream) = {
            let mut inner = state.borrow_mut();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                inner.source.take(),
                inner.socket.take(),
                inner.downstream.take(),
            )
        };
        if let Some(source) = source {
            source.cancel();
        }
        if let Some(mut socket) = socket {
            socket.close();
        }
        if let Some(mut downstream) = downstream {
            downstream.close();
        }
        tracing::debug!("socket source closed");
    }
}

impl Drop for SocketSource {
    /// A dropped stream tears itself down; otherwise its registration entry
    /// would stay alive in the loop's arena for the loop's lifetime.
    fn drop(&mut self) {
        Self::close_state(&self.state);
    }
}

impl Inner {
    fn resume_source(&mut self) {
        if self.closed || !self.suspended {
            return;
        }
        if let Some(source) = &self.source {
            match source.resume() {
                Ok(()) => self.suspended = false,
                Err(error) => tracing::warn!("failed to resume readiness source: {}", error),
            }
        }
    }

    fn suspend_source(&mut self) {
        if self.closed || self.suspended {
            return;
        }
        if let Some(source) = &self.source {
            match source.suspend() {
                Ok(()) => {
                    self.suspended = true;
                    tracing::debug!(
                        "socket source suspended after {} ignored readiness signals",
                        self.excess_signals
                    );
                }
                Err(error) => tracing::warn!("failed to suspend readiness source: {}", error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// A socket whose reads follow a script, backed by a real pipe descriptor
    /// so epoll has something to report. The pipe contents are never drained:
    /// level-triggered delivery keeps signalling, which lets tests step the
    /// adapter one readiness signal per `run_timeout` call.
    struct ScriptedSocket {
        fd: RawFd,
        size: Option<u64>,
        script: VecDeque<Step>,
        closed: Rc<Cell<u32>>,
    }

    enum Step {
        Data(Vec<u8>),
        WouldBlock,
        Eof,
        Error(io::ErrorKind),
    }

    impl Socket for ScriptedSocket {
        fn descriptor(&self) -> RawFd {
            self.fd
        }

        fn size(&self) -> Option<u64> {
            self.size
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            match self.script.pop_front() {
                Some(Step::Data(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(ReadOutcome::Read(data.len()))
                }
                Some(Step::WouldBlock) | None => Ok(ReadOutcome::WouldBlock),
                Some(Step::Eof) => Ok(ReadOutcome::Read(0)),
                Some(Step::Error(kind)) => Err(io::Error::new(kind, "scripted failure")),
            }
        }

        fn close(&mut self) {
            self.closed.set(self.closed.get() + 1);
        }
    }

    #[derive(Default)]
    struct Consumer {
        auto_ack: bool,
        chunks: Rc<RefCell<Vec<Bytes>>>,
        acks: Rc<RefCell<Vec<Ack>>>,
        errors: Rc<RefCell<Vec<io::Error>>>,
        closes: Rc<Cell<u32>>,
    }

    impl Downstream for Consumer {
        fn next_chunk(&mut self, chunk: Bytes, ack: Ack) {
            self.chunks.borrow_mut().push(chunk);
            if self.auto_ack {
                ack.ready();
            } else {
                self.acks.borrow_mut().push(ack);
            }
        }

        fn error(&mut self, error: io::Error) {
            self.errors.borrow_mut().push(error);
        }

        fn close(&mut self) {
            self.closes.set(self.closes.get() + 1);
        }
    }

    struct Fixture {
        event_loop: EventLoop,
        source: SocketSource,
        chunks: Rc<RefCell<Vec<Bytes>>>,
        acks: Rc<RefCell<Vec<Ack>>>,
        errors: Rc<RefCell<Vec<io::Error>>>,
        closes: Rc<Cell<u32>>,
        socket_closes: Rc<Cell<u32>>,
        // Keep the pipe ends alive for the duration of the test.
        _rx: OwnedFd,
        _tx: OwnedFd,
    }

    fn fixture(size: Option<u64>, script: Vec<Step>, auto_ack: bool, buffer_size: usize) -> Fixture {
        let event_loop = EventLoop::new("test").unwrap();
        let (rx, tx) = nix::unistd::pipe().unwrap();
        // One byte keeps the read end permanently readable.
        nix::unistd::write(&tx, b"x").unwrap();

        let socket_closes = Rc::new(Cell::new(0));
        let socket = ScriptedSocket {
            fd: rx.as_raw_fd(),
            size,
            script: script.into(),
            closed: socket_closes.clone(),
        };
        let source =
            SocketSource::with_buffer_size(&event_loop, Box::new(socket), buffer_size).unwrap();

        let consumer = Consumer {
            auto_ack,
            ..Default::default()
        };
        let chunks = consumer.chunks.clone();
        let acks = consumer.acks.clone();
        let errors = consumer.errors.clone();
        let closes = consumer.closes.clone();
        source.attach(Box::new(consumer));

        Fixture {
            event_loop,
            source,
            chunks,
            acks,
            errors,
            closes,
            socket_closes,
            _rx: rx,
            _tx: tx,
        }
    }

    fn step(fx: &Fixture) -> usize {
        fx.event_loop.run_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_chunks_flow_with_immediate_acks() {
        let fx = fixture(
            None,
            vec![Step::Data(b"hello".to_vec()), Step::Data(b"world".to_vec())],
            true,
            64,
        );
        step(&fx);
        step(&fx);
        let chunks = fx.chunks.borrow();
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[0][..], b"hello");
        assert_eq!(&chunks[1][..], b"world");
        assert!(!fx.source.is_closed());
    }

    #[test]
    fn test_eof_closes_and_notifies_once() {
        let fx = fixture(None, vec![Step::Eof], true, 64);
        step(&fx);
        assert!(fx.source.is_closed());
        assert_eq!(fx.closes.get(), 1);
        assert_eq!(fx.socket_closes.get(), 1);
        assert!(fx.chunks.borrow().is_empty());

        // Close again explicitly: no second notification, no second socket
        // close, no further signals.
        fx.source.close();
        assert_eq!(fx.closes.get(), 1);
        assert_eq!(fx.socket_closes.get(), 1);
        assert_eq!(step(&fx), 0);
    }

    #[test]
    fn test_single_outstanding_chunk() {
        let fx = fixture(
            None,
            vec![Step::Data(b"one".to_vec()), Step::Data(b"two".to_vec())],
            false,
            64,
        );
        // First signal forwards a chunk; the ack is withheld.
        step(&fx);
        assert_eq!(fx.chunks.borrow().len(), 1);

        // Readiness keeps arriving, but no second forward may happen.
        step(&fx);
        step(&fx);
        assert_eq!(fx.chunks.borrow().len(), 1);

        // Resolving the ack reopens the valve.
        fx.acks.borrow_mut().remove(0).ready();
        step(&fx);
        assert_eq!(fx.chunks.borrow().len(), 2);
        assert_eq!(&fx.chunks.borrow()[1][..], b"two");
    }

    #[test]
    fn test_backpressure_suspends_after_threshold() {
        let fx = fixture(None, vec![Step::Data(b"data".to_vec())], false, 64);
        step(&fx);
        assert_eq!(fx.chunks.borrow().len(), 1);

        // Two ignored signals reach the threshold and suspend the source.
        assert_eq!(step(&fx), 1);
        assert_eq!(step(&fx), 1);
        // Suspended: the still-readable pipe no longer produces signals.
        assert_eq!(step(&fx), 0);
        assert_eq!(step(&fx), 0);

        // The late acknowledgement resumes delivery.
        fx.acks.borrow_mut().remove(0).ready();
        assert_eq!(step(&fx), 1);
    }

    #[test]
    fn test_would_block_is_not_excess_and_keeps_source_active() {
        let fx = fixture(
            None,
            vec![
                Step::WouldBlock,
                Step::WouldBlock,
                Step::WouldBlock,
                Step::WouldBlock,
                Step::WouldBlock,
            ],
            true,
            64,
        );
        for _ in 0..5 {
            // Each cycle delivers a signal: the source was never suspended.
            assert_eq!(step(&fx), 1);
        }
        assert!(fx.chunks.borrow().is_empty());
        assert!(!fx.source.is_closed());
    }

    #[test]
    fn test_bounded_source_terminates_exactly() {
        // S = 10, buffer 4, reads 4, 4, 2: chunks 4/4/2 then close after the
        // final ack, without a trailing zero-byte read.
        let fx = fixture(
            Some(10),
            vec![
                Step::Data(b"aaaa".to_vec()),
                Step::Data(b"bbbb".to_vec()),
                Step::Data(b"cc".to_vec()),
                Step::Eof,
            ],
            true,
            4,
        );
        step(&fx);
        step(&fx);
        step(&fx);
        let total: usize = fx.chunks.borrow().iter().map(|c| c.len()).sum();
        assert_eq!(total, 10);
        assert_eq!(
            fx.chunks.borrow().iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
        assert!(fx.source.is_closed());
        assert_eq!(fx.closes.get(), 1);
        // The Eof step was never consumed.
        assert_eq!(step(&fx), 0);
    }

    #[test]
    fn test_bounded_overread_is_clamped() {
        // The final read crosses the boundary: 6 bytes arrive with only 4
        // remaining, so the view is clamped and the counter goes negative.
        let fx = fixture(
            Some(10),
            vec![Step::Data(b"aaaaaa".to_vec()), Step::Data(b"bbbbbb".to_vec())],
            true,
            8,
        );
        step(&fx);
        step(&fx);
        assert_eq!(
            fx.chunks.borrow().iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![6, 4]
        );
        assert!(fx.source.is_closed());
    }

    #[test]
    fn test_read_error_is_delegated_not_fatal() {
        let fx = fixture(
            None,
            vec![
                Step::Error(io::ErrorKind::ConnectionReset),
                Step::Data(b"after".to_vec()),
            ],
            true,
            64,
        );
        step(&fx);
        assert_eq!(fx.errors.borrow().len(), 1);
        assert!(!fx.source.is_closed());
        assert_eq!(fx.closes.get(), 0);

        // The stream keeps flowing afterwards.
        step(&fx);
        assert_eq!(fx.chunks.borrow().len(), 1);
    }

    #[test]
    fn test_failed_ack_reports_and_stalls() {
        let fx = fixture(
            None,
            vec![Step::Data(b"chunk".to_vec()), Step::Data(b"more".to_vec())],
            false,
            64,
        );
        step(&fx);
        fx.acks
            .borrow_mut()
            .remove(0)
            .fail(io::Error::new(io::ErrorKind::Other, "refused"));
        assert_eq!(fx.errors.borrow().len(), 1);

        // Demand was never restored, so nothing further is forwarded.
        step(&fx);
        step(&fx);
        assert_eq!(fx.chunks.borrow().len(), 1);
    }

    #[test]
    fn test_ack_failed_inside_delivery_reports_error() {
        struct RefusingConsumer {
            chunks: Rc<Cell<u32>>,
            errors: Rc<Cell<u32>>,
        }

        impl Downstream for RefusingConsumer {
            fn next_chunk(&mut self, _chunk: Bytes, ack: Ack) {
                self.chunks.set(self.chunks.get() + 1);
                ack.fail(io::Error::new(io::ErrorKind::WriteZero, "no room downstream"));
            }
            fn error(&mut self, _error: io::Error) {
                self.errors.set(self.errors.get() + 1);
            }
            fn close(&mut self) {}
        }

        let event_loop = EventLoop::new("test").unwrap();
        let (rx, tx) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&tx, b"x").unwrap();

        let socket = ScriptedSocket {
            fd: rx.as_raw_fd(),
            size: None,
            script: vec![Step::Data(b"chunk".to_vec()), Step::Data(b"more".to_vec())].into(),
            closed: Rc::new(Cell::new(0)),
        };
        let source = SocketSource::new(&event_loop, Box::new(socket)).unwrap();

        let chunks = Rc::new(Cell::new(0));
        let errors = Rc::new(Cell::new(0));
        source.attach(Box::new(RefusingConsumer {
            chunks: chunks.clone(),
            errors: errors.clone(),
        }));

        // The acknowledgement fails synchronously inside next_chunk; the
        // error must still come back on the error channel, exactly once.
        event_loop.run_timeout(Duration::from_millis(100));
        assert_eq!(chunks.get(), 1);
        assert_eq!(errors.get(), 1);
        assert!(!source.is_closed());

        // Demand was never restored, so nothing further is forwarded.
        event_loop.run_timeout(Duration::from_millis(100));
        assert_eq!(chunks.get(), 1);
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn test_drop_tears_the_stream_down() {
        let event_loop = EventLoop::new("test").unwrap();
        let (rx, tx) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&tx, b"x").unwrap();

        let socket_closes = Rc::new(Cell::new(0));
        let socket = ScriptedSocket {
            fd: rx.as_raw_fd(),
            size: None,
            script: VecDeque::new(),
            closed: socket_closes.clone(),
        };
        let source = SocketSource::new(&event_loop, Box::new(socket)).unwrap();
        let consumer = Consumer {
            auto_ack: true,
            ..Default::default()
        };
        let closes = consumer.closes.clone();
        source.attach(Box::new(consumer));

        drop(source);
        assert_eq!(closes.get(), 1);
        assert_eq!(socket_closes.get(), 1);
        // The registration is gone; the still-readable pipe produces nothing.
        assert_eq!(event_loop.run_timeout(Duration::from_millis(50)), 0);
    }

    #[test]
    fn test_close_from_inside_delivery() {
        struct ClosingConsumer {
            source: Rc<RefCell<Option<SocketSource>>>,
            closes: Rc<Cell<u32>>,
        }

        impl Downstream for ClosingConsumer {
            fn next_chunk(&mut self, _chunk: Bytes, ack: Ack) {
                if let Some(source) = self.source.borrow().as_ref() {
                    source.close();
                }
                ack.ready();
            }
            fn error(&mut self, _error: io::Error) {}
            fn close(&mut self) {
                self.closes.set(self.closes.get() + 1);
            }
        }

        let event_loop = EventLoop::new("test").unwrap();
        let (rx, tx) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&tx, b"x").unwrap();

        let socket = ScriptedSocket {
            fd: rx.as_raw_fd(),
            size: None,
            script: vec![Step::Data(b"only".to_vec())].into(),
            closed: Rc::new(Cell::new(0)),
        };
        let source = SocketSource::new(&event_loop, Box::new(socket)).unwrap();

        let shared = Rc::new(RefCell::new(None));
        let closes = Rc::new(Cell::new(0));
        source.attach(Box::new(ClosingConsumer {
            source: shared.clone(),
            closes: closes.clone(),
        }));
        *shared.borrow_mut() = Some(source);

        event_loop.run_timeout(Duration::from_millis(100));
        assert_eq!(closes.get(), 1);
        assert!(shared.borrow().as_ref().unwrap().is_closed());
    }
}
