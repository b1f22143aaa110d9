//! The downstream stream contract: chunk delivery and acknowledgement.
//!
//! A [`SocketSource`](crate::SocketSource) pushes data to a [`Downstream`]
//! consumer one chunk at a time. Every chunk travels with an [`Ack`]; the
//! producer sends nothing further until the consumer resolves it. Resolution
//! may happen synchronously inside `next_chunk` or at any later point on the
//! owning thread; the handle is an explicit pending/resolved cell with a
//! single continuation, not a language-level future.

use std::io;

use bytes::Bytes;

/// Consumer side of a byte stream.
///
/// All methods are invoked synchronously on the thread driving the event
/// loop. `next_chunk` hands over an owned view of the producer's read buffer;
/// the underlying storage is not reused until `ack` resolves.
pub trait Downstream {
    /// Deliver the next chunk. The consumer must eventually resolve `ack`
    /// to request more data (or to report that it cannot take more).
    fn next_chunk(&mut self, chunk: Bytes, ack: Ack);

    /// An out-of-band read failure. The producer does not close itself on
    /// this path; whoever owns the consumer decides the consequence.
    fn error(&mut self, error: io::Error);

    /// The stream is over. Sent exactly once, on end-of-data, hangup,
    /// exhaustion of a bounded source, or explicit close.
    fn close(&mut self);
}

type Continuation = Box<dyn FnOnce(io::Result<()>)>;

/// One-shot acknowledgement handle for a delivered chunk.
///
/// Consumed by [`ready`](Ack::ready) or [`fail`](Ack::fail). Dropping it
/// unresolved stalls the stream: the producer counts the following ignored
/// readiness signals and suspends itself.
pub struct Ack {
    continuation: Option<Continuation>,
}

impl Ack {
    /// Build a handle that invokes `continuation` once resolved.
    pub fn new<F>(continuation: F) -> Self
    where
        F: FnOnce(io::Result<()>) + 'static,
    {
        Self {
            continuation: Some(Box::new(continuation)),
        }
    }

    /// The consumer is ready for more data.
    pub fn ready(mut self) {
        if let Some(continuation) = self.continuation.take() {
            continuation(Ok(()));
        }
    }

    /// The consumer could not absorb the chunk.
    pub fn fail(mut self, error: io::Error) {
        if let Some(continuation) = self.continuation.take() {
            continuation(Err(error));
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        if self.continuation.is_some() {
            tracing::warn!("chunk acknowledgement dropped unresolved; the stream will stall");
        }
    }
}
