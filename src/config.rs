//! Configuration constants for the reactor and the stream adapter.
//!
//! This module contains tunable parameters that affect dispatch behavior,
//! particularly around batching and back-pressure.

/// Upper bound on kernel events processed per `run` cycle
///
/// This sizes the batch buffer handed to the kernel wait call. A larger value
/// drains more readiness events per cycle at the cost of a bigger fixed
/// allocation; events beyond the bound are simply reported on the next cycle,
/// so the only effect of a small value is extra wakeups.
pub const MAX_EVENTS_PER_CYCLE: usize = 4096;

/// Default size in bytes of a socket source's read buffer
///
/// Each `SocketSource` allocates one buffer of this size up front and reuses
/// it for every non-blocking read. One chunk of at most this many bytes is
/// outstanding downstream at any time, so this value bounds the memory a
/// single stream can hold in flight.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Consecutive ignored readiness signals tolerated before suspension
///
/// A single ignored signal may be transient (the downstream acknowledgement
/// is often about to resolve), but repeated ignored signals indicate
/// sustained back-pressure. Once this many arrive in a row the source's
/// registration is suspended so the loop stops paying for wakeups nobody
/// will act on.
pub const EXCESS_SIGNAL_THRESHOLD: u32 = 2;
