//! The capability surface the proposer engine runs against.
//!
//! The engine itself performs no I/O and reads no clocks: everything it
//! needs from the outside world (sockets, the event set, time, randomness,
//! WAL bytes, host callbacks) arrives through one [`Api`] implementation.
//! Production hosts wire this to real sockets (see [`crate::net`]); tests
//! wire it to a deterministic simulation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

use walsync_core::{Lsn, PageserverFeedback, Term};

/// Socket conditions a connection waits on.
///
/// One field per condition so that log output renders every bit
/// distinctly.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub read: bool,
    pub write: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness {
        read: false,
        write: false,
    };
    pub const READ: Readiness = Readiness {
        read: true,
        write: false,
    };
    pub const WRITE: Readiness = Readiness {
        read: false,
        write: true,
    };
    pub const READ_WRITE: Readiness = Readiness {
        read: true,
        write: true,
    };

    /// Does this readiness overlap what a state is waiting for?
    #[must_use]
    pub fn intersects(self, interest: Readiness) -> bool {
        (self.read && interest.read) || (self.write && interest.write)
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        !self.read && !self.write
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (true, true) => f.write_str("rw"),
            (true, false) => f.write_str("r-"),
            (false, true) => f.write_str("-w"),
            (false, false) => f.write_str("--"),
        }
    }
}

/// Connection status right after [`Api::connect_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    /// The attempt already failed, typically bad parameters.
    Bad,
    InProgress,
}

/// Result of advancing a nonblocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPoll {
    Ok,
    NeedRead,
    NeedWrite,
    Failed,
}

/// Result of polling for the control-query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    /// The expected bidirectional copy stream is open.
    CopyBothStarted,
    /// Not there yet; wait for read readiness and ask again.
    NeedsInput,
    /// The query succeeded with something other than a copy stream.
    UnexpectedSuccess,
    Failed,
}

/// Result of a nonblocking framed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncRead {
    /// One whole frame.
    Message(Bytes),
    /// Nothing buffered; wait for read readiness.
    WouldBlock,
    /// Connection error or EOF.
    Failed,
}

/// Result of a nonblocking framed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncWrite {
    /// Fully handed to the kernel.
    Done,
    /// Partially written; call [`Api::flush`] when the socket is ready.
    TryFlush,
    Failed,
}

/// Result of flushing a partial write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    Done,
    /// More to flush; wait for readiness and call again.
    Pending,
    Failed,
}

/// What the event-set wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// The host latch fired: new WAL is available.
    Latch,
    /// A registered connection became ready.
    Socket(usize, Readiness),
    Timeout,
}

/// Capability surface consumed by [`crate::WalProposer`].
///
/// Connections are addressed by the safekeeper's index in the configured
/// set. All calls are nonblocking unless documented otherwise; transient
/// failures surface as enum values, never as panics.
pub trait Api {
    // Connection lifecycle.

    /// Begin a nonblocking connection attempt.
    fn connect_start(&mut self, sk: usize, conninfo: &str);
    /// Status of the attempt started by [`Api::connect_start`].
    fn conn_status(&mut self, sk: usize) -> ConnStatus;
    /// Advance the nonblocking connect after readiness.
    fn connect_poll(&mut self, sk: usize) -> ConnectPoll;
    /// Enqueue the control query; `false` on connection failure.
    fn send_query(&mut self, sk: usize, query: &str) -> bool;
    /// Poll for the control-query result.
    fn query_result(&mut self, sk: usize) -> ExecResult;
    /// Try to read one frame.
    fn read_message(&mut self, sk: usize) -> AsyncRead;
    /// Try to write one frame.
    fn write_message(&mut self, sk: usize, msg: &[u8]) -> AsyncWrite;
    /// Write one frame, blocking until the kernel took it. Only used for
    /// messages small enough to fit a socket buffer.
    fn blocking_write(&mut self, sk: usize, msg: &[u8]) -> bool;
    /// Continue a write that returned [`AsyncWrite::TryFlush`].
    fn flush(&mut self, sk: usize) -> Flush;
    /// Tear the connection down and free its resources.
    fn close(&mut self, sk: usize);
    /// Human-readable description of the last connection error.
    fn conn_error(&mut self, sk: usize) -> String;

    // Event set.

    /// Drop every registration. The engine re-registers the survivors
    /// afterwards; connection membership changes are rare enough that
    /// rebuilding beats bookkeeping.
    fn reset_event_set(&mut self);
    /// Add a connection with the given interest.
    fn register(&mut self, sk: usize, interest: Readiness);
    /// Change the interest of an already registered connection.
    fn update_interest(&mut self, sk: usize, interest: Readiness);
    /// Sleep until the latch fires, a registered socket becomes ready, or
    /// the timeout elapses. `None` waits forever.
    fn wait(&mut self, timeout: Option<Duration>) -> WaitEvent;

    // Host services.

    /// Monotonic time since an arbitrary origin.
    fn now(&mut self) -> Duration;
    /// Fill `buf` with cryptographically strong random bytes.
    fn strong_random(&mut self, buf: &mut [u8]);
    /// End of the WAL the host has produced so far.
    fn flushed_lsn(&mut self) -> Lsn;
    /// Position at which the host's on-disk image begins.
    fn redo_start_lsn(&mut self) -> Lsn;
    /// Copy `buf.len()` bytes of WAL starting at `start` into `buf`.
    fn wal_read(&mut self, start: Lsn, buf: &mut [u8]);
    /// Fetch `[start, end)` from the donor and make it readable locally.
    fn recovery_download(&mut self, donor: usize, timeline: u32, start: Lsn, end: Lsn) -> bool;
    /// New quorum-committed position; the host propagates backpressure.
    fn process_feedback(&mut self, commit_lsn: Lsn);
    /// Everything below `lsn` is safe everywhere; old segments may go.
    fn confirm_wal_streamed(&mut self, lsn: Lsn);
    /// Runs right after the proposer elected itself, before any
    /// announcement is sent. May lower `truncate_lsn` to hold WAL back
    /// for logical replication.
    fn after_election(&mut self, truncate_lsn: &mut Lsn);
    /// The block shared with the host process.
    fn shared_state(&self) -> &SharedState;
    /// Sync mode reached its goal. Does not return; no proposer state may
    /// be touched afterwards.
    fn finish_sync_safekeepers(&mut self, lsn: Lsn) -> !;
    /// Unrecoverable safety violation (concurrent proposer, corruption).
    /// Does not return.
    fn fatal(&mut self, why: &str) -> !;
}

#[derive(Debug, Default)]
struct SharedInner {
    feedback: PageserverFeedback,
    mine_last_elected_term: Term,
}

/// The one block shared between the proposer and its host process.
///
/// Holds the freshest pageserver feedback snapshot, the last term this
/// host elected itself in (which survives proposer restarts and gates the
/// bootstrap cross-check), and the backpressure throttle accumulator.
/// Every lock scope is a single field access.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<SharedInner>,
    backpressure_throttle_us: AtomicU64,
}

impl SharedState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mine_last_elected_term(&self) -> Term {
        self.inner.lock().unwrap().mine_last_elected_term
    }

    pub fn set_mine_last_elected_term(&self, term: Term) {
        self.inner.lock().unwrap().mine_last_elected_term = term;
    }

    #[must_use]
    pub fn feedback(&self) -> PageserverFeedback {
        self.inner.lock().unwrap().feedback
    }

    pub fn update_feedback(&self, feedback: &PageserverFeedback) {
        self.inner.lock().unwrap().feedback = *feedback;
    }

    /// Microseconds the host has spent throttled on backpressure.
    #[must_use]
    pub fn backpressure_throttle_us(&self) -> u64 {
        self.backpressure_throttle_us.load(Ordering::Relaxed)
    }

    pub fn add_backpressure_throttle_us(&self, us: u64) {
        self.backpressure_throttle_us
            .fetch_add(us, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_renders_each_bit() {
        assert_eq!(format!("{:?}", Readiness::NONE), "--");
        assert_eq!(format!("{:?}", Readiness::READ), "r-");
        assert_eq!(format!("{:?}", Readiness::WRITE), "-w");
        assert_eq!(format!("{:?}", Readiness::READ_WRITE), "rw");
    }

    #[test]
    fn readiness_intersection() {
        assert!(Readiness::READ.intersects(Readiness::READ_WRITE));
        assert!(!Readiness::READ.intersects(Readiness::WRITE));
        assert!(!Readiness::NONE.intersects(Readiness::READ_WRITE));
    }

    #[test]
    fn shared_state_remembers_last_elected_term() {
        let shared = SharedState::new();
        assert_eq!(shared.mine_last_elected_term(), Term::NONE);
        shared.set_mine_last_elected_term(Term(8));
        assert_eq!(shared.mine_last_elected_term(), Term(8));
    }
}
