//! Deterministic in-memory implementation of the proposer capability
//! surface.
//!
//! Time is a counter, randomness is seeded, and the "network" delivers
//! frames straight into [`SimAcceptor`] automatons, so every test run is
//! identical. Readiness is served in safekeeper order: reads before
//! writes, lowest index first.
//!
//! The non-returning exits (`finish_sync_safekeepers`, `fatal`) unwind
//! with a [`SimExit`] payload; drive those runs through
//! [`run_expect_exit`].

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use walsync_core::{Lsn, ProposerMessage};
use walsync_proposer::{
    Api, AsyncRead, AsyncWrite, ConnStatus, ConnectPoll, ExecResult, Flush, Readiness, SharedState,
    WaitEvent,
};

use crate::acceptor::SimAcceptor;

/// Why the proposer left through a non-returning exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimExit {
    /// `finish_sync_safekeepers(lsn)` fired.
    SyncDone(Lsn),
    /// A fatal safety violation, with its message.
    Fatal(String),
    /// The simulation ran out of scripted events while the proposer was
    /// still waiting (only with [`SimApi::stall_exits`]).
    Stalled,
}

/// Run a closure that is expected to leave through a [`SimExit`] unwind.
///
/// # Panics
///
/// Panics if the closure returns normally; any unrelated panic is
/// propagated.
pub fn run_expect_exit<R>(f: impl FnOnce() -> R) -> SimExit {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => panic!("proposer returned instead of exiting"),
        Err(payload) => match payload.downcast::<SimExit>() {
            Ok(exit) => *exit,
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnSim {
    Closed,
    Connecting,
    Open,
}

struct SimConn {
    state: ConnSim,
    /// Control query sent, result not yet consumed.
    pending_query_result: bool,
    /// Frame accepted but intentionally left unflushed.
    deferred: Option<Bytes>,
    error: &'static str,
}

impl SimConn {
    fn new() -> Self {
        Self {
            state: ConnSim::Closed,
            pending_query_result: false,
            deferred: None,
            error: "",
        }
    }
}

/// Scripted [`Api`] implementation over [`SimAcceptor`]s.
pub struct SimApi {
    pub acceptors: Vec<SimAcceptor>,
    conns: Vec<SimConn>,
    registered: Vec<Option<Readiness>>,
    clock: Duration,
    rng: StdRng,
    shared: SharedState,

    /// End of the WAL the simulated host has produced.
    pub wal_end: Lsn,
    /// Redo position of the simulated basebackup.
    pub redo_start: Lsn,
    /// Whether recovery downloads succeed.
    pub recovery_ok: bool,
    /// Serve this many timeouts (advancing the clock) when no socket
    /// event is pending, before falling back to the latch.
    pub pending_timeouts: u32,
    /// Exit with [`SimExit::Stalled`] instead of reporting the latch when
    /// the script runs dry; lets tests drive `start()` to a bounded end.
    pub stall_exits: bool,

    // Failure scripting, one entry per safekeeper.
    /// Fail the next `connect_poll`.
    pub fail_connect: Vec<bool>,
    /// Fail the next control query result.
    pub fail_query: Vec<bool>,
    /// Fail the next read (connection error / EOF).
    pub fail_read: Vec<bool>,
    /// Leave the next async write unflushed, exercising the flush path.
    pub defer_write: Vec<bool>,

    // Host-call records, for assertions.
    pub recovery_calls: Vec<(usize, Lsn, Lsn)>,
    pub feedback_commits: Vec<Lsn>,
    pub confirmed_truncates: Vec<Lsn>,
    pub after_election_calls: u32,
    pub closed: Vec<usize>,

    idle_budget: u32,
}

impl SimApi {
    #[must_use]
    pub fn new(n: usize, seed: u64) -> Self {
        Self {
            acceptors: (0..n).map(|i| SimAcceptor::new(i as u64)).collect(),
            conns: (0..n).map(|_| SimConn::new()).collect(),
            registered: vec![None; n],
            clock: Duration::ZERO,
            rng: StdRng::seed_from_u64(seed),
            shared: SharedState::new(),
            wal_end: Lsn::INVALID,
            redo_start: Lsn::INVALID,
            recovery_ok: true,
            pending_timeouts: 0,
            stall_exits: false,
            fail_connect: vec![false; n],
            fail_query: vec![false; n],
            fail_read: vec![false; n],
            defer_write: vec![false; n],
            recovery_calls: Vec::new(),
            feedback_commits: Vec::new(),
            confirmed_truncates: Vec::new(),
            after_election_calls: 0,
            closed: Vec::new(),
            idle_budget: 10_000,
        }
    }

    pub fn advance_clock(&mut self, delta: Duration) {
        self.clock += delta;
    }

    #[must_use]
    pub fn clock(&self) -> Duration {
        self.clock
    }

    /// Deterministic WAL byte at a position.
    #[must_use]
    pub fn wal_byte(lsn: Lsn) -> u8 {
        #[allow(clippy::cast_possible_truncation)]
        {
            (lsn.0 % 251) as u8
        }
    }

    fn readable(&self, i: usize) -> bool {
        self.conns[i].state == ConnSim::Open
            && (self.acceptors[i].has_output()
                || self.conns[i].pending_query_result
                || self.fail_read[i])
    }

    fn writable(&self, i: usize) -> bool {
        self.conns[i].state != ConnSim::Closed
    }

    fn deliver(&mut self, i: usize, frame: &[u8]) {
        let msg = ProposerMessage::decode(Bytes::copy_from_slice(frame))
            .expect("proposer sent a malformed frame");
        self.acceptors[i].handle(msg);
    }
}

impl Api for SimApi {
    fn connect_start(&mut self, sk: usize, _conninfo: &str) {
        self.conns[sk].state = ConnSim::Connecting;
        self.conns[sk].pending_query_result = false;
        self.conns[sk].deferred = None;
    }

    fn conn_status(&mut self, sk: usize) -> ConnStatus {
        match self.conns[sk].state {
            ConnSim::Connecting => ConnStatus::InProgress,
            ConnSim::Open => ConnStatus::Ok,
            ConnSim::Closed => ConnStatus::Bad,
        }
    }

    fn connect_poll(&mut self, sk: usize) -> ConnectPoll {
        if self.fail_connect[sk] {
            self.fail_connect[sk] = false;
            self.conns[sk].state = ConnSim::Closed;
            self.conns[sk].error = "simulated connect failure";
            return ConnectPoll::Failed;
        }
        self.conns[sk].state = ConnSim::Open;
        ConnectPoll::Ok
    }

    fn send_query(&mut self, sk: usize, _query: &str) -> bool {
        if self.conns[sk].state != ConnSim::Open {
            return false;
        }
        self.conns[sk].pending_query_result = true;
        true
    }

    fn query_result(&mut self, sk: usize) -> ExecResult {
        self.conns[sk].pending_query_result = false;
        if self.fail_query[sk] {
            self.fail_query[sk] = false;
            self.conns[sk].error = "simulated query failure";
            return ExecResult::Failed;
        }
        ExecResult::CopyBothStarted
    }

    fn read_message(&mut self, sk: usize) -> AsyncRead {
        if self.fail_read[sk] {
            self.fail_read[sk] = false;
            self.conns[sk].error = "simulated read failure";
            return AsyncRead::Failed;
        }
        if self.conns[sk].state != ConnSim::Open {
            return AsyncRead::Failed;
        }
        match self.acceptors[sk].pop_output() {
            Some(frame) => AsyncRead::Message(frame),
            None => AsyncRead::WouldBlock,
        }
    }

    fn write_message(&mut self, sk: usize, msg: &[u8]) -> AsyncWrite {
        if self.conns[sk].state != ConnSim::Open {
            return AsyncWrite::Failed;
        }
        if self.defer_write[sk] {
            self.defer_write[sk] = false;
            self.conns[sk].deferred = Some(Bytes::copy_from_slice(msg));
            return AsyncWrite::TryFlush;
        }
        self.deliver(sk, msg);
        AsyncWrite::Done
    }

    fn blocking_write(&mut self, sk: usize, msg: &[u8]) -> bool {
        if self.conns[sk].state != ConnSim::Open {
            return false;
        }
        self.deliver(sk, msg);
        true
    }

    fn flush(&mut self, sk: usize) -> Flush {
        match self.conns[sk].deferred.take() {
            Some(frame) => {
                self.deliver(sk, &frame);
                Flush::Done
            }
            None => Flush::Done,
        }
    }

    fn close(&mut self, sk: usize) {
        self.conns[sk].state = ConnSim::Closed;
        self.conns[sk].pending_query_result = false;
        self.conns[sk].deferred = None;
        self.acceptors[sk].drop_output();
        self.closed.push(sk);
    }

    fn conn_error(&mut self, sk: usize) -> String {
        self.conns[sk].error.to_owned()
    }

    fn reset_event_set(&mut self) {
        self.registered.fill(None);
    }

    fn register(&mut self, sk: usize, interest: Readiness) {
        self.registered[sk] = Some(interest);
    }

    fn update_interest(&mut self, sk: usize, interest: Readiness) {
        self.registered[sk] = Some(interest);
    }

    fn wait(&mut self, timeout: Option<Duration>) -> WaitEvent {
        for i in 0..self.conns.len() {
            if let Some(interest) = self.registered[i] {
                if interest.read && self.readable(i) {
                    self.idle_budget = 10_000;
                    return WaitEvent::Socket(i, Readiness::READ);
                }
            }
        }
        for i in 0..self.conns.len() {
            if let Some(interest) = self.registered[i] {
                if interest.write && self.writable(i) {
                    self.idle_budget = 10_000;
                    return WaitEvent::Socket(i, Readiness::WRITE);
                }
            }
        }

        if self.pending_timeouts > 0 {
            self.pending_timeouts -= 1;
            self.clock += timeout.unwrap_or(Duration::from_secs(1));
            return WaitEvent::Timeout;
        }

        if self.stall_exits {
            std::panic::panic_any(SimExit::Stalled);
        }
        self.idle_budget = self
            .idle_budget
            .checked_sub(1)
            .expect("simulation deadlock: latch served 10000 times with no progress");
        WaitEvent::Latch
    }

    fn now(&mut self) -> Duration {
        self.clock
    }

    fn strong_random(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    fn flushed_lsn(&mut self) -> Lsn {
        self.wal_end
    }

    fn redo_start_lsn(&mut self) -> Lsn {
        self.redo_start
    }

    fn wal_read(&mut self, start: Lsn, buf: &mut [u8]) {
        for (offset, byte) in buf.iter_mut().enumerate() {
            *byte = Self::wal_byte(start + offset as u64);
        }
    }

    fn recovery_download(&mut self, donor: usize, _timeline: u32, start: Lsn, end: Lsn) -> bool {
        self.recovery_calls.push((donor, start, end));
        self.recovery_ok
    }

    fn process_feedback(&mut self, commit_lsn: Lsn) {
        self.feedback_commits.push(commit_lsn);
    }

    fn confirm_wal_streamed(&mut self, lsn: Lsn) {
        self.confirmed_truncates.push(lsn);
    }

    fn after_election(&mut self, _truncate_lsn: &mut Lsn) {
        self.after_election_calls += 1;
    }

    fn shared_state(&self) -> &SharedState {
        &self.shared
    }

    fn finish_sync_safekeepers(&mut self, lsn: Lsn) -> ! {
        std::panic::panic_any(SimExit::SyncDone(lsn));
    }

    fn fatal(&mut self, why: &str) -> ! {
        std::panic::panic_any(SimExit::Fatal(why.to_owned()));
    }
}
