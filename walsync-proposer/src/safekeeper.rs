//! Per-safekeeper connection record and state machine states.

use std::time::Duration;

use walsync_core::{AcceptorGreeting, AppendResponse, Lsn, VoteResponse};

use crate::api::Readiness;
use crate::config::Endpoint;

/// Connection state, in execution order. Every state but `Offline` and
/// `Active` falls back to `Offline` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkState {
    /// No connection; stays that way until the reconnect supervisor acts.
    Offline,
    /// Nonblocking connect in flight, waiting for write readiness.
    ConnectingWrite,
    /// Nonblocking connect in flight, waiting for read readiness.
    ConnectingRead,
    /// Control query sent, waiting for the copy stream to open.
    WaitExecResult,
    /// Greeting sent, waiting for the safekeeper's.
    HandshakeRecv,
    /// Greeted, parked until enough peers greet to start an election.
    /// Read readiness here only ever means the peer hung up.
    Voting,
    /// Vote request sent, waiting for the verdict.
    WaitVerdict,
    /// Election announcement partially written, flushing.
    SendElectedFlush,
    /// Voted, parked until the election completes. Read readiness here
    /// only ever means the peer hung up.
    Idle,
    /// Streaming WAL and receiving acknowledgements.
    Active,
}

impl SkState {
    /// Socket conditions a connection in this state waits on.
    ///
    /// `Active` additionally wants write readiness while it has unsent
    /// WAL or an unflushed buffer; the streaming handler maintains that
    /// part itself.
    #[must_use]
    pub fn desired_events(self) -> Readiness {
        match self {
            SkState::Offline => Readiness::NONE,
            SkState::ConnectingWrite => Readiness::WRITE,
            SkState::ConnectingRead
            | SkState::WaitExecResult
            | SkState::HandshakeRecv
            | SkState::WaitVerdict
            | SkState::Voting
            | SkState::Idle => Readiness::READ,
            SkState::SendElectedFlush | SkState::Active => Readiness::READ_WRITE,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            SkState::Offline => "offline",
            SkState::ConnectingWrite | SkState::ConnectingRead => "connecting",
            SkState::WaitExecResult => "receiving query result",
            SkState::HandshakeRecv => "handshake (receiving)",
            SkState::Voting => "voting",
            SkState::WaitVerdict => "wait-for-verdict",
            SkState::SendElectedFlush => "send-announcement-flush",
            SkState::Idle => "idle",
            SkState::Active => "active",
        }
    }
}

/// Everything the proposer tracks about one safekeeper.
#[derive(Debug)]
pub(crate) struct Safekeeper {
    pub endpoint: Endpoint,
    pub state: SkState,
    /// When the last message arrived; feeds the inactivity cutoff.
    pub latest_msg_received_at: Duration,
    /// Boundary chosen at election time; streaming starts here.
    pub start_streaming_at: Lsn,
    /// Current streaming cursor.
    pub streaming_at: Lsn,
    /// A write is sitting in the transport buffer awaiting flush.
    pub flush_write: bool,
    pub greeting: AcceptorGreeting,
    pub vote: VoteResponse,
    /// Latest acknowledgement; feeds commit and truncate computation even
    /// after the connection drops.
    pub append_response: AppendResponse,
}

impl Safekeeper {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            state: SkState::Offline,
            latest_msg_received_at: Duration::ZERO,
            start_streaming_at: Lsn::INVALID,
            streaming_at: Lsn::INVALID,
            flush_write: false,
            greeting: AcceptorGreeting::default(),
            vote: VoteResponse::default(),
            append_response: AppendResponse::default(),
        }
    }

    /// `host:port`, safe for logs.
    pub(crate) fn addr(&self) -> String {
        self.endpoint.addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_events_per_state() {
        assert_eq!(SkState::Offline.desired_events(), Readiness::NONE);
        assert_eq!(SkState::ConnectingWrite.desired_events(), Readiness::WRITE);
        assert_eq!(SkState::ConnectingRead.desired_events(), Readiness::READ);
        assert_eq!(SkState::Voting.desired_events(), Readiness::READ);
        assert_eq!(SkState::Idle.desired_events(), Readiness::READ);
        assert_eq!(
            SkState::SendElectedFlush.desired_events(),
            Readiness::READ_WRITE
        );
        assert_eq!(SkState::Active.desired_events(), Readiness::READ_WRITE);
    }
}
