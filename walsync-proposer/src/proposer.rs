//! The proposer engine.
//!
//! One `WalProposer` drives elections and WAL streaming for one log over a
//! fixed safekeeper set. It is strictly single-threaded: the only
//! suspension point is [`Api::wait`], and every socket operation beyond
//! the handful of small blocking writes is nonblocking.
//!
//! The host embeds it like this:
//!
//! ```ignore
//! let mut wp = WalProposer::new(config, api)?;
//! let mut next = wp.start(); // elects, recovers, returns the stream start
//! loop {
//!     let end = wait_for_new_wal();
//!     wp.broadcast(next, end);
//!     next = end;
//!     wp.poll();
//! }
//! ```
//!
//! In sync mode `start` never returns; the process exits through
//! [`Api::finish_sync_safekeepers`] once a quorum confirms the epoch
//! start position.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use error_stack::Report;
use tracing::{info, trace, warn};
use uuid::Uuid;

use walsync_core::lsn::WAL_BLOCK_SIZE;
use walsync_core::{
    AcceptorMessage, AppendRequest, AppendRequestHeader, Lsn, PROTOCOL_VERSION, ProposerElected,
    ProposerGreeting, ProposerMessage, Term, TermHistory, VoteRequest,
};

use crate::api::{
    Api, AsyncRead, AsyncWrite, ConnStatus, ConnectPoll, ExecResult, Flush, Readiness, WaitEvent,
};
use crate::config::{Config, ConfigError};
use crate::election;
use crate::metrics::ProposerMetrics;
use crate::safekeeper::{Safekeeper, SkState};

/// Largest WAL chunk carried by a single append message.
pub const MAX_SEND_SIZE: u64 = 16 * WAL_BLOCK_SIZE;

/// Control query opening the bidirectional copy stream.
const START_WAL_PUSH_QUERY: &str = "START_WAL_PUSH";

enum PollOutcome {
    /// The host latch fired.
    Latch,
    /// The host produced WAL we have not been told about.
    NewWal,
    Timeout,
    Dispatched,
}

/// Proposer for one log over a fixed set of safekeepers.
pub struct WalProposer<A: Api> {
    api: A,
    config: Config,
    metrics: ProposerMetrics,
    safekeepers: Vec<Safekeeper>,
    quorum: usize,

    greeting: ProposerGreeting,
    vote_request: VoteRequest,

    /// End of the WAL produced so far.
    available_lsn: Lsn,
    last_sent_commit_lsn: Lsn,
    /// Our term. Fixed once a quorum has greeted; any higher term seen
    /// afterwards means a concurrent proposer and is fatal.
    prop_term: Term,
    prop_history: TermHistory,
    /// Position since which our term writes WAL.
    prop_epoch_start_lsn: Lsn,
    donor: usize,
    donor_epoch: Term,
    /// Everything below this is stored on every safekeeper.
    truncate_lsn: Lsn,
    timeline_start_lsn: Lsn,

    n_votes: usize,
    n_connected: usize,
    last_reconnect_attempt: Duration,

    /// Set once elected and recovered in normal mode; `start` returns it.
    stream_start: Option<Lsn>,
}

impl<A: Api> WalProposer<A> {
    /// Build a proposer. Fails only on configuration errors; no
    /// connections are attempted yet.
    pub fn new(config: Config, mut api: A) -> Result<Self, Report<ConfigError>> {
        let resolved = config.resolve()?;

        let mut proposer_id = [0u8; 16];
        api.strong_random(&mut proposer_id);

        let greeting = ProposerGreeting {
            protocol_version: PROTOCOL_VERSION,
            pg_version: config.pg_version,
            proposer_id: Uuid::from_bytes(proposer_id),
            system_id: config.system_id,
            timeline_id: resolved.timeline_id,
            tenant_id: resolved.tenant_id,
            timeline: config.pg_timeline,
            wal_seg_size: config.wal_seg_size,
        };

        let safekeepers: Vec<Safekeeper> =
            resolved.endpoints.into_iter().map(Safekeeper::new).collect();
        let quorum = election::quorum_size(safekeepers.len());

        api.reset_event_set();

        info!(
            n_safekeepers = safekeepers.len(),
            quorum,
            timeline = %greeting.timeline_id,
            "created proposer"
        );

        Ok(Self {
            api,
            config,
            metrics: ProposerMetrics::new(),
            safekeepers,
            quorum,
            greeting,
            vote_request: VoteRequest::default(),
            available_lsn: Lsn::INVALID,
            last_sent_commit_lsn: Lsn::INVALID,
            prop_term: Term::NONE,
            prop_history: TermHistory::default(),
            prop_epoch_start_lsn: Lsn::INVALID,
            donor: 0,
            donor_epoch: Term::NONE,
            truncate_lsn: Lsn::INVALID,
            timeline_start_lsn: Lsn::INVALID,
            n_votes: 0,
            n_connected: 0,
            last_reconnect_attempt: Duration::ZERO,
            stream_start: None,
        })
    }

    /// Connect everywhere and run the protocol until elected and
    /// recovered; returns the position streaming resumes from. In sync
    /// mode this never returns: the process exits through
    /// [`Api::finish_sync_safekeepers`].
    pub fn start(&mut self) -> Lsn {
        for i in 0..self.safekeepers.len() {
            self.reset_connection(i);
        }
        loop {
            self.poll_once(false);
            if let Some(lsn) = self.stream_start.take() {
                return lsn;
            }
        }
    }

    /// The host produced WAL up to `end`; push it out.
    pub fn broadcast(&mut self, begin: Lsn, end: Lsn) {
        debug_assert!(begin == self.available_lsn && end >= self.available_lsn);
        self.available_lsn = end;
        self.broadcast_append();
    }

    /// Run the event loop until the host signals new WAL, either through
    /// the latch or by its flushed pointer overtaking us.
    pub fn poll(&mut self) {
        loop {
            match self.poll_once(true) {
                PollOutcome::Latch | PollOutcome::NewWal => break,
                PollOutcome::Timeout | PollOutcome::Dispatched => {}
            }
        }
    }

    pub fn term(&self) -> Term {
        self.prop_term
    }

    pub fn epoch_start_lsn(&self) -> Lsn {
        self.prop_epoch_start_lsn
    }

    pub fn truncate_lsn(&self) -> Lsn {
        self.truncate_lsn
    }

    pub fn available_lsn(&self) -> Lsn {
        self.available_lsn
    }

    pub fn last_sent_commit_lsn(&self) -> Lsn {
        self.last_sent_commit_lsn
    }

    pub fn metrics(&self) -> &ProposerMetrics {
        &self.metrics
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn api_mut(&mut self) -> &mut A {
        &mut self.api
    }

    fn poll_once(&mut self, check_new_wal: bool) -> PollOutcome {
        let now = self.api.now();
        let timeout = self.time_to_reconnect(now);

        let event = self.api.wait(timeout);
        let timed_out = matches!(event, WaitEvent::Timeout);
        match event {
            WaitEvent::Latch => return PollOutcome::Latch,
            WaitEvent::Socket(i, readiness) => self.advance(i, readiness),
            WaitEvent::Timeout => {}
        }

        self.reconnect_safekeepers();

        if timed_out
            && check_new_wal
            && !self.config.sync_safekeepers
            && self.api.flushed_lsn() > self.available_lsn
        {
            // We missed a notification; let the host broadcast.
            return PollOutcome::NewWal;
        }

        let now = self.api.now();
        if timed_out || self.time_to_reconnect(now).is_none_or(|d| d.is_zero()) {
            // Quiet interval with a quorum already held: heartbeat so
            // acknowledgements keep flowing.
            if self.available_lsn.is_valid() {
                self.broadcast_append();
            }
            self.enforce_connection_timeout(now);
        }

        if timed_out {
            PollOutcome::Timeout
        } else {
            PollOutcome::Dispatched
        }
    }

    /// Milliseconds until the next reconnect sweep; `None` when
    /// reconnection is disabled, zero when a sweep is due.
    fn time_to_reconnect(&self, now: Duration) -> Option<Duration> {
        let period = self.config.reconnect_timeout_ms;
        if period <= 0 {
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let period = Duration::from_millis(period as u64);
        let passed = now.saturating_sub(self.last_reconnect_attempt);
        Some(period.saturating_sub(passed))
    }

    fn reconnect_safekeepers(&mut self) {
        let now = self.api.now();
        if self.time_to_reconnect(now) != Some(Duration::ZERO) {
            return;
        }
        self.last_reconnect_attempt = now;
        for i in 0..self.safekeepers.len() {
            if self.safekeepers[i].state == SkState::Offline {
                self.metrics.reconnect_attempts_total.inc();
                self.reset_connection(i);
            }
        }
    }

    fn enforce_connection_timeout(&mut self, now: Duration) {
        let timeout = self.config.connection_timeout_ms;
        if timeout <= 0 {
            return;
        }
        #[allow(clippy::cast_sign_loss)]
        let timeout = Duration::from_millis(timeout as u64);
        for i in 0..self.safekeepers.len() {
            if self.safekeepers[i].state == SkState::Offline {
                continue;
            }
            if now.saturating_sub(self.safekeepers[i].latest_msg_received_at) > timeout {
                warn!(
                    safekeeper = %self.safekeepers[i].addr(),
                    state = self.safekeepers[i].state.name(),
                    timeout_ms = self.config.connection_timeout_ms,
                    "terminating connection: no message within the connection timeout"
                );
                self.metrics.inactivity_shutdowns_total.inc();
                self.shutdown_connection(i);
            }
        }
    }

    /// Tear down a connection and return the safekeeper to `Offline`.
    ///
    /// The last append response is kept: a dead safekeeper's flushed
    /// position still counts towards commit and truncate arithmetic.
    fn shutdown_connection(&mut self, i: usize) {
        self.api.close(i);
        let sk = &mut self.safekeepers[i];
        sk.state = SkState::Offline;
        sk.flush_write = false;
        sk.streaming_at = Lsn::INVALID;
        sk.vote = walsync_core::VoteResponse::default();
        self.rebuild_event_set(None);
    }

    /// (Re)start a connection attempt.
    fn reset_connection(&mut self, i: usize) {
        if self.safekeepers[i].state != SkState::Offline {
            self.shutdown_connection(i);
        }

        self.api.connect_start(i, &self.safekeepers[i].endpoint.conninfo);
        if self.api.conn_status(i) == ConnStatus::Bad {
            // Bad parameters, not a transient failure. Do not log the
            // conninfo, it may carry credentials.
            warn!(
                safekeeper = %self.safekeepers[i].addr(),
                error = %self.api.conn_error(i),
                "immediate connection failure"
            );
            self.api.close(i);
            return;
        }

        info!(safekeeper = %self.safekeepers[i].addr(), "connecting");
        self.safekeepers[i].state = SkState::ConnectingWrite;
        self.safekeepers[i].latest_msg_received_at = self.api.now();
        self.api.register(i, Readiness::WRITE);
    }

    /// Dropping one connection rebuilds the whole event set from the
    /// survivors. Connection churn is rare next to the streaming hot
    /// path, so the simplicity wins.
    fn rebuild_event_set(&mut self, exclude: Option<usize>) {
        self.api.reset_event_set();
        for i in 0..self.safekeepers.len() {
            if Some(i) == exclude {
                continue;
            }
            let state = self.safekeepers[i].state;
            if state == SkState::Offline {
                continue;
            }
            let interest = if state == SkState::Active {
                self.active_interest(i)
            } else {
                state.desired_events()
            };
            self.api.register(i, interest);
        }
    }

    /// `Active` wants the socket writable only while it has something to
    /// write.
    fn active_interest(&self, i: usize) -> Readiness {
        let sk = &self.safekeepers[i];
        if sk.streaming_at != self.available_lsn || sk.flush_write {
            Readiness::READ_WRITE
        } else {
            Readiness::READ
        }
    }

    fn check_events(&mut self, i: usize, events: Readiness) {
        let expected = self.safekeepers[i].state.desired_events();
        let ok = if expected.is_none() {
            events.is_none()
        } else {
            events.intersects(expected)
        };
        if !ok {
            warn!(
                safekeeper = %self.safekeepers[i].addr(),
                state = self.safekeepers[i].state.name(),
                ?events,
                ?expected,
                "socket events do not match the state's interest"
            );
            debug_assert!(ok, "events mismatched for state");
        }
    }

    /// Advance one safekeeper's state machine after its socket fired.
    fn advance(&mut self, i: usize, events: Readiness) {
        self.check_events(i, events);
        match self.safekeepers[i].state {
            SkState::Offline => {
                // Offline connections are not in the event set.
                let why = format!(
                    "event dispatched for offline safekeeper {}",
                    self.safekeepers[i].addr()
                );
                self.api.fatal(&why);
            }
            SkState::ConnectingRead | SkState::ConnectingWrite => self.handle_connection_event(i),
            SkState::WaitExecResult => self.recv_exec_result(i),
            SkState::HandshakeRecv => self.recv_acceptor_greeting(i),
            SkState::Voting | SkState::Idle => {
                // These states expect nothing; readability means the peer
                // hung up.
                warn!(
                    safekeeper = %self.safekeepers[i].addr(),
                    state = self.safekeepers[i].state.name(),
                    "peer disconnected while parked"
                );
                self.reset_connection(i);
            }
            SkState::WaitVerdict => self.recv_vote_response(i),
            SkState::SendElectedFlush => {
                // Move on only once the announcement is fully flushed.
                if self.async_flush(i) {
                    self.start_streaming_to(i);
                }
            }
            SkState::Active => self.handle_active(i, events),
        }
    }

    fn handle_connection_event(&mut self, i: usize) {
        let result = self.api.connect_poll(i);
        let new_interest = match result {
            ConnectPoll::Ok => {
                info!(safekeeper = %self.safekeepers[i].addr(), "connected");
                self.safekeepers[i].latest_msg_received_at = self.api.now();
                // Some interest is needed to keep the slot registered;
                // reading is what comes next.
                Readiness::READ
            }
            ConnectPoll::NeedRead => {
                self.safekeepers[i].state = SkState::ConnectingRead;
                Readiness::READ
            }
            ConnectPoll::NeedWrite => {
                self.safekeepers[i].state = SkState::ConnectingWrite;
                Readiness::WRITE
            }
            ConnectPoll::Failed => {
                warn!(
                    safekeeper = %self.safekeepers[i].addr(),
                    error = %self.api.conn_error(i),
                    "failed to connect"
                );
                // Restarting here could loop tightly; park the safekeeper
                // and let the reconnect supervisor pick it up.
                self.shutdown_connection(i);
                return;
            }
        };

        // Connection polling may switch the underlying socket, so the
        // old registration cannot be reused.
        self.rebuild_event_set(Some(i));
        self.api.register(i, new_interest);

        if result == ConnectPoll::Ok {
            self.send_start_wal_push(i);
        }
    }

    fn send_start_wal_push(&mut self, i: usize) {
        if !self.api.send_query(i, START_WAL_PUSH_QUERY) {
            warn!(
                safekeeper = %self.safekeepers[i].addr(),
                error = %self.api.conn_error(i),
                "failed to send {START_WAL_PUSH_QUERY}"
            );
            self.shutdown_connection(i);
            return;
        }
        self.safekeepers[i].state = SkState::WaitExecResult;
        self.api.update_interest(i, Readiness::READ);
    }

    fn recv_exec_result(&mut self, i: usize) {
        match self.api.query_result(i) {
            ExecResult::CopyBothStarted => {
                let msg = ProposerMessage::Greeting(self.greeting.clone());
                self.blocking_write_msg(i, &msg, SkState::HandshakeRecv);
            }
            ExecResult::NeedsInput => {}
            ExecResult::Failed => {
                warn!(
                    safekeeper = %self.safekeepers[i].addr(),
                    error = %self.api.conn_error(i),
                    "control query failed"
                );
                self.shutdown_connection(i);
            }
            ExecResult::UnexpectedSuccess => {
                warn!(
                    safekeeper = %self.safekeepers[i].addr(),
                    "control query returned something other than a copy stream"
                );
                self.shutdown_connection(i);
            }
        }
    }

    fn recv_acceptor_greeting(&mut self, i: usize) {
        let Some(msg) = self.read_message(i) else {
            return;
        };
        let greeting = match msg {
            AcceptorMessage::Greeting(g) => g,
            other => return self.unexpected_message(i, other.kind()),
        };

        info!(
            safekeeper = %self.safekeepers[i].addr(),
            node_id = %greeting.node_id,
            term = %greeting.term,
            "received safekeeper greeting"
        );
        self.safekeepers[i].greeting = greeting;
        self.safekeepers[i].state = SkState::Voting;

        self.n_connected += 1;
        if self.n_connected <= self.quorum {
            // Still collecting terms from the majority.
            self.prop_term = self.prop_term.max(greeting.term);

            if self.n_connected == self.quorum {
                self.prop_term = self.prop_term.next();
                info!(
                    quorum = self.quorum,
                    term = %self.prop_term,
                    "connected to a quorum of safekeepers"
                );
                self.vote_request = VoteRequest {
                    term: self.prop_term,
                    proposer_id: self.greeting.proposer_id,
                };
            }
        } else if greeting.term > self.prop_term {
            let why = format!(
                "safekeeper {} holds term {}, above our term {}: concurrent proposer running",
                self.safekeepers[i].addr(),
                greeting.term,
                self.prop_term,
            );
            self.api.fatal(&why);
        }

        if self.n_connected < self.quorum {
            // Park until the election can start; readability now only
            // means disconnection.
            self.api.update_interest(i, Readiness::READ);
        } else {
            // Election is on: ask everyone who has greeted and not yet
            // been asked.
            for j in 0..self.safekeepers.len() {
                if self.safekeepers[j].state == SkState::Voting {
                    self.send_vote_request(j);
                }
            }
        }
    }

    fn send_vote_request(&mut self, i: usize) {
        info!(
            safekeeper = %self.safekeepers[i].addr(),
            term = %self.vote_request.term,
            "requesting vote"
        );
        let msg = ProposerMessage::VoteRequest(self.vote_request.clone());
        self.blocking_write_msg(i, &msg, SkState::WaitVerdict);
    }

    fn recv_vote_response(&mut self, i: usize) {
        let Some(msg) = self.read_message(i) else {
            return;
        };
        let vote = match msg {
            AcceptorMessage::Vote(v) => v,
            other => return self.unexpected_message(i, other.kind()),
        };

        info!(
            safekeeper = %self.safekeepers[i].addr(),
            vote_given = vote.vote_given,
            epoch = %vote.term_history.highest_term(),
            flush_lsn = %vote.flush_lsn,
            truncate_lsn = %vote.truncate_lsn,
            timeline_start_lsn = %vote.timeline_start_lsn,
            "received vote"
        );

        // A refusal matters if the refuser lives in a higher term
        // (concurrent proposer) or we still need its vote.
        if !vote.granted() && (vote.term > self.prop_term || self.n_votes < self.quorum) {
            let why = format!(
                "safekeeper {} with term {} rejected our vote request for term {}",
                self.safekeepers[i].addr(),
                vote.term,
                self.prop_term,
            );
            self.api.fatal(&why);
        }
        debug_assert_eq!(vote.term, self.prop_term);
        self.safekeepers[i].vote = vote;

        self.n_votes += 1;
        if self.n_votes < self.quorum {
            // No quorum yet; park.
            self.safekeepers[i].state = SkState::Idle;
        } else if self.n_votes > self.quorum {
            // Election long done; recovery already ran. Stream.
            self.send_proposer_elected(i);
        } else {
            self.safekeepers[i].state = SkState::Idle;
            self.api.update_interest(i, Readiness::READ);
            self.handle_elected();
        }
    }

    /// A quorum voted for us. Fix the epoch start, recover the donor's
    /// missing WAL if needed, and announce the result.
    fn handle_elected(&mut self) {
        self.determine_epoch_start_lsn();

        if self.truncate_lsn < self.prop_epoch_start_lsn {
            // Someone is missing WAL that only the donor holds.
            info!(
                truncate_lsn = %self.truncate_lsn,
                epoch_start_lsn = %self.prop_epoch_start_lsn,
                donor = %self.safekeepers[self.donor].addr(),
                "recovering the gap from the donor"
            );
            let (donor, timeline) = (self.donor, self.config.pg_timeline);
            if !self
                .api
                .recovery_download(donor, timeline, self.truncate_lsn, self.prop_epoch_start_lsn)
            {
                self.api.fatal("failed to download recovery WAL from the donor");
            }
        } else if self.config.sync_safekeepers {
            // Nothing to catch up; the position is already quorum-safe.
            self.api.finish_sync_safekeepers(self.prop_epoch_start_lsn);
        }

        self.metrics.elections_total.inc();

        for i in 0..self.safekeepers.len() {
            if self.safekeepers[i].state == SkState::Idle {
                self.send_proposer_elected(i);
            }
        }

        if self.config.sync_safekeepers {
            // Force a feedback round even from safekeepers that needed no
            // data, so they report the epoch switch and sync can finish.
            self.broadcast_append();
            return;
        }

        self.stream_start = Some(self.prop_epoch_start_lsn);
    }

    fn determine_epoch_start_lsn(&mut self) {
        let outcome = election::tally_votes(
            self.safekeepers
                .iter()
                .enumerate()
                .filter(|(_, sk)| sk.state == SkState::Idle)
                .map(|(i, sk)| (i, &sk.vote)),
        );

        if outcome.timeline_start_mismatches > 0 {
            warn!(
                mismatches = outcome.timeline_start_mismatches,
                timeline_start_lsn = %outcome.timeline_start_lsn,
                "voters disagree about the timeline start position"
            );
            for _ in 0..outcome.timeline_start_mismatches {
                self.metrics.timeline_start_lsn_mismatches_total.inc();
            }
        }

        self.donor = outcome.donor;
        self.donor_epoch = outcome.donor_epoch;
        self.prop_epoch_start_lsn = outcome.epoch_start_lsn;
        self.truncate_lsn = outcome.truncate_lsn;
        self.timeline_start_lsn = outcome.timeline_start_lsn;

        if !self.prop_epoch_start_lsn.is_valid() && !self.config.sync_safekeepers {
            // Bootstrap: nothing was ever committed. Start at the redo
            // position of the host's on-disk image.
            let redo = self.api.redo_start_lsn();
            self.prop_epoch_start_lsn = redo;
            self.truncate_lsn = redo;
            if !self.timeline_start_lsn.is_valid() {
                self.timeline_start_lsn = redo;
            }
            info!(epoch_start_lsn = %redo, "bootstrapping from the redo position");
        }

        // Any nonzero epoch start means some append reached a safekeeper,
        // and appends always carry a truncate position.
        assert!(
            self.truncate_lsn.is_valid()
                || (self.config.sync_safekeepers && self.truncate_lsn == self.prop_epoch_start_lsn),
            "epoch start without a truncate horizon"
        );

        // We will write from the epoch start; nothing newer exists yet.
        self.available_lsn = self.prop_epoch_start_lsn;

        self.prop_history = self.safekeepers[self.donor]
            .vote
            .term_history
            .with_entry(self.prop_term, self.prop_epoch_start_lsn);

        info!(
            quorum = self.quorum,
            term = %self.prop_term,
            epoch_start_lsn = %self.prop_epoch_start_lsn,
            donor = %self.safekeepers[self.donor].addr(),
            truncate_lsn = %self.truncate_lsn,
            "elected by a majority"
        );

        if !self.config.sync_safekeepers {
            // The host's on-disk image must line up with the position the
            // vote settled on; otherwise its non-WAL state is from a
            // different history. Safekeepers keep the page header bytes
            // that the image's redo pointer skips.
            let redo = self.api.redo_start_lsn();
            let aligned = self
                .prop_epoch_start_lsn
                .skip_page_header(u64::from(self.config.wal_seg_size));
            if aligned != redo {
                let donor_last_term =
                    self.safekeepers[self.donor].vote.term_history.highest_term();
                let mine = self.api.shared_state().mine_last_elected_term();
                // A plain restart of ourselves is fine: the image is our
                // own, even though the positions moved.
                if donor_last_term == Term::NONE || donor_last_term != mine {
                    let why = format!(
                        "voted epoch start {} does not match the basebackup position {}",
                        self.prop_epoch_start_lsn, redo,
                    );
                    self.api.fatal(&why);
                }
            }
            self.api
                .shared_state()
                .set_mine_last_elected_term(self.prop_term);
        }

        // Logical replication may need WAL further back than the
        // safekeepers do; let the host lower the horizon.
        self.api.after_election(&mut self.truncate_lsn);
    }

    /// Tell one voted safekeeper about the election: our term, the agreed
    /// history, and where its own log ends relative to it.
    fn send_proposer_elected(&mut self, i: usize) {
        let start = election::stream_start(
            &self.prop_history,
            self.prop_term,
            &self.safekeepers[i].vote,
            self.truncate_lsn,
        );
        if start.clamped {
            warn!(
                safekeeper = %self.safekeepers[i].addr(),
                history_start = %self.prop_history.0[0].lsn,
                start_streaming_at = %start.lsn,
                "empty safekeeper joined the cluster; starting it at the truncate horizon"
            );
            self.metrics.empty_safekeeper_joins_total.inc();
        }

        assert!(
            self.truncate_lsn <= start.lsn && start.lsn <= self.available_lsn,
            "stream start out of bounds"
        );
        self.safekeepers[i].start_streaming_at = start.lsn;

        let msg = ProposerMessage::Elected(ProposerElected {
            term: self.prop_term,
            start_streaming_at: start.lsn,
            term_history: self.prop_history.clone(),
            timeline_start_lsn: self.timeline_start_lsn,
        });
        info!(
            safekeeper = %self.safekeepers[i].addr(),
            node_id = %self.safekeepers[i].greeting.node_id,
            term = %self.prop_term,
            start_streaming_at = %start.lsn,
            history_entries = self.prop_history.len(),
            timeline_start_lsn = %self.timeline_start_lsn,
            "sending election announcement"
        );

        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        if self.async_write_msg(i, &buf, SkState::SendElectedFlush) {
            self.start_streaming_to(i);
        }
    }

    /// The only entry into `Active`; runs exactly once per connection.
    fn start_streaming_to(&mut self, i: usize) {
        self.safekeepers[i].state = SkState::Active;
        self.safekeepers[i].streaming_at = self.safekeepers[i].start_streaming_at;
        self.send_message_to(i);
    }

    /// Push whatever this safekeeper is owed, right now, and settle the
    /// event interest.
    fn send_message_to(&mut self, i: usize) {
        debug_assert_eq!(self.safekeepers[i].state, SkState::Active);
        self.handle_active(i, Readiness::WRITE);
    }

    fn broadcast_append(&mut self) {
        for i in 0..self.safekeepers.len() {
            if self.safekeepers[i].state == SkState::Active {
                self.send_message_to(i);
            }
        }
    }

    fn handle_active(&mut self, i: usize, events: Readiness) {
        if events.write && !self.send_append_requests(i) {
            return;
        }
        if events.read && !self.recv_append_responses(i) {
            return;
        }
        let interest = self.active_interest(i);
        self.api.update_interest(i, interest);
    }

    /// Stream from the cursor until caught up or the socket stops taking
    /// bytes. Sends at least one message per wakeup, possibly an empty
    /// heartbeat, so commit and truncate positions always reach the peer.
    ///
    /// Returns false if the connection died.
    fn send_append_requests(&mut self, i: usize) -> bool {
        if self.safekeepers[i].flush_write {
            match self.api.flush(i) {
                Flush::Done => self.safekeepers[i].flush_write = false,
                Flush::Pending => return true,
                Flush::Failed => {
                    warn!(
                        safekeeper = %self.safekeepers[i].addr(),
                        error = %self.api.conn_error(i),
                        "failed to flush append"
                    );
                    self.reset_connection(i);
                    return false;
                }
            }
        }

        let mut sent_anything = false;
        while self.safekeepers[i].streaming_at != self.available_lsn || !sent_anything {
            sent_anything = true;

            let begin = self.safekeepers[i].streaming_at;
            let end = Lsn((begin.0 + MAX_SEND_SIZE).min(self.available_lsn.0));
            let hdr = AppendRequestHeader {
                term: self.prop_term,
                epoch_start_lsn: self.prop_epoch_start_lsn,
                begin_lsn: begin,
                end_lsn: end,
                commit_lsn: self.acknowledged_position(),
                truncate_lsn: self.truncate_lsn,
                proposer_id: self.greeting.proposer_id,
            };
            trace!(
                safekeeper = %self.safekeepers[i].addr(),
                begin_lsn = %hdr.begin_lsn,
                end_lsn = %hdr.end_lsn,
                commit_lsn = %hdr.commit_lsn,
                truncate_lsn = %hdr.truncate_lsn,
                "sending append"
            );

            let mut buf = BytesMut::new();
            ProposerMessage::Append(AppendRequest {
                hdr,
                wal: Bytes::new(),
            })
            .encode(&mut buf);
            let hdr_len = buf.len();
            #[allow(clippy::cast_possible_truncation)]
            let wal_len = (end - begin) as usize;
            buf.resize(hdr_len + wal_len, 0);
            if wal_len > 0 {
                self.api.wal_read(begin, &mut buf[hdr_len..]);
            }

            let result = self.api.write_message(i, &buf);
            // The message is ours to flush now; the cursor moves either
            // way.
            self.safekeepers[i].streaming_at = end;
            match result {
                AsyncWrite::Done => {}
                AsyncWrite::TryFlush => {
                    self.safekeepers[i].flush_write = true;
                    return true;
                }
                AsyncWrite::Failed => {
                    warn!(
                        safekeeper = %self.safekeepers[i].addr(),
                        error = %self.api.conn_error(i),
                        "failed to send append"
                    );
                    self.shutdown_connection(i);
                    return false;
                }
            }
        }
        true
    }

    /// Drain every acknowledgement already buffered, then recompute the
    /// cluster positions. Returns false if the connection died.
    fn recv_append_responses(&mut self, i: usize) -> bool {
        let mut read_anything = false;
        loop {
            let Some(msg) = self.read_message(i) else {
                break;
            };
            let response = match msg {
                AcceptorMessage::Append(r) => r,
                other => {
                    self.unexpected_message(i, other.kind());
                    break;
                }
            };
            trace!(
                safekeeper = %self.safekeepers[i].addr(),
                term = %response.term,
                flush_lsn = %response.flush_lsn,
                commit_lsn = %response.commit_lsn,
                "received append response"
            );

            if response.term > self.prop_term {
                let why = format!(
                    "safekeeper {} with term {} rejected our append for term {}: \
                     concurrent proposer running",
                    self.safekeepers[i].addr(),
                    response.term,
                    self.prop_term,
                );
                self.api.fatal(&why);
            }

            if let Some(ps) = &response.ps {
                self.api.shared_state().update_feedback(ps);
            }
            self.safekeepers[i].append_response = response;
            read_anything = true;
        }

        if !read_anything {
            return self.safekeepers[i].state == SkState::Active;
        }

        self.handle_safekeeper_response();

        // If the drain moved the commit position, everyone should hear
        // about it promptly.
        let committed = self.acknowledged_position();
        if committed > self.last_sent_commit_lsn {
            self.broadcast_append();
            self.last_sent_commit_lsn = committed;
        }

        self.safekeepers[i].state == SkState::Active
    }

    /// Position acknowledged by a quorum in the current epoch.
    fn acknowledged_position(&self) -> Lsn {
        let flushes: Vec<Lsn> = self
            .safekeepers
            .iter()
            .map(|sk| sk.append_response.flush_lsn)
            .collect();
        election::acknowledged_position(&flushes, self.prop_epoch_start_lsn, self.quorum)
    }

    /// Oldest flushed position across every safekeeper: the discard
    /// horizon.
    fn min_flush_lsn(&self) -> Lsn {
        self.safekeepers
            .iter()
            .map(|sk| sk.append_response.flush_lsn)
            .min()
            .unwrap_or(Lsn::INVALID)
    }

    fn handle_safekeeper_response(&mut self) {
        let committed = self.acknowledged_position();
        self.api.process_feedback(committed);

        // The truncate horizon follows the slowest safekeeper. It stays
        // below every commit position ever sent: acknowledgements land on
        // record boundaries and pre-epoch positions cannot commit.
        let min_flush = self.min_flush_lsn();
        if min_flush > self.truncate_lsn {
            self.truncate_lsn = min_flush;
            self.api.confirm_wal_streamed(self.truncate_lsn);
        }

        if self.config.sync_safekeepers {
            // Sync finishes when every live safekeeper confirmed the
            // epoch start as committed; whichever of them the reader
            // connects to can then serve the full log.
            let mut n_synced = 0;
            for sk in &self.safekeepers {
                let synced = sk.append_response.commit_lsn >= self.prop_epoch_start_lsn;
                if sk.state != SkState::Offline && !synced {
                    return;
                }
                if synced {
                    n_synced += 1;
                }
            }
            if n_synced >= self.quorum {
                // Push the final truncate position out first; no ack is
                // needed for correctness.
                self.broadcast_append();
                self.api.finish_sync_safekeepers(self.prop_epoch_start_lsn);
            }
        }
    }

    /// Try to read and decode one frame. `None` means "nothing yet" or
    /// "connection handled a failure"; the distinction already happened.
    fn read_message(&mut self, i: usize) -> Option<AcceptorMessage> {
        match self.api.read_message(i) {
            AsyncRead::Message(frame) => match AcceptorMessage::decode(frame) {
                Ok(msg) => {
                    self.safekeepers[i].latest_msg_received_at = self.api.now();
                    Some(msg)
                }
                Err(err) => {
                    warn!(
                        safekeeper = %self.safekeepers[i].addr(),
                        state = self.safekeepers[i].state.name(),
                        error = %err,
                        "malformed message"
                    );
                    self.reset_connection(i);
                    None
                }
            },
            AsyncRead::WouldBlock => None,
            AsyncRead::Failed => {
                warn!(
                    safekeeper = %self.safekeepers[i].addr(),
                    state = self.safekeepers[i].state.name(),
                    error = %self.api.conn_error(i),
                    "failed to read"
                );
                self.shutdown_connection(i);
                None
            }
        }
    }

    fn unexpected_message(&mut self, i: usize, kind: &'static str) {
        warn!(
            safekeeper = %self.safekeepers[i].addr(),
            state = self.safekeepers[i].state.name(),
            kind,
            "message kind does not fit the state"
        );
        self.reset_connection(i);
    }

    /// Write a small message in one blocking call and move to
    /// `success_state`. Used for the handshake and vote messages, which
    /// fit a socket buffer.
    fn blocking_write_msg(
        &mut self,
        i: usize,
        msg: &ProposerMessage,
        success_state: SkState,
    ) -> bool {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        if !self.api.blocking_write(i, &buf) {
            warn!(
                safekeeper = %self.safekeepers[i].addr(),
                state = self.safekeepers[i].state.name(),
                error = %self.api.conn_error(i),
                "failed to send"
            );
            self.shutdown_connection(i);
            return false;
        }
        self.safekeepers[i].state = success_state;
        let interest = success_state.desired_events();
        if !interest.is_none() {
            self.api.update_interest(i, interest);
        }
        true
    }

    /// Start an async write; on a partial write, park in `flush_state`
    /// until the flush completes. Returns true when fully written.
    fn async_write_msg(&mut self, i: usize, buf: &[u8], flush_state: SkState) -> bool {
        match self.api.write_message(i, buf) {
            AsyncWrite::Done => true,
            AsyncWrite::TryFlush => {
                self.safekeepers[i].state = flush_state;
                self.api.update_interest(i, Readiness::READ_WRITE);
                false
            }
            AsyncWrite::Failed => {
                warn!(
                    safekeeper = %self.safekeepers[i].addr(),
                    state = self.safekeepers[i].state.name(),
                    error = %self.api.conn_error(i),
                    "failed to send"
                );
                self.shutdown_connection(i);
                false
            }
        }
    }

    /// Continue a pending flush. True when done; false while pending or
    /// after a failure reset the connection.
    fn async_flush(&mut self, i: usize) -> bool {
        match self.api.flush(i) {
            Flush::Done => true,
            Flush::Pending => false,
            Flush::Failed => {
                warn!(
                    safekeeper = %self.safekeepers[i].addr(),
                    state = self.safekeepers[i].state.name(),
                    error = %self.api.conn_error(i),
                    "failed to flush"
                );
                self.reset_connection(i);
                false
            }
        }
    }
}

impl<A: Api> std::fmt::Debug for WalProposer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalProposer")
            .field("term", &self.prop_term)
            .field("epoch_start_lsn", &self.prop_epoch_start_lsn)
            .field("available_lsn", &self.available_lsn)
            .field("truncate_lsn", &self.truncate_lsn)
            .field("n_connected", &self.n_connected)
            .field("n_votes", &self.n_votes)
            .finish_non_exhaustive()
    }
}
