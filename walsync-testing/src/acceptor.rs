//! Scripted in-memory safekeeper.
//!
//! Implements just enough of the acceptor side to drive the proposer
//! through elections and streaming: it answers greetings, votes, adopts
//! the announced history, and acknowledges appends according to a
//! configurable policy. Tests poke its fields to stage cluster states.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use walsync_core::{
    AcceptorGreeting, AcceptorMessage, AppendResponse, Lsn, NodeId, PageserverFeedback,
    ProposerMessage, Term, TermHistory, VoteResponse,
};

/// How a scripted safekeeper acknowledges appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge everything it is sent.
    All,
    /// Report flushes only up to the given position; the lagging-peer
    /// case.
    UpTo(Lsn),
    /// Receive silently, never acknowledge.
    Silent,
}

/// One scripted safekeeper.
#[derive(Debug)]
pub struct SimAcceptor {
    pub node_id: NodeId,
    pub term: Term,
    pub flush_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub truncate_lsn: Lsn,
    pub term_history: TermHistory,
    pub timeline_start_lsn: Lsn,

    /// Whether to answer the proposer's greeting at all.
    pub respond_greeting: bool,
    /// Grant the next vote request.
    pub vote_given: bool,
    pub ack_policy: AckPolicy,
    /// Claim this term on the next append response; stages a concurrent
    /// proposer.
    pub poison_term: Option<Term>,
    /// Attach this feedback block to every append response.
    pub feedback: Option<PageserverFeedback>,

    /// Every message the proposer delivered, in order.
    pub received: Vec<ProposerMessage>,
    outbox: VecDeque<Bytes>,
}

impl SimAcceptor {
    #[must_use]
    pub fn new(node_id: u64) -> Self {
        Self {
            node_id: NodeId(node_id),
            term: Term::NONE,
            flush_lsn: Lsn::INVALID,
            commit_lsn: Lsn::INVALID,
            truncate_lsn: Lsn::INVALID,
            term_history: TermHistory::default(),
            timeline_start_lsn: Lsn::INVALID,
            respond_greeting: true,
            vote_given: true,
            ack_policy: AckPolicy::All,
            poison_term: None,
            feedback: None,
            received: Vec::new(),
            outbox: VecDeque::new(),
        }
    }

    /// Stage an established replica: `term` began at `history_start` and
    /// WAL is present up to `flush`.
    pub fn seed(&mut self, term: u64, history_start: u64, flush: u64, truncate: u64) {
        self.term = Term(term);
        self.term_history = TermHistory::default().with_entry(Term(term), Lsn(history_start));
        self.flush_lsn = Lsn(flush);
        self.truncate_lsn = Lsn(truncate);
        self.timeline_start_lsn = Lsn(history_start);
    }

    /// Queue a raw frame for the proposer to read.
    pub fn inject_frame(&mut self, frame: Bytes) {
        self.outbox.push_back(frame);
    }

    #[must_use]
    pub fn has_output(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn pop_output(&mut self) -> Option<Bytes> {
        self.outbox.pop_front()
    }

    /// Frames queued but never read die with the connection.
    pub fn drop_output(&mut self) {
        self.outbox.clear();
    }

    fn respond(&mut self, msg: &AcceptorMessage) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        self.outbox.push_back(buf.freeze());
    }

    /// The appends received, for assertions.
    #[must_use]
    pub fn appends(&self) -> Vec<&walsync_core::AppendRequest> {
        self.received
            .iter()
            .filter_map(|m| match m {
                ProposerMessage::Append(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    /// The election announcements received, for assertions.
    #[must_use]
    pub fn elected_messages(&self) -> Vec<&walsync_core::ProposerElected> {
        self.received
            .iter()
            .filter_map(|m| match m {
                ProposerMessage::Elected(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    /// Process one proposer message, queueing whatever a safekeeper
    /// would answer.
    pub fn handle(&mut self, msg: ProposerMessage) {
        match &msg {
            ProposerMessage::Greeting(_) => {
                if self.respond_greeting {
                    let reply = AcceptorMessage::Greeting(AcceptorGreeting {
                        term: self.term,
                        node_id: self.node_id,
                    });
                    self.respond(&reply);
                }
            }
            ProposerMessage::VoteRequest(req) => {
                if self.vote_given && req.term > self.term {
                    self.term = req.term;
                }
                let reply = AcceptorMessage::Vote(VoteResponse {
                    term: self.term,
                    vote_given: u64::from(self.vote_given),
                    flush_lsn: self.flush_lsn,
                    truncate_lsn: self.truncate_lsn,
                    term_history: self.term_history.clone(),
                    timeline_start_lsn: self.timeline_start_lsn,
                });
                self.respond(&reply);
            }
            ProposerMessage::Elected(elected) => {
                // Adopt the agreed history and truncate our log to the
                // announced divergence point.
                self.term = elected.term;
                self.term_history = elected.term_history.clone();
                self.timeline_start_lsn = elected.timeline_start_lsn;
                if self.flush_lsn > elected.start_streaming_at {
                    self.flush_lsn = elected.start_streaming_at;
                }
            }
            ProposerMessage::Append(append) => {
                let hdr = append.hdr;
                if let Some(term) = self.poison_term.take() {
                    let reply = AcceptorMessage::Append(AppendResponse {
                        term,
                        flush_lsn: self.flush_lsn,
                        commit_lsn: self.commit_lsn,
                        hs: walsync_core::HotStandbyFeedback::default(),
                        ps: None,
                    });
                    self.respond(&reply);
                    self.received.push(msg);
                    return;
                }

                let acked = match self.ack_policy {
                    AckPolicy::All => Some(hdr.end_lsn),
                    AckPolicy::UpTo(limit) => Some(hdr.end_lsn.min(limit)),
                    AckPolicy::Silent => None,
                };
                if let Some(acked) = acked {
                    self.flush_lsn = self.flush_lsn.max(acked);
                    self.commit_lsn = self.commit_lsn.max(hdr.commit_lsn.min(self.flush_lsn));
                    self.truncate_lsn = self.truncate_lsn.max(hdr.truncate_lsn);

                    let reply = AcceptorMessage::Append(AppendResponse {
                        term: self.term,
                        flush_lsn: self.flush_lsn,
                        commit_lsn: self.commit_lsn,
                        hs: walsync_core::HotStandbyFeedback::default(),
                        ps: self.feedback,
                    });
                    self.respond(&reply);
                }
            }
        }
        self.received.push(msg);
    }
}
