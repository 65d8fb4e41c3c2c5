//! Walsync core: shared protocol vocabulary.
//!
//! This crate defines the types spoken on the wire between a WAL proposer
//! and its safekeepers: log positions, consensus terms, term-switch
//! histories, and the framed messages themselves. It contains no I/O; the
//! proposer engine lives in `walsync-proposer`.

#![warn(clippy::pedantic)]

pub mod feedback;
pub mod history;
pub mod lsn;
pub mod messages;
pub mod types;

pub use feedback::{HotStandbyFeedback, PageserverFeedback};
pub use history::{TermHistory, TermSwitchEntry};
pub use lsn::Lsn;
pub use messages::{
    AcceptorGreeting, AcceptorMessage, AppendRequest, AppendRequestHeader, AppendResponse,
    ProposerElected, ProposerGreeting, ProposerMessage, VoteRequest, VoteResponse, WireError,
};
pub use types::{NodeId, TenantId, Term, TimelineId};

/// Version of the proposer/safekeeper wire protocol.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound on the configured safekeeper set.
pub const MAX_SAFEKEEPERS: usize = 32;
