//! Walsync proposer: the leader side of quorum WAL replication.
//!
//! The engine elects itself over a fixed set of safekeepers, reconciles
//! term histories to find the authoritative log prefix, then streams WAL
//! and advances the quorum-committed position. It performs no I/O of its
//! own: hosts implement the [`Api`] capability trait and drive
//! [`WalProposer::start`] / [`WalProposer::broadcast`] /
//! [`WalProposer::poll`].
//!
//! # Architecture
//!
//! - [`api`]: the capability surface (transport verbs, event set, clock,
//!   WAL access, host callbacks)
//! - [`election`]: pure election arithmetic
//! - [`proposer`]: the single-threaded engine
//! - [`net`]: a tokio TCP transport building block for real hosts

#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod election;
pub mod metrics;
pub mod net;
pub mod proposer;
mod safekeeper;

pub use api::{
    Api, AsyncRead, AsyncWrite, ConnStatus, ConnectPoll, ExecResult, Flush, Readiness, SharedState,
    WaitEvent,
};
pub use config::{Config, ConfigError, Endpoint};
pub use metrics::ProposerMetrics;
pub use proposer::{MAX_SEND_SIZE, WalProposer};
pub use safekeeper::SkState;
