//! Test harness for the walsync proposer.
//!
//! [`SimApi`] implements the whole capability surface deterministically in
//! memory against scripted [`SimAcceptor`]s; the integration tests under
//! `tests/` drive full elections, streaming, and failure handling through
//! it without a socket in sight. A second suite exercises the tokio TCP
//! transport against scripted acceptor servers on localhost.

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod sim;

pub use acceptor::{AckPolicy, SimAcceptor};
pub use sim::{SimApi, SimExit, run_expect_exit};

use walsync_proposer::Config;

/// Configuration used by the simulation tests: `n` safekeepers, quorum
/// defaults, reconnection once a second.
#[must_use]
pub fn test_config(n: usize, sync_safekeepers: bool) -> Config {
    let safekeepers = (0..n)
        .map(|i| format!("sk-{i}:5454"))
        .collect::<Vec<_>>()
        .join(",");
    Config {
        tenant_id: "de200bd42b49cc1814412c7e592dd6e9".to_owned(),
        timeline_id: "11223344556677889900aabbccddeeff".to_owned(),
        safekeepers,
        reconnect_timeout_ms: 1000,
        connection_timeout_ms: 10_000,
        wal_seg_size: 16 * 1024 * 1024,
        sync_safekeepers,
        system_id: 0x1122_3344_5566_7788,
        pg_timeline: 1,
        pg_version: 160_002,
    }
}
