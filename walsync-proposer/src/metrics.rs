//! Proposer metrics.

use measured::{Counter, MetricGroup};

/// Counters exported by one proposer instance.
#[derive(MetricGroup)]
#[metric(new())]
pub struct ProposerMetrics {
    /// Reconnect attempts to offline safekeepers.
    pub reconnect_attempts_total: Counter,

    /// Connections torn down for staying silent past the timeout.
    pub inactivity_shutdowns_total: Counter,

    /// Elections this proposer won.
    pub elections_total: Counter,

    /// Voters reporting a timeline start position that disagreed with an
    /// earlier voter's.
    pub timeline_start_lsn_mismatches_total: Counter,

    /// Safekeepers that joined with no WAL in common and had their start
    /// position clamped to the truncate horizon.
    pub empty_safekeeper_joins_total: Counter,
}

impl Default for ProposerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
