//! Election arithmetic, kept free of I/O so it can be tested directly.

use walsync_core::{Lsn, Term, TermHistory, VoteResponse};

/// Majority size for `n` safekeepers.
#[must_use]
pub fn quorum_size(n: usize) -> usize {
    n / 2 + 1
}

/// Position acknowledged by a quorum, given every safekeeper's flushed
/// position.
///
/// Positions before `epoch_start_lsn` are treated as zero: like a Raft
/// leader, the proposer may not count entries written under previous
/// terms towards its own commit.
#[must_use]
pub fn acknowledged_position(flush_lsns: &[Lsn], epoch_start_lsn: Lsn, quorum: usize) -> Lsn {
    let mut acked: Vec<Lsn> = flush_lsns
        .iter()
        .map(|&lsn| if lsn >= epoch_start_lsn { lsn } else { Lsn::INVALID })
        .collect();
    acked.sort_unstable();
    acked[acked.len() - quorum]
}

/// What the vote tally decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionOutcome {
    /// Index of the most advanced voter; recovery pulls from it and its
    /// history seeds ours.
    pub donor: usize,
    /// The donor's epoch (highest term in its history).
    pub donor_epoch: Term,
    /// The donor's flushed position: where our term will begin writing.
    pub epoch_start_lsn: Lsn,
    /// Highest truncate position any voter reported.
    pub truncate_lsn: Lsn,
    /// Global log start, if any voter knew it.
    pub timeline_start_lsn: Lsn,
    /// How many voters disagreed about the log start. Surfaced as a
    /// warning and a metric; not fatal.
    pub timeline_start_mismatches: u32,
}

/// Pick the donor and epoch start from the voted safekeepers.
///
/// The donor maximizes `(epoch, flush_lsn)` lexicographically.
///
/// # Panics
///
/// Panics if `voters` is empty; the caller only tallies after a quorum
/// voted.
#[must_use]
pub fn tally_votes<'a>(voters: impl Iterator<Item = (usize, &'a VoteResponse)>) -> ElectionOutcome {
    let mut outcome: Option<ElectionOutcome> = None;

    for (idx, vote) in voters {
        let epoch = vote.term_history.highest_term();
        let outcome = outcome.get_or_insert_with(|| ElectionOutcome {
            donor: idx,
            donor_epoch: Term::NONE,
            epoch_start_lsn: Lsn::INVALID,
            truncate_lsn: Lsn::INVALID,
            timeline_start_lsn: Lsn::INVALID,
            timeline_start_mismatches: 0,
        });

        if epoch > outcome.donor_epoch
            || (epoch == outcome.donor_epoch && vote.flush_lsn > outcome.epoch_start_lsn)
        {
            outcome.donor = idx;
            outcome.donor_epoch = epoch;
            outcome.epoch_start_lsn = vote.flush_lsn;
        }
        outcome.truncate_lsn = outcome.truncate_lsn.max(vote.truncate_lsn);

        if vote.timeline_start_lsn.is_valid() {
            if outcome.timeline_start_lsn.is_valid()
                && outcome.timeline_start_lsn != vote.timeline_start_lsn
            {
                outcome.timeline_start_mismatches += 1;
            }
            outcome.timeline_start_lsn = vote.timeline_start_lsn;
        }
    }

    outcome.expect("votes tallied without a single voter")
}

/// Where streaming to one safekeeper starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStart {
    pub lsn: Lsn,
    /// The safekeeper had no WAL in common with the agreed history and
    /// its natural start predates the truncate horizon; it was clamped
    /// up. Happens when an empty safekeeper joins an established set.
    pub clamped: bool,
}

/// Find the divergence point between our history and a voter's, and from
/// it the position to stream from.
///
/// The walk ends at the last shared term. Past it, the common log ends at
/// whichever side switched terms first; with no shared term at all the
/// safekeeper is rewritten from the beginning of the agreed history.
#[must_use]
pub fn stream_start(
    prop_history: &TermHistory,
    prop_term: Term,
    vote: &VoteResponse,
    truncate_lsn: Lsn,
) -> StreamStart {
    assert!(!prop_history.is_empty(), "proposer history not built yet");

    let common = prop_history.common_prefix_len(&vote.term_history);
    if common == 0 {
        let natural = prop_history.0[0].lsn;
        if natural < truncate_lsn {
            // The truncate horizon cannot move without this safekeeper's
            // ack and is record-aligned, so it is a safe start.
            return StreamStart {
                lsn: truncate_lsn,
                clamped: true,
            };
        }
        return StreamStart {
            lsn: natural,
            clamped: false,
        };
    }

    let last = common - 1;
    let lsn = if prop_history.0[last].term == prop_term {
        // The safekeeper already lives in our term; resume at its end.
        vote.flush_lsn
    } else {
        let our_switch = prop_history.0[last + 1].lsn;
        let their_end = vote
            .term_history
            .0
            .get(last + 1)
            .map_or(vote.flush_lsn, |e| e.lsn);
        our_switch.min(their_end)
    };
    StreamStart { lsn, clamped: false }
}

#[cfg(test)]
mod tests {
    use walsync_core::TermSwitchEntry;

    use super::*;

    fn history(entries: &[(u64, u64)]) -> TermHistory {
        TermHistory(
            entries
                .iter()
                .map(|&(t, l)| TermSwitchEntry {
                    term: Term(t),
                    lsn: Lsn(l),
                })
                .collect(),
        )
    }

    fn vote(flush: u64, truncate: u64, hist: &[(u64, u64)], start: u64) -> VoteResponse {
        VoteResponse {
            term: Term(6),
            vote_given: 1,
            flush_lsn: Lsn(flush),
            truncate_lsn: Lsn(truncate),
            term_history: history(hist),
            timeline_start_lsn: Lsn(start),
        }
    }

    #[test]
    fn quorum_is_majority() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn acknowledged_position_is_quorum_largest() {
        let flushes = [Lsn(0x400), Lsn(0x400), Lsn(0x300)];
        assert_eq!(acknowledged_position(&flushes, Lsn(0x100), 2), Lsn(0x400));
        let flushes = [Lsn(0x400), Lsn(0x200), Lsn(0x300)];
        assert_eq!(acknowledged_position(&flushes, Lsn(0x100), 2), Lsn(0x300));
    }

    #[test]
    fn acknowledged_position_masks_previous_epochs() {
        // Two safekeepers still on pre-epoch positions count as zero.
        let flushes = [Lsn(0x400), Lsn(0x80), Lsn(0x90)];
        assert_eq!(acknowledged_position(&flushes, Lsn(0x100), 2), Lsn::INVALID);
        // A quorum past the epoch start commits.
        let flushes = [Lsn(0x400), Lsn(0x300), Lsn(0x90)];
        assert_eq!(acknowledged_position(&flushes, Lsn(0x100), 2), Lsn(0x300));
    }

    #[test]
    fn donor_maximizes_epoch_then_flush() {
        let votes = [
            vote(0x200, 0, &[(4, 0x10)], 0x10),
            vote(0x180, 0, &[(5, 0x20)], 0x10),
            vote(0x1f0, 0, &[(5, 0x20)], 0x10),
        ];
        let outcome = tally_votes(votes.iter().enumerate());
        assert_eq!(outcome.donor, 2);
        assert_eq!(outcome.donor_epoch, Term(5));
        assert_eq!(outcome.epoch_start_lsn, Lsn(0x1f0));
        assert_eq!(outcome.timeline_start_mismatches, 0);
    }

    #[test]
    fn truncate_is_max_over_voters() {
        let votes = [
            vote(0x200, 0x100, &[(4, 0x10)], 0x10),
            vote(0x200, 0x150, &[(4, 0x10)], 0x10),
        ];
        let outcome = tally_votes(votes.iter().enumerate());
        assert_eq!(outcome.truncate_lsn, Lsn(0x150));
    }

    #[test]
    fn timeline_start_divergence_is_counted() {
        let votes = [
            vote(0x200, 0, &[(4, 0x10)], 0x10),
            vote(0x200, 0, &[(4, 0x10)], 0x20),
            vote(0x200, 0, &[(4, 0x10)], 0),
        ];
        let outcome = tally_votes(votes.iter().enumerate());
        assert_eq!(outcome.timeline_start_mismatches, 1);
        // Last non-zero report wins; zero reports are ignored.
        assert_eq!(outcome.timeline_start_lsn, Lsn(0x20));
    }

    #[test]
    fn empty_voters_all_report_zero() {
        let votes = [vote(0, 0, &[], 0), vote(0, 0, &[], 0)];
        let outcome = tally_votes(votes.iter().enumerate());
        assert_eq!(outcome.donor, 0);
        assert_eq!(outcome.epoch_start_lsn, Lsn::INVALID);
        assert_eq!(outcome.truncate_lsn, Lsn::INVALID);
    }

    #[test]
    fn stream_start_resumes_at_flush_within_our_term() {
        let prop = history(&[(4, 0x100), (6, 0x300)]);
        let v = vote(0x350, 0, &[(4, 0x100), (6, 0x300)], 0x100);
        let start = stream_start(&prop, Term(6), &v, Lsn(0x100));
        assert_eq!(start, StreamStart { lsn: Lsn(0x350), clamped: false });
    }

    #[test]
    fn stream_start_at_divergence_takes_earlier_switch() {
        // Shared term 4; the safekeeper went on to term 5 at 0x280 while
        // the agreed history switched at 0x300.
        let prop = history(&[(4, 0x100), (6, 0x300)]);
        let v = vote(0x350, 0, &[(4, 0x100), (5, 0x280)], 0x100);
        let start = stream_start(&prop, Term(6), &v, Lsn(0x100));
        assert_eq!(start, StreamStart { lsn: Lsn(0x280), clamped: false });
    }

    #[test]
    fn stream_start_without_next_entry_uses_their_flush() {
        let prop = history(&[(4, 0x100), (6, 0x300)]);
        let v = vote(0x250, 0, &[(4, 0x100)], 0x100);
        let start = stream_start(&prop, Term(6), &v, Lsn(0x100));
        assert_eq!(start, StreamStart { lsn: Lsn(0x250), clamped: false });
    }

    #[test]
    fn empty_safekeeper_starts_at_history_origin() {
        let prop = history(&[(6, 0x100)]);
        let v = vote(0, 0, &[], 0);
        let start = stream_start(&prop, Term(6), &v, Lsn(0x100));
        assert_eq!(start, StreamStart { lsn: Lsn(0x100), clamped: false });
    }

    #[test]
    fn empty_safekeeper_is_clamped_to_truncate_horizon() {
        let prop = history(&[(5, 0x100), (6, 0x300)]);
        let v = vote(0, 0, &[], 0);
        let start = stream_start(&prop, Term(6), &v, Lsn(0x300));
        assert_eq!(start, StreamStart { lsn: Lsn(0x300), clamped: true });
    }
}
