//! Term-switch histories.
//!
//! Every log replica remembers at which position each term began writing.
//! Comparing two of these chains tells the proposer where a safekeeper's
//! log diverged from the one the election settled on.

use crate::lsn::Lsn;
use crate::types::Term;

/// One link of the chain: `term` began writing at `lsn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSwitchEntry {
    pub term: Term,
    pub lsn: Lsn,
}

/// Ordered chain of term switches.
///
/// Terms are strictly increasing along the chain and positions are
/// non-decreasing. Two correct replicas that share a prefix of terms share
/// the positions of those terms as well.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TermHistory(pub Vec<TermSwitchEntry>);

impl TermHistory {
    #[must_use]
    pub fn new(entries: Vec<TermSwitchEntry>) -> Self {
        Self(entries)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Term of the last entry, or [`Term::NONE`] for an empty chain.
    ///
    /// For a safekeeper this is its *epoch*: the highest term it has ever
    /// written WAL under.
    #[must_use]
    pub fn highest_term(&self) -> Term {
        self.0.last().map_or(Term::NONE, |e| e.term)
    }

    /// Extend the donor's chain with our own term switch.
    #[must_use]
    pub fn with_entry(&self, term: Term, lsn: Lsn) -> TermHistory {
        let mut entries = self.0.clone();
        entries.push(TermSwitchEntry { term, lsn });
        TermHistory(entries)
    }

    /// Length of the longest shared prefix of two chains.
    ///
    /// # Panics
    ///
    /// Panics if a shared term begins at different positions in the two
    /// chains; that means one of the replicas is corrupt.
    #[must_use]
    pub fn common_prefix_len(&self, other: &TermHistory) -> usize {
        let mut i = 0;
        while i < self.0.len() && i < other.0.len() {
            if self.0[i].term != other.0[i].term {
                break;
            }
            assert_eq!(
                self.0[i].lsn, other.0[i].lsn,
                "term {} starts at different positions in two histories",
                self.0[i].term,
            );
            i += 1;
        }
        i
    }
}

#[cfg(test)]
mod tests {
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

    #[test]
    fn highest_term_of_empty_history_is_none() {
        assert_eq!(TermHistory::default().highest_term(), Term::NONE);
        assert_eq!(history(&[(2, 0x10), (5, 0x80)]).highest_term(), Term(5));
    }

    #[test]
    fn common_prefix_stops_at_first_term_divergence() {
        let ours = history(&[(1, 0x10), (3, 0x40), (6, 0x90)]);
        let theirs = history(&[(1, 0x10), (4, 0x40)]);
        assert_eq!(ours.common_prefix_len(&theirs), 1);
    }

    #[test]
    fn common_prefix_is_bounded_by_shorter_history() {
        let ours = history(&[(1, 0x10), (3, 0x40), (6, 0x90)]);
        let theirs = history(&[(1, 0x10)]);
        assert_eq!(ours.common_prefix_len(&theirs), 1);
        assert_eq!(ours.common_prefix_len(&TermHistory::default()), 0);
    }

    #[test]
    fn shared_terms_share_positions() {
        let ours = history(&[(1, 0x10), (3, 0x40)]);
        let theirs = history(&[(1, 0x10), (3, 0x40), (4, 0x55)]);
        assert_eq!(ours.common_prefix_len(&theirs), 2);
    }

    #[test]
    #[should_panic(expected = "different positions")]
    fn diverging_position_for_shared_term_is_corruption() {
        let ours = history(&[(1, 0x10), (3, 0x40)]);
        let theirs = history(&[(1, 0x10), (3, 0x50)]);
        let _ = ours.common_prefix_len(&theirs);
    }

    #[test]
    fn with_entry_appends() {
        let donor = history(&[(2, 0x10)]);
        let ours = donor.with_entry(Term(7), Lsn(0x200));
        assert_eq!(ours.len(), 2);
        assert_eq!(ours.highest_term(), Term(7));
        assert_eq!(ours.0[1].lsn, Lsn(0x200));
    }
}
