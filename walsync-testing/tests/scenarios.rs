//! End-to-end scenarios over the deterministic simulation.

use std::time::Duration;

use walsync_core::{Lsn, PageserverFeedback, Term, TermHistory};
use walsync_proposer::{Api, MAX_SEND_SIZE, WalProposer};
use walsync_testing::{AckPolicy, SimApi, SimExit, run_expect_exit, test_config};

/// Initialize tracing for tests. Call at the start of each test.
/// Uses RUST_LOG env var for filtering (defaults to "debug" for walsync).
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("walsync=debug")),
        )
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

fn build(
    n: usize,
    sync: bool,
    stage: impl FnOnce(&mut SimApi),
) -> WalProposer<SimApi> {
    let mut api = SimApi::new(n, 42);
    stage(&mut api);
    WalProposer::new(test_config(n, sync), api).expect("valid test config")
}

#[test]
fn clean_election_and_streaming() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        for a in &mut api.acceptors {
            a.term = Term(5);
        }
        api.redo_start = Lsn(0x100);
    });

    let start = wp.start();
    assert_eq!(start, Lsn(0x100));
    assert_eq!(wp.term(), Term(6));
    assert_eq!(wp.epoch_start_lsn(), Lsn(0x100));
    assert_eq!(wp.truncate_lsn(), Lsn(0x100));

    // The activation heartbeat goes out before any WAL exists.
    let first = wp.api().acceptors[0].appends()[0].hdr;
    assert_eq!((first.begin_lsn, first.end_lsn), (Lsn(0x100), Lsn(0x100)));

    // The agreed history is our single term starting at the redo point.
    let elected = &wp.api().acceptors[0].elected_messages()[0];
    assert_eq!(elected.term, Term(6));
    assert_eq!(
        elected.term_history,
        TermHistory::default().with_entry(Term(6), Lsn(0x100))
    );
    assert_eq!(elected.timeline_start_lsn, Lsn(0x100));

    // 1 KiB of WAL shows up.
    wp.api_mut().wal_end = Lsn(0x500);
    wp.broadcast(Lsn(0x100), Lsn(0x500));
    wp.poll();

    for (i, acceptor) in wp.api().acceptors.iter().enumerate() {
        let appends = acceptor.appends();
        let chunk = appends
            .iter()
            .find(|a| a.hdr.begin_lsn == Lsn(0x100) && a.hdr.end_lsn == Lsn(0x500))
            .unwrap_or_else(|| panic!("acceptor {i} never got the full chunk"));
        assert_eq!(chunk.wal.len(), 0x400);
        assert_eq!(chunk.wal[0], SimApi::wal_byte(Lsn(0x100)));
        assert_eq!(chunk.wal[0x3ff], SimApi::wal_byte(Lsn(0x4ff)));
    }

    // Two acknowledgements are a quorum; the commit position was
    // rebroadcast.
    assert_eq!(wp.last_sent_commit_lsn(), Lsn(0x500));
    assert!(
        wp.api().acceptors[0]
            .appends()
            .iter()
            .any(|a| a.hdr.commit_lsn == Lsn(0x500))
    );

    // Every safekeeper flushed everything, so the discard horizon caught
    // up too.
    assert_eq!(wp.truncate_lsn(), Lsn(0x500));
    assert_eq!(wp.api().confirmed_truncates.last(), Some(&Lsn(0x500)));

    // Commit positions reported to the host never went backwards.
    let commits = &wp.api().feedback_commits;
    assert!(commits.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn donor_election_recovers_the_gap() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        // Terms 4 and 5 both start at the same positions everywhere; the
        // third safekeeper never saw term 5 and kept writing term 4.
        api.acceptors[0].seed(4, 0x100, 0x180, 0x100);
        api.acceptors[0].term_history = TermHistory::default()
            .with_entry(Term(4), Lsn(0x100))
            .with_entry(Term(5), Lsn(0x160));
        api.acceptors[1].seed(4, 0x100, 0x1f0, 0x100);
        api.acceptors[1].term_history = TermHistory::default()
            .with_entry(Term(4), Lsn(0x100))
            .with_entry(Term(5), Lsn(0x160));
        api.acceptors[2].seed(4, 0x100, 0x200, 0x100);
        for a in &mut api.acceptors {
            a.term = Term(5);
        }
        api.redo_start = Lsn(0x1f0);
    });

    let start = wp.start();

    // Donor is the voter with the highest (epoch, flush) pair.
    assert_eq!(start, Lsn(0x1f0));
    assert_eq!(wp.term(), Term(6));
    assert_eq!(wp.epoch_start_lsn(), Lsn(0x1f0));

    // Recovery fetched the gap between the horizon and the epoch start
    // from the donor before any announcement.
    assert_eq!(wp.api().recovery_calls, vec![(1, Lsn(0x100), Lsn(0x1f0))]);

    wp.poll();

    // Divergent logs restart where their history left the agreed one.
    let start_at = |i: usize| wp.api().acceptors[i].elected_messages()[0].start_streaming_at;
    assert_eq!(start_at(0), Lsn(0x180));
    assert_eq!(start_at(1), Lsn(0x1f0));
    assert_eq!(start_at(2), Lsn(0x160));

    let history = &wp.api().acceptors[1].elected_messages()[0].term_history;
    assert_eq!(history.len(), 3);
    assert_eq!(history.highest_term(), Term(6));
}

#[test]
fn concurrent_proposer_is_fatal() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.redo_start = Lsn(0x100);
    });

    wp.start();
    wp.api_mut().wal_end = Lsn(0x200);
    wp.broadcast(Lsn(0x100), Lsn(0x200));
    wp.poll();

    // A safekeeper switches to a newer proposer mid-stream.
    wp.api_mut().acceptors[2].poison_term = Some(Term(7));
    let exit = run_expect_exit(|| {
        wp.broadcast(Lsn(0x200), Lsn(0x300));
        wp.poll();
    });
    let SimExit::Fatal(why) = exit else {
        panic!("expected a fatal exit, got {exit:?}");
    };
    assert!(why.contains("concurrent proposer"), "unexpected message: {why}");
}

#[test]
fn lagging_acceptor_limits_the_truncate_horizon() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.redo_start = Lsn(0x100);
        api.acceptors[2].ack_policy = AckPolicy::UpTo(Lsn(0x300));
    });

    wp.start();
    wp.api_mut().wal_end = Lsn(0x400);
    wp.broadcast(Lsn(0x100), Lsn(0x400));
    wp.poll();

    // Two of three acknowledged everything: committed. The slow one
    // holds the discard horizon at its flush position.
    assert_eq!(wp.last_sent_commit_lsn(), Lsn(0x400));
    assert_eq!(wp.truncate_lsn(), Lsn(0x300));
    assert_eq!(wp.api().confirmed_truncates, vec![Lsn(0x300)]);

    // The straggler catches up on the next heartbeat.
    wp.api_mut().acceptors[2].ack_policy = AckPolicy::All;
    wp.broadcast(Lsn(0x400), Lsn(0x400));
    wp.poll();

    assert_eq!(wp.truncate_lsn(), Lsn(0x400));
    assert_eq!(wp.api().confirmed_truncates, vec![Lsn(0x300), Lsn(0x400)]);
    let truncates = &wp.api().confirmed_truncates;
    assert!(truncates.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn sync_mode_exits_once_a_quorum_confirms_the_epoch() {
    let _guard = init_tracing();
    let mut wp = build(3, true, |api| {
        api.acceptors[0].seed(5, 0x100, 0x200, 0x100);
        api.acceptors[1].seed(5, 0x100, 0x150, 0x100);
        api.acceptors[2].seed(5, 0x100, 0x100, 0x100);
    });

    let exit = run_expect_exit(|| wp.start());
    assert_eq!(exit, SimExit::SyncDone(Lsn(0x200)));

    // The donor gap was recovered first.
    assert_eq!(wp.api().recovery_calls, vec![(0, Lsn(0x100), Lsn(0x200))]);

    // The laggards were caught up to the epoch start.
    assert!(
        wp.api().acceptors[1]
            .appends()
            .iter()
            .any(|a| a.hdr.begin_lsn == Lsn(0x150) && a.hdr.end_lsn == Lsn(0x200))
    );

    // The farewell broadcast carried the final discard horizon.
    for acceptor in &wp.api().acceptors {
        let last = acceptor.appends().last().expect("got appends").hdr;
        assert_eq!(last.truncate_lsn, Lsn(0x200));
    }
}

#[test]
fn sync_mode_exits_immediately_when_nothing_is_missing() {
    let _guard = init_tracing();
    let mut wp = build(3, true, |api| {
        for a in &mut api.acceptors {
            a.seed(5, 0x100, 0x200, 0x200);
        }
    });

    let exit = run_expect_exit(|| wp.start());
    assert_eq!(exit, SimExit::SyncDone(Lsn(0x200)));

    // Everyone already held everything: no announcements, no appends, no
    // recovery.
    assert!(wp.api().recovery_calls.is_empty());
    for acceptor in &wp.api().acceptors {
        assert!(acceptor.elected_messages().is_empty());
        assert!(acceptor.appends().is_empty());
    }
}

#[test]
fn empty_safekeeper_is_clamped_to_the_truncate_horizon() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.acceptors[0].seed(5, 0x100, 0x300, 0x300);
        api.acceptors[1].seed(5, 0x100, 0x300, 0x300);
        // The third joins with nothing at all.
        api.redo_start = Lsn(0x300);
    });

    let start = wp.start();
    assert_eq!(start, Lsn(0x300));
    wp.poll();

    // Its natural start would be the history origin at 0x100, before the
    // horizon; it must be clamped up, not stream stale positions.
    let elected = &wp.api().acceptors[2].elected_messages()[0];
    assert_eq!(elected.start_streaming_at, Lsn(0x300));

    let elected = &wp.api().acceptors[0].elected_messages()[0];
    assert_eq!(elected.start_streaming_at, Lsn(0x300));
}

#[test]
fn vote_rejection_is_fatal_while_votes_are_needed() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.acceptors[0].vote_given = false;
        api.redo_start = Lsn(0x100);
    });

    let exit = run_expect_exit(|| wp.start());
    let SimExit::Fatal(why) = exit else {
        panic!("expected a fatal exit, got {exit:?}");
    };
    assert!(why.contains("rejected our vote"), "unexpected message: {why}");
}

#[test]
fn recovery_failure_is_fatal() {
    let _guard = init_tracing();
    let mut wp = build(3, true, |api| {
        api.acceptors[0].seed(5, 0x100, 0x200, 0x100);
        api.acceptors[1].seed(5, 0x100, 0x150, 0x100);
        api.acceptors[2].seed(5, 0x100, 0x100, 0x100);
        api.recovery_ok = false;
    });

    let exit = run_expect_exit(|| wp.start());
    let SimExit::Fatal(why) = exit else {
        panic!("expected a fatal exit, got {exit:?}");
    };
    assert!(why.contains("recover"), "unexpected message: {why}");
}

#[test]
fn connect_failure_is_retried_by_the_supervisor() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.fail_connect[0] = true;
        api.redo_start = Lsn(0x100);
    });

    // The remaining two are a quorum; election completes without sk 0.
    wp.start();
    assert!(wp.api().closed.contains(&0));
    assert!(wp.api().acceptors[0].received.is_empty());

    // The reconnect sweep brings it back and it joins the stream.
    wp.api_mut().pending_timeouts = 2;
    wp.poll();
    assert!(!wp.api().acceptors[0].elected_messages().is_empty());
}

#[test]
fn query_failure_is_transient() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.fail_query[1] = true;
        api.redo_start = Lsn(0x100);
    });

    wp.start();
    assert!(wp.api().closed.contains(&1));

    wp.api_mut().pending_timeouts = 2;
    wp.poll();
    assert!(!wp.api().acceptors[1].elected_messages().is_empty());
}

#[test]
fn malformed_frame_resets_the_connection() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        // Garbage waits in front of the real greeting response.
        let garbage = bytes::Bytes::from_static(&[b'x', 0, 0, 0, 0, 0, 0, 0, 1, 2, 3]);
        api.acceptors[0].inject_frame(garbage);
        api.redo_start = Lsn(0x100);
    });

    // The reset reconnects immediately and the handshake retries, so the
    // election still completes with all three.
    wp.start();
    wp.poll();
    assert!(wp.api().closed.contains(&0));
    assert!(!wp.api().acceptors[0].elected_messages().is_empty());
}

#[test]
fn read_failure_during_streaming_takes_the_peer_offline() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.redo_start = Lsn(0x100);
    });

    wp.start();
    wp.api_mut().wal_end = Lsn(0x200);
    wp.broadcast(Lsn(0x100), Lsn(0x200));
    wp.poll();

    wp.api_mut().fail_read[2] = true;
    wp.api_mut().wal_end = Lsn(0x300);
    wp.broadcast(Lsn(0x200), Lsn(0x300));
    wp.poll();

    // The survivors still form a quorum and commit.
    assert!(wp.api().closed.contains(&2));
    assert_eq!(wp.last_sent_commit_lsn(), Lsn(0x300));
}

#[test]
fn partial_announcement_write_is_flushed() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        // The first nonblocking write to sk 0, the election
        // announcement, stays buffered until a flush.
        api.defer_write[0] = true;
        api.redo_start = Lsn(0x100);
    });

    wp.start();
    wp.poll();

    assert!(!wp.api().acceptors[0].elected_messages().is_empty());

    wp.api_mut().wal_end = Lsn(0x180);
    wp.broadcast(Lsn(0x100), Lsn(0x180));
    wp.poll();
    assert!(
        wp.api().acceptors[0]
            .appends()
            .iter()
            .any(|a| a.hdr.end_lsn == Lsn(0x180))
    );
}

#[test]
fn silent_peer_is_cut_off_by_the_connection_timeout() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.acceptors[0].respond_greeting = false;
        api.redo_start = Lsn(0x100);
    });

    // Two responsive safekeepers elect; the third hangs in its
    // handshake.
    wp.start();

    wp.api_mut().pending_timeouts = 15;
    wp.api_mut().stall_exits = true;
    let exit = run_expect_exit(|| wp.poll());
    assert_eq!(exit, SimExit::Stalled);

    // The silent connection was killed by the inactivity sweep.
    assert!(wp.api().closed.contains(&0));
    assert!(wp.api().clock() > Duration::from_secs(10));
}

#[test]
fn streaming_splits_large_ranges_into_chunks() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.redo_start = Lsn(0x100);
    });

    wp.start();
    let end = Lsn(0x100 + 2 * MAX_SEND_SIZE + 0x40);
    wp.api_mut().wal_end = end;
    wp.broadcast(Lsn(0x100), end);
    wp.poll();

    let acceptor = &wp.api().acceptors[1];
    let sizes: Vec<u64> = acceptor
        .appends()
        .iter()
        .filter(|a| a.hdr.begin_lsn >= Lsn(0x100) && !a.wal.is_empty())
        .map(|a| a.hdr.end_lsn - a.hdr.begin_lsn)
        .collect();
    assert_eq!(sizes, vec![MAX_SEND_SIZE, MAX_SEND_SIZE, 0x40]);
}

#[test]
fn pageserver_feedback_reaches_the_shared_state() {
    let _guard = init_tracing();
    let feedback = PageserverFeedback {
        current_timeline_size: 1 << 30,
        last_received_lsn: Lsn(0x200),
        disk_consistent_lsn: Lsn(0x180),
        remote_consistent_lsn: Lsn(0x150),
        reply_time: 712_793_991_000_000,
    };
    let mut wp = build(3, false, |api| {
        api.acceptors[1].feedback = Some(feedback);
        api.redo_start = Lsn(0x100);
    });

    wp.start();
    wp.api_mut().wal_end = Lsn(0x200);
    wp.broadcast(Lsn(0x100), Lsn(0x200));
    wp.poll();

    assert_eq!(wp.api().shared_state().feedback(), feedback);
}

#[test]
fn last_elected_term_is_remembered() {
    let _guard = init_tracing();
    let mut wp = build(3, false, |api| {
        api.redo_start = Lsn(0x100);
    });
    wp.start();
    assert_eq!(
        wp.api().shared_state().mine_last_elected_term(),
        wp.term()
    );
}
