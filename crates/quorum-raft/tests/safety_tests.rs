//! Raft safety properties under leader churn, partitions and restarts:
//! 1. Election safety - at most one leader per term
//! 2. Leader completeness - committed entries appear in every later leader
//! 3. Commit monotonicity - a node's commit index never decreases
//! 4. Log matching / state machine safety - replicas never disagree on an
//!    entry they both hold, and converge to the same state

mod common;

use common::{fast_config, init_tracing, wait_until, TestCluster};
use quorum_raft::{LogIndex, NodeId, Role, Term};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const ELECTION_WAIT: Duration = Duration::from_secs(5);
const CONVERGE_WAIT: Duration = Duration::from_secs(10);

type LeadersByTerm = Arc<Mutex<HashMap<Term, HashSet<NodeId>>>>;

/// Records every (term, leader) pair each node announces.
fn watch_leaders(cluster: &TestCluster) -> LeadersByTerm {
    let seen: LeadersByTerm = Arc::default();
    for node in &cluster.nodes {
        let mut rx = node.raft().subscribe_leadership();
        let id = node.id.clone();
        let seen = seen.clone();
        tokio::spawn(async move {
            loop {
                let now = rx.borrow_and_update().clone();
                if now.role == Role::Leader {
                    seen.lock()
                        .unwrap()
                        .entry(now.term)
                        .or_default()
                        .insert(id.clone());
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }
    seen
}

#[tokio::test(flavor = "multi_thread")]
async fn election_safety_single_leader_per_term() {
    init_tracing();
    let mut cluster = TestCluster::new(5, fast_config()).await;
    let seen = watch_leaders(&cluster);

    for round in 0..3 {
        let leader = cluster.wait_for_leader(ELECTION_WAIT).await;
        info!(round, leader, "Isolating leader");
        cluster.isolate(leader);

        let others: Vec<usize> = (0..5).filter(|&i| i != leader).collect();
        cluster.wait_for_leader_among(&others, ELECTION_WAIT).await;
        cluster.heal(leader);
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let seen = seen.lock().unwrap();
    assert!(seen.len() >= 3, "expected several terms with leaders");
    for (term, leaders) in seen.iter() {
        assert_eq!(leaders.len(), 1, "term {} had leaders {:?}", term, leaders);
    }
    drop(seen);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_completeness_after_failover() {
    init_tracing();
    let mut cluster = TestCluster::new(3, fast_config()).await;
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;

    for i in 0..10 {
        cluster.nodes[leader]
            .store()
            .set(format!("k{}", i), "v", None)
            .await
            .unwrap();
    }
    let state = cluster.nodes[leader].raft().state().clone();
    let committed = state.commit_index();
    let entries: Vec<_> = (1..=committed.as_u64())
        .filter_map(|i| state.log_ref().get(LogIndex(i)))
        .collect();
    assert_eq!(entries.len() as u64, committed.as_u64());

    cluster.isolate(leader);
    let others: Vec<usize> = (0..3).filter(|&i| i != leader).collect();
    let new_leader = cluster.wait_for_leader_among(&others, ELECTION_WAIT).await;

    let new_log = cluster.nodes[new_leader].raft().state().log_ref();
    for entry in &entries {
        assert_eq!(
            new_log.get(entry.index).as_ref(),
            Some(entry),
            "new leader is missing committed entry {}",
            entry.index
        );
    }

    // The old leader rejoins and adopts the new leader's log.
    cluster.nodes[new_leader]
        .store()
        .set("after", "v", None)
        .await
        .unwrap();
    cluster.heal(leader);
    let caught_up = wait_until(CONVERGE_WAIT, || {
        cluster.nodes[leader].kv.get(b"after").map(|_| ())
    })
    .await;
    assert!(caught_up.is_some());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_index_is_monotonic_and_replicas_agree() {
    init_tracing();
    let mut cluster = TestCluster::new(3, fast_config()).await;

    let histories: Vec<Arc<Mutex<Vec<LogIndex>>>> = cluster
        .nodes
        .iter()
        .map(|node| {
            let history = Arc::new(Mutex::new(Vec::new()));
            let mut rx = node.raft().subscribe_commit();
            let sink = history.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let value = *rx.borrow_and_update();
                    sink.lock().unwrap().push(value);
                }
            });
            history
        })
        .collect();

    let mut written = 0;
    for round in 0..3 {
        let leader = cluster.wait_for_leader(ELECTION_WAIT).await;
        for _ in 0..10 {
            if cluster.nodes[leader]
                .store()
                .set(format!("k{}", written), format!("r{}", round), None)
                .await
                .is_ok()
            {
                written += 1;
            }
        }
        // Disturb: isolate the leader for a while, then bring it back.
        cluster.isolate(leader);
        let others: Vec<usize> = (0..3).filter(|&i| i != leader).collect();
        cluster.wait_for_leader_among(&others, ELECTION_WAIT).await;
        cluster.heal(leader);
    }
    assert!(written > 0);

    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;
    cluster.nodes[leader]
        .store()
        .set("final", "x", None)
        .await
        .unwrap();

    let agree = wait_until(CONVERGE_WAIT, || {
        let reference = cluster.nodes[0].kv.entries();
        let all_same = cluster.nodes.iter().all(|n| n.kv.entries() == reference);
        (all_same && cluster.nodes[0].kv.get(b"final").is_some()).then_some(())
    })
    .await;
    assert!(agree.is_some(), "replicas did not converge");

    for (node, history) in cluster.nodes.iter().zip(&histories) {
        let history = history.lock().unwrap();
        assert!(
            history.windows(2).all(|w| w[0] <= w[1]),
            "commit index of {} went backwards: {:?}",
            node.id,
            history
        );
    }

    // Log matching: entries at the same index and term carry the same command.
    let logs: Vec<_> = cluster
        .nodes
        .iter()
        .map(|n| {
            let log = n.raft().state().log_ref();
            (log.first_index().as_u64()..=log.last_index().as_u64())
                .filter_map(|i| log.get(LogIndex(i)))
                .map(|e| (e.index, e))
                .collect::<HashMap<_, _>>()
        })
        .collect();
    for a in &logs {
        for b in &logs {
            for (index, entry) in a {
                if let Some(other) = b.get(index) {
                    if other.term == entry.term {
                        assert_eq!(other.command, entry.command, "log mismatch at {}", index);
                    }
                }
            }
        }
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restarted_follower_rejoins_with_durable_vote() {
    init_tracing();
    let mut cluster = TestCluster::new(3, fast_config()).await;
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await;
    let follower = (leader + 2) % 3;

    cluster.nodes[leader].store().set("a", "1", None).await.unwrap();
    let term_before = cluster.nodes[follower].raft().current_term();

    cluster.crash(follower).await;
    cluster.nodes[leader].store().set("b", "2", None).await.unwrap();
    cluster.restart(follower).await;

    // Term never goes backwards across a restart.
    assert!(cluster.nodes[follower].raft().current_term() >= term_before);

    let rejoined = wait_until(CONVERGE_WAIT, || {
        let kv = &cluster.nodes[follower].kv;
        (kv.get(b"a").is_some() && kv.get(b"b").is_some()).then_some(())
    })
    .await;
    assert!(rejoined.is_some());

    cluster.shutdown().await;
}
