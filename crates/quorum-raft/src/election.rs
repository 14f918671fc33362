//! Leader election.
//!
//! A follower or candidate whose election timer expires starts an election:
//! it bumps and persists its term, votes for itself and asks every peer for a
//! vote in parallel. A strict majority of grants makes it leader. Split votes
//! simply time out again with a fresh randomized deadline.
//!
//! The same timer drives check-quorum on the leader.

use crate::error::Result;
use crate::state::RaftState;
use crate::transport::RaftTransport;
use crate::types::*;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Election loop.
///
/// Waits for the election timer; on expiry the leader checks it still hears
/// from a quorum and everyone else campaigns.
pub async fn election_loop(
    state: Arc<RaftState>,
    transport: Arc<dyn RaftTransport>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let timer = state.timer().clone();

    loop {
        tokio::select! {
            _ = timer.expired() => {}
            _ = shutdown_rx.recv() => {
                tracing::info!("Election loop shutting down");
                break;
            }
        }
        timer.reset();

        if state.role() == Role::Leader {
            state.check_quorum().await;
            continue;
        }
        if !state.is_healthy() {
            // A node that cannot persist its vote must not campaign.
            continue;
        }

        match run_election(&state, &transport).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(node = %state.node_id(), term = %state.current_term(), "Election not won");
            }
            Err(e) => {
                tracing::warn!(node = %state.node_id(), error = %e, "Election failed");
            }
        }
    }
}

/// Runs one election round. Returns true if this node became leader.
pub async fn run_election(
    state: &Arc<RaftState>,
    transport: &Arc<dyn RaftTransport>,
) -> Result<bool> {
    let (term, last_log_index, last_log_term) = state.start_election().await?;
    let membership = state.membership().clone();

    let mut granted: Vec<NodeId> = vec![state.node_id().clone()];
    if membership.has_quorum(&granted) {
        return state.become_leader(term).await;
    }

    let request = RequestVoteRequest {
        term,
        candidate_id: state.node_id().clone(),
        last_log_index,
        last_log_term,
    };
    let rpc_timeout = state.config().rpc_timeout;

    let mut votes: FuturesUnordered<_> = membership
        .peers_of(state.node_id())
        .cloned()
        .map(|peer| {
            let transport = transport.clone();
            let request = request.clone();
            async move {
                let outcome =
                    tokio::time::timeout(rpc_timeout, transport.request_vote(&peer, request)).await;
                (peer, outcome)
            }
        })
        .collect();

    while let Some((peer, outcome)) = votes.next().await {
        match outcome {
            Ok(Ok(response)) => {
                if response.term > term {
                    state.observe_term(response.term).await?;
                    return Ok(false);
                }
                if response.vote_granted && response.term == term {
                    tracing::debug!(node = %state.node_id(), voter = %peer, term = %term, "Vote granted");
                    granted.push(peer);
                    if membership.has_quorum(&granted) {
                        return state.become_leader(term).await;
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(voter = %peer, error = %e, "RequestVote failed");
            }
            Err(_) => {
                tracing::debug!(voter = %peer, "RequestVote timed out");
            }
        }

        if state.current_term() != term || state.role() != Role::Candidate {
            return Ok(false);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::create_test_state;
    use crate::transport::{rpc_channel, InMemoryTransport, RpcMessage};
    use std::collections::HashMap;

    fn voter(granted: bool, term: Term) -> crate::transport::RpcSender {
        let (tx, mut rx) = rpc_channel(4);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let RpcMessage::RequestVote { request, response_tx } = msg {
                    let _ = response_tx.send(RequestVoteResponse {
                        term: term.max(request.term),
                        vote_granted: granted,
                    });
                }
            }
        });
        tx
    }

    #[tokio::test]
    async fn test_single_node_elects_itself() {
        let (state, _temp) = create_test_state(&["n1"]).await;
        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(NodeId::new("n1"), HashMap::new()));

        assert!(run_election(&state, &transport).await.unwrap());
        assert_eq!(state.role(), Role::Leader);
        assert_eq!(state.current_term(), Term(1));
        assert_eq!(state.commit_index(), LogIndex(1));
    }

    #[tokio::test]
    async fn test_majority_of_grants_wins() {
        let (state, _temp) = create_test_state(&["n1", "n2", "n3"]).await;
        let mut peers = HashMap::new();
        peers.insert(NodeId::new("n2"), voter(true, Term::ZERO));
        peers.insert(NodeId::new("n3"), voter(false, Term::ZERO));
        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(NodeId::new("n1"), peers));

        assert!(run_election(&state, &transport).await.unwrap());
        assert_eq!(state.role(), Role::Leader);
        assert_eq!(state.leader(), Some(NodeId::new("n1")));
    }

    #[tokio::test]
    async fn test_no_majority_stays_candidate() {
        let (state, _temp) = create_test_state(&["n1", "n2", "n3"]).await;
        let mut peers = HashMap::new();
        peers.insert(NodeId::new("n2"), voter(false, Term::ZERO));
        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(NodeId::new("n1"), peers));

        assert!(!run_election(&state, &transport).await.unwrap());
        assert_eq!(state.role(), Role::Candidate);
        assert_eq!(state.voted_for(), Some(NodeId::new("n1")));
    }

    #[tokio::test]
    async fn test_higher_term_response_steps_down() {
        let (state, _temp) = create_test_state(&["n1", "n2", "n3"]).await;
        let mut peers = HashMap::new();
        peers.insert(NodeId::new("n2"), voter(false, Term(9)));
        peers.insert(NodeId::new("n3"), voter(false, Term(9)));
        let transport: Arc<dyn RaftTransport> =
            Arc::new(InMemoryTransport::new(NodeId::new("n1"), peers));

        assert!(!run_election(&state, &transport).await.unwrap());
        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.current_term(), Term(9));
        assert_eq!(state.voted_for(), None);
    }
}
