//! RPC handler loop for processing incoming Raft RPCs.
//!
//! Bridges the transport layer (which receives RPC messages) to the
//! RaftState handlers (which process them).
//!
//! ```text
//! Transport receives RPC → RpcMessage enum → rpc_handler_loop
//!     ↓
//! Match on message type → Call RaftState::handle_XXX
//!     ↓
//! Send response back via oneshot channel
//! ```

use crate::state::RaftState;
use crate::transport::{RpcMessage, RpcReceiver};
use std::sync::Arc;
use tokio::sync::broadcast;

/// RPC handler loop.
///
/// Receives RPC messages from the transport and dispatches them to the
/// handler methods in RaftState, one at a time in arrival order.
///
/// The loop exits when the shutdown signal is received or every sender of
/// the inbox is gone.
pub async fn rpc_handler_loop(
    state: Arc<RaftState>,
    mut rpc_rx: RpcReceiver,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg_opt = rpc_rx.recv() => {
                match msg_opt {
                    Some(msg) => handle_rpc_message(&state, msg).await,
                    None => {
                        tracing::debug!("RPC channel closed, exiting handler loop");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("RPC handler loop shutting down");
                break;
            }
        }
    }
}

/// Dispatch a single RPC message to the matching handler.
///
/// A handler error (a failed hard-state or log write) drops the response
/// sender, which the caller sees as an unreachable peer.
async fn handle_rpc_message(state: &RaftState, msg: RpcMessage) {
    match msg {
        RpcMessage::RequestVote {
            request,
            response_tx,
        } => match state.handle_request_vote(request).await {
            Ok(resp) => {
                let _ = response_tx.send(resp);
            }
            Err(e) => tracing::error!(error = %e, "Failed to handle RequestVote"),
        },

        RpcMessage::AppendEntries {
            request,
            response_tx,
        } => match state.handle_append_entries(request).await {
            Ok(resp) => {
                let _ = response_tx.send(resp);
            }
            Err(e) => tracing::error!(error = %e, "Failed to handle AppendEntries"),
        },

        RpcMessage::InstallSnapshot {
            request,
            response_tx,
        } => match state.handle_install_snapshot(request).await {
            Ok(resp) => {
                let _ = response_tx.send(resp);
            }
            Err(e) => tracing::error!(error = %e, "Failed to handle InstallSnapshot"),
        },
    }
}
