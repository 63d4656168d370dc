//! Inbound protocol handlers.
//!
//! Stateless mapping from inbound frames to replies, routing-table
//! updates, and supervisor deliveries. The listener feeds every frame
//! through [`handle_frame`]; all state mutation goes through the
//! routing-table and supervisor contracts. Malformed frames and protocol
//! violations are logged and dropped, never fatal.

use crate::messages::Message;
use crate::node::NodeInner;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{trace, warn};

/// Decode and dispatch one inbound frame.
pub(crate) async fn handle_frame(inner: &Arc<NodeInner>, from: SocketAddr, bytes: &[u8]) {
    let message = match Message::from_bytes(bytes) {
        Ok(message) => message,
        Err(error) => {
            warn!(%from, %error, len = bytes.len(), "frame decode failed, dropped");
            return;
        }
    };

    // Any well-formed frame is evidence the sender is alive.
    inner.observe_peer(message.sender_id(), from);

    if let Message::Nodes { peers, token, .. } = &message {
        if peers.len() > inner.config.k {
            warn!(
                %from,
                token,
                count = peers.len(),
                "NODES exceeds k peers, dropped"
            );
            return;
        }
    }

    match message {
        Message::Ping { sender_id, token } => {
            trace!(%from, peer = %sender_id, token, "PING");
            let reply = Message::Pong {
                sender_id: inner.local_id,
                token,
            };
            if let Err(error) = inner.send_message(&reply, from).await {
                warn!(%from, %error, "PONG send failed");
            }
        }
        Message::Pong { token, .. } => {
            inner.supervisor.deliver(token, message);
        }
        Message::FindNode {
            sender_id,
            token,
            target,
        } => {
            trace!(%from, peer = %sender_id, token, %target, "FIND_NODE");
            let peers = {
                let table = inner.table.lock().expect("routing table lock poisoned");
                let k = table.k();
                table
                    .closest(&target, k)
                    .iter()
                    .map(|p| p.info())
                    .collect()
            };
            let reply = Message::Nodes {
                sender_id: inner.local_id,
                token,
                peers,
            };
            if let Err(error) = inner.send_message(&reply, from).await {
                warn!(%from, %error, "NODES send failed");
            }
        }
        Message::Nodes { token, .. } => {
            inner.supervisor.deliver(token, message);
        }
    }
}
