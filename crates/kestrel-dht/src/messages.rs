//! DHT wire messages.
//!
//! Four message kinds drive the peer-discovery protocol:
//! - PING/PONG: liveness checks, correlated by token
//! - FIND_NODE: request the k closest peers to a target id
//! - NODES: the answer, correlated by token
//!
//! Every request carries a 64-bit correlation token echoed by its
//! response; the supervisor matches the two. Encoding is bincode with the
//! standard configuration, one message per transport frame (the UDP
//! datagram boundary or the transport's own length prefix is the frame
//! delimiter).

use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

/// Correlation token tying a response to the request that elicited it.
pub type Token = u64;

/// Compact peer representation carried in NODES responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer's node id.
    pub id: NodeId,
    /// Peer's network address.
    pub addr: SocketAddr,
}

/// DHT protocol message, one per frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Liveness probe.
    Ping {
        /// Sender's node id.
        sender_id: NodeId,
        /// Correlation token, echoed by the PONG.
        token: Token,
    },
    /// Response to a PING.
    Pong {
        /// Responder's node id.
        sender_id: NodeId,
        /// Echoed token from the PING.
        token: Token,
    },
    /// Request for the k closest known peers to `target`.
    FindNode {
        /// Sender's node id.
        sender_id: NodeId,
        /// Correlation token, echoed by the NODES response.
        token: Token,
        /// Id to search toward.
        target: NodeId,
    },
    /// Response to a FIND_NODE: at most k peers, closest first.
    Nodes {
        /// Responder's node id.
        sender_id: NodeId,
        /// Echoed token from the FIND_NODE.
        token: Token,
        /// Closest peers known to the responder.
        peers: Vec<PeerInfo>,
    },
}

impl Message {
    /// Serialize to bytes for one transport frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(MessageError::Encode)
    }

    /// Deserialize from one transport frame.
    ///
    /// Trailing bytes after the message are rejected; a frame carries
    /// exactly one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a well-formed message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        let (msg, consumed) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(MessageError::Decode)?;
        if consumed != bytes.len() {
            return Err(MessageError::TrailingBytes {
                consumed,
                total: bytes.len(),
            });
        }
        Ok(msg)
    }

    /// The sender's node id.
    #[must_use]
    pub fn sender_id(&self) -> NodeId {
        match self {
            Self::Ping { sender_id, .. }
            | Self::Pong { sender_id, .. }
            | Self::FindNode { sender_id, .. }
            | Self::Nodes { sender_id, .. } => *sender_id,
        }
    }

    /// The correlation token.
    #[must_use]
    pub fn token(&self) -> Token {
        match self {
            Self::Ping { token, .. }
            | Self::Pong { token, .. }
            | Self::FindNode { token, .. }
            | Self::Nodes { token, .. } => *token,
        }
    }

    /// Whether this kind is a response (correlated to an earlier request).
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Pong { .. } | Self::Nodes { .. })
    }

    /// Short kind name for log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "PING",
            Self::Pong { .. } => "PONG",
            Self::FindNode { .. } => "FIND_NODE",
            Self::Nodes { .. } => "NODES",
        }
    }
}

/// Message codec errors.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Serialization failed.
    #[error("Encode failed: {0}")]
    Encode(bincode::error::EncodeError),

    /// Deserialization failed.
    #[error("Decode failed: {0}")]
    Decode(bincode::error::DecodeError),

    /// Frame contained bytes past the end of the message.
    #[error("Trailing bytes in frame: decoded {consumed} of {total}")]
    TrailingBytes {
        /// Bytes the decoder consumed.
        consumed: usize,
        /// Total frame length.
        total: usize,
    },
}
