//! # Kestrel Transport
//!
//! Frame transport layer for the Kestrel DHT.
//!
//! This crate provides:
//! - Transport trait abstraction over frame-oriented backends
//! - Async UDP transport using Tokio (one datagram = one frame)
//! - In-process memory transport for tests and simulation
//!
//! The DHT core above this layer deals in whole frames addressed by
//! `SocketAddr`; it never sees partial reads or stream boundaries.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod udp;

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind the local endpoint.
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been closed.
    #[error("Transport closed")]
    Closed,

    /// Outbound frame exceeds the transport's frame size limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Attempted frame size.
        size: usize,
        /// Maximum the transport accepts.
        max: usize,
    },

    /// No route to the destination address.
    #[error("Unknown peer address: {0}")]
    UnknownPeer(SocketAddr),
}

/// Counters describing transport activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent.
    pub bytes_sent: u64,
    /// Total bytes received.
    pub bytes_received: u64,
    /// Frames sent.
    pub frames_sent: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Send operations that failed.
    pub send_errors: u64,
    /// Receive operations that failed.
    pub recv_errors: u64,
}

/// A frame-oriented transport.
///
/// Implementations deliver whole frames to and from peer addresses. Frame
/// boundaries are preserved: every `send_to` corresponds to at most one
/// `recv_from` on the peer, carrying the same bytes. Delivery is best
/// effort; frames may be lost or reordered, never truncated.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is closed, the frame exceeds
    /// [`Transport::max_frame_size`], or the underlying send fails.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one frame, blocking until a frame arrives.
    ///
    /// Copies the frame into `buf` and returns its length and origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is closed or the receive fails.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// The local address frames are delivered to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport. Subsequent sends and receives fail with
    /// [`TransportError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails.
    async fn close(&self) -> TransportResult<()>;

    /// Whether the transport has been closed.
    fn is_closed(&self) -> bool;

    /// Largest frame this transport will carry.
    fn max_frame_size(&self) -> usize;

    /// Snapshot of activity counters.
    fn stats(&self) -> TransportStats;
}
