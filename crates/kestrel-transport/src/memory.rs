//! In-process memory transport.
//!
//! A [`MemoryHub`] plays the role of the network: endpoints register a
//! synthetic socket address and receive frames over an unbounded channel.
//! Delivery is reliable and ordered per sender, which makes tests
//! deterministic; loss and partitions are simulated by deafening an
//! endpoint or dropping it from the hub.

use crate::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{trace, warn};

/// Frame in flight: payload plus origin address.
type Frame = (Vec<u8>, SocketAddr);

/// Largest frame the memory transport accepts. Matches the UDP ceiling so
/// tests exercise the same size limits as the real network.
pub const MAX_FRAME_SIZE: usize = 65507;

/// In-process switchboard connecting [`MemoryTransport`] endpoints.
pub struct MemoryHub {
    endpoints: DashMap<SocketAddr, UnboundedSender<Frame>>,
    next_port: AtomicU16,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            next_port: AtomicU16::new(1),
        })
    }

    /// Open a new endpoint with a hub-assigned address.
    #[must_use]
    pub fn open(self: &Arc<Self>) -> MemoryTransport {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        self.open_at(addr)
    }

    /// Open a new endpoint at a specific address, replacing any previous
    /// registration for it.
    #[must_use]
    pub fn open_at(self: &Arc<Self>, addr: SocketAddr) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(addr, tx);
        MemoryTransport {
            hub: Arc::clone(self),
            local_addr: addr,
            inbox: Mutex::new(rx),
            closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            recv_errors: AtomicU64::new(0),
        }
    }

    /// Drop an endpoint from the hub. Frames sent to it afterwards are
    /// reported as [`TransportError::UnknownPeer`], simulating a vanished
    /// peer.
    pub fn disconnect(&self, addr: &SocketAddr) {
        self.endpoints.remove(addr);
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

/// Channel-backed endpoint attached to a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local_addr: SocketAddr,
    inbox: Mutex<UnboundedReceiver<Frame>>,
    closed: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if buf.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: buf.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let Some(tx) = self.hub.endpoints.get(&addr).map(|e| e.value().clone()) else {
            warn!(%addr, "send to unregistered endpoint");
            self.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::UnknownPeer(addr));
        };

        if tx.send((buf.to_vec(), self.local_addr)).is_err() {
            // Receiver dropped between lookup and send.
            warn!(%addr, "send to departed endpoint");
            self.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::UnknownPeer(addr));
        }

        self.bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                self.frames_received.fetch_add(1, Ordering::Relaxed);
                Ok((len, from))
            }
            None => {
                trace!(addr = %self.local_addr, "inbox closed");
                self.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Closed)
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.hub.disconnect(&self.local_addr);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn max_frame_size(&self) -> usize {
        MAX_FRAME_SIZE
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}
