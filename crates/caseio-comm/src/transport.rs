//! Point-to-point transport between ranks
//!
//! The collectives only need a reliable, ordered send/receive per rank
//! pair. `LocalTransport` provides one over in-process channels so a
//! whole run can be hosted as threads of a single process.

use bytes::Bytes;
use caseio_common::{Error, Rank, Result};
use crossbeam_channel::{RecvTimeoutError, Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Reliable, ordered message passing between ranks
pub trait Transport: Send {
    /// This endpoint's rank
    fn rank(&self) -> Rank;

    /// Number of ranks in the run
    fn size(&self) -> u32;

    /// Send one message to `to`; blocks until handed to the transport
    fn send(&self, to: Rank, message: Bytes) -> Result<()>;

    /// Receive the next message from `from`
    ///
    /// `None` blocks until a message arrives or the peer is gone.
    fn recv(&self, from: Rank, timeout: Option<Duration>) -> Result<Bytes>;
}

/// Transport statistics
#[derive(Debug, Default)]
pub struct TransportStats {
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl TransportStats {
    /// Messages sent so far
    pub fn sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Messages received so far
    pub fn received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }
}

/// In-process transport: one unbounded channel per ordered rank pair
pub struct LocalTransport {
    rank: Rank,
    size: u32,
    /// `outboxes[to]`
    outboxes: Vec<Sender<Bytes>>,
    /// `inboxes[from]`
    inboxes: Vec<Receiver<Bytes>>,
    stats: Arc<TransportStats>,
}

impl LocalTransport {
    /// Create fully connected endpoints for `size` ranks, indexed by rank
    #[must_use]
    pub fn mesh(size: u32) -> Vec<Self> {
        let n = size as usize;
        let mut outboxes: Vec<Vec<Sender<Bytes>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
        let mut inboxes: Vec<Vec<Receiver<Bytes>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();

        for from in 0..n {
            for to in inboxes.iter_mut() {
                let (tx, rx) = unbounded();
                outboxes[from].push(tx);
                to.push(rx);
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .zip(0u32..)
            .map(|((outboxes, inboxes), rank)| Self {
                rank: Rank::new(rank),
                size,
                outboxes,
                inboxes,
                stats: Arc::new(TransportStats::default()),
            })
            .collect()
    }

    /// Get transport statistics
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Shared handle to the statistics, usable after the endpoint moves
    pub fn stats_handle(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    fn check_peer(&self, peer: Rank) -> Result<()> {
        if peer.get() >= self.size {
            return Err(Error::invalid_argument(format!(
                "rank {peer} outside run of {} ranks",
                self.size
            )));
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn send(&self, to: Rank, message: Bytes) -> Result<()> {
        self.check_peer(to)?;
        let len = message.len() as u64;
        self.outboxes[to.index()]
            .send(message)
            .map_err(|_| Error::desync(self.rank, to, "peer endpoint closed"))?;
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn recv(&self, from: Rank, timeout: Option<Duration>) -> Result<Bytes> {
        self.check_peer(from)?;
        let inbox = &self.inboxes[from.index()];
        let message = match timeout {
            Some(timeout) => inbox.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => {
                    Error::desync(self.rank, from, format!("no message within {timeout:?}"))
                }
                RecvTimeoutError::Disconnected => {
                    Error::desync(self.rank, from, "peer endpoint closed")
                }
            })?,
            None => inbox
                .recv()
                .map_err(|_| Error::desync(self.rank, from, "peer endpoint closed"))?,
        };
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(message.len() as u64, Ordering::Relaxed);
        Ok(message)
    }
}
