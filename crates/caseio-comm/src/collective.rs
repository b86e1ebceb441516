//! Tree-scheduled collectives
//!
//! Every collective runs in up to three sweeps over the tree:
//!
//! 1. **Data**: the payload travels down (broadcast) or up (gather).
//!    A rank that cannot produce or relay its payload sends `Abort`
//!    instead, so the failure keeps travelling in the same direction.
//! 2. **Acknowledge** (broadcast only): each rank reports `Ack`/`Nack`
//!    for its whole subtree to its parent.
//! 3. **Verdict**: the root sends `Commit` or `Rollback` down the tree.
//!
//! A rank returns success only on `Commit`, so a failure anywhere in the
//! tree fails every live rank. A silent but connected peer blocks the
//! collective unless a receive timeout is configured.

use crate::frame::{Collective, Frame, FrameKind};
use crate::transport::Transport;
use crate::tree::CommunicationTree;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use caseio_common::config::CommConfig;
use caseio_common::{Error, Rank, RankInfo, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Collective operations over a transport
pub struct Communicator<T: Transport> {
    transport: T,
    tree: CommunicationTree,
    timeout: Option<Duration>,
}

impl<T: Transport> Communicator<T> {
    /// Create a communicator with the schedule from `config`
    pub fn new(transport: T, config: &CommConfig) -> Self {
        Self {
            transport,
            tree: CommunicationTree::from_config(config),
            timeout: config.recv_timeout(),
        }
    }

    /// This rank
    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    /// Number of ranks
    pub fn size(&self) -> u32 {
        self.transport.size()
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// This rank's place in the tree rooted at `root`
    pub fn rank_info(&self, root: Rank) -> Result<RankInfo> {
        self.tree.build(self.size(), self.rank(), root)
    }

    /// Relay `payload` from `root` to every rank
    ///
    /// The root passes `Some(payload)`; other ranks pass `None` and get the
    /// root's bytes back.
    pub fn broadcast(&self, payload: Option<Bytes>, root: Rank) -> Result<Bytes> {
        let info = self.rank_info(root)?;
        let op = Collective::Broadcast;
        let mut failure = None;

        let data = match info.parent {
            None => {
                if payload.is_none() {
                    failure = Some(Error::invalid_argument("broadcast root has no payload"));
                }
                payload
            }
            Some(parent) => match self.recv_frame(parent, op) {
                Ok(frame) if frame.kind == FrameKind::Data => Some(frame.payload),
                Ok(frame) => {
                    failure = Some(Error::desync(
                        self.rank(),
                        parent,
                        format!("parent relayed {:?}", frame.kind),
                    ));
                    None
                }
                Err(e) => {
                    failure = Some(e);
                    None
                }
            },
        };

        let forward = match &data {
            Some(payload) => Frame::data(op, payload.clone()),
            None => Frame::control(op, FrameKind::Abort),
        };
        for &child in &info.children {
            if let Err(e) = self.send_frame(child, &forward) {
                failure.get_or_insert(e);
            }
        }

        self.settle(&info, op, true, failure)?;
        debug!(
            rank = %self.rank(),
            root = %root,
            bytes = forward.payload.len(),
            "broadcast complete"
        );
        data.ok_or_else(|| Error::desync(self.rank(), root, "broadcast committed without payload"))
    }

    /// Combine one value per rank at `root`
    ///
    /// Each rank folds its children's values into its own, in child order,
    /// with `reduce(accumulated, child)`. Only the root gets `Some`.
    pub fn gather<F>(&self, local: Bytes, root: Rank, mut reduce: F) -> Result<Option<Bytes>>
    where
        F: FnMut(Bytes, Bytes) -> Result<Bytes>,
    {
        let info = self.rank_info(root)?;
        let op = Collective::Gather;
        let mut failure = None;
        let mut acc = Some(local);

        for &child in &info.children {
            match self.recv_frame(child, op) {
                Ok(frame) if frame.kind == FrameKind::Data => {
                    if let Some(value) = acc.take() {
                        match reduce(value, frame.payload) {
                            Ok(merged) => acc = Some(merged),
                            Err(e) => {
                                failure.get_or_insert(e);
                            }
                        }
                    }
                }
                Ok(frame) => {
                    failure.get_or_insert(Error::desync(
                        self.rank(),
                        child,
                        format!("child sent {:?}", frame.kind),
                    ));
                    acc = None;
                }
                Err(e) => {
                    failure.get_or_insert(e);
                    acc = None;
                }
            }
        }

        if let Some(parent) = info.parent {
            let up = match &acc {
                Some(value) if failure.is_none() => Frame::data(op, value.clone()),
                _ => Frame::control(op, FrameKind::Abort),
            };
            if let Err(e) = self.send_frame(parent, &up) {
                failure.get_or_insert(e);
            }
        }

        self.settle(&info, op, false, failure)?;
        debug!(rank = %self.rank(), root = %root, "gather complete");
        Ok(if info.is_root() { acc } else { None })
    }

    /// Collect one payload from every rank at `root`, ordered by rank
    pub fn gather_blocks(&self, local: Bytes, root: Rank) -> Result<Option<Vec<Bytes>>> {
        let rank = self.rank();
        let entry = encode_block_entry(rank, &local);
        let merged = self.gather(entry, root, |acc, child| {
            let mut buf = BytesMut::with_capacity(acc.len() + child.len());
            buf.extend_from_slice(&acc);
            buf.extend_from_slice(&child);
            Ok(buf.freeze())
        })?;

        merged
            .map(|bytes| {
                decode_block_entries(bytes, self.size())
                    .map_err(|reason| Error::desync(rank, root, reason))
            })
            .transpose()
    }

    /// True on every rank iff `ok` was true on every rank
    pub fn agree(&self, ok: bool, root: Rank) -> Result<bool> {
        let local = Bytes::copy_from_slice(&[u8::from(ok)]);
        let all = self.gather(local, root, |a, b| {
            Ok(Bytes::copy_from_slice(&[u8::from(a.first() == Some(&1) && b.first() == Some(&1))]))
        })?;
        let verdict = self.broadcast(all, root)?;
        Ok(verdict.first() == Some(&1))
    }

    /// Acknowledge and verdict sweeps
    fn settle(
        &self,
        info: &RankInfo,
        op: Collective,
        collect_acks: bool,
        mut failure: Option<Error>,
    ) -> Result<()> {
        if collect_acks {
            for &child in &info.children {
                match self.recv_frame(child, op) {
                    Ok(frame) if frame.kind == FrameKind::Ack => {}
                    Ok(frame) => {
                        failure.get_or_insert(Error::desync(
                            self.rank(),
                            child,
                            format!("subtree reported {:?}", frame.kind),
                        ));
                    }
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            if let Some(parent) = info.parent {
                let kind = if failure.is_none() {
                    FrameKind::Ack
                } else {
                    FrameKind::Nack
                };
                if let Err(e) = self.send_frame(parent, &Frame::control(op, kind)) {
                    failure.get_or_insert(e);
                }
            }
        }

        let committed = match info.parent {
            None => failure.is_none(),
            Some(parent) => match self.recv_frame(parent, op) {
                Ok(frame) if frame.kind == FrameKind::Commit => failure.is_none(),
                Ok(_) => false,
                Err(e) => {
                    failure.get_or_insert(e);
                    false
                }
            },
        };

        let verdict = if committed {
            FrameKind::Commit
        } else {
            FrameKind::Rollback
        };
        for &child in &info.children {
            if let Err(e) = self.send_frame(child, &Frame::control(op, verdict)) {
                warn!(rank = %self.rank(), child = %child, error = %e, "verdict not delivered");
            }
        }

        if committed {
            return Ok(());
        }
        let err = failure.unwrap_or_else(|| {
            Error::desync(
                self.rank(),
                info.parent.unwrap_or(info.rank),
                format!("{op:?} rolled back by another rank"),
            )
        });
        warn!(rank = %self.rank(), error = %err, "collective failed");
        Err(err)
    }

    fn send_frame(&self, to: Rank, frame: &Frame) -> Result<()> {
        self.transport.send(to, frame.encode())
    }

    fn recv_frame(&self, from: Rank, op: Collective) -> Result<Frame> {
        let bytes = self.transport.recv(from, self.timeout)?;
        let frame =
            Frame::decode(bytes).map_err(|reason| Error::desync(self.rank(), from, reason))?;
        if frame.collective != op {
            return Err(Error::desync(
                self.rank(),
                from,
                format!("expected {op:?} frame, got {:?}", frame.collective),
            ));
        }
        Ok(frame)
    }
}

fn encode_block_entry(rank: Rank, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(12 + payload.len());
    buf.put_u32_le(rank.get());
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(payload);
    buf.freeze()
}

fn decode_block_entries(mut data: Bytes, size: u32) -> std::result::Result<Vec<Bytes>, String> {
    let mut blocks: Vec<Option<Bytes>> = vec![None; size as usize];

    while data.has_remaining() {
        if data.remaining() < 12 {
            return Err("truncated gather entry".into());
        }
        let rank = data.get_u32_le();
        let len = usize::try_from(data.get_u64_le()).map_err(|e| e.to_string())?;
        if len > data.remaining() {
            return Err(format!("gather entry for rank {rank} overruns buffer"));
        }
        let slot = blocks
            .get_mut(rank as usize)
            .ok_or_else(|| format!("gather entry from unknown rank {rank}"))?;
        if slot.is_some() {
            return Err(format!("rank {rank} contributed twice"));
        }
        *slot = Some(data.split_to(len));
    }

    blocks
        .into_iter()
        .enumerate()
        .map(|(rank, block)| block.ok_or_else(|| format!("rank {rank} missing from gather")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use std::thread;

    fn config(threshold: u32, fanout: u32) -> CommConfig {
        CommConfig {
            tree_threshold: threshold,
            fanout,
            recv_timeout_ms: None,
        }
    }

    /// Run `f` on every rank in its own thread, results indexed by rank
    fn run_ranks<R, F>(size: u32, config: &CommConfig, f: F) -> Vec<R>
    where
        R: Send + 'static,
        F: Fn(Communicator<LocalTransport>) -> R + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = LocalTransport::mesh(size)
            .into_iter()
            .map(|transport| {
                let comm = Communicator::new(transport, config);
                let f = f.clone();
                thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn payload_for(n: u32, root: u32) -> Bytes {
        Bytes::from(format!("field data n={n} root={root}").repeat(7))
    }

    #[test]
    fn test_broadcast_integrity() {
        for n in [1u32, 2, 3, 7, 16, 100] {
            for root in [0, n / 2, n - 1] {
                let expected = payload_for(n, root);
                let results = run_ranks(n, &config(16, 2), move |comm| {
                    let mine = (comm.rank().get() == root).then(|| payload_for(n, root));
                    comm.broadcast(mine, Rank::new(root)).unwrap()
                });
                assert_eq!(results.len() as u32, n);
                for got in results {
                    assert_eq!(got, expected);
                }
            }
        }
    }

    #[test]
    fn test_broadcast_linear_and_wide_tree() {
        for cfg in [config(1000, 2), config(0, 5)] {
            let results = run_ranks(9, &cfg, |comm| {
                let mine = comm.rank().get() == 4;
                comm.broadcast(mine.then(|| Bytes::from_static(b"xyz")), Rank::new(4))
                    .unwrap()
            });
            assert!(results.iter().all(|b| b == "xyz"));
        }
    }

    #[test]
    fn test_gather_reduction_at_root() {
        let results = run_ranks(7, &config(0, 2), |comm| {
            let local = Bytes::copy_from_slice(&u64::from(comm.rank().get() + 1).to_le_bytes());
            comm.gather(local, Rank::new(2), |a, b| {
                let sum = u64::from_le_bytes(a[..8].try_into().unwrap())
                    + u64::from_le_bytes(b[..8].try_into().unwrap());
                Ok(Bytes::copy_from_slice(&sum.to_le_bytes()))
            })
            .unwrap()
        });

        for (rank, result) in results.into_iter().enumerate() {
            if rank == 2 {
                let sum = u64::from_le_bytes(result.unwrap()[..8].try_into().unwrap());
                assert_eq!(sum, 28);
            } else {
                assert!(result.is_none());
            }
        }
    }

    #[test]
    fn test_gather_blocks_ordered_by_rank() {
        let results = run_ranks(5, &config(16, 2), |comm| {
            let local = Bytes::from(vec![comm.rank().get() as u8; comm.rank().index() + 1]);
            comm.gather_blocks(local, Rank::MASTER).unwrap()
        });
        let blocks = results[0].clone().unwrap();
        assert_eq!(blocks.len(), 5);
        for (rank, block) in blocks.iter().enumerate() {
            assert_eq!(block.len(), rank + 1);
            assert!(block.iter().all(|b| usize::from(*b) == rank));
        }
        assert!(results[1..].iter().all(Option::is_none));
    }

    #[test]
    fn test_agree() {
        let all_ok = run_ranks(6, &config(16, 2), |comm| comm.agree(true, Rank::MASTER).unwrap());
        assert!(all_ok.into_iter().all(|ok| ok));

        let one_bad = run_ranks(6, &config(0, 2), |comm| {
            comm.agree(comm.rank().get() != 5, Rank::MASTER).unwrap()
        });
        assert!(one_bad.into_iter().all(|ok| !ok));
    }

    #[test]
    fn test_dropped_participant_fails_every_rank() {
        // tree of 6 rooted at 0: 0 -> {1, 2}, 1 -> {3, 4}, 2 -> {5}
        let cfg = config(0, 2);
        let handles: Vec<_> = LocalTransport::mesh(6)
            .into_iter()
            .filter_map(|transport| {
                if transport.rank() == Rank::new(1) {
                    drop(transport);
                    return None;
                }
                let comm = Communicator::new(transport, &cfg);
                Some(thread::spawn(move || {
                    let mine = comm.rank().get() == 0;
                    comm.broadcast(mine.then(|| Bytes::from_static(b"state")), Rank::MASTER)
                }))
            })
            .collect();

        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err, Error::CollectiveDesync { .. }));
        }
    }

    #[test]
    fn test_gather_with_dropped_leaf_fails_every_rank() {
        let cfg = config(16, 2);
        let handles: Vec<_> = LocalTransport::mesh(4)
            .into_iter()
            .filter_map(|transport| {
                if transport.rank() == Rank::new(3) {
                    drop(transport);
                    return None;
                }
                let comm = Communicator::new(transport, &cfg);
                Some(thread::spawn(move || {
                    comm.gather_blocks(Bytes::from_static(b"x"), Rank::MASTER)
                }))
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().unwrap_err().is_collective());
        }
    }

    #[test]
    fn test_mismatched_collective_is_desync() {
        let cfg = config(16, 2);
        let results = run_ranks(2, &cfg, |comm| {
            if comm.rank() == Rank::MASTER {
                comm.broadcast(Some(Bytes::from_static(b"a")), Rank::MASTER)
                    .map(|_| ())
            } else {
                comm.gather(Bytes::new(), Rank::MASTER, |a, _| Ok(a)).map(|_| ())
            }
        });
        assert!(results[1].as_ref().is_err_and(Error::is_collective));
    }

    #[test]
    fn test_block_entries_reject_duplicates() {
        let mut buf = BytesMut::new();
        buf.put(encode_block_entry(Rank::new(0), b"a"));
        buf.put(encode_block_entry(Rank::new(0), b"b"));
        assert!(decode_block_entries(buf.freeze(), 2).is_err());

        let single = encode_block_entry(Rank::new(0), b"a");
        assert!(decode_block_entries(single, 2).unwrap_err().contains("missing"));
    }
}
