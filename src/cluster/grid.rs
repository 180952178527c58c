//! Cluster Process Grid (C7) — spec.md §4.7. The core treats "who am I,
//! how many of us are there, send this everywhere, split this array"
//! as a thin trait; an MPI- or TCP-backed implementation is an external
//! collaborator's concern. `ChannelProcessGrid` is the one concrete
//! implementation the corpus supplies: an in-process simulation of a
//! world of N ranks built on `crossbeam-channel`, the same transport the
//! teacher's `thread_pool`/`network` modules use to move work between
//! workers.

use super::protocol::DispatchMessage;
use crate::error::{CoreError, CoreResult};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// `rank()`, `world_size()`, the three collectives the core drives
/// (`broadcast`, `scatter`, `gather`), and `abort` — spec.md §4.7.
pub trait ProcessGrid: Send {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Root sends `message` to every other rank. Non-root callers get
    /// `COLLECTIVE_FAILED`.
    fn broadcast(&self, message: &DispatchMessage) -> CoreResult<()>;

    /// Block until a control message addressed to this rank arrives.
    /// Only meaningful off the root rank.
    fn recv(&self) -> CoreResult<DispatchMessage>;

    /// Root splits `data` into `counts[i]`-byte chunks (see
    /// `cluster::protocol::partition_counts`) and sends chunk `i` to rank
    /// `i`, returning rank 0's own chunk. Only meaningful on the root.
    fn scatter(&self, data: &[u8], counts: &[usize]) -> CoreResult<Vec<u8>>;

    /// Block until this rank's data chunk (sent by a root's `scatter`)
    /// arrives. Only meaningful off the root rank.
    fn recv_scatter(&self) -> CoreResult<Vec<u8>>;

    /// The symmetric collective to `scatter`: gather each rank's local
    /// buffer back to the root. `comm_slaves2master` in
    /// `vem/cluster/comm.cpp` is commented out with no working body to
    /// recover from — per the Open Question resolution in spec.md §9,
    /// this is intentionally left unimplemented rather than guessed.
    fn gather(&self, _local: &[u8]) -> CoreResult<Vec<u8>> {
        Err(CoreError::GenericDeviceError {
            reason: "gather (comm_slaves2master) has no implementation to recover from the \
                     source this was distilled from; the original leaves the body commented out"
                .to_string(),
        })
    }

    /// Mark the grid unusable and propagate the failure that caused it.
    fn abort(&self, reason: String) -> CoreError;
}

struct RankChannels {
    control_tx: Sender<DispatchMessage>,
    control_rx: Receiver<DispatchMessage>,
    data_tx: Sender<Vec<u8>>,
    data_rx: Receiver<Vec<u8>>,
}

/// One rank's endpoint into an in-process simulated world.
pub struct ChannelProcessGrid {
    rank: usize,
    world_size: usize,
    control_senders: Vec<Sender<DispatchMessage>>,
    control_receiver: Receiver<DispatchMessage>,
    data_senders: Vec<Sender<Vec<u8>>>,
    data_receiver: Receiver<Vec<u8>>,
    aborted: Arc<AtomicBool>,
}

impl ChannelProcessGrid {
    /// Build every rank's endpoint for a world of `world_size` in-process
    /// ranks, rank 0 acting as root/master.
    pub fn new_world(world_size: usize) -> Vec<ChannelProcessGrid> {
        assert!(world_size >= 1, "a cluster grid needs at least one rank");

        let channels: Vec<RankChannels> = (0..world_size)
            .map(|_| {
                let (control_tx, control_rx) = crossbeam_channel::unbounded();
                let (data_tx, data_rx) = crossbeam_channel::unbounded();
                RankChannels {
                    control_tx,
                    control_rx,
                    data_tx,
                    data_rx,
                }
            })
            .collect();

        let aborted = Arc::new(AtomicBool::new(false));

        channels
            .iter()
            .enumerate()
            .map(|(rank, own)| ChannelProcessGrid {
                rank,
                world_size,
                control_senders: channels.iter().map(|c| c.control_tx.clone()).collect(),
                control_receiver: own.control_rx.clone(),
                data_senders: channels.iter().map(|c| c.data_tx.clone()).collect(),
                data_receiver: own.data_rx.clone(),
                aborted: aborted.clone(),
            })
            .collect()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl ProcessGrid for ChannelProcessGrid {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, message: &DispatchMessage) -> CoreResult<()> {
        if !self.is_root() {
            return Err(self.abort("broadcast attempted from a non-root rank".to_string()));
        }
        for rank in 1..self.world_size {
            if self.control_senders[rank].send(message.clone()).is_err() {
                return Err(self.abort(format!("broadcast send to rank {rank} failed")));
            }
        }
        Ok(())
    }

    fn recv(&self) -> CoreResult<DispatchMessage> {
        self.control_receiver
            .recv()
            .map_err(|_| self.abort("control channel closed while awaiting a message".to_string()))
    }

    fn scatter(&self, data: &[u8], counts: &[usize]) -> CoreResult<Vec<u8>> {
        if !self.is_root() {
            return Err(self.abort("scatter attempted from a non-root rank".to_string()));
        }
        if counts.len() != self.world_size {
            return Err(self.abort(format!(
                "scatter counts length {} does not match world size {}",
                counts.len(),
                self.world_size
            )));
        }
        let mut offset = 0usize;
        let mut own_chunk = Vec::new();
        for (rank, &count) in counts.iter().enumerate() {
            let chunk = data[offset..offset + count].to_vec();
            offset += count;
            if rank == 0 {
                own_chunk = chunk;
            } else if self.data_senders[rank].send(chunk).is_err() {
                return Err(self.abort(format!("scatter send to rank {rank} failed")));
            }
        }
        Ok(own_chunk)
    }

    fn recv_scatter(&self) -> CoreResult<Vec<u8>> {
        self.data_receiver
            .recv()
            .map_err(|_| self.abort("data channel closed while awaiting a scatter chunk".to_string()))
    }

    fn abort(&self, reason: String) -> CoreError {
        self.aborted.store(true, Ordering::SeqCst);
        log::error!("[ProcessGrid] rank {} aborting: {reason}", self.rank);
        let _ = self.broadcast_best_effort(&DispatchMessage::Shutdown);
        CoreError::CollectiveFailed { reason }
    }
}

impl ChannelProcessGrid {
    fn broadcast_best_effort(&self, message: &DispatchMessage) -> CoreResult<()> {
        if !self.is_root() {
            return Ok(());
        }
        for rank in 1..self.world_size {
            let _ = self.control_senders[rank].send(message.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_size_one_is_trivially_valid() {
        let world = ChannelProcessGrid::new_world(1);
        assert_eq!(world.len(), 1);
        assert!(world[0].is_root());
    }

    #[test]
    fn broadcast_reaches_every_non_root_rank() {
        let mut world = ChannelProcessGrid::new_world(3);
        let root = world.remove(0);
        root.broadcast(&DispatchMessage::Shutdown).unwrap();
        for rank in world {
            assert!(matches!(rank.recv().unwrap(), DispatchMessage::Shutdown));
        }
    }

    #[test]
    fn non_root_broadcast_is_a_collective_failure() {
        let world = ChannelProcessGrid::new_world(2);
        let slave = &world[1];
        assert!(matches!(
            slave.broadcast(&DispatchMessage::Shutdown),
            Err(CoreError::CollectiveFailed { .. })
        ));
    }

    #[test]
    fn gather_is_unimplemented() {
        let world = ChannelProcessGrid::new_world(1);
        assert!(world[0].gather(&[1, 2, 3]).is_err());
    }

    #[test]
    fn scatter_splits_bytes_by_count() {
        let mut world = ChannelProcessGrid::new_world(3);
        let root = world.remove(0);
        let data = vec![1u8, 2, 3, 4, 5, 6];
        let counts = vec![2, 2, 2];
        let own = root.scatter(&data, &counts).unwrap();
        assert_eq!(own, vec![1, 2]);
        assert_eq!(world[0].recv_scatter().unwrap(), vec![3, 4]);
        assert_eq!(world[1].recv_scatter().unwrap(), vec![5, 6]);
    }
}
