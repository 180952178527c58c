//! Cluster Dispatch Protocol (C8) — spec.md §4.8. One typed enum replaces
//! the original's length-prefixed byte-soup
//! (`vem/cluster/cphvb_vem_cluster_slave.cpp` reads a message tag then a
//! hand-rolled payload depending on it); `bincode` encodes the same
//! information content the original pushes over the wire by hand.

use crate::error::{CoreError, CoreResult};
use crate::instruction::{Instruction, Opcode, Operand};
use crate::registry::{ArrayId, ElemType};
use serde::{Deserialize, Serialize};

/// A network-safe mirror of `Instruction`: array ids travel as bare
/// `u64`s that the receiving slave rewrites to its own local handles
/// before the instruction means anything locally (spec.md §4.9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireInstruction {
    pub opcode: Opcode,
    pub operands: [Option<WireOperand>; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum WireOperand {
    Array(u64),
    Immediate(crate::instruction::Scalar),
}

impl WireInstruction {
    /// Build the wire form of a master-side `Instruction`, identity-
    /// mapping array ids as plain integers.
    pub fn from_instruction(instruction: &Instruction) -> Self {
        let operands = instruction.operands.map(|operand| {
            operand.map(|op| match op {
                Operand::Array(id) => WireOperand::Array(id.0),
                Operand::Immediate(scalar) => WireOperand::Immediate(scalar),
            })
        });
        Self {
            opcode: instruction.opcode,
            operands,
        }
    }

    /// Rebuild a local `Instruction`, mapping each wire array id through
    /// `rewrite` (master id → this rank's local `ArrayId`).
    pub fn into_instruction(self, rewrite: impl Fn(u64) -> ArrayId) -> Instruction {
        let operands = self.operands.map(|operand| {
            operand.map(|op| match op {
                WireOperand::Array(id) => Operand::Array(rewrite(id)),
                WireOperand::Immediate(scalar) => Operand::Immediate(scalar),
            })
        });
        Instruction::new(self.opcode, operands)
    }
}

/// Shape/type metadata needed to allocate a local descriptor for an array
/// a master distributes — the actual element bytes travel separately via
/// `ProcessGrid::scatter` (`comm_master2slaves`' data half in
/// `vem/cluster/comm.cpp`), so this carries no payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDescriptor {
    pub master_id: u64,
    pub elem_type: ElemType,
    pub shape: Vec<i64>,
    pub is_temp: bool,
}

/// A base array a master is pushing out to the cluster, paired with the
/// partition view describing the receiving rank's local shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedArrayRecord {
    pub descriptor: WireDescriptor,
    pub partition: PartitionView,
}

/// One rank's slice of a distributed base — spec.md §4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionView {
    pub rank: usize,
    pub offset_elements: i64,
    pub count_elements: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatchMessage {
    Init { executor_name: String },
    Shutdown,
    Ufunc { id: i64, name: String },
    Exec {
        instructions: Vec<WireInstruction>,
        new_arrays: Vec<DistributedArrayRecord>,
    },
}

/// Decode a message that arrived as raw bytes over a real transport (a
/// socket- or MPI-backed `ProcessGrid`, unlike the in-process
/// `ChannelProcessGrid` which already hands over a typed value). The
/// wire form is a trailing 4-byte CRC32 over the `bincode` payload,
/// checked before deserialisation — a transport that drops or corrupts
/// bytes in flight must not silently hand a peer a different message
/// than the one the master sent. A corrupt, truncated, or unrecognised
/// payload is exactly spec.md §7's `UNKNOWN_MESSAGE` case — `tag` carries
/// the payload's length since there is no message-tag byte left to
/// report once the checksum or `bincode` has already rejected it.
pub fn decode(bytes: &[u8]) -> CoreResult<DispatchMessage> {
    if bytes.len() < 4 {
        return Err(CoreError::UnknownMessage {
            tag: bytes.len() as u32,
        });
    }
    let (payload, checksum_bytes) = bytes.split_at(bytes.len() - 4);
    let expected = u32::from_le_bytes(checksum_bytes.try_into().expect("split at len - 4"));
    if crc32fast::hash(payload) != expected {
        return Err(CoreError::UnknownMessage {
            tag: bytes.len() as u32,
        });
    }
    bincode::deserialize(payload).map_err(|_| CoreError::UnknownMessage {
        tag: bytes.len() as u32,
    })
}

/// Encode a message for that same real transport, appending its CRC32.
pub fn encode(message: &DispatchMessage) -> CoreResult<Vec<u8>> {
    let mut payload = bincode::serialize(message).map_err(|e| CoreError::GenericDeviceError {
        reason: format!("failed to encode dispatch message: {e}"),
    })?;
    let checksum = crc32fast::hash(&payload);
    payload.extend_from_slice(&checksum.to_le_bytes());
    Ok(payload)
}

/// `⌊N/P⌋` elements per rank, the remainder folded onto the last rank —
/// the exact split `comm_master2slaves` computes in
/// `vem/cluster/comm.cpp`, exercised by scenario S4.
pub fn partition_counts(total_elements: i64, world_size: usize) -> Vec<i64> {
    assert!(world_size >= 1);
    let base = total_elements / world_size as i64;
    let remainder = total_elements % world_size as i64;
    let mut counts = vec![base; world_size];
    if let Some(last) = counts.last_mut() {
        *last += remainder;
    }
    counts
}

/// Byte counts for `ProcessGrid::scatter`: `partition_counts` scaled by
/// `elem_size`.
pub fn partition_byte_counts(total_elements: i64, world_size: usize, elem_size: usize) -> Vec<usize> {
    partition_counts(total_elements, world_size)
        .into_iter()
        .map(|count| count as usize * elem_size)
        .collect()
}

/// Running prefix sum of `counts` — the `displs` array MPI's
/// `Scatterv`/`Gatherv` expect alongside a counts array.
pub fn partition_displs(counts: &[usize]) -> Vec<usize> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut running = 0usize;
    for &count in counts {
        displs.push(running);
        running += count;
    }
    displs
}

/// Build the `PartitionView` for each rank over a base of
/// `total_elements`.
pub fn partition_views(total_elements: i64, world_size: usize) -> Vec<PartitionView> {
    let counts = partition_counts(total_elements, world_size);
    let mut offset = 0i64;
    counts
        .into_iter()
        .enumerate()
        .map(|(rank, count)| {
            let view = PartitionView {
                rank,
                offset_elements: offset,
                count_elements: count,
            };
            offset += count;
            view
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split_has_no_remainder_to_fold() {
        assert_eq!(partition_counts(12, 4), vec![3, 3, 3, 3]);
    }

    #[test]
    fn remainder_folds_onto_last_rank() {
        // 10 elements over 3 ranks: 3, 3, 4.
        assert_eq!(partition_counts(10, 3), vec![3, 3, 4]);
    }

    #[test]
    fn single_rank_gets_everything() {
        assert_eq!(partition_counts(7, 1), vec![7]);
    }

    #[test]
    fn byte_counts_scale_by_elem_size() {
        assert_eq!(
            partition_byte_counts(10, 3, 4),
            vec![12usize, 12, 16]
        );
    }

    #[test]
    fn displs_are_prefix_sums() {
        let counts = vec![3usize, 3, 4];
        assert_eq!(partition_displs(&counts), vec![0, 3, 6]);
    }

    #[test]
    fn partition_views_cover_the_whole_range_exactly_once() {
        let views = partition_views(10, 3);
        let total: i64 = views.iter().map(|v| v.count_elements).sum();
        assert_eq!(total, 10);
        assert_eq!(views[2].offset_elements, 6);
        assert_eq!(views[2].count_elements, 4);
    }

    #[test]
    fn decode_rejects_garbage_as_unknown_message() {
        let garbage = vec![0xffu8; 3];
        assert!(matches!(
            decode(&garbage),
            Err(CoreError::UnknownMessage { .. })
        ));
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let message = DispatchMessage::Ufunc {
            id: 4,
            name: "reduce".to_string(),
        };
        let bytes = encode(&message).unwrap();
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn decode_rejects_a_flipped_bit_in_transit() {
        let message = DispatchMessage::Shutdown;
        let mut bytes = encode(&message).unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(decode(&bytes), Err(CoreError::UnknownMessage { .. })));
    }

    #[test]
    fn wire_instruction_round_trips_through_rewrite() {
        let original = Instruction::binary(
            Opcode::Add,
            ArrayId(42),
            Operand::Array(ArrayId(42)),
            Operand::Immediate(crate::instruction::Scalar::Int64(1)),
        );
        let wire = WireInstruction::from_instruction(&original);
        let rebuilt = wire.into_instruction(|master_id| ArrayId(master_id + 1000));
        assert_eq!(rebuilt.target(), Some(ArrayId(1042)));
    }
}
