use super::opcode::{Instruction, Opcode};
use crate::error::CoreResult;
use crate::registry::ArrayId;

/// The single consumer interface a backend (GPU or cluster) implements to
/// receive a self-contained batch from the queue — spec.md §6,
/// "Instruction Queue to Scheduler: a single call `schedule(count, list)`".
pub trait Scheduler {
    fn schedule(&mut self, instructions: &[Instruction]) -> CoreResult<()>;
}

/// Single append-only ordered instruction sequence per process — spec.md
/// §4.2. Producers never block; flush is triggered explicitly.
pub struct InstructionQueue {
    pending: Vec<Instruction>,
}

impl InstructionQueue {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// `enqueue(opcode, operand0, operand1?, operand2?)` — spec.md §6.
    /// Never blocks, never validates; validation happens downstream in the
    /// scheduler that eventually receives this instruction.
    pub fn enqueue(&mut self, instruction: Instruction) {
        self.pending.push(instruction);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether the given instruction is itself a flush point: an explicit
    /// `SYNC` targeting a live array. Iterator-begin and process shutdown
    /// are the other two flush triggers (spec.md §4.2) and are driven by
    /// callers outside the queue (`Runtime::sync`/`Runtime::drop`).
    pub fn is_flush_point(instruction: &Instruction) -> bool {
        matches!(instruction.opcode, Opcode::Sync) && instruction.target().is_some()
    }

    /// Drain everything queued so far and hand it to `scheduler` as one
    /// self-contained batch, per the Instruction Queue → Scheduler
    /// interface in spec.md §6.
    pub fn flush(&mut self, scheduler: &mut dyn Scheduler) -> CoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        scheduler.schedule(&batch)
    }

    /// Enqueue then immediately flush if this instruction is a flush
    /// point — the policy spec.md §4.2 describes for explicit `SYNC`s.
    pub fn enqueue_and_maybe_flush(
        &mut self,
        instruction: Instruction,
        scheduler: Option<&mut dyn Scheduler>,
    ) -> CoreResult<()> {
        let is_flush_point = Self::is_flush_point(&instruction);
        self.enqueue(instruction);
        match (is_flush_point, scheduler) {
            (true, Some(scheduler)) => self.flush(scheduler),
            _ => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &[Instruction] {
        &self.pending
    }

    /// Human-readable dump of whatever is currently pending, for the
    /// `pprint`-style debug logging spec.md §1 treats as an external
    /// collaborator's concern — this is the core's side of that contract,
    /// a plain `serde_json` rendering rather than a hand-rolled formatter.
    pub fn debug_dump(&self) -> String {
        serde_json::to_string_pretty(&self.pending)
            .unwrap_or_else(|e| format!("<instruction queue dump failed: {e}>"))
    }
}

impl Default for InstructionQueue {
    fn default() -> Self {
        Self::new()
    }
}
