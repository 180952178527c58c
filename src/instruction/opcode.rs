use crate::registry::ArrayId;

/// Opcodes partition into computational, synchronisation, and meta —
/// spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Opcode {
    // Computational
    Add,
    Subtract,
    Multiply,
    Divide,
    // Synchronisation
    Sync,
    Discard,
    Free,
    None,
    Release,
    // Meta
    Userfunc,
}

impl Opcode {
    pub fn is_computational(self) -> bool {
        matches!(
            self,
            Opcode::Add | Opcode::Subtract | Opcode::Multiply | Opcode::Divide
        )
    }

    pub fn is_synchronisation(self) -> bool {
        matches!(
            self,
            Opcode::Sync | Opcode::Discard | Opcode::Free | Opcode::None | Opcode::Release
        )
    }

    /// Number of operand slots a fully-formed instruction with this opcode
    /// uses. Computational ops are binary (dest, lhs, rhs); sync ops take
    /// one array; `NONE`/`USERFUNC` take none that this core interprets.
    pub fn operand_count(self) -> usize {
        match self {
            Opcode::Add | Opcode::Subtract | Opcode::Multiply | Opcode::Divide => 3,
            Opcode::Sync | Opcode::Discard | Opcode::Free | Opcode::Release => 1,
            Opcode::None | Opcode::Userfunc => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Add => "ADD",
            Opcode::Subtract => "SUBTRACT",
            Opcode::Multiply => "MULTIPLY",
            Opcode::Divide => "DIVIDE",
            Opcode::Sync => "SYNC",
            Opcode::Discard => "DISCARD",
            Opcode::Free => "FREE",
            Opcode::None => "NONE",
            Opcode::Release => "RELEASE",
            Opcode::Userfunc => "USERFUNC",
        }
    }
}

/// An immediate scalar operand.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Scalar {
    Int64(i64),
    Float64(f64),
    Bool(bool),
}

/// An instruction operand: either a reference to an array or an immediate.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Operand {
    Array(ArrayId),
    Immediate(Scalar),
}

impl Operand {
    pub fn as_array(self) -> Option<ArrayId> {
        match self {
            Operand::Array(id) => Some(id),
            Operand::Immediate(_) => None,
        }
    }

    pub fn is_scalar(self) -> bool {
        matches!(self, Operand::Immediate(_))
    }
}

/// An opcode plus up to three operand slots — spec.md §3.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: [Option<Operand>; 3],
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: [Option<Operand>; 3]) -> Self {
        Self { opcode, operands }
    }

    /// Convenience constructor for the single-operand sync/discard/free/
    /// release family.
    pub fn unary(opcode: Opcode, target: ArrayId) -> Self {
        Self::new(opcode, [Some(Operand::Array(target)), None, None])
    }

    /// Convenience constructor for binary computational ops:
    /// `dest = lhs OP rhs`.
    pub fn binary(opcode: Opcode, dest: ArrayId, lhs: Operand, rhs: Operand) -> Self {
        Self::new(
            opcode,
            [Some(Operand::Array(dest)), Some(lhs), Some(rhs)],
        )
    }

    /// Every array id referenced by this instruction's operands, in slot
    /// order, skipping immediates.
    pub fn array_operands(&self) -> impl Iterator<Item = ArrayId> + '_ {
        self.operands.iter().filter_map(|op| op.and_then(Operand::as_array))
    }

    /// The first operand, conventionally the instruction's output/target.
    pub fn target(&self) -> Option<ArrayId> {
        self.operands[0].and_then(Operand::as_array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_instruction_shape() {
        let inst = Instruction::binary(
            Opcode::Add,
            ArrayId(0),
            Operand::Array(ArrayId(0)),
            Operand::Immediate(Scalar::Int64(1)),
        );
        assert_eq!(inst.target(), Some(ArrayId(0)));
        assert_eq!(inst.array_operands().count(), 2);
    }

    #[test]
    fn operand_counts_match_opcode_arity() {
        assert_eq!(Opcode::Add.operand_count(), 3);
        assert_eq!(Opcode::Sync.operand_count(), 1);
        assert_eq!(Opcode::None.operand_count(), 0);
    }
}
