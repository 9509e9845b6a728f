//! Structural verification of class files
//!
//! This is the check a host runs before defining a class: every method body
//! must decode into valid instructions, jump only to instruction boundaries
//! that carry a stack-map frame, reference constants and locals that exist,
//! and never run off the end of its code.

use crate::class::{ClassFile, MethodDef};
use crate::descriptor::{MethodDescriptor, ValueType};
use crate::encoder::BytecodeReader;
use crate::opcode::Opcode;
use std::collections::BTreeSet;

/// Bytecode verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Invalid opcode
    #[error("Invalid opcode {opcode:#x} at offset {offset}")]
    InvalidOpcode {
        /// The byte that was read
        opcode: u8,
        /// Offset of the byte
        offset: usize,
    },

    /// Instruction operand runs past the end of the code
    #[error("Truncated instruction at offset {0}")]
    Truncated(usize),

    /// Stack underflow
    #[error("Stack underflow at offset {0}")]
    StackUnderflow(usize),

    /// Stack deeper than the declared maximum
    #[error("Stack overflow at offset {0} (depth: {1})")]
    StackOverflow(usize, usize),

    /// Stack depth disagrees with the frame at an offset
    #[error("Stack depth {actual} at offset {offset} does not match frame depth {expected}")]
    StackMismatch {
        /// Offset of the frame
        offset: usize,
        /// Depth recorded in the frame
        expected: usize,
        /// Depth reaching the offset
        actual: usize,
    },

    /// Invalid jump target
    #[error("Invalid jump target {target} at offset {offset}")]
    InvalidJumpTarget {
        /// Computed target
        target: i64,
        /// Offset of the jump
        offset: usize,
    },

    /// Jump target without a stack-map frame
    #[error("Missing stack-map frame at offset {0}")]
    MissingFrame(usize),

    /// Instruction that no control flow reaches and no frame describes
    #[error("Unreachable code at offset {0}")]
    UnreachableCode(usize),

    /// Invalid constant pool reference
    #[error("Invalid constant pool reference: index {index} at offset {offset}")]
    InvalidConstantRef {
        /// Referenced index
        index: u32,
        /// Offset of the instruction
        offset: usize,
    },

    /// Invalid local variable reference
    #[error("Invalid local variable reference: index {index} (max {max}) at offset {offset}")]
    InvalidLocalRef {
        /// Referenced slot
        index: usize,
        /// Declared number of slots
        max: usize,
        /// Offset of the instruction
        offset: usize,
    },

    /// Malformed descriptor on a method or member reference
    #[error("Invalid descriptor {0:?}")]
    InvalidDescriptor(String),

    /// Execution falls off end
    #[error("Execution falls off end of method at offset {0}")]
    FallOffEnd(usize),

    /// Non-abstract method without code
    #[error("Method has no code")]
    MissingCode,

    /// Error inside a specific method
    #[error("{name}{descriptor}: {source}")]
    Method {
        /// Method name
        name: String,
        /// Method descriptor
        descriptor: String,
        /// The underlying error
        source: Box<VerifyError>,
    },
}

/// Decoded instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Offset of the opcode byte
    pub offset: usize,
    /// The opcode
    pub opcode: Opcode,
    /// Raw operand bytes
    pub operands: Vec<u8>,
}

impl Instruction {
    /// Offset of the following instruction
    pub fn next_offset(&self) -> usize {
        self.offset + 1 + self.operands.len()
    }

    /// Operand as a u16 (local slot)
    pub fn operand_u16(&self) -> u16 {
        u16::from_le_bytes([self.operands[0], self.operands[1]])
    }

    /// Operand as a u32 (pool index)
    pub fn operand_u32(&self) -> u32 {
        u32::from_le_bytes([
            self.operands[0],
            self.operands[1],
            self.operands[2],
            self.operands[3],
        ])
    }

    /// Absolute jump target; may be out of range for malformed code
    pub fn jump_target(&self) -> Option<i64> {
        if !self.opcode.is_jump() {
            return None;
        }
        let relative = self.operand_u32() as i32;
        Some(self.next_offset() as i64 + relative as i64)
    }
}

/// Decode all instructions of a method body
pub fn parse_instructions(code: &[u8]) -> Result<Vec<Instruction>, VerifyError> {
    let mut instructions = Vec::new();
    let mut reader = BytecodeReader::new(code);

    while reader.has_more() {
        let offset = reader.position();
        let byte = reader.read_u8().map_err(|_| VerifyError::Truncated(offset))?;
        let opcode = Opcode::from_u8(byte).ok_or(VerifyError::InvalidOpcode {
            opcode: byte,
            offset,
        })?;

        let operands = reader
            .read_bytes(opcode.operand_size())
            .map_err(|_| VerifyError::Truncated(offset))?;

        instructions.push(Instruction {
            offset,
            opcode,
            operands,
        });
    }

    Ok(instructions)
}

/// Verify every method of a class
pub fn verify_class(class: &ClassFile) -> Result<(), VerifyError> {
    for method in &class.methods {
        verify_method(class, method).map_err(|e| VerifyError::Method {
            name: method.name.clone(),
            descriptor: method.descriptor.clone(),
            source: Box::new(e),
        })?;
    }
    Ok(())
}

/// Verify a single method of `class`
pub fn verify_method(class: &ClassFile, method: &MethodDef) -> Result<(), VerifyError> {
    MethodDescriptor::parse(&method.descriptor)
        .map_err(|_| VerifyError::InvalidDescriptor(method.descriptor.clone()))?;

    if method.code.is_empty() {
        return if method.is_abstract() {
            Ok(())
        } else {
            Err(VerifyError::MissingCode)
        };
    }

    let instructions = parse_instructions(&method.code)?;
    let boundaries: BTreeSet<usize> = instructions.iter().map(|i| i.offset).collect();

    for target in collect_jump_targets(&instructions, &boundaries)? {
        if method.frame_at(target as u32).is_none() {
            return Err(VerifyError::MissingFrame(target));
        }
    }

    verify_constant_refs(&instructions, class)?;
    verify_local_refs(&instructions, method)?;
    verify_stack_depth(&instructions, class, method)?;

    if let Some(last) = instructions.last() {
        if !last.opcode.ends_flow() {
            return Err(VerifyError::FallOffEnd(last.offset));
        }
    }

    Ok(())
}

/// Collect all jump targets, checking they land on instruction boundaries
fn collect_jump_targets(
    instructions: &[Instruction],
    boundaries: &BTreeSet<usize>,
) -> Result<BTreeSet<usize>, VerifyError> {
    let mut targets = BTreeSet::new();

    for instr in instructions {
        if let Some(target) = instr.jump_target() {
            if target < 0 || !boundaries.contains(&(target as usize)) {
                return Err(VerifyError::InvalidJumpTarget {
                    target,
                    offset: instr.offset,
                });
            }
            targets.insert(target as usize);
        }
    }

    Ok(targets)
}

/// Number of stack slots an instruction pops and pushes
pub(crate) fn stack_effect(
    instr: &Instruction,
    class: &ClassFile,
) -> Result<(usize, usize), VerifyError> {
    let effect = match instr.opcode {
        Opcode::Nop | Opcode::Jmp | Opcode::ReturnVoid => (0, 0),
        Opcode::Pop | Opcode::StoreLocal | Opcode::Return | Opcode::Throw => (1, 0),
        Opcode::Dup => (1, 2),
        Opcode::Swap => (2, 2),
        Opcode::ConstNull
        | Opcode::ConstTrue
        | Opcode::ConstFalse
        | Opcode::ConstI32
        | Opcode::ConstF64
        | Opcode::ConstStr
        | Opcode::LoadLocal
        | Opcode::New
        | Opcode::GetStatic => (0, 1),
        Opcode::Iadd
        | Opcode::Isub
        | Opcode::Imul
        | Opcode::Idiv
        | Opcode::Fadd
        | Opcode::Fsub
        | Opcode::Fmul
        | Opcode::Fdiv
        | Opcode::Ieq
        | Opcode::Ine
        | Opcode::Ilt
        | Opcode::Ile
        | Opcode::Igt
        | Opcode::Ige
        | Opcode::Flt
        | Opcode::Fgt => (2, 1),
        Opcode::Ineg
        | Opcode::Fneg
        | Opcode::Not
        | Opcode::GetField
        | Opcode::CheckCast
        | Opcode::InstanceOf => (1, 1),
        Opcode::JmpIfFalse | Opcode::JmpIfTrue | Opcode::JmpIfNull | Opcode::JmpIfNotNull => {
            (1, 0)
        }
        Opcode::PutField => (2, 0),
        Opcode::PutStatic => (1, 0),
        Opcode::InvokeVirtual | Opcode::InvokeStatic | Opcode::InvokeSpecial => {
            let desc = invoked_descriptor(instr, class)?;
            let receiver = usize::from(instr.opcode != Opcode::InvokeStatic);
            let pushes = usize::from(desc.ret != ValueType::Void);
            (desc.params.len() + receiver, pushes)
        }
    };
    Ok(effect)
}

/// Descriptor of the method an invoke instruction calls
pub(crate) fn invoked_descriptor(
    instr: &Instruction,
    class: &ClassFile,
) -> Result<MethodDescriptor, VerifyError> {
    let index = instr.operand_u32();
    let member = class
        .constants
        .get_member(index)
        .ok_or(VerifyError::InvalidConstantRef {
            index,
            offset: instr.offset,
        })?;
    MethodDescriptor::parse(&member.descriptor)
        .map_err(|_| VerifyError::InvalidDescriptor(member.descriptor.clone()))
}

/// Verify stack depth against frames and the declared maximum
fn verify_stack_depth(
    instructions: &[Instruction],
    class: &ClassFile,
    method: &MethodDef,
) -> Result<(), VerifyError> {
    let max_stack = method.max_stack as usize;
    let mut depth = Some(0usize);

    for instr in instructions {
        let frame = method.frame_at(instr.offset as u32);
        let current = match (depth, frame) {
            (Some(actual), Some(frame)) if actual != frame.stack.len() => {
                return Err(VerifyError::StackMismatch {
                    offset: instr.offset,
                    expected: frame.stack.len(),
                    actual,
                });
            }
            (_, Some(frame)) => frame.stack.len(),
            (Some(actual), None) => actual,
            (None, None) => return Err(VerifyError::UnreachableCode(instr.offset)),
        };

        let (pops, pushes) = stack_effect(instr, class)?;
        if current < pops {
            return Err(VerifyError::StackUnderflow(instr.offset));
        }
        let after = current - pops + pushes;
        if after > max_stack {
            return Err(VerifyError::StackOverflow(instr.offset, after));
        }

        if let Some(target) = instr.jump_target() {
            let target = target as usize;
            if let Some(frame) = method.frame_at(target as u32) {
                if frame.stack.len() != after {
                    return Err(VerifyError::StackMismatch {
                        offset: target,
                        expected: frame.stack.len(),
                        actual: after,
                    });
                }
            }
        }

        depth = if instr.opcode.ends_flow() {
            None
        } else {
            Some(after)
        };
    }

    Ok(())
}

/// Verify constant pool references in instructions
fn verify_constant_refs(instructions: &[Instruction], class: &ClassFile) -> Result<(), VerifyError> {
    let pool = &class.constants;

    for instr in instructions {
        let index = match instr.opcode {
            Opcode::ConstStr
            | Opcode::New
            | Opcode::CheckCast
            | Opcode::InstanceOf
            | Opcode::GetField
            | Opcode::PutField
            | Opcode::GetStatic
            | Opcode::PutStatic => instr.operand_u32(),
            op if op.is_invoke() => instr.operand_u32(),
            _ => continue,
        };
        let invalid = VerifyError::InvalidConstantRef {
            index,
            offset: instr.offset,
        };

        match instr.opcode {
            Opcode::ConstStr => {
                pool.get_string(index).ok_or(invalid)?;
            }
            Opcode::New | Opcode::CheckCast | Opcode::InstanceOf => {
                pool.get_class(index).ok_or(invalid)?;
            }
            op if op.is_invoke() => {
                let member = pool.get_member(index).ok_or(invalid)?;
                if !member.is_method() {
                    return Err(VerifyError::InvalidDescriptor(member.descriptor.clone()));
                }
            }
            _ => {
                let member = pool.get_member(index).ok_or(invalid)?;
                ValueType::parse(&member.descriptor)
                    .map_err(|_| VerifyError::InvalidDescriptor(member.descriptor.clone()))?;
            }
        }
    }

    Ok(())
}

/// Verify local variable references in instructions
fn verify_local_refs(instructions: &[Instruction], method: &MethodDef) -> Result<(), VerifyError> {
    let max_locals = method.max_locals as usize;

    for instr in instructions {
        if matches!(instr.opcode, Opcode::LoadLocal | Opcode::StoreLocal) {
            let index = instr.operand_u16() as usize;
            if index >= max_locals {
                return Err(VerifyError::InvalidLocalRef {
                    index,
                    max: max_locals,
                    offset: instr.offset,
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{access, Frame, VerificationType, OBJECT_CLASS};
    use crate::constants::MemberRef;
    use crate::encoder::BytecodeWriter;

    fn class_with(method: MethodDef) -> ClassFile {
        let mut class = ClassFile::new("game.Test", Some(OBJECT_CLASS));
        class.methods.push(method);
        class
    }

    fn method(code: Vec<u8>, max_stack: u16, max_locals: u16) -> MethodDef {
        let mut method = MethodDef::new("run", "()V", code);
        method.access |= access::STATIC;
        method.max_stack = max_stack;
        method.max_locals = max_locals;
        method
    }

    fn unwrap_method_error(result: Result<(), VerifyError>) -> VerifyError {
        match result {
            Err(VerifyError::Method { source, .. }) => *source,
            other => panic!("expected method error, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_empty_class() {
        let class = ClassFile::new("game.Empty", Some(OBJECT_CLASS));
        assert!(verify_class(&class).is_ok());
    }

    #[test]
    fn test_verify_simple_method() {
        let mut writer = BytecodeWriter::new();
        writer.emit_const_i32(42);
        writer.emit_pop();
        writer.emit_return_void();

        let class = class_with(method(writer.into_bytes(), 1, 0));
        assert!(verify_class(&class).is_ok());
    }

    #[test]
    fn test_verify_abstract_method() {
        let mut abstract_method = method(Vec::new(), 0, 0);
        abstract_method.access |= access::ABSTRACT;
        assert!(verify_class(&class_with(abstract_method)).is_ok());

        let err = unwrap_method_error(verify_class(&class_with(method(Vec::new(), 0, 0))));
        assert!(matches!(err, VerifyError::MissingCode));
    }

    #[test]
    fn test_verify_invalid_opcode() {
        let class = class_with(method(vec![0xFF], 0, 0));
        let err = unwrap_method_error(verify_class(&class));
        assert!(matches!(err, VerifyError::InvalidOpcode { opcode: 0xFF, .. }));
    }

    #[test]
    fn test_verify_stack_underflow() {
        let mut writer = BytecodeWriter::new();
        writer.emit_iadd();
        writer.emit_return_void();

        let err = unwrap_method_error(verify_class(&class_with(method(writer.into_bytes(), 2, 0))));
        assert!(matches!(err, VerifyError::StackUnderflow(0)));
    }

    #[test]
    fn test_verify_stack_overflow() {
        let mut writer = BytecodeWriter::new();
        writer.emit_const_i32(1);
        writer.emit_const_i32(2);
        writer.emit_pop();
        writer.emit_pop();
        writer.emit_return_void();

        let err = unwrap_method_error(verify_class(&class_with(method(writer.into_bytes(), 1, 0))));
        assert!(matches!(err, VerifyError::StackOverflow(5, 2)));
    }

    #[test]
    fn test_verify_invalid_local_ref() {
        let mut writer = BytecodeWriter::new();
        writer.emit_load_local(5);
        writer.emit_pop();
        writer.emit_return_void();

        let err = unwrap_method_error(verify_class(&class_with(method(writer.into_bytes(), 1, 2))));
        assert!(matches!(err, VerifyError::InvalidLocalRef { index: 5, max: 2, .. }));
    }

    #[test]
    fn test_verify_method_without_terminator() {
        let mut writer = BytecodeWriter::new();
        writer.emit_const_i32(42);

        let err = unwrap_method_error(verify_class(&class_with(method(writer.into_bytes(), 1, 0))));
        assert!(matches!(err, VerifyError::FallOffEnd(0)));
    }

    #[test]
    fn test_verify_invalid_constant_ref() {
        let mut writer = BytecodeWriter::new();
        writer.emit_const_str(3);
        writer.emit_pop();
        writer.emit_return_void();

        let err = unwrap_method_error(verify_class(&class_with(method(writer.into_bytes(), 1, 0))));
        assert!(matches!(err, VerifyError::InvalidConstantRef { index: 3, .. }));
    }

    fn branching_code() -> (Vec<u8>, usize) {
        let mut writer = BytecodeWriter::new();
        writer.emit_const_i32(1);
        let operand = writer.emit_jump(Opcode::JmpIfFalse);
        writer.emit_nop();
        let target = writer.offset();
        writer.patch_jump(operand, target);
        writer.emit_return_void();
        (writer.into_bytes(), target)
    }

    #[test]
    fn test_verify_missing_frame() {
        let (code, target) = branching_code();
        let err = unwrap_method_error(verify_class(&class_with(method(code, 1, 0))));
        assert!(matches!(err, VerifyError::MissingFrame(t) if t == target));
    }

    #[test]
    fn test_verify_with_frame() {
        let (code, target) = branching_code();
        let mut m = method(code, 1, 0);
        m.frames.push(Frame {
            offset: target as u32,
            locals: Vec::new(),
            stack: Vec::new(),
        });
        assert!(verify_class(&class_with(m)).is_ok());
    }

    #[test]
    fn test_verify_frame_depth_mismatch() {
        let (code, target) = branching_code();
        let mut m = method(code, 1, 0);
        m.frames.push(Frame {
            offset: target as u32,
            locals: Vec::new(),
            stack: vec![VerificationType::Int],
        });
        let err = unwrap_method_error(verify_class(&class_with(m)));
        assert!(matches!(err, VerifyError::StackMismatch { .. }));
    }

    #[test]
    fn test_verify_jump_into_operand() {
        let mut writer = BytecodeWriter::new();
        let operand = writer.emit_jump(Opcode::Jmp);
        writer.emit_const_i32(7);
        writer.emit_return_void();
        writer.patch_jump(operand, 6);

        let err = unwrap_method_error(verify_class(&class_with(method(writer.into_bytes(), 1, 0))));
        assert!(matches!(err, VerifyError::InvalidJumpTarget { target: 6, .. }));
    }

    #[test]
    fn test_verify_invoke_uses_descriptor() {
        let mut class = ClassFile::new("game.Test", Some(OBJECT_CLASS));
        let add = class
            .constants
            .intern_member(MemberRef::new("game.Math", "add", "(II)I"));

        let mut writer = BytecodeWriter::new();
        writer.emit_const_i32(1);
        writer.emit_const_i32(2);
        writer.emit_indexed(Opcode::InvokeStatic, add);
        writer.emit_pop();
        writer.emit_return_void();
        class.methods.push(method(writer.into_bytes(), 2, 0));

        assert!(verify_class(&class).is_ok());
    }
}
