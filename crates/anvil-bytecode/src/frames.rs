//! Stack-map frame computation
//!
//! After a class has been edited its frames and `max_stack` are stale. This
//! module recomputes them by abstract interpretation of every method body.
//! Where two reference types meet at a join point the nearest common
//! superclass is needed; that question goes to a [`SuperClassResolver`]
//! supplied by the caller, never to any global class lookup.

use crate::class::{ClassFile, Frame, MethodDef, VerificationType, STRING_CLASS};
use crate::descriptor::{MethodDescriptor, ValueType};
use crate::opcode::Opcode;
use crate::verify::{invoked_descriptor, parse_instructions, Instruction, VerifyError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Error type resolvers report
pub type ResolveError = Box<dyn std::error::Error + Send + Sync>;

/// Answers "nearest common superclass" questions during frame computation
pub trait SuperClassResolver {
    /// Nearest common superclass of the two named classes
    fn common_super_class(&self, a: &str, b: &str) -> Result<String, ResolveError>;
}

impl<F> SuperClassResolver for F
where
    F: Fn(&str, &str) -> Result<String, ResolveError>,
{
    fn common_super_class(&self, a: &str, b: &str) -> Result<String, ResolveError> {
        self(a, b)
    }
}

/// Frame computation errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// The method body failed structural decoding
    #[error("{0}")]
    Verify(#[from] VerifyError),

    /// Malformed method or member descriptor
    #[error("Invalid descriptor {0:?}")]
    Descriptor(String),

    /// Two paths reach an offset with different stack heights
    #[error("Stack height mismatch at offset {offset}: {left} vs {right}")]
    StackHeightMismatch {
        /// Join offset
        offset: usize,
        /// Height already recorded
        left: usize,
        /// Height of the incoming path
        right: usize,
    },

    /// Two paths leave incompatible values on the stack
    #[error("Incompatible stack values at offset {offset}: {left:?} vs {right:?}")]
    IncompatibleStack {
        /// Join offset
        offset: usize,
        /// Value already recorded
        left: VerificationType,
        /// Value of the incoming path
        right: VerificationType,
    },

    /// An instruction found a value of the wrong kind
    #[error("Expected {expected} at offset {offset}, found {found:?}")]
    TypeMismatch {
        /// Instruction offset
        offset: usize,
        /// What the instruction needs
        expected: &'static str,
        /// What was on the stack
        found: VerificationType,
    },

    /// A local was read before any path stored to it
    #[error("Read of unset local {index} at offset {offset}")]
    UnsetLocal {
        /// Local slot
        index: usize,
        /// Instruction offset
        offset: usize,
    },

    /// Operand stack ran empty
    #[error("Stack underflow at offset {0}")]
    StackUnderflow(usize),

    /// A computed size does not fit its 16-bit field
    #[error("{field} of {value} exceeds 65535")]
    LimitExceeded {
        /// Field being computed
        field: &'static str,
        /// Computed value
        value: usize,
    },

    /// The resolver could not answer
    #[error("Cannot resolve common superclass of {a} and {b}: {source}")]
    Resolver {
        /// First class
        a: String,
        /// Second class
        b: String,
        /// Resolver failure
        source: ResolveError,
    },
}

impl ClassFile {
    /// Recompute frames, `max_stack` and `max_locals` of every method
    pub fn compute_frames(&mut self, resolver: &dyn SuperClassResolver) -> Result<(), FrameError> {
        let mut methods = std::mem::take(&mut self.methods);
        let result = methods
            .iter_mut()
            .try_for_each(|method| compute_method_frames(self, method, resolver));
        self.methods = methods;
        result
    }
}

#[derive(Debug, Clone, PartialEq)]
struct State {
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
}

fn value_type_to_verification(ty: &ValueType) -> VerificationType {
    match ty {
        ValueType::Int | ValueType::Bool => VerificationType::Int,
        ValueType::Float => VerificationType::Float,
        ValueType::Ref(name) => VerificationType::Object(name.clone()),
        ValueType::Void => VerificationType::Top,
    }
}

/// Recompute the frames of a single method of `class`
pub fn compute_method_frames(
    class: &ClassFile,
    method: &mut MethodDef,
    resolver: &dyn SuperClassResolver,
) -> Result<(), FrameError> {
    if method.code.is_empty() {
        method.frames.clear();
        return Ok(());
    }

    let descriptor = MethodDescriptor::parse(&method.descriptor)
        .map_err(|_| FrameError::Descriptor(method.descriptor.clone()))?;
    let instructions = parse_instructions(&method.code)?;
    let index_of: BTreeMap<usize, usize> = instructions
        .iter()
        .enumerate()
        .map(|(i, instr)| (instr.offset, i))
        .collect();

    let mut entry_locals = Vec::new();
    if !method.is_static() {
        entry_locals.push(VerificationType::Object(class.name().to_string()));
    }
    entry_locals.extend(descriptor.params.iter().map(value_type_to_verification));

    let highest_slot = instructions
        .iter()
        .filter(|i| matches!(i.opcode, Opcode::LoadLocal | Opcode::StoreLocal))
        .map(|i| i.operand_u16() as usize + 1)
        .max()
        .unwrap_or(0);
    let max_locals = entry_locals
        .len()
        .max(highest_slot)
        .max(method.max_locals as usize);
    let max_locals_field = narrow("max_locals", max_locals)?;
    entry_locals.resize(max_locals, VerificationType::Top);

    let mut states: Vec<Option<State>> = vec![None; instructions.len()];
    states[0] = Some(State {
        locals: entry_locals,
        stack: Vec::new(),
    });
    let mut worklist = BTreeSet::from([0usize]);
    let mut max_stack = 0usize;
    let mut targets = BTreeSet::new();

    while let Some(index) = worklist.pop_first() {
        let instr = &instructions[index];
        let Some(mut state) = states[index].clone() else {
            continue;
        };

        step(instr, class, &mut state)?;
        max_stack = max_stack.max(state.stack.len());

        let mut successors = Vec::new();
        if let Some(target) = instr.jump_target() {
            let target = target as usize;
            let target_index = *index_of.get(&target).ok_or(VerifyError::InvalidJumpTarget {
                target: target as i64,
                offset: instr.offset,
            })?;
            targets.insert(target);
            successors.push(target_index);
        }
        if !instr.opcode.ends_flow() {
            if index + 1 >= instructions.len() {
                return Err(VerifyError::FallOffEnd(instr.offset).into());
            }
            successors.push(index + 1);
        }

        for successor in successors {
            let offset = instructions[successor].offset;
            let changed = match states[successor].as_mut() {
                None => {
                    states[successor] = Some(state.clone());
                    true
                }
                Some(existing) => merge_into(existing, &state, offset, resolver)?,
            };
            if changed {
                worklist.insert(successor);
            }
        }
    }

    let max_stack = narrow("max_stack", max_stack)?;
    method.frames = targets
        .into_iter()
        .filter_map(|offset| {
            let state = index_of.get(&offset).and_then(|&i| states[i].as_ref())?;
            Some(Frame {
                offset: offset as u32,
                locals: state.locals.clone(),
                stack: state.stack.clone(),
            })
        })
        .collect();
    method.max_stack = max_stack;
    method.max_locals = max_locals_field;
    Ok(())
}

fn narrow(field: &'static str, value: usize) -> Result<u16, FrameError> {
    u16::try_from(value).map_err(|_| FrameError::LimitExceeded { field, value })
}

fn merge_into(
    existing: &mut State,
    incoming: &State,
    offset: usize,
    resolver: &dyn SuperClassResolver,
) -> Result<bool, FrameError> {
    if existing.stack.len() != incoming.stack.len() {
        return Err(FrameError::StackHeightMismatch {
            offset,
            left: existing.stack.len(),
            right: incoming.stack.len(),
        });
    }

    let mut changed = false;
    for (slot, other) in existing.locals.iter_mut().zip(&incoming.locals) {
        let merged = merge_types(slot, other, resolver)?.unwrap_or(VerificationType::Top);
        if merged != *slot {
            *slot = merged;
            changed = true;
        }
    }
    for (slot, other) in existing.stack.iter_mut().zip(&incoming.stack) {
        let merged = merge_types(slot, other, resolver)?.ok_or_else(|| {
            FrameError::IncompatibleStack {
                offset,
                left: slot.clone(),
                right: other.clone(),
            }
        })?;
        if merged != *slot {
            *slot = merged;
            changed = true;
        }
    }
    Ok(changed)
}

/// Least upper bound of two types, `None` when they have none
fn merge_types(
    a: &VerificationType,
    b: &VerificationType,
    resolver: &dyn SuperClassResolver,
) -> Result<Option<VerificationType>, FrameError> {
    use VerificationType::*;

    let merged = match (a, b) {
        _ if a == b => Some(a.clone()),
        (Null, Object(_)) => Some(b.clone()),
        (Object(_), Null) => Some(a.clone()),
        (Object(x), Object(y)) => {
            let common = resolver
                .common_super_class(x, y)
                .map_err(|source| FrameError::Resolver {
                    a: x.clone(),
                    b: y.clone(),
                    source,
                })?;
            Some(Object(common))
        }
        _ => None,
    };
    Ok(merged)
}

fn pop(state: &mut State, offset: usize) -> Result<VerificationType, FrameError> {
    state.stack.pop().ok_or(FrameError::StackUnderflow(offset))
}

fn pop_expect(
    state: &mut State,
    offset: usize,
    expected: &'static str,
    accept: impl Fn(&VerificationType) -> bool,
) -> Result<VerificationType, FrameError> {
    let value = pop(state, offset)?;
    if accept(&value) {
        Ok(value)
    } else {
        Err(FrameError::TypeMismatch {
            offset,
            expected,
            found: value,
        })
    }
}

fn pop_int(state: &mut State, offset: usize) -> Result<(), FrameError> {
    pop_expect(state, offset, "int", |t| *t == VerificationType::Int).map(|_| ())
}

fn pop_float(state: &mut State, offset: usize) -> Result<(), FrameError> {
    pop_expect(state, offset, "float", |t| *t == VerificationType::Float).map(|_| ())
}

fn pop_reference(state: &mut State, offset: usize) -> Result<(), FrameError> {
    pop_expect(state, offset, "reference", VerificationType::is_reference).map(|_| ())
}

fn pop_value(state: &mut State, offset: usize, ty: &ValueType) -> Result<(), FrameError> {
    match ty {
        ValueType::Int | ValueType::Bool => pop_int(state, offset),
        ValueType::Float => pop_float(state, offset),
        ValueType::Ref(_) => pop_reference(state, offset),
        ValueType::Void => Ok(()),
    }
}

fn pool_class(instr: &Instruction, class: &ClassFile) -> Result<String, FrameError> {
    let index = instr.operand_u32();
    class
        .constants
        .get_class(index)
        .map(str::to_string)
        .ok_or_else(|| {
            VerifyError::InvalidConstantRef {
                index,
                offset: instr.offset,
            }
            .into()
        })
}

fn field_type(instr: &Instruction, class: &ClassFile) -> Result<ValueType, FrameError> {
    let index = instr.operand_u32();
    let member = class
        .constants
        .get_member(index)
        .ok_or(VerifyError::InvalidConstantRef {
            index,
            offset: instr.offset,
        })?;
    ValueType::parse(&member.descriptor).map_err(|_| FrameError::Descriptor(member.descriptor.clone()))
}

/// Apply the effect of one instruction to `state`
fn step(instr: &Instruction, class: &ClassFile, state: &mut State) -> Result<(), FrameError> {
    use VerificationType as V;
    let offset = instr.offset;

    match instr.opcode {
        Opcode::Nop | Opcode::Jmp | Opcode::ReturnVoid => {}
        Opcode::Pop | Opcode::Return => {
            pop(state, offset)?;
        }
        Opcode::Dup => {
            let top = pop(state, offset)?;
            state.stack.push(top.clone());
            state.stack.push(top);
        }
        Opcode::Swap => {
            let b = pop(state, offset)?;
            let a = pop(state, offset)?;
            state.stack.push(b);
            state.stack.push(a);
        }
        Opcode::ConstNull => state.stack.push(V::Null),
        Opcode::ConstTrue | Opcode::ConstFalse | Opcode::ConstI32 => state.stack.push(V::Int),
        Opcode::ConstF64 => state.stack.push(V::Float),
        Opcode::ConstStr => state.stack.push(V::Object(STRING_CLASS.to_string())),
        Opcode::LoadLocal => {
            let index = instr.operand_u16() as usize;
            match state.locals.get(index) {
                Some(V::Top) | None => return Err(FrameError::UnsetLocal { index, offset }),
                Some(ty) => {
                    let ty = ty.clone();
                    state.stack.push(ty);
                }
            }
        }
        Opcode::StoreLocal => {
            let index = instr.operand_u16() as usize;
            let value = pop(state, offset)?;
            state.locals[index] = value;
        }
        Opcode::Iadd
        | Opcode::Isub
        | Opcode::Imul
        | Opcode::Idiv
        | Opcode::Ieq
        | Opcode::Ine
        | Opcode::Ilt
        | Opcode::Ile
        | Opcode::Igt
        | Opcode::Ige => {
            pop_int(state, offset)?;
            pop_int(state, offset)?;
            state.stack.push(V::Int);
        }
        Opcode::Ineg | Opcode::Not => {
            pop_int(state, offset)?;
            state.stack.push(V::Int);
        }
        Opcode::Fadd | Opcode::Fsub | Opcode::Fmul | Opcode::Fdiv => {
            pop_float(state, offset)?;
            pop_float(state, offset)?;
            state.stack.push(V::Float);
        }
        Opcode::Fneg => {
            pop_float(state, offset)?;
            state.stack.push(V::Float);
        }
        Opcode::Flt | Opcode::Fgt => {
            pop_float(state, offset)?;
            pop_float(state, offset)?;
            state.stack.push(V::Int);
        }
        Opcode::JmpIfFalse | Opcode::JmpIfTrue => pop_int(state, offset)?,
        Opcode::JmpIfNull | Opcode::JmpIfNotNull | Opcode::Throw => pop_reference(state, offset)?,
        Opcode::InvokeVirtual | Opcode::InvokeStatic | Opcode::InvokeSpecial => {
            let descriptor = invoked_descriptor(instr, class)?;
            for param in descriptor.params.iter().rev() {
                pop_value(state, offset, param)?;
            }
            if instr.opcode != Opcode::InvokeStatic {
                pop_reference(state, offset)?;
            }
            if descriptor.ret != ValueType::Void {
                state.stack.push(value_type_to_verification(&descriptor.ret));
            }
        }
        Opcode::New => {
            let name = pool_class(instr, class)?;
            state.stack.push(V::Object(name));
        }
        Opcode::CheckCast => {
            let name = pool_class(instr, class)?;
            pop_reference(state, offset)?;
            state.stack.push(V::Object(name));
        }
        Opcode::InstanceOf => {
            pool_class(instr, class)?;
            pop_reference(state, offset)?;
            state.stack.push(V::Int);
        }
        Opcode::GetField => {
            let ty = field_type(instr, class)?;
            pop_reference(state, offset)?;
            state.stack.push(value_type_to_verification(&ty));
        }
        Opcode::PutField => {
            let ty = field_type(instr, class)?;
            pop_value(state, offset, &ty)?;
            pop_reference(state, offset)?;
        }
        Opcode::GetStatic => {
            let ty = field_type(instr, class)?;
            state.stack.push(value_type_to_verification(&ty));
        }
        Opcode::PutStatic => {
            let ty = field_type(instr, class)?;
            pop_value(state, offset, &ty)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{access, OBJECT_CLASS};
    use crate::constants::MemberRef;
    use crate::encoder::BytecodeWriter;
    use crate::verify::verify_class;
    use std::sync::Mutex;

    fn fixed_resolver(answer: &'static str) -> impl Fn(&str, &str) -> Result<String, ResolveError> {
        move |_: &str, _: &str| Ok(answer.to_string())
    }

    /// `pick(flag) { x = flag ? new A : new B; return x }`
    fn join_class() -> ClassFile {
        let mut class = ClassFile::new("game.Picker", Some(OBJECT_CLASS));
        let a = class.constants.intern_class("game.A");
        let b = class.constants.intern_class("game.B");

        let mut w = BytecodeWriter::new();
        w.emit_load_local(0);
        let to_else = w.emit_jump(Opcode::JmpIfFalse);
        w.emit_indexed(Opcode::New, a);
        let to_end = w.emit_jump(Opcode::Jmp);
        let else_offset = w.offset();
        w.emit_indexed(Opcode::New, b);
        let end = w.offset();
        w.emit_store_local(1);
        w.emit_load_local(1);
        w.emit_return();
        w.patch_jump(to_else, else_offset);
        w.patch_jump(to_end, end);

        let mut method = MethodDef::new("pick", "(Z)Lgame.Base;", w.into_bytes());
        method.access |= access::STATIC;
        class.methods.push(method);
        class
    }

    #[test]
    fn test_frames_use_resolver_at_join() {
        let mut class = join_class();
        let asked = Mutex::new(Vec::new());
        let resolver = |a: &str, b: &str| -> Result<String, ResolveError> {
            asked.lock().unwrap().push((a.to_string(), b.to_string()));
            Ok("game.Base".to_string())
        };

        class.compute_frames(&resolver).unwrap();

        let method = &class.methods[0];
        assert_eq!(*asked.lock().unwrap(), vec![("game.A".to_string(), "game.B".to_string())]);
        assert_eq!(method.max_stack, 1);
        assert_eq!(method.max_locals, 2);
        assert_eq!(method.frames.len(), 2);

        let end_frame = method.frames.last().unwrap();
        assert_eq!(end_frame.stack, vec![VerificationType::Object("game.Base".to_string())]);
        assert_eq!(end_frame.locals[0], VerificationType::Int);
        assert_eq!(end_frame.locals[1], VerificationType::Top);

        assert!(verify_class(&class).is_ok());
    }

    #[test]
    fn test_frames_resolver_failure() {
        let mut class = join_class();
        let resolver = |_: &str, _: &str| -> Result<String, ResolveError> {
            Err("hierarchy unavailable".into())
        };

        let err = class.compute_frames(&resolver).unwrap_err();
        assert!(matches!(err, FrameError::Resolver { .. }));
    }

    #[test]
    fn test_straight_line_has_no_frames() {
        let mut class = ClassFile::new("game.Counter", Some(OBJECT_CLASS));
        let count = class
            .constants
            .intern_member(MemberRef::new("game.Counter", "count", "I"));

        let mut w = BytecodeWriter::new();
        w.emit_load_local(0);
        w.emit_load_local(0);
        w.emit_indexed(Opcode::GetField, count);
        w.emit_const_i32(1);
        w.emit_iadd();
        w.emit_indexed(Opcode::PutField, count);
        w.emit_return_void();
        class.methods.push(MethodDef::new("increment", "()V", w.into_bytes()));

        class.compute_frames(&fixed_resolver(OBJECT_CLASS)).unwrap();
        let method = &class.methods[0];
        assert!(method.frames.is_empty());
        assert_eq!(method.max_stack, 3);
        assert_eq!(method.max_locals, 1);
        assert!(verify_class(&class).is_ok());
    }

    #[test]
    fn test_null_merges_without_resolver() {
        let mut class = ClassFile::new("game.Maybe", Some(OBJECT_CLASS));
        let a = class.constants.intern_class("game.A");

        let mut w = BytecodeWriter::new();
        w.emit_load_local(0);
        let to_else = w.emit_jump(Opcode::JmpIfFalse);
        w.emit_indexed(Opcode::New, a);
        let to_end = w.emit_jump(Opcode::Jmp);
        let else_offset = w.offset();
        w.emit_const_null();
        let end = w.offset();
        w.emit_return();
        w.patch_jump(to_else, else_offset);
        w.patch_jump(to_end, end);

        let mut method = MethodDef::new("maybe", "(Z)Lgame.A;", w.into_bytes());
        method.access |= access::STATIC;
        class.methods.push(method);

        let resolver = |_: &str, _: &str| -> Result<String, ResolveError> {
            Err("must not be asked".into())
        };
        class.compute_frames(&resolver).unwrap();
        let frame = class.methods[0].frames.last().unwrap();
        assert_eq!(frame.stack, vec![VerificationType::Object("game.A".to_string())]);
    }

    #[test]
    fn test_stack_height_mismatch() {
        let mut class = ClassFile::new("game.Broken", Some(OBJECT_CLASS));

        let mut w = BytecodeWriter::new();
        w.emit_load_local(0);
        let to_end = w.emit_jump(Opcode::JmpIfFalse);
        w.emit_const_i32(1);
        let end = w.offset();
        w.emit_return_void();
        w.patch_jump(to_end, end);

        let mut method = MethodDef::new("broken", "(Z)V", w.into_bytes());
        method.access |= access::STATIC;
        class.methods.push(method);

        let err = class.compute_frames(&fixed_resolver(OBJECT_CLASS)).unwrap_err();
        assert!(matches!(err, FrameError::StackHeightMismatch { .. }));
    }

    #[test]
    fn test_unset_local() {
        let mut class = ClassFile::new("game.Unset", Some(OBJECT_CLASS));
        let mut w = BytecodeWriter::new();
        w.emit_load_local(1);
        w.emit_return();
        let mut method = MethodDef::new("read", "()I", w.into_bytes());
        method.access |= access::STATIC;
        class.methods.push(method);

        let err = class.compute_frames(&fixed_resolver(OBJECT_CLASS)).unwrap_err();
        assert!(matches!(err, FrameError::UnsetLocal { index: 1, .. }));
    }

    #[test]
    fn test_locals_beyond_u16_are_rejected() {
        let mut class = ClassFile::new("game.Wide", Some(OBJECT_CLASS));
        let mut w = BytecodeWriter::new();
        w.emit_opcode(Opcode::ConstNull);
        w.emit_store_local(u16::MAX);
        w.emit_return_void();
        class.methods.push(MethodDef::new("fill", "()V", w.into_bytes()));

        let err = class.compute_frames(&fixed_resolver(OBJECT_CLASS)).unwrap_err();
        assert!(matches!(
            err,
            FrameError::LimitExceeded {
                field: "max_locals",
                value: 65536
            }
        ));
        assert_eq!(class.methods[0].max_locals, 0);
    }
}
