//! Anvil class file format
//!
//! This crate provides the instruction set, constant pool, class file
//! container, element visitors, structural verifier and stack-map frame
//! computation used by the Anvil loader.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod class;
pub mod constants;
pub mod descriptor;
pub mod encoder;
pub mod frames;
pub mod opcode;
pub mod verify;
pub mod visitor;

pub use class::{
    access, entry_name, class_name_of_entry, flags, Annotation, AnnotationValue, Attribute,
    ClassFile, ClassFileError, ClassHeader, DebugInfo, FieldDef, Frame, LineNumber, MethodDef,
    VerificationType, OBJECT_CLASS, STRING_CLASS,
};
pub use constants::{ConstantPool, MemberRef};
pub use descriptor::{DescriptorError, MethodDescriptor, ValueType};
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use frames::{FrameError, ResolveError, SuperClassResolver};
pub use opcode::Opcode;
pub use verify::{verify_class, VerifyError};
pub use visitor::ClassVisitor;
