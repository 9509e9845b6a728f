//! Class file format
//!
//! Layout (little-endian):
//! - Header: magic `ANVL` + version (u32) + flags (u32) + CRC32 of the rest (u32)
//! - Class header: access (u16), name, optional super name, interfaces
//! - Constant pool
//! - Class annotations, fields, methods
//! - Debug section (only with [`flags::HAS_DEBUG_INFO`])
//!
//! The class header sits directly after the fixed header so that
//! [`ClassHeader::read`] can answer hierarchy questions without decoding
//! anything else.

use crate::constants::ConstantPool;
use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::visitor::ClassVisitor;
use thiserror::Error;

/// Magic number for class files: "ANVL"
pub const MAGIC: [u8; 4] = *b"ANVL";

/// Current class file version
pub const VERSION: u32 = 1;

/// Size of the fixed header (magic, version, flags, checksum)
pub const HEADER_SIZE: usize = 16;

/// Name of the universal base class
pub const OBJECT_CLASS: &str = "lang.Object";

/// Class of string constants
pub const STRING_CLASS: &str = "lang.String";

/// Class file flags
pub mod flags {
    /// Class file carries a debug section
    pub const HAS_DEBUG_INFO: u32 = 1 << 0;

    /// Every flag this version understands
    pub const KNOWN: u32 = HAS_DEBUG_INFO;
}

/// Access flags for classes, fields and methods
pub mod access {
    /// Visible everywhere
    pub const PUBLIC: u16 = 0x0001;
    /// Visible only inside the declaring class
    pub const PRIVATE: u16 = 0x0002;
    /// Belongs to the class rather than an instance
    pub const STATIC: u16 = 0x0008;
    /// Cannot be overridden or reassigned
    pub const FINAL: u16 = 0x0010;
    /// Class is an interface
    pub const INTERFACE: u16 = 0x0200;
    /// No body / cannot be instantiated
    pub const ABSTRACT: u16 = 0x0400;
    /// Generated, not present in source
    pub const SYNTHETIC: u16 = 0x1000;
}

/// Class file encoding/decoding errors
#[derive(Debug, Error)]
pub enum ClassFileError {
    /// Decode error
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected ANVL, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Flags this version does not understand
    #[error("Unsupported flags: {0:#x}")]
    UnsupportedFlags(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum of the payload
        actual: u32,
    },

    /// Bytes left over after the last section
    #[error("Trailing data at offset {0}")]
    TrailingData(usize),
}

/// Archive entry name of a class: `x.y.Z` becomes `x/y/Z.class`
pub fn entry_name(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

/// Class name of an archive entry, if the entry is a class file
pub fn class_name_of_entry(entry: &str) -> Option<String> {
    entry
        .strip_suffix(".class")
        .filter(|stem| !stem.is_empty())
        .map(|stem| stem.replace('/', "."))
}

/// Name, supertypes and access of a class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassHeader {
    /// Access flags
    pub access: u16,
    /// Dotted class name
    pub name: String,
    /// Direct superclass, `None` only for the universal base
    pub super_name: Option<String>,
    /// Directly implemented (or, for interfaces, extended) interfaces
    pub interfaces: Vec<String>,
}

impl ClassHeader {
    /// Create a public class header
    pub fn new(name: impl Into<String>, super_name: Option<&str>) -> Self {
        Self {
            access: access::PUBLIC,
            name: name.into(),
            super_name: super_name.map(str::to_string),
            interfaces: Vec::new(),
        }
    }

    /// Whether the class is an interface
    pub fn is_interface(&self) -> bool {
        self.access & access::INTERFACE != 0
    }

    /// Read only the class header of an encoded class file
    ///
    /// Validates magic and version but neither the checksum nor anything past
    /// the interface list.
    pub fn read(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut reader = BytecodeReader::new(bytes);
        read_fixed_header(&mut reader)?;
        Ok(Self::decode(&mut reader)?)
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u16(self.access);
        writer.emit_string(&self.name);
        emit_optional_string(writer, self.super_name.as_deref());
        writer.emit_u32(self.interfaces.len() as u32);
        for interface in &self.interfaces {
            writer.emit_string(interface);
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let access = reader.read_u16()?;
        let name = reader.read_string()?;
        let super_name = read_optional_string(reader)?;
        let count = reader.read_u32()? as usize;
        let mut interfaces = Vec::new();
        for _ in 0..count {
            interfaces.push(reader.read_string()?);
        }
        Ok(Self {
            access,
            name,
            super_name,
            interfaces,
        })
    }
}

/// Value of an annotation element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationValue {
    /// Integer literal
    Int(i32),
    /// Boolean literal
    Bool(bool),
    /// String literal
    Str(String),
    /// Enum constant
    Enum {
        /// Descriptor of the enum type
        descriptor: String,
        /// Constant name
        value: String,
    },
}

impl AnnotationValue {
    const TAG_INT: u8 = 0x01;
    const TAG_BOOL: u8 = 0x02;
    const TAG_STR: u8 = 0x03;
    const TAG_ENUM: u8 = 0x04;

    fn encode(&self, writer: &mut BytecodeWriter) {
        match self {
            AnnotationValue::Int(value) => {
                writer.emit_u8(Self::TAG_INT);
                writer.emit_i32(*value);
            }
            AnnotationValue::Bool(value) => {
                writer.emit_u8(Self::TAG_BOOL);
                writer.emit_u8(u8::from(*value));
            }
            AnnotationValue::Str(value) => {
                writer.emit_u8(Self::TAG_STR);
                writer.emit_string(value);
            }
            AnnotationValue::Enum { descriptor, value } => {
                writer.emit_u8(Self::TAG_ENUM);
                writer.emit_string(descriptor);
                writer.emit_string(value);
            }
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        match reader.read_u8()? {
            Self::TAG_INT => Ok(AnnotationValue::Int(reader.read_i32()?)),
            Self::TAG_BOOL => Ok(AnnotationValue::Bool(reader.read_u8()? != 0)),
            Self::TAG_STR => Ok(AnnotationValue::Str(reader.read_string()?)),
            Self::TAG_ENUM => {
                let descriptor = reader.read_string()?;
                let value = reader.read_string()?;
                Ok(AnnotationValue::Enum { descriptor, value })
            }
            tag => Err(DecodeError::InvalidTag { tag, offset }),
        }
    }
}

/// Annotation attached to a class, field or method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Descriptor of the annotation type, e.g. `Lanvil.side.OnlyIn;`
    pub descriptor: String,
    /// Named element values in declaration order
    pub values: Vec<(String, AnnotationValue)>,
}

impl Annotation {
    /// Create an annotation without values
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            values: Vec::new(),
        }
    }

    /// Add a named value
    pub fn with_value(mut self, name: impl Into<String>, value: AnnotationValue) -> Self {
        self.values.push((name.into(), value));
        self
    }

    /// Look up a value by element name
    pub fn value(&self, name: &str) -> Option<&AnnotationValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_string(&self.descriptor);
        writer.emit_u32(self.values.len() as u32);
        for (name, value) in &self.values {
            writer.emit_string(name);
            value.encode(writer);
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let descriptor = reader.read_string()?;
        let count = reader.read_u32()? as usize;
        let mut values = Vec::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            values.push((name, AnnotationValue::decode(reader)?));
        }
        Ok(Self { descriptor, values })
    }
}

fn encode_annotations(annotations: &[Annotation], writer: &mut BytecodeWriter) {
    writer.emit_u32(annotations.len() as u32);
    for annotation in annotations {
        annotation.encode(writer);
    }
}

fn decode_annotations(reader: &mut BytecodeReader<'_>) -> Result<Vec<Annotation>, DecodeError> {
    let count = reader.read_u32()? as usize;
    let mut annotations = Vec::new();
    for _ in 0..count {
        annotations.push(Annotation::decode(reader)?);
    }
    Ok(annotations)
}

/// Field definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Access flags
    pub access: u16,
    /// Field name
    pub name: String,
    /// Field descriptor
    pub descriptor: String,
    /// Field annotations
    pub annotations: Vec<Annotation>,
}

impl FieldDef {
    /// Create a public field
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            access: access::PUBLIC,
            name: name.into(),
            descriptor: descriptor.into(),
            annotations: Vec::new(),
        }
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u16(self.access);
        writer.emit_string(&self.name);
        writer.emit_string(&self.descriptor);
        encode_annotations(&self.annotations, writer);
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            access: reader.read_u16()?,
            name: reader.read_string()?,
            descriptor: reader.read_string()?,
            annotations: decode_annotations(reader)?,
        })
    }
}

/// Type of a local variable slot or stack entry in a frame
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VerificationType {
    /// Unusable slot
    Top,
    /// Integer or boolean
    Int,
    /// Float
    Float,
    /// The null reference
    Null,
    /// Reference to an instance of the named class
    Object(String),
}

impl VerificationType {
    const TAG_TOP: u8 = 0;
    const TAG_INT: u8 = 1;
    const TAG_FLOAT: u8 = 2;
    const TAG_NULL: u8 = 3;
    const TAG_OBJECT: u8 = 4;

    /// Whether values of this type are references
    pub fn is_reference(&self) -> bool {
        matches!(self, VerificationType::Null | VerificationType::Object(_))
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        match self {
            VerificationType::Top => writer.emit_u8(Self::TAG_TOP),
            VerificationType::Int => writer.emit_u8(Self::TAG_INT),
            VerificationType::Float => writer.emit_u8(Self::TAG_FLOAT),
            VerificationType::Null => writer.emit_u8(Self::TAG_NULL),
            VerificationType::Object(name) => {
                writer.emit_u8(Self::TAG_OBJECT);
                writer.emit_string(name);
            }
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        match reader.read_u8()? {
            Self::TAG_TOP => Ok(VerificationType::Top),
            Self::TAG_INT => Ok(VerificationType::Int),
            Self::TAG_FLOAT => Ok(VerificationType::Float),
            Self::TAG_NULL => Ok(VerificationType::Null),
            Self::TAG_OBJECT => Ok(VerificationType::Object(reader.read_string()?)),
            tag => Err(DecodeError::InvalidTag { tag, offset }),
        }
    }
}

/// Stack-map frame: the types of locals and stack at a jump target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Code offset the frame describes
    pub offset: u32,
    /// Local variable types
    pub locals: Vec<VerificationType>,
    /// Operand stack types, bottom first
    pub stack: Vec<VerificationType>,
}

impl Frame {
    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u32(self.offset);
        writer.emit_u16(self.locals.len() as u16);
        for ty in &self.locals {
            ty.encode(writer);
        }
        writer.emit_u16(self.stack.len() as u16);
        for ty in &self.stack {
            ty.encode(writer);
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.read_u32()?;
        let local_count = reader.read_u16()?;
        let mut locals = Vec::new();
        for _ in 0..local_count {
            locals.push(VerificationType::decode(reader)?);
        }
        let stack_count = reader.read_u16()?;
        let mut stack = Vec::new();
        for _ in 0..stack_count {
            stack.push(VerificationType::decode(reader)?);
        }
        Ok(Self {
            offset,
            locals,
            stack,
        })
    }
}

/// Mapping from a code offset to a source line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumber {
    /// First code offset of the line
    pub offset: u32,
    /// Source line
    pub line: u32,
}

/// Method definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    /// Access flags
    pub access: u16,
    /// Method name
    pub name: String,
    /// Method descriptor
    pub descriptor: String,
    /// Maximum operand stack depth
    pub max_stack: u16,
    /// Number of local variable slots (including `this` and parameters)
    pub max_locals: u16,
    /// Bytecode, empty for abstract methods
    pub code: Vec<u8>,
    /// Stack-map frames, sorted by offset
    pub frames: Vec<Frame>,
    /// Line-number table
    pub line_numbers: Vec<LineNumber>,
    /// Method annotations
    pub annotations: Vec<Annotation>,
}

impl MethodDef {
    /// Create a public method with the given code
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>, code: Vec<u8>) -> Self {
        Self {
            access: access::PUBLIC,
            name: name.into(),
            descriptor: descriptor.into(),
            max_stack: 0,
            max_locals: 0,
            code,
            frames: Vec::new(),
            line_numbers: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// Whether the method is static
    pub fn is_static(&self) -> bool {
        self.access & access::STATIC != 0
    }

    /// Whether the method has no body
    pub fn is_abstract(&self) -> bool {
        self.access & access::ABSTRACT != 0
    }

    /// Frame recorded for a code offset
    pub fn frame_at(&self, offset: u32) -> Option<&Frame> {
        self.frames
            .binary_search_by_key(&offset, |f| f.offset)
            .ok()
            .map(|index| &self.frames[index])
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u16(self.access);
        writer.emit_string(&self.name);
        writer.emit_string(&self.descriptor);
        writer.emit_u16(self.max_stack);
        writer.emit_u16(self.max_locals);
        writer.emit_blob(&self.code);

        writer.emit_u32(self.frames.len() as u32);
        for frame in &self.frames {
            frame.encode(writer);
        }

        writer.emit_u32(self.line_numbers.len() as u32);
        for entry in &self.line_numbers {
            writer.emit_u32(entry.offset);
            writer.emit_u32(entry.line);
        }

        encode_annotations(&self.annotations, writer);
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let access = reader.read_u16()?;
        let name = reader.read_string()?;
        let descriptor = reader.read_string()?;
        let max_stack = reader.read_u16()?;
        let max_locals = reader.read_u16()?;
        let code = reader.read_blob()?;

        let frame_count = reader.read_u32()? as usize;
        let mut frames = Vec::new();
        for _ in 0..frame_count {
            frames.push(Frame::decode(reader)?);
        }

        let line_count = reader.read_u32()? as usize;
        let mut line_numbers = Vec::new();
        for _ in 0..line_count {
            let offset = reader.read_u32()?;
            let line = reader.read_u32()?;
            line_numbers.push(LineNumber { offset, line });
        }

        let annotations = decode_annotations(reader)?;

        Ok(Self {
            access,
            name,
            descriptor,
            max_stack,
            max_locals,
            code,
            frames,
            line_numbers,
            annotations,
        })
    }
}

/// Opaque named attribute kept in the debug section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute name
    pub name: String,
    /// Raw attribute payload
    pub data: Vec<u8>,
}

/// Debug section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    /// Source file the class was compiled from
    pub source_file: Option<String>,
    /// Attributes preserved verbatim
    pub attributes: Vec<Attribute>,
}

impl DebugInfo {
    fn encode(&self, writer: &mut BytecodeWriter) {
        emit_optional_string(writer, self.source_file.as_deref());
        writer.emit_u32(self.attributes.len() as u32);
        for attribute in &self.attributes {
            writer.emit_string(&attribute.name);
            writer.emit_blob(&attribute.data);
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let source_file = read_optional_string(reader)?;
        let count = reader.read_u32()? as usize;
        let mut attributes = Vec::new();
        for _ in 0..count {
            let name = reader.read_string()?;
            let data = reader.read_blob()?;
            attributes.push(Attribute { name, data });
        }
        Ok(Self {
            source_file,
            attributes,
        })
    }
}

/// A decoded class file
#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    /// Access, name and supertypes
    pub header: ClassHeader,
    /// Constant pool
    pub constants: ConstantPool,
    /// Class annotations
    pub annotations: Vec<Annotation>,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Method definitions
    pub methods: Vec<MethodDef>,
    /// Debug section
    pub debug: Option<DebugInfo>,
}

impl ClassFile {
    /// Create an empty public class
    pub fn new(name: impl Into<String>, super_name: Option<&str>) -> Self {
        Self {
            header: ClassHeader::new(name, super_name),
            constants: ConstantPool::new(),
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            debug: None,
        }
    }

    /// Dotted class name
    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Find a method by name and descriptor
    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodDef> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    /// Find a field by name
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Flags written to the fixed header
    pub fn flags(&self) -> u32 {
        if self.debug.is_some() {
            flags::HAS_DEBUG_INFO
        } else {
            0
        }
    }

    /// Encode the class to its canonical binary form
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BytecodeWriter::new();

        writer.buffer.extend_from_slice(&MAGIC);
        writer.emit_u32(VERSION);
        writer.emit_u32(self.flags());
        let checksum_offset = writer.offset();
        writer.emit_u32(0); // Placeholder for checksum

        self.header.encode(&mut writer);
        self.constants.encode(&mut writer);
        encode_annotations(&self.annotations, &mut writer);

        writer.emit_u32(self.fields.len() as u32);
        for field in &self.fields {
            field.encode(&mut writer);
        }

        writer.emit_u32(self.methods.len() as u32);
        for method in &self.methods {
            method.encode(&mut writer);
        }

        if let Some(debug) = &self.debug {
            debug.encode(&mut writer);
        }

        let checksum = crc32fast::hash(&writer.buffer[HEADER_SIZE..]);
        writer.patch_u32(checksum_offset, checksum);

        writer.into_bytes()
    }

    /// Decode a class file
    pub fn decode(data: &[u8]) -> Result<Self, ClassFileError> {
        Self::decode_with(data, &mut [])
    }

    /// Decode a class file, streaming every element through `visitors` in
    /// order
    ///
    /// A visitor returning `None` drops the element; later visitors never see
    /// it.
    pub fn decode_with(
        data: &[u8],
        visitors: &mut [&mut dyn ClassVisitor],
    ) -> Result<Self, ClassFileError> {
        let (mut reader, class_flags, header) = open(data, visitors)?;
        let constants = ConstantPool::decode(&mut reader)?;
        let mut class = ClassFile {
            header,
            constants,
            annotations: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            debug: None,
        };
        read_body(&mut reader, class_flags, visitors, |element| match element {
            Element::Annotation(a) => class.annotations.push(a),
            Element::Field(f) => class.fields.push(f),
            Element::Method(m) => class.methods.push(m),
            Element::Debug(d) => class.debug = Some(d),
        })?;
        Ok(class)
    }

    /// Visit an encoded class without materializing a tree
    pub fn scan(data: &[u8], visitor: &mut dyn ClassVisitor) -> Result<(), ClassFileError> {
        let visitors: &mut [&mut dyn ClassVisitor] = &mut [visitor];
        let (mut reader, class_flags, _) = open(data, visitors)?;
        ConstantPool::decode(&mut reader)?;
        read_body(&mut reader, class_flags, visitors, |_| {})
    }

    /// Run an already decoded class through `visitors`, as
    /// [`ClassFile::decode_with`] does while decoding
    pub fn accept(self, visitors: &mut [&mut dyn ClassVisitor]) -> ClassFile {
        let ClassFile {
            mut header,
            constants,
            annotations,
            fields,
            methods,
            debug,
        } = self;

        for visitor in visitors.iter_mut() {
            visitor.visit_header(&mut header);
        }
        let annotations = annotations
            .into_iter()
            .filter_map(|a| chain(visitors, a, |v, a| v.visit_annotation(a)))
            .collect();
        let fields = fields
            .into_iter()
            .filter_map(|f| chain(visitors, f, |v, f| v.visit_field(f)))
            .collect();
        let methods = methods
            .into_iter()
            .filter_map(|m| chain(visitors, m, |v, m| v.visit_method(m)))
            .collect();
        for visitor in visitors.iter_mut() {
            visitor.visit_end();
        }

        ClassFile {
            header,
            constants,
            annotations,
            fields,
            methods,
            debug,
        }
    }
}

enum Element {
    Annotation(Annotation),
    Field(FieldDef),
    Method(MethodDef),
    Debug(DebugInfo),
}

fn chain<T>(
    visitors: &mut [&mut dyn ClassVisitor],
    item: T,
    mut step: impl FnMut(&mut dyn ClassVisitor, T) -> Option<T>,
) -> Option<T> {
    let mut item = Some(item);
    for visitor in visitors.iter_mut() {
        item = step(&mut **visitor, item?);
    }
    item
}

fn read_fixed_header(reader: &mut BytecodeReader<'_>) -> Result<(u32, u32), ClassFileError> {
    let magic = reader.read_bytes(4)?;
    let magic = [magic[0], magic[1], magic[2], magic[3]];
    if magic != MAGIC {
        return Err(ClassFileError::InvalidMagic(magic));
    }

    let version = reader.read_u32()?;
    if version != VERSION {
        return Err(ClassFileError::UnsupportedVersion(version));
    }

    let flags = reader.read_u32()?;
    if flags & !flags::KNOWN != 0 {
        return Err(ClassFileError::UnsupportedFlags(flags));
    }
    let checksum = reader.read_u32()?;
    Ok((flags, checksum))
}

/// Validate the fixed header and checksum, then read the class header
/// through the visitors
fn open<'a>(
    data: &'a [u8],
    visitors: &mut [&mut dyn ClassVisitor],
) -> Result<(BytecodeReader<'a>, u32, ClassHeader), ClassFileError> {
    let mut reader = BytecodeReader::new(data);
    let (class_flags, stored_checksum) = read_fixed_header(&mut reader)?;

    let calculated = crc32fast::hash(&data[HEADER_SIZE..]);
    if stored_checksum != calculated {
        return Err(ClassFileError::ChecksumMismatch {
            expected: stored_checksum,
            actual: calculated,
        });
    }

    let mut header = ClassHeader::decode(&mut reader)?;
    for visitor in visitors.iter_mut() {
        visitor.visit_header(&mut header);
    }
    Ok((reader, class_flags, header))
}

/// Read everything after the constant pool, handing surviving elements to
/// `sink`
fn read_body(
    reader: &mut BytecodeReader<'_>,
    class_flags: u32,
    visitors: &mut [&mut dyn ClassVisitor],
    mut sink: impl FnMut(Element),
) -> Result<(), ClassFileError> {
    let count = reader.read_u32()? as usize;
    for _ in 0..count {
        let annotation = Annotation::decode(reader)?;
        if let Some(a) = chain(visitors, annotation, |v, a| v.visit_annotation(a)) {
            sink(Element::Annotation(a));
        }
    }

    let count = reader.read_u32()? as usize;
    for _ in 0..count {
        let field = FieldDef::decode(reader)?;
        if let Some(f) = chain(visitors, field, |v, f| v.visit_field(f)) {
            sink(Element::Field(f));
        }
    }

    let count = reader.read_u32()? as usize;
    for _ in 0..count {
        let method = MethodDef::decode(reader)?;
        if let Some(m) = chain(visitors, method, |v, m| v.visit_method(m)) {
            sink(Element::Method(m));
        }
    }

    if class_flags & flags::HAS_DEBUG_INFO != 0 {
        sink(Element::Debug(DebugInfo::decode(reader)?));
    }

    if reader.has_more() {
        return Err(ClassFileError::TrailingData(reader.position()));
    }

    for visitor in visitors.iter_mut() {
        visitor.visit_end();
    }
    Ok(())
}

fn emit_optional_string(writer: &mut BytecodeWriter, value: Option<&str>) {
    match value {
        Some(value) => {
            writer.emit_u8(1);
            writer.emit_string(value);
        }
        None => writer.emit_u8(0),
    }
}

fn read_optional_string(reader: &mut BytecodeReader<'_>) -> Result<Option<String>, DecodeError> {
    let offset = reader.position();
    match reader.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(reader.read_string()?)),
        tag => Err(DecodeError::InvalidTag { tag, offset }),
    }
}
