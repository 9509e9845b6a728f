//! Constant pool for class files

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};

/// Symbolic reference to a field or method of some class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    /// Dotted name of the declaring class
    pub owner: String,
    /// Member name
    pub name: String,
    /// Field or method descriptor
    pub descriptor: String,
}

impl MemberRef {
    /// Create a member reference
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }

    /// Whether this reference names a method (descriptor starts with `(`)
    pub fn is_method(&self) -> bool {
        self.descriptor.starts_with('(')
    }
}

/// Constant pool containing literal values and symbolic references
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantPool {
    /// String constants
    pub strings: Vec<String>,
    /// Integer constants
    pub integers: Vec<i32>,
    /// Float constants
    pub floats: Vec<f64>,
    /// Class references (dotted names)
    pub classes: Vec<String>,
    /// Field and method references
    pub members: Vec<MemberRef>,
}

impl ConstantPool {
    /// Create a new empty constant pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string constant and return its index
    pub fn add_string(&mut self, s: String) -> u32 {
        let index = self.strings.len();
        self.strings.push(s);
        index as u32
    }

    /// Add an integer constant and return its index
    pub fn add_integer(&mut self, i: i32) -> u32 {
        let index = self.integers.len();
        self.integers.push(i);
        index as u32
    }

    /// Add a float constant and return its index
    pub fn add_float(&mut self, f: f64) -> u32 {
        let index = self.floats.len();
        self.floats.push(f);
        index as u32
    }

    /// Return the index of a class reference, adding it if absent
    pub fn intern_class(&mut self, name: &str) -> u32 {
        if let Some(index) = self.classes.iter().position(|c| c == name) {
            return index as u32;
        }
        self.classes.push(name.to_string());
        (self.classes.len() - 1) as u32
    }

    /// Return the index of a member reference, adding it if absent
    pub fn intern_member(&mut self, member: MemberRef) -> u32 {
        if let Some(index) = self.members.iter().position(|m| *m == member) {
            return index as u32;
        }
        self.members.push(member);
        (self.members.len() - 1) as u32
    }

    /// Get a string constant by index
    pub fn get_string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(|s| s.as_str())
    }

    /// Get an integer constant by index
    pub fn get_integer(&self, index: u32) -> Option<i32> {
        self.integers.get(index as usize).copied()
    }

    /// Get a float constant by index
    pub fn get_float(&self, index: u32) -> Option<f64> {
        self.floats.get(index as usize).copied()
    }

    /// Get a class reference by index
    pub fn get_class(&self, index: u32) -> Option<&str> {
        self.classes.get(index as usize).map(|s| s.as_str())
    }

    /// Get a member reference by index
    pub fn get_member(&self, index: u32) -> Option<&MemberRef> {
        self.members.get(index as usize)
    }

    /// Encode the constant pool to binary format
    ///
    /// Format:
    /// - String count (u32), then each string (u32 length + UTF-8 bytes)
    /// - Integer count (u32), then each i32
    /// - Float count (u32), then each f64
    /// - Class count (u32), then each class name
    /// - Member count (u32), then owner, name and descriptor strings
    pub fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u32(self.strings.len() as u32);
        for s in &self.strings {
            writer.emit_string(s);
        }

        writer.emit_u32(self.integers.len() as u32);
        for &i in &self.integers {
            writer.emit_i32(i);
        }

        writer.emit_u32(self.floats.len() as u32);
        for &f in &self.floats {
            writer.emit_f64(f);
        }

        writer.emit_u32(self.classes.len() as u32);
        for class in &self.classes {
            writer.emit_string(class);
        }

        writer.emit_u32(self.members.len() as u32);
        for member in &self.members {
            writer.emit_string(&member.owner);
            writer.emit_string(&member.name);
            writer.emit_string(&member.descriptor);
        }
    }

    /// Decode the constant pool from binary format
    pub fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let mut pool = ConstantPool::new();

        let string_count = reader.read_u32()? as usize;
        for _ in 0..string_count {
            pool.strings.push(reader.read_string()?);
        }

        let int_count = reader.read_u32()? as usize;
        for _ in 0..int_count {
            pool.integers.push(reader.read_i32()?);
        }

        let float_count = reader.read_u32()? as usize;
        for _ in 0..float_count {
            pool.floats.push(reader.read_f64()?);
        }

        let class_count = reader.read_u32()? as usize;
        for _ in 0..class_count {
            pool.classes.push(reader.read_string()?);
        }

        let member_count = reader.read_u32()? as usize;
        for _ in 0..member_count {
            let owner = reader.read_string()?;
            let name = reader.read_string()?;
            let descriptor = reader.read_string()?;
            pool.members.push(MemberRef {
                owner,
                name,
                descriptor,
            });
        }

        Ok(pool)
    }
}
