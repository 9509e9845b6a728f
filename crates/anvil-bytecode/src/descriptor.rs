//! Field and method descriptors
//!
//! A field descriptor is a single value type: `I` int, `F` float, `Z` bool or
//! `L<dotted.Name>;` reference. Method descriptors add `V` for a void return
//! and wrap the parameters in parentheses: `(ILgame.Player;)Z`.

use std::fmt;
use thiserror::Error;

/// Errors raised while parsing a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    /// Unknown type character
    #[error("Invalid descriptor {descriptor:?}: unexpected {found:?} at {offset}")]
    Unexpected {
        /// The descriptor being parsed
        descriptor: String,
        /// The offending character
        found: char,
        /// Byte offset of the offending character
        offset: usize,
    },

    /// Descriptor ended too early
    #[error("Invalid descriptor {0:?}: truncated")]
    Truncated(String),

    /// `V` used where a value type is required
    #[error("Invalid descriptor {0:?}: void is only allowed as a return type")]
    VoidValue(String),
}

/// A value type as it appears in descriptors
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// 32-bit integer
    Int,
    /// 64-bit float
    Float,
    /// Boolean
    Bool,
    /// Reference to an instance of the named class
    Ref(String),
    /// No value (method returns only)
    Void,
}

impl ValueType {
    /// Parse a single field descriptor
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut cursor = Cursor::new(descriptor);
        let ty = cursor.next_type()?;
        if ty == ValueType::Void {
            return Err(DescriptorError::VoidValue(descriptor.to_string()));
        }
        cursor.finish()?;
        Ok(ty)
    }

    /// Whether this is a reference type
    pub fn is_reference(&self) -> bool {
        matches!(self, ValueType::Ref(_))
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Int => f.write_str("I"),
            ValueType::Float => f.write_str("F"),
            ValueType::Bool => f.write_str("Z"),
            ValueType::Void => f.write_str("V"),
            ValueType::Ref(name) => write!(f, "L{};", name),
        }
    }
}

/// Parameter and return types of a method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Parameter types in declaration order
    pub params: Vec<ValueType>,
    /// Return type, `Void` for none
    pub ret: ValueType,
}

impl MethodDescriptor {
    /// Parse a method descriptor such as `(IZ)Lgame.Player;`
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut cursor = Cursor::new(descriptor);
        cursor.expect('(')?;
        let mut params = Vec::new();
        while cursor.peek() != Some(')') {
            let ty = cursor.next_type()?;
            if ty == ValueType::Void {
                return Err(DescriptorError::VoidValue(descriptor.to_string()));
            }
            params.push(ty);
        }
        cursor.expect(')')?;
        let ret = cursor.next_type()?;
        cursor.finish()?;
        Ok(Self { params, ret })
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for param in &self.params {
            write!(f, "{}", param)?;
        }
        write!(f, "){}", self.ret)
    }
}

struct Cursor<'a> {
    source: &'a str,
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            position: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.position..].chars().next()
    }

    fn bump(&mut self) -> Result<char, DescriptorError> {
        let c = self
            .peek()
            .ok_or_else(|| DescriptorError::Truncated(self.source.to_string()))?;
        self.position += c.len_utf8();
        Ok(c)
    }

    fn unexpected(&self, found: char, offset: usize) -> DescriptorError {
        DescriptorError::Unexpected {
            descriptor: self.source.to_string(),
            found,
            offset,
        }
    }

    fn expect(&mut self, wanted: char) -> Result<(), DescriptorError> {
        let offset = self.position;
        match self.bump()? {
            c if c == wanted => Ok(()),
            c => Err(self.unexpected(c, offset)),
        }
    }

    fn next_type(&mut self) -> Result<ValueType, DescriptorError> {
        let offset = self.position;
        match self.bump()? {
            'I' => Ok(ValueType::Int),
            'F' => Ok(ValueType::Float),
            'Z' => Ok(ValueType::Bool),
            'V' => Ok(ValueType::Void),
            'L' => {
                let rest = &self.source[self.position..];
                let end = rest
                    .find(';')
                    .ok_or_else(|| DescriptorError::Truncated(self.source.to_string()))?;
                if end == 0 {
                    return Err(self.unexpected(';', self.position));
                }
                let name = rest[..end].to_string();
                self.position += end + 1;
                Ok(ValueType::Ref(name))
            }
            c => Err(self.unexpected(c, offset)),
        }
    }

    fn finish(&self) -> Result<(), DescriptorError> {
        match self.peek() {
            None => Ok(()),
            Some(c) => Err(self.unexpected(c, self.position)),
        }
    }
}
