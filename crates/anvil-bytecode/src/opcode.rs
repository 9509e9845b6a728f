//! Instruction set of method bodies
//!
//! Every instruction is a single opcode byte followed by a fixed-size operand.

/// Bytecode opcode enumeration
///
/// Opcodes are organized into categories:
/// - 0x00-0x0F: Stack manipulation & constants
/// - 0x10-0x1F: Local variables
/// - 0x20-0x2F: Integer arithmetic
/// - 0x30-0x3F: Float arithmetic
/// - 0x50-0x5F: Comparison & logical
/// - 0x90-0x9F: Control flow
/// - 0xA0-0xAF: Method invocation & return
/// - 0xB0-0xBF: Object operations
/// - 0xE0-0xEF: Error handling
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Stack Manipulation & Constants (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Pop top value from stack
    Pop = 0x01,
    /// Duplicate top stack value
    Dup = 0x02,
    /// Swap top two stack values
    Swap = 0x03,
    /// Push null constant
    ConstNull = 0x04,
    /// Push true constant
    ConstTrue = 0x05,
    /// Push false constant
    ConstFalse = 0x06,
    /// Push 32-bit integer constant (operand: i32)
    ConstI32 = 0x07,
    /// Push 64-bit float constant (operand: f64)
    ConstF64 = 0x08,
    /// Push string constant from pool (operand: u32 index)
    ConstStr = 0x09,

    // ===== Local Variables (0x10-0x1F) =====
    /// Load local variable onto stack (operand: u16 index)
    LoadLocal = 0x10,
    /// Store top of stack to local variable (operand: u16 index)
    StoreLocal = 0x11,

    // ===== Integer Arithmetic (0x20-0x2F) =====
    /// Integer addition: pop b, pop a, push a + b
    Iadd = 0x20,
    /// Integer subtraction: pop b, pop a, push a - b
    Isub = 0x21,
    /// Integer multiplication: pop b, pop a, push a * b
    Imul = 0x22,
    /// Integer division: pop b, pop a, push a / b
    Idiv = 0x23,
    /// Integer negation: pop a, push -a
    Ineg = 0x24,

    // ===== Float Arithmetic (0x30-0x3F) =====
    /// Float addition
    Fadd = 0x30,
    /// Float subtraction
    Fsub = 0x31,
    /// Float multiplication
    Fmul = 0x32,
    /// Float division
    Fdiv = 0x33,
    /// Float negation
    Fneg = 0x34,

    // ===== Comparison & Logical (0x50-0x5F) =====
    /// Integer equal: pop b, pop a, push a == b
    Ieq = 0x50,
    /// Integer not equal
    Ine = 0x51,
    /// Integer less than
    Ilt = 0x52,
    /// Integer less or equal
    Ile = 0x53,
    /// Integer greater than
    Igt = 0x54,
    /// Integer greater or equal
    Ige = 0x55,
    /// Float less than
    Flt = 0x56,
    /// Float greater than
    Fgt = 0x57,
    /// Logical not
    Not = 0x58,

    // ===== Control Flow (0x90-0x9F) =====
    /// Unconditional jump (operand: i32 offset from the end of the instruction)
    Jmp = 0x90,
    /// Jump if the popped bool is false
    JmpIfFalse = 0x91,
    /// Jump if the popped bool is true
    JmpIfTrue = 0x92,
    /// Jump if the popped reference is null
    JmpIfNull = 0x93,
    /// Jump if the popped reference is not null
    JmpIfNotNull = 0x94,

    // ===== Invocation (0xA0-0xAF) =====
    /// Invoke an instance method (operand: u32 member ref)
    InvokeVirtual = 0xA0,
    /// Invoke a static method (operand: u32 member ref)
    InvokeStatic = 0xA1,
    /// Invoke a constructor or super method (operand: u32 member ref)
    InvokeSpecial = 0xA2,
    /// Return the top of stack
    Return = 0xA3,
    /// Return without a value
    ReturnVoid = 0xA4,

    // ===== Object Operations (0xB0-0xBF) =====
    /// Allocate an instance (operand: u32 class ref)
    New = 0xB0,
    /// Read an instance field (operand: u32 member ref)
    GetField = 0xB1,
    /// Write an instance field (operand: u32 member ref)
    PutField = 0xB2,
    /// Read a static field (operand: u32 member ref)
    GetStatic = 0xB3,
    /// Write a static field (operand: u32 member ref)
    PutStatic = 0xB4,
    /// Checked cast of the top reference (operand: u32 class ref)
    CheckCast = 0xB5,
    /// Instance test of the top reference (operand: u32 class ref)
    InstanceOf = 0xB6,

    // ===== Error Handling (0xE0-0xEF) =====
    /// Throw the top reference
    Throw = 0xE0,
}

impl Opcode {
    /// Convert byte to opcode
    ///
    /// Returns None if the byte does not correspond to a valid opcode.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Nop),
            0x01 => Some(Self::Pop),
            0x02 => Some(Self::Dup),
            0x03 => Some(Self::Swap),
            0x04 => Some(Self::ConstNull),
            0x05 => Some(Self::ConstTrue),
            0x06 => Some(Self::ConstFalse),
            0x07 => Some(Self::ConstI32),
            0x08 => Some(Self::ConstF64),
            0x09 => Some(Self::ConstStr),

            0x10 => Some(Self::LoadLocal),
            0x11 => Some(Self::StoreLocal),

            0x20 => Some(Self::Iadd),
            0x21 => Some(Self::Isub),
            0x22 => Some(Self::Imul),
            0x23 => Some(Self::Idiv),
            0x24 => Some(Self::Ineg),

            0x30 => Some(Self::Fadd),
            0x31 => Some(Self::Fsub),
            0x32 => Some(Self::Fmul),
            0x33 => Some(Self::Fdiv),
            0x34 => Some(Self::Fneg),

            0x50 => Some(Self::Ieq),
            0x51 => Some(Self::Ine),
            0x52 => Some(Self::Ilt),
            0x53 => Some(Self::Ile),
            0x54 => Some(Self::Igt),
            0x55 => Some(Self::Ige),
            0x56 => Some(Self::Flt),
            0x57 => Some(Self::Fgt),
            0x58 => Some(Self::Not),

            0x90 => Some(Self::Jmp),
            0x91 => Some(Self::JmpIfFalse),
            0x92 => Some(Self::JmpIfTrue),
            0x93 => Some(Self::JmpIfNull),
            0x94 => Some(Self::JmpIfNotNull),

            0xA0 => Some(Self::InvokeVirtual),
            0xA1 => Some(Self::InvokeStatic),
            0xA2 => Some(Self::InvokeSpecial),
            0xA3 => Some(Self::Return),
            0xA4 => Some(Self::ReturnVoid),

            0xB0 => Some(Self::New),
            0xB1 => Some(Self::GetField),
            0xB2 => Some(Self::PutField),
            0xB3 => Some(Self::GetStatic),
            0xB4 => Some(Self::PutStatic),
            0xB5 => Some(Self::CheckCast),
            0xB6 => Some(Self::InstanceOf),

            0xE0 => Some(Self::Throw),

            _ => None,
        }
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get the human-readable name of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Pop => "POP",
            Self::Dup => "DUP",
            Self::Swap => "SWAP",
            Self::ConstNull => "CONST_NULL",
            Self::ConstTrue => "CONST_TRUE",
            Self::ConstFalse => "CONST_FALSE",
            Self::ConstI32 => "CONST_I32",
            Self::ConstF64 => "CONST_F64",
            Self::ConstStr => "CONST_STR",
            Self::LoadLocal => "LOAD_LOCAL",
            Self::StoreLocal => "STORE_LOCAL",
            Self::Iadd => "IADD",
            Self::Isub => "ISUB",
            Self::Imul => "IMUL",
            Self::Idiv => "IDIV",
            Self::Ineg => "INEG",
            Self::Fadd => "FADD",
            Self::Fsub => "FSUB",
            Self::Fmul => "FMUL",
            Self::Fdiv => "FDIV",
            Self::Fneg => "FNEG",
            Self::Ieq => "IEQ",
            Self::Ine => "INE",
            Self::Ilt => "ILT",
            Self::Ile => "ILE",
            Self::Igt => "IGT",
            Self::Ige => "IGE",
            Self::Flt => "FLT",
            Self::Fgt => "FGT",
            Self::Not => "NOT",
            Self::Jmp => "JMP",
            Self::JmpIfFalse => "JMP_IF_FALSE",
            Self::JmpIfTrue => "JMP_IF_TRUE",
            Self::JmpIfNull => "JMP_IF_NULL",
            Self::JmpIfNotNull => "JMP_IF_NOT_NULL",
            Self::InvokeVirtual => "INVOKE_VIRTUAL",
            Self::InvokeStatic => "INVOKE_STATIC",
            Self::InvokeSpecial => "INVOKE_SPECIAL",
            Self::Return => "RETURN",
            Self::ReturnVoid => "RETURN_VOID",
            Self::New => "NEW",
            Self::GetField => "GET_FIELD",
            Self::PutField => "PUT_FIELD",
            Self::GetStatic => "GET_STATIC",
            Self::PutStatic => "PUT_STATIC",
            Self::CheckCast => "CHECK_CAST",
            Self::InstanceOf => "INSTANCE_OF",
            Self::Throw => "THROW",
        }
    }

    /// Size in bytes of the operand following the opcode byte
    pub fn operand_size(self) -> usize {
        match self {
            Self::LoadLocal | Self::StoreLocal => 2,
            Self::ConstI32 | Self::ConstStr => 4,
            Self::ConstF64 => 8,
            op if op.is_jump() => 4,
            Self::InvokeVirtual
            | Self::InvokeStatic
            | Self::InvokeSpecial
            | Self::New
            | Self::GetField
            | Self::PutField
            | Self::GetStatic
            | Self::PutStatic
            | Self::CheckCast
            | Self::InstanceOf => 4,
            _ => 0,
        }
    }

    /// Check if this opcode is a jump instruction
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Self::Jmp
                | Self::JmpIfFalse
                | Self::JmpIfTrue
                | Self::JmpIfNull
                | Self::JmpIfNotNull
        )
    }

    /// Check if this opcode is an invocation
    pub fn is_invoke(self) -> bool {
        matches!(
            self,
            Self::InvokeVirtual | Self::InvokeStatic | Self::InvokeSpecial
        )
    }

    /// Check if this opcode is a return instruction
    pub fn is_return(self) -> bool {
        matches!(self, Self::Return | Self::ReturnVoid)
    }

    /// Check if control never falls through to the next instruction
    pub fn ends_flow(self) -> bool {
        self.is_return() || matches!(self, Self::Jmp | Self::Throw)
    }

    /// Check if this opcode terminates a basic block
    pub fn is_terminator(self) -> bool {
        self.is_jump() || self.is_return() || self == Self::Throw
    }
}
