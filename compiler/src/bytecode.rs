//! Bytecode instruction definitions and serialization.
//!
//! The instruction set is the one the register machine executes (see
//! [`crate::machine`]). Every instruction is one 32-bit word:
//!
//! ```text
//!  31             16 15        8 7         0
//! ┌─────────────────┬───────────┬───────────┐
//! │    yz  (z:y)    │     x     │    op     │
//! └─────────────────┴───────────┴───────────┘
//! ```
//!
//! `yz` is either a 16-bit immediate or two register bytes, `y` in the
//! low byte and `z` in the high byte, depending on the opcode. A register
//! byte is `bank << 6 | offset`.
//!
//! Binary format (.rgb):
//!   - 4 bytes: magic "RGVM"
//!   - 1 byte: version (currently 1)
//!   - 4 bytes: instruction count, little-endian
//!   - one little-endian word per instruction

use crate::errors::CompileError;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

const MAGIC: &[u8; 4] = b"RGVM";
const VERSION: u8 = 1;

/// Opcodes in machine order. The discriminant values MUST match the
/// machine's decoding table exactly.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `RXI x yz`: x = yz, zero-extended
    LoadLow = 0,
    /// `RXU x yz`: x |= yz << 16
    LoadHigh,
    /// `RXRX x y`: x = y
    Move,
    /// `RXST x y z`: x = stack[y + z]
    LoadStack,
    /// `STRX x y z`: stack[x + y] = z
    StoreStack,
    Add,
    Sub,
    /// `INC x yz`: x += yz
    Inc,
    Mul,
    Div,
    Mod,
    Nand,
    Shl,
    /// Arithmetic shift right.
    Shr,
    /// `PRNT x`: print the NUL-terminated bytes starting at register x
    Print,
    /// `FRME yz`: shift the window by a signed amount
    Frame,
    /// `CLMK x yz`: allocate a closure, select it as aux, x = closure << 24 | yz
    ClosureMake,
    Retain,
    Release,
    /// `AUX x`: select closure x as the aux bank
    Aux,
    /// `FN x yz`: call address yz with the window shifted by x
    Call,
    /// `FNRX x y`: call the function value in y with the window shifted by x
    CallRx,
    Ret,
    Break,
}

impl Op {
    pub const ALL: [Op; 24] = [
        Op::LoadLow,
        Op::LoadHigh,
        Op::Move,
        Op::LoadStack,
        Op::StoreStack,
        Op::Add,
        Op::Sub,
        Op::Inc,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::Nand,
        Op::Shl,
        Op::Shr,
        Op::Print,
        Op::Frame,
        Op::ClosureMake,
        Op::Retain,
        Op::Release,
        Op::Aux,
        Op::Call,
        Op::CallRx,
        Op::Ret,
        Op::Break,
    ];

    pub fn from_u8(byte: u8) -> Option<Op> {
        Op::ALL.get(byte as usize).copied()
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::LoadLow => "RXI",
            Op::LoadHigh => "RXU",
            Op::Move => "RXRX",
            Op::LoadStack => "RXST",
            Op::StoreStack => "STRX",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Inc => "INC",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Mod => "MOD",
            Op::Nand => "NAND",
            Op::Shl => "SHL",
            Op::Shr => "SHR",
            Op::Print => "PRNT",
            Op::Frame => "FRME",
            Op::ClosureMake => "CLMK",
            Op::Retain => "CLRT",
            Op::Release => "CLRL",
            Op::Aux => "AUX",
            Op::Call => "FN",
            Op::CallRx => "FNRX",
            Op::Ret => "RET",
            Op::Break => "BREK",
        }
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Op::Add | Op::Sub | Op::Inc | Op::Mul | Op::Div | Op::Mod | Op::Nand | Op::Shl | Op::Shr
        )
    }
}

// ── Registers ───────────────────────────────────────────────────────

/// Register bank selector, the top two bits of a register byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bank {
    /// The current function's window.
    Local = 0,
    /// The running closure's captured values.
    Closure = 1,
    /// The closure selected by the last `CLMK` or `AUX`.
    Aux = 2,
    /// The program's base window. Reserved.
    Base = 3,
}

impl Bank {
    fn from_bits(bits: u8) -> Bank {
        match bits & 0b11 {
            0 => Bank::Local,
            1 => Bank::Closure,
            2 => Bank::Aux,
            _ => Bank::Base,
        }
    }

    fn prefix(self) -> char {
        match self {
            Bank::Local => 'r',
            Bank::Closure => 'c',
            Bank::Aux => 'a',
            Bank::Base => 'b',
        }
    }
}

/// An encoded register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(u8);

impl Reg {
    pub const WINDOW: usize = 64;

    pub fn new(bank: Bank, offset: usize) -> Result<Reg, CompileError> {
        if offset >= Reg::WINDOW {
            return Err(CompileError::RegisterOverflow { offset });
        }
        Ok(Reg((bank as u8) << 6 | offset as u8))
    }

    pub fn local(offset: usize) -> Result<Reg, CompileError> {
        Reg::new(Bank::Local, offset)
    }

    pub fn from_raw(raw: u8) -> Reg {
        Reg(raw)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn bank(self) -> Bank {
        Bank::from_bits(self.0 >> 6)
    }

    pub fn offset(self) -> usize {
        (self.0 & 0x3f) as usize
    }

    /// The register `delta` slots further in the same bank.
    pub fn at(self, delta: usize) -> Result<Reg, CompileError> {
        Reg::new(self.bank(), self.offset() + delta)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.bank().prefix(), self.offset())
    }
}

// ── Instructions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub op: Op,
    pub x: u8,
    pub yz: u16,
}

impl Instruction {
    /// Register plus 16-bit immediate.
    pub fn wide(op: Op, x: u8, yz: u16) -> Self {
        Self { op, x, yz }
    }

    /// Three register operands.
    pub fn triple(op: Op, x: Reg, y: Reg, z: Reg) -> Self {
        Self {
            op,
            x: x.raw(),
            yz: u16::from(y.raw()) | u16::from(z.raw()) << 8,
        }
    }

    pub fn y(&self) -> u8 {
        (self.yz & 0xff) as u8
    }

    pub fn z(&self) -> u8 {
        (self.yz >> 8) as u8
    }

    pub fn encode(self) -> u32 {
        u32::from(self.op as u8) | u32::from(self.x) << 8 | u32::from(self.yz) << 16
    }

    /// `None` when the opcode byte is outside the instruction set.
    pub fn decode(word: u32) -> Option<Instruction> {
        let op = Op::from_u8((word & 0xff) as u8)?;
        Some(Instruction {
            op,
            x: (word >> 8) as u8,
            yz: (word >> 16) as u16,
        })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let x = Reg::from_raw(self.x);
        let y = Reg::from_raw(self.y());
        let z = Reg::from_raw(self.z());
        if matches!(self.op, Op::Ret | Op::Break) {
            return write!(f, "{}", self.op.mnemonic());
        }
        write!(f, "{:<5}", self.op.mnemonic())?;
        match self.op {
            Op::LoadLow | Op::LoadHigh | Op::Inc => write!(f, "{} {}", x, self.yz),
            Op::ClosureMake => write!(f, "{} @{}", x, self.yz),
            Op::Move => write!(f, "{} {}", x, y),
            Op::LoadStack => write!(f, "{} {} +{}", x, y, self.z()),
            Op::StoreStack => write!(f, "{} +{} {}", x, self.y(), z),
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Nand
            | Op::Shl
            | Op::Shr => write!(f, "{} {} {}", x, y, z),
            Op::Print | Op::Retain | Op::Release => write!(f, "{}", x),
            Op::Frame => write!(f, "{}", self.yz as i16),
            Op::Aux => write!(f, "{}", self.x),
            Op::Call => write!(f, "+{} @{}", self.x, self.yz),
            Op::CallRx => write!(f, "+{} {}", self.x, y),
            Op::Ret | Op::Break => Ok(()),
        }
    }
}

// ── Programs ────────────────────────────────────────────────────────

/// A function's resolved code address, kept for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub id: usize,
    pub name: String,
    pub address: u16,
}

/// A compiled program. The last instruction is the function-table marker
/// whose `yz` is the length of the function region, where the entry
/// scope's code starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub symbols: Vec<Symbol>,
}

impl Program {
    pub fn entry(&self) -> Option<u16> {
        self.instructions.last().map(|marker| marker.yz)
    }

    /// Human-readable listing with function labels.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        let entry = self.entry().map(usize::from);
        let last = self.instructions.len().saturating_sub(1);
        for (i, inst) in self.instructions.iter().enumerate() {
            for symbol in self.symbols.iter().filter(|s| usize::from(s.address) == i) {
                if symbol.name.is_empty() {
                    out.push_str(&format!("fn #{}:\n", symbol.id));
                } else {
                    out.push_str(&format!("{}:\n", symbol.name));
                }
            }
            if i == last {
                out.push_str("marker:\n");
            } else if Some(i) == entry {
                out.push_str("main:\n");
            }
            out.push_str(&format!("{:>5}  {}\n", i, inst));
        }
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(9 + self.instructions.len() * 4);
        // Magic number
        bytes.extend_from_slice(MAGIC);
        // Version
        bytes.push(VERSION);
        let count = self.instructions.len() as u32;
        bytes.extend_from_slice(&count.to_le_bytes());
        for inst in &self.instructions {
            bytes.extend_from_slice(&inst.encode().to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Program> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());

        if bytes.len() < 9 || &bytes[..4] != MAGIC {
            return Err(invalid("not a regal bytecode file"));
        }
        if bytes[4] != VERSION {
            return Err(invalid("unsupported bytecode version"));
        }
        let count = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let body = &bytes[9..];
        if body.len() != count * 4 {
            return Err(invalid("truncated instruction section"));
        }
        let instructions = body
            .chunks_exact(4)
            .map(|w| {
                Instruction::decode(u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                    .ok_or_else(|| invalid("unknown opcode"))
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Program {
            instructions,
            symbols: Vec::new(),
        })
    }
}

/// Write compiled bytecode to a .rgb file.
pub fn write_bytecode(path: impl AsRef<Path>, program: &Program) -> io::Result<()> {
    fs::write(path, program.to_bytes())
}

/// Read a .rgb file written by [`write_bytecode`].
pub fn read_bytecode(path: impl AsRef<Path>) -> io::Result<Program> {
    Program::from_bytes(&fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_order() {
        assert_eq!(Op::LoadLow as u8, 0);
        assert_eq!(Op::Add as u8, 5);
        assert_eq!(Op::Print as u8, 14);
        assert_eq!(Op::CallRx as u8, 21);
        assert_eq!(Op::Break as u8, 23);
        for (i, op) in Op::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i);
        }
        assert_eq!(Op::from_u8(24), None);
    }

    #[test]
    fn test_register_encoding() {
        let reg = Reg::new(Bank::Aux, 5).unwrap();
        assert_eq!(reg.raw(), 0b1000_0101);
        assert_eq!(reg.bank(), Bank::Aux);
        assert_eq!(reg.offset(), 5);
        assert_eq!(reg.to_string(), "a5");
        assert_eq!(reg.at(2).unwrap().to_string(), "a7");
    }

    #[test]
    fn test_register_overflow() {
        assert!(Reg::local(63).is_ok());
        assert_eq!(
            Reg::local(64),
            Err(CompileError::RegisterOverflow { offset: 64 })
        );
        assert!(Reg::local(60).unwrap().at(4).is_err());
    }

    #[test]
    fn test_word_layout() {
        let add = Instruction::triple(
            Op::Add,
            Reg::local(2).unwrap(),
            Reg::local(0).unwrap(),
            Reg::new(Bank::Closure, 1).unwrap(),
        );
        assert_eq!(add.y(), 0);
        assert_eq!(add.z(), 0x41);
        assert_eq!(add.encode(), 0x4100_0205);
        assert_eq!(Instruction::decode(add.encode()), Some(add));
        assert_eq!(Instruction::decode(0xff), None);
    }

    #[test]
    fn test_display() {
        let load = Instruction::wide(Op::LoadLow, 3, 100);
        assert_eq!(load.to_string(), "RXI  r3 100");
        let call = Instruction::triple(
            Op::CallRx,
            Reg::from_raw(4),
            Reg::new(Bank::Closure, 0).unwrap(),
            Reg::from_raw(0),
        );
        assert_eq!(call.to_string(), "FNRX +4 c0");
    }

    #[test]
    fn test_bytes_round_trip() {
        let program = Program {
            instructions: vec![
                Instruction::wide(Op::LoadLow, 0, 7),
                Instruction::wide(Op::Ret, 0, 0),
                Instruction::wide(Op::Call, 0, 0),
            ],
            symbols: Vec::new(),
        };
        let bytes = program.to_bytes();
        assert_eq!(&bytes[..4], b"RGVM");
        assert_eq!(Program::from_bytes(&bytes).unwrap(), program);
        assert!(Program::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_listing_labels() {
        let program = Program {
            instructions: vec![
                Instruction::wide(Op::Ret, 0, 0),
                Instruction::wide(Op::Ret, 0, 0),
                Instruction::wide(Op::Call, 0, 1),
            ],
            symbols: vec![Symbol {
                id: 1,
                name: "double".into(),
                address: 0,
            }],
        };
        let listing = program.listing();
        assert!(listing.starts_with("double:\n    0  RET"));
        assert!(listing.contains("main:\n    1  RET"));
        assert!(listing.contains("marker:\n    2  FN   +0 @1"));
    }
}
