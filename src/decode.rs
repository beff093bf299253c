//! Abstraction over the disassembler/encoder the translator provides (§6,
//! "Interface this core consumes from the translator"). This crate never
//! implements an x86 decoder itself; it only describes the shape of what it
//! needs from one, so a real decoder (Zydis, iced-x86, XED, ...) can be
//! plugged in by the host.

/// A general-purpose x86-64 register, independent of the width it's
/// addressed at (`EAX`/`AX`/`AL` all map to `Reg::Rax`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    pub fn is_stack_pointer(self) -> bool {
        matches!(self, Reg::Rsp)
    }

    /// Low 3 bits of the ModRM/opcode register field.
    pub fn low_bits(self) -> u8 {
        (self.encoding() & 0x7) as u8
    }

    /// Whether this register needs `REX.B`/`REX.R`/`REX.X` (R8-R15).
    pub fn needs_rex_extension(self) -> bool {
        self.encoding() >= 8
    }

    pub fn encoding(self) -> u8 {
        match self {
            Reg::Rax => 0,
            Reg::Rcx => 1,
            Reg::Rdx => 2,
            Reg::Rbx => 3,
            Reg::Rsp => 4,
            Reg::Rbp => 5,
            Reg::Rsi => 6,
            Reg::Rdi => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::R12 => 12,
            Reg::R13 => 13,
            Reg::R14 => 14,
            Reg::R15 => 15,
        }
    }
}

/// A decoded operand's addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Register(Reg),
    /// `[base + disp]`, optionally RIP-relative.
    Memory {
        base: Option<Reg>,
        rip_relative: bool,
        disp: i32,
    },
    Immediate(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    pub width_bits: u16,
}

impl Operand {
    pub fn is_stack_pointer(&self) -> bool {
        matches!(self.kind, OperandKind::Register(r) if r.is_stack_pointer())
            || matches!(self.kind, OperandKind::Memory { base: Some(r), .. } if r.is_stack_pointer())
    }

    pub fn register(&self) -> Option<Reg> {
        match self.kind {
            OperandKind::Register(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.kind, OperandKind::Memory { .. })
    }
}

/// Coarse instruction category, as much as the instrumenters need to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Cmp,
    Sub,
    CondBranch(CondKind),
    CondMove(CondKind),
    Call,
    Ret,
    UncondBranch,
    Other,
}

/// The raw condition-code suffix a decoder reports for a conditional
/// branch/move (`JB`, `CMOVNBE`, ...), independent of any compare-coverage
/// meaning. Mapping this to a [`CompareCategory`] is this crate's own job
/// (§4.3), not the decoder's -- see `compare_coverage::classify_cond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondKind {
    /// `JB` / `CMOVB` (`JNAE` / `CMOVNAE`).
    B,
    /// `JNB` / `CMOVNB` (`JAE` / `CMOVAE`).
    Ae,
    /// `JL` / `CMOVL` (`JNGE` / `CMOVNGE`).
    L,
    /// `JNL` / `CMOVNL` (`JGE` / `CMOVGE`).
    Ge,
    /// `JA` / `CMOVA` (`JNBE` / `CMOVNBE`).
    A,
    /// `JNA` / `CMOVNA` (`JBE` / `CMOVBE`).
    Be,
    /// `JG` / `CMOVG` (`JNLE` / `CMOVNLE`).
    G,
    /// `JNG` / `CMOVNG` (`JLE` / `CMOVLE`).
    Le,
    /// `JE` / `CMOVE`.
    E,
    /// `JNE` / `CMOVNE`.
    Ne,
    /// Any other condition (`JS`, `JO`, `JP`, ...), none of which this crate
    /// distinguishes from `equal` (§4.3, "anything else -> equal").
    Other,
}

/// The branch-taken predicate a compare's progress is classified under,
/// per §4.3 ("below/less/equal/above/greater").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareCategory {
    Below,
    Less,
    Equal,
    Above,
    Greater,
}

impl CompareCategory {
    pub fn letter(self) -> char {
        match self {
            CompareCategory::Below => 'B',
            CompareCategory::Less => 'L',
            CompareCategory::Equal => 'E',
            CompareCategory::Greater => 'G',
            CompareCategory::Above => 'A',
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: u64,
    pub length: u8,
    pub category: Category,
    pub operands: Vec<Operand>,
    /// Whether this instruction reads RFLAGS as an input (a "flag-consuming"
    /// instruction in the SUB-viability scan, §4.4).
    pub reads_rflags: bool,
    /// Whether this instruction overwrites RFLAGS (a "flag-clobber").
    pub writes_rflags: bool,
}

impl Instruction {
    pub fn end_address(&self) -> u64 {
        self.address + self.length as u64
    }

    pub fn operand_width_bits(&self) -> Option<u16> {
        self.operands.first().map(|op| op.width_bits)
    }
}

/// A chunk of original code the translator can hand us a host-readable view
/// of (§6, `GetRegion`).
#[derive(Debug, Clone, Copy)]
pub struct Region<'a> {
    pub from: u64,
    pub to: u64,
    pub host_bytes: &'a [u8],
}

/// What the translator's decoder must provide.
pub trait Decoder {
    /// Decodes one instruction at `addr`. Returns `None` on decode failure
    /// or when `addr` is outside any known region -- never fatal (§7).
    fn decode(&self, addr: u64) -> Option<Instruction>;

    /// Locates the host-readable view of a chunk of original code
    /// containing `addr`, if any.
    fn region_containing(&self, addr: u64) -> Option<Region<'_>>;
}

/// Why an instruction was declined for compare-coverage/I2S instrumentation.
/// Declines are silent per §7 ("Ineligibility is silent"); this type exists
/// purely for `log::trace!` diagnostics and tests, never surfaced as an
/// [`crate::error::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    NotCmpOrSub,
    OperandTooNarrow,
    StackPointerOperand,
    SubNotViable,
    BlockTooLargeForCompareCode,
    AlreadyInstrumented,
}

pub type Eligibility<T> = Result<T, DeclineReason>;
