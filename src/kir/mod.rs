//! KIR: the kernel intermediate representation.
//!
//! A small SSA control-flow graph for one GPU kernel: typed virtual
//! registers, basic blocks with explicit terminators, and integer
//! arithmetic that carries its no-wrap flags explicitly so range
//! information survives into lowering.
//!
//! ```text
//! KernelBuilder (cursor) → Kernel → verify / eval / lower
//! ```

pub mod builder;
pub mod eval;
pub mod lower;
pub mod target;
pub mod verify;


use std::fmt;

use crate::shape::Shape;
use target::GpuTarget;

// ─── Operands ──────────────────────────────────────────────────────

/// Virtual register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(pub u32);

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Basic block identifier (index into `Kernel::blocks`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Integer types used for indexing and predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntType {
    I1,
    I32,
    I64,
}

impl IntType {
    pub fn bits(self) -> u32 {
        match self {
            IntType::I1 => 1,
            IntType::I32 => 32,
            IntType::I64 => 64,
        }
    }

    pub fn from_bits(bits: u32) -> Option<IntType> {
        match bits {
            1 => Some(IntType::I1),
            32 => Some(IntType::I32),
            64 => Some(IntType::I64),
            _ => None,
        }
    }

    /// Largest unsigned value representable.
    pub fn max_value(self) -> u64 {
        match self {
            IntType::I1 => 1,
            IntType::I32 => u32::MAX as u64,
            IntType::I64 => u64::MAX,
        }
    }

    /// Largest value that is non-negative when read as signed.
    pub fn max_signed(self) -> u64 {
        match self {
            IntType::I1 => 0,
            IntType::I32 => i32::MAX as u64,
            IntType::I64 => i64::MAX as u64,
        }
    }

    pub fn mask(self, v: u64) -> u64 {
        v & self.max_value()
    }
}

impl fmt::Display for IntType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.bits())
    }
}

/// Type of a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegType {
    Int(IntType),
    F32,
}

impl fmt::Display for RegType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegType::Int(ty) => write!(f, "{}", ty),
            RegType::F32 => write!(f, "f32"),
        }
    }
}

/// An instruction operand: a register or an integer immediate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Reg(Reg),
    Imm(u64),
}

impl Value {
    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Value::Reg(r) => Some(*r),
            Value::Imm(_) => None,
        }
    }

    pub fn as_imm(&self) -> Option<u64> {
        match self {
            Value::Imm(v) => Some(*v),
            Value::Reg(_) => None,
        }
    }
}

impl From<Reg> for Value {
    fn from(r: Reg) -> Self {
        Value::Reg(r)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Reg(r) => write!(f, "{}", r),
            Value::Imm(v) => write!(f, "{}", v),
        }
    }
}

// ─── Instructions ──────────────────────────────────────────────────

/// No-wrap guarantees attached to integer arithmetic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ArithFlags {
    /// No unsigned wrap.
    pub nuw: bool,
    /// No signed wrap.
    pub nsw: bool,
}

impl ArithFlags {
    pub const NONE: ArithFlags = ArithFlags {
        nuw: false,
        nsw: false,
    };
    pub const NO_WRAP: ArithFlags = ArithFlags {
        nuw: true,
        nsw: true,
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    URem,
}

impl BinOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::UDiv => "udiv",
            BinOp::URem => "urem",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CastOp {
    ZExt,
    Trunc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Ult,
    Eq,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatOp {
    Neg,
    Add,
    Mul,
}

impl FloatOp {
    pub fn arity(self) -> usize {
        match self {
            FloatOp::Neg => 1,
            FloatOp::Add | FloatOp::Mul => 2,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            FloatOp::Neg => "fneg",
            FloatOp::Add => "fadd",
            FloatOp::Mul => "fmul",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
        }
    }
}

/// Hardware-provided special registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpecialReg {
    BlockId(Axis),
    ThreadId(Axis),
}

impl fmt::Display for SpecialReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecialReg::BlockId(axis) => write!(f, "ctaid.{}", axis),
            SpecialReg::ThreadId(axis) => write!(f, "tid.{}", axis),
        }
    }
}

/// A non-terminator instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum KIROp {
    /// Read a special register (always i32), optionally with a known
    /// half-open value range `[lo, hi)`.
    ReadSpecial {
        dst: Reg,
        sreg: SpecialReg,
        range: Option<(u64, u64)>,
    },
    Cast {
        dst: Reg,
        op: CastOp,
        src: Value,
        from: IntType,
        to: IntType,
    },
    Binary {
        dst: Reg,
        op: BinOp,
        flags: ArithFlags,
        ty: IntType,
        lhs: Value,
        rhs: Value,
    },
    ICmp {
        dst: Reg,
        pred: CmpPred,
        ty: IntType,
        lhs: Value,
        rhs: Value,
    },
    /// Optimizer hint: `cond` holds. Not a runtime check.
    Assume(Value),
    Phi {
        dst: Reg,
        ty: IntType,
        incoming: Vec<(Value, BlockId)>,
    },
    /// Load one f32 element of a kernel parameter at element offset `addr`.
    Load {
        dst: Reg,
        array: String,
        addr: Value,
    },
    Store {
        array: String,
        addr: Value,
        value: Reg,
    },
    Float {
        dst: Reg,
        op: FloatOp,
        args: Vec<Reg>,
    },
    Comment(String),
}

impl KIROp {
    /// Register defined by this instruction, if any.
    pub fn def(&self) -> Option<Reg> {
        match self {
            KIROp::ReadSpecial { dst, .. }
            | KIROp::Cast { dst, .. }
            | KIROp::Binary { dst, .. }
            | KIROp::ICmp { dst, .. }
            | KIROp::Phi { dst, .. }
            | KIROp::Load { dst, .. }
            | KIROp::Float { dst, .. } => Some(*dst),
            KIROp::Assume(_) | KIROp::Store { .. } | KIROp::Comment(_) => None,
        }
    }

    /// Registers read by this instruction.
    pub fn uses(&self) -> Vec<Reg> {
        let values: Vec<Value> = match self {
            KIROp::ReadSpecial { .. } | KIROp::Comment(_) => Vec::new(),
            KIROp::Cast { src, .. } => vec![*src],
            KIROp::Binary { lhs, rhs, .. } | KIROp::ICmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            KIROp::Assume(v) => vec![*v],
            KIROp::Phi { incoming, .. } => incoming.iter().map(|(v, _)| *v).collect(),
            KIROp::Load { addr, .. } => vec![*addr],
            KIROp::Store { addr, value, .. } => vec![*addr, Value::Reg(*value)],
            KIROp::Float { args, .. } => args.iter().map(|r| Value::Reg(*r)).collect(),
        };
        values.iter().filter_map(Value::as_reg).collect()
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, KIROp::Phi { .. })
    }
}

impl fmt::Display for KIROp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KIROp::ReadSpecial { dst, sreg, range } => {
                write!(f, "{} = sreg i32 {}", dst, sreg)?;
                if let Some((lo, hi)) = range {
                    write!(f, ", range [{}, {})", lo, hi)?;
                }
                Ok(())
            }
            KIROp::Cast {
                dst,
                op,
                src,
                from,
                to,
            } => {
                let name = match op {
                    CastOp::ZExt => "zext",
                    CastOp::Trunc => "trunc",
                };
                write!(f, "{} = {} {} {} to {}", dst, name, from, src, to)
            }
            KIROp::Binary {
                dst,
                op,
                flags,
                ty,
                lhs,
                rhs,
            } => {
                write!(f, "{} = {}", dst, op.mnemonic())?;
                if flags.nuw {
                    write!(f, " nuw")?;
                }
                if flags.nsw {
                    write!(f, " nsw")?;
                }
                write!(f, " {} {}, {}", ty, lhs, rhs)
            }
            KIROp::ICmp {
                dst,
                pred,
                ty,
                lhs,
                rhs,
            } => {
                let p = match pred {
                    CmpPred::Ult => "ult",
                    CmpPred::Eq => "eq",
                };
                write!(f, "{} = icmp {} {} {}, {}", dst, p, ty, lhs, rhs)
            }
            KIROp::Assume(v) => write!(f, "assume {}", v),
            KIROp::Phi { dst, ty, incoming } => {
                let arms: Vec<String> = incoming
                    .iter()
                    .map(|(v, b)| format!("[{}, {}]", v, b))
                    .collect();
                write!(f, "{} = phi {} {}", dst, ty, arms.join(", "))
            }
            KIROp::Load { dst, array, addr } => write!(f, "{} = load f32 {}[{}]", dst, array, addr),
            KIROp::Store { array, addr, value } => {
                write!(f, "store f32 {}[{}], {}", array, addr, value)
            }
            KIROp::Float { dst, op, args } => {
                let args: Vec<String> = args.iter().map(|r| r.to_string()).collect();
                write!(f, "{} = {} f32 {}", dst, op.mnemonic(), args.join(", "))
            }
            KIROp::Comment(text) => write!(f, "// {}", text),
        }
    }
}

/// Block terminator.
#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Value,
        if_true: BlockId,
        if_false: BlockId,
    },
    Ret,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr {
                if_true, if_false, ..
            } => vec![*if_true, *if_false],
            Terminator::Ret => Vec::new(),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Br(target) => write!(f, "br {}", target),
            Terminator::CondBr {
                cond,
                if_true,
                if_false,
            } => write!(f, "br {}, {}, {}", cond, if_true, if_false),
            Terminator::Ret => write!(f, "ret"),
        }
    }
}

// ─── Blocks and kernels ────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    pub ops: Vec<KIROp>,
    /// `None` while the block is still open.
    pub terminator: Option<Terminator>,
}

impl Block {
    pub fn new(id: BlockId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            ops: Vec::new(),
            terminator: None,
        }
    }

    /// Index of the first non-phi instruction.
    pub fn first_insertion_index(&self) -> usize {
        self.ops.iter().take_while(|op| op.is_phi()).count()
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator
            .as_ref()
            .map(Terminator::successors)
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamAccess {
    Read,
    Write,
}

/// A buffer argument of the kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelParam {
    pub name: String,
    pub shape: Shape,
    pub access: ParamAccess,
}

/// A complete kernel: parameters, blocks, and register metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Kernel {
    pub name: String,
    pub target: GpuTarget,
    pub params: Vec<KernelParam>,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    pub reg_types: Vec<RegType>,
    pub reg_names: Vec<Option<String>>,
}

impl Kernel {
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn reg_type(&self, reg: Reg) -> RegType {
        self.reg_types[reg.0 as usize]
    }

    pub fn reg_name(&self, reg: Reg) -> Option<&str> {
        self.reg_names
            .get(reg.0 as usize)
            .and_then(|n| n.as_deref())
    }

    pub fn reg_count(&self) -> usize {
        self.reg_types.len()
    }

    pub fn param(&self, name: &str) -> Option<&KernelParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// All instructions in block order.
    pub fn ops(&self) -> impl Iterator<Item = &KIROp> {
        self.blocks.iter().flat_map(|b| b.ops.iter())
    }

    /// Number of instructions matching `pred`.
    pub fn count_ops(&self, pred: impl Fn(&KIROp) -> bool) -> usize {
        self.ops().filter(|op| pred(op)).count()
    }

    /// The instruction that defines `reg`.
    pub fn def_of(&self, reg: Reg) -> Option<&KIROp> {
        self.ops().find(|op| op.def() == Some(reg))
    }

    /// First register carrying the given debug name.
    pub fn named_reg(&self, name: &str) -> Option<Reg> {
        self.reg_names
            .iter()
            .position(|n| n.as_deref() == Some(name))
            .map(|i| Reg(i as u32))
    }

    /// Blocks whose name starts with `prefix`.
    pub fn blocks_named(&self, prefix: &str) -> Vec<&Block> {
        self.blocks
            .iter()
            .filter(|b| b.name.starts_with(prefix))
            .collect()
    }

    /// Canonical textual listing.
    pub fn listing(&self) -> String {
        self.to_string()
    }

    /// BLAKE3 digest of the canonical listing; equal for structurally
    /// identical kernels.
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.listing().as_bytes()).to_hex().to_string()
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let access = match p.access {
                    ParamAccess::Read => "in",
                    ParamAccess::Write => "out",
                };
                format!("{} {}: f32{}", access, p.name, p.shape)
            })
            .collect();
        writeln!(
            f,
            "kernel {}({}) target={} {{",
            self.name,
            params.join(", "),
            self.target.name()
        )?;
        for block in &self.blocks {
            writeln!(f, "{}: ; {}", block.id, block.name)?;
            for op in &block.ops {
                match op.def().and_then(|r| self.reg_name(r)) {
                    Some(name) => writeln!(f, "  {} ; {}", op, name)?,
                    None => writeln!(f, "  {}", op)?,
                }
            }
            match &block.terminator {
                Some(term) => writeln!(f, "  {}", term)?,
                None => writeln!(f, "  <open>")?,
            }
        }
        write!(f, "}}")
    }
}
