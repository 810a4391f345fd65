//! Grid simulator for KIR kernels.
//!
//! Runs the kernel once per hardware thread of a launch. Threads are
//! independent: loads read the initial memory image and stores are
//! recorded per thread, so every thread can run on its own rayon task.
//! The simulator enforces what the IR claims: range metadata on
//! special-register reads, `assume` conditions, and no-wrap flags are
//! all checked and reported as diagnostics when violated.

use std::collections::BTreeMap;

use rayon::prelude::*;

use super::{
    Axis, BinOp, BlockId, CastOp, CmpPred, FloatOp, IntType, KIROp, Kernel, Reg, SpecialReg,
    Terminator, Value,
};
use crate::diagnostic::Diagnostic;
use crate::launch::{Dim3, LaunchDimensions};
use crate::span::Span;

/// Blocks a single thread may execute before the simulation is aborted.
pub const DEFAULT_STEP_LIMIT: u64 = 1 << 20;

/// Largest launch the simulator accepts, in threads.
pub const MAX_SIMULATED_THREADS: u64 = 1 << 24;

// ─── Memory image ──────────────────────────────────────────────────

/// Named f32 buffers, one per kernel parameter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Memory {
    arrays: BTreeMap<String, Vec<f32>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, data: Vec<f32>) {
        self.arrays.insert(name.to_string(), data);
    }

    pub fn with_array(mut self, name: &str, data: Vec<f32>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.arrays.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }
}

/// Which hardware thread executed something.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadCoord {
    pub block: Dim3,
    pub thread: Dim3,
}

impl ThreadCoord {
    fn special(&self, sreg: SpecialReg) -> u64 {
        let (dim, axis) = match sreg {
            SpecialReg::BlockId(axis) => (self.block, axis),
            SpecialReg::ThreadId(axis) => (self.thread, axis),
        };
        match axis {
            Axis::X => dim.x,
            Axis::Y => dim.y,
            Axis::Z => dim.z,
        }
    }
}

impl std::fmt::Display for ThreadCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block {} thread {}", self.block, self.thread)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoreRecord {
    pub array: String,
    pub addr: u64,
    pub value: f32,
    pub by: ThreadCoord,
}

/// Everything a simulated launch wrote, in thread order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trace {
    pub stores: Vec<StoreRecord>,
    pub threads: u64,
    /// Blocks executed, summed over all threads.
    pub steps: u64,
}

impl Trace {
    pub fn stores_to<'a>(&'a self, array: &'a str) -> impl Iterator<Item = &'a StoreRecord> + 'a {
        self.stores.iter().filter(move |s| s.array == array)
    }

    /// How many times each element of `array` (of length `len`) was written.
    pub fn store_counts(&self, array: &str, len: usize) -> Vec<u32> {
        let mut counts = vec![0u32; len];
        for store in self.stores_to(array) {
            if let Some(c) = counts.get_mut(store.addr as usize) {
                *c += 1;
            }
        }
        counts
    }

    /// Write every recorded store into `memory`, in thread order.
    pub fn apply(&self, memory: &mut Memory) {
        for store in &self.stores {
            if let Some(buf) = memory.arrays.get_mut(&store.array) {
                if let Some(slot) = buf.get_mut(store.addr as usize) {
                    *slot = store.value;
                }
            }
        }
    }
}

// ─── Simulation ────────────────────────────────────────────────────

pub fn simulate(kernel: &Kernel, launch: &LaunchDimensions, memory: &Memory) -> Result<Trace, Diagnostic> {
    simulate_with_step_limit(kernel, launch, memory, DEFAULT_STEP_LIMIT)
}

pub fn simulate_with_step_limit(
    kernel: &Kernel,
    launch: &LaunchDimensions,
    memory: &Memory,
    step_limit: u64,
) -> Result<Trace, Diagnostic> {
    let total_threads = match launch.checked_launch_bound() {
        Some(n) if n <= MAX_SIMULATED_THREADS => n,
        _ => {
            return Err(Diagnostic::error(
                format!(
                    "launch {} exceeds the simulation limit of {} threads",
                    launch, MAX_SIMULATED_THREADS
                ),
                Span::dummy(),
            )
            .with_help("simulate a smaller grid; the emitted code does not depend on the launch size".to_string()))
        }
    };
    for param in &kernel.params {
        let Some(buf) = memory.get(&param.name) else {
            return Err(Diagnostic::error(
                format!("no buffer bound to parameter '{}'", param.name),
                Span::dummy(),
            ));
        };
        if buf.len() as u64 != param.shape.element_count() {
            return Err(Diagnostic::error(
                format!(
                    "buffer '{}' has {} elements, parameter shape {} needs {}",
                    param.name,
                    buf.len(),
                    param.shape,
                    param.shape.element_count()
                ),
                Span::dummy(),
            ));
        }
    }

    let blocks = launch.block_counts();
    let threads = launch.thread_counts_per_block();
    let results: Vec<Result<ThreadRun, Diagnostic>> = (0..total_threads)
        .into_par_iter()
        .map(|linear| run_thread(kernel, memory, thread_coord(linear, blocks, threads), step_limit))
        .collect();

    let mut trace = Trace {
        threads: total_threads,
        ..Trace::default()
    };
    for result in results {
        let run = result?;
        trace.steps += run.steps;
        trace.stores.extend(run.stores);
    }
    Ok(trace)
}

/// Coordinate of the `linear`-th thread of the launch, blocks outermost and x fastest.
fn thread_coord(linear: u64, blocks: Dim3, threads: Dim3) -> ThreadCoord {
    let per_block = threads.product();
    ThreadCoord {
        block: delinearize(linear / per_block, blocks),
        thread: delinearize(linear % per_block, threads),
    }
}

fn delinearize(linear: u64, dim: Dim3) -> Dim3 {
    Dim3::new(linear % dim.x, linear / dim.x % dim.y, linear / (dim.x * dim.y))
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Slot {
    Int(u64),
    F32(f32),
}

struct ThreadRun {
    stores: Vec<StoreRecord>,
    steps: u64,
}

struct ThreadState<'k> {
    kernel: &'k Kernel,
    coord: ThreadCoord,
    regs: Vec<Option<Slot>>,
}

impl<'k> ThreadState<'k> {
    fn fail(&self, block: BlockId, message: String) -> Diagnostic {
        Diagnostic::error(message, Span::dummy())
            .with_note(format!("in {} ({}), {}", block, self.kernel.block(block).name, self.coord))
    }

    fn int(&self, block: BlockId, v: Value, ty: IntType) -> Result<u64, Diagnostic> {
        match v {
            Value::Imm(imm) => Ok(ty.mask(imm)),
            Value::Reg(r) => match self.regs[r.0 as usize] {
                Some(Slot::Int(x)) => Ok(ty.mask(x)),
                Some(Slot::F32(_)) => Err(self.fail(block, format!("{} is f32, expected {}", r, ty))),
                None => Err(self.fail(block, format!("{} read before it was defined", r))),
            },
        }
    }

    fn float(&self, block: BlockId, r: Reg) -> Result<f32, Diagnostic> {
        match self.regs[r.0 as usize] {
            Some(Slot::F32(x)) => Ok(x),
            Some(Slot::Int(_)) => Err(self.fail(block, format!("{} is an integer, expected f32", r))),
            None => Err(self.fail(block, format!("{} read before it was defined", r))),
        }
    }

    fn set(&mut self, r: Reg, slot: Slot) {
        self.regs[r.0 as usize] = Some(slot);
    }
}

fn as_signed(v: u64, ty: IntType) -> i128 {
    let bits = ty.bits();
    if bits >= 64 {
        return v as i64 as i128;
    }
    let shift = 64 - bits;
    (((v << shift) as i64) >> shift) as i128
}

fn signed_fits(v: i128, ty: IntType) -> bool {
    let bits = ty.bits();
    let min = -(1i128 << (bits - 1));
    let max = (1i128 << (bits - 1)) - 1;
    v >= min && v <= max
}

fn run_thread(
    kernel: &Kernel,
    memory: &Memory,
    coord: ThreadCoord,
    step_limit: u64,
) -> Result<ThreadRun, Diagnostic> {
    let mut st = ThreadState {
        kernel,
        coord,
        regs: vec![None; kernel.reg_count()],
    };
    let mut stores = Vec::new();
    let mut prev: Option<BlockId> = None;
    let mut current = kernel.entry;
    let mut steps = 0u64;

    loop {
        steps += 1;
        if steps > step_limit {
            return Err(st
                .fail(current, format!("step limit of {} blocks exceeded", step_limit))
                .with_help("the kernel may not terminate for this launch".to_string()));
        }
        let block = kernel.block(current);

        // Phis read their inputs before any of them is written.
        let mut phi_values = Vec::new();
        for op in block.ops.iter().take_while(|op| op.is_phi()) {
            if let KIROp::Phi { dst, ty, incoming } = op {
                let Some(pred) = prev else {
                    return Err(st.fail(current, format!("phi {} in the entry block", dst)));
                };
                let Some((value, _)) = incoming.iter().find(|(_, b)| *b == pred) else {
                    return Err(st.fail(current, format!("phi {} has no value for {}", dst, pred)));
                };
                phi_values.push((*dst, st.int(current, *value, *ty)?));
            }
        }
        for (dst, v) in phi_values {
            st.set(dst, Slot::Int(v));
        }

        for op in block.ops.iter().skip_while(|op| op.is_phi()) {
            match op {
                KIROp::ReadSpecial { dst, sreg, range } => {
                    let v = coord.special(*sreg);
                    if let Some((lo, hi)) = range {
                        if v < *lo || v >= *hi {
                            return Err(st.fail(
                                current,
                                format!("{} = {} violates its range [{}, {})", sreg, v, lo, hi),
                            ));
                        }
                    }
                    st.set(*dst, Slot::Int(IntType::I32.mask(v)));
                }
                KIROp::Cast {
                    dst, op, src, from, to,
                } => {
                    let v = st.int(current, *src, *from)?;
                    let v = match op {
                        CastOp::ZExt => v,
                        CastOp::Trunc => to.mask(v),
                    };
                    st.set(*dst, Slot::Int(v));
                }
                KIROp::Binary {
                    dst,
                    op,
                    flags,
                    ty,
                    lhs,
                    rhs,
                } => {
                    let a = st.int(current, *lhs, *ty)?;
                    let b = st.int(current, *rhs, *ty)?;
                    let wide = match op {
                        BinOp::Add => Some(a as u128 + b as u128),
                        BinOp::Sub => a.checked_sub(b).map(u128::from),
                        BinOp::Mul => Some(a as u128 * b as u128),
                        BinOp::UDiv | BinOp::URem if b == 0 => {
                            return Err(st.fail(current, format!("{} by zero", op.mnemonic())));
                        }
                        BinOp::UDiv => Some((a / b) as u128),
                        BinOp::URem => Some((a % b) as u128),
                    };
                    if flags.nuw && wide.map_or(true, |w| w > ty.max_value() as u128) {
                        return Err(st.fail(
                            current,
                            format!("{} nuw {} {}, {} wraps", op.mnemonic(), ty, a, b),
                        ));
                    }
                    if flags.nsw {
                        let (sa, sb) = (as_signed(a, *ty), as_signed(b, *ty));
                        let signed = match op {
                            BinOp::Add => sa + sb,
                            BinOp::Sub => sa - sb,
                            BinOp::Mul => sa * sb,
                            BinOp::UDiv | BinOp::URem => 0,
                        };
                        if !signed_fits(signed, *ty) {
                            return Err(st.fail(
                                current,
                                format!("{} nsw {} {}, {} overflows", op.mnemonic(), ty, sa, sb),
                            ));
                        }
                    }
                    let v = match op {
                        BinOp::Sub => a.wrapping_sub(b),
                        _ => wide.unwrap_or(0) as u64,
                    };
                    st.set(*dst, Slot::Int(ty.mask(v)));
                }
                KIROp::ICmp {
                    dst,
                    pred,
                    ty,
                    lhs,
                    rhs,
                } => {
                    let a = st.int(current, *lhs, *ty)?;
                    let b = st.int(current, *rhs, *ty)?;
                    let r = match pred {
                        CmpPred::Ult => a < b,
                        CmpPred::Eq => a == b,
                    };
                    st.set(*dst, Slot::Int(r as u64));
                }
                KIROp::Assume(cond) => {
                    if st.int(current, *cond, IntType::I1)? == 0 {
                        return Err(st.fail(current, format!("assumption {} does not hold", cond)));
                    }
                }
                KIROp::Phi { dst, .. } => {
                    return Err(st.fail(current, format!("phi {} after a non-phi instruction", dst)));
                }
                KIROp::Load { dst, array, addr } => {
                    let a = st.int(current, *addr, IntType::I64)?;
                    let Some(buf) = memory.get(array) else {
                        return Err(st.fail(current, format!("load from unbound array '{}'", array)));
                    };
                    let Some(v) = buf.get(a as usize) else {
                        return Err(st.fail(
                            current,
                            format!("load {}[{}] is out of bounds ({} elements)", array, a, buf.len()),
                        ));
                    };
                    st.set(*dst, Slot::F32(*v));
                }
                KIROp::Store { array, addr, value } => {
                    let a = st.int(current, *addr, IntType::I64)?;
                    let v = st.float(current, *value)?;
                    let len = memory.get(array).map(<[f32]>::len).unwrap_or(0);
                    if a as usize >= len {
                        return Err(st.fail(
                            current,
                            format!("store {}[{}] is out of bounds ({} elements)", array, a, len),
                        ));
                    }
                    stores.push(StoreRecord {
                        array: array.clone(),
                        addr: a,
                        value: v,
                        by: coord,
                    });
                }
                KIROp::Float { dst, op, args } => {
                    let vals = args
                        .iter()
                        .map(|r| st.float(current, *r))
                        .collect::<Result<Vec<f32>, Diagnostic>>()?;
                    let v = match op {
                        FloatOp::Neg => -vals[0],
                        FloatOp::Add => vals[0] + vals[1],
                        FloatOp::Mul => vals[0] * vals[1],
                    };
                    st.set(*dst, Slot::F32(v));
                }
                KIROp::Comment(_) => {}
            }
        }

        let next = match &block.terminator {
            Some(Terminator::Ret) => break,
            Some(Terminator::Br(target)) => *target,
            Some(Terminator::CondBr {
                cond,
                if_true,
                if_false,
            }) => {
                if st.int(current, *cond, IntType::I1)? != 0 {
                    *if_true
                } else {
                    *if_false
                }
            }
            None => {
                return Err(st.fail(current, "fell off an unterminated block".to_string()));
            }
        };
        prev = Some(current);
        current = next;
    }

    Ok(ThreadRun { stores, steps })
}
