//! KernelBuilder: appends KIR at an explicit insertion point.
//!
//! The builder owns the kernel under construction and a single cursor
//! (`InsertPoint`). New instructions are inserted at the cursor, which
//! then advances past them. Control-flow helpers split the current
//! block at the cursor: everything after it (including the terminator)
//! moves into a fresh block that becomes the construct's exit.

use tracing::trace;

use super::target::GpuTarget;
use super::*;
use crate::shape::Shape;

/// Position in a block before which new instructions are inserted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsertPoint {
    pub block: BlockId,
    pub index: usize,
}

/// Blocks created by `emit_if_then_else`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IfBlocks {
    pub true_block: BlockId,
    pub false_block: Option<BlockId>,
    pub after_block: BlockId,
}

/// Blocks and induction variable created by `emit_for_loop`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForLoop {
    pub preheader: BlockId,
    pub header: BlockId,
    pub body: BlockId,
    pub exit: BlockId,
    pub indvar: Reg,
}

pub struct KernelBuilder {
    kernel: Kernel,
    cursor: InsertPoint,
}

impl KernelBuilder {
    /// Start a kernel with a single `entry` block ending in `ret`; the
    /// cursor sits before the `ret`.
    pub fn new(name: &str, target: GpuTarget) -> Self {
        let mut entry = Block::new(BlockId(0), "entry");
        entry.terminator = Some(Terminator::Ret);
        Self {
            kernel: Kernel {
                name: name.to_string(),
                target,
                params: Vec::new(),
                blocks: vec![entry],
                entry: BlockId(0),
                reg_types: Vec::new(),
                reg_names: Vec::new(),
            },
            cursor: InsertPoint {
                block: BlockId(0),
                index: 0,
            },
        }
    }

    pub fn add_param(&mut self, name: &str, shape: Shape, access: ParamAccess) {
        assert!(
            self.kernel.param(name).is_none(),
            "duplicate kernel parameter '{}'",
            name
        );
        self.kernel.params.push(KernelParam {
            name: name.to_string(),
            shape,
            access,
        });
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn finish(self) -> Kernel {
        self.kernel
    }

    // ─── Cursor ────────────────────────────────────────────────────

    pub fn insert_point(&self) -> InsertPoint {
        self.cursor
    }

    pub fn set_insert_point(&mut self, ip: InsertPoint) {
        let block = self.kernel.block(ip.block);
        assert!(
            ip.index >= block.first_insertion_index() && ip.index <= block.ops.len(),
            "insert point {}:{} out of range",
            ip.block,
            ip.index
        );
        self.cursor = ip;
    }

    /// Move the cursor to the first non-phi position of `block`.
    pub fn set_to_first_insert_point(&mut self, block: BlockId) {
        let index = self.kernel.block(block).first_insertion_index();
        self.cursor = InsertPoint { block, index };
    }

    /// Move the cursor after the last instruction of `block`.
    pub fn set_insert_point_end(&mut self, block: BlockId) {
        let index = self.kernel.block(block).ops.len();
        self.cursor = InsertPoint { block, index };
    }

    // ─── Registers and instructions ────────────────────────────────

    pub fn fresh_reg(&mut self, ty: RegType, name: &str) -> Reg {
        let reg = Reg(self.kernel.reg_types.len() as u32);
        self.kernel.reg_types.push(ty);
        self.kernel.reg_names.push(if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        });
        reg
    }

    fn insert(&mut self, op: KIROp) {
        trace!(block = %self.cursor.block, index = self.cursor.index, op = %op, "insert");
        let ip = self.cursor;
        self.kernel.block_mut(ip.block).ops.insert(ip.index, op);
        self.cursor.index += 1;
    }

    pub fn read_special(&mut self, sreg: SpecialReg, name: &str) -> Reg {
        let dst = self.fresh_reg(RegType::Int(IntType::I32), name);
        self.insert(KIROp::ReadSpecial {
            dst,
            sreg,
            range: None,
        });
        dst
    }

    /// Attach a known value range `[lo, hi)` to a special-register read.
    pub fn add_range_metadata(&mut self, reg: Reg, lo: u64, hi: u64) {
        assert!(lo < hi, "empty range [{}, {})", lo, hi);
        for block in &mut self.kernel.blocks {
            for op in &mut block.ops {
                if let KIROp::ReadSpecial { dst, range, .. } = op {
                    if *dst == reg {
                        *range = Some((lo, hi));
                        return;
                    }
                }
            }
        }
        panic!("range metadata needs a special-register read, {} is not one", reg);
    }

    /// Zero-extend or truncate `value` from `from` to `to`. Returns the
    /// value unchanged when the widths agree.
    pub fn zext_or_trunc(&mut self, value: Value, from: IntType, to: IntType, name: &str) -> Value {
        if from == to {
            return value;
        }
        if let Value::Imm(v) = value {
            return Value::Imm(to.mask(v));
        }
        let op = if to.bits() > from.bits() {
            CastOp::ZExt
        } else {
            CastOp::Trunc
        };
        let dst = self.fresh_reg(RegType::Int(to), name);
        self.insert(KIROp::Cast {
            dst,
            op,
            src: value,
            from,
            to,
        });
        Value::Reg(dst)
    }

    pub fn binary(
        &mut self,
        op: BinOp,
        lhs: Value,
        rhs: Value,
        ty: IntType,
        flags: ArithFlags,
        name: &str,
    ) -> Value {
        let dst = self.fresh_reg(RegType::Int(ty), name);
        self.insert(KIROp::Binary {
            dst,
            op,
            flags,
            ty,
            lhs,
            rhs,
        });
        Value::Reg(dst)
    }

    pub fn add(&mut self, lhs: Value, rhs: Value, ty: IntType, flags: ArithFlags, name: &str) -> Value {
        self.binary(BinOp::Add, lhs, rhs, ty, flags, name)
    }

    pub fn mul(&mut self, lhs: Value, rhs: Value, ty: IntType, flags: ArithFlags, name: &str) -> Value {
        self.binary(BinOp::Mul, lhs, rhs, ty, flags, name)
    }

    pub fn udiv(&mut self, lhs: Value, rhs: Value, ty: IntType, name: &str) -> Value {
        self.binary(BinOp::UDiv, lhs, rhs, ty, ArithFlags::NONE, name)
    }

    pub fn urem(&mut self, lhs: Value, rhs: Value, ty: IntType, name: &str) -> Value {
        self.binary(BinOp::URem, lhs, rhs, ty, ArithFlags::NONE, name)
    }

    pub fn icmp_ult(&mut self, lhs: Value, rhs: Value, ty: IntType, name: &str) -> Value {
        let dst = self.fresh_reg(RegType::Int(IntType::I1), name);
        self.insert(KIROp::ICmp {
            dst,
            pred: CmpPred::Ult,
            ty,
            lhs,
            rhs,
        });
        Value::Reg(dst)
    }

    pub fn assume(&mut self, cond: Value) {
        self.insert(KIROp::Assume(cond));
    }

    pub fn load(&mut self, array: &str, addr: Value, name: &str) -> Reg {
        assert!(
            self.kernel.param(array).is_some(),
            "load from unknown parameter '{}'",
            array
        );
        let dst = self.fresh_reg(RegType::F32, name);
        self.insert(KIROp::Load {
            dst,
            array: array.to_string(),
            addr,
        });
        dst
    }

    pub fn store(&mut self, array: &str, addr: Value, value: Reg) {
        assert!(
            self.kernel.param(array).is_some(),
            "store to unknown parameter '{}'",
            array
        );
        self.insert(KIROp::Store {
            array: array.to_string(),
            addr,
            value,
        });
    }

    pub fn float(&mut self, op: FloatOp, args: Vec<Reg>, name: &str) -> Reg {
        assert_eq!(args.len(), op.arity(), "{} takes {} operands", op.mnemonic(), op.arity());
        let dst = self.fresh_reg(RegType::F32, name);
        self.insert(KIROp::Float { dst, op, args });
        dst
    }

    pub fn comment(&mut self, text: &str) {
        self.insert(KIROp::Comment(text.to_string()));
    }

    // ─── Blocks and control flow ───────────────────────────────────

    /// Append a new, open block.
    pub fn new_block(&mut self, name: &str) -> BlockId {
        let id = BlockId(self.kernel.blocks.len() as u32);
        self.kernel.blocks.push(Block::new(id, name));
        id
    }

    /// Split the current block at the cursor. Instructions after the
    /// cursor and the terminator move into a new block; the current
    /// block is left open. Phis in successors are re-pointed at the new
    /// block.
    pub fn split_block(&mut self, name: &str) -> BlockId {
        let ip = self.cursor;
        let new_id = BlockId(self.kernel.blocks.len() as u32);

        let old = self.kernel.block_mut(ip.block);
        assert!(
            ip.index >= old.first_insertion_index(),
            "cannot split {} inside its phis",
            ip.block
        );
        let mut tail = Block::new(new_id, name);
        tail.ops = old.ops.split_off(ip.index);
        tail.terminator = old.terminator.take();

        for succ in tail.successors() {
            for op in &mut self.kernel.block_mut(succ).ops {
                if let KIROp::Phi { incoming, .. } = op {
                    for (_, pred) in incoming.iter_mut() {
                        if *pred == ip.block {
                            *pred = new_id;
                        }
                    }
                }
            }
        }
        self.kernel.blocks.push(tail);
        new_id
    }

    fn terminate(&mut self, block: BlockId, term: Terminator) {
        let b = self.kernel.block_mut(block);
        assert!(b.terminator.is_none(), "{} is already terminated", block);
        b.terminator = Some(term);
    }

    /// Emit `if (cond) { <true> } [else { <false> }]` at the cursor.
    ///
    /// The code after the cursor moves to the `after` block. On return
    /// the cursor is at the start of `after`.
    pub fn emit_if_then_else(&mut self, cond: Value, name: &str, emit_else: bool) -> IfBlocks {
        let head = self.cursor.block;
        let true_block = self.new_block(&format!("{}-true", name));
        let false_block = if emit_else {
            Some(self.new_block(&format!("{}-false", name)))
        } else {
            None
        };
        let after_block = self.split_block(&format!("{}-after", name));

        self.terminate(true_block, Terminator::Br(after_block));
        if let Some(fb) = false_block {
            self.terminate(fb, Terminator::Br(after_block));
        }
        self.terminate(
            head,
            Terminator::CondBr {
                cond,
                if_true: true_block,
                if_false: false_block.unwrap_or(after_block),
            },
        );
        self.set_to_first_insert_point(after_block);

        IfBlocks {
            true_block,
            false_block,
            after_block,
        }
    }

    /// Emit the skeleton of `for (indvar = start; indvar < end; indvar += step)`.
    ///
    /// On return the cursor is at the start of the loop body, before the
    /// increment. Code after the original cursor moves to `exit`.
    pub fn emit_for_loop(
        &mut self,
        prefix: &str,
        start: Value,
        end: Value,
        step: Value,
        ty: IntType,
    ) -> ForLoop {
        let preheader = self.cursor.block;
        let header = self.new_block(&format!("{}_header", prefix));
        let body = self.new_block(&format!("{}_body", prefix));
        let exit = self.split_block(&format!("{}_exit", prefix));
        self.terminate(preheader, Terminator::Br(header));

        let indvar = self.fresh_reg(RegType::Int(ty), &format!("{}_indvar", prefix));
        let next = self.fresh_reg(RegType::Int(ty), &format!("{}_indvar.next", prefix));
        let cond = self.fresh_reg(RegType::Int(IntType::I1), &format!("{}_cond", prefix));

        let header_block = self.kernel.block_mut(header);
        header_block.ops.push(KIROp::Phi {
            dst: indvar,
            ty,
            incoming: vec![(start, preheader), (Value::Reg(next), body)],
        });
        header_block.ops.push(KIROp::ICmp {
            dst: cond,
            pred: CmpPred::Ult,
            ty,
            lhs: Value::Reg(indvar),
            rhs: end,
        });
        self.terminate(
            header,
            Terminator::CondBr {
                cond: Value::Reg(cond),
                if_true: body,
                if_false: exit,
            },
        );

        self.kernel.block_mut(body).ops.push(KIROp::Binary {
            dst: next,
            op: BinOp::Add,
            flags: ArithFlags::NO_WRAP,
            ty,
            lhs: Value::Reg(indvar),
            rhs: step,
        });
        self.terminate(body, Terminator::Br(header));
        self.set_to_first_insert_point(body);

        ForLoop {
            preheader,
            header,
            body,
            exit,
            indvar,
        }
    }

    /// Emit a counted loop whose body is produced by `body`, then leave
    /// the cursor at the start of the loop exit. A failing body aborts
    /// emission and its error is returned unchanged.
    pub fn counted_loop<E, F>(
        &mut self,
        prefix: &str,
        start: Value,
        end: Value,
        step: Value,
        ty: IntType,
        body: F,
    ) -> Result<ForLoop, E>
    where
        F: FnOnce(&mut KernelBuilder, Value) -> Result<(), E>,
    {
        let for_loop = self.emit_for_loop(prefix, start, end, step, ty);
        body(self, Value::Reg(for_loop.indvar))?;
        self.set_to_first_insert_point(for_loop.exit);
        Ok(for_loop)
    }
}
