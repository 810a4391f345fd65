//! Element-index emission.
//!
//! An index emitter turns "run this body for every element of a shape"
//! into KIR. Two strategies implement the same `IndexEmitter` trait:
//!
//! - `serial::LoopEmitter`: one counted loop over every linear position.
//! - `parallel::ParallelLoopEmitter`: derives indices from block/thread
//!   ids, guards them with one bounds check, and loops over the grid only
//!   when the grid is too small to cover the shape in one pass.
//!
//! Both hand each derived `LogicalIndex` to a caller-supplied body.

pub mod parallel;
pub mod serial;

#[cfg(test)]
mod tests;

use crate::kir::builder::KernelBuilder;
use crate::kir::{ArithFlags, BlockId, IntType, Reg, Value};
use crate::shape::Shape;

pub use parallel::{plan_parallel_loop, row_index_applies, LoopPlan, ParallelLoopEmitter};
pub use serial::LoopEmitter;

/// Index type used when the caller does not pick one.
pub const DEFAULT_INDEX_TYPE: IntType = IntType::I64;

// ─── Logical indices ───────────────────────────────────────────────

/// One element position: a linear position plus its per-dimension
/// coordinates, all as KIR values.
#[derive(Clone, Debug, PartialEq)]
pub struct LogicalIndex {
    linear: Value,
    multidim: Vec<Value>,
    shape: Shape,
    index_type: IntType,
}

impl LogicalIndex {
    /// Derive every coordinate of `linear` from the shape's layout.
    pub fn from_linear(linear: Value, shape: &Shape, index_type: IntType, b: &mut KernelBuilder) -> Self {
        Self::with_partial(linear, vec![None; shape.rank()], shape, index_type, b)
    }

    /// Keep the coordinates already present in `partial` and derive the
    /// missing ones from `linear`.
    pub fn with_partial(
        linear: Value,
        partial: Vec<Option<Value>>,
        shape: &Shape,
        index_type: IntType,
        b: &mut KernelBuilder,
    ) -> Self {
        assert_eq!(
            partial.len(),
            shape.rank(),
            "partial index has rank {}, shape {} has rank {}",
            partial.len(),
            shape,
            shape.rank()
        );
        let multidim = emit_delinearize(b, linear, partial, shape, index_type);
        Self {
            linear,
            multidim,
            shape: shape.clone(),
            index_type,
        }
    }

    pub fn linear(&self) -> Value {
        self.linear
    }

    pub fn multidim(&self) -> &[Value] {
        &self.multidim
    }

    pub fn coord(&self, dim: usize) -> Value {
        self.multidim[dim]
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn index_type(&self) -> IntType {
        self.index_type
    }

    pub fn rank(&self) -> usize {
        self.multidim.len()
    }
}

/// Emit `coord[d] = (linear / stride[d]) % dims[d]` for every missing
/// coordinate, walking the layout from minor to major. The major-most
/// dimension skips the remainder and a stride of 1 skips the division.
fn emit_delinearize(
    b: &mut KernelBuilder,
    linear: Value,
    mut partial: Vec<Option<Value>>,
    shape: &Shape,
    ty: IntType,
) -> Vec<Value> {
    if shape.element_count() == 0 {
        // No position is ever in bounds; avoid dividing by a zero stride.
        return partial
            .into_iter()
            .map(|c| c.unwrap_or(Value::Imm(0)))
            .collect();
    }
    let minor_to_major = shape.minor_to_major();
    let mut divisor = 1u64;
    for (i, &dim) in minor_to_major.iter().enumerate() {
        let size = shape.dim(dim);
        if partial[dim].is_none() {
            let quot = if divisor == 1 {
                linear
            } else {
                b.udiv(linear, Value::Imm(divisor), ty, "")
            };
            let coord = if i + 1 < minor_to_major.len() {
                b.urem(quot, Value::Imm(size), ty, &format!("coord.{}", dim))
            } else {
                quot
            };
            partial[dim] = Some(coord);
        }
        divisor *= size;
    }
    let multidim: Vec<Value> = partial.into_iter().flatten().collect();
    assert_eq!(multidim.len(), shape.rank());
    multidim
}

// ─── Arrays ────────────────────────────────────────────────────────

/// A kernel buffer parameter viewed through its shape and layout.
#[derive(Clone, Debug, PartialEq)]
pub struct IrArray {
    name: String,
    shape: Shape,
}

impl IrArray {
    pub fn new(name: &str, shape: Shape) -> Self {
        Self {
            name: name.to_string(),
            shape,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Element offset of `index` in this buffer. Reuses the linear
    /// position when the index was derived for the same physical order.
    pub fn emit_address(&self, b: &mut KernelBuilder, index: &LogicalIndex) -> Value {
        if index.shape().same_physical_order(&self.shape) {
            return index.linear();
        }
        self.emit_address_from_multidim(b, index)
    }

    /// Element offset computed from the coordinates and this buffer's
    /// strides, ignoring the linear position.
    pub fn emit_address_from_multidim(&self, b: &mut KernelBuilder, index: &LogicalIndex) -> Value {
        assert_eq!(
            index.shape().dims(),
            self.shape.dims(),
            "index for {} used on array '{}' of shape {}",
            index.shape(),
            self.name,
            self.shape
        );
        let ty = index.index_type();
        let strides = self.shape.strides();
        let mut addr: Option<Value> = None;
        for dim in self.shape.minor_to_major() {
            let coord = index.coord(dim);
            let term = if strides[dim] == 1 {
                coord
            } else {
                b.mul(coord, Value::Imm(strides[dim]), ty, ArithFlags::NO_WRAP, "")
            };
            addr = Some(match addr {
                None => term,
                Some(acc) => b.add(acc, term, ty, ArithFlags::NO_WRAP, ""),
            });
        }
        addr.unwrap_or(Value::Imm(0))
    }

    pub fn emit_read_array_element(&self, b: &mut KernelBuilder, index: &LogicalIndex, name: &str) -> Reg {
        let addr = self.emit_address(b, index);
        b.load(&self.name, addr, name)
    }

    pub fn emit_write_array_element(&self, b: &mut KernelBuilder, index: &LogicalIndex, value: Reg) {
        let addr = self.emit_address(b, index);
        b.store(&self.name, addr, value);
    }
}

// ─── Bodies ────────────────────────────────────────────────────────

/// Emits the per-element computation for one logical index.
pub type BodyEmitter<'a, E> = Box<dyn FnMut(&mut KernelBuilder, &LogicalIndex) -> Result<(), E> + 'a>;

/// Produces one value per target array for one logical index.
pub type ElementGenerator<'a, E> =
    Box<dyn FnMut(&mut KernelBuilder, &LogicalIndex) -> Result<Vec<Reg>, E> + 'a>;

/// A body that stores each generated value into its target array.
pub fn make_body_emitter<'a, E: 'a>(
    mut generator: ElementGenerator<'a, E>,
    targets: Vec<IrArray>,
) -> BodyEmitter<'a, E> {
    assert!(!targets.is_empty(), "element generator needs a target array");
    Box::new(move |b: &mut KernelBuilder, index: &LogicalIndex| {
        let values = generator(b, index)?;
        assert_eq!(
            values.len(),
            targets.len(),
            "element generator produced {} values for {} target arrays",
            values.len(),
            targets.len()
        );
        for (target, value) in targets.iter().zip(values) {
            target.emit_write_array_element(b, index, value);
        }
        Ok(())
    })
}

/// Shape shared by all `targets`; they must agree on dimensions.
pub(crate) fn common_target_shape(targets: &[IrArray]) -> Shape {
    let first = targets
        .first()
        .map(|t| t.shape().clone())
        .unwrap_or_else(|| panic!("element generator needs a target array"));
    for target in targets {
        assert_eq!(
            target.shape().dims(),
            first.dims(),
            "target '{}' has shape {}, expected {}",
            target.name(),
            target.shape(),
            first
        );
    }
    first
}

// ─── Emission strategy ─────────────────────────────────────────────

/// Element-index emission strategy.
pub trait IndexEmitter {
    type Error;

    /// Derive the logical indices for one pass, leave the cursor where
    /// the body belongs, and record the construct's exit block.
    fn emit_index_and_set_exit_block(
        &mut self,
        b: &mut KernelBuilder,
        loop_name: &str,
        index_type: IntType,
        base_index: Option<Value>,
    ) -> Vec<LogicalIndex>;

    /// Exit block recorded by the last emission, if any.
    fn exit_block(&self) -> Option<BlockId>;

    /// Run the body for one index.
    fn emit_body(&mut self, b: &mut KernelBuilder, index: &LogicalIndex) -> Result<(), Self::Error>;

    /// Emit the whole construct. On success the cursor is at the first
    /// instruction after it.
    fn emit_loop(
        &mut self,
        b: &mut KernelBuilder,
        loop_name: &str,
        index_type: Option<IntType>,
    ) -> Result<(), Self::Error> {
        emit_single_pass(self, b, loop_name, index_type.unwrap_or(DEFAULT_INDEX_TYPE))
    }
}

/// One pass of index derivation followed by the body for each index,
/// then the cursor moves to the recorded exit.
pub fn emit_single_pass<T: IndexEmitter + ?Sized>(
    emitter: &mut T,
    b: &mut KernelBuilder,
    loop_name: &str,
    index_type: IntType,
) -> Result<(), T::Error> {
    for index in emitter.emit_index_and_set_exit_block(b, loop_name, index_type, None) {
        emitter.emit_body(b, &index)?;
    }
    if let Some(exit) = emitter.exit_block() {
        b.set_to_first_insert_point(exit);
    }
    Ok(())
}

/// Panics unless positions up to `limit` fit the signed range of `ty`.
pub(crate) fn assert_index_type_fits(ty: IntType, limit: u64, what: &str) {
    assert!(ty != IntType::I1, "i1 cannot be used as an index type");
    assert!(
        limit <= ty.max_signed(),
        "{} ({}) does not fit index type {}",
        what,
        limit,
        ty
    );
}
