//! Parallel element-index emission.
//!
//! Each hardware thread computes its starting linear position directly
//! from its block and thread ids:
//!
//! ```text
//! linear_index = block_id.x * threads_per_block.x + thread_id.x
//! linear_index_base = linear_index * unroll [+ base]
//! if (linear_index_base < element_count) {
//!   body(linear_index_base), body(linear_index_base + 1), ...
//! }
//! ```
//!
//! When `launch_bound * unroll` is smaller than the element count the
//! whole thing is wrapped in a counted loop over the grid that steps by
//! `launch_bound * unroll`.

use tracing::{debug, trace};

use super::{
    assert_index_type_fits, common_target_shape, emit_single_pass, make_body_emitter, BodyEmitter,
    ElementGenerator, IndexEmitter, IrArray, LogicalIndex, DEFAULT_INDEX_TYPE,
};
use crate::kir::builder::KernelBuilder;
use crate::kir::target::HardwareIds;
use crate::kir::{ArithFlags, Axis, BlockId, IntType, Value};
use crate::launch::LaunchDimensions;
use crate::shape::Shape;

// ─── Planning ──────────────────────────────────────────────────────

/// How a shape is mapped onto a launch: one pass or a grid-stride loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopPlan {
    pub element_count: u64,
    pub total_threads: u64,
    pub unroll_factor: u64,
    /// Elements covered per pass over the grid.
    pub step: u64,
    /// The grid covers every element without a wrapping loop.
    pub single_pass: bool,
    /// Passes over the grid (1 when `single_pass`).
    pub trip_count: u64,
    /// The last coordinate is computed directly from the thread id.
    pub row_index: bool,
}

pub fn plan_parallel_loop(shape: &Shape, launch: &LaunchDimensions, unroll_factor: u64) -> LoopPlan {
    assert!(unroll_factor >= 1, "unroll factor must be at least 1");
    let element_count = shape.element_count();
    let total_threads = launch.launch_bound();
    let step = grid_step(total_threads, unroll_factor);
    let single_pass = step >= element_count;
    LoopPlan {
        element_count,
        total_threads,
        unroll_factor,
        step,
        single_pass,
        trip_count: if single_pass {
            1
        } else {
            element_count.div_ceil(step)
        },
        row_index: row_index_applies(shape, launch, unroll_factor),
    }
}

/// Elements covered per pass over the grid. Panics if that overflows.
fn grid_step(total_threads: u64, unroll_factor: u64) -> u64 {
    total_threads.checked_mul(unroll_factor).unwrap_or_else(|| {
        panic!(
            "grid step of {} threads times unroll factor {} overflows u64",
            total_threads, unroll_factor
        )
    })
}

/// Whether the innermost coordinate can be taken straight from the
/// thread id: rank > 1, unrolled, laid out with the last dimension
/// minor-most, and the threads of one block times the unroll factor
/// span exactly one row.
pub fn row_index_applies(shape: &Shape, launch: &LaunchDimensions, unroll_factor: u64) -> bool {
    if shape.rank() <= 1 || unroll_factor <= 1 {
        return false;
    }
    let Some(layout) = shape.layout() else {
        return false;
    };
    if layout.minor_most() != Some(shape.rank() - 1) {
        return false;
    }
    let threads = launch.thread_counts_per_block();
    let row_width = threads
        .checked_product()
        .and_then(|t| t.checked_mul(unroll_factor));
    row_width == shape.last_dim()
}

// ─── Emitter ───────────────────────────────────────────────────────

pub struct ParallelLoopEmitter<'a, E> {
    body: BodyEmitter<'a, E>,
    shape: Shape,
    launch: LaunchDimensions,
    hardware: &'a dyn HardwareIds,
    unroll_factor: u64,
    exit_block: Option<BlockId>,
}

impl<'a, E: 'a> ParallelLoopEmitter<'a, E> {
    pub fn new(
        body: BodyEmitter<'a, E>,
        shape: &Shape,
        launch: &LaunchDimensions,
        hardware: &'a dyn HardwareIds,
        unroll_factor: u64,
    ) -> Self {
        assert!(unroll_factor >= 1, "unroll factor must be at least 1");
        Self {
            body,
            shape: shape.clone(),
            launch: *launch,
            hardware,
            unroll_factor,
            exit_block: None,
        }
    }

    /// Store the generator's values into `targets` at every index.
    pub fn from_element_generator(
        generator: ElementGenerator<'a, E>,
        targets: Vec<IrArray>,
        launch: &LaunchDimensions,
        hardware: &'a dyn HardwareIds,
        unroll_factor: u64,
    ) -> Self {
        let shape = common_target_shape(&targets);
        Self::new(
            make_body_emitter(generator, targets),
            &shape,
            launch,
            hardware,
            unroll_factor,
        )
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn unroll_factor(&self) -> u64 {
        self.unroll_factor
    }

    pub fn plan(&self) -> LoopPlan {
        plan_parallel_loop(&self.shape, &self.launch, self.unroll_factor)
    }

    fn check_preconditions(&self, index_type: IntType) {
        let blocks = self.launch.block_counts();
        let threads = self.launch.thread_counts_per_block();
        assert!(
            blocks.x <= self.hardware.max_block_count(Axis::X),
            "{} blocks along x exceed the hardware limit of {}",
            blocks.x,
            self.hardware.max_block_count(Axis::X)
        );
        assert!(
            threads.x <= self.hardware.max_threads_per_block(Axis::X),
            "{} threads per block along x exceed the hardware limit of {}",
            threads.x,
            self.hardware.max_threads_per_block(Axis::X)
        );
        let step = grid_step(self.launch.launch_bound(), self.unroll_factor);
        assert_index_type_fits(
            index_type,
            self.shape.element_count().saturating_add(step),
            "element count plus grid step",
        );
    }
}

impl<'a, E: 'a> IndexEmitter for ParallelLoopEmitter<'a, E> {
    type Error = E;

    fn emit_index_and_set_exit_block(
        &mut self,
        b: &mut KernelBuilder,
        loop_name: &str,
        index_type: IntType,
        base_index: Option<Value>,
    ) -> Vec<LogicalIndex> {
        debug!(unroll_factor = self.unroll_factor, "emit_index_and_set_exit_block");
        let ty = index_type;
        let blocks = self.launch.block_counts();
        let threads = self.launch.thread_counts_per_block();
        let u = self.unroll_factor;

        // 0 <= ctaid.x < nctaid.x and 0 <= tid.x < ntid.x.
        let block_id = self.hardware.block_id(b, Axis::X);
        b.add_range_metadata(block_id, 0, blocks.x);
        let block_id = b.zext_or_trunc(Value::Reg(block_id), IntType::I32, ty, "block_id");

        let thread_id = self.hardware.thread_id(b, Axis::X);
        b.add_range_metadata(thread_id, 0, threads.x);
        let thread_id = b.zext_or_trunc(Value::Reg(thread_id), IntType::I32, ty, "thread_id");

        let scaled = b.mul(block_id, Value::Imm(threads.x), ty, ArithFlags::NO_WRAP, "");
        let mut linear_index_base = b.add(scaled, thread_id, ty, ArithFlags::NO_WRAP, "linear_index");

        // Range inference does not recover this bound from the two
        // multiplicands, so state it.
        let in_range = b.icmp_ult(
            linear_index_base,
            Value::Imm(threads.x * blocks.x),
            ty,
            "linear_index_in_range",
        );
        b.assume(in_range);

        if u > 1 {
            linear_index_base = b.mul(
                linear_index_base,
                Value::Imm(u),
                ty,
                ArithFlags::NO_WRAP,
                "linear_index_base",
            );
        }

        if let Some(base) = base_index {
            linear_index_base = b.add(
                linear_index_base,
                base,
                ty,
                ArithFlags::NO_WRAP,
                "linear_index_plus_base",
            );
        }

        let enable_row_index = row_index_applies(&self.shape, &self.launch, u);
        debug!(enable_row_index, shape = %self.shape, "row optimized indexing");

        let rank = self.shape.rank();
        let mut indices = Vec::with_capacity(u as usize);
        let row_index = if enable_row_index {
            let row_index = b.mul(thread_id, Value::Imm(u), ty, ArithFlags::NO_WRAP, "row_index");
            let mut multidim = vec![None; rank];
            multidim[rank - 1] = Some(row_index);
            indices.push(LogicalIndex::with_partial(
                linear_index_base,
                multidim,
                &self.shape,
                ty,
                b,
            ));
            Some(row_index)
        } else {
            indices.push(LogicalIndex::from_linear(linear_index_base, &self.shape, ty, b));
            None
        };

        for i in 1..u {
            let linear_index = b.add(
                linear_index_base,
                Value::Imm(i),
                ty,
                ArithFlags::NO_WRAP,
                &format!("linear_index{}", i),
            );
            trace!(i, "unrolled index");
            match row_index {
                Some(row_index) => {
                    let mut multidim = vec![None; rank];
                    multidim[rank - 1] = Some(b.add(
                        row_index,
                        Value::Imm(i),
                        ty,
                        ArithFlags::NO_WRAP,
                        &format!("row_index_plus{}", i),
                    ));
                    indices.push(LogicalIndex::with_partial(
                        linear_index,
                        multidim,
                        &self.shape,
                        ty,
                        b,
                    ));
                }
                None => {
                    indices.push(LogicalIndex::from_linear(linear_index, &self.shape, ty, b));
                }
            }
        }

        // One check on the first position covers every unrolled index.
        let in_bounds = b.icmp_ult(
            linear_index_base,
            Value::Imm(self.shape.element_count()),
            ty,
            "",
        );
        let if_in_bounds = b.emit_if_then_else(in_bounds, &format!("{}.in_bounds", loop_name), false);

        self.exit_block = Some(if_in_bounds.after_block);
        b.set_to_first_insert_point(if_in_bounds.true_block);

        indices
    }

    fn exit_block(&self) -> Option<BlockId> {
        self.exit_block
    }

    fn emit_body(&mut self, b: &mut KernelBuilder, index: &LogicalIndex) -> Result<(), E> {
        (self.body)(b, index)
    }

    fn emit_loop(
        &mut self,
        b: &mut KernelBuilder,
        loop_name: &str,
        index_type: Option<IntType>,
    ) -> Result<(), E> {
        let ty = index_type.unwrap_or(DEFAULT_INDEX_TYPE);
        self.check_preconditions(ty);

        let plan = self.plan();
        if plan.single_pass {
            debug!(
                total_threads = plan.total_threads,
                elements = plan.element_count,
                "grid covers the shape in one pass"
            );
            return emit_single_pass(self, b, loop_name, ty);
        }

        debug!(
            step = plan.step,
            trip_count = plan.trip_count,
            "grid-stride loop"
        );
        let for_loop = b.counted_loop(
            &format!("{}.loop", loop_name),
            Value::Imm(0),
            Value::Imm(plan.element_count),
            Value::Imm(plan.step),
            ty,
            |b, base_indvar| {
                for index in self.emit_index_and_set_exit_block(b, loop_name, ty, Some(base_indvar)) {
                    (self.body)(b, &index)?;
                }
                Ok(())
            },
        )?;

        // The construct ends at the loop exit, not at the in-bounds
        // join inside the loop body.
        self.exit_block = Some(for_loop.exit);
        b.set_to_first_insert_point(for_loop.exit);
        Ok(())
    }
}
