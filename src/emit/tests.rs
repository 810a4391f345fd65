use super::*;
use crate::config::{ElementOp, KernelSpec};
use crate::diagnostic::Diagnostic;
use crate::kir::builder::{InsertPoint, KernelBuilder};
use crate::kir::eval::{simulate, Memory};
use crate::kir::target::GpuTarget;
use crate::kir::verify::{has_loops, verify};
use crate::kir::{BinOp, CastOp, FloatOp, KIROp, Kernel, ParamAccess, SpecialReg, Terminator};
use crate::launch::{Dim3, LaunchDimensions};
use crate::shape::{Layout, Shape};
use crate::{compile_kernel, simulate_kernel};

// ─── Helpers ───────────────────────────────────────────────────────

struct Emitted {
    kernel: Kernel,
    indices: Vec<LogicalIndex>,
    exit: Option<BlockId>,
    cursor: InsertPoint,
    plan: LoopPlan,
}

/// Emit a parallel copy `out[i] = in0[i]` and record every index the
/// body was handed.
fn emit_copy(shape: &Shape, launch: &LaunchDimensions, unroll: u64, index_type: Option<IntType>) -> Emitted {
    let mut b = KernelBuilder::new("fusion", GpuTarget::Nvptx);
    b.add_param("in0", shape.clone(), ParamAccess::Read);
    b.add_param("out", shape.clone(), ParamAccess::Write);
    let input = IrArray::new("in0", shape.clone());
    let output = IrArray::new("out", shape.clone());
    let mut indices = Vec::new();
    let (exit, plan) = {
        let body: BodyEmitter<'_, Diagnostic> = Box::new(|b: &mut KernelBuilder, index: &LogicalIndex| {
            indices.push(index.clone());
            let v = input.emit_read_array_element(b, index, "x");
            output.emit_write_array_element(b, index, v);
            Ok(())
        });
        let mut emitter = ParallelLoopEmitter::new(body, shape, launch, &GpuTarget::Nvptx, unroll);
        emitter.emit_loop(&mut b, "fusion", index_type).unwrap();
        (emitter.exit_block(), emitter.plan())
    };
    let cursor = b.insert_point();
    Emitted {
        kernel: b.finish(),
        indices,
        exit,
        cursor,
        plan,
    }
}

fn cond_branches(kernel: &Kernel) -> usize {
    kernel
        .blocks
        .iter()
        .filter(|b| matches!(b.terminator, Some(Terminator::CondBr { .. })))
        .count()
}

fn named(kernel: &Kernel, name: &str) -> Value {
    Value::Reg(
        kernel
            .named_reg(name)
            .unwrap_or_else(|| panic!("no register named {}", name)),
    )
}

fn def<'k>(kernel: &'k Kernel, v: Value) -> &'k KIROp {
    kernel.def_of(v.as_reg().unwrap()).unwrap()
}

fn block_named(kernel: &Kernel, name: &str) -> BlockId {
    let blocks = kernel.blocks_named(name);
    assert_eq!(blocks.len(), 1, "expected one block named {}", name);
    blocks[0].id
}

fn add_spec(shape: Shape, blocks: u64, threads: u64, unroll: u64) -> KernelSpec {
    KernelSpec::new("fusion", ElementOp::Add, shape, LaunchDimensions::linear(blocks, threads)).with_unroll(unroll)
}

// ─── Planning ──────────────────────────────────────────────────────

#[test]
fn test_plan_single_pass_and_trip_counts() {
    let launch = LaunchDimensions::linear(2, 512);
    let plan = plan_parallel_loop(&Shape::new(vec![1024]), &launch, 1);
    assert!(plan.single_pass);
    assert_eq!(plan.trip_count, 1);

    let plan = plan_parallel_loop(&Shape::new(vec![4096]), &launch, 1);
    assert!(!plan.single_pass);
    assert_eq!((plan.step, plan.trip_count), (1024, 4));

    let plan = plan_parallel_loop(&Shape::new(vec![4096]), &launch, 2);
    assert_eq!((plan.step, plan.trip_count), (2048, 2));

    // ceil(4097 / 1024)
    let plan = plan_parallel_loop(&Shape::new(vec![4097]), &launch, 1);
    assert_eq!(plan.trip_count, 5);

    // Exactly covered by unrolling.
    let plan = plan_parallel_loop(&Shape::new(vec![4096]), &launch, 4);
    assert!(plan.single_pass);
}

#[test]
fn test_row_index_requires_every_condition() {
    let row = Shape::row_major(vec![8, 128]);
    let launch = LaunchDimensions::linear(1, 32);
    assert!(row_index_applies(&row, &launch, 4));

    // Rank 1.
    assert!(!row_index_applies(&Shape::row_major(vec![128]), &launch, 4));
    // No unrolling.
    assert!(!row_index_applies(&row, &LaunchDimensions::linear(1, 128), 1));
    // No explicit layout.
    assert!(!row_index_applies(&Shape::new(vec![8, 128]), &launch, 4));
    // Last dimension is not minor-most.
    let col = Shape::with_layout(vec![8, 128], Layout::col_major(2));
    assert!(!row_index_applies(&col, &launch, 4));
    // Threads times unroll do not span the row.
    assert!(!row_index_applies(&row, &LaunchDimensions::linear(1, 64), 4));
}

#[test]
fn test_row_index_counts_every_thread_axis() {
    let shape = Shape::row_major(vec![4, 256]);
    let launch = LaunchDimensions::new(Dim3::x(1), Dim3::new(32, 2, 1));
    assert!(row_index_applies(&shape, &launch, 4));
    assert!(!row_index_applies(&shape, &LaunchDimensions::linear(1, 32), 4));
}

// ─── Concrete scenarios ────────────────────────────────────────────

#[test]
fn test_covered_grid_emits_one_branch_and_no_loop() {
    let e = emit_copy(&Shape::new(vec![1024]), &LaunchDimensions::linear(2, 512), 1, None);
    assert!(e.plan.single_pass);
    assert!(!has_loops(&e.kernel));
    assert_eq!(cond_branches(&e.kernel), 1);
    assert_eq!(e.indices.len(), 1);

    // The one check is `linear_index < 1024`.
    let linear = named(&e.kernel, "linear_index");
    let entry = e.kernel.block(e.kernel.entry);
    let Some(Terminator::CondBr { cond, .. }) = &entry.terminator else {
        panic!("entry must end in the bounds check");
    };
    match def(&e.kernel, *cond) {
        KIROp::ICmp { lhs, rhs, .. } => {
            assert_eq!(*lhs, linear);
            assert_eq!(*rhs, Value::Imm(1024));
        }
        other => panic!("unexpected bounds check {}", other),
    }
    assert_eq!(e.indices[0].linear(), linear);
    verify(&e.kernel).unwrap();
}

#[test]
fn test_small_grid_wraps_in_strided_loop() {
    let e = emit_copy(&Shape::new(vec![4096]), &LaunchDimensions::linear(2, 512), 1, None);
    assert!(!e.plan.single_pass);
    assert_eq!(e.plan.trip_count, 4);
    assert!(has_loops(&e.kernel));
    assert_eq!(e.indices.len(), 1);

    let indvar = named(&e.kernel, "fusion.loop_indvar");
    match def(&e.kernel, indvar) {
        KIROp::Phi { incoming, .. } => assert_eq!(incoming[0].0, Value::Imm(0)),
        other => panic!("indvar defined by {}", other),
    }
    match def(&e.kernel, named(&e.kernel, "fusion.loop_cond")) {
        KIROp::ICmp { lhs, rhs, .. } => assert_eq!((*lhs, *rhs), (indvar, Value::Imm(4096))),
        other => panic!("loop condition defined by {}", other),
    }
    match def(&e.kernel, named(&e.kernel, "fusion.loop_indvar.next")) {
        KIROp::Binary { op, rhs, .. } => assert_eq!((*op, *rhs), (BinOp::Add, Value::Imm(1024))),
        other => panic!("increment defined by {}", other),
    }
    // The loop variable is the base offset of the index.
    match def(&e.kernel, named(&e.kernel, "linear_index_plus_base")) {
        KIROp::Binary { lhs, rhs, .. } => {
            assert_eq!(*lhs, named(&e.kernel, "linear_index"));
            assert_eq!(*rhs, indvar);
        }
        other => panic!("base offset defined by {}", other),
    }
    assert_eq!(cond_branches(&e.kernel), 2);
    verify(&e.kernel).unwrap();
}

#[test]
fn test_looped_base_offsets_visit_each_stride() {
    let spec = KernelSpec::new(
        "fusion",
        ElementOp::Copy,
        Shape::new(vec![4096]),
        LaunchDimensions::linear(2, 512),
    );
    let kernel = compile_kernel(&spec).unwrap();
    let (memory, _) = crate::host_reference(&spec);
    let trace = simulate(&kernel, &spec.launch, &memory).unwrap();
    // Thread 5 of block 1 writes 517, then one stride further each trip.
    let mine: Vec<u64> = trace
        .stores_to("out")
        .filter(|s| s.by.block.x == 1 && s.by.thread.x == 5)
        .map(|s| s.addr)
        .collect();
    assert_eq!(mine, vec![517, 517 + 1024, 517 + 2048, 517 + 3072]);
}

#[test]
fn test_misaligned_row_scenario_uses_generic_index() {
    // 128 threads * 4 != 128
    let shape = Shape::row_major(vec![8, 128]);
    let e = emit_copy(&shape, &LaunchDimensions::linear(1, 128), 4, None);
    assert!(!e.plan.row_index);
    assert!(e.kernel.named_reg("row_index").is_none());
    assert_eq!(e.indices.len(), 4);
    for index in &e.indices {
        match def(&e.kernel, index.coord(1)) {
            KIROp::Binary { op, lhs, rhs, .. } => {
                assert_eq!(*op, BinOp::URem);
                assert_eq!(*lhs, index.linear());
                assert_eq!(*rhs, Value::Imm(128));
            }
            other => panic!("last coordinate defined by {}", other),
        }
    }
}

#[test]
fn test_row_index_derives_last_coordinate_from_thread_id() {
    let shape = Shape::row_major(vec![8, 128]);
    let e = emit_copy(&shape, &LaunchDimensions::linear(1, 32), 4, None);
    assert!(e.plan.row_index);
    let k = &e.kernel;

    let row = named(k, "row_index");
    match def(k, row) {
        KIROp::Binary { op, lhs, rhs, flags, .. } => {
            assert_eq!(*op, BinOp::Mul);
            assert_eq!(*lhs, named(k, "thread_id"));
            assert_eq!(*rhs, Value::Imm(4));
            assert_eq!(*flags, ArithFlags::NO_WRAP);
        }
        other => panic!("row_index defined by {}", other),
    }
    assert_eq!(e.indices[0].coord(1), row);
    for i in 1..4u64 {
        let plus = named(k, &format!("row_index_plus{}", i));
        assert_eq!(e.indices[i as usize].coord(1), plus);
        match def(k, plus) {
            KIROp::Binary { lhs, rhs, .. } => assert_eq!((*lhs, *rhs), (row, Value::Imm(i))),
            other => panic!("row_index_plus{} defined by {}", i, other),
        }
    }
    // No remainder by the row length anywhere; the major coordinate is a
    // plain division.
    assert_eq!(
        k.count_ops(|op| matches!(op, KIROp::Binary { op: BinOp::URem, .. })),
        0
    );
    match def(k, e.indices[0].coord(0)) {
        KIROp::Binary { op, rhs, .. } => assert_eq!((*op, *rhs), (BinOp::UDiv, Value::Imm(128))),
        other => panic!("major coordinate defined by {}", other),
    }
}

// ─── Unrolling ─────────────────────────────────────────────────────

#[test]
fn test_unrolled_indices_are_consecutive() {
    let e = emit_copy(&Shape::new(vec![1024]), &LaunchDimensions::linear(2, 128), 4, None);
    assert!(e.plan.single_pass);
    assert_eq!(e.indices.len(), 4);
    let base = named(&e.kernel, "linear_index_base");
    match def(&e.kernel, base) {
        KIROp::Binary { op, lhs, rhs, .. } => {
            assert_eq!((*op, *rhs), (BinOp::Mul, Value::Imm(4)));
            assert_eq!(*lhs, named(&e.kernel, "linear_index"));
        }
        other => panic!("base defined by {}", other),
    }
    assert_eq!(e.indices[0].linear(), base);
    for i in 1..4u64 {
        let linear = e.indices[i as usize].linear();
        assert_eq!(linear, named(&e.kernel, &format!("linear_index{}", i)));
        match def(&e.kernel, linear) {
            KIROp::Binary { op, lhs, rhs, .. } => {
                assert_eq!((*op, *lhs, *rhs), (BinOp::Add, base, Value::Imm(i)));
            }
            other => panic!("unrolled index defined by {}", other),
        }
    }
    // One check on the base covers all four.
    assert_eq!(cond_branches(&e.kernel), 1);
}

#[test]
fn test_unroll_tail_past_the_end_is_out_of_bounds() {
    // 10 elements, 4 per thread: thread 2 passes the check at 8 and
    // then writes 8..12.
    let spec = KernelSpec::new(
        "fusion",
        ElementOp::Copy,
        Shape::new(vec![10]),
        LaunchDimensions::linear(1, 4),
    )
    .with_unroll(4);
    let kernel = compile_kernel(&spec).unwrap();
    let err = simulate_kernel(&spec, &kernel).unwrap_err();
    assert!(err.message.contains("out of bounds"), "{}", err);
}

// ─── Emitted arithmetic ────────────────────────────────────────────

#[test]
fn test_hardware_ids_carry_ranges_and_assumption() {
    let e = emit_copy(&Shape::new(vec![1024]), &LaunchDimensions::linear(2, 512), 1, None);
    let k = &e.kernel;
    let ranges: Vec<(SpecialReg, Option<(u64, u64)>)> = k
        .ops()
        .filter_map(|op| match op {
            KIROp::ReadSpecial { sreg, range, .. } => Some((*sreg, *range)),
            _ => None,
        })
        .collect();
    assert_eq!(
        ranges,
        vec![
            (SpecialReg::BlockId(crate::kir::Axis::X), Some((0, 2))),
            (SpecialReg::ThreadId(crate::kir::Axis::X), Some((0, 512))),
        ]
    );

    let in_range = named(k, "linear_index_in_range");
    assert!(k.ops().any(|op| *op == KIROp::Assume(in_range)));
    match def(k, in_range) {
        KIROp::ICmp { lhs, rhs, .. } => {
            assert_eq!((*lhs, *rhs), (named(k, "linear_index"), Value::Imm(1024)));
        }
        other => panic!("assumption defined by {}", other),
    }
}

#[test]
fn test_index_arithmetic_is_no_wrap() {
    let e = emit_copy(&Shape::new(vec![4096]), &LaunchDimensions::linear(2, 128), 2, None);
    let adds_and_muls: Vec<ArithFlags> = e
        .kernel
        .ops()
        .filter_map(|op| match op {
            KIROp::Binary {
                op: BinOp::Add | BinOp::Mul,
                flags,
                ..
            } => Some(*flags),
            _ => None,
        })
        .collect();
    assert!(!adds_and_muls.is_empty());
    assert!(adds_and_muls.iter().all(|f| *f == ArithFlags::NO_WRAP));
}

#[test]
fn test_index_width() {
    let shape = Shape::new(vec![1024]);
    let launch = LaunchDimensions::linear(2, 512);

    let wide = emit_copy(&shape, &launch, 1, None);
    let casts = wide.kernel.count_ops(|op| matches!(op, KIROp::Cast { op: CastOp::ZExt, .. }));
    assert_eq!(casts, 2);
    assert_eq!(wide.indices[0].index_type(), DEFAULT_INDEX_TYPE);

    let narrow = emit_copy(&shape, &launch, 1, Some(IntType::I32));
    assert_eq!(narrow.kernel.count_ops(|op| matches!(op, KIROp::Cast { .. })), 0);
    assert_eq!(narrow.indices[0].index_type(), IntType::I32);
}

#[test]
fn test_emission_is_deterministic() {
    let shape = Shape::row_major(vec![8, 128]);
    let launch = LaunchDimensions::linear(1, 32);
    let a = emit_copy(&shape, &launch, 4, None);
    let b = emit_copy(&shape, &launch, 4, None);
    assert_eq!(a.kernel.listing(), b.kernel.listing());
    assert_eq!(a.kernel.fingerprint(), b.kernel.fingerprint());

    let c = emit_copy(&shape, &launch, 2, None);
    assert_ne!(a.kernel.fingerprint(), c.kernel.fingerprint());
}

// ─── Cursor placement ──────────────────────────────────────────────

#[test]
fn test_single_pass_leaves_cursor_at_if_exit() {
    let e = emit_copy(&Shape::new(vec![512]), &LaunchDimensions::linear(1, 512), 1, None);
    let after = block_named(&e.kernel, "fusion.in_bounds-after");
    assert_eq!(e.exit, Some(after));
    assert_eq!(e.cursor, InsertPoint { block: after, index: 0 });
    assert_eq!(e.kernel.block(after).terminator, Some(Terminator::Ret));
}

#[test]
fn test_looped_leaves_cursor_at_loop_exit() {
    let e = emit_copy(&Shape::new(vec![4096]), &LaunchDimensions::linear(1, 256), 1, None);
    let exit = block_named(&e.kernel, "fusion.loop_exit");
    assert_eq!(e.exit, Some(exit));
    assert_eq!(e.cursor, InsertPoint { block: exit, index: 0 });
    assert_eq!(e.kernel.block(exit).terminator, Some(Terminator::Ret));
    // The in-bounds join stays inside the loop.
    let join = block_named(&e.kernel, "fusion.in_bounds-after");
    let header = block_named(&e.kernel, "fusion.loop_header");
    assert_eq!(e.kernel.block(join).terminator, Some(Terminator::Br(header)));
}

#[test]
fn test_consecutive_emissions_compose() {
    let shape = Shape::new(vec![3000]);
    let launch = LaunchDimensions::linear(2, 256);
    let mut b = KernelBuilder::new("two", GpuTarget::Nvptx);
    b.add_param("in0", shape.clone(), ParamAccess::Read);
    b.add_param("out", shape.clone(), ParamAccess::Write);
    b.add_param("out2", shape.clone(), ParamAccess::Write);

    for (name, target, unroll) in [("first", "out", 1), ("second", "out2", 4)] {
        let input = IrArray::new("in0", shape.clone());
        let output = IrArray::new(target, shape.clone());
        let body: BodyEmitter<'_, Diagnostic> = Box::new(move |b: &mut KernelBuilder, index: &LogicalIndex| {
            let v = input.emit_read_array_element(b, index, "");
            output.emit_write_array_element(b, index, v);
            Ok(())
        });
        ParallelLoopEmitter::new(body, &shape, &launch, &GpuTarget::Nvptx, unroll)
            .emit_loop(&mut b, name, None)
            .unwrap();
    }
    b.comment("done");
    let kernel = b.finish();
    verify(&kernel).unwrap();

    // The trailing comment lands after the second construct, before `ret`.
    let last = block_named(&kernel, "second.loop_exit");
    assert_eq!(kernel.block(last).ops, vec![KIROp::Comment("done".to_string())]);

    let memory = Memory::new()
        .with_array("in0", (0..3000).map(|i| i as f32).collect())
        .with_array("out", vec![0.0; 3000])
        .with_array("out2", vec![0.0; 3000]);
    let trace = simulate(&kernel, &launch, &memory).unwrap();
    assert_eq!(trace.store_counts("out", 3000), vec![1; 3000]);
    assert_eq!(trace.store_counts("out2", 3000), vec![1; 3000]);
}

// ─── Body failures ─────────────────────────────────────────────────

fn failing_body<'a>(calls: &'a mut u32, fail_at: u32) -> BodyEmitter<'a, String> {
    Box::new(move |_b: &mut KernelBuilder, _index: &LogicalIndex| {
        *calls += 1;
        if *calls == fail_at {
            Err(format!("body failed at call {}", fail_at))
        } else {
            Ok(())
        }
    })
}

#[test]
fn test_body_error_stops_single_pass() {
    let mut calls = 0;
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    let result = {
        let mut emitter = ParallelLoopEmitter::new(
            failing_body(&mut calls, 2),
            &Shape::new(vec![1024]),
            &LaunchDimensions::linear(1, 256),
            &GpuTarget::Nvptx,
            4,
        );
        emitter.emit_loop(&mut b, "k", None)
    };
    assert_eq!(result, Err("body failed at call 2".to_string()));
    assert_eq!(calls, 2);
}

#[test]
fn test_body_error_stops_looped_emission() {
    let mut calls = 0;
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    let result = {
        let mut emitter = ParallelLoopEmitter::new(
            failing_body(&mut calls, 1),
            &Shape::new(vec![1 << 20]),
            &LaunchDimensions::linear(4, 256),
            &GpuTarget::Nvptx,
            2,
        );
        assert!(!emitter.plan().single_pass);
        emitter.emit_loop(&mut b, "k", None)
    };
    assert_eq!(result, Err("body failed at call 1".to_string()));
    assert_eq!(calls, 1);
}

#[test]
fn test_body_error_stops_serial_loop() {
    let mut calls = 0;
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    let result = LoopEmitter::new(failing_body(&mut calls, 1), &Shape::new(vec![16])).emit_loop(&mut b, "k", None);
    assert!(result.is_err());
}

// ─── Preconditions ─────────────────────────────────────────────────

#[test]
#[should_panic(expected = "unroll factor must be at least 1")]
fn test_zero_unroll_panics() {
    let body: BodyEmitter<'_, Diagnostic> = Box::new(|_b: &mut KernelBuilder, _i: &LogicalIndex| Ok(()));
    let _ = ParallelLoopEmitter::new(
        body,
        &Shape::new(vec![8]),
        &LaunchDimensions::linear(1, 8),
        &GpuTarget::Nvptx,
        0,
    );
}

#[test]
#[should_panic(expected = "grid step of 16 threads times unroll factor 4611686018427387904 overflows u64")]
fn test_overflowing_grid_step_panics() {
    let _ = plan_parallel_loop(&Shape::new(vec![64]), &LaunchDimensions::linear(4, 4), 1 << 62);
}

#[test]
#[should_panic(expected = "does not fit index type i32")]
fn test_narrow_index_type_panics() {
    let _ = emit_copy(
        &Shape::new(vec![1 << 31]),
        &LaunchDimensions::linear(1, 256),
        1,
        Some(IntType::I32),
    );
}

#[test]
#[should_panic(expected = "threads per block along x exceed the hardware limit")]
fn test_oversized_block_panics() {
    let _ = emit_copy(&Shape::new(vec![4096]), &LaunchDimensions::linear(1, 2048), 1, None);
}

#[test]
#[should_panic(expected = "partial index has rank 1")]
fn test_partial_index_rank_mismatch_panics() {
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    let _ = LogicalIndex::with_partial(
        Value::Imm(0),
        vec![None],
        &Shape::new(vec![2, 2]),
        IntType::I64,
        &mut b,
    );
}

// ─── Index derivation and addressing ───────────────────────────────

#[test]
fn test_delinearize_skips_unit_divisor_and_major_remainder() {
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    let linear = Value::Reg(b.fresh_reg(crate::kir::RegType::Int(IntType::I64), "linear"));
    let index = LogicalIndex::from_linear(linear, &Shape::row_major(vec![2, 3, 4]), IntType::I64, &mut b);
    let k = b.finish();
    assert_eq!(k.count_ops(|op| matches!(op, KIROp::Binary { op: BinOp::UDiv, .. })), 2);
    assert_eq!(k.count_ops(|op| matches!(op, KIROp::Binary { op: BinOp::URem, .. })), 2);
    // Minor-most: a remainder of the linear index itself.
    match def(&k, index.coord(2)) {
        KIROp::Binary { op, lhs, rhs, .. } => assert_eq!((*op, *lhs, *rhs), (BinOp::URem, linear, Value::Imm(4))),
        other => panic!("{}", other),
    }
    // Major-most: a division with no remainder.
    match def(&k, index.coord(0)) {
        KIROp::Binary { op, rhs, .. } => assert_eq!((*op, *rhs), (BinOp::UDiv, Value::Imm(12))),
        other => panic!("{}", other),
    }
}

#[test]
fn test_partial_index_keeps_given_coordinates() {
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    let index = LogicalIndex::with_partial(
        Value::Imm(13),
        vec![None, Some(Value::Imm(1))],
        &Shape::row_major(vec![4, 6]),
        IntType::I64,
        &mut b,
    );
    assert_eq!(index.coord(1), Value::Imm(1));
    assert_eq!(index.rank(), 2);
    assert_eq!(b.kernel().count_ops(|_| true), 1);
}

#[test]
fn test_rank_zero_index() {
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    let index = LogicalIndex::from_linear(Value::Imm(0), &Shape::new(vec![]), IntType::I64, &mut b);
    assert_eq!(index.rank(), 0);
    assert_eq!(b.kernel().count_ops(|_| true), 0);
}

#[test]
fn test_array_address_reuses_linear_for_same_layout() {
    let shape = Shape::row_major(vec![4, 6]);
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    b.add_param("a", shape.clone(), ParamAccess::Read);
    let linear = Value::Reg(b.fresh_reg(crate::kir::RegType::Int(IntType::I64), ""));
    let index = LogicalIndex::from_linear(linear, &shape, IntType::I64, &mut b);
    let before = b.kernel().count_ops(|_| true);
    let addr = IrArray::new("a", shape).emit_address(&mut b, &index);
    assert_eq!(addr, linear);
    assert_eq!(b.kernel().count_ops(|_| true), before);
}

#[test]
fn test_array_address_for_transposed_layout() {
    let out = Shape::row_major(vec![4, 6]);
    let input = Shape::with_layout(vec![4, 6], Layout::col_major(2));
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    b.add_param("a", input.clone(), ParamAccess::Read);
    let index = LogicalIndex::with_partial(
        Value::Imm(0),
        vec![Some(Value::Imm(3)), Some(Value::Imm(5))],
        &out,
        IntType::I64,
        &mut b,
    );
    let array = IrArray::new("a", input);
    let addr = array.emit_address(&mut b, &index);
    // coord0 * 1 + coord1 * 4
    let k = b.finish();
    match def(&k, addr) {
        KIROp::Binary { op, lhs, rhs, flags, .. } => {
            assert_eq!((*op, *lhs), (BinOp::Add, Value::Imm(3)));
            assert_eq!(*flags, ArithFlags::NO_WRAP);
            match def(&k, *rhs) {
                KIROp::Binary { op, lhs, rhs, .. } => {
                    assert_eq!((*op, *lhs, *rhs), (BinOp::Mul, Value::Imm(5), Value::Imm(4)));
                }
                other => panic!("{}", other),
            }
        }
        other => panic!("{}", other),
    }
}

// ─── Serial emitter ────────────────────────────────────────────────

#[test]
fn test_serial_loop_covers_every_element() {
    let shape = Shape::row_major(vec![3, 4]);
    let mut b = KernelBuilder::new("serial", GpuTarget::Nvptx);
    b.add_param("in0", shape.clone(), ParamAccess::Read);
    b.add_param("out", shape.clone(), ParamAccess::Write);
    let input = IrArray::new("in0", shape.clone());
    let generator: ElementGenerator<'_, Diagnostic> = Box::new(move |b: &mut KernelBuilder, index: &LogicalIndex| {
        let x = input.emit_read_array_element(b, index, "x");
        Ok(vec![b.float(FloatOp::Neg, vec![x], "")])
    });
    let mut emitter = LoopEmitter::from_element_generator(generator, vec![IrArray::new("out", shape.clone())]);
    assert_eq!(emitter.shape(), &shape);
    emitter.emit_loop(&mut b, "serial", None).unwrap();
    let exit = emitter.exit_block().unwrap();
    assert_eq!(b.insert_point(), InsertPoint { block: exit, index: 0 });
    let kernel = b.finish();
    assert_eq!(kernel.block(exit).name, "serial.loop_exit");
    assert!(has_loops(&kernel));
    assert_eq!(kernel.count_ops(|op| matches!(op, KIROp::ReadSpecial { .. })), 0);
    verify(&kernel).unwrap();

    let memory = Memory::new()
        .with_array("in0", (0..12).map(|i| i as f32).collect())
        .with_array("out", vec![0.0; 12]);
    let trace = simulate(&kernel, &LaunchDimensions::linear(1, 1), &memory).unwrap();
    let mut out = memory.clone();
    trace.apply(&mut out);
    let expected: Vec<f32> = (0..12).map(|i| -(i as f32)).collect();
    assert_eq!(out.get("out").unwrap(), expected.as_slice());
}

#[test]
#[should_panic(expected = "serial loop emission does not take a base index")]
fn test_serial_rejects_base_index() {
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    let body: BodyEmitter<'_, Diagnostic> = Box::new(|_b: &mut KernelBuilder, _i: &LogicalIndex| Ok(()));
    let mut emitter = LoopEmitter::new(body, &Shape::new(vec![4]));
    emitter.emit_index_and_set_exit_block(&mut b, "k", IntType::I64, Some(Value::Imm(0)));
}

// ─── Element generators ────────────────────────────────────────────

#[test]
fn test_generator_writes_every_target() {
    let shape = Shape::new(vec![256]);
    let launch = LaunchDimensions::linear(1, 64);
    let mut b = KernelBuilder::new("multi", GpuTarget::Amdgpu);
    b.add_param("in0", shape.clone(), ParamAccess::Read);
    b.add_param("out", shape.clone(), ParamAccess::Write);
    b.add_param("neg", shape.clone(), ParamAccess::Write);
    let input = IrArray::new("in0", shape.clone());
    let generator: ElementGenerator<'_, Diagnostic> = Box::new(move |b: &mut KernelBuilder, index: &LogicalIndex| {
        let x = input.emit_read_array_element(b, index, "x");
        let n = b.float(FloatOp::Neg, vec![x], "");
        Ok(vec![x, n])
    });
    let targets = vec![IrArray::new("out", shape.clone()), IrArray::new("neg", shape.clone())];
    ParallelLoopEmitter::from_element_generator(generator, targets, &launch, &GpuTarget::Amdgpu, 2)
        .emit_loop(&mut b, "multi", None)
        .unwrap();
    let kernel = b.finish();
    verify(&kernel).unwrap();

    let memory = Memory::new()
        .with_array("in0", (0..256).map(|i| i as f32).collect())
        .with_array("out", vec![0.0; 256])
        .with_array("neg", vec![0.0; 256]);
    let trace = simulate(&kernel, &launch, &memory).unwrap();
    let mut result = memory.clone();
    trace.apply(&mut result);
    assert_eq!(result.get("out").unwrap(), memory.get("in0").unwrap());
    assert_eq!(result.get("neg").unwrap()[255], -255.0);
    assert_eq!(trace.store_counts("neg", 256), vec![1; 256]);
}

#[test]
#[should_panic(expected = "element generator produced 1 values for 2 target arrays")]
fn test_generator_value_count_must_match_targets() {
    let shape = Shape::new(vec![4]);
    let mut b = KernelBuilder::new("k", GpuTarget::Nvptx);
    b.add_param("in0", shape.clone(), ParamAccess::Read);
    b.add_param("a", shape.clone(), ParamAccess::Write);
    b.add_param("b", shape.clone(), ParamAccess::Write);
    let input = IrArray::new("in0", shape.clone());
    let generator: ElementGenerator<'_, Diagnostic> = Box::new(move |b: &mut KernelBuilder, index: &LogicalIndex| {
        Ok(vec![input.emit_read_array_element(b, index, "")])
    });
    let targets = vec![IrArray::new("a", shape.clone()), IrArray::new("b", shape)];
    let _ = ParallelLoopEmitter::from_element_generator(generator, targets, &LaunchDimensions::linear(1, 4), &GpuTarget::Nvptx, 1)
        .emit_loop(&mut b, "k", None);
}

// ─── End-to-end coverage ───────────────────────────────────────────

#[test]
fn test_every_geometry_writes_each_element_once() {
    let cases = [
        // covered in one pass
        add_spec(Shape::new(vec![1024]), 2, 512, 1),
        // grid-stride loop
        add_spec(Shape::new(vec![4096]), 2, 512, 1),
        add_spec(Shape::new(vec![4096]), 2, 128, 4),
        // partially masked last trip
        add_spec(Shape::new(vec![3000]), 3, 128, 1),
        // row-optimized, single block and looped over two blocks
        add_spec(Shape::row_major(vec![8, 128]), 1, 32, 4),
        add_spec(Shape::row_major(vec![8, 128]), 2, 32, 4),
        // column-major output
        add_spec(Shape::with_layout(vec![6, 10], Layout::col_major(2)), 1, 16, 1),
        // rank 3, no explicit layout
        add_spec(Shape::new(vec![3, 5, 7]), 3, 32, 1),
        add_spec(Shape::new(vec![2, 4, 8]), 1, 8, 4),
        // row-optimized with a 32-bit index
        add_spec(Shape::row_major(vec![16, 64]), 4, 16, 4).with_index_type(IntType::I32),
        // inputs in a different physical order than the output
        add_spec(Shape::row_major(vec![12, 20]), 2, 32, 2)
            .with_input_shape(Shape::with_layout(vec![12, 20], Layout::col_major(2))),
        // no elements
        add_spec(Shape::new(vec![0, 4]), 1, 32, 1),
    ];
    for spec in &cases {
        let kernel = compile_kernel(spec).unwrap();
        let report = simulate_kernel(spec, &kernel).unwrap();
        assert!(
            report.is_exact(),
            "{} {} unroll {}: {:?}",
            spec.shape,
            spec.launch,
            spec.unroll,
            report
        );
        assert_eq!(report.stores, spec.shape.element_count());
    }
}
