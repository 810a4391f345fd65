//! gridloop: grid/block/thread index emission for elementwise GPU kernels.
//!
//! ```text
//! gridloop.toml → KernelSpec → ParallelLoopEmitter → KIR → verify → text | cuda
//!                                                      ↘ simulate (every block × thread)
//! ```

pub mod config;
pub mod diagnostic;
pub mod emit;
pub mod kir;
pub mod launch;
pub mod shape;
pub mod span;

use tracing::{debug, info};

pub use config::{ElementOp, KernelConfig, KernelSpec, Overrides};
pub use diagnostic::Diagnostic;
pub use emit::{IndexEmitter, IrArray, LogicalIndex, LoopEmitter, ParallelLoopEmitter};
pub use kir::Kernel;
pub use launch::{Dim3, LaunchDimensions};
pub use shape::{Layout, Shape};

use emit::ElementGenerator;
use kir::builder::KernelBuilder;
use kir::eval::{simulate, Memory};
use kir::lower::create_kernel_lowering;
use kir::{FloatOp, ParamAccess, Reg};
use span::Span;

/// Name of the output parameter of generated kernels.
pub const OUTPUT_PARAM: &str = "out";

/// Name of the `i`-th input parameter.
pub fn input_param(i: usize) -> String {
    format!("in{}", i)
}

// ─── Compilation ───────────────────────────────────────────────────

/// Build the KIR kernel for `spec`: one parallel loop over the output
/// shape whose body reads each input, applies the op, and stores.
pub fn compile_kernel(spec: &KernelSpec) -> Result<Kernel, Diagnostic> {
    if spec.unroll == 0 {
        return Err(Diagnostic::error(
            "unroll factor must be at least 1".to_string(),
            Span::dummy(),
        ));
    }
    if spec
        .launch
        .checked_launch_bound()
        .and_then(|threads| threads.checked_mul(spec.unroll))
        .is_none()
    {
        return Err(Diagnostic::error(
            format!(
                "grid step overflows: launch {} unrolled {} times exceeds u64::MAX",
                spec.launch, spec.unroll
            ),
            Span::dummy(),
        ));
    }
    if spec.shape.checked_element_count().is_none() {
        return Err(Diagnostic::error(
            format!("shape {} has more than u64::MAX elements", spec.shape),
            Span::dummy(),
        ));
    }
    if spec.input_shape.dims() != spec.shape.dims() {
        return Err(Diagnostic::error(
            format!(
                "input shape {} does not match output shape {}",
                spec.input_shape, spec.shape
            ),
            Span::dummy(),
        ));
    }

    let mut b = KernelBuilder::new(&spec.name, spec.target);
    let inputs: Vec<IrArray> = (0..spec.op.arity())
        .map(|i| IrArray::new(&input_param(i), spec.input_shape.clone()))
        .collect();
    for input in &inputs {
        b.add_param(input.name(), input.shape().clone(), ParamAccess::Read);
    }
    b.add_param(OUTPUT_PARAM, spec.shape.clone(), ParamAccess::Write);

    let op = spec.op;
    let generator: ElementGenerator<'_, Diagnostic> = Box::new(move |b: &mut KernelBuilder, index: &LogicalIndex| {
        let args: Vec<Reg> = inputs
            .iter()
            .map(|input| input.emit_read_array_element(b, index, &format!("{}.elem", input.name())))
            .collect();
        let value = match op {
            ElementOp::Copy => args[0],
            ElementOp::Neg => b.float(FloatOp::Neg, args, "neg"),
            ElementOp::Add => b.float(FloatOp::Add, args, "sum"),
            ElementOp::Mul => b.float(FloatOp::Mul, args, "product"),
        };
        Ok(vec![value])
    });

    let mut emitter = ParallelLoopEmitter::from_element_generator(
        generator,
        vec![IrArray::new(OUTPUT_PARAM, spec.shape.clone())],
        &spec.launch,
        &spec.target,
        spec.unroll,
    );
    emitter.emit_loop(&mut b, &spec.name, Some(spec.index_type))?;
    let plan = emitter.plan();

    let kernel = b.finish();
    kir::verify::verify(&kernel).map_err(|errors| {
        errors.into_iter().fold(
            Diagnostic::error(
                format!("generated kernel '{}' failed verification", kernel.name),
                Span::dummy(),
            ),
            |diag, e| diag.with_note(e.message),
        )
    })?;

    info!(
        kernel = %kernel.name,
        blocks = kernel.blocks.len(),
        single_pass = plan.single_pass,
        row_index = plan.row_index,
        fingerprint = %kernel.fingerprint(),
        "compiled kernel"
    );
    Ok(kernel)
}

/// Compile `spec` and lower it with the named backend.
pub fn emit_kernel_source(spec: &KernelSpec, backend: &str) -> Result<String, Diagnostic> {
    let lowering = create_kernel_lowering(backend).ok_or_else(|| {
        Diagnostic::error(format!("unknown backend '{}'", backend), Span::dummy()).with_help(
            format!(
                "expected one of: {}",
                kir::lower::lowering_names().join(", ")
            ),
        )
    })?;
    let kernel = compile_kernel(spec)?;
    Ok(lowering.lower(&kernel))
}

// ─── Simulation ────────────────────────────────────────────────────

/// Outcome of running a compiled kernel on the simulated grid.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationReport {
    pub elements: u64,
    pub threads: u64,
    pub stores: u64,
    /// Blocks executed, summed over all threads.
    pub steps: u64,
    /// Output positions written more than once.
    pub duplicates: Vec<u64>,
    /// Output positions never written.
    pub missing: Vec<u64>,
    /// Output positions whose value differs from the host reference.
    pub mismatches: Vec<u64>,
}

impl SimulationReport {
    /// Every element written exactly once with the expected value.
    pub fn is_exact(&self) -> bool {
        self.duplicates.is_empty() && self.missing.is_empty() && self.mismatches.is_empty()
    }
}

/// Deterministic value of input `input` at logical row-major position `p`.
pub fn host_input_value(input: usize, p: u64) -> f32 {
    ((p * 7 + input as u64 * 13) % 101) as f32 * 0.5 - 25.0
}

/// Input buffers laid out in `spec.input_shape`'s physical order, an
/// empty output buffer, and the expected output in physical order.
pub fn host_reference(spec: &KernelSpec) -> (Memory, Vec<f32>) {
    let n = spec.shape.element_count() as usize;
    let logical = Shape::new(spec.shape.dims().to_vec());
    let mut memory = Memory::new();
    let mut inputs = vec![vec![0.0f32; n]; spec.op.arity()];
    for (i, buf) in inputs.iter_mut().enumerate() {
        for p in 0..n as u64 {
            let coords = logical.delinearize(p);
            buf[spec.input_shape.linearize(&coords) as usize] = host_input_value(i, p);
        }
    }
    let mut expected = vec![0.0f32; n];
    for p in 0..n as u64 {
        let coords = logical.delinearize(p);
        let args: Vec<f32> = (0..spec.op.arity()).map(|i| host_input_value(i, p)).collect();
        expected[spec.shape.linearize(&coords) as usize] = spec.op.apply(&args);
    }
    for (i, buf) in inputs.into_iter().enumerate() {
        memory.insert(&input_param(i), buf);
    }
    memory.insert(OUTPUT_PARAM, vec![0.0; n]);
    (memory, expected)
}

/// Run `kernel` (compiled from `spec`) over the whole launch and
/// compare its output with the host reference.
pub fn simulate_kernel(spec: &KernelSpec, kernel: &Kernel) -> Result<SimulationReport, Diagnostic> {
    let (mut memory, expected) = host_reference(spec);
    let trace = simulate(kernel, &spec.launch, &memory)?;
    debug!(threads = trace.threads, stores = trace.stores.len(), "simulated");

    let n = expected.len();
    let counts = trace.store_counts(OUTPUT_PARAM, n);
    trace.apply(&mut memory);
    let out = memory.get(OUTPUT_PARAM).unwrap_or(&[]);

    let mut report = SimulationReport {
        elements: n as u64,
        threads: trace.threads,
        stores: trace.stores_to(OUTPUT_PARAM).count() as u64,
        steps: trace.steps,
        duplicates: Vec::new(),
        missing: Vec::new(),
        mismatches: Vec::new(),
    };
    for (pos, &count) in counts.iter().enumerate() {
        match count {
            0 => report.missing.push(pos as u64),
            1 => {}
            _ => report.duplicates.push(pos as u64),
        }
        if count > 0 && out.get(pos) != Some(&expected[pos]) {
            report.mismatches.push(pos as u64);
        }
    }
    Ok(report)
}
