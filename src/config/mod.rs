//! Kernel descriptions from `gridloop.toml`.
//!
//! ```toml
//! [kernel]
//! name = "fusion"
//! op = "add"
//! index_bits = 64
//! unroll = 4
//! target = "nvptx"
//!
//! [shape]
//! dims = [8, 128]
//! minor_to_major = [1, 0]
//!
//! [launch]
//! blocks = 1
//! threads = [128, 1, 1]
//! ```
//!
//! `KernelConfig` is the file as written; `resolve` validates it and
//! produces a `KernelSpec` ready for `compile_kernel`. Command-line
//! overrides are layered on top before resolution.


use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Spanned;

use crate::diagnostic::Diagnostic;
use crate::kir::target::{GpuTarget, HardwareIds};
use crate::kir::{Axis, IntType};
use crate::launch::{Dim3, LaunchDimensions};
use crate::shape::{Layout, Shape};
use crate::span::Span;

pub const CONFIG_FILE_NAME: &str = "gridloop.toml";

// ─── Element operations ────────────────────────────────────────────

/// The per-element computation of a generated kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementOp {
    Copy,
    Neg,
    Add,
    Mul,
}

impl ElementOp {
    pub fn name(self) -> &'static str {
        match self {
            ElementOp::Copy => "copy",
            ElementOp::Neg => "neg",
            ElementOp::Add => "add",
            ElementOp::Mul => "mul",
        }
    }

    pub fn parse(name: &str) -> Option<ElementOp> {
        ElementOp::all().iter().copied().find(|op| op.name() == name)
    }

    pub fn all() -> &'static [ElementOp] {
        &[ElementOp::Copy, ElementOp::Neg, ElementOp::Add, ElementOp::Mul]
    }

    /// Number of input arrays.
    pub fn arity(self) -> usize {
        match self {
            ElementOp::Copy | ElementOp::Neg => 1,
            ElementOp::Add | ElementOp::Mul => 2,
        }
    }

    /// Host-side value for one element.
    pub fn apply(self, args: &[f32]) -> f32 {
        match self {
            ElementOp::Copy => args[0],
            ElementOp::Neg => -args[0],
            ElementOp::Add => args[0] + args[1],
            ElementOp::Mul => args[0] * args[1],
        }
    }
}

// ─── File format ───────────────────────────────────────────────────

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    pub kernel: KernelSection,
    pub shape: ShapeSection,
    pub launch: LaunchSection,
    #[serde(skip)]
    overrides: Overrides,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelSection {
    #[serde(default = "default_kernel_name")]
    pub name: String,
    pub op: Option<Spanned<String>>,
    pub index_bits: Option<Spanned<u32>>,
    pub unroll: Option<Spanned<u64>>,
    pub target: Option<Spanned<String>>,
}

fn default_kernel_name() -> String {
    "fusion".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShapeSection {
    pub dims: Spanned<Vec<u64>>,
    /// Layout of the output; absent means no explicit layout.
    pub minor_to_major: Option<Spanned<Vec<usize>>>,
    /// Layout of the inputs when it differs from the output's.
    pub input_minor_to_major: Option<Spanned<Vec<usize>>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchSection {
    pub blocks: Spanned<Extent>,
    pub threads: Spanned<Extent>,
}

/// A launch extent: a single x count or up to three axes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Extent {
    X(u64),
    Axes(Vec<u64>),
}

impl Extent {
    fn axes(&self) -> Vec<u64> {
        match self {
            Extent::X(x) => vec![*x],
            Extent::Axes(axes) => axes.clone(),
        }
    }
}

/// Values given on the command line; each replaces the file's value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Overrides {
    pub unroll: Option<u64>,
    pub blocks: Option<Vec<u64>>,
    pub threads: Option<Vec<u64>>,
    pub index_bits: Option<u32>,
    pub target: Option<String>,
}

/// A validated kernel description.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelSpec {
    pub name: String,
    pub op: ElementOp,
    pub index_type: IntType,
    pub unroll: u64,
    pub target: GpuTarget,
    /// Output shape; also the iteration space.
    pub shape: Shape,
    pub input_shape: Shape,
    pub launch: LaunchDimensions,
}

impl KernelSpec {
    /// A kernel over `shape` with default settings.
    pub fn new(name: &str, op: ElementOp, shape: Shape, launch: LaunchDimensions) -> Self {
        Self {
            name: name.to_string(),
            op,
            index_type: IntType::I64,
            unroll: 1,
            target: GpuTarget::default(),
            input_shape: shape.clone(),
            shape,
            launch,
        }
    }

    pub fn with_unroll(mut self, unroll: u64) -> Self {
        self.unroll = unroll;
        self
    }

    pub fn with_index_type(mut self, index_type: IntType) -> Self {
        self.index_type = index_type;
        self
    }

    pub fn with_input_shape(mut self, input_shape: Shape) -> Self {
        self.input_shape = input_shape;
        self
    }

    pub fn with_target(mut self, target: GpuTarget) -> Self {
        self.target = target;
        self
    }
}

fn span_of(range: Range<usize>) -> Span {
    Span::from(range)
}

fn spanned_error(message: String, range: Option<Range<usize>>) -> Diagnostic {
    Diagnostic::error(message, range.map(span_of).unwrap_or_else(Span::dummy))
}

impl std::str::FromStr for KernelConfig {
    type Err = Diagnostic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KernelConfig::parse(s)
    }
}

impl KernelConfig {
    pub fn parse(source: &str) -> Result<KernelConfig, Diagnostic> {
        toml::from_str(source).map_err(|e| {
            spanned_error(
                format!("failed to parse {}: {}", CONFIG_FILE_NAME, e.message()),
                e.span(),
            )
        })
    }

    /// Load a config file from disk.
    pub fn load(path: &Path) -> Result<KernelConfig, Diagnostic> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Diagnostic::error(
                format!("cannot read '{}': {}", path.display(), e),
                Span::dummy(),
            )
        })?;
        Self::parse(&content)
    }

    /// Try to find a gridloop.toml in the given directory or its ancestors.
    pub fn find(start_dir: &Path) -> Option<PathBuf> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        self.overrides = overrides;
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    /// Validate and produce the kernel description. All problems are
    /// reported together.
    pub fn resolve(&self) -> Result<KernelSpec, Vec<Diagnostic>> {
        let mut errors = Vec::new();
        let k = &self.kernel;

        let op = match &k.op {
            None => Some(ElementOp::Copy),
            Some(op) => {
                let parsed = ElementOp::parse(op.get_ref());
                if parsed.is_none() {
                    let names: Vec<&str> = ElementOp::all().iter().map(|o| o.name()).collect();
                    errors.push(
                        spanned_error(format!("unknown op '{}'", op.get_ref()), Some(op.span()))
                            .with_help(format!("expected one of: {}", names.join(", "))),
                    );
                }
                parsed
            }
        };

        let target = match (&self.overrides.target, &k.target) {
            (Some(name), _) => Self::parse_target(name, None, &mut errors),
            (None, Some(t)) => Self::parse_target(t.get_ref(), Some(t.span()), &mut errors),
            (None, None) => Some(GpuTarget::default()),
        };

        let (bits, bits_span) = match (self.overrides.index_bits, &k.index_bits) {
            (Some(bits), _) => (bits, None),
            (None, Some(b)) => (*b.get_ref(), Some(b.span())),
            (None, None) => (64, None),
        };
        let index_type = match IntType::from_bits(bits) {
            Some(ty @ (IntType::I32 | IntType::I64)) => Some(ty),
            _ => {
                errors.push(
                    spanned_error(format!("unsupported index width {}", bits), bits_span)
                        .with_help("index_bits must be 32 or 64".to_string()),
                );
                None
            }
        };

        let (unroll, unroll_span) = match (self.overrides.unroll, &k.unroll) {
            (Some(u), _) => (u, None),
            (None, Some(u)) => (*u.get_ref(), Some(u.span())),
            (None, None) => (1, None),
        };
        if unroll == 0 {
            errors.push(
                spanned_error("unroll factor must be at least 1".to_string(), unroll_span.clone())
                    .with_help("set `unroll = 1` to disable unrolling".to_string()),
            );
        }

        let dims = self.shape.dims.get_ref().clone();
        let shape = Self::layout_for(&dims, self.shape.minor_to_major.as_ref(), &mut errors)
            .map(|layout| match layout {
                Some(layout) => Shape::with_layout(dims.clone(), layout),
                None => Shape::new(dims.clone()),
            });
        let input_shape = match &self.shape.input_minor_to_major {
            None => shape.clone(),
            Some(m2m) => Self::layout_for(&dims, Some(m2m), &mut errors).map(|layout| match layout {
                Some(layout) => Shape::with_layout(dims.clone(), layout),
                None => Shape::new(dims.clone()),
            }),
        };

        let blocks = match &self.overrides.blocks {
            Some(axes) => Self::dim3("blocks", axes, None, &mut errors),
            None => Self::dim3(
                "blocks",
                &self.launch.blocks.get_ref().axes(),
                Some(self.launch.blocks.span()),
                &mut errors,
            ),
        };
        let threads = match &self.overrides.threads {
            Some(axes) => Self::dim3("threads", axes, None, &mut errors),
            None => Self::dim3(
                "threads",
                &self.launch.threads.get_ref().axes(),
                Some(self.launch.threads.span()),
                &mut errors,
            ),
        };

        if let (Some(target), Some(blocks), Some(threads)) = (target, blocks, threads) {
            Self::check_target_limits(target, blocks, threads, &mut errors);
        }

        let elements = shape.as_ref().and_then(|shape| {
            let count = shape.checked_element_count();
            if count.is_none() {
                errors.push(
                    spanned_error(
                        format!("shape {} has more than u64::MAX elements", shape),
                        Some(self.shape.dims.span()),
                    )
                    .with_help("split the computation into smaller kernels".to_string()),
                );
            }
            count
        });

        if let (Some(blocks), Some(threads)) = (blocks, threads) {
            let step = blocks
                .checked_product()
                .and_then(|b| b.checked_mul(threads.checked_product()?))
                .and_then(|t| t.checked_mul(unroll.max(1)));
            match (step, elements, index_type) {
                (None, _, _) => errors.push(
                    spanned_error(
                        format!(
                            "grid step overflows: {} blocks of {} threads unrolled {} times exceed u64::MAX",
                            blocks, threads, unroll
                        ),
                        unroll_span,
                    )
                    .with_help("reduce `unroll` or the launch size".to_string()),
                ),
                (Some(step), Some(elements), Some(index_type)) => {
                    if elements.saturating_add(step) > index_type.max_signed() {
                        errors.push(
                            Diagnostic::error(
                                format!(
                                    "{} elements with a grid step of {} do not fit a {}-bit index",
                                    elements,
                                    step,
                                    index_type.bits()
                                ),
                                Span::dummy(),
                            )
                            .with_help("use `index_bits = 64`".to_string()),
                        );
                    }
                }
                _ => {}
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        match (op, target, index_type, shape, input_shape, blocks, threads) {
            (
                Some(op),
                Some(target),
                Some(index_type),
                Some(shape),
                Some(input_shape),
                Some(blocks),
                Some(threads),
            ) => Ok(KernelSpec {
                name: k.name.clone(),
                op,
                index_type,
                unroll,
                target,
                shape,
                input_shape,
                launch: LaunchDimensions::new(blocks, threads),
            }),
            _ => Err(vec![Diagnostic::error(
                "invalid kernel configuration".to_string(),
                Span::dummy(),
            )]),
        }
    }

    /// Problems that do not stop compilation.
    pub fn warnings(&self) -> Vec<Diagnostic> {
        let mut warnings = Vec::new();
        for (what, extent, over) in [
            ("blocks", &self.launch.blocks, &self.overrides.blocks),
            ("threads", &self.launch.threads, &self.overrides.threads),
        ] {
            let axes = over.clone().unwrap_or_else(|| extent.get_ref().axes());
            if axes.iter().skip(1).any(|&n| n > 1) {
                let span = if over.is_some() { None } else { Some(extent.span()) };
                warnings.push(
                    Diagnostic::warning(
                        format!("{} use the y or z axis", what),
                        span.map(span_of).unwrap_or_else(Span::dummy),
                    )
                    .with_note("element indices are derived from the x axis only".to_string())
                    .with_help("threads that differ only in y or z repeat the same elements".to_string()),
                );
            }
        }
        warnings
    }

    fn parse_target(
        name: &str,
        span: Option<Range<usize>>,
        errors: &mut Vec<Diagnostic>,
    ) -> Option<GpuTarget> {
        let target = GpuTarget::parse(name);
        if target.is_none() {
            let names: Vec<&str> = GpuTarget::all().iter().map(|t| t.name()).collect();
            errors.push(
                spanned_error(format!("unknown target '{}'", name), span)
                    .with_help(format!("expected one of: {}", names.join(", "))),
            );
        }
        target
    }

    /// `Some(None)` when no layout was given, `None` when it is invalid.
    fn layout_for(
        dims: &[u64],
        m2m: Option<&Spanned<Vec<usize>>>,
        errors: &mut Vec<Diagnostic>,
    ) -> Option<Option<Layout>> {
        let Some(m2m) = m2m else {
            return Some(None);
        };
        let layout = Layout::new(m2m.get_ref().clone());
        if !layout.is_permutation_of(dims.len()) {
            errors.push(
                spanned_error(
                    format!(
                        "layout {} is not a permutation of the {} dimensions",
                        layout,
                        dims.len()
                    ),
                    Some(m2m.span()),
                )
                .with_help(format!(
                    "list every dimension from 0 to {} exactly once, minor-most first",
                    dims.len().saturating_sub(1)
                )),
            );
            return None;
        }
        Some(Some(layout))
    }

    fn dim3(
        what: &str,
        axes: &[u64],
        span: Option<Range<usize>>,
        errors: &mut Vec<Diagnostic>,
    ) -> Option<Dim3> {
        if axes.is_empty() || axes.len() > 3 {
            errors.push(spanned_error(
                format!("{} must have one to three axes, got {}", what, axes.len()),
                span,
            ));
            return None;
        }
        if axes.contains(&0) {
            errors.push(
                spanned_error(format!("{} must be non-zero on every axis", what), span)
                    .with_note(format!("got {:?}", axes)),
            );
            return None;
        }
        let at = |i: usize| axes.get(i).copied().unwrap_or(1);
        Some(Dim3::new(at(0), at(1), at(2)))
    }

    fn check_target_limits(target: GpuTarget, blocks: Dim3, threads: Dim3, errors: &mut Vec<Diagnostic>) {
        for (axis, b, t) in [
            (Axis::X, blocks.x, threads.x),
            (Axis::Y, blocks.y, threads.y),
            (Axis::Z, blocks.z, threads.z),
        ] {
            if b > target.max_block_count(axis) {
                errors.push(Diagnostic::error(
                    format!(
                        "{} blocks along {} exceed the {} limit of {}",
                        b,
                        axis,
                        target.name(),
                        target.max_block_count(axis)
                    ),
                    Span::dummy(),
                ));
            }
            if t > target.max_threads_per_block(axis) {
                errors.push(Diagnostic::error(
                    format!(
                        "{} threads per block along {} exceed the {} limit of {}",
                        t,
                        axis,
                        target.name(),
                        target.max_threads_per_block(axis)
                    ),
                    Span::dummy(),
                ));
            }
        }
        match threads.checked_product() {
            Some(per_block) if per_block <= 1024 => {}
            per_block => errors.push(Diagnostic::error(
                format!(
                    "{} threads per block exceed the limit of 1024",
                    per_block.map_or_else(|| threads.to_string(), |n| n.to_string())
                ),
                Span::dummy(),
            )),
        }
    }
}
