//! Hardware-identifier sources.
//!
//! The index emitters never construct special-register reads
//! themselves; they ask a `HardwareIds` implementation for the block
//! and thread ids and for the limits the hardware guarantees on them.

use super::builder::KernelBuilder;
use super::{Axis, Reg, SpecialReg};

/// Source of block/thread identifiers for one GPU target.
pub trait HardwareIds {
    /// Emit a read of the block id along `axis`. The result is i32.
    fn block_id(&self, b: &mut KernelBuilder, axis: Axis) -> Reg;

    /// Emit a read of the thread id (within its block) along `axis`.
    fn thread_id(&self, b: &mut KernelBuilder, axis: Axis) -> Reg;

    /// Largest block count the hardware allows along `axis`.
    fn max_block_count(&self, axis: Axis) -> u64;

    /// Largest number of threads per block the hardware allows along `axis`.
    fn max_threads_per_block(&self, axis: Axis) -> u64;
}

/// Supported GPU targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GpuTarget {
    #[default]
    Nvptx,
    Amdgpu,
}

impl GpuTarget {
    pub fn name(self) -> &'static str {
        match self {
            GpuTarget::Nvptx => "nvptx",
            GpuTarget::Amdgpu => "amdgpu",
        }
    }

    pub fn parse(name: &str) -> Option<GpuTarget> {
        match name {
            "nvptx" | "cuda" | "ptx" => Some(GpuTarget::Nvptx),
            "amdgpu" | "rocm" | "hip" => Some(GpuTarget::Amdgpu),
            _ => None,
        }
    }

    pub fn all() -> &'static [GpuTarget] {
        &[GpuTarget::Nvptx, GpuTarget::Amdgpu]
    }
}

impl HardwareIds for GpuTarget {
    fn block_id(&self, b: &mut KernelBuilder, axis: Axis) -> Reg {
        b.read_special(SpecialReg::BlockId(axis), "")
    }

    fn thread_id(&self, b: &mut KernelBuilder, axis: Axis) -> Reg {
        b.read_special(SpecialReg::ThreadId(axis), "")
    }

    fn max_block_count(&self, axis: Axis) -> u64 {
        match (self, axis) {
            // PTX: %nctaid.x < 2^31, %nctaid.{y,z} < 2^16.
            (GpuTarget::Nvptx, Axis::X) => i32::MAX as u64,
            (GpuTarget::Nvptx, _) => 65535,
            (GpuTarget::Amdgpu, _) => u32::MAX as u64,
        }
    }

    fn max_threads_per_block(&self, axis: Axis) -> u64 {
        match (self, axis) {
            (GpuTarget::Nvptx, Axis::Z) => 64,
            _ => 1024,
        }
    }
}
