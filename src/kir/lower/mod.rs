//! KernelLowering: turns a finished `Kernel` into source text.
//!
//! Each backend implements `KernelLowering`:
//! - `text`: the canonical KIR listing
//! - `cuda`: CUDA C++ with one label per block

mod cuda;
mod text;

use super::Kernel;

pub use cuda::CudaLowering;
pub use text::TextLowering;

/// Lowers a KIR kernel into source text for one backend.
pub trait KernelLowering {
    /// The backend name (e.g. "text", "cuda").
    fn target_name(&self) -> &str;

    /// Lower the kernel. The returned string is complete.
    fn lower(&self, kernel: &Kernel) -> String;
}

/// Create a kernel-lowering backend for the given name.
pub fn create_kernel_lowering(target: &str) -> Option<Box<dyn KernelLowering>> {
    match target {
        "text" | "kir" => Some(Box::new(TextLowering)),
        "cuda" => Some(Box::new(CudaLowering)),
        _ => None,
    }
}

/// Names accepted by `create_kernel_lowering`.
pub fn lowering_names() -> &'static [&'static str] {
    &["text", "cuda"]
}
