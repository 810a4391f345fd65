use super::KernelLowering;
use crate::kir::Kernel;

/// The canonical listing, newline-terminated.
pub struct TextLowering;

impl KernelLowering for TextLowering {
    fn target_name(&self) -> &str {
        "text"
    }

    fn lower(&self, kernel: &Kernel) -> String {
        let mut out = kernel.listing();
        out.push('\n');
        out
    }
}
