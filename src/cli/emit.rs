use std::path::PathBuf;
use std::process;

use clap::Args;

use super::{load_spec, KernelArgs};

#[derive(Args)]
pub struct EmitArgs {
    #[command(flatten)]
    pub kernel: KernelArgs,
    /// Output format (text or cuda)
    #[arg(long, default_value = "text")]
    pub backend: String,
    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub fn cmd_emit(args: EmitArgs) {
    let spec = load_spec(&args.kernel);
    let source = match gridloop::emit_kernel_source(&spec, &args.backend) {
        Ok(s) => s,
        Err(diag) => {
            eprintln!("{}", diag);
            process::exit(1);
        }
    };
    match args.output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &source) {
                eprintln!("error: cannot write '{}': {}", path.display(), e);
                process::exit(1);
            }
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{}", source),
    }
}
