pub mod check;
pub mod emit;
pub mod simulate;

use std::path::{Path, PathBuf};
use std::process;

use clap::Args;

use gridloop::config::{KernelConfig, KernelSpec, Overrides, CONFIG_FILE_NAME};
use gridloop::diagnostic::render_diagnostics;

/// Options shared by every subcommand: where the kernel description
/// lives and the values that override it.
#[derive(Args)]
pub struct KernelArgs {
    /// gridloop.toml, or a directory to search upwards from (default: .)
    pub input: Option<PathBuf>,
    /// Elements each thread handles per pass
    #[arg(long)]
    pub unroll: Option<u64>,
    /// Block counts (x[,y[,z]])
    #[arg(long, value_delimiter = ',')]
    pub blocks: Option<Vec<u64>>,
    /// Threads per block (x[,y[,z]])
    #[arg(long, value_delimiter = ',')]
    pub threads: Option<Vec<u64>>,
    /// Index width in bits (32 or 64)
    #[arg(long)]
    pub index_bits: Option<u32>,
    /// GPU target (nvptx or amdgpu)
    #[arg(long, alias = "gpu")]
    pub target: Option<String>,
}

impl KernelArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            unroll: self.unroll,
            blocks: self.blocks.clone(),
            threads: self.threads.clone(),
            index_bits: self.index_bits,
            target: self.target.clone(),
        }
    }
}

/// Locate the config file for `input` (a file, or a directory searched
/// upwards).
pub fn resolve_config_path(input: Option<&Path>) -> PathBuf {
    let start = input.unwrap_or(Path::new("."));
    if start.is_file() {
        return start.to_path_buf();
    }
    match KernelConfig::find(start) {
        Some(path) => path,
        None => {
            eprintln!(
                "error: no {} found in '{}' or its parents",
                CONFIG_FILE_NAME,
                start.display()
            );
            process::exit(1);
        }
    }
}

/// Load, override, and validate the kernel description, rendering any
/// diagnostics against the file and exiting on error.
pub fn load_spec(args: &KernelArgs) -> KernelSpec {
    let path = resolve_config_path(args.input.as_deref());
    let filename = path.display().to_string();
    let source = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", filename, e);
            process::exit(1);
        }
    };
    let mut config = match KernelConfig::parse(&source) {
        Ok(c) => c,
        Err(diag) => {
            diag.render(&filename, &source);
            process::exit(1);
        }
    };
    config.apply_overrides(args.overrides());
    render_diagnostics(&config.warnings(), &filename, &source);
    match config.resolve() {
        Ok(spec) => spec,
        Err(errors) => {
            render_diagnostics(&errors, &filename, &source);
            process::exit(1);
        }
    }
}
