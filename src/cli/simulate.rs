use std::process;

use clap::Args;

use super::{load_spec, KernelArgs};

#[derive(Args)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub kernel: KernelArgs,
    /// List every bad element instead of the first few
    #[arg(long)]
    pub all: bool,
}

fn preview(positions: &[u64], all: bool) -> String {
    let shown: Vec<String> = positions
        .iter()
        .take(if all { usize::MAX } else { 8 })
        .map(|p| p.to_string())
        .collect();
    if shown.len() < positions.len() {
        format!("{} ... ({} total)", shown.join(", "), positions.len())
    } else {
        shown.join(", ")
    }
}

pub fn cmd_simulate(args: SimulateArgs) {
    let spec = load_spec(&args.kernel);
    let result = gridloop::compile_kernel(&spec)
        .and_then(|kernel| gridloop::simulate_kernel(&spec, &kernel));
    let report = match result {
        Ok(r) => r,
        Err(diag) => {
            eprintln!("{}", diag);
            process::exit(1);
        }
    };

    println!(
        "{} threads, {} elements, {} stores, {} blocks executed",
        report.threads, report.elements, report.stores, report.steps
    );
    for (label, positions) in [
        ("missing", &report.missing),
        ("duplicated", &report.duplicates),
        ("wrong value", &report.mismatches),
    ] {
        if !positions.is_empty() {
            eprintln!("error: {}: {}", label, preview(positions, args.all));
        }
    }
    if !report.is_exact() {
        process::exit(1);
    }
    eprintln!("OK: every element written once");
}
