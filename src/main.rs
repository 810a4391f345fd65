mod cli;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridloop", version, about = "Emit and simulate grid-parallel elementwise GPU kernels")]
struct Cli {
    /// Log emission decisions (same as GRIDLOOP_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the generated kernel as KIR or CUDA
    Emit(cli::emit::EmitArgs),
    /// Validate a kernel description and show its loop plan
    Check(cli::check::CheckArgs),
    /// Run the kernel on a simulated grid and check every element
    Simulate(cli::simulate::SimulateArgs),
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("GRIDLOOP_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Emit(args) => cli::emit::cmd_emit(args),
        Command::Check(args) => cli::check::cmd_check(args),
        Command::Simulate(args) => cli::simulate::cmd_simulate(args),
    }
}
