use std::process;

use clap::Args;

use gridloop::emit::plan_parallel_loop;

use super::{load_spec, KernelArgs};

#[derive(Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub kernel: KernelArgs,
}

pub fn cmd_check(args: CheckArgs) {
    let spec = load_spec(&args.kernel);
    let kernel = match gridloop::compile_kernel(&spec) {
        Ok(k) => k,
        Err(diag) => {
            eprintln!("{}", diag);
            process::exit(1);
        }
    };
    let plan = plan_parallel_loop(&spec.shape, &spec.launch, spec.unroll);

    println!("kernel:    {} ({})", spec.name, spec.op.name());
    println!("shape:     {} ({} elements)", spec.shape, plan.element_count);
    println!("launch:    {} ({} threads)", spec.launch, plan.total_threads);
    println!("unroll:    {}", plan.unroll_factor);
    if plan.single_pass {
        println!("loop:      single pass");
    } else {
        println!(
            "loop:      grid-stride, step {} over {} trips",
            plan.step, plan.trip_count
        );
    }
    println!("row index: {}", if plan.row_index { "yes" } else { "no" });
    println!("blocks:    {}", kernel.blocks.len());
    println!("hash:      {}", &kernel.fingerprint()[..16]);
    eprintln!("OK: {}", spec.name);
}
