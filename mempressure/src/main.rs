use std::{
    io::{self, IsTerminal, Write},
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{value_parser, Parser};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{prelude::*, Registry};

use crate::{
    controller::{Children, Controller, WorkerHandle},
    plan::{Plan, WorkerConfig, MAX_MEMORY_PER_PROCESS_MB},
    signal::Forked,
    terminal::{FdKeys, RawMode},
};

mod controller;
mod plan;
mod signal;
mod terminal;
mod worker;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Opt {
    #[clap(
        index(1),
        value_name = "TOTAL_MEMORY_IN_MB",
        value_parser = value_parser!(u64).range(1..),
        help = "memory to allocate across all processes, in MB"
    )]
    total_memory_mb: u64,

    #[clap(
        index(2),
        value_name = "STEPS",
        value_parser = value_parser!(u64).range(1..),
        help = "each process commits its memory in this many equal steps"
    )]
    steps: u64,

    #[clap(index(3), value_name = "DELAY_MS", help = "sleep between steps, in milliseconds")]
    delay_ms: u64,

    #[clap(
        long,
        default_value_t = MAX_MEMORY_PER_PROCESS_MB,
        value_parser = value_parser!(u64).range(1..),
        help = "memory ceiling of a single process in MB. total memory is split into ceil(total / ceiling) processes"
    )]
    max_per_process: u64,

    #[clap(
        long,
        default_value = "100ms",
        help = "how often to check for interruption while waiting for a key"
    )]
    poll: humantime::Duration,
}

fn main() -> Result<()> {
    let registry = Registry::default().with(
        tracing_subscriber::fmt::layer()
            .with_ansi(io::stdout().is_terminal())
            .with_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            ),
    );
    registry.try_init().context("installing tracing subscriber")?;

    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            // usage errors exit with 1, help and version with 0
            let code = if err.use_stderr() { 1 } else { 0 };
            _ = err.print();
            process::exit(code);
        }
    };
    let plan = Plan::new(opt.total_memory_mb, opt.steps, opt.delay_ms, opt.max_per_process)?;
    info!("plan: {}", plan);
    if plan.residual_mb() > 0 {
        warn!(
            "{} MB can't be split evenly between {} processes and will not be allocated",
            plan.residual_mb(),
            plan.num_processes
        );
    }

    info!(
        "Creating {} processes, each gradually allocating {} MB of memory...",
        plan.num_processes, plan.memory_per_process_mb
    );
    let worker = plan.worker();
    let mut controller = Controller::new(Children);
    for index in 0..plan.num_processes as usize {
        match spawn(&worker) {
            Ok(pid) => controller.add(WorkerHandle { pid, index }),
            Err(err) => {
                error!("spawning worker {} failed, terminating {} spawned", index, controller.workers().len());
                controller.shutdown();
                return Err(err).context(format!("spawning worker {}", index));
            }
        }
    }

    let raw = match RawMode::enable(libc::STDIN_FILENO) {
        Ok(Some(raw)) => Some(raw),
        Ok(None) => {
            info!("stdin is not a terminal, reading keys without raw mode");
            None
        }
        Err(err) => {
            warn!("enable raw terminal mode: {}", err);
            None
        }
    };
    let rst = interact(&mut controller, opt.poll.into());
    controller.shutdown();
    info!("All processes terminated.");
    drop(raw);
    rst
}

// handler for interrupts is installed only after workers are forked,
// so that they keep default dispositions and no helper thread is forked
fn interact(controller: &mut Controller<Children>, poll: Duration) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    ctrlc::set_handler({
        let running = running.clone();
        move || {
            running.store(false, Ordering::Relaxed);
        }
    })
    .context("installing interrupt handler")?;

    info!("Press 'p' to pause/resume allocation. Press Enter to exit.");
    controller.control(&mut FdKeys::new(libc::STDIN_FILENO), &running, poll)
}

fn spawn(cfg: &WorkerConfig) -> Result<i32, io::Error> {
    // anything left in the buffer would be written by both processes
    io::stdout().flush()?;
    match signal::fork()? {
        Forked::Parent(pid) => Ok(pid),
        Forked::Child => match worker::run(cfg) {
            Ok(never) => match never {},
            Err(err) => {
                error!("Process {}: {}", process::id(), err);
                process::exit(1);
            }
        },
    }
}
