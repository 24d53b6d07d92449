use std::{
    collections::TryReserveError,
    convert::Infallible,
    io,
    ops::Range,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
    thread::sleep,
    time::Duration,
};

use libc::c_int;
use tracing::{debug, info};

use crate::{
    plan::{WorkerConfig, MB_SIZE},
    signal::{self, Signal},
};

// every touched byte gets this value so the kernel has to back the page with real memory
pub(crate) const FILL_PATTERN: u8 = 0xAA;

const IDLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub(crate) enum WorkerError {
    #[error("Memory allocation failed: unable to reserve {bytes} bytes")]
    Allocation {
        bytes: usize,
        #[source]
        source: TryReserveError,
    },
    #[error("Memory allocation failed: {0} MB does not fit into the address space")]
    TooLarge(u64),
    #[error("signal handling: {0}")]
    Signal(#[from] io::Error),
}

// pause state of the current worker process, flipped only by the toggle handler
static PAUSED: AtomicBool = AtomicBool::new(false);

// acknowledgements are rendered before the handler is installed,
// handler itself only loads the pointer and writes
static ACKS: OnceLock<Acks> = OnceLock::new();

struct Acks {
    paused: String,
    resumed: String,
}

/// Flips the flag and returns the new state.
pub(crate) fn toggle(flag: &AtomicBool) -> bool {
    !flag.fetch_xor(true, Ordering::SeqCst)
}

extern "C" fn on_toggle(_: c_int) {
    let paused = toggle(&PAUSED);
    if let Some(acks) = ACKS.get() {
        let ack = if paused { &acks.paused } else { &acks.resumed };
        signal::write_raw(libc::STDOUT_FILENO, ack.as_bytes());
    }
}

/// Contiguous memory of a worker, committed one step at a time.
///
/// Address space for the whole block is reserved up front, but pages are written only
/// when a step touches them. Step `i` always covers `[i * step_size, (i + 1) * step_size)`,
/// bytes past `steps * step_size` are never written.
#[derive(Debug)]
pub(crate) struct Block {
    buf: Vec<u8>,
    bytes: usize,
    step_size: usize,
}

impl Block {
    pub(crate) fn allocate(bytes: usize, steps: u64) -> Result<Self, WorkerError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes)
            .map_err(|source| WorkerError::Allocation { bytes, source })?;
        Ok(Block {
            buf,
            bytes,
            step_size: bytes / steps as usize,
        })
    }

    pub(crate) fn for_megabytes(memory_mb: u64, steps: u64) -> Result<Self, WorkerError> {
        let bytes = memory_mb
            .checked_mul(MB_SIZE)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or(WorkerError::TooLarge(memory_mb))?;
        Block::allocate(bytes, steps)
    }

    pub(crate) fn step_size(&self) -> usize {
        self.step_size
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes
    }

    pub(crate) fn touched(&self) -> &[u8] {
        &self.buf
    }

    // resize stays within reserved capacity, it never reallocates
    fn touch_next(&mut self) -> Range<usize> {
        let start = self.buf.len();
        self.buf.resize(start + self.step_size, FILL_PATTERN);
        start..self.buf.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Touched { step: u64, range: Range<usize> },
    Paused,
    Done,
}

/// Allocation progress of a single worker.
pub(crate) struct Allocation<'a> {
    block: Block,
    steps: u64,
    completed: u64,
    paused: &'a AtomicBool,
}

impl<'a> Allocation<'a> {
    pub(crate) fn new(block: Block, steps: u64, paused: &'a AtomicBool) -> Self {
        Allocation {
            block,
            steps,
            completed: 0,
            paused,
        }
    }

    pub(crate) fn step(&mut self) -> Step {
        if self.completed == self.steps {
            return Step::Done;
        }
        if self.paused.load(Ordering::SeqCst) {
            return Step::Paused;
        }
        let range = self.block.touch_next();
        self.completed += 1;
        Step::Touched {
            step: self.completed,
            range,
        }
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed
    }

    pub(crate) fn block(&self) -> &Block {
        &self.block
    }
}

pub(crate) fn percent(step: u64, steps: u64) -> f64 {
    100.0 * step as f64 / steps as f64
}

/// Worker entrypoint, runs in the forked child.
///
/// Returns only on error, after the last step the worker idles until it is killed.
pub(crate) fn run(cfg: &WorkerConfig) -> Result<Infallible, WorkerError> {
    let pid = process::id();
    _ = ACKS.set(Acks {
        paused: format!("Process {}: Paused\n", pid),
        resumed: format!("Process {}: Resumed\n", pid),
    });
    signal::install_handler(Signal::TogglePause, on_toggle)?;

    let block = Block::for_megabytes(cfg.memory_mb, cfg.steps)?;
    if block.len() % cfg.steps as usize != 0 {
        debug!(
            "process {}: {} trailing bytes will not be touched",
            pid,
            block.len() - block.step_size() * cfg.steps as usize
        );
    }
    let mut allocation = Allocation::new(block, cfg.steps, &PAUSED);
    loop {
        match allocation.step() {
            Step::Touched { step, .. } => {
                info!(
                    "Process {}: Allocated {} MB of memory in step {}/{} ({:.2}% of total).",
                    pid,
                    cfg.mb_per_step(),
                    step,
                    cfg.steps,
                    percent(step, cfg.steps)
                );
                sleep(cfg.delay);
            }
            Step::Paused => {
                signal::suspend_while(Signal::TogglePause, || PAUSED.load(Ordering::SeqCst))?;
            }
            Step::Done => break,
        }
    }
    debug!(
        "process {}: committed {} bytes in {} steps, idling until terminated",
        pid,
        allocation.block().touched().len(),
        allocation.completed()
    );
    loop {
        sleep(IDLE_INTERVAL);
    }
}
