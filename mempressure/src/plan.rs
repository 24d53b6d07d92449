use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

pub(crate) const MB_SIZE: u64 = 1024 * 1024;

// ceiling for a single worker, total memory is split into ceil(total / ceiling) workers
pub(crate) const MAX_MEMORY_PER_PROCESS_MB: u64 = 1000;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum PlanError {
    #[error("total memory must be at least 1 MB")]
    NoMemory,
    #[error("number of steps must be at least 1")]
    NoSteps,
    #[error("memory per process ceiling must be at least 1 MB")]
    NoCeiling,
}

/// How requested memory is partitioned across workers.
///
/// Both divisions truncate: `memory_per_process_mb * num_processes` may be less than
/// `total_memory_mb`, and residual megabytes are never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Plan {
    pub total_memory_mb: u64,
    pub steps: u64,
    pub delay_ms: u64,
    pub num_processes: u64,
    pub memory_per_process_mb: u64,
}

impl Plan {
    pub(crate) fn new(total_memory_mb: u64, steps: u64, delay_ms: u64, max_per_process_mb: u64) -> Result<Self, PlanError> {
        if total_memory_mb == 0 {
            return Err(PlanError::NoMemory);
        }
        if steps == 0 {
            return Err(PlanError::NoSteps);
        }
        if max_per_process_mb == 0 {
            return Err(PlanError::NoCeiling);
        }
        let num_processes = total_memory_mb.div_ceil(max_per_process_mb);
        Ok(Plan {
            total_memory_mb,
            steps,
            delay_ms,
            num_processes,
            memory_per_process_mb: total_memory_mb / num_processes,
        })
    }

    pub(crate) fn residual_mb(&self) -> u64 {
        self.total_memory_mb - self.memory_per_process_mb * self.num_processes
    }

    pub(crate) fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            memory_mb: self.memory_per_process_mb,
            steps: self.steps,
            delay: Duration::from_millis(self.delay_ms),
        }
    }
}

impl Display for Plan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} MB in {} processes of {} MB, {} steps every {}ms",
            self.total_memory_mb, self.num_processes, self.memory_per_process_mb, self.steps, self.delay_ms
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerConfig {
    pub memory_mb: u64,
    pub steps: u64,
    pub delay: Duration,
}

impl WorkerConfig {
    /// Megabytes reported per step, rounded down.
    pub(crate) fn mb_per_step(&self) -> u64 {
        self.memory_mb / self.steps
    }
}
