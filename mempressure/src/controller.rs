use std::{
    io,
    process::ExitStatus,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::signal::{self, Signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WorkerHandle {
    pub pid: i32,
    pub index: usize,
}

/// Delivery and reaping of worker processes.
pub(crate) trait Processes {
    fn signal(&mut self, pid: i32, signal: Signal) -> Result<(), io::Error>;
    fn reap(&mut self, pid: i32) -> Result<ExitStatus, io::Error>;
}

/// Workers are children of the current process.
#[derive(Debug, Default)]
pub(crate) struct Children;

impl Processes for Children {
    fn signal(&mut self, pid: i32, signal: Signal) -> Result<(), io::Error> {
        signal::kill(pid, signal)
    }

    fn reap(&mut self, pid: i32) -> Result<ExitStatus, io::Error> {
        signal::waitpid(pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Key {
    Byte(u8),
    // nothing arrived within poll interval
    Idle,
    Closed,
}

pub(crate) trait Keys {
    fn next_key(&mut self, timeout: Duration) -> Result<Key, io::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}

pub(crate) struct Controller<P: Processes> {
    processes: P,
    workers: Vec<WorkerHandle>,
}

impl<P: Processes> Controller<P> {
    pub(crate) fn new(processes: P) -> Self {
        Controller {
            processes,
            workers: vec![],
        }
    }

    pub(crate) fn add(&mut self, handle: WorkerHandle) {
        debug!("spawned worker {} with pid {}", handle.index, handle.pid);
        self.workers.push(handle);
    }

    pub(crate) fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Sends signal to every worker, failures are logged and skipped.
    /// Returns number of successful deliveries.
    pub(crate) fn broadcast(&mut self, signal: Signal) -> usize {
        let mut delivered = 0;
        for worker in self.workers.iter() {
            match self.processes.signal(worker.pid, signal) {
                Ok(()) => delivered += 1,
                Err(err) => warn!("send {} to process {}: {}", signal, worker.pid, err),
            }
        }
        delivered
    }

    pub(crate) fn on_key(&mut self, key: u8) -> Flow {
        match key {
            b'p' | b'P' => {
                let delivered = self.broadcast(Signal::TogglePause);
                debug!("pause toggle delivered to {} of {} workers", delivered, self.workers.len());
                Flow::Continue
            }
            b'\n' => Flow::Exit,
            _ => Flow::Continue,
        }
    }

    /// Reads keys until exit key, closed input or interruption.
    ///
    /// `running` follows ctrlc convention used by the binary: it is flipped to false on interrupt.
    pub(crate) fn control(&mut self, keys: &mut impl Keys, running: &AtomicBool, poll: Duration) -> Result<()> {
        while running.load(Ordering::Relaxed) {
            match keys.next_key(poll)? {
                Key::Byte(byte) => {
                    if self.on_key(byte) == Flow::Exit {
                        return Ok(());
                    }
                }
                Key::Idle => {}
                Key::Closed => {
                    info!("input closed");
                    return Ok(());
                }
            }
        }
        info!("interrupted");
        Ok(())
    }

    /// Terminates and reaps every worker in spawn order.
    pub(crate) fn shutdown(mut self) -> Vec<(WorkerHandle, Option<ExitStatus>)> {
        let mut reaped = Vec::with_capacity(self.workers.len());
        for worker in std::mem::take(&mut self.workers) {
            // worker that exited on its own is still a zombie, only reaping matters for it
            if let Err(err) = self.processes.signal(worker.pid, Signal::Terminate) {
                warn!("send {} to process {}: {}", Signal::Terminate, worker.pid, err);
            }
            let status = match self.processes.reap(worker.pid) {
                Ok(status) => {
                    debug!("process {} (worker {}) exited with {}", worker.pid, worker.index, status);
                    Some(status)
                }
                Err(err) => {
                    warn!("wait for process {}: {}", worker.pid, err);
                    None
                }
            };
            reaped.push((worker, status));
        }
        reaped
    }
}
