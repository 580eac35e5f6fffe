//! Live-VCPU accounting.
//!
//! Every VCPU thread reports exactly one outcome when it leaves its run
//! loop, even if it panics.  The supervisor counts live threads down and
//! returns once none remain.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{error, info};
use thiserror::Error;

use crate::exit::ExitRouter;
use crate::vcpu::{Vcpu, VcpuControl, VcpuError};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn thread for vcpu{id}: {source}")]
    Spawn {
        id: u32,
        #[source]
        source: io::Error,
    },

    #[error("vcpu{0} thread panicked")]
    Panicked(u32),

    #[error(transparent)]
    Vcpu(#[from] VcpuError),
}

struct Outcome {
    id: u32,
    result: Result<(), SupervisorError>,
}

/// Sends a panic outcome unless the thread reported normally.
struct Reporter {
    id: u32,
    tx: Sender<Outcome>,
    sent: bool,
}

impl Reporter {
    fn report(mut self, result: Result<(), VcpuError>) {
        self.sent = true;
        let _ = self.tx.send(Outcome {
            id: self.id,
            result: result.map_err(SupervisorError::from),
        });
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send(Outcome {
                id: self.id,
                result: Err(SupervisorError::Panicked(self.id)),
            });
        }
    }
}

pub struct Supervisor {
    tx: Sender<Outcome>,
    rx: Receiver<Outcome>,
    live: usize,
    threads: Vec<JoinHandle<()>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            live: 0,
            threads: Vec::new(),
        }
    }

    /// Starts `vcpu` on a thread named `vcpu<id>`.
    pub fn spawn(
        &mut self,
        vcpu: Vcpu,
        router: ExitRouter,
    ) -> Result<Arc<VcpuControl>, SupervisorError> {
        let control = Arc::clone(vcpu.control());
        let id = control.id();
        let reporter = Reporter {
            id,
            tx: self.tx.clone(),
            sent: false,
        };
        let handle = thread::Builder::new()
            .name(format!("vcpu{id}"))
            .spawn(move || {
                let result = vcpu.run(&router);
                reporter.report(result);
            })
            .map_err(|source| SupervisorError::Spawn { id, source })?;
        self.threads.push(handle);
        self.live += 1;
        Ok(control)
    }

    /// VCPU threads that have not reported yet.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Blocks until every VCPU thread has reported.  Returns the first
    /// failure, if any.
    pub fn wait(&mut self) -> Result<(), SupervisorError> {
        let mut first = None;
        while self.live > 0 {
            let Ok(outcome) = self.rx.recv() else {
                break;
            };
            self.live -= 1;
            match outcome.result {
                Ok(()) => info!("vcpu{} exited, {} remaining", outcome.id, self.live),
                Err(e) => {
                    error!("vcpu{} failed: {e}, {} remaining", outcome.id, self.live);
                    first.get_or_insert(e);
                }
            }
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        first.map_or(Ok(()), Err)
    }
}
