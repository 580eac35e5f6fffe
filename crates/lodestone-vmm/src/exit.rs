//! Guest exit classification.
//!
//! | Exit          | Action                                   |
//! |---------------|------------------------------------------|
//! | Port I/O      | dispatch through the port cache          |
//! | MMIO          | dispatch through the memory cache        |
//! | Debug         | forward to the tracer, if any            |
//! | Halt/Shutdown | stop this VCPU                           |
//! | Interrupted   | resume; the executor re-checks its state |
//! | No reason     | fatal                                    |

use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::io::{IoError, IoEvent, IoSpace};
use crate::model::Model;
use crate::platform::{GuestExit, IoData};
use crate::verified::io::{value_from_le, value_to_le};

#[derive(Debug, Error)]
pub enum ExitError {
    #[error("{space:?} access at {addr:#x} failed: {source}")]
    Io {
        space: IoSpace,
        addr: u64,
        #[source]
        source: IoError,
    },

    #[error("{space:?} access at {addr:#x} has unsupported width {len}")]
    Width { space: IoSpace, addr: u64, len: usize },

    #[error("Guest exited without a reason")]
    NoReason,

    #[error("Unhandled guest exit: {0}")]
    Unhandled(String),
}

/// What the executor does after an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Resume,
    Stop,
}

/// Receives debug exits, typically one per single-stepped instruction.
pub trait InstructionTracer: Send + Sync {
    fn trace(&self, vcpu: u32, pc: u64);
}

/// Logs every traced instruction address.
pub struct LogTracer;

impl InstructionTracer for LogTracer {
    fn trace(&self, vcpu: u32, pc: u64) {
        info!("vcpu{vcpu}: step {pc:#x}");
    }
}

#[derive(Clone)]
pub struct ExitRouter {
    model: Arc<Model>,
    tracer: Option<Arc<dyn InstructionTracer>>,
}

impl ExitRouter {
    pub fn new(model: Arc<Model>, tracer: Option<Arc<dyn InstructionTracer>>) -> Self {
        Self { model, tracer }
    }

    pub fn route(&self, vcpu: u32, exit: GuestExit<'_>) -> Result<ExitAction, ExitError> {
        match exit {
            GuestExit::PortIo { port, data } => {
                self.access(IoSpace::Port, u64::from(port), data)?;
                Ok(ExitAction::Resume)
            }
            GuestExit::Mmio { addr, data } => {
                self.access(IoSpace::Memory, addr, data)?;
                Ok(ExitAction::Resume)
            }
            GuestExit::Debug { pc } => {
                if let Some(tracer) = &self.tracer {
                    tracer.trace(vcpu, pc);
                }
                Ok(ExitAction::Resume)
            }
            GuestExit::Halt => {
                info!("vcpu{vcpu}: halted");
                Ok(ExitAction::Stop)
            }
            GuestExit::Shutdown => {
                info!("vcpu{vcpu}: shutdown");
                Ok(ExitAction::Stop)
            }
            GuestExit::Interrupted => Ok(ExitAction::Resume),
            GuestExit::NoReason => Err(ExitError::NoReason),
            GuestExit::Unhandled(reason) => Err(ExitError::Unhandled(reason)),
        }
    }

    fn access(&self, space: IoSpace, addr: u64, data: IoData<'_>) -> Result<(), ExitError> {
        let len = data.len();
        if !matches!(len, 1 | 2 | 4 | 8) {
            return Err(ExitError::Width { space, addr, len });
        }
        let size = len as u8;
        let dispatch = |event: &mut IoEvent| {
            let result = match space {
                IoSpace::Port => self.model.handle_pio(addr, event),
                IoSpace::Memory => self.model.handle_mmio(addr, event),
            };
            result.map_err(|source| ExitError::Io {
                space,
                addr,
                source,
            })
        };

        match data {
            IoData::Out(bytes) => {
                let mut event = IoEvent::write(size, value_from_le(bytes));
                dispatch(&mut event)
            }
            IoData::In(bytes) => {
                let mut event = IoEvent::read(size);
                dispatch(&mut event)?;
                debug!("{space:?} read {addr:#x} -> {:#x}", event.data);
                value_to_le(event.data, bytes);
                Ok(())
            }
        }
    }
}
