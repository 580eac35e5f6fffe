//! 16550A UART on the legacy COM ports.
//!
//! Register emulation is provided by [`vm_superio::Serial`].  The device
//! raises its interrupt through an eventfd registered as an irqfd, so the
//! I/O worker never touches the interrupt controller directly.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vm_superio::serial::NoEvents;
use vm_superio::{Serial, SerialState, Trigger};
use vmm_sys_util::eventfd::EventFd;

use super::{AttachContext, Device, DeviceError, DeviceInfo, PioCapable, Stateful};
use crate::io::{DeviceCore, IoError, IoHandler, IoOps, WriteOutcome};
use crate::memory::MemoryRegion;
use crate::platform::PlatformError;

/// Base I/O port for COM1 (standard PC/AT).
pub const COM1_BASE: u16 = 0x3F8;

/// Base I/O port for COM2.
pub const COM2_BASE: u16 = 0x2F8;

/// IRQ line for COM1 (standard PC/AT: IRQ 4).
pub const COM1_IRQ: u32 = 4;

/// IRQ line for COM2 (standard PC/AT: IRQ 3).
pub const COM2_IRQ: u32 = 3;

/// Number of registers behind each COM base port.
pub const UART_PORT_COUNT: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UartConfig {
    pub port: u16,
    pub irq: u32,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            port: COM1_BASE,
            irq: COM1_IRQ,
        }
    }
}

/// Serialisable copy of [`SerialState`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartState {
    pub baud_divisor_low: u8,
    pub baud_divisor_high: u8,
    pub interrupt_enable: u8,
    pub interrupt_identification: u8,
    pub line_control: u8,
    pub line_status: u8,
    pub modem_control: u8,
    pub modem_status: u8,
    pub scratch: u8,
    pub in_buffer: Vec<u8>,
}

impl From<SerialState> for UartState {
    fn from(s: SerialState) -> Self {
        Self {
            baud_divisor_low: s.baud_divisor_low,
            baud_divisor_high: s.baud_divisor_high,
            interrupt_enable: s.interrupt_enable,
            interrupt_identification: s.interrupt_identification,
            line_control: s.line_control,
            line_status: s.line_status,
            modem_control: s.modem_control,
            modem_status: s.modem_status,
            scratch: s.scratch,
            in_buffer: s.in_buffer,
        }
    }
}

impl From<UartState> for SerialState {
    fn from(s: UartState) -> Self {
        SerialState {
            baud_divisor_low: s.baud_divisor_low,
            baud_divisor_high: s.baud_divisor_high,
            interrupt_enable: s.interrupt_enable,
            interrupt_identification: s.interrupt_identification,
            line_control: s.line_control,
            line_status: s.line_status,
            modem_control: s.modem_control,
            modem_status: s.modem_status,
            scratch: s.scratch,
            in_buffer: s.in_buffer,
        }
    }
}

/// What a UART saves: its configuration plus register contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UartSnapshot {
    #[serde(flatten)]
    config: UartConfig,
    #[serde(default)]
    registers: Option<UartState>,
}

/// Wrapper to implement [`vm_superio::Trigger`] for an [`EventFd`].
struct SerialTrigger(EventFd);

impl Trigger for SerialTrigger {
    type E = io::Error;

    fn trigger(&self) -> Result<(), Self::E> {
        self.0.write(1)
    }
}

/// A cloneable sink for transmitted bytes.
#[derive(Clone)]
pub struct SharedOutput(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedOutput {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self(Arc::new(Mutex::new(out)))
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

struct UartOps {
    name: String,
    serial: Serial<SerialTrigger, NoEvents, SharedOutput>,
    irq_evt: EventFd,
    output: SharedOutput,
}

impl UartOps {
    fn trigger(&self) -> Result<SerialTrigger, IoError> {
        let fd = self
            .irq_evt
            .try_clone()
            .map_err(|e| IoError::Platform(PlatformError::Eventfd(e)))?;
        Ok(SerialTrigger(fd))
    }
}

impl IoOps for UartOps {
    fn read(&mut self, offset: u64, _size: u8) -> Result<u64, IoError> {
        Ok(u64::from(self.serial.read(offset as u8)))
    }

    fn write(&mut self, offset: u64, _size: u8, value: u64) -> Result<WriteOutcome, IoError> {
        self.serial
            .write(offset as u8, value as u8)
            .map_err(|e| IoError::Device {
                device: self.name.clone(),
                offset,
                reason: format!("{e:?}"),
            })?;
        Ok(WriteOutcome::Done)
    }

    fn save(&self) -> Option<Value> {
        serde_json::to_value(UartState::from(self.serial.state())).ok()
    }

    fn restore(&mut self, state: &Value) -> Result<(), IoError> {
        let state: UartState =
            serde_json::from_value(state.clone()).map_err(IoError::Restore)?;
        self.serial = Serial::from_state(
            &SerialState::from(state),
            self.trigger()?,
            NoEvents,
            self.output.clone(),
        )
        .map_err(|e| IoError::Device {
            device: self.name.clone(),
            offset: 0,
            reason: format!("{e:?}"),
        })?;
        Ok(())
    }
}

pub struct Uart {
    core: Arc<DeviceCore>,
    config: UartConfig,
    output: SharedOutput,
    handler: OnceLock<IoHandler>,
}

impl Uart {
    pub fn create(info: &DeviceInfo) -> Result<Arc<dyn Device>, DeviceError> {
        Ok(Arc::new(Self::with_output(info, SharedOutput::stdout())?))
    }

    /// A UART transmitting into `output` instead of stdout.
    pub fn with_output(info: &DeviceInfo, output: SharedOutput) -> Result<Self, DeviceError> {
        Ok(Self {
            core: DeviceCore::new(&info.name, &info.driver),
            config: info.config()?,
            output,
            handler: OnceLock::new(),
        })
    }

    fn handler(&self) -> Result<&IoHandler, DeviceError> {
        self.handler.get().ok_or_else(|| DeviceError::Invalid {
            device: self.name().to_string(),
            reason: "not attached".to_string(),
        })
    }
}

impl Device for Uart {
    fn core(&self) -> &Arc<DeviceCore> {
        &self.core
    }

    fn config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or(Value::Null)
    }

    fn attach(&self, ctx: &mut AttachContext<'_>) -> Result<(), DeviceError> {
        let name = self.name().to_string();
        let irq = ctx.interrupts.allocate(&name, Some(self.config.irq))?;

        let irq_evt = EventFd::new(libc::EFD_NONBLOCK).map_err(PlatformError::Eventfd)?;
        ctx.platform.register_irqfd(&irq_evt, irq)?;
        let trigger = SerialTrigger(irq_evt.try_clone().map_err(PlatformError::Eventfd)?);

        let ops = UartOps {
            name: name.clone(),
            serial: Serial::new(trigger, self.output.clone()),
            irq_evt,
            output: self.output.clone(),
        };
        let region = MemoryRegion::new(u64::from(self.config.port), UART_PORT_COUNT);
        let handler = IoHandler::spawn(Arc::clone(&self.core), region, Box::new(ops))?;
        self.handler
            .set(handler)
            .map_err(|_| DeviceError::Invalid {
                device: name,
                reason: "attached twice".to_string(),
            })?;
        Ok(())
    }

    fn as_pio(&self) -> Option<&dyn PioCapable> {
        Some(self)
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        Some(self)
    }
}

impl PioCapable for Uart {
    fn pio_handlers(&self) -> Vec<IoHandler> {
        self.handler.get().cloned().into_iter().collect()
    }
}

impl Stateful for Uart {
    fn save(&self) -> Result<Value, DeviceError> {
        let registers = self
            .handler()?
            .save_state()?
            .map(serde_json::from_value)
            .transpose()
            .map_err(IoError::Restore)?;
        let snapshot = UartSnapshot {
            config: self.config.clone(),
            registers,
        };
        serde_json::to_value(snapshot).map_err(|e| DeviceError::Io(IoError::Restore(e)))
    }

    fn load(&self, state: &Value) -> Result<(), DeviceError> {
        let snapshot: UartSnapshot =
            serde_json::from_value(state.clone()).map_err(|source| DeviceError::Config {
                device: self.name().to_string(),
                source,
            })?;
        if let Some(registers) = snapshot.registers {
            let value = serde_json::to_value(registers).map_err(IoError::Restore)?;
            self.handler()?.restore_state(value)?;
        }
        Ok(())
    }
}
