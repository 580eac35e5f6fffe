//! Verified pure functions for the Lodestone VMM.
//!
//! This module holds the arithmetic core of the address-space model, the
//! I/O dispatch path and the pause state machine.  Every function here takes
//! values in and returns values out: **no I/O, no locks, no threads and no
//! dependency on `kvm-ioctls` or `vm-memory`**.
//!
//! The effectful shell ([`crate::memory`], [`crate::io`], [`crate::vcpu`],
//! [`crate::io::DeviceGate`]) delegates to these functions so that the
//! properties that matter (overlap detection, value normalisation, pause
//! accounting) can be tested exhaustively in isolation.

pub mod io;
pub mod pause;
pub mod pci;
pub mod region;
