//! Lodestone VMM — the core of a userspace KVM virtual machine monitor.
//!
//! Guest memory is a typed, non-overlapping region map; device registers are
//! served by per-device actor threads; VCPUs run on their own threads with a
//! two-tier pause protocol that parks them with synchronised registers.
//!
//! # Architecture
//!
//! - [`memory`] — Typed address space: reserve, allocate, load
//! - [`io`] — Per-device I/O actors and the device pause gate
//! - [`cache`] — Memoised address → handler dispatch with hit counters
//! - [`eventfd`] — Promotion of hot write addresses to kernel doorbells
//! - [`model`] — Devices, interrupt lines and cache rebuilds
//! - [`devices`] — Driver registry and the built-in drivers
//! - [`vcpu`] — VCPU execution loop and pause state machine
//! - [`exit`] — Guest exit classification
//! - [`supervisor`] — Live-VCPU accounting
//! - [`vm`] — Assembly and lifecycle of a whole machine
//! - [`platform`] — Hypervisor abstraction and its KVM implementation
//! - [`verified`] — Pure arithmetic shared by the modules above

pub mod cache;
pub mod config;
pub mod devices;
pub mod eventfd;
pub mod exit;
pub mod io;
pub mod loader;
pub mod memory;
pub mod model;
pub mod platform;
pub mod snapshot;
pub mod supervisor;
pub mod vcpu;
pub mod verified;
pub mod vm;

#[cfg(test)]
mod testing;
