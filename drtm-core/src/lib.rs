//! DRTM Core - RTOS thread awareness for halted Cortex-M targets.
//!
//! This crate reads a DRTM layout descriptor exported by the firmware, walks
//! the kernel's thread list in target memory and serves per-thread register
//! sets to a debugger, either directly through [`Engine`] or through the
//! J-Link style [`Plugin`] boundary.

pub mod config;
pub mod demo;
pub mod engine;
pub mod error;
pub mod plugin;
pub mod registers;
pub mod rtos;
pub mod symbols;
pub mod target;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{DrtmError, DrtmResult};
pub use plugin::Plugin;
pub use registers::{Architecture, RegisterDesc, RegisterSource};
pub use rtos::{LayoutMetadata, Snapshot, Thread, ThreadId, ThreadState};
pub use symbols::SymbolManager;
pub use target::{MemoryImage, TargetCapability, TargetExt};
#[cfg(feature = "hardware")]
pub use target::ProbeTarget;
