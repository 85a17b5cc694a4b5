//! Device abstractions consumed by the VM subsystem.

pub mod block;

pub use block::{BlockDevice, BlockError, SECTOR_SIZE};
