//! File abstraction consumed by the VM subsystem.
//!
//! The on-disk filesystem itself lives in the embedding kernel; the VM
//! core only needs open-file objects with positioned I/O and independent
//! reopened handles (for mmap and fork).

pub mod traits;

pub use traits::{FileRef, FsError, FsResult, VmFile};
