//! POSIX-compatible constants shared across the VM subsystem.
//!
//! Error codes follow Linux errno values so that syscall handlers in the
//! embedding kernel can surface VM failures without translation tables.

/// Error numbers (Linux-compatible)
pub mod errno {
    pub const EPERM: i32 = 1; // Operation not permitted
    pub const ENOENT: i32 = 2; // No such file or directory
    pub const EIO: i32 = 5; // I/O error
    pub const EBADF: i32 = 9; // Bad file descriptor
    pub const ENOMEM: i32 = 12; // Out of memory
    pub const EACCES: i32 = 13; // Permission denied
    pub const EFAULT: i32 = 14; // Bad address
    pub const EEXIST: i32 = 17; // File exists
    pub const ENODEV: i32 = 19; // No such device
    pub const EINVAL: i32 = 22; // Invalid argument
    pub const ENOSPC: i32 = 28; // No space left on device
    pub const ENOSYS: i32 = 38; // Function not implemented
}
