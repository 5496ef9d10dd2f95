//! Stable exit codes for agent CLI commands.

/// Build passed, or the command succeeded.
pub const OK: i32 = 0;
/// Build failed.
pub const FAILED: i32 = 1;
/// The instruction tree or config could not be read or parsed.
pub const INVALID: i32 = 2;
/// Build was cancelled before completing.
pub const CANCELLED: i32 = 3;
