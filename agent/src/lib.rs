//! Build agent execution engine.
//!
//! This crate implements the agent side of a remote-build protocol: the
//! server compiles a job into a tree of small instructions, and the agent
//! interprets that tree locally. The architecture keeps a strict separation:
//!
//! - **[`instruction`]**: The wire data model. Pure, no I/O.
//! - **[`session`]** and **[`executors`]**: The interpreter. All collaborator
//!   access goes through the [`ports`] traits so tests can substitute fakes.
//! - **[`process`]**, **[`transfer`]**: Side-effecting primitives (external
//!   processes, artifact downloads) shared by the executors.
//!
//! Console output is a product surface (it becomes the server-side build log)
//! and flows through [`console::ConsoleSink`]; dev diagnostics go through
//! `tracing` and [`logging`].

pub mod cancel;
pub mod config;
pub mod console;
pub(crate) mod executors;
pub mod exit_codes;
pub mod instruction;
pub mod logging;
pub mod ports;
pub mod process;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod transfer;
