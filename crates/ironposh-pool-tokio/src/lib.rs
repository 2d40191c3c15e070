//! Tokio-backed runspaces for the ironposh runspace pool.
//!
//! A [`ProcessRunspace`] runs each pipeline as one shell process, locally or
//! over `ssh`, and reports its output and errors through the pipeline channel.

mod process;

pub use process::{ProcessExecution, ProcessRunspace, ProcessRunspaceFactory, ShellDialect};
