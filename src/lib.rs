//! runbox: a programmable replacement for ad-hoc shell invocation
//! Launches child processes from a declarative specification, mediates their
//! standard descriptors through per-descriptor policies, and reports exit
//! status, captured output, and resource usage.

pub mod cli;
pub mod env;
pub mod fd_handler;
pub mod program;
pub mod reactor;
pub mod signal;
pub mod spec;
pub mod types;
