#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

/// Tracing target for job lifecycle and gate events.
pub const TRACING_TARGET: &str = "corral::executor";

mod admission;
mod backend;
mod executor;
mod gate;
mod job;

pub use backend::maybe_enter_worker;
pub use executor::{Executor, ExecutorConfig, ExecutorStats, NotifyErrorHook, WaitFor};
