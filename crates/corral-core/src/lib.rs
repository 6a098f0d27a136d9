#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

/// Tracing target for registry events (registration, `AlreadyRunning` rejections).
pub const TRACING_TARGET: &str = "corral::registry";

mod adapter;
mod error;
mod handler;
mod registry;

pub mod prelude;

pub use adapter::Adapter;
pub use error::{BackendError, BoxedError, CorralError, Result};
pub use handler::{
    Backend, Concurrency, HandlerDescriptor, HandlerId, Priority, RegisterOptions, Timeout,
    DEFAULT_PRIORITY,
};
pub use registry::Registry;
