#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

//! `corral` ties [`corral_core`]'s registry/adapter contract to
//! [`corral_executor`]'s admission and dispatch machinery into a single
//! crate. Most applications only need this crate; reach for `corral-core`
//! or `corral-executor` directly only when building a custom executor or
//! embedding the registry in something else.

pub use corral_core::{
    Adapter, Backend, Concurrency, CorralError, HandlerDescriptor, HandlerId, Priority,
    RegisterOptions, Registry, Result, Timeout, DEFAULT_PRIORITY,
};
pub use corral_executor::{
    maybe_enter_worker, Executor, ExecutorConfig, ExecutorStats, NotifyErrorHook, WaitFor,
};

pub mod prelude {
    //! Convenience glob import: `use corral::prelude::*;`.
    pub use crate::{
        Adapter, Backend, Concurrency, CorralError, Executor, ExecutorConfig, HandlerId, Priority,
        RegisterOptions, Registry, Result, Timeout, WaitFor,
    };
}
