//! Convenience re-exports for consumers of `corral-core`.

pub use crate::adapter::Adapter;
pub use crate::error::{CorralError, Result};
pub use crate::handler::{Backend, Concurrency, HandlerId, Priority, RegisterOptions, Timeout};
pub use crate::registry::Registry;
