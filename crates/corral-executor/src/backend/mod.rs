//! Execution backends. See `spec.md` §4.2 (C4).
//!
//! All three backends present the same completion contract: given a
//! handler descriptor and a materialized payload, run it to either a
//! result or an error, honoring an external cancellation signal. This
//! module's [`dispatch`] is the one call site the [`crate::job::Job`]
//! state machine uses; it never branches on backend kind itself, so
//! adding a fourth backend only touches this module.

mod cooperative;
mod process;
mod thread;

use corral_core::{Backend, CorralError, HandlerDescriptor};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

pub use process::maybe_enter_worker;
pub(crate) use process::ProcessRegistry;

/// Runs `descriptor` against `payload` under its configured backend.
///
/// Returns `Err(CorralError::Cancelled)` as soon as `cancel` fires for the
/// COOPERATIVE backend (the in-flight call is dropped at its current
/// suspension point); for THREAD and PROCESS, returns the same error
/// immediately but lets the abandoned thread/process keep running to
/// completion in the background, discarding its result (`spec.md` §4.2).
pub(crate) async fn dispatch<P, O>(
    descriptor: &HandlerDescriptor<P, O>,
    payload: P,
    cancel: &CancellationToken,
    processes: &ProcessRegistry,
) -> Result<O, CorralError>
where
    P: Serialize + DeserializeOwned + Send + 'static,
    O: Serialize + DeserializeOwned + Send + 'static,
{
    match descriptor.backend() {
        Backend::Cooperative => cooperative::run(descriptor, payload, cancel).await,
        Backend::Thread => thread::run(descriptor, payload, cancel).await,
        Backend::Process => process::run(descriptor, payload, cancel, processes).await,
    }
}
