//! THREAD backend: dispatches to the shared blocking thread pool.
//! See `spec.md` §4.2.
//!
//! In-flight thread work cannot be forcibly interrupted: once spawned, the
//! closure runs to completion regardless of cancellation. On cancellation
//! we simply stop waiting for it and return immediately; its eventual
//! result is dropped on the floor.

use corral_core::{CorralError, HandlerDescriptor};
use tokio_util::sync::CancellationToken;

pub(crate) async fn run<P, O>(
    descriptor: &HandlerDescriptor<P, O>,
    payload: P,
    cancel: &CancellationToken,
) -> Result<O, CorralError>
where
    P: Send + 'static,
    O: Send + 'static,
{
    let call = descriptor.call(payload);
    let handle = tokio::runtime::Handle::current();

    let join = tokio::task::spawn_blocking(move || handle.block_on(call));

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CorralError::Cancelled),
        outcome = join => match outcome {
            Ok(result) => result,
            Err(join_err) => Err(CorralError::handler(JoinPanic(join_err.to_string()))),
        },
    }
}

#[derive(Debug, thiserror::Error)]
#[error("thread backend task panicked: {0}")]
struct JoinPanic(String);
