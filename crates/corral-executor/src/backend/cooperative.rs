//! COOPERATIVE backend: runs the handler inline on the executor's own
//! scheduler. See `spec.md` §4.2.

use corral_core::{CorralError, HandlerDescriptor};
use tokio_util::sync::CancellationToken;

pub(crate) async fn run<P, O>(
    descriptor: &HandlerDescriptor<P, O>,
    payload: P,
    cancel: &CancellationToken,
) -> Result<O, CorralError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CorralError::Cancelled),
        result = descriptor.call(payload) => result,
    }
}
