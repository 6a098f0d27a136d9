//! The per-(adapter, handler) job state machine. See `spec.md` §4.4 (C6)
//! and §4.5.
//!
//! A `Job` moves through `Pending -> Admitted -> Running -> a terminal
//! state` and is driven to completion by exactly one call to [`Job::run`].
//! There is no external state to poll: `run` does not return until the
//! job has reached a terminal state and its adapter notification has been
//! delivered (or has itself failed and been routed to the executor's
//! `on_notify_error` hook).

use std::sync::Arc;

use corral_core::{Adapter, CorralError, HandlerDescriptor, Timeout};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::admission::CapacitySet;
use crate::backend::{self, ProcessRegistry};
use crate::executor::NotifyErrorHook;

/// Where a job currently sits in its lifecycle. Exposed only for tracing
/// and `Executor::stats`; nothing outside this module inspects it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Admitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Admitted => "admitted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Runs one handler invocation end to end: admission, payload
/// materialization, dispatch, timeout enforcement, and terminal
/// notification. Consumes its inputs since a job only ever runs once.
pub(crate) struct Job<Key, Payload, Out> {
    descriptor: HandlerDescriptor<Payload, Out>,
    adapter: Arc<dyn Adapter<Key, Payload, Out>>,
    capacity: Arc<CapacitySet>,
    processes: ProcessRegistry,
    cancel: CancellationToken,
    admitted: Option<tokio::sync::oneshot::Sender<()>>,
    on_notify_error: NotifyErrorHook,
}

impl<Key, Payload, Out> Job<Key, Payload, Out>
where
    Key: Send + Sync + 'static,
    Payload: Serialize + DeserializeOwned + Send + 'static,
    Out: Serialize + DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(
        descriptor: HandlerDescriptor<Payload, Out>,
        adapter: Arc<dyn Adapter<Key, Payload, Out>>,
        capacity: Arc<CapacitySet>,
        processes: ProcessRegistry,
        cancel: CancellationToken,
        admitted: Option<tokio::sync::oneshot::Sender<()>>,
        on_notify_error: NotifyErrorHook,
    ) -> Self {
        Self {
            descriptor,
            adapter,
            capacity,
            processes,
            cancel,
            admitted,
            on_notify_error,
        }
    }

    /// Drives this job from `Pending` through to a terminal state, firing
    /// the matching adapter notification exactly once. Returns the
    /// terminal state reached, for the caller's bookkeeping.
    pub(crate) async fn run(self) -> JobState {
        let span = tracing::info_span!(
            target: crate::TRACING_TARGET,
            "job",
            handler = %self.descriptor.name(),
            backend = %self.descriptor.backend(),
        );
        self.run_traced().instrument(span).await
    }

    async fn run_traced(mut self) -> JobState {
        tracing::debug!(target: crate::TRACING_TARGET, state = %JobState::Pending, "job created");

        let permits = match self.capacity.admit(&self.descriptor, &self.cancel).await {
            Ok(permits) => permits,
            Err(err) => {
                self.notify_terminal(err).await;
                return JobState::Cancelled;
            }
        };
        tracing::debug!(target: crate::TRACING_TARGET, state = %JobState::Admitted, "job admitted");
        if let Some(tx) = self.admitted.take() {
            let _ = tx.send(());
        }

        let payload = self.adapter.payload().await;
        tracing::debug!(target: crate::TRACING_TARGET, state = %JobState::Running, "job running");

        let outcome = self.dispatch(payload).await;
        drop(permits);

        let terminal = match &outcome {
            Ok(_) => JobState::Succeeded,
            Err(CorralError::Cancelled) => JobState::Cancelled,
            Err(_) => JobState::Failed,
        };
        self.notify_terminal(outcome).await;
        terminal
    }

    async fn dispatch(&self, payload: Payload) -> Result<Out, CorralError> {
        let call = backend::dispatch(&self.descriptor, payload, &self.cancel, &self.processes);

        match self.descriptor.timeout() {
            Timeout::Unbounded => call.await,
            Timeout::After(duration) => match tokio::time::timeout(duration, call).await {
                Ok(result) => result,
                // On THREAD/PROCESS the abandoned work keeps running to
                // completion in the background; its result is discarded.
                Err(_) => Err(CorralError::Timeout { after: duration }),
            },
        }
    }

    async fn notify_terminal(&self, outcome: Result<Out, CorralError>) {
        let result = match outcome {
            Ok(value) => {
                tracing::debug!(target: crate::TRACING_TARGET, state = %JobState::Succeeded, "job succeeded");
                self.adapter.on_success(value).await
            }
            Err(CorralError::Cancelled) => {
                tracing::debug!(target: crate::TRACING_TARGET, state = %JobState::Cancelled, "job cancelled");
                self.adapter.on_cancel(CorralError::Cancelled).await
            }
            Err(err) => {
                tracing::debug!(target: crate::TRACING_TARGET, state = %JobState::Failed, error = %err, "job failed");
                self.adapter.on_failure(err).await
            }
        };

        if let Err(notify_err) = result {
            tracing::warn!(target: crate::TRACING_TARGET, error = %notify_err, "adapter notification failed");
            (self.on_notify_error)(notify_err);
        }
    }
}
