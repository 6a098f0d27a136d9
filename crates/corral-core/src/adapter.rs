//! The message-originator boundary. See `spec.md` §3 (C3) and §6.

use async_trait::async_trait;

use crate::error::{CorralError, Result};

/// The contract a user-supplied inbound message must implement.
///
/// `keys()` is the one synchronous method on this trait — per `spec.md`
/// §6, routing-key discovery is not a suspension point. If it returns an
/// error, [`corral_executor::Executor::execute`] propagates that error to
/// its caller and creates no jobs (`spec.md` §9, Open Question resolved in
/// `DESIGN.md`).
///
/// The remaining four methods are cooperative suspension points: payload
/// materialization and the three terminal notifications. Exactly one of
/// `on_success` / `on_failure` / `on_cancel` fires per job, and it fires
/// after that job's permits have all been released (`spec.md` §5).
///
/// The three notification methods return `Result<()>` rather than `()`:
/// a notification callback can itself fail (a webhook adapter's
/// `on_success` doing a network call, say), and that failure must not
/// unwind the executor's task. A failing notification is caught, logged,
/// and routed to the owning `corral_executor::Executor`'s configured
/// `on_notify_error` hook instead (`spec.md` §6, §7) — not back to this
/// trait, since the adapter that just failed to notify is the least
/// reliable place to report that failure.
#[async_trait]
pub trait Adapter<Key, Payload, Out>: Send + Sync {
    /// The routing keys this message targets. Zero, one, or many. Called
    /// once per `execute` call, before any job is created.
    fn keys(&self) -> Result<Vec<Key>>;

    /// Materializes the payload for one (adapter, handler) pair. Called
    /// exactly once per job, lazily (only once that job has been admitted
    /// past its gates... note: admission order is independent of payload
    /// materialization timing; see `corral_executor::Job`).
    async fn payload(&self) -> Payload;

    /// Invoked exactly once, when the job's handler returned `Ok`.
    async fn on_success(&self, result: Out) -> Result<()>;

    /// Invoked exactly once, when the job's handler returned `Err`, timed
    /// out, or a backend dispatch error occurred.
    async fn on_failure(&self, error: CorralError) -> Result<()>;

    /// Invoked exactly once, when the job was cancelled before completion
    /// (explicit cancellation or executor shutdown).
    async fn on_cancel(&self, error: CorralError) -> Result<()>;
}
