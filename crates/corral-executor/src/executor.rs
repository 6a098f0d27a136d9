//! The executor: owns a [`Registry`], its capacity gates, and the set of
//! in-flight jobs. See `spec.md` §4.5 (C7) and §6.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use corral_core::{Adapter, CorralError, Registry, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::admission::CapacitySet;
use crate::backend::ProcessRegistry;
use crate::job::{Job, JobState};

/// How long [`Executor::execute`] should wait before returning, relative
/// to the jobs it created.
///
/// Mirrors `spec.md` §4.5's three-way `wait_for` parameter (`None` / `0` /
/// a positive duration); the `None` case's exact boundary ("after enqueue,
/// before admission wait") is `spec.md` §9's first Open Question, resolved
/// here and recorded in `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    /// Return immediately once every matching job has been enqueued, before
    /// any of them has begun waiting on admission (`wait_for=0`).
    Enqueued,
    /// Return once every matching job has been admitted, not completed
    /// (`wait_for=None`, the default).
    Admitted,
    /// Wait up to this long for every matching job to reach a terminal
    /// state; jobs still running when it elapses keep running, unaffected,
    /// and `execute` returns anyway (`wait_for=<duration>`).
    Completion(Duration),
}

impl Default for WaitFor {
    fn default() -> Self {
        Self::Admitted
    }
}

/// Callback invoked when an adapter notification (`on_success` /
/// `on_failure` / `on_cancel`) itself returns `Err`. See `spec.md` §6's
/// `on_notify_error` executor option and §7's `NotifyError` kind — the
/// failure never propagates to another job, only here.
pub type NotifyErrorHook = Arc<dyn Fn(CorralError) + Send + Sync>;

fn default_on_notify_error() -> NotifyErrorHook {
    Arc::new(|error| {
        tracing::error!(target: crate::TRACING_TARGET, %error, "adapter notification failed");
    })
}

/// Configuration for an [`Executor`], following the builder style of
/// `nvisy_server::pipeline::PipelineConfig`.
#[derive(Clone, Serialize, serde::Deserialize)]
pub struct ExecutorConfig {
    /// Global concurrency cap across all backends and handlers. `None`
    /// means unbounded (the default).
    pub max_jobs: Option<usize>,
    /// Concurrency cap for the COOPERATIVE backend specifically. `None`
    /// means unbounded (the default) — cooperative calls run inline on the
    /// executor's own task set and its natural limit is the global cap, if
    /// any.
    pub max_cooperative: Option<usize>,
    /// Concurrency cap for the THREAD backend. Defaults to the number of
    /// available CPUs.
    pub max_threads: usize,
    /// Concurrency cap for the PROCESS backend. Defaults to the number of
    /// available CPUs.
    pub max_processes: usize,
    /// How long [`Executor::stop`] waits for in-flight jobs to finish on
    /// their own before cancelling them and killing worker processes.
    #[serde(with = "duration_as_secs")]
    pub drain_timeout: Duration,
    /// Invoked when an adapter notification callback itself fails. Defaults
    /// to a `tracing::error!` call at the `corral::executor` target,
    /// matching `nvisy_server::pipeline::Worker`'s "log and continue"
    /// handling of a failed job callback. Not serializable, so excluded
    /// from (de)serialized config documents and reset to the default on
    /// deserialization.
    #[serde(skip, default = "default_on_notify_error")]
    pub on_notify_error: NotifyErrorHook,
}

impl std::fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("max_jobs", &self.max_jobs)
            .field("max_cooperative", &self.max_cooperative)
            .field("max_threads", &self.max_threads)
            .field("max_processes", &self.max_processes)
            .field("drain_timeout", &self.drain_timeout)
            .field("on_notify_error", &"<callback>")
            .finish()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_jobs: None,
            max_cooperative: None,
            max_threads: parallelism,
            max_processes: parallelism,
            drain_timeout: Duration::from_secs(30),
            on_notify_error: default_on_notify_error(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    pub fn with_max_cooperative(mut self, max_cooperative: usize) -> Self {
        self.max_cooperative = Some(max_cooperative);
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_on_notify_error(
        mut self,
        on_notify_error: impl Fn(CorralError) + Send + Sync + 'static,
    ) -> Self {
        self.on_notify_error = Arc::new(on_notify_error);
        self
    }
}

mod duration_as_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Point-in-time counters, exposed via [`Executor::stats`]. See `spec.md`
/// §6.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExecutorStats {
    pub created: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Drives jobs to completion for one [`Registry`], enforcing the registry's
/// per-handler caps plus the executor's own global/per-backend caps.
///
/// Must be [`Executor::start`]-ed before [`Executor::execute`] is called,
/// and [`Executor::stop`]-ed exactly once to drain in-flight work. Dropping
/// an `Executor` that was never stopped abandons any still-running jobs —
/// `stop` should always be called, typically from a shutdown handler.
pub struct Executor<Key, Payload, Out> {
    registry: Arc<Registry<Key, Payload, Out>>,
    capacity: Arc<CapacitySet>,
    processes: ProcessRegistry,
    cancel: CancellationToken,
    drain_timeout: Duration,
    on_notify_error: NotifyErrorHook,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    counters: Arc<Counters>,
}

impl<Key, Payload, Out> Executor<Key, Payload, Out>
where
    Key: Eq + Hash + Clone + Send + Sync + 'static,
    Payload: Serialize + DeserializeOwned + Send + 'static,
    Out: Serialize + DeserializeOwned + Send + 'static,
{
    /// Builds an executor from a registry and configuration. The registry
    /// is not yet marked as started; call [`Executor::start`] to begin
    /// accepting [`Executor::execute`] calls (and to freeze the registry
    /// against further `add`s).
    pub fn new(registry: Arc<Registry<Key, Payload, Out>>, config: ExecutorConfig) -> Self {
        let capacity = Arc::new(CapacitySet::new(
            config.max_jobs,
            config.max_cooperative,
            config.max_threads,
            config.max_processes,
        ));
        Self {
            registry,
            capacity,
            processes: ProcessRegistry::new(),
            cancel: CancellationToken::new(),
            drain_timeout: config.drain_timeout,
            on_notify_error: config.on_notify_error,
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Marks the registry as started, freezing it against further
    /// registrations. Idempotent.
    pub fn start(&self) {
        self.registry.mark_started();
        tracing::info!(target: crate::TRACING_TARGET, "executor started");
    }

    /// Routes `adapter` to every handler registered under each of its
    /// `keys()`, creating one job per (key, handler) pair, and returns
    /// according to `wait_for`.
    ///
    /// An empty key list, or keys with no registered handlers, simply
    /// creates no jobs. An error from `adapter.keys()` is propagated
    /// directly; no jobs are created in that case.
    pub async fn execute(
        &self,
        adapter: Arc<dyn Adapter<Key, Payload, Out>>,
        wait_for: WaitFor,
    ) -> Result<()> {
        let keys = adapter.keys()?;

        let mut admitted_rx = Vec::new();
        let mut completion_rx = Vec::new();

        for key in keys {
            for descriptor in self.registry.get(&key) {
                let (admitted_tx, admitted) = tokio::sync::oneshot::channel();
                let (done_tx, done) = tokio::sync::oneshot::channel();

                let job = Job::new(
                    descriptor,
                    Arc::clone(&adapter),
                    Arc::clone(&self.capacity),
                    self.processes.clone(),
                    self.cancel.child_token(),
                    Some(admitted_tx),
                    Arc::clone(&self.on_notify_error),
                );
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                let counters = Arc::clone(&self.counters);

                let mut tasks = self.tasks.lock().await;
                tasks.spawn(async move {
                    let terminal = job.run().await;
                    match terminal {
                        JobState::Succeeded => counters.succeeded.fetch_add(1, Ordering::Relaxed),
                        JobState::Failed => counters.failed.fetch_add(1, Ordering::Relaxed),
                        JobState::Cancelled => counters.cancelled.fetch_add(1, Ordering::Relaxed),
                        _ => 0,
                    };
                    let _ = done_tx.send(());
                });

                admitted_rx.push(admitted);
                completion_rx.push(done);
            }
        }

        match wait_for {
            WaitFor::Enqueued => {}
            WaitFor::Admitted => {
                for rx in admitted_rx {
                    let _ = rx.await;
                }
            }
            WaitFor::Completion(duration) => {
                let _ = tokio::time::timeout(duration, async {
                    for rx in completion_rx {
                        let _ = rx.await;
                    }
                })
                .await;
            }
        }

        Ok(())
    }

    /// Returns point-in-time counters. Inexpensive; safe to call from a
    /// metrics endpoint on a polling interval.
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            created: self.counters.created.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Cancels every in-flight job and waits up to `drain_timeout` for
    /// them to finish unwinding before forcibly killing any worker
    /// processes still registered.
    ///
    /// COOPERATIVE jobs stop promptly (cancellation is checked at their
    /// next suspension point); THREAD and PROCESS jobs may outlive
    /// `drain_timeout` since their underlying OS thread/process cannot be
    /// interrupted mid-call — worker processes are killed once the grace
    /// period elapses, abandoned threads are simply left to finish (their
    /// result is already discarded by [`crate::job::Job`]).
    pub async fn stop(&self) {
        tracing::info!(target: crate::TRACING_TARGET, "executor stopping, draining in-flight jobs");

        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                target: crate::TRACING_TARGET,
                timeout_secs = self.drain_timeout.as_secs(),
                "drain timeout elapsed, cancelling remaining jobs",
            );
            self.cancel.cancel();
            self.processes.kill_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::RegisterOptions;

    struct EchoAdapter {
        key: &'static str,
        value: i64,
        result: tokio::sync::oneshot::Sender<i64>,
    }

    #[async_trait::async_trait]
    impl Adapter<&'static str, i64, i64> for EchoAdapter {
        fn keys(&self) -> Result<Vec<&'static str>> {
            Ok(vec![self.key])
        }

        async fn payload(&self) -> i64 {
            self.value
        }

        async fn on_success(&self, result: i64) -> Result<()> {
            let _ = self.result.send(result);
            Ok(())
        }

        async fn on_failure(&self, _error: CorralError) -> Result<()> {
            Ok(())
        }

        async fn on_cancel(&self, _error: CorralError) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn execute_waits_for_completion() {
        let registry: Registry<&'static str, i64, i64> = Registry::new();
        registry
            .add("double", |p: i64| async move { Ok(p * 2) }, RegisterOptions::default())
            .unwrap();

        let executor = Executor::new(Arc::new(registry), ExecutorConfig::default());
        executor.start();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let adapter = Arc::new(EchoAdapter {
            key: "double",
            value: 21,
            result: tx,
        });

        executor
            .execute(adapter, WaitFor::Completion(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
        assert_eq!(executor.stats().created, 1);

        executor.stop().await;
    }

    #[tokio::test]
    async fn execute_with_unknown_key_creates_no_jobs() {
        let registry: Registry<&'static str, i64, i64> = Registry::new();
        let executor = Executor::new(Arc::new(registry), ExecutorConfig::default());
        executor.start();

        let (tx, _rx) = tokio::sync::oneshot::channel();
        let adapter = Arc::new(EchoAdapter {
            key: "missing",
            value: 1,
            result: tx,
        });

        executor
            .execute(adapter, WaitFor::Completion(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(executor.stats().created, 0);
        executor.stop().await;
    }
}
