//! Handler descriptors: the immutable record produced by [`crate::Registry::add`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::CorralError;

/// Opaque identifier for a registered handler, returned from
/// [`crate::Registry::add`] so callers can correlate metrics or logs back
/// to a specific registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(Uuid);

impl HandlerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution strategy for a handler call. See `spec.md` §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Backend {
    /// Runs inline on the executor's cooperative scheduler.
    Cooperative,
    /// Dispatches to the shared thread pool.
    Thread,
    /// Dispatches to the shared worker-process pool.
    Process,
}

impl Default for Backend {
    fn default() -> Self {
        Self::Cooperative
    }
}

/// Priority band. Higher values are admitted sooner when a gate is
/// contended; equal priorities are admitted FIFO. Small integer range by
/// design (see `spec.md` §9 — an intrusive bucketed list, not a heap).
pub type Priority = i8;

/// Default priority assigned to handlers that do not specify one.
pub const DEFAULT_PRIORITY: Priority = 0;

/// A cap on simultaneous executions, or no cap at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// No synthetic gate is created for this dimension.
    Unbounded,
    /// At most this many concurrent executions.
    Limited(usize),
}

impl Concurrency {
    /// Returns the numeric limit, if bounded.
    pub fn limit(self) -> Option<usize> {
        match self {
            Concurrency::Unbounded => None,
            Concurrency::Limited(n) => Some(n),
        }
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::Unbounded
    }
}

impl From<usize> for Concurrency {
    fn from(n: usize) -> Self {
        Self::Limited(n)
    }
}

/// A handler's configured timeout, or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// The handler may run indefinitely.
    Unbounded,
    /// The handler is cancelled with [`CorralError::Timeout`] after this long.
    After(Duration),
}

impl Default for Timeout {
    fn default() -> Self {
        Self::Unbounded
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::After(d)
    }
}

/// The async function signature a handler body must satisfy.
///
/// `Payload` is materialized once per (adapter, handler) pair by
/// [`crate::Adapter::payload`] and handed to the handler; the handler
/// returns `Ok(Out)` on success or any boxed error on failure.
pub type HandlerFn<Payload, Out> = Arc<
    dyn Fn(Payload) -> Pin<Box<dyn Future<Output = Result<Out, CorralError>> + Send>>
        + Send
        + Sync,
>;

/// Immutable record describing one registered handler: its backend,
/// priority, concurrency cap, and timeout. See `spec.md` §3.
pub struct HandlerDescriptor<Payload, Out> {
    id: HandlerId,
    name: Option<String>,
    func: HandlerFn<Payload, Out>,
    backend: Backend,
    priority: Priority,
    max_concurrent: Concurrency,
    timeout: Timeout,
}

impl<Payload, Out> Clone for HandlerDescriptor<Payload, Out> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            func: self.func.clone(),
            backend: self.backend,
            priority: self.priority,
            max_concurrent: self.max_concurrent,
            timeout: self.timeout,
        }
    }
}

impl<Payload, Out> std::fmt::Debug for HandlerDescriptor<Payload, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("priority", &self.priority)
            .field("max_concurrent", &self.max_concurrent)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<Payload, Out> HandlerDescriptor<Payload, Out> {
    /// Options accepted by [`crate::Registry::add`]; built via
    /// [`RegisterOptions::default`] and its `with_*` builder methods,
    /// following `nvisy_server::pipeline::PipelineConfig`'s builder style.
    pub(crate) fn new(func: HandlerFn<Payload, Out>, opts: RegisterOptions) -> Self {
        Self {
            id: HandlerId::new(),
            name: opts.name,
            func,
            backend: opts.backend,
            priority: opts.priority,
            max_concurrent: opts.max_concurrent,
            timeout: opts.timeout,
        }
    }

    /// This handler's generated id.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Diagnostic name, falling back to the handler id when unset.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    /// The execution backend this handler runs under.
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Admission priority; higher admits sooner.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Per-handler concurrency cap.
    pub fn max_concurrent(&self) -> Concurrency {
        self.max_concurrent
    }

    /// Per-handler timeout.
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// Invokes the handler body with a materialized payload.
    pub fn call(&self, payload: Payload) -> Pin<Box<dyn Future<Output = Result<Out, CorralError>> + Send>> {
        (self.func)(payload)
    }
}

/// Builder for handler registration options, passed to [`crate::Registry::add`].
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    pub(crate) name: Option<String>,
    pub(crate) backend: Backend,
    pub(crate) priority: Priority,
    pub(crate) max_concurrent: Concurrency,
    pub(crate) timeout: Timeout,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            name: None,
            backend: Backend::default(),
            priority: DEFAULT_PRIORITY,
            max_concurrent: Concurrency::default(),
            timeout: Timeout::default(),
        }
    }
}

impl RegisterOptions {
    /// Sets a diagnostic name for this handler (used in tracing fields).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the execution backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the admission priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the per-handler concurrency cap.
    pub fn with_max_concurrent(mut self, max_concurrent: impl Into<Concurrency>) -> Self {
        self.max_concurrent = max_concurrent.into();
        self
    }

    /// Sets the per-handler timeout.
    pub fn with_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }
}
