//! The routing-key → handler mapping. See `spec.md` §3 (C2) and §4.1.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{CorralError, Result};
use crate::handler::{HandlerDescriptor, HandlerFn, HandlerId, RegisterOptions};

/// Mapping from routing key to an ordered collection of handler
/// descriptors. Registration order is preserved; a single key may carry
/// multiple handlers, all of which fan out when a message routes to that
/// key.
///
/// Registration (`add`) is only permitted until an executor built from this
/// registry calls [`Registry::mark_started`]; after that, `add` fails with
/// [`CorralError::AlreadyRunning`]. Lookups (`get`) are always permitted and
/// never mutate the registry, matching the "read-only during execution"
/// invariant from `spec.md` §3.
pub struct Registry<Key, Payload, Out> {
    handlers: RwLock<HashMap<Key, Vec<HandlerDescriptor<Payload, Out>>>>,
    started: AtomicBool,
}

impl<Key, Payload, Out> Default for Registry<Key, Payload, Out>
where
    Key: Eq + Hash,
{
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }
}

impl<Key, Payload, Out> Registry<Key, Payload, Out>
where
    Key: Eq + Hash + Clone,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Registers a handler under `key`. Returns the generated
    /// [`HandlerId`], or [`CorralError::AlreadyRunning`] if an executor
    /// built from this registry has already started.
    ///
    /// Also usable as the backing call for a decorator-style wrapper (the
    /// caller gets the id back rather than the original `func`, since Rust
    /// has no implicit decorator sugar — unlike the source library, which
    /// returns `fn` unchanged to support `@registry.add(...)` stacking).
    pub fn add<F, Fut>(&self, key: Key, func: F, opts: RegisterOptions) -> Result<HandlerId>
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, CorralError>> + Send + 'static,
        Payload: 'static,
        Out: 'static,
    {
        if self.started.load(Ordering::Acquire) {
            tracing::warn!(target: crate::TRACING_TARGET, "rejected registration: executor already started");
            return Err(CorralError::AlreadyRunning);
        }
        let func: HandlerFn<Payload, Out> = Arc::new(move |payload| Box::pin(func(payload)));
        let descriptor = HandlerDescriptor::new(func, opts);
        let id = descriptor.id();

        tracing::debug!(
            target: crate::TRACING_TARGET,
            handler = %descriptor.name(),
            backend = %descriptor.backend(),
            priority = descriptor.priority(),
            "registered handler",
        );

        let mut guard = self
            .handlers
            .write()
            .expect("registry lock poisoned");
        guard.entry(key).or_default().push(descriptor);
        Ok(id)
    }

    /// Returns the handlers registered under `key`, in registration order.
    /// Empty if the key is unknown. Descriptor clones are cheap (an `Arc`
    /// clone per descriptor).
    pub fn get(&self, key: &Key) -> Vec<HandlerDescriptor<Payload, Out>> {
        let guard = self.handlers.read().expect("registry lock poisoned");
        guard.get(key).cloned().unwrap_or_default()
    }

    /// Total number of distinct keys with at least one handler.
    pub fn key_count(&self) -> usize {
        self.handlers.read().expect("registry lock poisoned").len()
    }

    /// Finds a previously-registered handler by id, regardless of which
    /// key it was registered under. Mostly useful for introspection and
    /// metrics, since a [`HandlerId`] is generated fresh on every process
    /// start and so cannot identify a handler across a process boundary.
    pub fn find_by_id(&self, id: HandlerId) -> Option<HandlerDescriptor<Payload, Out>> {
        let guard = self.handlers.read().expect("registry lock poisoned");
        guard.values().flatten().find(|d| d.id() == id).cloned()
    }

    /// Finds a previously-registered handler by its diagnostic name.
    ///
    /// Used by the PROCESS backend's worker re-exec path
    /// (`corral_executor::maybe_enter_worker`): a worker process is handed
    /// only a name string over its environment, and must reconstruct the
    /// same registry the parent built (same handlers, same names) to look
    /// the handler back up. A `HandlerId` cannot serve this purpose since
    /// it is regenerated on every process start; a handler's name is the
    /// only identifier stable across the boundary, so any handler
    /// registered under `Backend::Process` must be given an explicit name
    /// via [`RegisterOptions::with_name`].
    pub fn find_by_name(&self, name: &str) -> Option<HandlerDescriptor<Payload, Out>> {
        let guard = self.handlers.read().expect("registry lock poisoned");
        guard.values().flatten().find(|d| d.name() == name).cloned()
    }

    /// Marks this registry as belonging to a running executor. Called once
    /// by [`corral_executor::Executor::start`]; subsequent `add` calls fail.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
        tracing::debug!(
            target: crate::TRACING_TARGET,
            keys = self.key_count(),
            "registry frozen, executor starting",
        );
    }

    /// Whether an executor has marked this registry as started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_preserves_registration_order() {
        let registry: Registry<&'static str, i64, i64> = Registry::new();
        registry
            .add("+", |p: i64| async move { Ok(p * 2) }, RegisterOptions::default())
            .unwrap();
        registry
            .add("+", |p: i64| async move { Ok(p * 3) }, RegisterOptions::default())
            .unwrap();

        let handlers = registry.get(&"+");
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].call(5).await.unwrap(), 10);
        assert_eq!(handlers[1].call(5).await.unwrap(), 15);
    }

    #[test]
    fn unknown_key_returns_empty() {
        let registry: Registry<&'static str, (), ()> = Registry::new();
        assert!(registry.get(&"missing").is_empty());
    }

    #[test]
    fn add_after_start_fails() {
        let registry: Registry<&'static str, (), ()> = Registry::new();
        registry.mark_started();
        let err = registry
            .add("x", |_: ()| async move { Ok(()) }, RegisterOptions::default())
            .unwrap_err();
        assert!(matches!(err, CorralError::AlreadyRunning));
    }
}
