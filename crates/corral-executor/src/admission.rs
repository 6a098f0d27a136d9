//! Fixed-order admission through the global, per-backend, and per-handler
//! gates. See `spec.md` §4.3: "A Job must acquire, in this fixed order, a
//! permit from each applicable gate: global → per-backend → per-handler.
//! Fixed order prevents deadlock under contention."

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use corral_core::{Backend, CorralError, HandlerDescriptor, HandlerId};
use tokio_util::sync::CancellationToken;

use crate::gate::{Gate, GatePermit};

/// The three gate dimensions an executor maintains, plus the lazily-created
/// per-handler gates.
pub(crate) struct CapacitySet {
    global: Option<Arc<Gate>>,
    cooperative: Option<Arc<Gate>>,
    thread: Option<Arc<Gate>>,
    process: Option<Arc<Gate>>,
    per_handler: Mutex<HashMap<HandlerId, Arc<Gate>>>,
}

impl CapacitySet {
    pub(crate) fn new(
        max_jobs: Option<usize>,
        max_cooperative: Option<usize>,
        max_threads: usize,
        max_processes: usize,
    ) -> Self {
        Self {
            global: max_jobs.map(|n| Gate::new("global", n)),
            cooperative: max_cooperative.map(|n| Gate::new("cooperative", n)),
            thread: Some(Gate::new("thread", max_threads)),
            process: Some(Gate::new("process", max_processes)),
            per_handler: Mutex::new(HashMap::new()),
        }
    }

    fn backend_gate(&self, backend: Backend) -> Option<&Arc<Gate>> {
        match backend {
            Backend::Cooperative => self.cooperative.as_ref(),
            Backend::Thread => self.thread.as_ref(),
            Backend::Process => self.process.as_ref(),
        }
    }

    fn handler_gate<P, O>(&self, descriptor: &HandlerDescriptor<P, O>) -> Option<Arc<Gate>> {
        let limit = descriptor.max_concurrent().limit()?;
        let mut guard = self.per_handler.lock().expect("capacity set lock poisoned");
        Some(
            guard
                .entry(descriptor.id())
                .or_insert_with(|| Gate::new("handler", limit))
                .clone(),
        )
    }

    /// Acquires, in order, the global, per-backend, and per-handler permits
    /// for `descriptor`. Cancellation-safe: if `cancel` fires before all
    /// permits are held, any already-acquired permits are released (their
    /// `Drop` runs when the returned error unwinds the partial
    /// [`AdmittedPermits`]) and [`CorralError::Cancelled`] is returned.
    pub(crate) async fn admit<P, O>(
        &self,
        descriptor: &HandlerDescriptor<P, O>,
        cancel: &CancellationToken,
    ) -> Result<AdmittedPermits, CorralError> {
        let priority = descriptor.priority();

        let global = match &self.global {
            Some(gate) => Some(Self::acquire_or_cancel(gate, priority, cancel).await?),
            None => None,
        };

        let backend = match self.backend_gate(descriptor.backend()) {
            Some(gate) => Some(Self::acquire_or_cancel(gate, priority, cancel).await?),
            None => None,
        };

        let handler = match self.handler_gate(descriptor) {
            Some(gate) => Some(Self::acquire_or_cancel(&gate, priority, cancel).await?),
            None => None,
        };

        Ok(AdmittedPermits {
            handler,
            backend,
            global,
        })
    }

    async fn acquire_or_cancel(
        gate: &Arc<Gate>,
        priority: corral_core::Priority,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, CorralError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CorralError::Cancelled),
            permit = gate.acquire(priority) => Ok(permit),
        }
    }
}

/// Permits held for the interval `[ADMITTED, terminal)`. Fields are
/// declared in reverse acquisition order so Rust's top-down struct-field
/// drop order releases handler → backend → global, matching `spec.md`
/// §4.3's release order.
pub(crate) struct AdmittedPermits {
    #[allow(dead_code)]
    handler: Option<GatePermit>,
    #[allow(dead_code)]
    backend: Option<GatePermit>,
    #[allow(dead_code)]
    global: Option<GatePermit>,
}
