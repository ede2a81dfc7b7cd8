//! Event delivery.
//!
//! Listeners are closures registered per [`EventKind`] together with the
//! [`DispatchQueue`] they run on. Emitting never blocks: the event is pushed
//! onto each queue's channel, so state transitions can emit while holding a
//! session lock and listeners still run with no manager lock held. A queue
//! delivers jobs in submission order, so one queue observes events in the
//! order their transitions happened and invokes its listeners in
//! registration order.

use crate::error::{DrmError, DrmResult};
use crate::metrics::Metrics;
use mediadrm_types::{DrmEvent, EventKind};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A registered event callback.
pub type Listener = Arc<dyn Fn(&DrmEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

enum Job {
    Deliver {
        event: Arc<DrmEvent>,
        listeners: Vec<Listener>,
    },
    Flush(std::sync::mpsc::Sender<()>),
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// An execution context for listeners: a dedicated thread or a task on a
/// tokio runtime.
#[derive(Clone)]
pub struct DispatchQueue {
    id: u64,
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl DispatchQueue {
    /// Starts a queue on a dedicated OS thread. The thread exits once every
    /// handle to the queue is dropped.
    pub fn thread(name: impl Into<String>) -> DrmResult<Self> {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue_name = Arc::clone(&name);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    run_job(&queue_name, job);
                }
                debug!(queue = %queue_name, "dispatch queue stopped");
            })
            .map_err(|e| DrmError::Internal(format!("failed to spawn dispatch thread: {e}")))?;
        Ok(Self::from_parts(name, tx))
    }

    /// Starts a queue as a task on an existing tokio runtime.
    pub fn on_runtime(handle: &tokio::runtime::Handle, name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue_name = Arc::clone(&name);
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(&queue_name, job);
            }
            debug!(queue = %queue_name, "dispatch queue stopped");
        });
        Self::from_parts(name, tx)
    }

    fn from_parts(name: Arc<str>, tx: mpsc::UnboundedSender<Job>) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            tx,
        }
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until every job submitted before this call has run.
    ///
    /// Must not be called from a listener running on this queue.
    pub fn flush(&self) {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        if self.tx.send(Job::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    fn submit(&self, job: Job) {
        if self.tx.send(job).is_err() {
            warn!(queue = %self.name, "dispatch queue closed, dropping event");
        }
    }
}

fn run_job(queue: &str, job: Job) {
    match job {
        Job::Deliver { event, listeners } => {
            for listener in listeners {
                match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(queue, kind = %event.kind(), error = %err, "event listener failed");
                    }
                    Err(_) => {
                        error!(queue, kind = %event.kind(), "event listener panicked");
                    }
                }
            }
        }
        Job::Flush(done) => {
            let _ = done.send(());
        }
    }
}

struct Registration {
    id: ListenerId,
    queue: DispatchQueue,
    listener: Listener,
}

/// Registry of listeners keyed by event kind.
pub struct EventDispatcher {
    registry: RwLock<BTreeMap<EventKind, Vec<Registration>>>,
    next_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl EventDispatcher {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            registry: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Registers `listener` for events of `kind`, to run on `queue`.
    pub fn register<F>(&self, kind: EventKind, queue: &DispatchQueue, listener: F) -> ListenerId
    where
        F: Fn(&DrmEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.entry(kind).or_default().push(Registration {
            id,
            queue: queue.clone(),
            listener: Arc::new(listener),
        });
        debug!(%kind, queue = queue.name(), "registered event listener");
        id
    }

    /// Removes a listener. Events already queued for it are still delivered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for registrations in registry.values_mut() {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            removed |= registrations.len() != before;
        }
        removed
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.get(&kind).map_or(0, Vec::len)
    }

    /// Enqueues `event` for every listener of its kind. Never blocks.
    pub fn emit(&self, event: DrmEvent) {
        let kind = event.kind();
        self.metrics.event(kind);

        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let Some(registrations) = registry.get(&kind) else {
            return;
        };

        // One job per queue, listeners kept in registration order.
        let mut batches: Vec<(&DispatchQueue, Vec<Listener>)> = Vec::new();
        for registration in registrations {
            match batches.iter_mut().find(|(q, _)| q.id == registration.queue.id) {
                Some((_, listeners)) => listeners.push(Arc::clone(&registration.listener)),
                None => batches.push((
                    &registration.queue,
                    vec![Arc::clone(&registration.listener)],
                )),
            }
        }

        let event = Arc::new(event);
        for (queue, listeners) in batches {
            queue.submit(Job::Deliver {
                event: Arc::clone(&event),
                listeners,
            });
        }
    }
}
