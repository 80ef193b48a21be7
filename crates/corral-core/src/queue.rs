//! Event queue: a bounded channel drained by exactly one worker task.
//!
//! # Architecture
//!
//! Producers (wire readers, sessions, handlers) hold an [`EventSubmitter`].
//! The single worker takes events in submission order, resolves the target
//! domain by reference and runs the [`EventHandler`] to completion before
//! taking the next event. Handlers acquire jobs exactly like API callers do,
//! so a slow handler only delays later events; it never blocks producers
//! beyond the queue capacity.
//!
//! # Example
//!
//! ```ignore
//! let queue = EventQueue::start(1024, resolver, handler);
//! queue.submitter().submit(Event::new(domain_ref, EventKind::MonitorEof { generation: 1 })).await?;
//! queue.shutdown().await; // rejects new events, drains the rest
//! ```

use crate::domain::{Domain, DomainRef};
use crate::error::{CoreError, Result};
use crate::event::Event;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

// ============================================================================
// Seams
// ============================================================================

/// Reacts to one event. Called by the worker, one event at a time.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process `event` for `domain`.
    async fn handle(&self, domain: Arc<Domain>, event: Event) -> Result<()>;
}

/// Looks a domain up again from the reference stored in an event.
#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// The live domain, or `None` if it is gone.
    async fn resolve(&self, domain: &DomainRef) -> Option<Arc<Domain>>;
}

// ============================================================================
// Statistics
// ============================================================================

/// Queue counters.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Events accepted by `submit`/`try_submit`/`submit_detached`.
    pub submitted: AtomicU64,
    /// Events the handler finished without error.
    pub handled: AtomicU64,
    /// Events whose handler failed or panicked.
    pub failed: AtomicU64,
    /// Events dropped because their domain was gone.
    pub orphaned: AtomicU64,
}

impl QueueStats {
    /// Events taken off the queue so far.
    pub fn processed(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
            + self.orphaned.load(Ordering::Relaxed)
    }
}

struct Shared {
    capacity: usize,
    closed: AtomicBool,
    close_notify: Notify,
    stats: QueueStats,
}

// ============================================================================
// Submitter
// ============================================================================

/// Cloneable handle for adding events.
#[derive(Clone)]
pub struct EventSubmitter {
    tx: mpsc::Sender<Event>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubmitter")
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EventSubmitter {
    /// Add an event, waiting for room if the queue is full.
    pub async fn submit(&self, event: Event) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::QueueClosed);
        }
        let kind = event.kind.name();
        self.tx
            .send(event)
            .await
            .map_err(|_| CoreError::QueueClosed)?;
        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(kind, "Event queued");
        Ok(())
    }

    /// Add an event without waiting.
    pub fn try_submit(&self, event: Event) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::QueueClosed);
        }
        match self.tx.try_send(event) {
            Ok(()) => {
                self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(CoreError::QueueFull(self.shared.capacity)),
            Err(TrySendError::Closed(_)) => Err(CoreError::QueueClosed),
        }
    }

    /// Add an event from a context that cannot wait (while holding the
    /// object lock, or from `Drop`). If the queue is full the send is
    /// finished by a background task.
    pub fn submit_detached(&self, event: Event) {
        if self.is_closed() {
            tracing::debug!(kind = event.kind.name(), domain = %event.domain, "Event queue closed, event dropped");
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {
                self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                tracing::warn!(kind = event.kind.name(), domain = %event.domain, "Event queue full, deferring submit");
                let submitter = self.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = submitter.submit(event).await {
                                tracing::warn!(error = %e, "Deferred event submit failed");
                            }
                        });
                    }
                    Err(_) => tracing::error!(kind = event.kind.name(), "No runtime for deferred submit, event dropped"),
                }
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(kind = event.kind.name(), "Event queue closed, event dropped");
            }
        }
    }

    /// Whether the queue stopped accepting events.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Events waiting for the worker.
    pub fn pending(&self) -> usize {
        self.shared.capacity - self.tx.capacity()
    }

    /// Queue counters.
    pub fn stats(&self) -> &QueueStats {
        &self.shared.stats
    }
}

// ============================================================================
// Queue
// ============================================================================

/// The bounded queue plus its worker.
pub struct EventQueue {
    submitter: EventSubmitter,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    /// Create the queue and spawn its worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        capacity: usize,
        resolver: Arc<dyn DomainResolver>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(Shared {
            capacity,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            stats: QueueStats::default(),
        });

        let worker = tokio::spawn(Self::worker_loop(rx, Arc::clone(&shared), resolver, handler));
        tracing::info!(capacity, "Event worker started");

        Self {
            submitter: EventSubmitter { tx, shared },
            worker: Mutex::new(Some(worker)),
        }
    }

    /// A handle for producers.
    pub fn submitter(&self) -> EventSubmitter {
        self.submitter.clone()
    }

    /// Queue counters.
    pub fn stats(&self) -> &QueueStats {
        self.submitter.stats()
    }

    /// Stop accepting events, let the worker finish what is queued, and
    /// wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        tracing::info!(pending = self.submitter.pending(), "Draining event queue");
        self.submitter.shared.closed.store(true, Ordering::Release);
        self.submitter.shared.close_notify.notify_one();

        if let Err(e) = worker.await {
            tracing::error!(error = ?e, "Event worker panicked during shutdown");
        }
        let stats = self.stats();
        tracing::info!(
            submitted = stats.submitted.load(Ordering::Relaxed),
            handled = stats.handled.load(Ordering::Relaxed),
            failed = stats.failed.load(Ordering::Relaxed),
            orphaned = stats.orphaned.load(Ordering::Relaxed),
            "Event worker stopped"
        );
    }

    async fn worker_loop(
        mut rx: mpsc::Receiver<Event>,
        shared: Arc<Shared>,
        resolver: Arc<dyn DomainResolver>,
        handler: Arc<dyn EventHandler>,
    ) {
        tracing::debug!("Worker loop started");
        let mut seq = 0u64;
        let mut draining = false;

        loop {
            let received = tokio::select! {
                biased;

                _ = shared.close_notify.notified(), if !draining => {
                    // Buffered events are still delivered after close().
                    rx.close();
                    draining = true;
                    continue;
                }

                received = rx.recv() => received,
            };
            let Some(mut event) = received else {
                break;
            };

            seq += 1;
            event.seq = seq;
            let kind = event.kind.name();

            let Some(domain) = resolver.resolve(&event.domain).await else {
                shared.stats.orphaned.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(seq, kind, domain = %event.domain, "Domain gone, event dropped");
                continue;
            };

            tracing::debug!(seq, kind, domain = %domain.name(), "Handling event");
            let task = {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler.handle(domain, event).await })
            };
            match task.await {
                Ok(Ok(())) => {
                    shared.stats.handled.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(seq, kind, error = %e, "Event handler failed");
                }
                Err(e) => {
                    shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(seq, kind, error = ?e, "Event handler panicked");
                }
            }
        }

        tracing::debug!(processed = shared.stats.processed(), "Worker loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
