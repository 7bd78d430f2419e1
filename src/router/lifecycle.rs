//! In-flight bookkeeping and graceful shutdown
//!
//! Every dispatched request, notification and background task is recorded
//! here until it completes. Once shutdown has been initiated, the last
//! completion fires the shutdown signal.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Something dispatched but not completed yet
#[derive(Debug, Clone)]
pub struct InFlight {
    pub started_at: Instant,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Task,
}

#[derive(Default)]
struct Tables {
    requests: HashMap<u64, InFlight>,
    tasks: HashMap<u64, InFlight>,
    request_seed: u64,
    task_seed: u64,
    shutting_down: bool,
    completed: bool,
}

impl Tables {
    fn len(&self) -> usize {
        self.requests.len() + self.tasks.len()
    }

    fn log_outstanding(&self) {
        info!("In-flight requests/background tasks preventing shutdown:");
        for item in self.requests.values().chain(self.tasks.values()) {
            info!(" - {} ({:?})", item.description, item.started_at.elapsed());
        }
    }
}

pub(crate) struct Lifecycle {
    tables: Mutex<Tables>,
    initiated: AtomicBool,
    /// Fired exactly once, when shutdown completes
    shutdown: CancellationToken,
    /// Parent of every background task's token
    background: CancellationToken,
    log_interval: Duration,
}

/// Removes its entry from the in-flight tables when dropped
pub(crate) struct Tracked {
    lifecycle: Arc<Lifecycle>,
    kind: Kind,
    id: u64,
}

impl Tracked {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.lifecycle.finished(self.kind, self.id);
    }
}

impl Lifecycle {
    pub(crate) fn new(log_interval: Duration) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            initiated: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            background: CancellationToken::new(),
            log_interval,
        }
    }

    pub(crate) fn background_token(&self) -> &CancellationToken {
        &self.background
    }

    pub(crate) fn shutdown_signal(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.tables.lock().shutting_down
    }

    /// Record a dispatched request or notification
    pub(crate) fn request_started(self: &Arc<Self>, label: &str) -> Tracked {
        let mut tables = self.tables.lock();
        let id = tables.request_seed;
        tables.request_seed += 1;
        tables.requests.insert(
            id,
            InFlight {
                started_at: Instant::now(),
                description: format!("[req {}] {}", id, label),
            },
        );
        Tracked {
            lifecycle: self.clone(),
            kind: Kind::Request,
            id,
        }
    }

    /// Record a queued background task
    pub(crate) fn task_queued(self: &Arc<Self>, description: &str) -> Tracked {
        let mut tables = self.tables.lock();
        let id = tables.task_seed;
        tables.task_seed += 1;
        tables.tasks.insert(
            id,
            InFlight {
                started_at: Instant::now(),
                description: format!("[task {}] {}", id, description),
            },
        );
        Tracked {
            lifecycle: self.clone(),
            kind: Kind::Task,
            id,
        }
    }

    fn finished(&self, kind: Kind, id: u64) {
        let mut tables = self.tables.lock();
        let removed = match kind {
            Kind::Request => tables.requests.remove(&id),
            Kind::Task => tables.tasks.remove(&id),
        };

        if tables.shutting_down {
            if let Some(item) = removed {
                info!("While shutting down, {} has completed", item.description);
            }
            self.opportunistic_shutdown(&mut tables);
        }
    }

    // caller must hold the tables lock
    fn opportunistic_shutdown(&self, tables: &mut Tables) {
        if tables.len() == 0 {
            self.complete_shutdown(tables);
        } else {
            tables.log_outstanding();
        }
    }

    fn complete_shutdown(&self, tables: &mut Tables) {
        if tables.completed {
            return;
        }
        tables.completed = true;
        info!("No in-flight requests left, we can shut down now.");
        self.shutdown.cancel();
    }

    /// Begin graceful shutdown. Only the first call has any effect.
    pub(crate) fn initiate_shutdown(self: &Arc<Self>) {
        if self.initiated.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Initiating graceful shutdown");
        {
            let mut tables = self.tables.lock();
            tables.shutting_down = true;
            self.opportunistic_shutdown(&mut tables);
        }
        self.background.cancel();

        if self.shutdown.is_cancelled() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.clone().log_periodically());
            }
            Err(_) => tracing::debug!("No runtime, outstanding work won't be logged periodically"),
        }
    }

    async fn log_periodically(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.log_interval);
        // The first tick fires immediately, initiation already logged
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let tables = self.tables.lock();
                    if !tables.completed {
                        tables.log_outstanding();
                    }
                }
            }
        }
    }

    /// Snapshot of everything still in flight
    pub(crate) fn outstanding(&self) -> Vec<InFlight> {
        let tables = self.tables.lock();
        tables
            .requests
            .values()
            .chain(tables.tasks.values())
            .cloned()
            .collect()
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.tables.lock().len()
    }
}
