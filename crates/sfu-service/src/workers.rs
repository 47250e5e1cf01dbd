//! Media worker pool.
//!
//! Owns the media-engine workers for the process lifetime and hands them out
//! in round-robin order for new routers. Each worker gets a watcher task; an
//! unexpected death is logged, the worker is dropped from rotation, and after
//! a grace delay the pool's fatal token is cancelled so `main` exits and the
//! process supervisor restarts the service. Rooms hosted by a dead worker have
//! lost their media path, so partial degradation is not attempted.

use crate::errors::SfuError;
use crate::media::{MediaWorker, WorkerFactory, WorkerResourceUsage, WorkerSettings};
use crate::observability::{record_worker_death, set_workers_active};
use crate::types::WorkerId;

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub worker_settings: WorkerSettings,
    /// Delay between a worker death and tripping the fatal token.
    pub death_grace: Duration,
    /// Host core count reported by `stats()`.
    pub cpu_cores: usize,
}

/// Per-worker entry in [`PoolStats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub worker_id: WorkerId,
    /// `None` if the worker failed to report.
    pub usage: Option<WorkerResourceUsage>,
}

/// Snapshot returned by [`WorkerPool::stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub worker_count: usize,
    pub cpu_cores: usize,
    pub workers: Vec<WorkerStats>,
}

type WorkerList = Arc<RwLock<Vec<Arc<dyn MediaWorker>>>>;

/// Round-robin pool of media workers.
pub struct WorkerPool {
    workers: WorkerList,
    cursor: AtomicUsize,
    cpu_cores: usize,
    fatal: CancellationToken,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `num_workers` workers and start watching them.
    ///
    /// Fails fast: if any worker fails to spawn, the ones already spawned are
    /// closed and the error is returned.
    ///
    /// # Errors
    ///
    /// - `SfuError::Config` if `num_workers` is zero
    /// - `SfuError::MediaEngine` if a worker fails to spawn
    #[instrument(skip_all, name = "sfu.workers.initialize", fields(num_workers = config.num_workers))]
    pub async fn initialize(
        factory: &dyn WorkerFactory,
        config: WorkerPoolConfig,
    ) -> Result<Self, SfuError> {
        if config.num_workers == 0 {
            return Err(SfuError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        let mut spawned: Vec<Arc<dyn MediaWorker>> = Vec::with_capacity(config.num_workers);
        for index in 0..config.num_workers {
            match factory.spawn_worker(&config.worker_settings).await {
                Ok(worker) => {
                    info!(
                        target: "sfu.workers",
                        worker_id = %worker.id(),
                        index = index,
                        "Media worker spawned"
                    );
                    spawned.push(worker);
                }
                Err(e) => {
                    error!(
                        target: "sfu.workers",
                        index = index,
                        error = %e,
                        "Failed to spawn media worker"
                    );
                    for worker in &spawned {
                        worker.close().await;
                    }
                    return Err(SfuError::MediaEngine(format!(
                        "failed to spawn worker {index}: {e}"
                    )));
                }
            }
        }

        let pool = Self {
            workers: Arc::new(RwLock::new(spawned.clone())),
            cursor: AtomicUsize::new(0),
            cpu_cores: config.cpu_cores,
            fatal: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        };

        for worker in spawned {
            pool.spawn_death_watcher(worker, config.death_grace);
        }
        set_workers_active(config.num_workers);

        info!(
            target: "sfu.workers",
            num_workers = config.num_workers,
            cpu_cores = config.cpu_cores,
            "Worker pool initialized"
        );

        Ok(pool)
    }

    fn spawn_death_watcher(&self, worker: Arc<dyn MediaWorker>, grace: Duration) {
        let workers = Arc::clone(&self.workers);
        let fatal = self.fatal.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = worker.died() => {}
                () = shutdown.cancelled() => return,
            }

            let worker_id = worker.id();
            error!(
                target: "sfu.workers",
                worker_id = %worker_id,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "Media worker died, shutting down service after grace period"
            );

            let remaining = {
                let mut list = workers.write().await;
                list.retain(|w| w.id() != worker_id);
                list.len()
            };
            record_worker_death();
            set_workers_active(remaining);

            tokio::select! {
                () = tokio::time::sleep(grace) => fatal.cancel(),
                () = shutdown.cancelled() => {}
            }
        });
    }

    /// Next worker in round-robin order.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Internal` if every worker has died.
    pub async fn next_worker(&self) -> Result<Arc<dyn MediaWorker>, SfuError> {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return Err(SfuError::Internal("no live media workers".to_string()));
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % workers.len();
        workers
            .get(index)
            .cloned()
            .ok_or_else(|| SfuError::Internal("worker index out of range".to_string()))
    }

    /// Number of live workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Worker count, host core count and per-worker resource usage.
    pub async fn stats(&self) -> PoolStats {
        let workers = self.workers.read().await.clone();
        let mut entries = Vec::with_capacity(workers.len());
        for worker in &workers {
            let usage = match worker.resource_usage().await {
                Ok(usage) => Some(usage),
                Err(e) => {
                    warn!(
                        target: "sfu.workers",
                        worker_id = %worker.id(),
                        error = %e,
                        "Failed to read worker resource usage"
                    );
                    None
                }
            };
            entries.push(WorkerStats {
                worker_id: worker.id(),
                usage,
            });
        }

        PoolStats {
            worker_count: entries.len(),
            cpu_cores: self.cpu_cores,
            workers: entries,
        }
    }

    /// Token cancelled once a worker death has outlived the grace delay.
    #[must_use]
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Stop the watchers and close every worker.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let workers: Vec<_> = self.workers.write().await.drain(..).collect();
        for worker in &workers {
            worker.close().await;
        }
        set_workers_active(0);
        info!(target: "sfu.workers", closed = workers.len(), "Worker pool closed");
    }
}
