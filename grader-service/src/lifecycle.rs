//! Startup and shutdown ordering for the worker service.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use grader_config::Config;
use grader_job_queue::{Broker, JobQueue};
use grader_workers::{GradeFn, LifecycleTracker, WorkerPool};

use crate::artifacts::ArtifactStore;
use crate::config_helpers::{
    artifacts_from_config, broker_from_config, parse_bind_address, pool_config_from_config,
    queue_options_from_config, resolve_concurrency, tracker_from_config,
};
use crate::error::ServiceError;
use crate::grading::CommandGrader;
use crate::health::{self, HealthState};
use crate::submit::SubmissionService;

/// Overrides for the components normally built from config.
#[derive(Default)]
pub struct ServiceDeps {
    pub broker: Option<Arc<dyn Broker>>,
    pub tracker: Option<Arc<dyn LifecycleTracker>>,
    pub artifacts: Option<Arc<dyn ArtifactStore>>,
    pub grade: Option<GradeFn>,
}

/// A running grader: queue, worker pool and health endpoint.
pub struct GraderService {
    queue: JobQueue,
    pool: Arc<WorkerPool>,
    tracker: Arc<dyn LifecycleTracker>,
    artifacts: Arc<dyn ArtifactStore>,
    shutdown: CancellationToken,
    health: Mutex<Option<JoinHandle<()>>>,
    health_addr: SocketAddr,
}

impl GraderService {
    /// Open storage, connect the queue, start the pool, then serve health.
    pub async fn start(config: &Config, deps: ServiceDeps) -> Result<Self, ServiceError> {
        let tracker = match deps.tracker {
            Some(tracker) => tracker,
            None => tracker_from_config(&config.storage).await?,
        };
        let artifacts: Arc<dyn ArtifactStore> = match deps.artifacts {
            Some(artifacts) => artifacts,
            None => Arc::new(artifacts_from_config(&config.storage).await?),
        };
        let grade = match deps.grade {
            Some(grade) => grade,
            None => CommandGrader::from_config(&config.grading, Arc::clone(&artifacts))
                .ok_or(ServiceError::NoGrader)?
                .into_grade_fn(),
        };
        let broker = deps
            .broker
            .unwrap_or_else(|| broker_from_config(&config.queue));

        let queue = JobQueue::new(broker, queue_options_from_config(&config.queue));
        let shutdown = CancellationToken::new();
        let pool = Arc::new(
            WorkerPool::new(
                queue.clone(),
                Arc::clone(&tracker),
                grade,
                pool_config_from_config(config),
            )
            .with_shutdown(shutdown.clone()),
        );

        let concurrency = resolve_concurrency(config.workers.concurrency);
        if let Err(e) = pool.start(concurrency).await {
            if let Err(stop_err) = queue.stop().await {
                warn!(error = %stop_err, "failed to stop queue after pool start failure");
            }
            return Err(e.into());
        }

        let addr = parse_bind_address(&config.server.host, config.server.port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(%addr, error = %e, "failed to bind health endpoint");
                shutdown.cancel();
                if let Err(stop_err) = pool.stop().await {
                    warn!(error = %stop_err, "failed to stop pool after bind failure");
                }
                if let Err(stop_err) = queue.stop().await {
                    warn!(error = %stop_err, "failed to stop queue after bind failure");
                }
                return Err(e.into());
            }
        };
        let health_addr = listener.local_addr()?;
        let app = health::router(HealthState {
            pool: Arc::clone(&pool),
            queue: queue.clone(),
        });
        let serve_token = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(serve_token.cancelled_owned())
                .await
            {
                error!(error = %e, "health endpoint failed");
            }
        });

        info!(
            %health_addr,
            concurrency,
            topic = %queue.topic(),
            "grader service started"
        );
        Ok(Self {
            queue,
            pool,
            tracker,
            artifacts,
            shutdown,
            health: Mutex::new(Some(handle)),
            health_addr,
        })
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn health_addr(&self) -> SocketAddr {
        self.health_addr
    }

    /// A producer publishing onto this service's queue.
    pub fn submissions(&self) -> SubmissionService {
        SubmissionService::new(
            Arc::clone(&self.artifacts),
            self.queue.clone(),
            Arc::clone(&self.tracker),
        )
    }

    /// Stop intake, drain the pool, close the queue, then the tracker.
    ///
    /// Lifecycle misuse (shutting down twice) aborts the sequence.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        info!("shutting down grader service");
        self.shutdown.cancel();
        self.pool.stop().await?;
        self.queue.stop().await?;
        if let Some(handle) = self.health.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "health endpoint task failed");
            }
        }
        self.tracker.close().await?;

        let stats = self.pool.stats();
        info!(
            graded = stats.graded,
            dead_lettered = stats.dead_lettered,
            abandoned = stats.abandoned,
            "grader service stopped"
        );
        Ok(())
    }

    /// Serve until `signal` is cancelled, then shut down.
    pub async fn run_until(&self, signal: CancellationToken) -> Result<(), ServiceError> {
        signal.cancelled().await;
        info!("shutdown requested");
        self.shutdown().await
    }
}
