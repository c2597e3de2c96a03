use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Error};
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    health::{HealthHandle, HealthRegistry},
    job::{CancelSignal, JobServices},
    progress::ProgressPublisher,
    store::postgres::PgStore,
};

/// Cancellation signals of the jobs running in this process.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<DashMap<Uuid, CancelSignal>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: Uuid) -> CancelSignal {
        self.jobs.entry(job_id).or_default().clone()
    }

    /// False if the job isn't running here.
    pub fn cancel(&self, job_id: Uuid, reason: &str) -> bool {
        match self.jobs.get(&job_id) {
            Some(signal) => {
                signal.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: Uuid) {
        self.jobs.remove(&job_id);
    }

    pub fn cancel_all(&self, reason: &str) {
        for entry in self.jobs.iter() {
            entry.value().cancel(reason);
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

pub struct AppContext {
    pub config: Config,
    pub store: Arc<PgStore>,
    pub publisher: Arc<ProgressPublisher>,
    pub registry: JobRegistry,
    pub health_registry: HealthRegistry,
    pub worker_liveness: HealthHandle,
    // One permit per job allowed to run at once
    pub job_slots: Arc<Semaphore>,
    running: AtomicBool,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, Error> {
        let health_registry = HealthRegistry::new("liveness");
        // The loop reports at least once per poll interval
        let worker_liveness = health_registry.register(
            "worker".to_string(),
            config.job_poll_interval() * 3 + Duration::from_secs(30),
        );

        let options = PgPoolOptions::new().max_connections(config.max_pg_connections);
        let db = options.connect(&config.database_url).await?;

        if config.run_migrations {
            info!("Running migrations");
            sqlx::migrate!("./migrations")
                .run(&db)
                .await
                .context("Running migrations")?;
        }

        Ok(Self {
            config: config.clone(),
            store: Arc::new(PgStore::new(db, config.job_lease())),
            publisher: Arc::new(ProgressPublisher::new()),
            registry: JobRegistry::new(),
            health_registry,
            worker_liveness,
            job_slots: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            running: AtomicBool::new(true),
        })
    }

    pub fn services(&self) -> JobServices {
        JobServices {
            contacts: self.store.clone(),
            jobs: self.store.clone(),
            publisher: self.publisher.clone(),
            settings: self.config.pipeline_settings(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops claiming jobs and cancels the running ones on SIGINT or SIGTERM.
    pub fn spawn_shutdown_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, cancelling {} job(s)", self.registry.len());
            self.running.store(false, Ordering::SeqCst);
            self.registry.cancel_all("worker shutting down");
        });
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
