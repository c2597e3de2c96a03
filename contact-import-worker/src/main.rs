use std::sync::Arc;

use anyhow::Error;
use contact_import_worker::{
    api::{self, serve, setup_metrics_routes, ApiState},
    config::Config,
    context::AppContext,
    job::Job,
    metrics_consts::{JOBS_ABANDONED, JOBS_RUNNING, JOB_CLAIM_FAILED},
};
use envconfig::Envconfig;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config, context: Arc<AppContext>) -> Result<JoinHandle<()>, Error> {
    let state = ApiState {
        jobs: context.store.clone(),
        publisher: context.publisher.clone(),
        registry: context.registry.clone(),
    };
    let router = api::router(state, context.health_registry.clone());
    let router = setup_metrics_routes(router)?;

    let bind = (config.host.clone(), config.port);
    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, bind).await {
            error!("Failed to serve http: {:?}", e);
        }
    }))
}

fn reap_finished(running: &mut JoinSet<()>) {
    while let Some(res) = running.try_join_next() {
        if let Err(e) = res {
            error!("Job task panicked: {:?}", e);
        }
    }
}

#[tokio::main]
pub async fn main() -> Result<(), Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env()?;
    let context = Arc::new(AppContext::new(&config).await?);

    context.clone().spawn_shutdown_listener();

    start_server(&config, context.clone())?;

    let liveness = context.worker_liveness.clone();
    let poll_interval = config.job_poll_interval();
    let mut running = JoinSet::new();

    while context.is_running() {
        liveness.report_healthy();
        reap_finished(&mut running);

        // Waiting on a slot is bounded so liveness keeps being reported
        let permit = match tokio::time::timeout(
            poll_interval,
            context.job_slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        };
        if !context.is_running() {
            break;
        }

        match context.store.fail_abandoned_jobs().await {
            Ok(ids) => metrics::counter!(JOBS_ABANDONED).increment(ids.len() as u64),
            Err(e) => warn!("Failed to sweep abandoned jobs: {:?}", e),
        }

        let model = match context.store.claim_next_job().await {
            Ok(Some(model)) => model,
            Ok(None) => {
                drop(permit);
                info!("No available job found, sleeping");
                tokio::time::sleep(poll_interval).await;
                continue;
            }
            Err(e) => {
                drop(permit);
                warn!("Failed to claim a job: {:?}", e);
                metrics::counter!(JOB_CLAIM_FAILED).increment(1);
                tokio::time::sleep(poll_interval).await;
                continue;
            }
        };

        let job_id = model.id;
        info!(job_id = %job_id, "Claimed job");
        let cancel = context.registry.register(job_id);
        let job = Job::new(model, context.services(), cancel);
        let ctx = context.clone();

        running.spawn(async move {
            metrics::gauge!(JOBS_RUNNING).increment(1.0);
            let result = job.run().await;
            metrics::gauge!(JOBS_RUNNING).decrement(1.0);
            ctx.registry.remove(job_id);
            drop(permit);

            // The job stays leased and is left for manual intervention
            if let Err(e) = result {
                error!(job_id = %job_id, "Failed to record job outcome: {:?}", e);
            }
        });
    }

    info!("Shutting down, waiting for {} running job(s)", running.len());
    while let Some(res) = running.join_next().await {
        if let Err(e) = res {
            error!("Job task panicked: {:?}", e);
        }
    }
    info!("Shut down");

    Ok(())
}
