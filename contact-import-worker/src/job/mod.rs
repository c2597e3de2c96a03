use std::{
    io::Read,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Error;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::FatalError,
    metrics_consts::{JOBS_TOTAL, JOB_DURATION_MS, SNAPSHOT_PERSIST_FAILED},
    parse::decoder::{DecodeOptions, RowDecoder},
    progress::ProgressPublisher,
    source::DataSource,
    store::{ContactStore, JobStore},
};

use backoff::BackoffPolicy;
use model::{ImportJob, JobStateError};
use pipeline::{PipelineEvent, PipelineParams};

pub mod backoff;
pub mod config;
pub mod model;
pub mod pipeline;

// Attempts at persisting the terminal state of a job before giving up on it
const FINAL_SAVE_ATTEMPTS: u32 = 5;

/// Tuning shared by every job a worker runs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Rows per chunk handed from the decoder downstream
    pub chunk_rows: usize,
    /// Chunks buffered between two stages
    pub channel_chunks: usize,
    pub snapshot_interval: Duration,
    pub max_consecutive_failed_batches: u32,
    pub backoff: BackoffPolicy,
    pub cross_job_dedup: bool,
    pub preview_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunk_rows: 1000,
            channel_chunks: 10,
            snapshot_interval: Duration::from_secs(1),
            max_consecutive_failed_batches: 3,
            backoff: BackoffPolicy::batch_retry(),
            cross_job_dedup: true,
            preview_chars: 200,
        }
    }
}

/// The collaborators a job needs, shared between all jobs of a worker.
#[derive(Clone)]
pub struct JobServices {
    pub contacts: Arc<dyn ContactStore>,
    pub jobs: Arc<dyn JobStore>,
    pub publisher: Arc<ProgressPublisher>,
    pub settings: PipelineSettings,
}

/// Cancellation of one job, carrying the reason recorded on the failed job.
#[derive(Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<OnceCell<String>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first reason given wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self.reason.set(reason.into()).is_err() {
            debug!("job already cancelled, keeping the first reason");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn reason(&self) -> String {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| "import cancelled".to_string())
    }

    pub fn error(&self) -> FatalError {
        FatalError::Cancelled(self.reason())
    }
}

/// Runs one import from pending to a terminal status. Owns the job record and its
/// counts for the whole run; nothing else mutates them.
pub struct Job {
    pub model: ImportJob,
    services: JobServices,
    cancel: CancelSignal,
}

impl Job {
    pub fn new(model: ImportJob, services: JobServices, cancel: CancelSignal) -> Self {
        Self {
            model,
            services,
            cancel,
        }
    }

    /// Returns the job in its terminal state. Errs only if that state could not be saved.
    pub async fn run(mut self) -> Result<ImportJob, Error> {
        let started = Instant::now();
        info!(
            job_id = %self.model.id,
            source = %self.model.source_name,
            "starting import"
        );

        let outcome = match self.execute().await {
            Ok(()) => self.model.complete().map_err(internal),
            Err(e) => Err(e),
        };

        if let Err(fatal) = outcome {
            if fatal.is_cancellation() {
                info!(job_id = %self.model.id, "import stopped: {}", fatal);
            } else {
                error!(job_id = %self.model.id, "import failed: {}", fatal);
            }
            if let Err(e) = self.model.fail(fatal.to_string(), fatal.user_message()) {
                error!(job_id = %self.model.id, "could not mark job as failed: {}", e);
            }
        }

        self.save_final().await?;
        self.services.publisher.publish(self.model.snapshot());

        let status = self.model.status.as_str();
        metrics::counter!(JOBS_TOTAL, &[("status", status)]).increment(1);
        metrics::histogram!(JOB_DURATION_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        info!(
            job_id = %self.model.id,
            status,
            processed = self.model.processed_rows,
            successful = self.model.successful_rows,
            errors = self.model.error_rows,
            duplicates = self.model.duplicate_rows,
            "import finished"
        );
        Ok(self.model)
    }

    async fn execute(&mut self) -> Result<(), FatalError> {
        // Everything that can be checked without reading the source is checked first
        self.model.field_mapping.validate()?;
        self.model.options.validate()?;
        let decode_options = self.model.options.decode_options()?;
        if self.cancel.is_cancelled() {
            return Err(self.cancel.error());
        }

        let source: Arc<dyn DataSource> = Arc::from(self.model.source.construct());
        let (reader, size) = open_source(source.clone()).await?;
        debug!(
            job_id = %self.model.id,
            source = %source.describe(),
            ?size,
            "source opened"
        );

        self.model.start().map_err(internal)?;
        self.checkpoint().await;

        if self.model.options.count_rows_first {
            let total = count_rows(source, decode_options).await?;
            info!(job_id = %self.model.id, total, "counted rows");
            self.model.set_total_rows(total).map_err(internal)?;
            self.checkpoint().await;
        }

        let decoder = tokio::task::spawn_blocking(move || RowDecoder::new(reader, &decode_options))
            .await
            .map_err(|e| FatalError::Internal(format!("decoder setup panicked: {e}")))??;
        let bindings = self.model.field_mapping.bind(decoder.header())?;
        debug!(
            job_id = %self.model.id,
            columns = decoder.header().len(),
            delimiter = %char::from(decoder.delimiter()),
            "header decoded"
        );

        let (events_tx, events_rx) = mpsc::channel(self.services.settings.channel_chunks.max(1) * 4);
        let running = pipeline::spawn(
            decoder,
            PipelineParams {
                job_id: self.model.id,
                batch_size: self.model.options.batch_size,
                bindings: Arc::new(bindings),
                settings: self.services.settings.clone(),
                contacts: self.services.contacts.clone(),
                cancel: self.cancel.clone(),
            },
            events_tx,
        );

        let drained = self.drive(events_rx).await;
        let joined = running.join().await;
        joined.and(drained)
    }

    // Applies progress from the stages until they all hang up
    async fn drive(&mut self, mut events: mpsc::Receiver<PipelineEvent>) -> Result<(), FatalError> {
        let interval = self.services.settings.snapshot_interval;
        let mut last_save = Instant::now();

        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::Progress(delta) => {
                    self.model.apply(delta).map_err(internal)?;
                    self.services.publisher.publish(self.model.snapshot());
                    if last_save.elapsed() >= interval {
                        self.checkpoint().await;
                        last_save = Instant::now();
                    }
                }
                PipelineEvent::EndOfInput { rows } => {
                    if let Some(counted) = self.model.total_rows.filter(|c| *c != rows) {
                        warn!(
                            job_id = %self.model.id,
                            counted,
                            decoded = rows,
                            "source changed between counting and decoding"
                        );
                    }
                    self.model.set_total_rows(rows).map_err(internal)?;
                }
            }
        }
        Ok(())
    }

    // Best effort, a missed intermediate snapshot is superseded by the next one
    async fn checkpoint(&mut self) {
        self.services.publisher.publish(self.model.snapshot());
        if let Err(e) = self.services.jobs.save_job(&self.model).await {
            warn!(job_id = %self.model.id, "failed to save job snapshot: {:?}", e);
            metrics::counter!(SNAPSHOT_PERSIST_FAILED).increment(1);
        }
    }

    async fn save_final(&self) -> Result<(), Error> {
        let backoff = self.services.settings.backoff;
        let mut attempt = 0;
        loop {
            match self.services.jobs.save_job(&self.model).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < FINAL_SAVE_ATTEMPTS => {
                    warn!(
                        job_id = %self.model.id,
                        attempt = attempt + 1,
                        "failed to save terminal job state: {:?}",
                        e
                    );
                    metrics::counter!(SNAPSHOT_PERSIST_FAILED).increment(1);
                    tokio::time::sleep(backoff.next_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "Saving terminal state of job {}",
                        self.model.id
                    )))
                }
            }
        }
    }
}

fn internal(e: JobStateError) -> FatalError {
    FatalError::Internal(e.to_string())
}

type OpenedSource = (Box<dyn Read + Send>, Option<u64>);

async fn open_source(source: Arc<dyn DataSource>) -> Result<OpenedSource, FatalError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<OpenedSource> {
        Ok((source.open()?, source.size()?))
    })
    .await
    .map_err(|e| FatalError::Internal(format!("opening source panicked: {e}")))?
    .map_err(FatalError::SourceUnreadable)
}

// Streams the whole source once without decoding fields
async fn count_rows(source: Arc<dyn DataSource>, options: DecodeOptions) -> Result<u64, FatalError> {
    tokio::task::spawn_blocking(move || {
        let reader = source.open().map_err(FatalError::SourceUnreadable)?;
        RowDecoder::new(reader, &options)?.count_remaining()
    })
    .await
    .map_err(|e| FatalError::Internal(format!("row count panicked: {e}")))?
}
