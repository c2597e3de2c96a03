use std::{collections::HashSet, io::Read, sync::Arc};

use rayon::prelude::*;
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    dedup::{probe_for, Classification, DedupKeys, DuplicateReason, DuplicateResolver},
    error::FatalError,
    metrics_consts::{CROSS_JOB_LOOKUP_FAILED, DUPLICATES_TOTAL, ROWS_TOTAL},
    parse::{
        decoder::{DecodedRow, RowDecoder},
        fields::ColumnBindings,
        normalize::{normalize_decoded, NormalizedRow},
    },
    store::{ContactStore, ExistingKeys},
    types::PendingContact,
    writer::BatchWriter,
};

use super::{
    model::{ProgressDelta, RowError},
    CancelSignal, PipelineSettings,
};

/// What the stages tell the coordinator while the job runs.
#[derive(Debug)]
pub enum PipelineEvent {
    Progress(ProgressDelta),
    // Sent once the decoder has read the last row
    EndOfInput { rows: u64 },
}

/// A row after duplicate resolution, in file order.
#[derive(Debug)]
enum Resolved {
    New {
        contact: PendingContact,
        warnings: Vec<RowError>,
    },
    Duplicate {
        row: u64,
        reason: DuplicateReason,
        warnings: Vec<RowError>,
    },
    Invalid(RowError),
}

pub struct PipelineParams {
    pub job_id: Uuid,
    pub batch_size: usize,
    pub bindings: Arc<ColumnBindings>,
    pub settings: PipelineSettings,
    pub contacts: Arc<dyn ContactStore>,
    pub cancel: CancelSignal,
}

/// Handles of the four stages of one job's pipeline.
pub struct RunningPipeline {
    decoder: JoinHandle<Result<(), FatalError>>,
    normalizer: JoinHandle<Result<(), FatalError>>,
    resolver: JoinHandle<Result<(), FatalError>>,
    writer: JoinHandle<Result<(), FatalError>>,
}

impl RunningPipeline {
    /// Waits for every stage. When several fail, the writer's error wins, since an
    /// upstream stage usually only stopped because the writer went away.
    pub async fn join(self) -> Result<(), FatalError> {
        let writer = flatten("writer", self.writer.await);
        let decoder = flatten("decoder", self.decoder.await);
        let normalizer = flatten("normalizer", self.normalizer.await);
        let resolver = flatten("resolver", self.resolver.await);
        writer.and(decoder).and(normalizer).and(resolver)
    }
}

fn flatten(
    stage: &str,
    joined: Result<Result<(), FatalError>, tokio::task::JoinError>,
) -> Result<(), FatalError> {
    joined.map_err(|e| FatalError::Internal(format!("{stage} stage panicked: {e}")))?
}

pub fn spawn<R: Read + Send + 'static>(
    decoder: RowDecoder<R>,
    params: PipelineParams,
    events: Sender<PipelineEvent>,
) -> RunningPipeline {
    let PipelineParams {
        job_id,
        batch_size,
        bindings,
        settings,
        contacts,
        cancel,
    } = params;

    let (decoded_tx, decoded_rx) = mpsc::channel(settings.channel_chunks);
    let (normalized_tx, normalized_rx) = mpsc::channel(settings.channel_chunks);
    let (resolved_tx, resolved_rx) = mpsc::channel(settings.channel_chunks);

    let decoder = {
        let events = events.clone();
        let cancel = cancel.clone();
        let chunk_rows = settings.chunk_rows;
        tokio::task::spawn_blocking(move || {
            decode_stage(decoder, chunk_rows, decoded_tx, events, cancel)
        })
    };

    let normalizer = tokio::spawn(normalize_stage(
        decoded_rx,
        normalized_tx,
        bindings,
        settings.preview_chars,
    ));

    let resolver = tokio::spawn(resolve_stage(
        job_id,
        normalized_rx,
        resolved_tx,
        settings.cross_job_dedup.then(|| contacts.clone()),
    ));

    let batch_writer = BatchWriter::new(
        contacts,
        job_id,
        settings.backoff,
        settings.max_consecutive_failed_batches,
    );
    let writer = tokio::spawn(write_stage(
        job_id,
        resolved_rx,
        batch_writer,
        batch_size,
        events,
        cancel,
    ));

    RunningPipeline {
        decoder,
        normalizer,
        resolver,
        writer,
    }
}

// Runs on a blocking thread. Stops quietly if downstream has gone away.
fn decode_stage<R: Read>(
    mut decoder: RowDecoder<R>,
    chunk_rows: usize,
    tx: Sender<Vec<DecodedRow>>,
    events: Sender<PipelineEvent>,
    cancel: CancelSignal,
) -> Result<(), FatalError> {
    debug!("decoder stage started");
    let mut chunk = Vec::with_capacity(chunk_rows);
    loop {
        if cancel.is_cancelled() {
            debug!(rows = decoder.rows_read(), "decoder stage cancelled");
            return Err(cancel.error());
        }
        let Some(row) = decoder.next_row()? else {
            break;
        };
        chunk.push(row);
        if chunk.len() >= chunk_rows {
            let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_rows));
            if tx.blocking_send(full).is_err() {
                debug!("decoder stage stopped, downstream closed");
                return Ok(());
            }
        }
    }

    if !chunk.is_empty() && tx.blocking_send(chunk).is_err() {
        return Ok(());
    }
    let rows = decoder.rows_read();
    if events
        .blocking_send(PipelineEvent::EndOfInput { rows })
        .is_err()
    {
        warn!("job coordinator stopped listening before end of input");
    }
    debug!(rows, "decoder stage finished");
    Ok(())
}

async fn normalize_stage(
    mut rx: Receiver<Vec<DecodedRow>>,
    tx: Sender<Vec<NormalizedRow>>,
    bindings: Arc<ColumnBindings>,
    preview_chars: usize,
) -> Result<(), FatalError> {
    debug!("normalizer stage started");
    while let Some(chunk) = rx.recv().await {
        let bindings = bindings.clone();
        // Rows are independent, and collect keeps them in file order
        let normalized = tokio::task::spawn_blocking(move || {
            chunk
                .into_par_iter()
                .map(|row| normalize_decoded(row, &bindings, preview_chars))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| FatalError::Internal(format!("normalizer task failed: {e}")))?;

        if tx.send(normalized).await.is_err() {
            debug!("normalizer stage stopped, downstream closed");
            return Ok(());
        }
    }
    debug!("normalizer stage finished");
    Ok(())
}

async fn resolve_stage(
    job_id: Uuid,
    mut rx: Receiver<Vec<NormalizedRow>>,
    tx: Sender<Vec<Resolved>>,
    cross_job: Option<Arc<dyn ContactStore>>,
) -> Result<(), FatalError> {
    debug!("resolver stage started");
    let mut resolver = DuplicateResolver::new();

    while let Some(chunk) = rx.recv().await {
        let keys: Vec<DedupKeys> = chunk
            .iter()
            .filter_map(|row| match row {
                NormalizedRow::Valid { record, .. } => Some(DedupKeys::of(record)),
                NormalizedRow::Invalid(_) => None,
            })
            .collect();

        let existing = match &cross_job {
            Some(store) => lookup_existing(job_id, store.as_ref(), &keys).await,
            None => ExistingKeys::default(),
        };

        let mut keys = keys.into_iter();
        let resolved = chunk
            .into_iter()
            .map(|row| match row {
                NormalizedRow::Valid {
                    row,
                    record,
                    warnings,
                    preview,
                } => {
                    let key = keys.next().unwrap_or_else(|| DedupKeys::of(&record));
                    match resolver.classify(&key, &existing) {
                        Classification::New => Resolved::New {
                            contact: PendingContact {
                                row,
                                record,
                                preview,
                            },
                            warnings,
                        },
                        Classification::Duplicate(reason) => Resolved::Duplicate {
                            row,
                            reason,
                            warnings,
                        },
                    }
                }
                NormalizedRow::Invalid(err) => Resolved::Invalid(err),
            })
            .collect();

        if tx.send(resolved).await.is_err() {
            debug!("resolver stage stopped, downstream closed");
            return Ok(());
        }
    }
    debug!(keys = resolver.len(), "resolver stage finished");
    Ok(())
}

// A failed lookup only weakens deduplication for this chunk, it never stops the job
async fn lookup_existing(
    job_id: Uuid,
    store: &dyn ContactStore,
    keys: &[DedupKeys],
) -> ExistingKeys {
    let probe = probe_for(keys);
    if probe.is_empty() {
        return ExistingKeys::default();
    }
    match store.find_existing(&probe).await {
        Ok(existing) => existing,
        Err(e) => {
            warn!(
                job_id = %job_id,
                "cross-job duplicate lookup failed, checking this chunk in-job only: {:?}",
                e
            );
            metrics::counter!(CROSS_JOB_LOOKUP_FAILED).increment(1);
            ExistingKeys::default()
        }
    }
}

async fn write_stage(
    job_id: Uuid,
    mut rx: Receiver<Vec<Resolved>>,
    mut writer: BatchWriter,
    batch_size: usize,
    events: Sender<PipelineEvent>,
    cancel: CancelSignal,
) -> Result<(), FatalError> {
    debug!(job_id = %job_id, "writer stage started");
    let mut batch = Vec::with_capacity(batch_size);
    let mut delta = ProgressDelta::default();

    while let Some(chunk) = rx.recv().await {
        for item in chunk {
            match item {
                Resolved::New { contact, warnings } => {
                    delta.issues.extend(warnings);
                    batch.push(contact);
                }
                Resolved::Duplicate {
                    row,
                    reason,
                    warnings,
                } => {
                    debug!(job_id = %job_id, row, reason = %reason, "duplicate row");
                    metrics::counter!(DUPLICATES_TOTAL, &[("reason", reason.as_str())])
                        .increment(1);
                    metrics::counter!(ROWS_TOTAL, &[("outcome", "duplicate")]).increment(1);
                    delta.duplicates += 1;
                    delta.issues.extend(warnings);
                }
                Resolved::Invalid(err) => {
                    metrics::counter!(ROWS_TOTAL, &[("outcome", "error")]).increment(1);
                    delta.errors += 1;
                    delta.issues.push(err);
                }
            }

            if batch.len() >= batch_size {
                flush(&mut writer, &mut batch, &mut delta, &events, &cancel).await?;
            } else if delta.rows() >= batch_size as u64 {
                // Long runs of duplicates or bad rows still show up as progress
                report(&events, &mut delta).await?;
            }
        }
    }

    flush(&mut writer, &mut batch, &mut delta, &events, &cancel).await?;
    debug!(job_id = %job_id, "writer stage finished");
    Ok(())
}

async fn flush(
    writer: &mut BatchWriter,
    batch: &mut Vec<PendingContact>,
    delta: &mut ProgressDelta,
    events: &Sender<PipelineEvent>,
    cancel: &CancelSignal,
) -> Result<(), FatalError> {
    if cancel.is_cancelled() {
        // The pending batch is dropped along with the warnings of its rows, rows
        // already resolved are still reported
        let dropped: HashSet<u64> = batch.drain(..).map(|p| p.row).collect();
        delta.issues.retain(|issue| !dropped.contains(&issue.row));
        report(events, delta).await?;
        return Err(cancel.error());
    }

    if !batch.is_empty() {
        let outcome = writer.write(std::mem::take(batch)).await;
        metrics::counter!(ROWS_TOTAL, &[("outcome", "written")]).increment(outcome.written);
        metrics::counter!(ROWS_TOTAL, &[("outcome", "error")])
            .increment(outcome.errors.len() as u64);
        delta.successful += outcome.written;
        delta.errors += outcome.errors.len() as u64;
        delta.issues.extend(outcome.errors);
    }
    report(events, delta).await?;

    if writer.outage_exceeded() {
        return Err(FatalError::DestinationUnavailable(format!(
            "{} consecutive batches failed to write",
            writer.consecutive_failures()
        )));
    }
    Ok(())
}

async fn report(events: &Sender<PipelineEvent>, delta: &mut ProgressDelta) -> Result<(), FatalError> {
    if delta.is_empty() {
        return Ok(());
    }
    events
        .send(PipelineEvent::Progress(std::mem::take(delta)))
        .await
        .map_err(|_| FatalError::Internal("job coordinator stopped listening".to_string()))
}
