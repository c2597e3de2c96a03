use std::{collections::HashMap, sync::Arc, time::Instant};

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{BatchWriteError, RejectedRow},
    job::{backoff::BackoffPolicy, model::RowError},
    metrics_consts::{BATCHES_TOTAL, BATCH_WRITE_MS},
    store::ContactStore,
    types::PendingContact,
};

// One initial attempt and one retry
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub written: u64,
    pub errors: Vec<RowError>,
}

impl BatchOutcome {
    pub fn rows(&self) -> u64 {
        self.written + self.errors.len() as u64
    }
}

/// Writes batches for one job, one at a time, and keeps track of whether the
/// destination looks down.
pub struct BatchWriter {
    store: Arc<dyn ContactStore>,
    job_id: Uuid,
    backoff: BackoffPolicy,
    max_consecutive_failures: u32,
    consecutive_failures: u32,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn ContactStore>,
        job_id: Uuid,
        backoff: BackoffPolicy,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            store,
            job_id,
            backoff,
            max_consecutive_failures,
            consecutive_failures: 0,
        }
    }

    /// True once enough batches in a row have failed for reasons unrelated to their rows.
    pub fn outage_exceeded(&self) -> bool {
        self.consecutive_failures >= self.max_consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Writes the batch, retrying once. Every row of the batch ends up either written
    /// or in `errors`, never both.
    pub async fn write(&mut self, batch: Vec<PendingContact>) -> BatchOutcome {
        let batch_len = batch.len();
        let mut remaining = batch;
        let mut errors = Vec::new();
        let mut last_error = None;
        let mut all_systemic = true;

        for attempt in 0..MAX_ATTEMPTS {
            if remaining.is_empty() {
                break;
            }
            if attempt > 0 {
                tokio::time::sleep(self.backoff.next_delay(attempt - 1)).await;
            }

            let started = Instant::now();
            let result = self.store.insert_batch(self.job_id, &remaining).await;
            metrics::histogram!(BATCH_WRITE_MS).record(started.elapsed().as_secs_f64() * 1000.0);

            let e = match result {
                Ok(_) => {
                    let written = remaining.len() as u64;
                    self.consecutive_failures = 0;
                    let result = if errors.is_empty() { "written" } else { "partial" };
                    metrics::counter!(BATCHES_TOTAL, &[("result", result)]).increment(1);
                    info!(
                        job_id = %self.job_id,
                        rows = batch_len,
                        written,
                        rejected = errors.len(),
                        attempt = attempt + 1,
                        "batch written"
                    );
                    return BatchOutcome { written, errors };
                }
                Err(e) => e,
            };

            all_systemic &= e.is_systemic();
            match e {
                BatchWriteError::RowsRejected(rejected) => {
                    warn!(
                        job_id = %self.job_id,
                        rejected = rejected.len(),
                        attempt = attempt + 1,
                        "store rejected rows of batch, excluding them"
                    );
                    remaining = exclude_rejected(remaining, rejected, &mut errors);
                    last_error = None;
                }
                e => {
                    warn!(
                        job_id = %self.job_id,
                        attempt = attempt + 1,
                        "batch write failed: {}",
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        if remaining.is_empty() {
            // Every row was rejected individually, the store itself answered fine
            self.consecutive_failures = 0;
            metrics::counter!(BATCHES_TOTAL, &[("result", "partial")]).increment(1);
            return BatchOutcome { written: 0, errors };
        }

        let reason = match &last_error {
            Some(e) => e.to_string(),
            None => "rows rejected by the store on retry".to_string(),
        };
        if all_systemic {
            self.consecutive_failures += 1;
        }
        warn!(
            job_id = %self.job_id,
            abandoned = remaining.len(),
            consecutive_failures = self.consecutive_failures,
            "abandoning batch after {} attempts: {}",
            MAX_ATTEMPTS,
            reason
        );
        metrics::counter!(BATCHES_TOTAL, &[("result", "abandoned")]).increment(1);

        let message = format!("batch abandoned after {MAX_ATTEMPTS} attempts: {reason}");
        errors.extend(
            remaining
                .into_iter()
                .map(|p| RowError::error(p.row, vec![], message.clone(), p.preview)),
        );
        BatchOutcome { written: 0, errors }
    }
}

// Splits rejected rows out of the batch, turning them into row errors
fn exclude_rejected(
    batch: Vec<PendingContact>,
    rejected: Vec<RejectedRow>,
    errors: &mut Vec<RowError>,
) -> Vec<PendingContact> {
    let mut rejected: HashMap<usize, RejectedRow> =
        rejected.into_iter().map(|r| (r.position, r)).collect();
    let mut kept = Vec::with_capacity(batch.len());
    for (position, pending) in batch.into_iter().enumerate() {
        match rejected.remove(&position) {
            Some(row) => errors.push(RowError::error(
                pending.row,
                row.fields,
                row.message,
                pending.preview,
            )),
            None => kept.push(pending),
        }
    }
    kept
}
