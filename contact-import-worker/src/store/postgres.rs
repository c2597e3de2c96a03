use std::{collections::HashSet, time::Duration};

use anyhow::{Context, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use sqlx::{
    postgres::{PgPool, PgQueryResult, PgRow},
    Row,
};
use tracing::warn;
use uuid::Uuid;

use crate::{
    dedup::DedupKeys,
    error::{BatchWriteError, RejectedRow},
    job::{
        config::ImportOptions,
        model::{ErrorLog, ImportJob, JobStatus},
    },
    parse::fields::ContactField,
    types::{ContactActivity, PendingContact},
};

use super::{ContactStore, ExistingKeys, JobStore, KeyProbe};

const UNIQUE_VIOLATION: &str = "23505";

const ABANDONED_USER_MESSAGE: &str =
    "The import stopped unexpectedly. Rows imported so far have been kept.";

// One array parameter per contacts column, in the order they are bound
static INSERT_CONTACTS: Lazy<String> = Lazy::new(|| {
    let mut columns = vec![("id", "uuid"), ("import_job_id", "uuid")];
    columns.extend(ContactField::ALL.iter().map(|f| (f.as_str(), "text")));
    columns.extend([
        ("email_domain", "text"),
        ("lead_score", "int4"),
        ("dedup_name_key", "text"),
        ("dedup_company_key", "text"),
    ]);

    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    let arrays: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, (_, ty))| format!("${}::{}[]", i + 1, ty))
        .collect();
    format!(
        "INSERT INTO contacts ({}) SELECT * FROM UNNEST({})",
        names.join(", "),
        arrays.join(", ")
    )
});

const JOB_COLUMNS: &str = r#"
    id, source_name, source, field_mapping, options, status,
    total_rows, processed_rows, successful_rows, error_rows, duplicate_rows,
    errors, status_message, display_status_message, lease_id,
    created_at, started_at, completed_at
"#;

/// Postgres backed contact and job storage, sharing one pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lease: Duration,
}

impl PgStore {
    /// `lease` is how long a claimed job stays reserved for this worker after each save.
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    /// Leases the oldest pending job nobody else holds. A job whose row can't be
    /// parsed is failed on the spot and `None` returned, so one bad row doesn't
    /// stop the worker.
    pub async fn claim_next_job(&self) -> Result<Option<ImportJob>, Error> {
        let new_lease_id = Uuid::now_v7().to_string();
        let sql = format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM contact_import_jobs
                WHERE status = 'pending' AND (leased_until IS NULL OR leased_until <= now())
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE contact_import_jobs
            SET
                leased_until = now() + make_interval(secs => $2),
                lease_id = $1,
                updated_at = now()
            FROM next_job
            WHERE contact_import_jobs.id = next_job.id
            RETURNING {}
            "#,
            qualified_job_columns()
        );
        let row = sqlx::query(&sql)
            .bind(&new_lease_id)
            .bind(self.lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: Uuid = row.try_get("id")?;
        match job_from_row(&row).context("Failed to parse job row") {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                sqlx::query(
                    r#"
                    UPDATE contact_import_jobs
                    SET
                        lease_id = null,
                        leased_until = null,
                        status = 'failed',
                        status_message = $2,
                        display_status_message = $3,
                        completed_at = now(),
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(format!("{e:?}"))
                .bind("The import settings could not be read")
                .execute(&self.pool)
                .await?;

                warn!("Failed to parse job {}: {:?}", id, e);
                Ok(None)
            }
        }
    }

    /// Fails jobs left processing by a worker whose lease ran out. Rows already
    /// committed stay, the job is not resumed since that would import them twice.
    pub async fn fail_abandoned_jobs(&self) -> Result<Vec<Uuid>, Error> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE contact_import_jobs
            SET
                lease_id = null,
                leased_until = null,
                status = 'failed',
                status_message = 'worker lost: lease expired while processing',
                display_status_message = $1,
                completed_at = now(),
                updated_at = now()
            WHERE id IN (
                SELECT id
                FROM contact_import_jobs
                WHERE status = 'processing' AND leased_until <= now()
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(ABANDONED_USER_MESSAGE)
        .fetch_all(&self.pool)
        .await?;

        for id in &ids {
            warn!(job_id = %id, "job abandoned by its worker, marked failed");
        }
        Ok(ids)
    }

    // Positions of the batch that collide with a live contact's email, or with an
    // earlier row of the same batch
    async fn email_conflicts(&self, batch: &[PendingContact]) -> Result<Vec<RejectedRow>, Error> {
        let emails: Vec<String> = batch
            .iter()
            .filter_map(|p| p.record.email.clone())
            .collect();
        let taken: HashSet<String> = sqlx::query_scalar(
            "SELECT email FROM contacts WHERE NOT is_deleted AND email = ANY($1::text[])",
        )
        .bind(&emails)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        let mut seen = HashSet::new();
        let mut rejected = Vec::new();
        for (position, pending) in batch.iter().enumerate() {
            let Some(email) = &pending.record.email else {
                continue;
            };
            if taken.contains(email) || !seen.insert(email.as_str()) {
                rejected.push(RejectedRow {
                    position,
                    fields: vec![ContactField::Email.as_str().to_string()],
                    message: format!(
                        "duplicate key value violates unique constraint \"contacts_live_email_idx\": email {email} already exists"
                    ),
                });
            }
        }
        Ok(rejected)
    }

    async fn write_batch(
        &self,
        job_id: Uuid,
        batch: &[PendingContact],
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        let ids: Vec<Uuid> = batch.iter().map(|_| Uuid::now_v7()).collect();
        let activities: Vec<ContactActivity> = batch
            .iter()
            .zip(&ids)
            .map(|(pending, id)| ContactActivity::imported(*id, job_id, pending.row))
            .collect();
        let keys: Vec<DedupKeys> = batch.iter().map(|p| DedupKeys::of(&p.record)).collect();

        let mut query = sqlx::query(INSERT_CONTACTS.as_str())
            .bind(&ids)
            .bind(vec![job_id; batch.len()]);
        for field in ContactField::ALL {
            let column: Vec<Option<String>> = batch
                .iter()
                .map(|p| p.record.get(field).map(str::to_string))
                .collect();
            query = query.bind(column);
        }
        let domains: Vec<Option<String>> =
            batch.iter().map(|p| p.record.email_domain.clone()).collect();
        let scores: Vec<i32> = batch.iter().map(|p| p.record.lead_score).collect();
        let name_keys: Vec<String> = keys.iter().map(|k| k.name.clone()).collect();
        let company_keys: Vec<String> = keys.iter().map(|k| k.company.clone()).collect();
        let query = query
            .bind(domains)
            .bind(scores)
            .bind(name_keys)
            .bind(company_keys);

        let mut tx = self.pool.begin().await?;
        query.execute(&mut *tx).await?;

        let activity_ids: Vec<Uuid> = activities.iter().map(|a| a.id).collect();
        let contact_ids: Vec<Uuid> = activities.iter().map(|a| a.contact_id).collect();
        let types: Vec<&str> = activities.iter().map(|a| a.activity_type.as_str()).collect();
        let descriptions: Vec<String> = activities.iter().map(|a| a.description.clone()).collect();
        let changes: Vec<serde_json::Value> = activities.iter().map(|a| a.changes.clone()).collect();
        let created: Vec<DateTime<Utc>> = activities.iter().map(|a| a.created_at).collect();
        sqlx::query(
            r#"
            INSERT INTO contact_activities (id, contact_id, activity_type, description, changes, created_at)
            SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[], $5::jsonb[], $6::timestamptz[])
            "#,
        )
        .bind(activity_ids)
        .bind(contact_ids)
        .bind(types)
        .bind(descriptions)
        .bind(changes)
        .bind(created)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ids)
    }
}

#[async_trait]
impl ContactStore for PgStore {
    async fn insert_batch(
        &self,
        job_id: Uuid,
        batch: &[PendingContact],
    ) -> Result<Vec<Uuid>, BatchWriteError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        match self.write_batch(job_id, batch).await {
            Ok(ids) => Ok(ids),
            Err(e) if is_unique_violation(&e) => {
                // The transaction rolled back, find out which rows caused it
                let rejected = self
                    .email_conflicts(batch)
                    .await
                    .map_err(|probe| BatchWriteError::Unavailable(format!("{probe:#}")))?;
                if rejected.is_empty() {
                    // Raced with another writer that has since gone, the retry may succeed
                    return Err(BatchWriteError::Failed(e.to_string()));
                }
                Err(BatchWriteError::RowsRejected(rejected))
            }
            Err(e) => Err(classify(e)),
        }
    }

    async fn find_existing(&self, probe: &KeyProbe) -> Result<ExistingKeys, Error> {
        let mut existing = ExistingKeys::default();
        if probe.is_empty() {
            return Ok(existing);
        }

        if !probe.emails.is_empty() {
            let emails: Vec<String> = sqlx::query_scalar(
                "SELECT email FROM contacts WHERE NOT is_deleted AND email = ANY($1::text[])",
            )
            .bind(&probe.emails)
            .fetch_all(&self.pool)
            .await
            .context("Looking up existing emails")?;
            existing.emails.extend(emails);
        }

        if !probe.name_company.is_empty() {
            let (names, companies): (Vec<String>, Vec<String>) =
                probe.name_company.iter().cloned().unzip();
            let rows = sqlx::query(
                r#"
                SELECT DISTINCT dedup_name_key, dedup_company_key
                FROM contacts
                WHERE NOT is_deleted
                  AND (dedup_name_key, dedup_company_key) IN (SELECT * FROM UNNEST($1::text[], $2::text[]))
                "#,
            )
            .bind(names)
            .bind(companies)
            .fetch_all(&self.pool)
            .await
            .context("Looking up existing name and company pairs")?;
            for row in rows {
                existing
                    .name_company
                    .insert((row.try_get("dedup_name_key")?, row.try_get("dedup_company_key")?));
            }
        }

        Ok(existing)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn save_job(&self, job: &ImportJob) -> Result<(), Error> {
        // Each save extends the lease, a terminal save releases it
        let leased_until = (!job.status.is_terminal())
            .then(|| Utc::now() + chrono::Duration::from_std(self.lease).unwrap_or_default());

        let res = sqlx::query(
            r#"
            INSERT INTO contact_import_jobs (
                id, source_name, source, field_mapping, options, status,
                total_rows, processed_rows, successful_rows, error_rows, duplicate_rows,
                errors, status_message, display_status_message, lease_id, leased_until,
                created_at, started_at, completed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, now())
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                total_rows = EXCLUDED.total_rows,
                processed_rows = EXCLUDED.processed_rows,
                successful_rows = EXCLUDED.successful_rows,
                error_rows = EXCLUDED.error_rows,
                duplicate_rows = EXCLUDED.duplicate_rows,
                errors = EXCLUDED.errors,
                status_message = EXCLUDED.status_message,
                display_status_message = EXCLUDED.display_status_message,
                leased_until = EXCLUDED.leased_until,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                updated_at = now()
            WHERE contact_import_jobs.status NOT IN ('completed', 'failed')
              AND contact_import_jobs.lease_id IS NOT DISTINCT FROM EXCLUDED.lease_id
            "#,
        )
        .bind(job.id)
        .bind(&job.source_name)
        .bind(serde_json::to_value(&job.source)?)
        .bind(serde_json::to_value(&job.field_mapping)?)
        .bind(serde_json::to_value(&job.options)?)
        .bind(job.status.as_str())
        .bind(job.total_rows.map(to_i64).transpose()?)
        .bind(to_i64(job.processed_rows)?)
        .bind(to_i64(job.successful_rows)?)
        .bind(to_i64(job.error_rows)?)
        .bind(to_i64(job.duplicate_rows)?)
        .bind(serde_json::to_value(&job.errors)?)
        .bind(&job.status_message)
        .bind(&job.display_status_message)
        .bind(&job.lease_id)
        .bind(leased_until)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        throw_if_no_rows(res).with_context(|| {
            format!("Job {} is terminal or leased by another worker", job.id)
        })
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<ImportJob>, Error> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM contact_import_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

fn qualified_job_columns() -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("contact_import_jobs.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn job_from_row(row: &PgRow) -> Result<ImportJob, Error> {
    let status: String = row.try_get("status")?;
    let total_rows: Option<i64> = row.try_get("total_rows")?;
    let options: ImportOptions =
        serde_json::from_value(row.try_get("options")?).context("Parsing import options")?;
    let errors: ErrorLog =
        serde_json::from_value(row.try_get("errors")?).context("Parsing error log")?;

    Ok(ImportJob {
        id: row.try_get("id")?,
        source_name: row.try_get("source_name")?,
        status: status.parse::<JobStatus>()?,
        total_rows: total_rows.map(to_u64).transpose()?,
        processed_rows: to_u64(row.try_get("processed_rows")?)?,
        successful_rows: to_u64(row.try_get("successful_rows")?)?,
        error_rows: to_u64(row.try_get("error_rows")?)?,
        duplicate_rows: to_u64(row.try_get("duplicate_rows")?)?,
        field_mapping: serde_json::from_value(row.try_get("field_mapping")?)
            .context("Parsing field mapping")?,
        source: serde_json::from_value(row.try_get("source")?).context("Parsing source")?,
        errors: errors.with_cap(options.max_retained_errors),
        options,
        status_message: row.try_get("status_message")?,
        display_status_message: row.try_get("display_status_message")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        lease_id: row.try_get("lease_id")?,
    })
}

fn to_i64(n: u64) -> Result<i64, Error> {
    i64::try_from(n).context("Row count out of range")
}

fn to_u64(n: i64) -> Result<u64, Error> {
    u64::try_from(n).context("Negative row count")
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

// Connection level failures say the destination is down, anything else is a failed write
fn classify(e: sqlx::Error) -> BatchWriteError {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => BatchWriteError::Unavailable(e.to_string()),
        other => BatchWriteError::Failed(other.to_string()),
    }
}

fn throw_if_no_rows(res: PgQueryResult) -> Result<(), Error> {
    if res.rows_affected() == 0 {
        anyhow::bail!("No update done")
    } else {
        Ok(())
    }
}
