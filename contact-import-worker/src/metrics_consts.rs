pub const ROWS_TOTAL: &str = "contact_import_rows_total";
pub const DUPLICATES_TOTAL: &str = "contact_import_duplicates_total";
pub const BATCHES_TOTAL: &str = "contact_import_batches_total";
pub const BATCH_WRITE_MS: &str = "contact_import_batch_write_ms";
pub const JOBS_TOTAL: &str = "contact_import_jobs_total";
pub const JOB_DURATION_MS: &str = "contact_import_job_duration_ms";
pub const JOBS_RUNNING: &str = "contact_import_jobs_running";
pub const CROSS_JOB_LOOKUP_FAILED: &str = "contact_import_cross_job_lookup_failed";
pub const SNAPSHOT_PERSIST_FAILED: &str = "contact_import_snapshot_persist_failed";
pub const PROGRESS_UNOBSERVED: &str = "contact_import_progress_unobserved";
pub const JOB_CLAIM_FAILED: &str = "contact_import_job_claim_failed";
pub const JOBS_ABANDONED: &str = "contact_import_jobs_abandoned";
