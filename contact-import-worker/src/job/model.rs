use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{parse::fields::FieldMapping, progress::ProgressSnapshot};

use super::config::{ImportOptions, ImportRequest, SourceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(anyhow::Error::msg(format!("Unknown job status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// 1-based index of the data row in the source file
    pub row: u64,
    pub fields: Vec<String>,
    pub severity: Severity,
    pub message: String,
    pub preview: String,
}

impl RowError {
    pub fn error(row: u64, fields: Vec<String>, message: impl Into<String>, preview: String) -> Self {
        Self {
            row,
            fields,
            severity: Severity::Error,
            message: message.into(),
            preview,
        }
    }

    pub fn warning(
        row: u64,
        fields: Vec<String>,
        message: impl Into<String>,
        preview: String,
    ) -> Self {
        Self {
            row,
            fields,
            severity: Severity::Warning,
            message: message.into(),
            preview,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Bounded list of row problems. Once full, an incoming error displaces the most
/// recent warning, anything else is only counted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLog {
    pub entries: Vec<RowError>,
    #[serde(default)]
    pub dropped: u64,
    #[serde(skip)]
    cap: usize,
}

impl ErrorLog {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            dropped: 0,
            cap,
        }
    }

    // The cap isn't serialized, so a log loaded from storage needs it restored
    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn push(&mut self, entry: RowError) {
        if self.entries.len() < self.cap {
            self.entries.push(entry);
            return;
        }
        self.dropped += 1;
        if !entry.is_error() {
            return;
        }
        if let Some(position) = self.entries.iter().rposition(|e| !e.is_error()) {
            self.entries.remove(position);
            self.entries.push(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Row outcomes accumulated by the writer since its last report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub successful: u64,
    pub errors: u64,
    pub duplicates: u64,
    // Row problems for the error log, warnings included
    pub issues: Vec<RowError>,
}

impl ProgressDelta {
    pub fn rows(&self) -> u64 {
        self.successful + self.errors + self.duplicates
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0 && self.issues.is_empty()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobStateError {
    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: JobStatus },
    #[error("job {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    #[error(
        "job {id} row counts do not reconcile: processed {processed}, successful {successful}, errors {errors}, duplicates {duplicates}, total {total:?}"
    )]
    AccountingMismatch {
        id: Uuid,
        processed: u64,
        successful: u64,
        errors: u64,
        duplicates: u64,
        total: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub source_name: String,
    pub status: JobStatus,
    pub total_rows: Option<u64>,
    pub processed_rows: u64,
    pub successful_rows: u64,
    pub error_rows: u64,
    pub duplicate_rows: u64,
    pub field_mapping: FieldMapping,
    pub source: SourceConfig,
    pub options: ImportOptions,
    pub errors: ErrorLog,
    // Exposed to a developer, not the user
    pub status_message: Option<String>,
    // Exposed to the user
    pub display_status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    // Set when a worker claimed the job from Postgres
    #[serde(skip)]
    pub lease_id: Option<String>,
}

impl ImportJob {
    pub fn new(request: ImportRequest) -> Self {
        let errors = ErrorLog::new(request.options.max_retained_errors);
        Self {
            id: Uuid::now_v7(),
            source_name: request.source_name,
            status: JobStatus::Pending,
            total_rows: None,
            processed_rows: 0,
            successful_rows: 0,
            error_rows: 0,
            duplicate_rows: 0,
            field_mapping: request.field_mapping,
            source: request.source,
            options: request.options,
            errors,
            status_message: None,
            display_status_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            lease_id: None,
        }
    }

    fn ensure_live(&self) -> Result<(), JobStateError> {
        if self.status.is_terminal() {
            return Err(JobStateError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    fn ensure_processing(&self, to: JobStatus) -> Result<(), JobStateError> {
        self.ensure_live()?;
        if self.status != JobStatus::Processing {
            return Err(JobStateError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), JobStateError> {
        self.ensure_live()?;
        if self.status != JobStatus::Pending {
            return Err(JobStateError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: JobStatus::Processing,
            });
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn set_total_rows(&mut self, total: u64) -> Result<(), JobStateError> {
        self.ensure_processing(JobStatus::Processing)?;
        self.total_rows = Some(total);
        Ok(())
    }

    pub fn apply(&mut self, delta: ProgressDelta) -> Result<(), JobStateError> {
        self.ensure_processing(JobStatus::Processing)?;
        self.successful_rows += delta.successful;
        self.error_rows += delta.errors;
        self.duplicate_rows += delta.duplicates;
        self.processed_rows += delta.rows();
        for issue in delta.issues {
            self.errors.push(issue);
        }
        Ok(())
    }

    pub fn counts_reconcile(&self) -> bool {
        self.processed_rows == self.successful_rows + self.error_rows + self.duplicate_rows
    }

    /// Completion requires every decoded row to be accounted for exactly once.
    pub fn complete(&mut self) -> Result<(), JobStateError> {
        self.ensure_processing(JobStatus::Completed)?;
        let total_matches = self.total_rows.map_or(true, |t| t == self.processed_rows);
        if !self.counts_reconcile() || !total_matches {
            return Err(JobStateError::AccountingMismatch {
                id: self.id,
                processed: self.processed_rows,
                successful: self.successful_rows,
                errors: self.error_rows,
                duplicates: self.duplicate_rows,
                total: self.total_rows,
            });
        }
        self.status = JobStatus::Completed;
        self.status_message = None;
        self.display_status_message = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, reason: String, display_reason: String) -> Result<(), JobStateError> {
        self.ensure_live()?;
        self.status = JobStatus::Failed;
        self.status_message = Some(reason);
        self.display_status_message = Some(display_reason);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: self.id,
            status: self.status,
            processed_rows: self.processed_rows,
            successful_rows: self.successful_rows,
            error_rows: self.error_rows,
            duplicate_rows: self.duplicate_rows,
            total_rows: self.total_rows,
        }
    }
}
