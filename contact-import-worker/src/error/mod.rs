use thiserror::Error;

/// Conditions that abort an import. Everything else is scoped to a row or a batch
/// and is absorbed by the pipeline.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("source unreadable: {0}")]
    SourceUnreadable(#[source] std::io::Error),
    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("import cancelled: {0}")]
    Cancelled(String),
    #[error("internal pipeline failure: {0}")]
    Internal(String),
}

impl FatalError {
    pub fn user_message(&self) -> String {
        match self {
            FatalError::SourceUnreadable(_) => {
                "The uploaded file could not be read. Please upload it again.".to_string()
            }
            FatalError::DestinationUnavailable(_) => {
                "The contact database is unavailable. Rows imported so far have been kept."
                    .to_string()
            }
            FatalError::InvalidConfig(msg) => format!("The import is misconfigured: {msg}"),
            FatalError::Cancelled(_) => {
                "The import was cancelled. Rows imported so far have been kept.".to_string()
            }
            FatalError::Internal(_) => "An unknown error occurred".to_string(),
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, FatalError::Cancelled(_))
    }
}

/// A row the store refused to write, identified by its position in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub position: usize,
    pub fields: Vec<String>,
    pub message: String,
}

#[derive(Error, Debug, Clone)]
pub enum BatchWriteError {
    #[error("{} row(s) rejected by the store", .0.len())]
    RowsRejected(Vec<RejectedRow>),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("batch write failed: {0}")]
    Failed(String),
}

impl BatchWriteError {
    // Only failures that say nothing about individual rows count towards an outage
    pub fn is_systemic(&self) -> bool {
        !matches!(self, BatchWriteError::RowsRejected(_))
    }
}
