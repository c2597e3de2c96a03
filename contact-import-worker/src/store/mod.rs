use std::collections::HashSet;

use anyhow::Error;
use async_trait::async_trait;
use uuid::Uuid;

use crate::{error::BatchWriteError, job::model::ImportJob, types::PendingContact};

pub mod memory;
pub mod postgres;

/// Duplicate keys of one chunk of rows, to look up among already stored contacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyProbe {
    pub emails: Vec<String>,
    // (name key, company key)
    pub name_company: Vec<(String, String)>,
}

impl KeyProbe {
    pub fn is_empty(&self) -> bool {
        self.emails.is_empty() && self.name_company.is_empty()
    }
}

/// The subset of a probe's keys that already belong to live contacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingKeys {
    pub emails: HashSet<String>,
    pub name_company: HashSet<(String, String)>,
}

/// The destination of imported contacts. Only the batch writer calls `insert_batch`.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Writes every contact of the batch plus one activity per contact, atomically.
    /// Returns the generated contact ids in batch order.
    async fn insert_batch(
        &self,
        job_id: Uuid,
        batch: &[PendingContact],
    ) -> Result<Vec<Uuid>, BatchWriteError>;

    async fn find_existing(&self, probe: &KeyProbe) -> Result<ExistingKeys, Error>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists the job. Fails if the stored copy has already reached a terminal status.
    async fn save_job(&self, job: &ImportJob) -> Result<(), Error>;

    async fn load_job(&self, id: Uuid) -> Result<Option<ImportJob>, Error>;
}
