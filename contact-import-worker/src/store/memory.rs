use std::collections::HashSet;

use anyhow::Error;
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    dedup::DedupKeys,
    error::{BatchWriteError, RejectedRow},
    job::model::ImportJob,
    progress::ProgressSnapshot,
    types::{ContactActivity, ContactRecord, PendingContact},
};

use super::{ContactStore, ExistingKeys, JobStore, KeyProbe};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredContact {
    pub id: Uuid,
    pub job_id: Uuid,
    pub row: u64,
    pub record: ContactRecord,
}

#[derive(Default)]
struct Contacts {
    contacts: Vec<StoredContact>,
    activities: Vec<ContactActivity>,
    // Emails of contacts that aren't soft-deleted, unique like the live email index
    live_emails: HashSet<String>,
}

/// Contact store kept in process memory. Enforces the same unique live email
/// constraint as the Postgres schema.
#[derive(Default)]
pub struct MemoryContactStore {
    inner: Mutex<Contacts>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contacts(&self) -> Vec<StoredContact> {
        self.inner.lock().await.contacts.clone()
    }

    pub async fn activities(&self) -> Vec<ContactActivity> {
        self.inner.lock().await.activities.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.contacts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Seeds a contact as if an earlier import had written it.
    pub async fn seed(&self, record: ContactRecord) -> Uuid {
        let mut inner = self.inner.lock().await;
        let id = Uuid::now_v7();
        if let Some(email) = &record.email {
            if !record.is_deleted {
                inner.live_emails.insert(email.clone());
            }
        }
        inner.contacts.push(StoredContact {
            id,
            job_id: Uuid::nil(),
            row: 0,
            record,
        });
        id
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn insert_batch(
        &self,
        job_id: Uuid,
        batch: &[PendingContact],
    ) -> Result<Vec<Uuid>, BatchWriteError> {
        let mut inner = self.inner.lock().await;

        let mut batch_emails = HashSet::new();
        let mut rejected = Vec::new();
        for (position, pending) in batch.iter().enumerate() {
            let Some(email) = &pending.record.email else {
                continue;
            };
            if inner.live_emails.contains(email) || !batch_emails.insert(email.as_str()) {
                rejected.push(RejectedRow {
                    position,
                    fields: vec!["email".to_string()],
                    message: format!(
                        "duplicate key value violates unique constraint \"contacts_live_email_idx\": email {email} already exists"
                    ),
                });
            }
        }
        if !rejected.is_empty() {
            return Err(BatchWriteError::RowsRejected(rejected));
        }

        let mut ids = Vec::with_capacity(batch.len());
        for pending in batch {
            let id = Uuid::now_v7();
            if let Some(email) = &pending.record.email {
                inner.live_emails.insert(email.clone());
            }
            inner.contacts.push(StoredContact {
                id,
                job_id,
                row: pending.row,
                record: pending.record.clone(),
            });
            inner
                .activities
                .push(ContactActivity::imported(id, job_id, pending.row));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn find_existing(&self, probe: &KeyProbe) -> Result<ExistingKeys, Error> {
        let inner = self.inner.lock().await;
        let emails: HashSet<&String> = probe.emails.iter().collect();
        let pairs: HashSet<&(String, String)> = probe.name_company.iter().collect();

        let mut existing = ExistingKeys::default();
        for stored in inner.contacts.iter().filter(|c| !c.record.is_deleted) {
            let keys = DedupKeys::of(&stored.record);
            if let Some(email) = keys.email.as_ref().filter(|e| emails.contains(e)) {
                existing.emails.insert(email.clone());
            }
            let pair = keys.pair();
            if pairs.contains(&pair) {
                existing.name_company.insert(pair);
            }
        }
        Ok(existing)
    }
}

/// Job store kept in process memory. Remembers every saved snapshot so tests can
/// check how counts moved over a job's life.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<Uuid, ImportJob>,
    history: DashMap<Uuid, Vec<ProgressSnapshot>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, id: Uuid) -> Vec<ProgressSnapshot> {
        self.history
            .get(&id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_job(&self, job: &ImportJob) -> Result<(), Error> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(mut entry) => {
                if entry.get().status.is_terminal() {
                    anyhow::bail!("job {} is already {}", job.id, entry.get().status);
                }
                entry.insert(job.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(job.clone());
            }
        }
        self.history.entry(job.id).or_default().push(job.snapshot());
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<ImportJob>, Error> {
        Ok(self.jobs.get(&id).map(|j| j.value().clone()))
    }
}
