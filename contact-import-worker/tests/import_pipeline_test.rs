//! Runs whole imports against the in-memory stores, with source files written
//! into a temporary directory.

use std::{
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Error;
use async_trait::async_trait;
use contact_import_worker::{
    error::BatchWriteError,
    job::{
        backoff::BackoffPolicy,
        config::{ImportOptions, ImportRequest, SourceConfig},
        model::{ImportJob, JobStatus},
        CancelSignal, Job, JobServices, PipelineSettings,
    },
    parse::fields::{ContactField, FieldMapping},
    progress::ProgressPublisher,
    store::{
        memory::{MemoryContactStore, MemoryJobStore},
        ContactStore, ExistingKeys, JobStore, KeyProbe,
    },
    types::{ContactRecord, PendingContact},
};
use tempfile::TempDir;
use uuid::Uuid;

const REFERENCE_CSV: &str = "email,name\nA@X.com,Jane Doe\na@x.com,Jane D.\n,Bob Lee\n,Bob Lee\n";

fn settings() -> PipelineSettings {
    PipelineSettings {
        chunk_rows: 2,
        channel_chunks: 2,
        snapshot_interval: Duration::ZERO,
        backoff: BackoffPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(5)),
        ..Default::default()
    }
}

fn write_source(dir: &TempDir, name: &str, contents: &str) -> SourceConfig {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    SourceConfig::File { path }
}

fn request(source: SourceConfig, mapping: FieldMapping, options: ImportOptions) -> ImportRequest {
    ImportRequest {
        source_name: "contacts.csv".to_string(),
        source,
        field_mapping: mapping,
        options,
    }
}

fn email_and_name() -> FieldMapping {
    FieldMapping::new([
        ("email", ContactField::Email),
        ("name", ContactField::FullName),
    ])
}

fn batch_of(size: usize) -> ImportOptions {
    ImportOptions {
        batch_size: size,
        ..Default::default()
    }
}

struct Harness {
    contacts: Arc<MemoryContactStore>,
    jobs: Arc<MemoryJobStore>,
    publisher: Arc<ProgressPublisher>,
}

impl Harness {
    fn new() -> Self {
        Self {
            contacts: Arc::new(MemoryContactStore::new()),
            jobs: Arc::new(MemoryJobStore::new()),
            publisher: Arc::new(ProgressPublisher::new()),
        }
    }

    fn services(&self, settings: PipelineSettings) -> JobServices {
        self.services_with(self.contacts.clone(), settings)
    }

    fn services_with(
        &self,
        contacts: Arc<dyn ContactStore>,
        settings: PipelineSettings,
    ) -> JobServices {
        JobServices {
            contacts,
            jobs: self.jobs.clone(),
            publisher: self.publisher.clone(),
            settings,
        }
    }

    async fn run(&self, request: ImportRequest) -> ImportJob {
        self.run_with(request, self.services(settings()), CancelSignal::new())
            .await
    }

    async fn run_with(
        &self,
        request: ImportRequest,
        services: JobServices,
        cancel: CancelSignal,
    ) -> ImportJob {
        let job = ImportJob::new(request);
        self.jobs.save_job(&job).await.unwrap();
        Job::new(job, services, cancel).run().await.unwrap()
    }
}

fn assert_reconciled(job: &ImportJob) {
    assert_eq!(
        job.processed_rows,
        job.successful_rows + job.error_rows + job.duplicate_rows,
        "{job:?}"
    );
}

#[tokio::test]
async fn reference_file_classifies_every_row() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = write_source(&dir, "reference.csv", REFERENCE_CSV);

    let job = harness
        .run(request(source, email_and_name(), batch_of(2)))
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.successful_rows, 2);
    assert_eq!(job.duplicate_rows, 2);
    assert_eq!(job.error_rows, 0);
    assert_eq!(job.processed_rows, 4);
    assert_eq!(job.total_rows, Some(4));
    assert_reconciled(&job);

    let stored = harness.contacts.contacts().await;
    let rows: Vec<u64> = stored.iter().map(|c| c.row).collect();
    assert_eq!(rows, vec![1, 3]);
    assert_eq!(stored[0].record.email.as_deref(), Some("a@x.com"));
    assert_eq!(stored[1].record.full_name, "Bob Lee");
    assert_eq!(harness.contacts.activities().await.len(), 2);

    let persisted = harness.jobs.load_job(job.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, JobStatus::Completed);
    assert_eq!(persisted.successful_rows, 2);
}

#[tokio::test]
async fn classification_does_not_depend_on_batch_size() {
    let mut csv = String::from("email,name,company\n");
    for i in 0..40 {
        // Every third row repeats an earlier email, every fifth an earlier name at the same company
        let email = if i % 3 == 2 {
            format!("person{}@acme.io", i - 1)
        } else {
            format!("person{i}@acme.io")
        };
        let name = if i % 5 == 4 {
            format!("Person {}", i - 4)
        } else {
            format!("Person {i}")
        };
        let email = if i % 5 == 4 { String::new() } else { email };
        csv.push_str(&format!("{email},{name},Acme\n"));
    }
    csv.push_str("not-an-email,Broken Row,Acme\n");

    let mut outcomes = Vec::new();
    for batch_size in [1, 3, 7, 500] {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new();
        let source = write_source(&dir, "contacts.csv", &csv);
        let mapping = FieldMapping::new([
            ("email", ContactField::Email),
            ("name", ContactField::FullName),
            ("company", ContactField::CompanyName),
        ]);

        let job = harness
            .run(request(source, mapping, batch_of(batch_size)))
            .await;
        assert_eq!(job.status, JobStatus::Completed, "batch size {batch_size}");
        assert_reconciled(&job);

        let rows: Vec<u64> = harness
            .contacts
            .contacts()
            .await
            .iter()
            .map(|c| c.row)
            .collect();
        outcomes.push((
            job.successful_rows,
            job.duplicate_rows,
            job.error_rows,
            rows,
        ));
    }

    assert!(outcomes.windows(2).all(|w| w[0] == w[1]), "{outcomes:?}");
    assert_eq!(outcomes[0].2, 1);
    assert!(outcomes[0].1 > 0);
}

#[tokio::test]
async fn invalid_rows_are_counted_and_logged() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = write_source(
        &dir,
        "invalid.csv",
        "email,name\njane@acme.io,Jane Doe\nnot-an-email,John Roe\nbob@acme.io,\n",
    );

    let job = harness
        .run(request(source, email_and_name(), batch_of(10)))
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.successful_rows, 1);
    assert_eq!(job.error_rows, 2);
    assert_reconciled(&job);

    let logged: Vec<u64> = job.errors.entries.iter().map(|e| e.row).collect();
    assert_eq!(logged, vec![2, 3]);
    assert!(job.errors.entries[0].message.contains("not-an-email"));
    assert!(job.errors.entries[0].fields.contains(&"email".to_string()));
}

#[tokio::test]
async fn error_log_is_capped_but_counts_stay_exact() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let mut csv = String::from("email,name\n");
    for i in 0..25 {
        csv.push_str(&format!("broken{i},Person {i}\n"));
    }
    let source = write_source(&dir, "broken.csv", &csv);
    let options = ImportOptions {
        max_retained_errors: 10,
        ..batch_of(4)
    };

    let job = harness.run(request(source, email_and_name(), options)).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.error_rows, 25);
    assert_eq!(job.errors.len(), 10);
    assert_eq!(job.errors.dropped, 15);
}

#[tokio::test]
async fn conflicting_row_costs_only_itself() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    harness
        .contacts
        .seed(ContactRecord {
            full_name: "Existing Person".to_string(),
            email: Some("taken@acme.io".to_string()),
            ..Default::default()
        })
        .await;
    let source = write_source(
        &dir,
        "conflict.csv",
        "email,name\na@acme.io,A Person\ntaken@acme.io,B Person\nc@acme.io,C Person\nd@acme.io,D Person\n",
    );
    // Without the cross-job lookup the conflict only shows up at write time
    let services = harness.services(PipelineSettings {
        cross_job_dedup: false,
        ..settings()
    });

    let job = harness
        .run_with(
            request(source, email_and_name(), batch_of(4)),
            services,
            CancelSignal::new(),
        )
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.successful_rows, 3);
    assert_eq!(job.error_rows, 1);
    assert_eq!(job.errors.entries.len(), 1);
    assert_eq!(job.errors.entries[0].row, 2);
    assert!(job.errors.entries[0].message.contains("unique constraint"));
    // The seeded contact plus three new ones
    assert_eq!(harness.contacts.len().await, 4);
}

#[tokio::test]
async fn existing_contacts_are_cross_job_duplicates() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    harness
        .contacts
        .seed(ContactRecord {
            full_name: "Jane Doe".to_string(),
            email: Some("jane@acme.io".to_string()),
            ..Default::default()
        })
        .await;
    let source = write_source(
        &dir,
        "again.csv",
        "email,name\nJANE@acme.io,Jane Doe\njohn@acme.io,John Roe\n",
    );

    let job = harness
        .run(request(source, email_and_name(), batch_of(10)))
        .await;

    assert_eq!(job.successful_rows, 1);
    assert_eq!(job.duplicate_rows, 1);
    assert_eq!(job.error_rows, 0);
}

struct CancelAfterBatches {
    inner: MemoryContactStore,
    written: AtomicUsize,
    after: usize,
    cancel: CancelSignal,
}

#[async_trait]
impl ContactStore for CancelAfterBatches {
    async fn insert_batch(
        &self,
        job_id: Uuid,
        batch: &[PendingContact],
    ) -> Result<Vec<Uuid>, BatchWriteError> {
        let ids = self.inner.insert_batch(job_id, batch).await?;
        if self.written.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.cancel.cancel("deleted by user");
        }
        Ok(ids)
    }

    async fn find_existing(&self, probe: &KeyProbe) -> Result<ExistingKeys, Error> {
        self.inner.find_existing(probe).await
    }
}

#[tokio::test]
async fn cancelling_keeps_committed_batches() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let mut csv = String::from("email,name\n");
    for i in 0..8 {
        csv.push_str(&format!("person{i}@acme.io,Person {i}\n"));
    }
    let source = write_source(&dir, "cancel.csv", &csv);

    let cancel = CancelSignal::new();
    let store = Arc::new(CancelAfterBatches {
        inner: MemoryContactStore::new(),
        written: AtomicUsize::new(0),
        after: 2,
        cancel: cancel.clone(),
    });
    let services = harness.services_with(store.clone(), settings());

    let job = harness
        .run_with(request(source, email_and_name(), batch_of(2)), services, cancel)
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .status_message
        .as_deref()
        .unwrap()
        .contains("deleted by user"));
    assert!(job.display_status_message.is_some());
    assert_eq!(store.written.load(Ordering::SeqCst), 2);
    assert_eq!(store.inner.len().await, 4);
    assert_eq!(job.successful_rows, 4);
    assert_reconciled(&job);
}

#[tokio::test]
async fn cancelling_drops_warnings_of_unwritten_rows() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let mut csv = String::from("email,name,phone\n");
    for i in 0..8 {
        csv.push_str(&format!("person{i}@acme.io,Person {i},12\n"));
    }
    let source = write_source(&dir, "cancel-warnings.csv", &csv);

    let cancel = CancelSignal::new();
    let store = Arc::new(CancelAfterBatches {
        inner: MemoryContactStore::new(),
        written: AtomicUsize::new(0),
        after: 2,
        cancel: cancel.clone(),
    });
    let services = harness.services_with(store.clone(), settings());
    let mapping = FieldMapping::new([
        ("email", ContactField::Email),
        ("name", ContactField::FullName),
        ("phone", ContactField::MobilePhone),
    ]);

    let job = harness
        .run_with(request(source, mapping, batch_of(2)), services, cancel)
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.successful_rows, 4);
    // Only the rows that were written keep their phone warnings
    let logged: Vec<u64> = job.errors.entries.iter().map(|e| e.row).collect();
    assert_eq!(logged, vec![1, 2, 3, 4]);
    assert_reconciled(&job);
}

#[tokio::test]
async fn job_cancelled_before_start_reads_nothing() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = write_source(&dir, "early.csv", REFERENCE_CSV);
    let cancel = CancelSignal::new();
    cancel.cancel("worker shutting down");

    let job = harness
        .run_with(
            request(source, email_and_name(), batch_of(2)),
            harness.services(settings()),
            cancel,
        )
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.started_at.is_none());
    assert!(harness.contacts.is_empty().await);
}

// Writes succeed but the existing-contact lookup always fails
struct LookupDownStore {
    inner: MemoryContactStore,
    lookups: AtomicUsize,
}

#[async_trait]
impl ContactStore for LookupDownStore {
    async fn insert_batch(
        &self,
        job_id: Uuid,
        batch: &[PendingContact],
    ) -> Result<Vec<Uuid>, BatchWriteError> {
        self.inner.insert_batch(job_id, batch).await
    }

    async fn find_existing(&self, _probe: &KeyProbe) -> Result<ExistingKeys, Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("statement timeout"))
    }
}

#[tokio::test]
async fn in_job_duplicates_are_caught_without_the_existing_lookup() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = write_source(&dir, "reference.csv", REFERENCE_CSV);
    let store = Arc::new(LookupDownStore {
        inner: MemoryContactStore::new(),
        lookups: AtomicUsize::new(0),
    });
    let services = harness.services_with(store.clone(), settings());

    let job = harness
        .run_with(
            request(source, email_and_name(), batch_of(2)),
            services,
            CancelSignal::new(),
        )
        .await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.successful_rows, 2);
    assert_eq!(job.duplicate_rows, 2);
    assert_eq!(job.error_rows, 0);
    assert!(store.lookups.load(Ordering::SeqCst) > 0);
    assert_eq!(store.inner.len().await, 2);
    assert_reconciled(&job);
}

struct UnavailableStore {
    attempts: AtomicUsize,
}

#[async_trait]
impl ContactStore for UnavailableStore {
    async fn insert_batch(
        &self,
        _job_id: Uuid,
        _batch: &[PendingContact],
    ) -> Result<Vec<Uuid>, BatchWriteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(BatchWriteError::Unavailable("connection refused".to_string()))
    }

    async fn find_existing(&self, _probe: &KeyProbe) -> Result<ExistingKeys, Error> {
        Err(anyhow::anyhow!("connection refused"))
    }
}

#[tokio::test]
async fn destination_outage_fails_the_job() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let mut csv = String::from("email,name\n");
    for i in 0..20 {
        csv.push_str(&format!("person{i}@acme.io,Person {i}\n"));
    }
    let source = write_source(&dir, "outage.csv", &csv);
    let store = Arc::new(UnavailableStore {
        attempts: AtomicUsize::new(0),
    });
    let services = harness.services_with(store.clone(), settings());

    let job = harness
        .run_with(
            request(source, email_and_name(), batch_of(2)),
            services,
            CancelSignal::new(),
        )
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .status_message
        .as_deref()
        .unwrap()
        .contains("destination unavailable"));
    // Three batches, two attempts each
    assert_eq!(store.attempts.load(Ordering::SeqCst), 6);
    assert_eq!(job.error_rows, 6);
    assert_eq!(job.successful_rows, 0);
    assert_reconciled(&job);
}

#[tokio::test]
async fn mapping_without_a_name_fails_before_reading() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = write_source(&dir, "reference.csv", REFERENCE_CSV);
    let mapping = FieldMapping::new([("email", ContactField::Email)]);

    let job = harness.run(request(source, mapping, batch_of(2))).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.started_at.is_none());
    assert_eq!(job.processed_rows, 0);
    assert!(job
        .status_message
        .as_deref()
        .unwrap()
        .contains("invalid configuration"));
}

#[tokio::test]
async fn mapping_a_missing_column_fails_the_job() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = write_source(&dir, "reference.csv", REFERENCE_CSV);
    let mapping = FieldMapping::new([
        ("Full Name", ContactField::FullName),
        ("email", ContactField::Email),
    ]);

    let job = harness.run(request(source, mapping, batch_of(2))).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.processed_rows, 0);
    assert!(harness.contacts.is_empty().await);
}

#[tokio::test]
async fn unreadable_source_fails_with_a_user_message() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = SourceConfig::File {
        path: dir.path().join("never-uploaded.csv"),
    };

    let job = harness
        .run(request(source, email_and_name(), batch_of(2)))
        .await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .status_message
        .as_deref()
        .unwrap()
        .contains("source unreadable"));
    assert_eq!(
        job.display_status_message.as_deref(),
        Some("The uploaded file could not be read. Please upload it again.")
    );
}

#[tokio::test]
async fn duplicate_headers_are_mapped_independently() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = write_source(
        &dir,
        "headers.csv",
        "Name,Email,Email\nJane Doe,jane@acme.io,jane@gmail.com\n",
    );
    let mapping = FieldMapping::new([
        ("Name", ContactField::FullName),
        ("Email", ContactField::Email),
        ("Email__1", ContactField::SecondaryEmail),
    ]);

    let job = harness.run(request(source, mapping, batch_of(2))).await;

    assert_eq!(job.status, JobStatus::Completed);
    let stored = harness.contacts.contacts().await;
    assert_eq!(stored[0].record.email.as_deref(), Some("jane@acme.io"));
    assert_eq!(
        stored[0].record.secondary_email.as_deref(),
        Some("jane@gmail.com")
    );
    assert_eq!(stored[0].record.email_domain.as_deref(), Some("acme.io"));
}

#[tokio::test]
async fn saved_snapshots_always_reconcile() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let mut csv = String::from("email,name\n");
    for i in 0..30 {
        let email = if i % 4 == 3 {
            "dup@acme.io".to_string()
        } else {
            format!("p{i}@acme.io")
        };
        csv.push_str(&format!("{email},Person {i}\n"));
    }
    let source = write_source(&dir, "many.csv", &csv);

    let job = harness
        .run(request(source, email_and_name(), batch_of(3)))
        .await;
    assert_eq!(job.status, JobStatus::Completed);

    let history = harness.jobs.history(job.id);
    assert!(history.len() > 2);
    let mut last_processed = 0;
    for snapshot in &history {
        assert_eq!(
            snapshot.processed_rows,
            snapshot.successful_rows + snapshot.error_rows + snapshot.duplicate_rows
        );
        assert!(snapshot.processed_rows >= last_processed);
        last_processed = snapshot.processed_rows;
    }
    assert_eq!(history.first().unwrap().status, JobStatus::Pending);
    assert_eq!(history.last().unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn counting_first_fills_in_the_total_before_rows_are_written() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = write_source(&dir, "reference.csv", REFERENCE_CSV);
    let options = ImportOptions {
        count_rows_first: true,
        ..batch_of(2)
    };

    let job = harness.run(request(source, email_and_name(), options)).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_rows, Some(4));
    let first_with_rows = harness
        .jobs
        .history(job.id)
        .into_iter()
        .find(|s| s.processed_rows > 0)
        .unwrap();
    assert_eq!(first_with_rows.total_rows, Some(4));
}

#[tokio::test]
async fn observers_see_progress_until_the_terminal_snapshot() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let mut csv = String::from("email,name\n");
    for i in 0..12 {
        csv.push_str(&format!("person{i}@acme.io,Person {i}\n"));
    }
    let source = write_source(&dir, "observed.csv", &csv);
    let job = ImportJob::new(request(source, email_and_name(), batch_of(2)));
    harness.jobs.save_job(&job).await.unwrap();

    let mut subscription = harness.publisher.subscribe(job.id);
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(snapshot) = subscription.next().await {
            seen.push(snapshot);
        }
        seen
    });

    let finished = Job::new(job, harness.services(settings()), CancelSignal::new())
        .run()
        .await
        .unwrap();
    let seen = tokio::time::timeout(Duration::from_secs(5), observer)
        .await
        .unwrap()
        .unwrap();

    let last = seen.last().unwrap();
    assert_eq!(last.status, JobStatus::Completed);
    assert_eq!(last.successful_rows, 12);
    assert_eq!(last.processed_rows, finished.processed_rows);
    assert_eq!(harness.publisher.topic_count(), 0);
}

#[tokio::test]
async fn semicolon_files_without_header_use_positional_columns() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::new();
    let source = write_source(
        &dir,
        "positional.csv",
        "Jane;Doe;jane@acme.io\nJohn;Roe;john@acme.io\n",
    );
    let mapping = FieldMapping::new([
        ("column_1", ContactField::FirstName),
        ("column_2", ContactField::LastName),
        ("column_3", ContactField::Email),
    ]);
    let options = ImportOptions {
        has_header: false,
        ..batch_of(10)
    };

    let job = harness.run(request(source, mapping, options)).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.successful_rows, 2);
    let stored = harness.contacts.contacts().await;
    assert_eq!(stored[0].record.full_name, "Jane Doe");
}
