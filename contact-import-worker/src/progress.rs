use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{job::model::JobStatus, metrics_consts::PROGRESS_UNOBSERVED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub processed_rows: u64,
    pub successful_rows: u64,
    pub error_rows: u64,
    pub duplicate_rows: u64,
    pub total_rows: Option<u64>,
}

impl ProgressSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

type Topic = watch::Sender<Option<ProgressSnapshot>>;

/// Fan-out of job progress to live observers. Publishing never waits: each topic
/// holds only the latest snapshot, so a slow observer skips to the newest one.
/// Observers only see snapshots published after they subscribed.
#[derive(Default)]
pub struct ProgressPublisher {
    topics: DashMap<Uuid, Topic>,
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: ProgressSnapshot) {
        let job_id = snapshot.job_id;
        match self.topics.get(&job_id) {
            Some(topic) if topic.receiver_count() > 0 => {
                topic.send_replace(Some(snapshot));
            }
            _ => metrics::counter!(PROGRESS_UNOBSERVED).increment(1),
        }

        // Closing the topic ends every subscription once it has seen this snapshot
        if snapshot.is_terminal() {
            self.topics.remove(&job_id);
        }
    }

    pub fn subscribe(&self, job_id: Uuid) -> ProgressSubscription {
        let receiver = self
            .topics
            .entry(job_id)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        ProgressSubscription {
            receiver,
            finished: false,
        }
    }

    /// Drops the job's topic if nobody listens to it any more.
    pub fn release(&self, job_id: Uuid) {
        self.topics
            .remove_if(&job_id, |_, topic| topic.receiver_count() == 0);
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

pub struct ProgressSubscription {
    receiver: watch::Receiver<Option<ProgressSnapshot>>,
    finished: bool,
}

impl ProgressSubscription {
    /// Waits for the next snapshot. None once the job has reached a terminal status
    /// and that final snapshot has been returned.
    pub async fn next(&mut self) -> Option<ProgressSnapshot> {
        if self.finished {
            return None;
        }
        loop {
            if self.receiver.changed().await.is_err() {
                self.finished = true;
                return None;
            }
            let latest = *self.receiver.borrow_and_update();
            if let Some(snapshot) = latest {
                self.finished = snapshot.is_terminal();
                return Some(snapshot);
            }
        }
    }
}
