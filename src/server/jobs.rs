//! Background verification jobs
//!
//! Each job owns a cancellation token that fires either on an explicit
//! cancel request or when the configured deadline passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::event::validate_partition;
use crate::audit::verify::{ChainVerificationResult, ChainVerifier};
use crate::error::LedgerResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationJob {
    pub job_id: Uuid,
    pub partition: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<ChainVerificationResult>,
    pub error: Option<String>,
}

struct JobEntry {
    job: VerificationJob,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct VerificationJobs {
    verifier: ChainVerifier,
    jobs: Arc<RwLock<HashMap<Uuid, JobEntry>>>,
    deadline: Duration,
    max_retained: usize,
}

impl VerificationJobs {
    pub fn new(verifier: ChainVerifier, deadline: Duration, max_retained: usize) -> Self {
        Self {
            verifier,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            deadline,
            max_retained: max_retained.max(1),
        }
    }

    /// Run a verification inline, still bounded by the deadline
    pub async fn run(&self, partition: &str) -> LedgerResult<ChainVerificationResult> {
        run_with_deadline(&self.verifier, partition, CancellationToken::new(), self.deadline).await
    }

    /// Start a verification on a background task and return its handle
    pub async fn start(&self, partition: &str) -> LedgerResult<VerificationJob> {
        validate_partition(partition)?;

        let job = VerificationJob {
            job_id: Uuid::new_v4(),
            partition: partition.to_string(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        };
        let cancel = CancellationToken::new();

        {
            let mut jobs = self.jobs.write().await;
            prune(&mut jobs, self.max_retained);
            jobs.insert(
                job.job_id,
                JobEntry {
                    job: job.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        info!("Started verification job {} for {}", job.job_id, partition);

        let jobs = self.jobs.clone();
        let verifier = self.verifier.clone();
        let deadline = self.deadline;
        let job_id = job.job_id;
        let partition = partition.to_string();
        tokio::spawn(async move {
            let outcome = run_with_deadline(&verifier, &partition, cancel, deadline).await;

            let mut jobs = jobs.write().await;
            let Some(entry) = jobs.get_mut(&job_id) else {
                return;
            };
            entry.job.finished_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    entry.job.status = if result.complete {
                        JobStatus::Completed
                    } else {
                        JobStatus::Cancelled
                    };
                    info!(
                        "Verification job {} for {} finished: {:?}",
                        job_id, partition, entry.job.status
                    );
                    entry.job.result = Some(result);
                }
                Err(e) => {
                    error!("Verification job {} for {} failed: {}", job_id, partition, e);
                    entry.job.status = JobStatus::Failed;
                    entry.job.error = Some(e.to_string());
                }
            }
        });

        Ok(job)
    }

    pub async fn get(&self, job_id: &Uuid) -> Option<VerificationJob> {
        self.jobs.read().await.get(job_id).map(|entry| entry.job.clone())
    }

    /// Request cancellation; the job records its partial result when the
    /// walk notices.
    pub async fn cancel(&self, job_id: &Uuid) -> Option<VerificationJob> {
        let jobs = self.jobs.read().await;
        let entry = jobs.get(job_id)?;
        if !entry.job.status.is_finished() {
            warn!("Cancelling verification job {}", job_id);
            entry.cancel.cancel();
        }
        Some(entry.job.clone())
    }
}

async fn run_with_deadline(
    verifier: &ChainVerifier,
    partition: &str,
    cancel: CancellationToken,
    deadline: Duration,
) -> LedgerResult<ChainVerificationResult> {
    let timer = cancel.clone();
    let deadline_task = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => {
                warn!("Verification deadline of {:?} reached", deadline);
                timer.cancel();
            }
            _ = timer.cancelled() => {}
        }
    });

    let outcome = verifier.verify_chain(partition, &cancel).await;
    deadline_task.abort();
    outcome
}

/// Drop the oldest finished jobs until there is room for one more
fn prune(jobs: &mut HashMap<Uuid, JobEntry>, max_retained: usize) {
    if jobs.len() < max_retained {
        return;
    }
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter(|entry| entry.job.status.is_finished())
        .map(|entry| (entry.job.started_at, entry.job.job_id))
        .collect();
    finished.sort();

    let excess = jobs.len() + 1 - max_retained;
    for (_, job_id) in finished.into_iter().take(excess) {
        jobs.remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{Actor, EventType, NewAuditEvent, Outcome, Resource};
    use crate::audit::ledger::{AuditLedger, RetryPolicy};
    use crate::crypto::{KeyManager, Signer, Verifier};
    use crate::store::InMemoryChainStore;

    async fn jobs_with_chain(blocks: usize, deadline: Duration, max_retained: usize) -> VerificationJobs {
        let store = Arc::new(InMemoryChainStore::new());
        let keys = Arc::new(KeyManager::generate());
        let ledger = AuditLedger::new(store.clone(), Signer::new(keys.clone()), RetryPolicy::default());
        for i in 0..blocks {
            ledger
                .record(
                    "org1",
                    NewAuditEvent::new(
                        EventType::System,
                        Actor {
                            user_id: "scheduler".to_string(),
                            org_id: "org1".to_string(),
                        },
                        Resource {
                            resource_type: "job".to_string(),
                            resource_id: format!("nightly-{}", i),
                        },
                        "run",
                        Outcome::success(),
                    ),
                )
                .await
                .unwrap();
        }
        VerificationJobs::new(
            ChainVerifier::new(store, Verifier::new(keys)),
            deadline,
            max_retained,
        )
    }

    async fn wait_for(jobs: &VerificationJobs, job_id: &Uuid) -> VerificationJob {
        for _ in 0..200 {
            let job = jobs.get(job_id).await.unwrap();
            if job.status.is_finished() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[tokio::test]
    async fn test_job_completes() {
        let jobs = jobs_with_chain(3, Duration::from_secs(30), 10).await;
        let job = jobs.start("org1").await.unwrap();
        assert_eq!(job.status, JobStatus::Running);

        let done = wait_for(&jobs, &job.job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        let result = done.result.unwrap();
        assert!(result.verified);
        assert_eq!(result.total_blocks, 3);
    }

    #[tokio::test]
    async fn test_inline_run() {
        let jobs = jobs_with_chain(2, Duration::from_secs(30), 10).await;
        let result = jobs.run("org1").await.unwrap();
        assert!(result.verified);
        assert!(jobs.run("not valid").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let jobs = jobs_with_chain(0, Duration::from_secs(30), 10).await;
        assert!(jobs.get(&Uuid::new_v4()).await.is_none());
        assert!(jobs.cancel(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_finished_jobs_are_pruned() {
        let jobs = jobs_with_chain(1, Duration::from_secs(30), 2).await;
        let first = jobs.start("org1").await.unwrap();
        wait_for(&jobs, &first.job_id).await;
        let second = jobs.start("org1").await.unwrap();
        wait_for(&jobs, &second.job_id).await;
        let third = jobs.start("org1").await.unwrap();

        assert!(jobs.get(&first.job_id).await.is_none());
        assert!(jobs.get(&second.job_id).await.is_some());
        assert!(jobs.get(&third.job_id).await.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_run() {
        let jobs = jobs_with_chain(1, Duration::from_secs(30), 10).await;
        let token = CancellationToken::new();
        token.cancel();
        let result = run_with_deadline(&jobs.verifier, "org1", token, jobs.deadline)
            .await
            .unwrap();
        assert!(!result.complete);
    }
}
