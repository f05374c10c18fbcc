//! Task Tracker
//!
//! In-memory registry of submitted jobs. Each entry lives until the
//! reconciler sees a terminal status for it or its time-to-live runs out,
//! whichever comes first. Removal from the registry is the single point that
//! decides who delivers and debits a job, so a job is charged at most once
//! even if two passes were to see it.

use crate::buttons::render_buttons;
use crate::client::{RenderClient, RenderError, TaskDetail, TaskStatus};
use crate::delivery::{Delivery, Reply};
use crate::error::GatewayError;
use crate::identity::{IdentityKey, ReplyTarget};
use crate::quota::QuotaLedger;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::notification::RemovalCause;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Upper bound on tracked jobs
const MAX_TRACKED_JOBS: u64 = 100_000;

/// A submitted job awaiting a terminal status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedJob {
    /// Id assigned by the rendering service
    pub job_id: String,
    /// Quota record charged on success
    pub identity_key: IdentityKey,
    /// Where the result goes
    pub target: ReplyTarget,
    /// Registration instant
    pub registered_at: DateTime<Utc>,
}

/// Outcome counts of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Jobs finished with a result
    pub succeeded: usize,
    /// Jobs finished without a result
    pub failed: usize,
    /// Jobs still running remotely
    pub pending: usize,
    /// Quota debits performed
    pub debited: usize,
    /// Replies the transport gave up on
    pub delivery_failures: usize,
}

/// Registry of outstanding jobs plus the reconciliation pass
pub struct TaskTracker {
    jobs: Cache<String, Arc<TrackedJob>>,
    client: Arc<dyn RenderClient>,
    delivery: Arc<dyn Delivery>,
    ledger: Arc<QuotaLedger>,
    pass: Mutex<()>,
}

impl TaskTracker {
    /// Creates an empty tracker whose entries expire after `ttl`
    pub fn new(
        client: Arc<dyn RenderClient>,
        delivery: Arc<dyn Delivery>,
        ledger: Arc<QuotaLedger>,
        ttl: Duration,
    ) -> Self {
        let jobs = Cache::builder()
            .max_capacity(MAX_TRACKED_JOBS)
            .time_to_live(ttl)
            .eviction_listener(|job_id: Arc<String>, _job, cause| {
                log_eviction(&job_id, cause);
            })
            .build();
        Self {
            jobs,
            client,
            delivery,
            ledger,
            pass: Mutex::new(()),
        }
    }

    /// Starts tracking `job_id`. Returns `false` if it was already tracked,
    /// in which case the existing entry is kept.
    pub async fn register(
        &self,
        job_id: &str,
        identity_key: IdentityKey,
        target: ReplyTarget,
    ) -> bool {
        let job = Arc::new(TrackedJob {
            job_id: job_id.to_string(),
            identity_key,
            target,
            registered_at: Utc::now(),
        });
        let entry = self
            .jobs
            .entry(job_id.to_string())
            .or_insert_with(async move { job })
            .await;
        if entry.is_fresh() {
            debug!(job_id, "Job registered");
        }
        entry.is_fresh()
    }

    /// Whether `job_id` is still tracked
    #[must_use]
    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Ids of every tracked job
    #[must_use]
    pub fn tracked_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|(id, _)| id.as_str().to_string()).collect()
    }

    /// Runs one reconciliation pass.
    ///
    /// All tracked ids are queried in one batch. Finished jobs are removed,
    /// delivered and, for quota-consuming actions that succeeded, debited
    /// once. Pending jobs stay tracked.
    ///
    /// # Errors
    ///
    /// Returns `RenderError` when the batch query fails; nothing is removed
    /// and the same set is retried on the next pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport, RenderError> {
        let _pass = self.pass.lock().await;
        let mut report = ReconcileReport::default();

        let ids = self.tracked_ids();
        if ids.is_empty() {
            return Ok(report);
        }
        debug!(count = ids.len(), "Reconciling tracked jobs");

        let tasks = self.client.list_by_condition(&ids).await?;
        for task in tasks {
            let status = task.status();
            if status == TaskStatus::Pending {
                report.pending += 1;
                continue;
            }
            // Whoever removes the entry owns delivery and debit
            let Some(job) = self.jobs.remove(&task.id).await else {
                continue;
            };
            match status {
                TaskStatus::Succeeded => self.complete(&job, &task, &mut report).await,
                TaskStatus::Failed => self.fail(&job, &task, &mut report).await,
                TaskStatus::Pending => {}
            }
        }

        if report.succeeded + report.failed > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                pending = report.pending,
                debited = report.debited,
                "Reconciliation pass finished"
            );
        }
        Ok(report)
    }

    async fn complete(&self, job: &TrackedJob, task: &TaskDetail, report: &mut ReconcileReport) {
        report.succeeded += 1;
        info!(job_id = %job.job_id, action = %task.action, "Job succeeded");

        if !task.is_metadata_only() {
            if let Some(url) = &task.image_url {
                self.send(&job.target, Reply::ImageUrl(url.clone()), report)
                    .await;
            }
        }
        self.send(&job.target, Reply::Text(success_text(task)), report)
            .await;

        if task.is_metadata_only() {
            return;
        }
        match self.ledger.debit(&job.identity_key, 1).await {
            Ok(Some(record)) => {
                report.debited += 1;
                debug!(
                    identity = %job.identity_key,
                    remaining = record.remaining,
                    "Charged completed job"
                );
            }
            Ok(None) => {}
            Err(e) => error!(identity = %job.identity_key, error = %e, "Failed to debit quota"),
        }
    }

    async fn fail(&self, job: &TrackedJob, task: &TaskDetail, report: &mut ReconcileReport) {
        report.failed += 1;
        warn!(
            job_id = %job.job_id,
            reason = task.fail_reason.as_deref().unwrap_or_default(),
            "Job failed"
        );
        self.send(&job.target, Reply::Text(failure_text(task)), report)
            .await;
    }

    async fn send(&self, target: &ReplyTarget, reply: Reply, report: &mut ReconcileReport) {
        if let Err(e) = self.delivery.deliver(target, reply).await {
            report.delivery_failures += 1;
            error!(receiver = %target.receiver, error = %e, "Failed to deliver job result");
        }
    }
}

/// Logs a job leaving the registry without a reconciliation pass.
///
/// Returns `false` for removals the tracker made itself.
fn log_eviction(job_id: &str, cause: RemovalCause) -> bool {
    match cause {
        RemovalCause::Explicit | RemovalCause::Replaced => false,
        RemovalCause::Expired => {
            let expired = GatewayError::ExpiredJob(job_id.to_string());
            info!(error = %expired, "Dropping tracked job without charge");
            true
        }
        RemovalCause::Size => {
            warn!(job_id, "Tracker at capacity, dropping job without charge");
            true
        }
    }
}

/// Completion notice with the follow-up menu
#[must_use]
pub fn success_text(task: &TaskDetail) -> String {
    let body = if task.is_metadata_only() {
        task.properties
            .final_prompt
            .clone()
            .unwrap_or_else(|| task.description.clone())
    } else {
        format!("✨ {}", task.description)
    };
    format!(
        "✅ Task complete\n📨 Task ID: {id}\n{body}\n\n{menu}\n💡 Run an action with /up <task-id> <n>\n🔖 /up {id} 1",
        id = task.id,
        menu = render_buttons(&task.buttons),
    )
}

/// Failure notice
#[must_use]
pub fn failure_text(task: &TaskDetail) -> String {
    format!(
        "❌ Task failed\n✨ {}\n📨 Task ID: {}\n📒 Reason: {}",
        task.description,
        task.id,
        task.fail_reason.as_deref().unwrap_or("unknown"),
    )
}
