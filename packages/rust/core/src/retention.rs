//! Periodic eviction of terminal jobs from the registry and durable queue.
//!
//! Running and queued jobs are never touched. Terminal jobs go once they
//! are older than the TTL, and again (oldest first) while the registry is
//! over its optional size cap. The cap applies to the registry only.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use storycrew_shared::{Result, RetentionConfig};
use storycrew_storage::DurableQueue;

use crate::registry::JobRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub max_jobs: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from(&RetentionConfig::default())
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            ttl: config.job_ttl(),
            sweep_interval: config.sweep_interval(),
            max_jobs: config.max_jobs,
        }
    }
}

impl RetentionPolicy {
    /// Jobs that finished before this instant are expired.
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// One registry eviction pass as of `now`. Returns the number of jobs
    /// removed.
    pub fn sweep(&self, registry: &JobRegistry, now: DateTime<Utc>) -> usize {
        let mut evicted = registry.evict_terminal(self.cutoff(now));
        if let Some(max_jobs) = self.max_jobs {
            evicted += registry.evict_oldest_terminal(max_jobs);
        }
        evicted
    }

    /// Drop expired terminal items from the durable queue.
    pub async fn sweep_queue(&self, queue: &dyn DurableQueue, now: DateTime<Utc>) -> Result<usize> {
        queue.evict_terminal(self.cutoff(now)).await
    }

    /// Sweep every `sweep_interval` until `cancel` fires.
    pub async fn run(
        self,
        registry: Arc<JobRegistry>,
        queue: Option<Arc<dyn DurableQueue>>,
        cancel: CancellationToken,
    ) {
        info!(
            ttl_secs = self.ttl.as_secs(),
            interval_secs = self.sweep_interval.as_secs(),
            max_jobs = ?self.max_jobs,
            "retention sweeper started"
        );
        let mut interval = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("retention sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    let now = Utc::now();
                    let evicted = self.sweep(&registry, now);
                    if evicted > 0 {
                        info!(evicted, remaining = registry.len(), "evicted terminal jobs");
                    }
                    let Some(queue) = &queue else {
                        continue;
                    };
                    match self.sweep_queue(queue.as_ref(), now).await {
                        Ok(0) => {}
                        Ok(evicted) => info!(evicted, "evicted terminal queue items"),
                        Err(e) => warn!(error = %e, "queue eviction failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storycrew_shared::{Job, JobId, JobPatch, JobStatus, PipelineResult, SubmitRequest};
    use storycrew_storage::MemoryQueue;

    fn add(registry: &JobRegistry, n: u64, finished_at: Option<DateTime<Utc>>) -> JobId {
        let request = SubmitRequest::new("director", "p1", "u1", json!({}));
        let created = Utc::now() - chrono::Duration::hours(3);
        let id = JobId::derive("director", "p1", created, n);
        registry.create(Job::queued(id.clone(), &request, created)).unwrap();
        registry
            .update_status(&id, JobStatus::Running, JobPatch::started(created))
            .unwrap();
        if let Some(at) = finished_at {
            let result = PipelineResult::success("director", "p1", "shot list ready");
            registry
                .update_status(&id, JobStatus::Completed, JobPatch::completed(result, at))
                .unwrap();
        }
        id
    }

    #[test]
    fn ttl_sweep_keeps_recent_and_running_jobs() {
        let registry = JobRegistry::new();
        let now = Utc::now();
        let old = add(&registry, 1, Some(now - chrono::Duration::hours(2)));
        let recent = add(&registry, 2, Some(now - chrono::Duration::minutes(5)));
        let running = add(&registry, 3, None);

        let policy = RetentionPolicy {
            ttl: Duration::from_secs(3600),
            ..Default::default()
        };
        assert_eq!(policy.sweep(&registry, now), 1);
        assert!(!registry.contains(&old));
        assert!(registry.contains(&recent));
        assert!(registry.contains(&running));
    }

    #[test]
    fn size_cap_evicts_oldest_terminal_first() {
        let registry = JobRegistry::new();
        let now = Utc::now();
        let oldest = add(&registry, 1, Some(now - chrono::Duration::minutes(30)));
        let newer = add(&registry, 2, Some(now - chrono::Duration::minutes(10)));
        let running = add(&registry, 3, None);

        let policy = RetentionPolicy {
            max_jobs: Some(2),
            ..Default::default()
        };
        assert_eq!(policy.sweep(&registry, now), 1);
        assert!(!registry.contains(&oldest));
        assert!(registry.contains(&newer));
        assert!(registry.contains(&running));
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let registry = JobRegistry::new();
        add(&registry, 1, Some(Utc::now()));
        let policy = RetentionPolicy {
            ttl: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(policy.sweep(&registry, Utc::now()), 0);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let registry = Arc::new(JobRegistry::new());
        add(&registry, 1, Some(Utc::now() - chrono::Duration::hours(2)));
        let cancel = CancellationToken::new();
        let policy = RetentionPolicy {
            ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            max_jobs: None,
        };
        let task = tokio::spawn(policy.run(registry.clone(), None, cancel.clone()));

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        task.await.unwrap();
    }

    /// Enqueue a director job and, when `finish` is set, claim and complete it.
    async fn queue_item(queue: &MemoryQueue, n: u64, finish: bool) -> String {
        let request = SubmitRequest::new("director", "p1", "u1", json!({}));
        let now = Utc::now();
        let job = Job::queued(JobId::derive("director", "p1", now, n), &request, now);
        let id = queue.enqueue(&job).await.unwrap();
        if finish {
            queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
            let result = PipelineResult::success("director", "p1", "shot list ready");
            queue
                .update_status(&id, JobStatus::Completed, JobPatch::completed(result, now))
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn queue_sweep_drops_expired_terminal_items() {
        let queue = MemoryQueue::new();
        let done = queue_item(&queue, 1, true).await;
        let waiting = queue_item(&queue, 2, false).await;

        let policy = RetentionPolicy {
            ttl: Duration::from_secs(3600),
            ..Default::default()
        };
        assert_eq!(policy.sweep_queue(&queue, Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(policy.sweep_queue(&queue, later).await.unwrap(), 1);
        assert!(queue.get_status(&done).await.unwrap().is_none());
        assert!(queue.get_status(&waiting).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweeper_shrinks_the_queue() {
        let queue = Arc::new(MemoryQueue::new());
        queue_item(&queue, 1, true).await;
        queue_item(&queue, 2, true).await;
        queue_item(&queue, 3, false).await;

        let cancel = CancellationToken::new();
        let policy = RetentionPolicy {
            ttl: Duration::ZERO,
            sweep_interval: Duration::from_secs(1),
            max_jobs: None,
        };
        let task = tokio::spawn(policy.run(
            Arc::new(JobRegistry::new()),
            Some(queue.clone() as Arc<dyn DurableQueue>),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending().await.unwrap(), 1);
    }
}
