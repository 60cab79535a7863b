//! Process-local queue backed by a `VecDeque`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use storycrew_shared::{Job, JobPatch, JobStatus, Result, StoryCrewError};

use crate::DurableQueue;

#[derive(Default)]
struct State {
    pending: VecDeque<String>,
    items: HashMap<String, Job>,
}

/// In-memory [`DurableQueue`]. Items do not survive the process.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items held, in any status.
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_claim(&self) -> Result<Option<Job>> {
        let mut state = self.state();
        while let Some(id) = state.pending.pop_front() {
            let Some(job) = state.items.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Queued {
                continue;
            }
            job.transition(JobStatus::Running, JobPatch::started(Utc::now()))?;
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn enqueue(&self, job: &Job) -> Result<String> {
        if job.status != JobStatus::Queued {
            return Err(StoryCrewError::validation(format!(
                "only queued jobs can be enqueued, {} is {}",
                job.id, job.status
            )));
        }
        let id = job.id.to_string();
        {
            let mut state = self.state();
            if state.items.contains_key(&id) {
                return Err(StoryCrewError::DuplicateId(id));
            }
            state.items.insert(id.clone(), job.clone());
            state.pending.push_back(id.clone());
        }
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.try_claim()? {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn get_status(&self, item_id: &str) -> Result<Option<Job>> {
        Ok(self.state().items.get(item_id).cloned())
    }

    async fn update_status(&self, item_id: &str, status: JobStatus, patch: JobPatch) -> Result<()> {
        let mut state = self.state();
        let job = state
            .items
            .get_mut(item_id)
            .ok_or_else(|| StoryCrewError::NotFound(item_id.to_string()))?;
        job.transition(status, patch)
    }

    async fn pending(&self) -> Result<usize> {
        let state = self.state();
        Ok(state
            .items
            .values()
            .filter(|job| job.status == JobStatus::Queued)
            .count())
    }

    async fn evict_terminal(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state();
        let before_len = state.items.len();
        state.items.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|at| at < before))
        });
        Ok(before_len - state.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use storycrew_shared::{JobId, PipelineResult, SubmitRequest};

    fn job(n: u64) -> Job {
        let request = SubmitRequest::new("architect", "p1", "u1", json!({}));
        let now = Utc::now();
        Job::queued(JobId::derive("architect", "p1", now, n), &request, now)
    }

    #[tokio::test]
    async fn fifo_claim_marks_running() {
        let queue = MemoryQueue::new();
        let first = queue.enqueue(&job(1)).await.unwrap();
        let second = queue.enqueue(&job(2)).await.unwrap();
        assert_eq!(queue.pending().await.unwrap(), 2);

        let claimed = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(claimed.id.as_str(), first);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        let claimed = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(claimed.id.as_str(), second);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let queue = MemoryQueue::new();
        let claimed = queue.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = queue.enqueue(&job(1)).await.unwrap();

        let claimed = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(claimed.id.as_str(), id);
    }

    #[tokio::test]
    async fn each_item_is_claimed_once() {
        let queue = Arc::new(MemoryQueue::new());
        for n in 0..20 {
            queue.enqueue(&job(n)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = queue.dequeue(Duration::from_millis(20)).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 20);
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn update_status_follows_state_machine() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue(&job(1)).await.unwrap();

        let err = queue
            .update_status(&id, JobStatus::Completed, JobPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoryCrewError::InvalidTransition { .. }));

        queue.dequeue(Duration::from_millis(10)).await.unwrap();
        let result = PipelineResult::success("architect", "p1", "story analysis ready");
        queue
            .update_status(&id, JobStatus::Completed, JobPatch::completed(result, Utc::now()))
            .await
            .unwrap();
        let stored = queue.get_status(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress, 100);
    }

    #[tokio::test]
    async fn evict_terminal_keeps_live_and_recent_items() {
        let queue = MemoryQueue::new();
        let finished = queue.enqueue(&job(1)).await.unwrap();
        let running = queue.enqueue(&job(2)).await.unwrap();
        let waiting = queue.enqueue(&job(3)).await.unwrap();
        queue.dequeue(Duration::from_millis(10)).await.unwrap();
        queue.dequeue(Duration::from_millis(10)).await.unwrap();
        let at = Utc::now() - chrono::Duration::minutes(30);
        queue
            .update_status(&finished, JobStatus::Failed, JobPatch::failed("stage error", at))
            .await
            .unwrap();

        assert_eq!(queue.evict_terminal(at).await.unwrap(), 0);
        assert_eq!(queue.evict_terminal(Utc::now()).await.unwrap(), 1);
        assert!(queue.get_status(&finished).await.unwrap().is_none());
        assert!(queue.get_status(&running).await.unwrap().is_some());
        assert!(queue.get_status(&waiting).await.unwrap().is_some());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_and_missing_ids() {
        let queue = MemoryQueue::new();
        let j = job(1);
        queue.enqueue(&j).await.unwrap();
        assert!(matches!(
            queue.enqueue(&j).await.unwrap_err(),
            StoryCrewError::DuplicateId(_)
        ));
        assert!(queue.get_status("nope").await.unwrap().is_none());
        assert!(matches!(
            queue
                .update_status("nope", JobStatus::Running, JobPatch::default())
                .await
                .unwrap_err(),
            StoryCrewError::NotFound(_)
        ));
    }
}
