//! In-memory job registry.
//!
//! Jobs live in a map of per-job handles. The map lock is taken only to look
//! up, insert, remove or clone handles; every read-modify-write of a job
//! happens under that job's own mutex, so updates to different jobs never
//! contend and updates to the same job are serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use storycrew_shared::{Job, JobId, JobPatch, JobStatus, RegistryStats, Result, StoryCrewError};

type JobHandle = Arc<Mutex<Job>>;

/// Thread-safe store of every job this process knows about.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new job. Fails if the ID is already tracked.
    pub fn create(&self, job: Job) -> Result<JobId> {
        let id = job.id.clone();
        let mut jobs = self.write();
        if jobs.contains_key(&id) {
            return Err(StoryCrewError::DuplicateId(id.to_string()));
        }
        jobs.insert(id.clone(), Arc::new(Mutex::new(job)));
        debug!(job_id = %id, "job registered");
        Ok(id)
    }

    /// Snapshot of one job.
    pub fn get(&self, job_id: &JobId) -> Result<Job> {
        let handle = self.handle(job_id)?;
        let job = lock(&handle).clone();
        Ok(job)
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.read().contains_key(job_id)
    }

    /// Move a job to `status`, merging `patch` atomically. Returns the
    /// updated snapshot.
    pub fn update_status(&self, job_id: &JobId, status: JobStatus, patch: JobPatch) -> Result<Job> {
        let handle = self.handle(job_id)?;
        let mut job = lock(&handle);
        let from = job.status;
        job.transition(status, patch)?;
        debug!(job_id = %job_id, %from, to = %status, "job status updated");
        Ok(job.clone())
    }

    /// Adopt `snapshot` when it is further along than the tracked job, such
    /// as the queue's copy of a job another process claimed or finished.
    /// Terminal entries never change. Returns the entry as stored.
    pub fn sync(&self, snapshot: Job) -> Result<Job> {
        let handle = self.handle(&snapshot.id)?;
        let mut job = lock(&handle);
        if rank(snapshot.status) > rank(job.status) {
            debug!(job_id = %job.id, from = %job.status, to = %snapshot.status, "job synced");
            *job = snapshot;
        }
        Ok(job.clone())
    }

    /// Raise the progress of a running job. Lower values are ignored.
    pub fn report_progress(&self, job_id: &JobId, progress: u8) -> Result<u8> {
        let handle = self.handle(job_id)?;
        let mut job = lock(&handle);
        if job.status != JobStatus::Running {
            return Err(StoryCrewError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: job.status,
            });
        }
        job.raise_progress(progress);
        Ok(job.progress)
    }

    /// Counts by status.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for handle in self.handles() {
            let status = lock(&handle).status;
            stats.total += 1;
            match status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Remove terminal jobs that completed before `older_than`.
    /// Returns the number evicted.
    pub fn evict_terminal(&self, older_than: DateTime<Utc>) -> usize {
        let expired: Vec<JobId> = self
            .terminal_jobs()
            .into_iter()
            .filter(|(_, completed_at)| *completed_at < older_than)
            .map(|(id, _)| id)
            .collect();
        self.remove_terminal(&expired)
    }

    /// Evict the oldest terminal jobs until at most `max_jobs` remain, or no
    /// terminal jobs are left. Returns the number evicted.
    pub fn evict_oldest_terminal(&self, max_jobs: usize) -> usize {
        let len = self.len();
        if len <= max_jobs {
            return 0;
        }
        let mut terminal = self.terminal_jobs();
        terminal.sort_by_key(|(_, completed_at)| *completed_at);
        let excess: Vec<JobId> = terminal
            .into_iter()
            .take(len - max_jobs)
            .map(|(id, _)| id)
            .collect();
        self.remove_terminal(&excess)
    }

    /// Drop a job that never left `queued`. Used to roll back a submission
    /// whose durable enqueue failed.
    pub fn discard(&self, job_id: &JobId) -> bool {
        let mut jobs = self.write();
        let queued = jobs
            .get(job_id)
            .is_some_and(|handle| lock(handle).status == JobStatus::Queued);
        if queued {
            jobs.remove(job_id);
        }
        queued
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn handle(&self, job_id: &JobId) -> Result<JobHandle> {
        self.read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoryCrewError::NotFound(job_id.to_string()))
    }

    fn handles(&self) -> Vec<JobHandle> {
        self.read().values().cloned().collect()
    }

    /// `(id, completed_at)` of every terminal job.
    fn terminal_jobs(&self) -> Vec<(JobId, DateTime<Utc>)> {
        self.handles()
            .iter()
            .filter_map(|handle| {
                let job = lock(handle);
                job.status
                    .is_terminal()
                    .then(|| (job.id.clone(), job.completed_at.unwrap_or(job.created_at)))
            })
            .collect()
    }

    /// Remove the given jobs, re-checking under the write lock that each is
    /// still terminal.
    fn remove_terminal(&self, ids: &[JobId]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut jobs = self.write();
        let mut removed = 0;
        for id in ids {
            let terminal = jobs
                .get(id)
                .is_some_and(|handle| lock(handle).status.is_terminal());
            if terminal {
                jobs.remove(id);
                removed += 1;
            }
        }
        removed
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobHandle>> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobHandle>> {
        self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn rank(status: JobStatus) -> u8 {
    match status {
        JobStatus::Queued => 0,
        JobStatus::Running => 1,
        JobStatus::Completed | JobStatus::Failed => 2,
    }
}

fn lock(handle: &JobHandle) -> MutexGuard<'_, Job> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use storycrew_shared::{PipelineResult, SubmitRequest};

    fn job(project: &str, n: u64) -> Job {
        let request = SubmitRequest::new("architect", project, "u1", json!({}));
        let now = Utc::now();
        Job::queued(JobId::derive("architect", project, now, n), &request, now)
    }

    fn complete(registry: &JobRegistry, id: &JobId, at: DateTime<Utc>) {
        registry
            .update_status(id, JobStatus::Running, JobPatch::started(at))
            .unwrap();
        let result = PipelineResult::success("architect", "p1", "story analysis ready");
        registry
            .update_status(id, JobStatus::Completed, JobPatch::completed(result, at))
            .unwrap();
    }

    #[test]
    fn create_and_get() {
        let registry = JobRegistry::new();
        let j = job("p1", 1);
        let id = registry.create(j.clone()).unwrap();
        assert_eq!(registry.get(&id).unwrap(), j);
        assert_eq!(registry.len(), 1);

        let err = registry.create(j).unwrap_err();
        assert!(matches!(err, StoryCrewError::DuplicateId(_)));
    }

    #[test]
    fn discard_only_drops_queued_jobs() {
        let registry = JobRegistry::new();
        let queued = registry.create(job("p1", 1)).unwrap();
        let done = registry.create(job("p1", 2)).unwrap();
        complete(&registry, &done, Utc::now());

        assert!(registry.discard(&queued));
        assert!(!registry.contains(&queued));
        assert!(!registry.discard(&done));
        assert!(registry.contains(&done));
    }

    #[test]
    fn sync_adopts_only_newer_snapshots() {
        let registry = JobRegistry::new();
        let original = job("p1", 1);
        let id = registry.create(original.clone()).unwrap();

        let mut finished = original.clone();
        finished
            .transition(JobStatus::Running, JobPatch::started(Utc::now()))
            .unwrap();
        let running = finished.clone();
        let result = PipelineResult::success("architect", "p1", "story analysis ready");
        finished
            .transition(JobStatus::Completed, JobPatch::completed(result, Utc::now()))
            .unwrap();

        // A stale copy never rolls the entry back.
        assert_eq!(registry.sync(original).unwrap().status, JobStatus::Queued);
        assert_eq!(registry.sync(running.clone()).unwrap(), running);
        let synced = registry.sync(finished.clone()).unwrap();
        assert_eq!(synced, finished);
        assert!(synced.result.unwrap().success);
        assert_eq!(registry.sync(running).unwrap().status, JobStatus::Completed);

        let stranger = job("p2", 2);
        assert!(matches!(registry.sync(stranger), Err(StoryCrewError::NotFound(_))));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        let missing = JobId::from("nope");
        assert!(matches!(registry.get(&missing), Err(StoryCrewError::NotFound(_))));
        assert!(matches!(
            registry.update_status(&missing, JobStatus::Running, JobPatch::default()),
            Err(StoryCrewError::NotFound(_))
        ));
    }

    #[test]
    fn lifecycle_and_terminal_immutability() {
        let registry = JobRegistry::new();
        let id = registry.create(job("p1", 1)).unwrap();

        let running = registry
            .update_status(&id, JobStatus::Running, JobPatch::started(Utc::now()))
            .unwrap();
        assert!(running.started_at.is_some());

        let failed = registry
            .update_status(&id, JobStatus::Failed, JobPatch::failed("boom", Utc::now()))
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));

        let err = registry
            .update_status(&id, JobStatus::Running, JobPatch::default())
            .unwrap_err();
        assert!(matches!(err, StoryCrewError::InvalidTransition { .. }));
        assert_eq!(registry.get(&id).unwrap(), failed);
    }

    #[test]
    fn progress_only_rises_while_running() {
        let registry = JobRegistry::new();
        let id = registry.create(job("p1", 1)).unwrap();

        assert!(registry.report_progress(&id, 10).is_err());

        registry
            .update_status(&id, JobStatus::Running, JobPatch::started(Utc::now()))
            .unwrap();
        assert_eq!(registry.report_progress(&id, 50).unwrap(), 50);
        assert_eq!(registry.report_progress(&id, 20).unwrap(), 50);
        assert_eq!(registry.report_progress(&id, 200).unwrap(), 100);
    }

    #[test]
    fn stats_count_by_status() {
        let registry = JobRegistry::new();
        let ids: Vec<JobId> = (0..4)
            .map(|n| registry.create(job("p1", n)).unwrap())
            .collect();
        registry
            .update_status(&ids[0], JobStatus::Running, JobPatch::started(Utc::now()))
            .unwrap();
        complete(&registry, &ids[1], Utc::now());
        registry
            .update_status(&ids[2], JobStatus::Running, JobPatch::started(Utc::now()))
            .unwrap();
        registry
            .update_status(&ids[2], JobStatus::Failed, JobPatch::failed("x", Utc::now()))
            .unwrap();

        let stats = registry.stats();
        assert_eq!(
            stats,
            RegistryStats {
                active: 1,
                queued: 1,
                completed: 1,
                failed: 1,
                total: 4,
            }
        );
    }

    #[test]
    fn eviction_never_touches_live_jobs() {
        let registry = JobRegistry::new();
        let old = registry.create(job("p1", 1)).unwrap();
        let running = registry.create(job("p1", 2)).unwrap();
        let queued = registry.create(job("p1", 3)).unwrap();

        complete(&registry, &old, Utc::now() - Duration::hours(2));
        registry
            .update_status(&running, JobStatus::Running, JobPatch::started(Utc::now()))
            .unwrap();

        let evicted = registry.evict_terminal(Utc::now() + Duration::hours(1));
        assert_eq!(evicted, 1);
        assert!(!registry.contains(&old));
        assert!(registry.contains(&running));
        assert!(registry.contains(&queued));
    }

    #[test]
    fn cap_evicts_oldest_terminal_first() {
        let registry = JobRegistry::new();
        let base = Utc::now() - Duration::hours(3);
        let ids: Vec<JobId> = (0..5)
            .map(|n| registry.create(job("p1", n)).unwrap())
            .collect();
        complete(&registry, &ids[2], base);
        complete(&registry, &ids[0], base + Duration::minutes(10));
        complete(&registry, &ids[1], base + Duration::minutes(20));

        assert_eq!(registry.evict_oldest_terminal(3), 2);
        assert!(!registry.contains(&ids[2]));
        assert!(!registry.contains(&ids[0]));
        assert!(registry.contains(&ids[1]));

        // Only non-terminal jobs left besides one: the cap cannot be met.
        assert_eq!(registry.evict_oldest_terminal(1), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.evict_oldest_terminal(1), 0);
    }

    #[test]
    fn concurrent_updates_to_distinct_jobs() {
        let registry = Arc::new(JobRegistry::new());
        let ids: Vec<JobId> = (0..32)
            .map(|n| registry.create(job(&format!("p{}", n % 4), n)).unwrap())
            .collect();

        let threads: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .update_status(&id, JobStatus::Running, JobPatch::started(Utc::now()))
                        .unwrap();
                    for p in [10, 40, 30, 90] {
                        registry.report_progress(&id, p).unwrap();
                    }
                    registry
                        .update_status(&id, JobStatus::Failed, JobPatch::failed("done", Utc::now()))
                        .unwrap();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let stats = registry.stats();
        assert_eq!(stats.failed, 32);
        for id in &ids {
            assert_eq!(registry.get(id).unwrap().progress, 90);
        }
    }
}
