//! Job submission and background execution.
//!
//! `submit` validates a request, registers the job as `queued` and returns
//! its ID at once. Execution happens on a tracked tokio task: directly in
//! immediate mode (bounded by a semaphore), or through worker loops that
//! claim jobs from a [`DurableQueue`] in queued mode.
//!
//! Each pipeline runs in its own task. The supervising task awaits the
//! pipeline's `JoinHandle` and performs the single terminal update, so a
//! panicking pipeline still leaves its job `failed`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, instrument, warn};

use storycrew_services::{ServiceHealth, Services};
use storycrew_shared::{
    DispatcherConfig, ExecutionMode, HealthReport, Job, JobId, JobPatch, JobStatus, JobView,
    PipelineResult, RegistryStats, Result, StoryCrewError, SubmitRequest, SubmitResponse,
};
use storycrew_storage::DurableQueue;

use crate::catalog::{PipelineCatalog, PipelineKind};
use crate::pipeline::{Pipeline, StageExecutor, StageProgress, StageRole};
use crate::registry::JobRegistry;
use crate::retention::RetentionPolicy;

/// How long a worker loop blocks on an empty queue before re-checking for
/// shutdown.
const DEQUEUE_WAIT: Duration = Duration::from_millis(500);

/// Pause after a queue error before a worker loop retries.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Progress reached once every stage has finished; completion sets 100.
const STAGE_PROGRESS_SPAN: usize = 90;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and starts a [`Dispatcher`].
pub struct DispatcherBuilder {
    services: Services,
    executor: Arc<dyn StageExecutor>,
    catalog: PipelineCatalog,
    config: DispatcherConfig,
    retention: Option<RetentionPolicy>,
    queue: Option<Arc<dyn DurableQueue>>,
    worker_loops: Option<usize>,
}

impl DispatcherBuilder {
    pub fn catalog(mut self, catalog: PipelineCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Run a retention sweeper with this policy.
    pub fn retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention = Some(policy);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn DurableQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Worker loops to run in queued mode. Defaults to
    /// `max_concurrent_jobs`; `0` gives a submit-only dispatcher whose jobs
    /// are executed by another process.
    pub fn worker_loops(mut self, loops: usize) -> Self {
        self.worker_loops = Some(loops);
        self
    }

    /// Validate the configuration and spawn background tasks. Must be called
    /// inside a tokio runtime.
    pub fn start(self) -> Result<Dispatcher> {
        if self.config.max_concurrent_jobs == 0 {
            return Err(StoryCrewError::config(
                "dispatcher.max_concurrent_jobs must be at least 1",
            ));
        }
        if self.config.mode == ExecutionMode::Queued && self.queue.is_none() {
            return Err(StoryCrewError::config(
                "queued execution mode requires a durable queue",
            ));
        }

        let inner = Arc::new(Inner {
            registry: Arc::new(JobRegistry::new()),
            catalog: self.catalog,
            services: self.services,
            executor: self.executor,
            queue: self.queue,
            mode: self.config.mode,
            summary_limit: self.config.summary_limit,
            permits: Arc::new(Semaphore::new(self.config.max_concurrent_jobs)),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            sequence: AtomicU64::new(0),
            started: Instant::now(),
        });

        if let Some(policy) = self.retention {
            inner.tracker.spawn(policy.run(
                inner.registry.clone(),
                inner.queue.clone(),
                inner.cancel.clone(),
            ));
        }

        let loops = match (&inner.queue, inner.mode) {
            (Some(queue), ExecutionMode::Queued) => {
                let loops = self
                    .worker_loops
                    .unwrap_or(self.config.max_concurrent_jobs);
                for worker in 0..loops {
                    inner
                        .tracker
                        .spawn(inner.clone().worker_loop(queue.clone(), worker));
                }
                loops
            }
            _ => 0,
        };

        info!(
            mode = %inner.mode,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            worker_loops = loops,
            executor = inner.executor.name(),
            pipelines = ?inner.catalog.names(),
            "dispatcher started"
        );
        Ok(Dispatcher { inner })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Accepts pipeline submissions and runs them in the background.
///
/// Cloning is cheap; clones share the same registry and tasks.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn builder(services: Services, executor: Arc<dyn StageExecutor>) -> DispatcherBuilder {
        DispatcherBuilder {
            services,
            executor,
            catalog: PipelineCatalog::default(),
            config: DispatcherConfig::default(),
            retention: None,
            queue: None,
            worker_loops: None,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.mode
    }

    pub fn catalog(&self) -> &PipelineCatalog {
        &self.inner.catalog
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    /// Register a job and schedule it. Returns as soon as the job is
    /// recorded; validation and unknown pipelines are rejected before any
    /// job exists.
    #[instrument(
        skip_all,
        fields(pipeline = %request.pipeline_type, project_id = %request.project_id)
    )]
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId> {
        request.validate()?;
        let kind = self.inner.catalog.get(&request.pipeline_type)?;
        if self.inner.cancel.is_cancelled() {
            return Err(StoryCrewError::pipeline("dispatcher is shutting down"));
        }

        let now = Utc::now();
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let job_id = JobId::derive(kind.as_str(), &request.project_id, now, sequence);
        let job = Job::queued(job_id.clone(), &request, now);
        self.inner.registry.create(job.clone())?;

        match (self.inner.mode, &self.inner.queue) {
            (ExecutionMode::Queued, Some(queue)) => {
                if let Err(e) = queue.enqueue(&job).await {
                    self.inner.registry.discard(&job_id);
                    return Err(e);
                }
                info!(job_id = %job_id, "job enqueued");
            }
            _ => {
                let inner = self.inner.clone();
                let permits = self.inner.permits.clone();
                self.inner.tracker.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    inner.run_job(job, Ok(kind), false).await;
                });
                info!(job_id = %job_id, "job scheduled");
            }
        }
        Ok(job_id)
    }

    /// [`submit`](Self::submit), mapped to the wire response shape.
    pub async fn submit_response(&self, request: SubmitRequest) -> SubmitResponse {
        let pipeline_type = request.pipeline_type.clone();
        match self.submit(request).await {
            Ok(job_id) => SubmitResponse::accepted(&job_id, &pipeline_type),
            Err(e) => {
                debug!(error = %e, "submission rejected");
                SubmitResponse::rejected(&e)
            }
        }
    }

    /// Current view of a job. With a durable queue, unfinished jobs are
    /// checked against the queue's copy, which is where another process
    /// records claiming and finishing them. Jobs this process never saw are
    /// read from the queue alone.
    pub async fn get_status(&self, job_id: &JobId) -> Result<JobView> {
        let local = match self.inner.registry.get(job_id) {
            Ok(job) => job,
            Err(StoryCrewError::NotFound(_)) => {
                let Some(queue) = &self.inner.queue else {
                    return Err(StoryCrewError::NotFound(job_id.to_string()));
                };
                return queue
                    .get_status(job_id.as_str())
                    .await?
                    .map(|job| job.view())
                    .ok_or_else(|| StoryCrewError::NotFound(job_id.to_string()));
            }
            Err(e) => return Err(e),
        };

        let Some(queue) = self.inner.queue.as_ref().filter(|_| !local.status.is_terminal())
        else {
            return Ok(local.view());
        };
        match queue.get_status(job_id.as_str()).await {
            Ok(Some(snapshot)) => Ok(self.inner.registry.sync(snapshot).unwrap_or(local).view()),
            Ok(None) => Ok(local.view()),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "queue unreadable, serving local status");
                Ok(local.view())
            }
        }
    }

    /// Poll [`get_status`](Self::get_status) until the job is terminal.
    pub async fn wait_for(&self, job_id: &JobId, poll_interval: Duration) -> Result<JobView> {
        loop {
            let view = self.get_status(job_id).await?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub fn stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    /// Liveness only; never touches collaborators.
    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy".into(),
            service: "storycrew".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            uptime_secs: self.inner.started.elapsed().as_secs(),
        }
    }

    /// Health-check every external collaborator.
    pub async fn check_services(&self) -> ServiceHealth {
        self.inner.services.health().await
    }

    /// Stop worker loops and the retention sweeper, then wait for in-flight
    /// jobs. Running jobs are not cancelled.
    pub async fn shutdown(&self) {
        info!("dispatcher shutting down");
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("dispatcher stopped");
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

struct Inner {
    registry: Arc<JobRegistry>,
    catalog: PipelineCatalog,
    services: Services,
    executor: Arc<dyn StageExecutor>,
    queue: Option<Arc<dyn DurableQueue>>,
    mode: ExecutionMode,
    summary_limit: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    sequence: AtomicU64,
    started: Instant,
}

impl Inner {
    async fn worker_loop(self: Arc<Self>, queue: Arc<dyn DurableQueue>, worker: usize) {
        debug!(worker, "queue worker started");
        while !self.cancel.is_cancelled() {
            match queue.dequeue(DEQUEUE_WAIT).await {
                Ok(Some(job)) => {
                    let kind = self.catalog.get(&job.pipeline_type);
                    self.clone().run_job(job, kind, true).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker, error = %e, "dequeue failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        debug!(worker, "queue worker stopped");
    }

    /// Drive one job from `queued` to a terminal state.
    #[instrument(skip_all, fields(job_id = %job.id, pipeline = %job.pipeline_type))]
    async fn run_job(self: Arc<Self>, job: Job, kind: Result<PipelineKind>, from_queue: bool) {
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        if let Err(e) = self.mark_running(&job, started_at) {
            error!(error = %e, "could not mark job running");
            return;
        }
        info!("job started");

        let outcome = match kind {
            Ok(kind) => self.supervise(&job, kind).await.map(|result| (kind, result)),
            Err(e) => Err(e.to_string()),
        };

        let now = Utc::now();
        let (status, patch) = match &outcome {
            Ok((_, result)) => (JobStatus::Completed, JobPatch::completed(result.clone(), now)),
            Err(message) => (JobStatus::Failed, JobPatch::failed(message.clone(), now)),
        };
        if let Err(e) = self.registry.update_status(&job.id, status, patch.clone()) {
            error!(error = %e, "could not record job outcome");
        }
        if from_queue {
            self.mirror(&job.id, status, patch).await;
        }

        let elapsed_ms = (now - started_at).num_milliseconds();
        match outcome {
            Ok((kind, result)) => {
                info!(elapsed_ms, "job completed");
                self.publish(&job, kind, &result).await;
            }
            Err(message) => warn!(elapsed_ms, error = %message, "job failed"),
        }
    }

    fn mark_running(&self, job: &Job, at: DateTime<Utc>) -> Result<()> {
        if self.registry.contains(&job.id) {
            return match self
                .registry
                .update_status(&job.id, JobStatus::Running, JobPatch::started(at))
            {
                // A status read already synced the claim from the queue.
                Err(StoryCrewError::InvalidTransition { from: JobStatus::Running, .. }) => Ok(()),
                other => other.map(|_| ()),
            };
        }
        // Claimed from a queue filled by another process.
        let mut adopted = job.clone();
        if adopted.status == JobStatus::Queued {
            adopted.transition(JobStatus::Running, JobPatch::started(at))?;
        }
        self.registry.create(adopted)?;
        Ok(())
    }

    /// Run the pipeline on its own task and turn every way it can end into
    /// a result or an error message.
    async fn supervise(
        &self,
        job: &Job,
        kind: PipelineKind,
    ) -> std::result::Result<PipelineResult, String> {
        let pipeline = Pipeline::build(
            kind,
            job.project_id.as_str(),
            job.user_id.as_str(),
            job.config.clone(),
            self.services.clone(),
            self.executor.clone(),
        )
        .with_summary_limit(self.summary_limit);
        let progress = RegistryProgress {
            registry: self.registry.clone(),
            job_id: job.id.clone(),
        };
        let input = job.input_data.clone();

        let handle = tokio::spawn(
            async move { pipeline.execute(&input, &progress).await }.in_current_span(),
        );
        match handle.await {
            Ok(Ok(result)) if result.success => Ok(result),
            Ok(Ok(result)) => Err(result
                .error
                .unwrap_or_else(|| "pipeline reported failure".into())),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(StoryCrewError::pipeline(join_failure(e)).to_string()),
        }
    }

    async fn mirror(&self, job_id: &JobId, status: JobStatus, patch: JobPatch) {
        let Some(queue) = &self.queue else {
            return;
        };
        if let Err(e) = queue.update_status(job_id.as_str(), status, patch).await {
            warn!(error = %e, "could not mirror job outcome to queue");
        }
    }

    /// Send a completed result to the content service. Failures are logged
    /// and never change the job.
    async fn publish(&self, job: &Job, kind: PipelineKind, result: &PipelineResult) {
        let content = &self.services.content;
        let payload = match serde_json::to_value(result) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "could not encode result for publishing");
                return;
            }
        };
        if let Err(e) = content
            .save_results(&job.project_id, kind.as_str(), &payload)
            .await
        {
            warn!(error = %e, "could not save results");
        }
        let extra = json!({ "lastJob": job.id, "lastPipeline": kind.as_str() });
        if let Err(e) = content
            .update_status(&job.project_id, kind.completion_step(), &extra)
            .await
        {
            warn!(error = %e, "could not record workflow step");
        }
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return "pipeline task was cancelled".into();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    format!("pipeline task panicked: {message}")
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Reports stage completion as job progress.
struct RegistryProgress {
    registry: Arc<JobRegistry>,
    job_id: JobId,
}

impl StageProgress for RegistryProgress {
    fn stage_started(&self, role: StageRole, index: usize, total: usize) {
        debug!(job_id = %self.job_id, %role, index, total, "stage started");
    }

    fn stage_finished(&self, role: StageRole, index: usize, total: usize) {
        let progress = stage_progress(index, total);
        match self.registry.report_progress(&self.job_id, progress) {
            Ok(now) => debug!(job_id = %self.job_id, %role, progress = now, "stage finished"),
            Err(e) => debug!(job_id = %self.job_id, error = %e, "progress not recorded"),
        }
    }
}

fn stage_progress(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((index + 1) * STAGE_PROGRESS_SPAN / total).min(STAGE_PROGRESS_SPAN) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;
    use storycrew_services::{
        ContentService, OfflineContent, OfflineKnowledgeGraph, PathRagClient, PayloadClient,
    };
    use storycrew_shared::AdapterSettings;
    use storycrew_storage::{LibsqlQueue, MemoryQueue};
    use uuid::Uuid;
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    use crate::pipeline::{OfflineExecutor, StageRequest};

    const POLL: Duration = Duration::from_millis(5);

    fn offline() -> Dispatcher {
        Dispatcher::builder(Services::offline(), Arc::new(OfflineExecutor))
            .start()
            .unwrap()
    }

    fn architect(project: &str) -> SubmitRequest {
        SubmitRequest::new(
            "architect",
            project,
            "u1",
            json!({"story_text": "Sarah meets Marcus at the Lighthouse."}),
        )
    }

    async fn wait(dispatcher: &Dispatcher, id: &JobId) -> JobView {
        tokio::time::timeout(Duration::from_secs(10), dispatcher.wait_for(id, POLL))
            .await
            .expect("job did not finish in time")
            .unwrap()
    }

    struct Panicking;

    #[async_trait]
    impl StageExecutor for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn execute(&self, _request: &StageRequest) -> Result<String> {
            panic!("stage worker blew up");
        }
    }

    /// Holds every stage until released, to observe the running state.
    struct Gate(tokio::sync::Semaphore);

    #[async_trait]
    impl StageExecutor for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn execute(&self, request: &StageRequest) -> Result<String> {
            let _permit = self
                .0
                .acquire()
                .await
                .map_err(|e| StoryCrewError::pipeline(e.to_string()))?;
            Ok(format!("{} done", request.role))
        }
    }

    /// Content service that records publishes and refuses writes.
    #[derive(Default)]
    struct RecordingContent {
        writes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContentService for RecordingContent {
        async fn get_project_data(&self, project_id: &str) -> Result<Value> {
            Ok(json!({ "id": project_id }))
        }

        async fn get_story_data(&self, _project_id: &str) -> Result<Value> {
            Ok(json!({ "current_content": "" }))
        }

        async fn update_status(&self, _p: &str, step: &str, _extra: &Value) -> Result<Value> {
            self.writes.lock().unwrap().push(format!("status:{step}"));
            Err(StoryCrewError::pipeline("content service refused the write"))
        }

        async fn save_results(&self, _p: &str, pipeline_type: &str, _r: &Value) -> Result<Value> {
            self.writes.lock().unwrap().push(format!("results:{pipeline_type}"));
            Err(StoryCrewError::pipeline("content service refused the write"))
        }

        async fn get_user_preferences(&self, _user_id: &str) -> Result<Value> {
            Ok(json!({}))
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn architect_job_completes() {
        let dispatcher = offline();
        let id = dispatcher.submit(architect("p1")).await.unwrap();
        assert!(id.as_str().starts_with("architect_p1_"));

        let view = wait(&dispatcher, &id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100);
        assert!(view.error.is_none());
        let result = view.result.unwrap();
        assert_eq!(result.phase, "architect");
        assert_eq!(result.next_phase.as_deref(), Some("director"));
        assert!(view.started_at.is_some() && view.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_status_is_stable() {
        let dispatcher = offline();
        let id = dispatcher
            .submit(SubmitRequest::new("director", "p2", "u1", json!({})))
            .await
            .unwrap();
        let first = wait(&dispatcher, &id).await;
        let again = dispatcher.get_status(&id).await.unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&again).unwrap()
        );
    }

    #[tokio::test]
    async fn unknown_pipeline_is_rejected_without_a_job() {
        let dispatcher = offline();
        let err = dispatcher
            .submit(SubmitRequest::new("unknown", "p1", "u1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoryCrewError::UnknownPipeline(_)));
        assert_eq!(dispatcher.stats().total, 0);

        let response = dispatcher
            .submit_response(SubmitRequest::new("architect", "  ", "u1", json!({})))
            .await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("project_id"));
        assert_eq!(dispatcher.stats().total, 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dispatcher = offline();
        let err = dispatcher
            .get_status(&JobId::from("architect_nope_0_0"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoryCrewError::NotFound(_)));
        assert_eq!(dispatcher.stats().total, 0);
    }

    #[tokio::test]
    async fn status_moves_queued_running_completed() {
        let gate = Arc::new(Gate(tokio::sync::Semaphore::new(0)));
        let dispatcher = Dispatcher::builder(Services::offline(), gate.clone())
            .start()
            .unwrap();
        let id = dispatcher.submit(architect("p1")).await.unwrap();

        let mut seen = vec![dispatcher.get_status(&id).await.unwrap().status];
        while seen.last() != Some(&JobStatus::Running) {
            tokio::time::sleep(POLL).await;
            seen.push(dispatcher.get_status(&id).await.unwrap().status);
        }
        assert_eq!(dispatcher.stats().active, 1);

        gate.0.add_permits(2);
        seen.push(wait(&dispatcher, &id).await.status);
        seen.dedup();
        // The job may already be running by the first poll.
        let expected: &[JobStatus] = if seen.len() == 3 {
            &[JobStatus::Queued, JobStatus::Running, JobStatus::Completed]
        } else {
            &[JobStatus::Running, JobStatus::Completed]
        };
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn concurrent_submissions_across_projects() {
        let dispatcher = Dispatcher::builder(Services::offline(), Arc::new(OfflineExecutor))
            .config(DispatcherConfig {
                max_concurrent_jobs: 8,
                ..DispatcherConfig::default()
            })
            .start()
            .unwrap();

        let submissions = (0..50).map(|n| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let kind = if n % 2 == 0 { "architect" } else { "director" };
                let project = format!("p{}", n % 5);
                dispatcher
                    .submit(SubmitRequest::new(kind, project, "u1", json!({})))
                    .await
                    .unwrap()
            })
        });
        let mut ids = Vec::new();
        for handle in submissions {
            ids.push(handle.await.unwrap());
        }
        let unique: HashSet<_> = ids.iter().cloned().collect();
        assert_eq!(unique.len(), 50);

        for id in &ids {
            assert!(wait(&dispatcher, id).await.status.is_terminal());
        }
        let stats = dispatcher.stats();
        assert_eq!(stats.total, 50);
        assert_eq!(stats.completed + stats.failed, 50);
        assert_eq!(stats.active + stats.queued, 0);
    }

    #[tokio::test]
    async fn panicking_pipeline_fails_the_job() {
        let dispatcher = Dispatcher::builder(Services::offline(), Arc::new(Panicking))
            .start()
            .unwrap();
        let id = dispatcher.submit(architect("p1")).await.unwrap();

        let view = wait(&dispatcher, &id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.result.is_none());
        let error = view.error.unwrap();
        assert!(error.contains("panicked"), "{error}");
        assert!(error.contains("stage worker blew up"), "{error}");

        // The dispatcher keeps serving after a panic.
        assert_eq!(dispatcher.health().status, "healthy");
    }

    fn degraded_settings(base_url: String) -> AdapterSettings {
        AdapterSettings {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            degraded_mode: true,
            ..AdapterSettings::new(base_url)
        }
    }

    async fn remote_services(graph: &MockServer, content: &MockServer) -> Services {
        Services::new(
            Arc::new(PathRagClient::new(&degraded_settings(graph.uri())).unwrap()),
            Arc::new(PayloadClient::new(&degraded_settings(content.uri())).unwrap()),
        )
    }

    /// Requests `server` saw for one method and path.
    async fn hits(server: &MockServer, verb: &str, route: &str) -> Vec<Request> {
        server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == verb && r.url.path() == route)
            .collect()
    }

    #[tokio::test]
    async fn unreachable_services_degrade_and_complete() {
        let graph = MockServer::start().await;
        let content = MockServer::start().await;
        for server in [&graph, &content] {
            Mock::given(any())
                .respond_with(ResponseTemplate::new(500))
                .mount(server)
                .await;
        }

        let dispatcher = Dispatcher::builder(
            remote_services(&graph, &content).await,
            Arc::new(OfflineExecutor),
        )
        .start()
        .unwrap();
        let id = dispatcher.submit(architect("p1")).await.unwrap();
        let view = wait(&dispatcher, &id).await;
        assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error);
        // Publishing runs after the terminal update; let it finish.
        dispatcher.shutdown().await;

        // Every remote call used exactly the three-attempt budget.
        assert_eq!(hits(&content, "GET", "/api/projects/p1").await.len(), 3);
        assert_eq!(hits(&content, "GET", "/api/stories").await.len(), 3);
        assert_eq!(hits(&content, "GET", "/api/users/u1").await.len(), 3);
        assert_eq!(hits(&graph, "POST", "/api/v1/graphs").await.len(), 3);
        // knowledge_graph_complete, then story_analysis_complete.
        assert_eq!(hits(&content, "PATCH", "/api/projects/p1").await.len(), 6);
        assert_eq!(hits(&content, "POST", "/api/crew-results").await.len(), 3);
        assert_eq!(content.received_requests().await.unwrap().len(), 18);
        assert_eq!(graph.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unreachable_graph_alone_degrades_graph_output() {
        let graph = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .mount(&graph)
            .await;

        let content = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "p1"})))
            .mount(&content)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/stories"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "docs": [{"id": "s1", "current_content": "Sarah meets Marcus."}]
            })))
            .mount(&content)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/users/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "preferences": {"preferred_tone": "dark"}
            })))
            .mount(&content)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/projects/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "p1"})))
            .mount(&content)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/crew-results"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "r1"})))
            .mount(&content)
            .await;

        let dispatcher = Dispatcher::builder(
            remote_services(&graph, &content).await,
            Arc::new(OfflineExecutor),
        )
        .start()
        .unwrap();
        let id = dispatcher.submit(architect("p1")).await.unwrap();
        let view = wait(&dispatcher, &id).await;
        assert_eq!(view.status, JobStatus::Completed, "{:?}", view.error);
        dispatcher.shutdown().await;

        assert_eq!(hits(&graph, "POST", "/api/v1/graphs").await.len(), 3);

        // Content calls all succeeded on the first attempt.
        assert_eq!(hits(&content, "GET", "/api/projects/p1").await.len(), 1);
        assert_eq!(hits(&content, "GET", "/api/stories").await.len(), 1);
        assert_eq!(hits(&content, "GET", "/api/users/u1").await.len(), 1);
        assert_eq!(hits(&content, "POST", "/api/crew-results").await.len(), 1);
        let patches = hits(&content, "PATCH", "/api/projects/p1").await;
        assert_eq!(patches.len(), 2);

        // The recorded graph step carries the fallback receipt.
        let graph_step: Value = serde_json::from_slice(&patches[0].body).unwrap();
        assert_eq!(graph_step["workflowStatus"]["currentStep"], "knowledge_graph_complete");
        assert_eq!(graph_step["knowledgeGraph"]["degraded"], true);
        assert_eq!(graph_step["knowledgeGraph"]["graphId"], "fallback_graph_p1");
        let final_step: Value = serde_json::from_slice(&patches[1].body).unwrap();
        assert_eq!(final_step["workflowStatus"]["currentStep"], "story_analysis_complete");
    }

    #[tokio::test]
    async fn strict_services_fail_the_job() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let settings = AdapterSettings {
            max_attempts: 2,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            degraded_mode: false,
            ..AdapterSettings::new(server.uri())
        };
        let services = Services::new(
            Arc::new(PathRagClient::new(&settings).unwrap()),
            Arc::new(OfflineContent),
        );
        let dispatcher = Dispatcher::builder(services, Arc::new(OfflineExecutor))
            .start()
            .unwrap();
        let id = dispatcher.submit(architect("p1")).await.unwrap();

        let view = wait(&dispatcher, &id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error.unwrap().contains("knowledge_graph unavailable after 2 attempt(s)"));
    }

    #[tokio::test]
    async fn publish_failures_do_not_fail_the_job() {
        let content = Arc::new(RecordingContent::default());
        let services = Services::new(Arc::new(OfflineKnowledgeGraph), content.clone());
        let dispatcher = Dispatcher::builder(services, Arc::new(OfflineExecutor))
            .start()
            .unwrap();
        let id = dispatcher
            .submit(SubmitRequest::new("director", "p3", "u1", json!({})))
            .await
            .unwrap();
        assert_eq!(wait(&dispatcher, &id).await.status, JobStatus::Completed);

        dispatcher.shutdown().await;
        let writes = content.writes.lock().unwrap();
        assert!(writes.contains(&"results:director".to_string()));
        assert!(writes.contains(&"status:scene_breakdown_complete".to_string()));
    }

    #[tokio::test]
    async fn queued_mode_runs_jobs_from_the_queue() {
        let queue = Arc::new(MemoryQueue::new());
        let dispatcher = Dispatcher::builder(Services::offline(), Arc::new(OfflineExecutor))
            .config(DispatcherConfig {
                mode: ExecutionMode::Queued,
                max_concurrent_jobs: 2,
                ..DispatcherConfig::default()
            })
            .queue(queue.clone())
            .start()
            .unwrap();

        let ids = [
            dispatcher.submit(architect("p1")).await.unwrap(),
            dispatcher.submit(architect("p2")).await.unwrap(),
            dispatcher.submit(architect("p3")).await.unwrap(),
        ];
        for id in &ids {
            assert_eq!(wait(&dispatcher, id).await.status, JobStatus::Completed);
            let stored = queue.get_status(id.as_str()).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Completed);
        }
        assert_eq!(queue.pending().await.unwrap(), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn queued_mode_requires_a_queue() {
        let err = Dispatcher::builder(Services::offline(), Arc::new(OfflineExecutor))
            .config(DispatcherConfig {
                mode: ExecutionMode::Queued,
                ..DispatcherConfig::default()
            })
            .start()
            .err()
            .unwrap();
        assert!(matches!(err, StoryCrewError::Config { .. }));
    }

    #[tokio::test]
    async fn separate_submitter_and_worker_share_a_database() {
        let path = std::env::temp_dir().join(format!("sc_dispatch_{}.db", Uuid::now_v7()));
        let queued = DispatcherConfig {
            mode: ExecutionMode::Queued,
            max_concurrent_jobs: 1,
            ..DispatcherConfig::default()
        };

        let submit_queue = Arc::new(LibsqlQueue::open(&path).await.unwrap());
        let submitter = Dispatcher::builder(Services::offline(), Arc::new(OfflineExecutor))
            .config(queued.clone())
            .queue(submit_queue)
            .worker_loops(0)
            .start()
            .unwrap();
        let id = submitter.submit(architect("p9")).await.unwrap();

        let worker_queue = Arc::new(
            LibsqlQueue::open(&path)
                .await
                .unwrap()
                .with_poll_interval(Duration::from_millis(10)),
        );
        let worker = Dispatcher::builder(Services::offline(), Arc::new(OfflineExecutor))
            .config(queued)
            .queue(worker_queue)
            .start()
            .unwrap();

        // The worker process only learns about the job from the queue.
        let view = wait(&worker, &id).await;
        assert_eq!(view.status, JobStatus::Completed);
        worker.shutdown().await;

        // The submitter reports where the job actually is and keeps that.
        let seen = submitter.get_status(&id).await.unwrap();
        assert_eq!(seen.status, JobStatus::Completed);
        assert!(seen.result.unwrap().success);
        let stored = submitter.registry().get(&id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(submitter.stats().completed, 1);

        // Once finished here, the entry is eligible for retention.
        let policy = RetentionPolicy {
            ttl: Duration::ZERO,
            ..RetentionPolicy::default()
        };
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(policy.sweep(submitter.registry(), later), 1);

        submitter.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn status_falls_back_to_queue() {
        let queue = Arc::new(MemoryQueue::new());
        let request = architect("p4");
        let now = Utc::now();
        let job = Job::queued(JobId::derive("architect", "p4", now, 99), &request, now);
        queue.enqueue(&job).await.unwrap();

        let dispatcher = Dispatcher::builder(Services::offline(), Arc::new(OfflineExecutor))
            .queue(queue)
            .start()
            .unwrap();
        let view = dispatcher.get_status(&job.id).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(dispatcher.stats().total, 0);
    }

    #[tokio::test]
    async fn submissions_after_shutdown_are_refused() {
        let dispatcher = offline();
        dispatcher.shutdown().await;
        let err = dispatcher.submit(architect("p1")).await.unwrap_err();
        assert!(err.to_string().contains("shutting down"));
    }

    #[tokio::test]
    async fn health_has_no_side_effects() {
        let dispatcher = offline();
        let report = dispatcher.health();
        assert_eq!(report.service, "storycrew");
        assert_eq!(report.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(dispatcher.stats().total, 0);
        assert!(dispatcher.check_services().await.all_healthy());
    }

    #[test]
    fn stage_progress_spans_to_ninety() {
        assert_eq!(stage_progress(0, 2), 45);
        assert_eq!(stage_progress(1, 2), 90);
        assert_eq!(stage_progress(0, 0), 0);
        assert_eq!(stage_progress(5, 2), 90);
    }
}
