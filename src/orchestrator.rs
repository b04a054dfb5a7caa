use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::RenderBackend;
use crate::config::Config;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{build_path, Job, JobStatus, JobView, WorkflowConfig};
use crate::processor::run_worker;
use crate::queue::JobQueue;
use crate::retry::RetryPolicy;
use crate::store::{lock_job, JobStore};
use crate::supervisor::supervise;
use crate::sweeper::RetentionSweeper;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Stats {
    pub total_jobs: usize,
    pub status_counts: BTreeMap<&'static str, usize>,
    pub queue_size: usize,
    pub processing_tasks: usize,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub path: PathBuf,
    pub download_name: String,
    pub mime_type: &'static str,
}

/// Owns every piece of job state. Built once at startup and shared by `Arc`
/// with the route handlers and the background tasks.
pub struct Orchestrator {
    pub(crate) config: Arc<Config>,
    pub(crate) store: JobStore,
    pub(crate) queue: JobQueue,
    pub(crate) backend: Arc<dyn RenderBackend>,
    pub(crate) retry: RetryPolicy,
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
    active: AtomicUsize,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, backend: Arc<dyn RenderBackend>) -> Self {
        let retry = RetryPolicy::new(config.max_retries, config.retry_delay);

        Self {
            config,
            store: JobStore::new(),
            queue: JobQueue::new(),
            backend,
            retry,
            cancellations: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn prepare_dirs(&self) -> OrchestratorResult<()> {
        fs::create_dir_all(&self.config.upload_dir).await?;
        fs::create_dir_all(&self.config.output_dir).await?;
        Ok(())
    }

    /// Spawns the worker pool and, when enabled, the retention sweeper. Each
    /// runs under its own supervisor.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        for worker in 1..=self.config.max_concurrent_jobs {
            let orchestrator = self.clone();
            let shutdown = self.shutdown.clone();

            tasks.push(tokio::spawn(supervise(
                format!("worker-{worker}"),
                self.shutdown.clone(),
                move || run_worker(orchestrator.clone(), worker, shutdown.clone()),
            )));
        }

        if self.config.cleanup_enabled {
            let sweeper = Arc::new(RetentionSweeper::new(
                vec![self.config.upload_dir.clone(), self.config.output_dir.clone()],
                self.config.retention,
                self.config.sweep_interval,
            ));
            let shutdown = self.shutdown.clone();

            tasks.push(tokio::spawn(supervise(
                "retention-sweeper".to_owned(),
                self.shutdown.clone(),
                move || {
                    let sweeper = sweeper.clone();
                    let shutdown = shutdown.clone();
                    async move { sweeper.run(shutdown).await }
                },
            )));
        }

        info!(
            workers = self.config.max_concurrent_jobs,
            cleanup = self.config.cleanup_enabled,
            "orchestrator started"
        );

        tasks
    }

    pub fn shutdown(&self) {
        info!(jobs = self.store.len(), "orchestrator shutting down");
        if !self.queue.is_empty() {
            warn!(queued = self.queue.len(), "queued jobs are dropped on shutdown");
        }
        self.shutdown.cancel();
    }

    /// Stages the uploaded file, registers the job and queues it.
    pub async fn create_job(
        &self,
        original_filename: &str,
        content: &[u8],
        config: WorkflowConfig,
    ) -> OrchestratorResult<Uuid> {
        config.validate().map_err(OrchestratorError::InvalidConfig)?;

        let id = Uuid::new_v4();
        let path = build_path(&self.config.upload_dir, id, original_filename);
        fs::write(&path, content).await?;

        let job = Job::new(id, original_filename, path.clone(), config);
        if let Err(err) = self.store.put(job) {
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }

        self.cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, CancellationToken::new());

        if let Err(err) = self.queue.push(id) {
            self.release(id);
            let _ = self.store.remove(id);
            let _ = fs::remove_file(&path).await;
            return Err(err);
        }

        info!(job_id = %id, file = original_filename, bytes = content.len(), "job created");
        Ok(id)
    }

    pub fn get_job(&self, id: Uuid) -> OrchestratorResult<JobView> {
        let job = self.store.get(id)?;
        let view = lock_job(&job).view();
        Ok(view)
    }

    pub fn list_jobs(&self) -> Vec<JobView> {
        self.store.list().iter().map(Job::view).collect()
    }

    /// Marks the job cancelled right away, stops its worker at the next
    /// checkpoint and asks the backend to drop the render.
    pub async fn cancel_job(&self, id: Uuid) -> OrchestratorResult<()> {
        let job = self.store.get(id)?;

        let handle = {
            let mut job = lock_job(&job);
            job.cancel()?;
            job.backend_handle.clone()
        };

        if let Some(token) = self.release(id) {
            token.cancel();
        }

        info!(job_id = %id, "job cancelled");

        if let Some(handle) = handle {
            if !self.backend.cancel(&handle).await {
                warn!(job_id = %id, handle = %handle, "backend did not confirm cancellation");
            }
        }

        Ok(())
    }

    pub fn result(&self, id: Uuid) -> OrchestratorResult<JobResult> {
        let job = self.store.get(id)?;
        let job = lock_job(&job);

        match (&job.status, &job.result_path) {
            (JobStatus::Completed, Some(path)) => Ok(JobResult {
                path: path.clone(),
                download_name: format!(
                    "result_{}.{}",
                    job.original_filename,
                    job.config.format.extension()
                ),
                mime_type: job.config.format.mime_type(),
            }),
            _ => Err(OrchestratorError::ResultUnavailable {
                id,
                status: job.status,
            }),
        }
    }

    pub fn stats(&self) -> Stats {
        let jobs = self.store.list();

        let mut status_counts: BTreeMap<&'static str, usize> =
            JobStatus::ALL.iter().map(|status| (status.as_str(), 0)).collect();
        for job in &jobs {
            *status_counts.entry(job.status.as_str()).or_insert(0) += 1;
        }

        Stats {
            total_jobs: jobs.len(),
            status_counts,
            queue_size: self.queue.len(),
            processing_tasks: self.active.load(Ordering::SeqCst),
        }
    }

    pub fn backend_url(&self) -> &str {
        &self.config.backend_url
    }

    /// The cancellation token of a live job; `None` once the job is terminal.
    pub(crate) fn cancellation(&self, id: Uuid) -> Option<CancellationToken> {
        self.cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    /// Forgets the job's token once it can no longer be cancelled.
    pub(crate) fn release(&self, id: Uuid) -> Option<CancellationToken> {
        let token = self
            .cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        if token.is_some() {
            debug!(job_id = %id, "cancellation token released");
        }
        token
    }

    pub(crate) fn begin_processing(&self) -> ActiveGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            active: &self.active,
        }
    }
}

/// Counts a job as in active processing for as long as it is held.
pub(crate) struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
