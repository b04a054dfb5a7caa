use std::sync::Arc;

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AttemptFailure, OrchestratorResult};
use crate::models::{Job, JobStatus, SharedJob, PROGRESS_RENDERED};
use crate::orchestrator::Orchestrator;
use crate::retry::RetryDecision;
use crate::store::lock_job;
use crate::workflow::build_workflow_now;

/// Applies `change` to the job unless it has been cancelled in the meantime.
/// This is the checkpoint every stage passes through after a suspension point.
fn update_state<F>(job: &SharedJob, cancel: &CancellationToken, change: F) -> Result<(), AttemptFailure>
where
    F: FnOnce(&mut Job) -> OrchestratorResult<()>,
{
    if cancel.is_cancelled() {
        return Err(AttemptFailure::Cancelled);
    }

    let mut job = lock_job(job);
    match change(&mut *job) {
        Ok(()) => Ok(()),
        Err(_) if job.status == JobStatus::Cancelled => Err(AttemptFailure::Cancelled),
        Err(err) => Err(AttemptFailure::Terminal(err.to_string())),
    }
}

/// One pass through upload, submit, poll and download.
async fn run_attempt(
    orchestrator: &Orchestrator,
    id: Uuid,
    job: &SharedJob,
    cancel: &CancellationToken,
) -> Result<(), AttemptFailure> {
    let backend = &orchestrator.backend;
    let config = &orchestrator.config;

    let mut staged = None;
    update_state(job, cancel, |job| {
        job.begin_attempt()?;
        staged = Some((job.source_path.clone(), job.config.clone()));
        Ok(())
    })?;
    let Some((source, workflow_config)) = staged else {
        return Err(AttemptFailure::Terminal("job has no staged input".to_owned()));
    };

    debug!(job_id = %id, source = %source.display(), "uploading input");
    let remote = backend.upload(&source).await?;
    update_state(job, cancel, Job::mark_uploaded)?;

    let workflow = build_workflow_now(&remote, &workflow_config, &config.output_node);
    let handle = backend.submit(&workflow).await?;

    if let Err(failure) = update_state(job, cancel, |job| job.mark_submitted(handle.clone())) {
        // Nobody else knows about this handle yet.
        backend.cancel(&handle).await;
        return Err(failure);
    }
    info!(job_id = %id, handle = %handle, "workflow submitted");

    let progress_job = job.clone();
    let on_progress = move |value: f64| {
        lock_job(&progress_job).advance_progress(value);
    };

    tokio::select! {
        _ = cancel.cancelled() => return Err(AttemptFailure::Cancelled),
        polled = backend.poll_until_done(&handle, config.poll_timeout, config.poll_interval, &on_progress) => polled?,
    }
    update_state(job, cancel, |job| {
        job.advance_progress(PROGRESS_RENDERED);
        Ok(())
    })?;

    let result_path = backend.download(&handle, id).await?;

    if let Err(failure) = update_state(job, cancel, |job| job.complete(result_path.clone())) {
        let _ = fs::remove_file(&result_path).await;
        return Err(failure);
    }

    info!(job_id = %id, result = %result_path.display(), "job completed");
    Ok(())
}

async fn handle_failure(
    orchestrator: &Orchestrator,
    id: Uuid,
    job: &SharedJob,
    cancel: &CancellationToken,
    failure: AttemptFailure,
) {
    let retry_count = lock_job(job).retry_count;

    match orchestrator.retry.decide(&failure, retry_count) {
        RetryDecision::Abandon => {
            info!(job_id = %id, "job cancelled during processing");
            orchestrator.release(id);
        }
        RetryDecision::Fail => {
            error!(job_id = %id, retries = retry_count, "job failed: {failure}");
            let handle = {
                let mut job = lock_job(job);
                match job.fail(failure.to_string()) {
                    Ok(()) => job.backend_handle.clone(),
                    Err(err) => {
                        debug!(job_id = %id, "not marking failed: {err}");
                        None
                    }
                }
            };
            orchestrator.release(id);

            // The record keeps the handle; only the backend render is dropped.
            if let (AttemptFailure::Recoverable(_), Some(handle)) = (&failure, handle) {
                orchestrator.backend.cancel(&handle).await;
            }
        }
        RetryDecision::Retry { attempt, delay } => {
            let stale = match lock_job(job).schedule_retry(failure.to_string()) {
                Ok(stale) => stale,
                Err(err) => {
                    debug!(job_id = %id, "not retrying: {err}");
                    orchestrator.release(id);
                    return;
                }
            };

            warn!(
                job_id = %id,
                attempt,
                delay_secs = delay.as_secs(),
                "attempt failed, retrying: {failure}"
            );

            if let Some(handle) = stale {
                orchestrator.backend.cancel(&handle).await;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(job_id = %id, "retry dropped, job was cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(err) = orchestrator.queue.push(id) {
                        error!(job_id = %id, "cannot requeue: {err}");
                        let _ = lock_job(job).fail(format!("cannot requeue: {err}"));
                        orchestrator.release(id);
                    }
                }
            }
        }
    }
}

async fn process_job(orchestrator: &Orchestrator, worker: usize, id: Uuid) {
    let job = match orchestrator.store.get(id) {
        Ok(job) => job,
        Err(_) => {
            debug!(worker, job_id = %id, "no such job registered, ignoring");
            return;
        }
    };

    let Some(cancel) = orchestrator.cancellation(id) else {
        debug!(worker, job_id = %id, "job no longer live, ignoring");
        return;
    };

    let status = lock_job(&job).status;
    if status != JobStatus::Pending {
        debug!(worker, job_id = %id, %status, "job not pending, ignoring");
        if status.is_terminal() {
            orchestrator.release(id);
        }
        return;
    }

    let outcome = {
        let _active = orchestrator.begin_processing();
        info!(worker, job_id = %id, "processing job");
        run_attempt(orchestrator, id, &job, &cancel).await
    };

    match outcome {
        Ok(()) => {
            orchestrator.release(id);
        }
        Err(failure) => handle_failure(orchestrator, id, &job, &cancel, failure).await,
    }
}

/// Worker loop: takes one job id at a time off the queue until shutdown.
pub async fn run_worker(orchestrator: Arc<Orchestrator>, worker: usize, shutdown: CancellationToken) {
    info!(worker, "worker started");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            id = orchestrator.queue.pop() => id,
        };

        match next {
            Some(id) => process_job(&orchestrator, worker, id).await,
            None => break,
        }
    }

    info!(worker, "worker stopped");
}
