use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{Job, SharedJob};

/// In-memory registry of every job the process knows about.
///
/// The map lock only guards membership; each job carries its own lock so a
/// worker updating one job never blocks readers of another.
#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<Uuid, SharedJob>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Uuid, SharedJob>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put(&self, job: Job) -> OrchestratorResult<SharedJob> {
        let mut jobs = self.map();

        if jobs.contains_key(&job.id) {
            return Err(OrchestratorError::DuplicateId(job.id));
        }

        let id = job.id;
        let shared = Arc::new(Mutex::new(job));
        jobs.insert(id, shared.clone());

        Ok(shared)
    }

    pub fn get(&self, id: Uuid) -> OrchestratorResult<SharedJob> {
        self.map()
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Consistent copies of every job, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let handles: Vec<SharedJob> = self.map().values().cloned().collect();

        let mut jobs: Vec<Job> = handles.iter().map(|job| lock_job(job).clone()).collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn remove(&self, id: Uuid) -> OrchestratorResult<Job> {
        let shared = self.map().remove(&id).ok_or(OrchestratorError::NotFound(id))?;
        let job = lock_job(&shared).clone();
        Ok(job)
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }
}

pub fn lock_job(job: &SharedJob) -> MutexGuard<'_, Job> {
    job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::models::{JobStatus, WorkflowConfig};

    fn job() -> Job {
        Job::new(
            Uuid::new_v4(),
            "in.png",
            PathBuf::from("uploads/in.png"),
            WorkflowConfig::new("prompt", ""),
        )
    }

    #[test]
    fn put_rejects_duplicate_ids() {
        let store = JobStore::new();
        let job = job();

        store.put(job.clone()).unwrap();
        assert!(matches!(
            store.put(job.clone()),
            Err(OrchestratorError::DuplicateId(id)) if id == job.id
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn get_and_remove_unknown_ids() {
        let store = JobStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(store.get(id), Err(OrchestratorError::NotFound(_))));
        assert!(matches!(store.remove(id), Err(OrchestratorError::NotFound(_))));
    }

    #[test]
    fn mutations_are_visible_through_every_handle() {
        let store = JobStore::new();
        let job = job();
        let id = job.id;

        let shared = store.put(job).unwrap();
        lock_job(&shared).begin_attempt().unwrap();

        let seen = store.get(id).unwrap();
        assert_eq!(lock_job(&seen).status, JobStatus::Uploading);
        assert_eq!(store.list()[0].status, JobStatus::Uploading);
    }

    #[test]
    fn list_is_a_snapshot() {
        let store = JobStore::new();
        let shared = store.put(job()).unwrap();

        let snapshot = store.list();
        lock_job(&shared).cancel().unwrap();

        assert_eq!(snapshot[0].status, JobStatus::Pending);
        assert_eq!(store.list()[0].status, JobStatus::Cancelled);
    }

    #[test]
    fn remove_drops_the_record() {
        let store = JobStore::new();
        let job = job();
        let id = job.id;
        store.put(job).unwrap();

        assert_eq!(store.remove(id).unwrap().id, id);
        assert_eq!(store.len(), 0);
    }
}
