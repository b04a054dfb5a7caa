//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use uuid::Uuid;

use crate::backend::{RenderBackend, RenderState};
use crate::error::BackendError;

/// Scripted backend. Renders finish after `polls_to_complete` queries, or
/// report `render_error` on the first one.
pub struct FakeBackend {
    pub output_dir: PathBuf,
    pub fail_uploads: bool,
    pub fail_submits: bool,
    pub fail_downloads: bool,
    pub render_error: Option<String>,
    pub polls_to_complete: Option<usize>,
    pub upload_delay: Duration,
    pub submit_delay: Duration,
    pub download_delay: Duration,
    pub uploads: AtomicUsize,
    pub submits: AtomicUsize,
    pub polls: Mutex<HashMap<String, usize>>,
    pub cancelled: Mutex<Vec<String>>,
    pub log: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            fail_uploads: false,
            fail_submits: false,
            fail_downloads: false,
            render_error: None,
            polls_to_complete: Some(2),
            upload_delay: Duration::ZERO,
            submit_delay: Duration::ZERO,
            download_delay: Duration::ZERO,
            uploads: AtomicUsize::new(0),
            submits: AtomicUsize::new(0),
            polls: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(vec![]),
            log: Mutex::new(vec![]),
        }
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl RenderBackend for FakeBackend {
    async fn upload(&self, path: &Path) -> Result<String, BackendError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.upload_delay).await;
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        self.record(format!("upload {name}"));

        if self.fail_uploads {
            Err(BackendError::Upload("503 Service Unavailable".to_owned()))
        } else {
            Ok(name)
        }
    }

    async fn submit(&self, workflow: &Value) -> Result<String, BackendError> {
        assert!(workflow.get("3").is_some());
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.submit_delay).await;

        if self.fail_submits {
            return Err(BackendError::Submission("400 Bad Request: invalid prompt".to_owned()));
        }
        Ok(format!("p-{n}"))
    }

    async fn render_state(&self, handle: &str) -> Result<RenderState, BackendError> {
        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(handle.to_owned()).or_insert(0);
        *count += 1;

        if let Some(reason) = &self.render_error {
            return Ok(RenderState::Failed(reason.clone()));
        }

        Ok(match self.polls_to_complete {
            Some(needed) if *count >= needed => RenderState::Completed,
            _ => RenderState::Running,
        })
    }

    async fn download(&self, handle: &str, job_id: Uuid) -> Result<PathBuf, BackendError> {
        self.record(format!("download {handle}"));
        tokio::time::sleep(self.download_delay).await;

        if self.fail_downloads {
            return Err(BackendError::Download("404 Not Found".to_owned()));
        }
        let path = self.output_dir.join(format!("{job_id}_out.mp4"));
        fs::write(&path, b"video").await?;
        Ok(path)
    }

    async fn cancel(&self, handle: &str) -> bool {
        self.cancelled.lock().unwrap().push(handle.to_owned());
        false
    }
}
