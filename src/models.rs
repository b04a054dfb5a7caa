use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Uploading,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Uploading,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Uploading => "uploading",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Edges of the job state machine. `Uploading | Processing -> Pending` is
    /// the retry edge; the next attempt restarts the whole pipeline.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) | (_, Cancelled) => true,
            (Pending, Uploading) => true,
            (Uploading, Processing) => true,
            (Processing, Completed) => true,
            (Uploading, Pending) | (Processing, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Mp4,
    Webm,
    Gif,
}

impl VideoFormat {
    pub fn extension(self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "mp4",
            VideoFormat::Webm => "webm",
            VideoFormat::Gif => "gif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            VideoFormat::Mp4 => "video/mp4",
            VideoFormat::Webm => "video/webm",
            VideoFormat::Gif => "image/gif",
        }
    }
}

impl std::str::FromStr for VideoFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(VideoFormat::Mp4),
            "webm" => Ok(VideoFormat::Webm),
            "gif" => Ok(VideoFormat::Gif),
            other => Err(format!("unsupported format `{other}`")),
        }
    }
}

/// Rendering parameters supplied with the job; never changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub randomize_seed: bool,
    pub fps: u32,
    pub duration: u32,
    pub format: VideoFormat,
}

impl WorkflowConfig {
    pub const DEFAULT_SEED: u64 = 88888;
    pub const DEFAULT_FPS: u32 = 16;
    pub const DEFAULT_DURATION: u32 = 5;

    pub fn new(positive_prompt: impl Into<String>, negative_prompt: impl Into<String>) -> Self {
        Self {
            positive_prompt: positive_prompt.into(),
            negative_prompt: negative_prompt.into(),
            seed: Self::DEFAULT_SEED,
            randomize_seed: true,
            fps: Self::DEFAULT_FPS,
            duration: Self::DEFAULT_DURATION,
            format: VideoFormat::Mp4,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.positive_prompt.trim().is_empty() {
            return Err("positive_prompt must not be empty".to_owned());
        }
        if !(1..=60).contains(&self.fps) {
            return Err(format!("fps must be between 1 and 60, got {}", self.fps));
        }
        if !(1..=30).contains(&self.duration) {
            return Err(format!(
                "duration must be between 1 and 30 seconds, got {}",
                self.duration
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub original_filename: String,
    pub source_path: PathBuf,
    pub status: JobStatus,
    pub progress: f64,
    pub config: WorkflowConfig,
    pub backend_handle: Option<String>,
    pub result_path: Option<PathBuf>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

pub type SharedJob = Arc<Mutex<Job>>;

pub const PROGRESS_STARTED: f64 = 10.0;
pub const PROGRESS_UPLOADED: f64 = 30.0;
pub const PROGRESS_SUBMITTED: f64 = 50.0;
pub const PROGRESS_RENDERED: f64 = 80.0;
pub const PROGRESS_DONE: f64 = 100.0;

impl Job {
    pub fn new(
        id: Uuid,
        original_filename: impl Into<String>,
        source_path: PathBuf,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            id,
            original_filename: original_filename.into(),
            source_path,
            status: JobStatus::Pending,
            progress: 0.0,
            config,
            backend_handle: None,
            result_path: None,
            error_detail: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
        }
    }

    fn transition(&mut self, next: JobStatus) -> OrchestratorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidState {
                id: self.id,
                status: self.status,
                requested: next,
            });
        }

        self.status = next;
        Ok(())
    }

    /// Raises progress to `value`; lower values are ignored.
    pub fn advance_progress(&mut self, value: f64) {
        if self.status.is_terminal() {
            return;
        }
        self.progress = self.progress.max(value.clamp(0.0, PROGRESS_DONE));
    }

    pub fn begin_attempt(&mut self) -> OrchestratorResult<()> {
        self.transition(JobStatus::Uploading)?;
        self.started_at.get_or_insert_with(Utc::now);
        self.advance_progress(PROGRESS_STARTED);
        Ok(())
    }

    pub fn mark_uploaded(&mut self) -> OrchestratorResult<()> {
        self.transition(JobStatus::Processing)?;
        self.advance_progress(PROGRESS_UPLOADED);
        Ok(())
    }

    pub fn mark_submitted(&mut self, handle: String) -> OrchestratorResult<()> {
        if self.status != JobStatus::Processing {
            return Err(OrchestratorError::InvalidState {
                id: self.id,
                status: self.status,
                requested: JobStatus::Processing,
            });
        }
        self.backend_handle = Some(handle);
        self.advance_progress(PROGRESS_SUBMITTED);
        Ok(())
    }

    pub fn complete(&mut self, result_path: PathBuf) -> OrchestratorResult<()> {
        self.transition(JobStatus::Completed)?;
        self.progress = PROGRESS_DONE;
        self.result_path = Some(result_path);
        self.error_detail = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, detail: impl Into<String>) -> OrchestratorResult<()> {
        self.transition(JobStatus::Failed)?;
        self.error_detail = Some(detail.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> OrchestratorResult<()> {
        self.transition(JobStatus::Cancelled)
    }

    /// Puts the job back to `Pending` for another attempt and returns the
    /// backend handle of the abandoned attempt, if one was assigned.
    pub fn schedule_retry(&mut self, detail: impl Into<String>) -> OrchestratorResult<Option<String>> {
        self.transition(JobStatus::Pending)?;
        self.retry_count += 1;
        self.error_detail = Some(detail.into());
        Ok(self.backend_handle.take())
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            original_filename: self.original_filename.clone(),
            source_file_path: self.source_path.display().to_string(),
            status: self.status,
            progress: self.progress,
            config: self.config.clone(),
            backend_job_handle: self.backend_handle.clone(),
            result_path: self.result_path.as_ref().map(|p| p.display().to_string()),
            error_detail: self.error_detail.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            retry_count: self.retry_count,
        }
    }
}

/// Serialized projection of a job, as returned by the API.
#[derive(Serialize, Debug, Clone)]
pub struct JobView {
    pub id: Uuid,
    pub original_filename: String,
    pub source_file_path: String,
    pub status: JobStatus,
    pub progress: f64,
    pub config: WorkflowConfig,
    pub backend_job_handle: Option<String>,
    pub result_path: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

fn unsafe_filename_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").unwrap())
}

pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned = unsafe_filename_chars().replace_all(base, "_");
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        "upload".to_owned()
    } else {
        cleaned.to_owned()
    }
}

/// Local files are named after the owning job so the sweeper and operators can
/// trace them back.
pub fn build_path(dir: &Path, id: Uuid, name: &str) -> PathBuf {
    dir.join(format!("{id}_{}", sanitize_filename(name)))
}
