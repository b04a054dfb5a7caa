use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::BackendError;
use crate::models::{build_path, PROGRESS_RENDERED, PROGRESS_SUBMITTED};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum RenderState {
    Running,
    Completed,
    Failed(String),
}

/// The operations the orchestrator needs from the rendering backend.
#[async_trait]
pub trait RenderBackend: Send + Sync {
    /// Sends the staged input file and returns the name the backend stored it under.
    async fn upload(&self, path: &Path) -> Result<String, BackendError>;

    /// Queues a job description and returns the backend's handle for it.
    async fn submit(&self, workflow: &Value) -> Result<String, BackendError>;

    /// One completion query.
    async fn render_state(&self, handle: &str) -> Result<RenderState, BackendError>;

    /// Fetches the produced artifact into local storage.
    async fn download(&self, handle: &str, job_id: Uuid) -> Result<PathBuf, BackendError>;

    /// Best-effort; `false` when the backend refused or was unreachable.
    async fn cancel(&self, handle: &str) -> bool;

    /// Queries `render_state` every `interval` until the render completes or
    /// `budget` runs out, reporting progress between 50 and 80 as time passes.
    async fn poll_until_done(
        &self,
        handle: &str,
        budget: Duration,
        interval: Duration,
        on_progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), BackendError> {
        let started = Instant::now();
        let span = PROGRESS_RENDERED - PROGRESS_SUBMITTED;

        while started.elapsed() < budget {
            match self.render_state(handle).await? {
                RenderState::Completed => return Ok(()),
                RenderState::Failed(reason) => return Err(BackendError::Execution(reason)),
                RenderState::Running => {}
            }

            let fraction = started.elapsed().as_secs_f64() / budget.as_secs_f64().max(f64::EPSILON);
            on_progress(PROGRESS_SUBMITTED + (fraction * span).min(span));

            tokio::time::sleep(interval).await;
        }

        Err(BackendError::Timeout {
            handle: handle.to_owned(),
            seconds: budget.as_secs(),
        })
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    name: String,
}

#[derive(Deserialize)]
struct PromptResponse {
    prompt_id: String,
    #[serde(default)]
    number: Option<i64>,
}

#[derive(Deserialize, Default)]
struct HistoryEntry {
    #[serde(default)]
    status: Value,
    #[serde(default)]
    outputs: BTreeMap<String, NodeOutput>,
}

#[derive(Deserialize, Default)]
struct NodeOutput {
    #[serde(default)]
    videos: Vec<Artifact>,
    #[serde(default)]
    gifs: Vec<Artifact>,
    #[serde(default)]
    images: Vec<Artifact>,
}

impl NodeOutput {
    fn first(&self) -> Option<&Artifact> {
        self.videos
            .first()
            .or_else(|| self.gifs.first())
            .or_else(|| self.images.first())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Artifact {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_artifact_type")]
    pub kind: String,
}

fn default_artifact_type() -> String {
    "output".to_owned()
}

/// The backend reports status either as a plain string or as an object with
/// `completed` / `status_str` fields.
fn interpret_status(status: &Value) -> RenderState {
    match status {
        Value::String(s) => match s.as_str() {
            "completed" | "success" => RenderState::Completed,
            "error" | "failed" => RenderState::Failed(format!("backend reported `{s}`")),
            _ => RenderState::Running,
        },
        Value::Object(fields) => {
            let status_str = fields.get("status_str").and_then(Value::as_str);

            if status_str == Some("error") {
                RenderState::Failed("backend reported an execution error".to_owned())
            } else if fields.get("completed").and_then(Value::as_bool) == Some(true) {
                RenderState::Completed
            } else {
                RenderState::Running
            }
        }
        _ => RenderState::Running,
    }
}

fn select_artifact<'a>(
    outputs: &'a BTreeMap<String, NodeOutput>,
    preferred_node: &str,
) -> Option<&'a Artifact> {
    outputs
        .get(preferred_node)
        .and_then(NodeOutput::first)
        .or_else(|| outputs.values().find_map(NodeOutput::first))
}

async fn body_text(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(text) if !text.is_empty() => format!("{status}: {text}"),
        _ => status.to_string(),
    }
}

/// HTTP adapter for a ComfyUI-style rendering server.
pub struct ComfyClient {
    client: Client,
    base_url: String,
    output_dir: PathBuf,
    output_node: String,
}

impl ComfyClient {
    pub fn new(
        base_url: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        output_node: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            output_dir: output_dir.into(),
            output_node: output_node.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn history(&self, handle: &str) -> Result<Option<HistoryEntry>, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("/history/{handle}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            debug!(handle, status = %response.status(), "history not available yet");
            return Ok(None);
        }

        let mut history: HashMap<String, HistoryEntry> = response.json().await?;
        Ok(history.remove(handle))
    }

    async fn stream_to_file(&self, response: Response, path: &Path) -> Result<(), BackendError> {
        let mut file = fs::File::create(path).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }

        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl RenderBackend for ComfyClient {
    async fn upload(&self, path: &Path) -> Result<String, BackendError> {
        let file = fs::File::open(path)
            .await
            .map_err(|e| BackendError::Upload(format!("cannot open {}: {e}", path.display())))?;
        let length = file.metadata().await?.len();

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_owned());

        let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), length)
            .file_name(file_name);

        let form = Form::new()
            .part("image", part)
            .text("overwrite", "true")
            .text("type", "input");

        let response = self
            .client
            .post(self.url("/upload/image"))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::Upload(body_text(response).await));
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Upload(format!("unexpected response: {e}")))?;

        Ok(uploaded.name)
    }

    async fn submit(&self, workflow: &Value) -> Result<String, BackendError> {
        let response = self
            .client
            .post(self.url("/prompt"))
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({ "prompt": workflow }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::Submission(body_text(response).await));
        }

        let queued: PromptResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Submission(format!("unexpected response: {e}")))?;

        debug!(handle = %queued.prompt_id, number = ?queued.number, "workflow queued");

        Ok(queued.prompt_id)
    }

    async fn render_state(&self, handle: &str) -> Result<RenderState, BackendError> {
        Ok(match self.history(handle).await? {
            Some(entry) => interpret_status(&entry.status),
            None => RenderState::Running,
        })
    }

    async fn download(&self, handle: &str, job_id: Uuid) -> Result<PathBuf, BackendError> {
        let entry = self
            .history(handle)
            .await?
            .ok_or_else(|| BackendError::Download(format!("no completion record for {handle}")))?;

        let artifact = select_artifact(&entry.outputs, &self.output_node)
            .cloned()
            .ok_or_else(|| BackendError::Download(format!("no output artifact for {handle}")))?;

        let response = self
            .client
            .get(self.url("/view"))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::Download(body_text(response).await));
        }

        let path = build_path(&self.output_dir, job_id, &artifact.filename);

        if let Err(err) = self.stream_to_file(response, &path).await {
            // A partial artifact must not look like a result.
            let _ = fs::remove_file(&path).await;
            return Err(BackendError::Download(err.to_string()));
        }

        Ok(path)
    }

    async fn cancel(&self, handle: &str) -> bool {
        match self
            .client
            .delete(self.url(&format!("/prompt/{handle}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(handle, status = %response.status(), "backend refused cancellation");
                false
            }
            Err(err) => {
                error!(handle, "backend cancellation failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};

    use super::*;

    #[test]
    fn status_shapes() {
        assert_eq!(interpret_status(&json!("completed")), RenderState::Completed);
        assert_eq!(interpret_status(&json!("queued")), RenderState::Running);
        assert_eq!(
            interpret_status(&json!({"status_str": "success", "completed": true})),
            RenderState::Completed
        );
        assert!(matches!(
            interpret_status(&json!({"status_str": "error", "completed": false})),
            RenderState::Failed(_)
        ));
        assert_eq!(interpret_status(&Value::Null), RenderState::Running);
    }

    #[test]
    fn artifact_prefers_configured_node() {
        let outputs: BTreeMap<String, NodeOutput> = serde_json::from_value(json!({
            "9": { "images": [{ "filename": "preview.png", "subfolder": "", "type": "temp" }] },
            "108": { "videos": [{ "filename": "clip.mp4", "subfolder": "video" }] }
        }))
        .unwrap();

        let chosen = select_artifact(&outputs, "108").unwrap();
        assert_eq!(chosen.filename, "clip.mp4");
        assert_eq!(chosen.kind, "output");

        let fallback = select_artifact(&outputs, "missing").unwrap();
        assert_eq!(fallback.filename, "clip.mp4");

        assert!(select_artifact(&BTreeMap::new(), "108").is_none());
    }

    struct FakeState {
        polls: AtomicUsize,
        cancelled: Mutex<Vec<String>>,
    }

    async fn fake_upload(body: web::Bytes) -> HttpResponse {
        let text = String::from_utf8_lossy(&body);
        if text.contains("name=\"image\"") && text.contains("input") {
            HttpResponse::Ok().json(json!({ "name": "upload_1_cat.png" }))
        } else {
            HttpResponse::BadRequest().body("missing image")
        }
    }

    async fn fake_prompt(body: web::Json<Value>) -> HttpResponse {
        if body.get("prompt").is_some() {
            HttpResponse::Ok().json(json!({ "prompt_id": "p-1", "number": 1 }))
        } else {
            HttpResponse::BadRequest().finish()
        }
    }

    async fn fake_history(path: web::Path<String>, state: web::Data<FakeState>) -> HttpResponse {
        let polls = state.polls.fetch_add(1, Ordering::SeqCst);
        let status = if polls >= 1 { "completed" } else { "running" };

        HttpResponse::Ok().json(json!({
            path.into_inner(): {
                "status": status,
                "outputs": {
                    "108": { "videos": [{ "filename": "ComfyUI_00001.mp4", "subfolder": "video", "type": "output" }] }
                }
            }
        }))
    }

    async fn fake_view(req: HttpRequest) -> HttpResponse {
        if req.query_string().contains("subfolder=video") {
            HttpResponse::Ok().body("video bytes")
        } else {
            HttpResponse::NotFound().finish()
        }
    }

    async fn fake_delete(path: web::Path<String>, state: web::Data<FakeState>) -> HttpResponse {
        let handle = path.into_inner();
        state.cancelled.lock().unwrap().push(handle.clone());
        if handle == "p-1" {
            HttpResponse::Ok().finish()
        } else {
            HttpResponse::NotFound().finish()
        }
    }

    #[actix_web::test]
    async fn talks_to_a_backend_over_http() {
        let state = web::Data::new(FakeState {
            polls: AtomicUsize::new(0),
            cancelled: Mutex::new(vec![]),
        });
        let app_state = state.clone();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .route("/upload/image", web::post().to(fake_upload))
                .route("/prompt", web::post().to(fake_prompt))
                .route("/history/{handle}", web::get().to(fake_history))
                .route("/view", web::get().to(fake_view))
                .route("/prompt/{handle}", web::delete().to(fake_delete))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let running = server.run();
        let handle = running.handle();
        actix_web::rt::spawn(running);

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cat.png");
        std::fs::write(&input, b"png bytes").unwrap();

        let client = ComfyClient::new(format!("http://{addr}/"), dir.path(), "108").unwrap();

        let remote = client.upload(&input).await.unwrap();
        assert_eq!(remote, "upload_1_cat.png");

        let prompt_id = client.submit(&json!({ "3": {} })).await.unwrap();
        assert_eq!(prompt_id, "p-1");

        let ticks = Mutex::new(Vec::new());
        client
            .poll_until_done(
                &prompt_id,
                Duration::from_secs(30),
                Duration::from_millis(10),
                &|p| ticks.lock().unwrap().push(p),
            )
            .await
            .unwrap();
        assert_eq!(state.polls.load(Ordering::SeqCst), 2);
        assert!(ticks.lock().unwrap().iter().all(|p| (50.0..=80.0).contains(p)));

        let job_id = Uuid::new_v4();
        let result = client.download(&prompt_id, job_id).await.unwrap();
        assert_eq!(result, dir.path().join(format!("{job_id}_ComfyUI_00001.mp4")));
        assert_eq!(std::fs::read(&result).unwrap(), b"video bytes");

        assert!(client.cancel("p-1").await);
        assert!(!client.cancel("p-unknown").await);
        assert_eq!(state.cancelled.lock().unwrap().len(), 2);

        handle.stop(false).await;
    }

    #[actix_web::test]
    async fn failures_map_to_stage_errors() {
        let server = HttpServer::new(|| {
            App::new().default_service(web::to(|_body: web::Bytes| async {
                HttpResponse::InternalServerError().body("down")
            }))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let running = server.run();
        let handle = running.handle();
        actix_web::rt::spawn(running);

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("cat.png");
        std::fs::write(&input, b"png").unwrap();
        let client = ComfyClient::new(format!("http://{addr}"), dir.path(), "108").unwrap();

        assert!(matches!(client.upload(&input).await, Err(BackendError::Upload(_))));
        assert!(matches!(
            client.submit(&json!({})).await,
            Err(BackendError::Submission(_))
        ));
        assert!(matches!(
            client.download("p-1", Uuid::new_v4()).await,
            Err(BackendError::Download(_))
        ));
        assert!(matches!(
            client.upload(&dir.path().join("missing.png")).await,
            Err(BackendError::Upload(_))
        ));

        handle.stop(false).await;
    }
}
