use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use actix_multipart::Multipart;
use actix_web::http::header::{
    Charset, ContentDisposition, DispositionParam, DispositionType, ExtendedValue,
};
use actix_web::{
    delete, get, http::StatusCode, post, web, App, HttpResponse, HttpServer, Responder,
    ResponseError, Result,
};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::models::{JobView, VideoFormat, WorkflowConfig};
use crate::orchestrator::Orchestrator;

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize, Debug)]
enum ErrorType {
    NotFound,
    InvalidState,
    ResultUnavailable,
    InvalidRequest,
    Internal,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorType,
    description: String,
}

fn build_error_response(status: StatusCode, error_type: ErrorType, description: &str) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse {
        error: error_type,
        description: description.to_owned(),
    })
}

impl ResponseError for OrchestratorError {
    fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidState { .. } => StatusCode::CONFLICT,
            OrchestratorError::ResultUnavailable { .. } | OrchestratorError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error_type = match self {
            OrchestratorError::NotFound(_) => ErrorType::NotFound,
            OrchestratorError::InvalidState { .. } => ErrorType::InvalidState,
            OrchestratorError::ResultUnavailable { .. } => ErrorType::ResultUnavailable,
            OrchestratorError::InvalidConfig(_) => ErrorType::InvalidRequest,
            _ => ErrorType::Internal,
        };

        build_error_response(self.status_code(), error_type, &self.to_string())
    }
}

#[derive(Serialize)]
struct CreateResponse {
    job_id: Uuid,
    status: &'static str,
}

#[derive(Serialize)]
struct ListResponse {
    jobs: Vec<JobView>,
}

/// Form fields of a job submission, before validation.
#[derive(Default)]
struct SubmitForm {
    file_name: Option<String>,
    content: Vec<u8>,
    positive_prompt: Option<String>,
    negative_prompt: Option<String>,
    seed: Option<String>,
    randomize_seed: Option<String>,
    fps: Option<String>,
    duration: Option<String>,
    format: Option<String>,
}

fn parse_field<T: FromStr>(name: &str, value: Option<&str>, default: T) -> std::result::Result<T, String> {
    match value.map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| format!("invalid value for {name}: `{raw}`")),
    }
}

fn parse_flag(value: Option<&str>, default: bool) -> std::result::Result<bool, String> {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "1" | "on" | "yes" => Ok(true),
            "false" | "0" | "off" | "no" => Ok(false),
            other => Err(format!("invalid value for randomize_seed: `{other}`")),
        },
    }
}

impl SubmitForm {
    fn into_config(self) -> std::result::Result<(String, Vec<u8>, WorkflowConfig), String> {
        let file_name = self.file_name.ok_or("missing file")?;
        let positive = self.positive_prompt.ok_or("missing positive_prompt")?;
        let negative = self.negative_prompt.ok_or("missing negative_prompt")?;

        let mut config = WorkflowConfig::new(positive, negative);
        config.seed = parse_field("seed", self.seed.as_deref(), WorkflowConfig::DEFAULT_SEED)?;
        config.randomize_seed = parse_flag(self.randomize_seed.as_deref(), true)?;
        config.fps = parse_field("fps", self.fps.as_deref(), WorkflowConfig::DEFAULT_FPS)?;
        config.duration = parse_field(
            "duration",
            self.duration.as_deref(),
            WorkflowConfig::DEFAULT_DURATION,
        )?;
        config.format = match self.format.as_deref().map(str::trim) {
            None | Some("") => VideoFormat::Mp4,
            Some(raw) => raw.parse()?,
        };

        Ok((file_name, self.content, config))
    }
}

async fn read_form(mut payload: Multipart) -> Result<std::result::Result<SubmitForm, String>> {
    let mut form = SubmitForm::default();

    while let Some(item) = payload.next().await {
        let mut field = item?;
        let disposition = field.content_disposition().clone();
        let name = disposition.get_name().unwrap_or_default().to_owned();

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            if data.len() + chunk.len() > MAX_UPLOAD_BYTES {
                return Ok(Err(format!("upload exceeds {MAX_UPLOAD_BYTES} bytes")));
            }
            data.extend_from_slice(&chunk);
        }

        if name == "file" {
            form.file_name = Some(disposition.get_filename().unwrap_or("upload").to_owned());
            form.content = data;
            continue;
        }

        let text = match String::from_utf8(data) {
            Ok(text) => text,
            Err(_) => return Ok(Err(format!("field {name} is not UTF-8"))),
        };

        match name.as_str() {
            "positive_prompt" => form.positive_prompt = Some(text),
            "negative_prompt" => form.negative_prompt = Some(text),
            "seed" => form.seed = Some(text),
            "randomize_seed" => form.randomize_seed = Some(text),
            "fps" => form.fps = Some(text),
            "duration" => form.duration = Some(text),
            "format" => form.format = Some(text),
            _ => {}
        }
    }

    Ok(Ok(form))
}

#[get("/")]
async fn root(data: web::Data<Orchestrator>) -> impl Responder {
    web::Json(json!({
        "name": "vidflow",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "backend_url": data.backend_url(),
    }))
}

#[post("/api/jobs")]
async fn create_job(data: web::Data<Orchestrator>, payload: Multipart) -> Result<HttpResponse> {
    let form = match read_form(payload).await? {
        Ok(form) => form,
        Err(description) => {
            return Ok(build_error_response(
                StatusCode::BAD_REQUEST,
                ErrorType::InvalidRequest,
                &description,
            ))
        }
    };

    let (file_name, content, config) = match form.into_config() {
        Ok(parts) => parts,
        Err(description) => {
            return Ok(build_error_response(
                StatusCode::BAD_REQUEST,
                ErrorType::InvalidRequest,
                &description,
            ))
        }
    };

    let job_id = data.create_job(&file_name, &content, config).await?;

    Ok(HttpResponse::Ok().json(CreateResponse {
        job_id,
        status: "queued",
    }))
}

#[get("/api/jobs")]
async fn list_jobs(data: web::Data<Orchestrator>) -> impl Responder {
    web::Json(ListResponse {
        jobs: data.list_jobs(),
    })
}

#[get("/api/jobs/{id}")]
async fn get_job(data: web::Data<Orchestrator>, id: web::Path<Uuid>) -> Result<impl Responder> {
    Ok(web::Json(data.get_job(id.into_inner())?))
}

#[delete("/api/jobs/{id}")]
async fn cancel_job(data: web::Data<Orchestrator>, id: web::Path<Uuid>) -> Result<impl Responder> {
    data.cancel_job(id.into_inner()).await?;
    Ok(web::Json(json!({ "status": "cancelled" })))
}

/// `filename` carries an ASCII stand-in; names outside ASCII also get the
/// RFC 5987 `filename*` form.
fn attachment(name: &str) -> ContentDisposition {
    let fallback: String = name
        .chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect();

    let mut parameters = vec![DispositionParam::Filename(fallback)];
    if !name.is_ascii() {
        parameters.push(DispositionParam::FilenameExt(ExtendedValue {
            charset: Charset::Ext("UTF-8".to_owned()),
            language_tag: None,
            value: name.as_bytes().to_vec(),
        }));
    }

    ContentDisposition {
        disposition: DispositionType::Attachment,
        parameters,
    }
}

#[get("/api/jobs/{id}/result")]
async fn job_result(data: web::Data<Orchestrator>, id: web::Path<Uuid>) -> Result<HttpResponse> {
    let result = data.result(id.into_inner())?;

    let file = match tokio::fs::File::open(&result.path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %result.path.display(), "result file unavailable: {err}");
            return Ok(build_error_response(
                StatusCode::GONE,
                ErrorType::ResultUnavailable,
                "result file is no longer available",
            ));
        }
    };

    Ok(HttpResponse::Ok()
        .content_type(result.mime_type)
        .insert_header(attachment(&result.download_name))
        .streaming(ReaderStream::new(file)))
}

#[get("/api/stats")]
async fn stats(data: web::Data<Orchestrator>) -> impl Responder {
    web::Json(data.stats())
}

async fn backend_reachable(backend_url: &str) -> bool {
    match awc::Client::default()
        .get(format!("{backend_url}/system_stats"))
        .timeout(HEALTH_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(err) => {
            warn!("backend health probe failed: {err}");
            false
        }
    }
}

#[get("/api/health")]
async fn health(data: web::Data<Orchestrator>) -> impl Responder {
    let connected = backend_reachable(data.backend_url()).await;

    web::Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "backend_connected": connected,
        "server": "running",
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(root)
        .service(create_job)
        .service(list_jobs)
        .service(get_job)
        .service(cancel_job)
        .service(job_result)
        .service(stats)
        .service(health);
}

pub async fn start_web_server(
    orchestrator: Arc<Orchestrator>,
    bind_address: &str,
    port: u16,
) -> std::io::Result<()> {
    let app_state = web::Data::from(orchestrator);

    info!("Starting web server at {bind_address}:{port}...");

    HttpServer::new(move || App::new().app_data(app_state.clone()).configure(configure))
        .bind((bind_address, port))?
        .run()
        .await
}
