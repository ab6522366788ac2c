use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use crossbeam_channel::RecvTimeoutError;
use reelwork_core::{error::CODE_INTERNAL, ServiceError, TaskError, TaskKind, TaskOutput};
use reelwork_observability::Span;
use reelwork_providers::{
    client::CODE_PARSE, ServiceClient, ServiceRequest, ServiceResponse,
};
use serde_json::{json, Value};

use crate::task::{temp_artifact_path, write_artifact, Task, TaskContext};

const SYNTHETIC_STEP: i64 = 10;
const SYNTHETIC_CAP: i64 = 90;

#[derive(Debug, Clone, Copy)]
pub struct ServiceTaskConfig {
    /// How often the waiting task checks for cancellation and bumps the
    /// synthetic progress.
    pub tick: Duration,
}

impl Default for ServiceTaskConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
        }
    }
}

/// Runs the blocking call on a helper thread so the task thread stays free
/// to notice a cancel. A result that arrives after the cancel is dropped.
fn call_service(
    client: &Arc<dyn ServiceClient>,
    req: ServiceRequest,
    ctx: &TaskContext,
    cfg: &ServiceTaskConfig,
) -> Result<ServiceResponse, TaskError> {
    let span = Span::start(
        ctx.trace_dir(),
        Some(ctx.task_id().as_str()),
        "Service",
        &format!("SVC.{}", client.name()),
        Some(json!({"chars": req.text.chars().count(), "params": req.params.keys().collect::<Vec<_>>()})),
    );
    let (tx, rx) = crossbeam_channel::bounded(1);
    let token = ctx.cancel_token().clone();
    let worker = client.clone();
    std::thread::Builder::new()
        .name(format!("svc-{}", client.name()))
        .spawn(move || {
            let r = catch_unwind(AssertUnwindSafe(|| worker.invoke_with_token(&req, &token)))
                .unwrap_or_else(|_| {
                    Err(ServiceError::new(CODE_INTERNAL, "service client panicked"))
                });
            let _ = tx.send(r);
        })
        .map_err(|e| TaskError::internal(format!("spawn service thread: {e}")))?;

    let mut synthetic = 0;
    ctx.progress(0);
    loop {
        if ctx.is_cancelled() {
            span.skipped("cancelled", None);
            return Err(TaskError::Cancelled);
        }
        match rx.recv_timeout(cfg.tick) {
            Ok(Ok(resp)) => {
                if ctx.is_cancelled() {
                    span.skipped("cancelled", Some(json!({"late_result": true})));
                    return Err(TaskError::Cancelled);
                }
                span.ok(Some(json!({"kind": resp.kind(), "len": resp.len()})));
                return Ok(resp);
            }
            Ok(Err(e)) => {
                if e.is_cancelled() || ctx.is_cancelled() {
                    span.skipped("cancelled", None);
                    return Err(TaskError::Cancelled);
                }
                span.err("service", &e.code, &e.message, None);
                return Err(TaskError::Service(e));
            }
            Err(RecvTimeoutError::Timeout) => {
                synthetic = (synthetic + SYNTHETIC_STEP).min(SYNTHETIC_CAP);
                ctx.progress(synthetic);
            }
            Err(RecvTimeoutError::Disconnected) => {
                span.err("logic", CODE_INTERNAL, "service thread exited without a result", None);
                return Err(TaskError::internal("service thread exited without a result"));
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisParams {
    pub voice: Option<String>,
    pub speed: Option<f32>,
    /// Requested audio format (mp3, wav, ...). Also the file extension when
    /// the response carries no usable content type.
    pub format: Option<String>,
    /// Where to put the audio. A temp file named after the task otherwise.
    pub output: Option<PathBuf>,
}

impl SynthesisParams {
    pub fn to_request(&self, text: &str) -> ServiceRequest {
        let mut req = ServiceRequest::new(text);
        if let Some(v) = self.voice.as_deref().filter(|v| !v.trim().is_empty()) {
            req = req.param("voice", v.trim());
        }
        if let Some(s) = self.speed {
            req = req.param("speed", s.to_string());
        }
        if let Some(f) = self.format.as_deref().filter(|f| !f.trim().is_empty()) {
            req = req.param("response_format", f.trim());
        }
        req
    }
}

pub fn audio_extension(content_type: Option<&str>, fallback: Option<&str>) -> String {
    let mime = content_type
        .and_then(|c| c.split(';').next())
        .map(|c| c.trim().to_ascii_lowercase());
    let ext = match mime.as_deref() {
        Some("audio/mpeg") | Some("audio/mp3") => Some("mp3"),
        Some("audio/wav") | Some("audio/x-wav") | Some("audio/wave") => Some("wav"),
        Some("audio/ogg") | Some("audio/opus") => Some("ogg"),
        Some("audio/flac") => Some("flac"),
        Some("audio/aac") => Some("aac"),
        _ => None,
    };
    ext.map(str::to_string)
        .or_else(|| {
            fallback
                .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|f| !f.is_empty())
        })
        .unwrap_or_else(|| "bin".to_string())
}

/// Text to speech. Completes with the path of the written audio file.
pub struct SynthesisTask {
    client: Arc<dyn ServiceClient>,
    text: String,
    params: SynthesisParams,
    cfg: ServiceTaskConfig,
}

impl SynthesisTask {
    pub fn new(client: Arc<dyn ServiceClient>, text: impl Into<String>, params: SynthesisParams) -> Self {
        Self {
            client,
            text: text.into(),
            params,
            cfg: ServiceTaskConfig::default(),
        }
    }

    pub fn config(mut self, cfg: ServiceTaskConfig) -> Self {
        self.cfg = cfg;
        self
    }
}

impl Task for SynthesisTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Synthesis
    }

    fn describe(&self) -> Value {
        json!({
            "service": self.client.name(),
            "chars": self.text.chars().count(),
            "voice": self.params.voice,
            "format": self.params.format,
        })
    }

    fn run(self: Box<Self>, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let req = self.params.to_request(&self.text);
        let resp = call_service(&self.client, req, ctx, &self.cfg)?;
        let (data, content_type) = match resp {
            ServiceResponse::Bytes { data, content_type } => (data, content_type),
            ServiceResponse::Text(t) => {
                return Err(TaskError::Service(ServiceError::new(
                    CODE_PARSE,
                    format!("expected audio bytes, got {} chars of text", t.len()),
                )))
            }
        };
        let path = match self.params.output {
            Some(p) => p,
            None => temp_artifact_path(
                ctx.task_id(),
                &audio_extension(content_type.as_deref(), self.params.format.as_deref()),
            ),
        };
        write_artifact(&path, &data)?;
        ctx.progress(100);
        Ok(TaskOutput::File(path))
    }
}

/// LLM rewrite of a block of text. Completes with the rewritten text.
pub struct RewriteTask {
    client: Arc<dyn ServiceClient>,
    text: String,
    system: Option<String>,
    cfg: ServiceTaskConfig,
}

impl RewriteTask {
    pub fn new(client: Arc<dyn ServiceClient>, text: impl Into<String>) -> Self {
        Self {
            client,
            text: text.into(),
            system: None,
            cfg: ServiceTaskConfig::default(),
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system = Some(prompt.into());
        self
    }

    pub fn config(mut self, cfg: ServiceTaskConfig) -> Self {
        self.cfg = cfg;
        self
    }
}

impl Task for RewriteTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Rewrite
    }

    fn describe(&self) -> Value {
        json!({
            "service": self.client.name(),
            "chars": self.text.chars().count(),
            "has_system_prompt": self.system.is_some(),
        })
    }

    fn run(self: Box<Self>, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let mut req = ServiceRequest::new(self.text.as_str());
        if let Some(s) = &self.system {
            req = req.param("system", s.as_str());
        }
        let text = match call_service(&self.client, req, ctx, &self.cfg)? {
            ServiceResponse::Text(t) => t,
            ServiceResponse::Bytes { data, .. } => String::from_utf8(data).map_err(|e| {
                TaskError::Service(ServiceError::new(CODE_PARSE, format!("non-utf8 text: {e}")))
            })?,
        };
        ctx.progress(100);
        Ok(TaskOutput::Text(text))
    }
}

/// Comment scraping for one page URL. Completes with the parsed document.
pub struct ScrapeTask {
    client: Arc<dyn ServiceClient>,
    target_url: String,
    limit: Option<u32>,
    cfg: ServiceTaskConfig,
}

impl ScrapeTask {
    pub fn new(client: Arc<dyn ServiceClient>, target_url: impl Into<String>) -> Self {
        Self {
            client,
            target_url: target_url.into(),
            limit: None,
            cfg: ServiceTaskConfig::default(),
        }
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn config(mut self, cfg: ServiceTaskConfig) -> Self {
        self.cfg = cfg;
        self
    }
}

impl Task for ScrapeTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Scrape
    }

    fn describe(&self) -> Value {
        json!({"service": self.client.name(), "url": self.target_url, "limit": self.limit})
    }

    fn run(self: Box<Self>, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let mut req = ServiceRequest::new(self.target_url.as_str());
        if let Some(l) = self.limit {
            req = req.param("limit", l.to_string());
        }
        let raw = match call_service(&self.client, req, ctx, &self.cfg)? {
            ServiceResponse::Text(t) => t.into_bytes(),
            ServiceResponse::Bytes { data, .. } => data,
        };
        let doc: Value = serde_json::from_slice(&raw).map_err(|e| {
            TaskError::Service(ServiceError::new(CODE_PARSE, format!("invalid json: {e}")))
        })?;
        ctx.progress(100);
        Ok(TaskOutput::Json(doc))
    }
}
