use reelwork_core::ServiceError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{ServiceClient, ServiceRequest, ServiceResponse, CODE_EMPTY, CODE_PARSE},
    http::{self, HttpServiceConfig},
};

const ENDPOINT: &str = "/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResp {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Text rewriting through an OpenAI-compatible chat endpoint. The system
/// prompt comes from the `system` request param; `temperature` overrides
/// the default.
#[derive(Debug, Clone)]
pub struct RewriteClient {
    cfg: HttpServiceConfig,
}

impl RewriteClient {
    pub fn new(cfg: HttpServiceConfig) -> Self {
        Self { cfg }
    }

    async fn call(&self, req: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        let client = http::build_client(&self.cfg)?;
        let url = format!("{}{ENDPOINT}", http::normalize_base_url(&self.cfg.base_url, ENDPOINT));

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = req.get("system").filter(|s| !s.trim().is_empty()) {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: &req.text,
        });
        let body = ChatReq {
            model: self.cfg.model_or(DEFAULT_MODEL),
            messages,
            temperature: req
                .get("temperature")
                .and_then(|t| t.trim().parse::<f32>().ok())
                .unwrap_or(DEFAULT_TEMPERATURE),
        };

        let mut rb = client.post(url).json(&body);
        if let Some(k) = &self.cfg.api_key {
            rb = rb.bearer_auth(k);
        }
        let resp = rb.send().await.map_err(http::send_error)?;
        let resp = http::check_status(resp).await?;
        let raw = http::read_text(resp).await?;
        let r: ChatResp = serde_json::from_str(&raw)
            .map_err(|e| ServiceError::new(CODE_PARSE, format!("invalid chat response: {e}")))?;
        let content = r
            .choices
            .first()
            .ok_or_else(|| ServiceError::new(CODE_PARSE, "missing choices[0]"))?
            .message
            .content
            .trim()
            .to_string();
        if content.is_empty() {
            return Err(ServiceError::new(CODE_EMPTY, "rewrite returned empty content"));
        }
        Ok(ServiceResponse::Text(content))
    }
}

impl ServiceClient for RewriteClient {
    fn name(&self) -> &str {
        "rewrite"
    }

    fn invoke(&self, req: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        self.invoke_with_token(req, &CancellationToken::new())
    }

    fn invoke_with_token(
        &self,
        req: &ServiceRequest,
        token: &CancellationToken,
    ) -> Result<ServiceResponse, ServiceError> {
        http::block_on_cancellable(token, || self.call(req))
    }
}
