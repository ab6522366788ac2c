use reelwork_core::ServiceError;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    client::{ServiceClient, ServiceRequest, ServiceResponse, CODE_EMPTY, CODE_PARSE},
    http::{self, HttpServiceConfig},
};

const ENDPOINT: &str = "/audio/speech";
const DEFAULT_MODEL: &str = "tts-1";
/// Params the endpoint types as numbers.
const NUMERIC_PARAMS: &[&str] = &["speed"];

/// Text-to-speech over an OpenAI-compatible `/audio/speech` endpoint.
/// Request params (`voice`, `speed`, `response_format`, ...) are sent as
/// top-level JSON fields, as strings except for [`NUMERIC_PARAMS`].
#[derive(Debug, Clone)]
pub struct SpeechClient {
    cfg: HttpServiceConfig,
}

impl SpeechClient {
    pub fn new(cfg: HttpServiceConfig) -> Self {
        Self { cfg }
    }

    fn url(&self) -> String {
        format!("{}{ENDPOINT}", http::normalize_base_url(&self.cfg.base_url, ENDPOINT))
    }

    fn body(&self, req: &ServiceRequest) -> Value {
        let mut m = Map::new();
        m.insert("model".into(), Value::from(self.cfg.model_or(DEFAULT_MODEL)));
        m.insert("input".into(), Value::from(req.text.as_str()));
        for (k, v) in &req.params {
            let numeric = NUMERIC_PARAMS.contains(&k.as_str())
                .then(|| v.trim().parse::<f64>().ok())
                .flatten()
                .filter(|n| n.is_finite());
            let val = match numeric {
                Some(n) => Value::from(n),
                None => Value::from(v.as_str()),
            };
            m.insert(k.clone(), val);
        }
        Value::Object(m)
    }

    async fn call(&self, req: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        let client = http::build_client(&self.cfg)?;
        let mut rb = client.post(self.url()).json(&self.body(req));
        if let Some(k) = &self.cfg.api_key {
            rb = rb.bearer_auth(k);
        }
        let resp = rb.send().await.map_err(http::send_error)?;
        let resp = http::check_status(resp).await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = resp
            .bytes()
            .await
            .map_err(|e| ServiceError::new(CODE_PARSE, format!("read audio failed: {e}")))?;
        if data.is_empty() {
            return Err(ServiceError::new(CODE_EMPTY, "audio response is empty"));
        }
        Ok(ServiceResponse::Bytes {
            data: data.to_vec(),
            content_type,
        })
    }
}

impl ServiceClient for SpeechClient {
    fn name(&self) -> &str {
        "speech"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_server::{serve_once, Reply};

    #[test]
    fn posts_json_and_returns_audio_bytes() {
        let (base, server) = serve_once(Reply::new(200, "audio/mpeg", b"ID3fake".to_vec()));
        let c = SpeechClient::new(HttpServiceConfig::new(format!("{base}/v1")).api_key("k-1"));
        let req = ServiceRequest::new("hello there").param("voice", "alloy").param("speed", "1.5");
        let resp = c.invoke(&req).expect("invoke");
        assert_eq!(
            resp,
            ServiceResponse::Bytes {
                data: b"ID3fake".to_vec(),
                content_type: Some("audio/mpeg".to_string()),
            }
        );
        let raw = server.join().expect("server");
        assert!(raw.starts_with("POST /v1/audio/speech "));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer k-1"));
        let body: Value = serde_json::from_str(raw.split("\r\n\r\n").nth(1).unwrap_or("")).expect("json body");
        assert_eq!(body["input"], "hello there");
        assert_eq!(body["voice"], "alloy");
        assert_eq!(body["speed"], 1.5);
        assert_eq!(body["model"], DEFAULT_MODEL);
    }

    #[test]
    fn numeric_looking_voice_stays_a_string() {
        let c = SpeechClient::new(HttpServiceConfig::new("http://unused"));
        let req = ServiceRequest::new("hi")
            .param("voice", "123")
            .param("response_format", "1e3")
            .param("speed", " 0.75 ")
            .param("speed_hint", "2");
        let body = c.body(&req);
        assert_eq!(body["voice"], "123");
        assert_eq!(body["response_format"], "1e3");
        assert_eq!(body["speed"], 0.75);
        assert_eq!(body["speed_hint"], "2");

        let odd = c.body(&ServiceRequest::new("hi").param("speed", "fast"));
        assert_eq!(odd["speed"], "fast");
    }

    #[test]
    fn server_error_maps_to_status_code() {
        let (base, server) = serve_once(Reply::new(500, "text/plain", "boom"));
        let c = SpeechClient::new(HttpServiceConfig::new(base));
        let e = c.invoke(&ServiceRequest::new("x")).expect_err("500");
        assert_eq!(e.code, "E_SERVICE_HTTP_STATUS_500");
        assert!(e.message.contains("500"));
        assert!(e.message.contains("boom"));
        server.join().expect("server");
    }

    #[test]
    fn empty_audio_is_an_error() {
        let (base, server) = serve_once(Reply::new(200, "audio/mpeg", Vec::new()));
        let c = SpeechClient::new(HttpServiceConfig::new(base));
        let e = c.invoke(&ServiceRequest::new("x")).expect_err("empty");
        assert_eq!(e.code, CODE_EMPTY);
        server.join().expect("server");
    }
}
