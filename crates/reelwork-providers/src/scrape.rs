use reelwork_core::ServiceError;
use tokio_util::sync::CancellationToken;

use crate::{
    client::{ServiceClient, ServiceRequest, ServiceResponse, CODE_CONFIG, CODE_EMPTY, CODE_PARSE},
    http::{self, HttpServiceConfig},
};

pub const DEFAULT_LIMIT: u32 = 100;

/// Comment scraping through an HTTP gateway:
/// `GET {base_url}?url=<request text>&limit=<n>` returning a JSON document.
/// The body is validated as JSON and handed back as text.
#[derive(Debug, Clone)]
pub struct ScrapeClient {
    cfg: HttpServiceConfig,
}

impl ScrapeClient {
    pub fn new(cfg: HttpServiceConfig) -> Self {
        Self { cfg }
    }

    async fn call(&self, req: &ServiceRequest) -> Result<ServiceResponse, ServiceError> {
        let target = req.text.trim();
        if target.is_empty() {
            return Err(ServiceError::new(
                CODE_CONFIG,
                "scrape target url is empty",
            ));
        }
        let limit = req
            .get("limit")
            .and_then(|l| l.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_LIMIT);
        let client = http::build_client(&self.cfg)?;
        let mut rb = client
            .get(self.cfg.base_url.trim())
            .query(&[("url", target.to_string()), ("limit", limit.to_string())]);
        if let Some(k) = &self.cfg.api_key {
            rb = rb.bearer_auth(k);
        }
        let resp = rb.send().await.map_err(http::send_error)?;
        let resp = http::check_status(resp).await?;
        let raw = http::read_text(resp).await?;
        if raw.trim().is_empty() {
            return Err(ServiceError::new(CODE_EMPTY, "scrape response is empty"));
        }
        serde_json::from_str::<serde_json::Value>(&raw)
            .map_err(|e| ServiceError::new(CODE_PARSE, format!("invalid json response: {e}")))?;
        Ok(ServiceResponse::Text(raw))
    }
}

impl ServiceClient for ScrapeClient {
    fn name(&self) -> &str {
        "scrape"
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
    fn sends_target_and_limit_as_query() {
        let (base, server) = serve_once(Reply::new(
            200,
            "application/json",
            r#"{"comments":[{"text":"first"}]}"#,
        ));
        let c = ScrapeClient::new(HttpServiceConfig::new(format!("{base}/comments")));
        let req = ServiceRequest::new("https://video.example/watch?v=1").param("limit", "5");
        match c.invoke(&req).expect("invoke") {
            ServiceResponse::Text(t) => assert!(t.contains("first")),
            other => panic!("unexpected response: {other:?}"),
        }
        let raw = server.join().expect("server");
        let line = raw.lines().next().unwrap_or_default();
        assert!(line.starts_with("GET /comments?url=https%3A%2F%2Fvideo.example"));
        assert!(line.contains("limit=5"));
    }

    #[test]
    fn empty_target_fails_before_any_request() {
        let c = ScrapeClient::new(HttpServiceConfig::new("http://127.0.0.1:9"));
        let e = c.invoke(&ServiceRequest::new("  ")).expect_err("config");
        assert_eq!(e.code, CODE_CONFIG);
    }
}
