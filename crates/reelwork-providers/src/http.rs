//! Shared plumbing for the HTTP-backed clients: config, a per-call Tokio
//! runtime, cancellation racing and status mapping.

use std::{future::Future, time::Duration};

use reelwork_core::ServiceError;
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;

use crate::client::{status_code, CODE_CONFIG, CODE_HTTP_SEND, CODE_PARSE};

const ERROR_BODY_MAX: usize = 512;

#[derive(Debug, Clone, Default)]
pub struct HttpServiceConfig {
    pub base_url: String,
    /// Sent as a bearer token when present.
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// No timeout unless the caller sets one.
    pub timeout: Option<Duration>,
}

impl HttpServiceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        let k = key.into();
        self.api_key = if k.trim().is_empty() { None } else { Some(k) };
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }

    pub(crate) fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(default)
    }
}

/// `""` means the OpenAI default; a pasted full endpoint is cut back to its
/// base.
pub fn normalize_base_url(s: &str, endpoint_suffix: &str) -> String {
    let mut t = s.trim().trim_end_matches('/').to_string();
    if t.is_empty() {
        return "https://api.openai.com/v1".to_string();
    }
    if let Some(stripped) = t.strip_suffix(endpoint_suffix) {
        t = stripped.to_string();
    }
    t.trim_end_matches('/').to_string()
}

pub(crate) fn build_client(cfg: &HttpServiceConfig) -> Result<Client, ServiceError> {
    let mut b = Client::builder();
    if let Some(t) = cfg.timeout {
        b = b.timeout(t);
    }
    b.build()
        .map_err(|e| ServiceError::new(CODE_CONFIG, format!("http client init failed: {e}")))
}

/// Drive one request on a dedicated current-thread runtime so callers can
/// stay synchronous. The request is dropped as soon as `token` fires.
pub(crate) fn block_on_cancellable<F, Fut, T>(
    token: &CancellationToken,
    make: F,
) -> Result<T, ServiceError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    if token.is_cancelled() {
        return Err(ServiceError::cancelled());
    }
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ServiceError::new(CODE_CONFIG, format!("tokio runtime init failed: {e}")))?;
    rt.block_on(async move {
        tokio::select! {
            _ = token.cancelled() => Err(ServiceError::cancelled()),
            v = make() => v,
        }
    })
}

pub(crate) fn send_error(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        return ServiceError::new(CODE_HTTP_SEND, format!("request timed out: {e}"));
    }
    ServiceError::new(CODE_HTTP_SEND, format!("request failed: {e}"))
}

fn truncate_body(body: String) -> String {
    if body.len() <= ERROR_BODY_MAX {
        return body;
    }
    let mut cut = ERROR_BODY_MAX;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...(truncated)", &body[..cut])
}

/// Non-2xx responses become `E_SERVICE_HTTP_STATUS_<n>` with the status and a
/// bounded body excerpt in the message.
pub(crate) async fn check_status(resp: Response) -> Result<Response, ServiceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ServiceError::new(
        &status_code(status.as_u16()),
        format!("http {}: {}", status.as_u16(), truncate_body(body).trim()),
    ))
}

pub(crate) async fn read_text(resp: Response) -> Result<String, ServiceError> {
    resp.text()
        .await
        .map_err(|e| ServiceError::new(CODE_PARSE, format!("read response failed: {e}")))
}

#[cfg(test)]
pub(crate) mod test_server {
    //! One-shot HTTP responder on 127.0.0.1 for client tests.

    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread::JoinHandle,
        time::Duration,
    };

    pub struct Reply {
        pub status: u16,
        pub content_type: &'static str,
        pub body: Vec<u8>,
        pub delay: Duration,
    }

    impl Reply {
        pub fn new(status: u16, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
            Self {
                status,
                content_type,
                body: body.into(),
                delay: Duration::ZERO,
            }
        }
    }

    fn read_request(s: &mut std::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match s.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let len = text[..head_end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        if k.eq_ignore_ascii_case("content-length") {
                            v.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);
                if buf.len() >= head_end + 4 + len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Returns the base URL and a handle yielding the raw request text.
    pub fn serve_once(reply: Reply) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let h = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().expect("accept");
            let req = read_request(&mut s);
            std::thread::sleep(reply.delay);
            let head = format!(
                "HTTP/1.1 {} X\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reply.status,
                reply.content_type,
                reply.body.len()
            );
            let _ = s.write_all(head.as_bytes());
            let _ = s.write_all(&reply.body);
            let _ = s.flush();
            req
        });
        (format!("http://{addr}"), h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_handles_empty_and_endpoint_suffix() {
        assert_eq!(normalize_base_url("", "/chat/completions"), "https://api.openai.com/v1");
        assert_eq!(
            normalize_base_url(" https://api.openai.com/v1/ ", "/chat/completions"),
            "https://api.openai.com/v1"
        );
        assert_eq!(
            normalize_base_url("http://api.server/v1/chat/completions/", "/chat/completions"),
            "http://api.server/v1"
        );
        assert_eq!(
            normalize_base_url("http://api.server/v1/audio/speech", "/audio/speech"),
            "http://api.server/v1"
        );
    }

    #[test]
    fn long_error_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(400);
        let t = truncate_body(body);
        assert!(t.ends_with("...(truncated)"));
        assert!(t.len() <= ERROR_BODY_MAX + "...(truncated)".len());
    }

    #[test]
    fn blank_api_key_is_dropped() {
        assert_eq!(HttpServiceConfig::new("x").api_key("  ").api_key, None);
        assert_eq!(HttpServiceConfig::new("x").model_or("m"), "m");
        assert_eq!(HttpServiceConfig::new("x").model(" gpt ").model_or("m"), "gpt");
    }

    #[test]
    fn cancellation_abandons_in_flight_future() {
        let token = CancellationToken::new();
        let t2 = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            t2.cancel();
        });
        let r: Result<(), ServiceError> = block_on_cancellable(&token, || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        assert!(r.expect_err("cancelled").is_cancelled());
    }
}
