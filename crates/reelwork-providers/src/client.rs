use std::collections::BTreeMap;

use reelwork_core::ServiceError;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub const CODE_HTTP_SEND: &str = "E_SERVICE_HTTP_SEND";
pub const CODE_PARSE: &str = "E_SERVICE_PARSE";
pub const CODE_EMPTY: &str = "E_SERVICE_EMPTY";
pub const CODE_CONFIG: &str = "E_SERVICE_CONFIG";

pub fn status_code(status: u16) -> String {
    format!("E_SERVICE_HTTP_STATUS_{status}")
}

/// Text plus a few named parameters (voice, style, limit, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceRequest {
    pub text: String,
    pub params: BTreeMap<String, String>,
}

impl ServiceRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResponse {
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    Text(String),
}

impl ServiceResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceResponse::Bytes { .. } => "bytes",
            ServiceResponse::Text(_) => "text",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ServiceResponse::Bytes { data, .. } => data.len(),
            ServiceResponse::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One blocking call to an external service. Implementations never retry.
pub trait ServiceClient: Send + Sync {
    /// Short name used in traces ("speech", "rewrite", ...).
    fn name(&self) -> &str;

    fn invoke(&self, req: &ServiceRequest) -> Result<ServiceResponse, ServiceError>;

    /// Like [`ServiceClient::invoke`], but gives up with `E_CANCELLED` once
    /// `token` fires. The default can only check around the call; clients
    /// with a cancellation hook override it.
    fn invoke_with_token(
        &self,
        req: &ServiceRequest,
        token: &CancellationToken,
    ) -> Result<ServiceResponse, ServiceError> {
        if token.is_cancelled() {
            return Err(ServiceError::cancelled());
        }
        let r = self.invoke(req);
        if token.is_cancelled() {
            return Err(ServiceError::cancelled());
        }
        r
    }
}
