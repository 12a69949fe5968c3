//! Authenticated calls to the sidecar's control API.

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

pub use reqwest::Method;

use crate::sidecar::config::{SidecarEndpoint, SupervisorConfig};
use crate::sidecar::error::ApiError;

/// Path of the node information endpoint.
pub const NODE_INFO_PATH: &str = "/v2/node/node_info";

/// Decoded node information. Passed through without schema validation.
pub type NodeInfo = serde_json::Map<String, Value>;

/// Issues bearer-authenticated requests to a running sidecar.
pub struct ApiClient {
    endpoint: SidecarEndpoint,
    token: Option<SecretString>,
    http_client: reqwest::Client,
}

impl ApiClient {
    pub fn new(config: &SupervisorConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint: config.endpoint(),
            token: config.credentials.clone(),
            http_client,
        }
    }

    /// Base URL of the sidecar.
    pub fn base_url(&self) -> String {
        self.endpoint.http_url()
    }

    /// Call `endpoint` and decode the JSON response.
    ///
    /// An empty success body decodes to `Value::Null`.
    pub async fn call(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let token = self.token.as_ref().ok_or(ApiError::MissingToken)?;
        let url = self.endpoint.url_for(endpoint);

        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .bearer_auth(token.expose_secret())
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        tracing::debug!(method = %method, url = %url, "Calling sidecar API");

        let response = request.send().await.map_err(|e| ApiError::Transport {
            url: url.clone(),
            status: None,
            detail: if e.is_timeout() {
                "request timed out".to_string()
            } else if e.is_connect() {
                "connection failed".to_string()
            } else {
                e.to_string()
            },
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ApiError::Transport {
            url: url.clone(),
            status: Some(status.as_u16()),
            detail: format!("failed to read response body: {}", e),
        })?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Auth {
                url,
                status: status.as_u16(),
                body: text,
            });
        }
        if !status.is_success() {
            return Err(ApiError::Transport {
                url,
                status: Some(status.as_u16()),
                detail: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode {
            url,
            reason: e.to_string(),
        })
    }

    /// Fetch node information. Anything but a JSON object is a decode error.
    pub async fn node_info(&self) -> Result<NodeInfo, ApiError> {
        match self.call(NODE_INFO_PATH, Method::GET, None).await? {
            Value::Object(map) => Ok(map),
            other => Err(ApiError::Decode {
                url: self.endpoint.url_for(NODE_INFO_PATH),
                reason: format!("expected a JSON object, got {}", json_kind(&other)),
            }),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
