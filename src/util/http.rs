use std::time::Duration;

use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;

pub type Method = reqwest::Method;
pub type StatusCode = reqwest::StatusCode;

/// Transport-level failures. Everything here is produced *before* a response
/// body has been interpreted; protocol-level rejections are modelled by the
/// calling module.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    #[error("request timed out")]
    Timeout,

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("server replied with status: {0}")]
    Status(StatusCode),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl NetworkError {
    /// Whether the failure is transient and worth another attempt. Client
    /// rejections (4xx other than 429) and malformed bodies are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            NetworkError::Timeout | NetworkError::Unreachable(_) => true,
            NetworkError::Status(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            NetworkError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if err.is_decode() {
            NetworkError::Decode(err.to_string())
        } else {
            NetworkError::Unreachable(err.to_string())
        }
    }
}

#[derive(Debug)]
pub struct Response(reqwest::Response);

#[allow(unused)]
impl Response {
    pub fn status(&self) -> StatusCode {
        self.0.status()
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, NetworkError> {
        self.0.json().await.map_err(NetworkError::from)
    }

    pub async fn text(self) -> Result<String, NetworkError> {
        self.0.text().await.map_err(NetworkError::from)
    }
}

/// Thin wrapper over [`reqwest::Client`] applying a per-call timeout.
#[derive(Debug, Clone)]
pub struct Client {
    client: reqwest::Client,
    timeout: Duration,
}

impl Client {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Thin wrapper around [`reqwest::RequestBuilder`]; the decorator
    /// receives the prepared builder and attaches headers and body.
    pub async fn request<D>(
        &self,
        method: Method,
        url: &str,
        decorator: D,
    ) -> Result<Response, NetworkError>
    where
        D: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let request = self.client.request(method, url).timeout(self.timeout);
        let request = decorator(request);
        Ok(Response(request.send().await.map_err(NetworkError::from)?))
    }
}
