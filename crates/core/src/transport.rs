//! Request/response transport towards the authority.
//!
//! The agent only needs "send a JSON document, get a JSON document back".
//! HTTP is provided behind the `http` feature; MQTT envelopes or other
//! carriers implement [`TransportClient`] outside this workspace.

use std::fmt;

/// Request method understood by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// Connectivity and status failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request never produced a response
    #[error("connection failed: {0}")]
    Connect(String),

    /// The authority answered with a non-success status. The body is kept
    /// because it usually carries `message` and `statusCode`.
    #[error("HTTP status {code}")]
    Status { code: u16, body: String },

    /// Transport could not be constructed
    #[error("transport setup failed: {0}")]
    Setup(String),
}

impl TransportError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransportError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Exchange one request for one response body.
pub trait TransportClient: Send + Sync {
    fn send(&self, method: Method, url: &str, body: Option<&str>) -> TransportResult<String>;
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::{Method, TransportClient, TransportError, TransportResult};
    use std::time::Duration;
    use tracing::debug;

    /// Blocking HTTP transport built on `reqwest`.
    pub struct HttpTransport {
        client: reqwest::blocking::Client,
        user_agent: String,
    }

    impl HttpTransport {
        pub fn new(user_agent: &str, timeout: Duration) -> TransportResult<Self> {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TransportError::Setup(e.to_string()))?;
            Ok(Self {
                client,
                user_agent: user_agent.to_string(),
            })
        }
    }

    impl TransportClient for HttpTransport {
        fn send(&self, method: Method, url: &str, body: Option<&str>) -> TransportResult<String> {
            debug!(%method, url, "Sending request");
            let request = match method {
                Method::Get => self.client.get(url),
                Method::Post => self.client.post(url),
            };
            let request = request
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .header(reqwest::header::CONTENT_TYPE, "application/json");
            let request = match body {
                Some(body) => request.body(body.to_string()),
                None => request,
            };

            let response = request
                .send()
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            if status.is_success() {
                Ok(text)
            } else {
                Err(TransportError::Status {
                    code: status.as_u16(),
                    body: text,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_accessor() {
        let err = TransportError::Status {
            code: 403,
            body: "{}".to_string(),
        };
        assert_eq!(err.status_code(), Some(403));
        assert_eq!(TransportError::Connect("refused".into()).status_code(), None);
    }

    #[test]
    fn test_method_display() {
        assert_eq!(Method::Get.to_string(), "GET");
        assert_eq!(Method::Post.to_string(), "POST");
    }
}
