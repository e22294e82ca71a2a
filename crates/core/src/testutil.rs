//! In-memory doubles shared by the workspace test suites.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::transport::{Method, TransportClient, TransportError, TransportResult};

/// A request as seen by [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
}

struct Step {
    path: String,
    reply: TransportResult<String>,
}

/// Transport that replays a fixed script of replies, in order.
///
/// Each step names a path fragment the request URL must contain. A request
/// that does not match the next step, or arrives after the script is
/// exhausted, fails with [`TransportError::Connect`].
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, path: &str, body: impl Into<String>) -> &Self {
        self.push(path, Ok(body.into()))
    }

    pub fn push_status(&self, path: &str, code: u16, body: impl Into<String>) -> &Self {
        self.push(
            path,
            Err(TransportError::Status {
                code,
                body: body.into(),
            }),
        )
    }

    pub fn push(&self, path: &str, reply: TransportResult<String>) -> &Self {
        self.script.lock().push_back(Step {
            path: path.to_string(),
            reply,
        });
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests whose URL contains `path`.
    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.contains(path))
            .count()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl TransportClient for ScriptedTransport {
    fn send(&self, method: Method, url: &str, body: Option<&str>) -> TransportResult<String> {
        self.requests.lock().push(RecordedRequest {
            method,
            url: url.to_string(),
            body: body.map(str::to_string),
        });

        let mut script = self.script.lock();
        let next_path = script.front().map(|s| s.path.clone());
        match next_path {
            Some(path) if url.contains(&path) => match script.pop_front() {
                Some(step) => step.reply,
                None => Err(TransportError::Connect("script exhausted".into())),
            },
            Some(path) => Err(TransportError::Connect(format!(
                "unexpected request to {} (next scripted path is {})",
                url, path
            ))),
            None => Err(TransportError::Connect(format!(
                "unexpected request to {} (script exhausted)",
                url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replays_in_order() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/a", "one").push_status("/b", 500, "boom");

        assert_eq!(transport.send(Method::Post, "http://x/a", Some("{}")).unwrap(), "one");
        assert_eq!(
            transport.send(Method::Get, "http://x/b", None).unwrap_err().status_code(),
            Some(500)
        );
        assert!(transport.send(Method::Get, "http://x/c", None).is_err());
        assert_eq!(transport.calls_to("/a"), 1);
        assert_eq!(transport.requests().len(), 3);
    }

    #[test]
    fn test_mismatched_path_keeps_step() {
        let transport = ScriptedTransport::new();
        transport.push_ok("/expected", "ok");

        assert!(transport.send(Method::Get, "http://x/other", None).is_err());
        assert_eq!(transport.remaining(), 1);
    }
}
