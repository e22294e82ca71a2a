//! Per-asset processing outcome.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    InProgress,
    Success,
    Failure,
}

/// Status plus independent per-artifact flags.
///
/// `private_key_stored` is `None` when the asset carries no key to store.
/// Artifacts are never rolled back, so a failed asset may still have a
/// stored certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    pub status: AssetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub certificate_stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_stored: Option<bool>,
}

impl ProcessingState {
    pub fn in_progress() -> Self {
        Self {
            status: AssetStatus::InProgress,
            error_message: None,
            certificate_stored: false,
            private_key_stored: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut state = Self::in_progress();
        state.fail(message);
        state
    }

    /// Mark the asset failed, appending to any earlier message.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.status = AssetStatus::Failure;
        self.error_message = Some(match self.error_message.take() {
            Some(existing) => format!("{}; {}", existing, message),
            None => message,
        });
    }

    /// Settle the status from the artifact flags.
    pub fn finish(&mut self) {
        if self.status == AssetStatus::Failure {
            return;
        }
        self.status = if self.certificate_stored && self.private_key_stored.unwrap_or(true) {
            AssetStatus::Success
        } else {
            AssetStatus::Failure
        };
    }

    pub fn is_terminal(&self) -> bool {
        self.status != AssetStatus::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_requires_both_artifacts() {
        let mut state = ProcessingState::in_progress();
        state.certificate_stored = true;
        state.private_key_stored = Some(false);
        state.finish();
        assert_eq!(state.status, AssetStatus::Failure);

        let mut cert_only = ProcessingState::in_progress();
        cert_only.certificate_stored = true;
        cert_only.finish();
        assert_eq!(cert_only.status, AssetStatus::Success);
    }

    #[test]
    fn test_fail_accumulates_messages() {
        let mut state = ProcessingState::failed("certificate write failed");
        state.fail("key write failed");
        assert_eq!(
            state.error_message.as_deref(),
            Some("certificate write failed; key write failed")
        );
        state.finish();
        assert_eq!(state.status, AssetStatus::Failure);
    }
}
