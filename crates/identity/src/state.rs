//! Authentication state machine.
//!
//! One authentication call walks these states under the engine lock:
//!
//! ```text
//! Init
//!     ↓ (begin)
//! AwaitingChallenge ──(register)──→ RegistrationRequired
//!     ↓ (challenge)                     ↓
//! Authenticating                    Registering
//!     ↓                                 ↓ (registered, once per call)
//! Authenticated                     AwaitingChallenge
//! ```
//!
//! Any state can move to `Failed`. `Authenticated` and `Failed` are terminal
//! until the next `begin`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Maximum number of state transitions to track in history.
const MAX_HISTORY_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    Init,
    AwaitingChallenge,
    RegistrationRequired,
    Registering,
    Authenticating {
        /// BLAKE3 of the challenge, for audit
        challenge_hash: Vec<u8>,
    },
    Authenticated {
        key_id: String,
    },
    Failed {
        error: String,
    },
}

impl AuthState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthState::Authenticated { .. } | AuthState::Failed { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            AuthState::Init => "Init",
            AuthState::AwaitingChallenge => "AwaitingChallenge",
            AuthState::RegistrationRequired => "RegistrationRequired",
            AuthState::Registering => "Registering",
            AuthState::Authenticating { .. } => "Authenticating",
            AuthState::Authenticated { .. } => "Authenticated",
            AuthState::Failed { .. } => "Failed",
        }
    }
}

/// Record of a state transition for audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: String,
    pub to_state: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub reason: Option<String>,
    pub transition_hash: Vec<u8>,
}

pub struct AuthStateMachine {
    current_state: AuthState,
    history: VecDeque<StateTransition>,
    /// Registrations completed since the last `begin`
    registrations: u32,
}

impl AuthStateMachine {
    pub fn new() -> Self {
        Self {
            current_state: AuthState::Init,
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            registrations: 0,
        }
    }

    pub fn current_state(&self) -> &AuthState {
        &self.current_state
    }

    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    pub fn registrations(&self) -> u32 {
        self.registrations
    }

    /// Init | Authenticated | Failed → AwaitingChallenge
    pub fn begin(&mut self) -> Result<(), AuthError> {
        match &self.current_state {
            AuthState::Init | AuthState::Authenticated { .. } | AuthState::Failed { .. } => {
                self.registrations = 0;
                self.transition(AuthState::AwaitingChallenge, Some("Authentication started"));
                Ok(())
            }
            other => Err(AuthError::InvalidTransition(format!(
                "Cannot begin authentication from {}",
                other.name()
            ))),
        }
    }

    /// AwaitingChallenge → RegistrationRequired
    ///
    /// A second registration demand within one call is a loop.
    pub fn on_registration_required(&mut self) -> Result<(), AuthError> {
        match &self.current_state {
            AuthState::AwaitingChallenge if self.registrations > 0 => Err(AuthError::RegistrationLoop),
            AuthState::AwaitingChallenge => {
                self.transition(AuthState::RegistrationRequired, Some("Authority requested registration"));
                Ok(())
            }
            other => Err(self.invalid("registration required", other)),
        }
    }

    /// RegistrationRequired → Registering
    pub fn on_registering(&mut self) -> Result<(), AuthError> {
        match &self.current_state {
            AuthState::RegistrationRequired => {
                self.transition(AuthState::Registering, None);
                Ok(())
            }
            other => Err(self.invalid("registering", other)),
        }
    }

    /// Registering → AwaitingChallenge
    pub fn on_registered(&mut self) -> Result<(), AuthError> {
        match &self.current_state {
            AuthState::Registering => {
                self.registrations += 1;
                self.transition(AuthState::AwaitingChallenge, Some("Device registered"));
                Ok(())
            }
            other => Err(self.invalid("registered", other)),
        }
    }

    /// AwaitingChallenge → Authenticating
    pub fn on_challenge_received(&mut self, challenge: &str) -> Result<(), AuthError> {
        match &self.current_state {
            AuthState::AwaitingChallenge => {
                let challenge_hash = blake3::hash(challenge.as_bytes()).as_bytes().to_vec();
                self.transition(AuthState::Authenticating { challenge_hash }, None);
                Ok(())
            }
            other => Err(self.invalid("challenge received", other)),
        }
    }

    /// Authenticating → Authenticated
    pub fn on_authenticated(&mut self, key_id: &str) -> Result<(), AuthError> {
        match &self.current_state {
            AuthState::Authenticating { .. } => {
                self.transition(
                    AuthState::Authenticated {
                        key_id: key_id.to_string(),
                    },
                    None,
                );
                Ok(())
            }
            other => Err(self.invalid("authenticated", other)),
        }
    }

    /// Any → Failed
    pub fn on_failure(&mut self, error: &AuthError) {
        let reason = format!("Authentication failed: {}", error);
        self.transition(
            AuthState::Failed {
                error: error.to_string(),
            },
            Some(&reason),
        );
    }

    fn invalid(&self, event: &str, state: &AuthState) -> AuthError {
        AuthError::InvalidTransition(format!("'{}' is not valid in state {}", event, state.name()))
    }

    fn transition(&mut self, new_state: AuthState, reason: Option<&str>) {
        let now = current_timestamp();
        let from_state = format!("{:?}", self.current_state);
        let to_state = format!("{:?}", new_state);

        let transition_data = format!("{}->{};{}", from_state, to_state, now);
        let transition_hash = blake3::hash(transition_data.as_bytes()).as_bytes().to_vec();

        self.current_state = new_state;

        if self.history.len() >= MAX_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(StateTransition {
            from_state,
            to_state,
            timestamp: now,
            reason: reason.map(str::to_string),
            transition_hash,
        });
    }
}

impl Default for AuthStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_authentication_path() {
        let mut sm = AuthStateMachine::new();
        sm.begin().unwrap();
        sm.on_challenge_received("nonce").unwrap();
        assert!(matches!(sm.current_state(), AuthState::Authenticating { .. }));
        sm.on_authenticated("kid-1").unwrap();
        assert_eq!(
            *sm.current_state(),
            AuthState::Authenticated {
                key_id: "kid-1".to_string()
            }
        );
        assert!(sm.current_state().is_terminal());
        assert_eq!(sm.history().len(), 3);
    }

    #[test]
    fn test_registration_once_per_call() {
        let mut sm = AuthStateMachine::new();
        sm.begin().unwrap();
        sm.on_registration_required().unwrap();
        sm.on_registering().unwrap();
        sm.on_registered().unwrap();
        assert_eq!(*sm.current_state(), AuthState::AwaitingChallenge);
        assert_eq!(sm.registrations(), 1);

        assert!(matches!(
            sm.on_registration_required(),
            Err(AuthError::RegistrationLoop)
        ));
    }

    #[test]
    fn test_begin_resets_registration_count() {
        let mut sm = AuthStateMachine::new();
        sm.begin().unwrap();
        sm.on_registration_required().unwrap();
        sm.on_registering().unwrap();
        sm.on_registered().unwrap();
        sm.on_failure(&AuthError::Protocol("boom".to_string()));

        sm.begin().unwrap();
        assert_eq!(sm.registrations(), 0);
        assert!(sm.on_registration_required().is_ok());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut sm = AuthStateMachine::new();
        assert!(sm.on_registering().is_err());
        assert!(sm.on_authenticated("k").is_err());
        sm.begin().unwrap();
        assert!(sm.begin().is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut sm = AuthStateMachine::new();
        for _ in 0..60 {
            sm.begin().unwrap();
            sm.on_failure(&AuthError::Protocol("x".to_string()));
        }
        assert_eq!(sm.history().len(), MAX_HISTORY_SIZE);
        assert!(sm.history().iter().all(|t| t.transition_hash.len() == 32));
    }
}
