//! Device identity and authentication for CredAgent.
//!
//! This crate provides:
//! - The [`IdentityProvider`] capability and a software implementation
//! - JSON protocol messages exchanged with the authority
//! - The authentication state machine with an audit history
//! - [`AuthenticationEngine`], which turns a device key into a session credential

pub mod engine;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod state;

pub use engine::{AuthRequest, AuthenticationEngine};
pub use error::{AuthError, AuthResult, ProviderError};
pub use provider::{
    provider_from_config, DeviceKey, IdentityProvider, KeyParams, SoftwareDeviceKey,
    SoftwareIdentityProvider,
};
pub use state::{AuthState, AuthStateMachine, StateTransition};
