//! Core functionality for the CredAgent device credential agent.
//!
//! This crate provides the configuration model, logging setup, lifecycle
//! event sinks and the transport abstraction shared by the identity, cache
//! and provisioning crates.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod transport;

pub use config::{
    AgentConfig, CacheConfig, ConfigError, RefreshInterval, ServerConfig, Topology,
    INFINITE_REFRESH,
};
pub use error::{CoreError, Error, Result};
pub use events::{EventSink, LoggingEventSink, NoopEventSink, RecordingEventSink};
pub use transport::{Method, TransportClient, TransportError, TransportResult};

#[cfg(feature = "http")]
pub use transport::HttpTransport;
