//! BGH Smart / Solidmation HVAC sync engine
//!
//! Keeps a local view of cloud-managed air conditioners in step with the
//! Solidmation home cloud while keeping cloud traffic low.
//!
//! # Features
//!
//! - Per-home freshness window so bursts of reads cost one fetch
//! - In-flight refresh sharing across concurrent readers
//! - Debounced, diffed commands with optimistic local state
//! - HomeKit-style thermostat mapping
//! - Pluggable [`client::Gateway`] with a reqwest implementation

// Core modules
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod thermostat;

// Test support modules - available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

// Re-export main types for convenience
pub use client::http_client::SolidmationHttpClient;
pub use client::{Device, EndpointId, EndpointValues, Gateway, Home, HomeId};
pub use config::{EngineConfig, ServerConfig};
pub use engine::{DeviceStatus, DispatchEvent, DispatchOutcome, SyncEngine};
pub use error::{GatewayError, Result, SyncError};
pub use thermostat::{Reading, TargetState, Thermostat};
