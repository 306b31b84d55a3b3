//! Solidmation cloud client: device model and the gateway seam
//!
//! The engine only talks to the cloud through the [`Gateway`] trait. The
//! production implementation is [`http_client::SolidmationHttpClient`].

pub mod http_client;
pub mod parser;

use crate::error::GatewayResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field names used in [`EndpointValues`]
pub mod fields {
    pub const MODE: &str = "mode";
    pub const DESIRED_TEMP_C: &str = "desiredTempC";
    pub const CURRENT_TEMP: &str = "currentTemp";
    pub const FAN_MODE: &str = "fanMode";
    pub const SWING_MODE: &str = "swingMode";
    pub const FLAGS: &str = "flags";

    /// Server-derived fields that are never sent back upstream
    pub const READ_ONLY: &[&str] = &[CURRENT_TEMP, SWING_MODE];
}

/// Vendor mode values
pub mod mode {
    pub const OFF: f64 = 0.0;
    pub const COOL: f64 = 1.0;
    pub const HEAT: f64 = 2.0;
    pub const DRY: f64 = 3.0;
    pub const FAN: f64 = 4.0;
    pub const AUTO: f64 = 254.0;
    /// Sentinel for "leave this field as it is"
    pub const NO_CHANGE: f64 = 255.0;
}

/// Scope identifier; one snapshot covers every device of a home
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HomeId(pub i64);

impl fmt::Display for HomeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Controllable endpoint identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub i64);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named numeric state fields of an endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointValues(BTreeMap<String, f64>);

impl EndpointValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, field: &str, value: f64) -> Self {
        self.0.insert(field.to_string(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<f64> {
        self.0.get(field).copied()
    }

    pub fn set(&mut self, field: &str, value: f64) {
        self.0.insert(field.to_string(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<f64> {
        self.0.remove(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Overlay `other` onto `self`; fields in `other` win
    pub fn merge(&mut self, other: &EndpointValues) {
        for (field, value) in &other.0 {
            self.0.insert(field.clone(), *value);
        }
    }

    /// Fields of `self` whose value differs from (or is missing in) `current`
    pub fn modified_keys(&self, current: &EndpointValues) -> Vec<String> {
        self.0
            .iter()
            .filter(|(field, value)| current.get(field) != Some(**value))
            .map(|(field, _)| field.clone())
            .collect()
    }
}

impl FromIterator<(String, f64)> for EndpointValues {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Capability bitmask reported per endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const THERMOSTAT_COOL: u32 = 0x0000_0100;
    pub const THERMOSTAT_HEAT: u32 = 0x0000_0200;

    pub fn can_cool(&self) -> bool {
        self.0 & Self::THERMOSTAT_COOL != 0
    }

    pub fn can_heat(&self) -> bool {
        self.0 & Self::THERMOSTAT_HEAT != 0
    }
}

/// Home (scope) as returned by the cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Home {
    pub home_id: HomeId,
    pub description: String,
}

/// One controllable HVAC endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub endpoint_id: EndpointId,
    pub home_id: HomeId,
    /// Physical serial; immutable for the lifetime of the device
    pub address: String,
    pub description: String,
    pub device_model: String,
    pub firmware_version: String,
    pub is_online: bool,
    pub endpoint_type: i64,
    pub capabilities: Capabilities,
    /// Static parameters such as `SetpointMinC` / `SetpointMaxC`
    pub parameters: BTreeMap<String, f64>,
    /// The only part that changes after creation
    pub values: EndpointValues,
}

impl Device {
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }
}

/// Remote collaborator performing one authenticated exchange per call
///
/// Implementations are expected to re-authenticate and retry once on an
/// expired session, surfacing [`crate::error::GatewayError::Auth`] only
/// when logging in again fails.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Enumerate the homes visible to the account
    async fn list_homes(&self) -> GatewayResult<Vec<Home>>;

    /// Fetch the full snapshot of every device in a home
    async fn fetch_snapshot(&self, home_id: HomeId) -> GatewayResult<Vec<Device>>;

    /// Send a full-state command to one endpoint
    async fn send_command(
        &self,
        endpoint_id: EndpointId,
        payload: &EndpointValues,
    ) -> GatewayResult<()>;
}
