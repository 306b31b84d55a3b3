//! Thermostat view of an endpoint
//!
//! Maps vendor modes to HomeKit-style heating/cooling states and exposes the
//! characteristics a home-automation host reads and writes. Writes go
//! through [`SyncEngine::queue_patch`] so they are debounced like any other
//! change.

use crate::client::{fields, mode, Capabilities, Device, EndpointId, EndpointValues};
use crate::engine::{DeviceStatus, SyncEngine};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const MANUFACTURER: &str = "BGH";
pub const DEFAULT_SETPOINT_MIN_C: f64 = 17.0;
pub const DEFAULT_SETPOINT_MAX_C: f64 = 30.0;
pub const SETPOINT_STEP_C: f64 = 1.0;

/// HomeKit target heating/cooling state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Off = 0,
    Heat = 1,
    Cool = 2,
    Auto = 3,
}

impl TargetState {
    /// Host-side state for a vendor mode
    ///
    /// DRY and FAN have no host equivalent and show as AUTO.
    pub fn from_vendor(vendor_mode: f64) -> Option<Self> {
        match vendor_mode {
            m if m == mode::OFF => Some(TargetState::Off),
            m if m == mode::COOL => Some(TargetState::Cool),
            m if m == mode::HEAT => Some(TargetState::Heat),
            m if m == mode::AUTO || m == mode::DRY || m == mode::FAN => Some(TargetState::Auto),
            _ => None,
        }
    }

    pub fn to_vendor(self) -> f64 {
        match self {
            TargetState::Off => mode::OFF,
            TargetState::Heat => mode::HEAT,
            TargetState::Cool => mode::COOL,
            TargetState::Auto => mode::AUTO,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TargetState::Off),
            1 => Some(TargetState::Heat),
            2 => Some(TargetState::Cool),
            3 => Some(TargetState::Auto),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl std::str::FromStr for TargetState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(TargetState::Off),
            "heat" => Ok(TargetState::Heat),
            "cool" => Ok(TargetState::Cool),
            "auto" => Ok(TargetState::Auto),
            other => Err(SyncError::invalid_input(format!("unknown mode '{other}'"))),
        }
    }
}

/// States an endpoint accepts given its capabilities
pub fn valid_target_states(capabilities: Capabilities) -> Vec<TargetState> {
    let mut states = vec![TargetState::Off];
    if capabilities.can_cool() {
        states.push(TargetState::Cool);
    }
    if capabilities.can_heat() {
        states.push(TargetState::Heat);
    }
    if capabilities.can_cool() && capabilities.can_heat() {
        states.push(TargetState::Auto);
    }
    states
}

/// Value of a characteristic, or a device that has not been loaded yet
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Reading<T> {
    Value(T),
    Initializing,
}

impl<T> Reading<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Reading::Value(value) => Some(value),
            Reading::Initializing => None,
        }
    }
}

/// Static identity shown to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessoryInfo {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub firmware_revision: String,
}

/// Inclusive setpoint range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetpointBounds {
    pub min: f64,
    pub max: f64,
}

impl SetpointBounds {
    pub fn for_device(device: &Device) -> Self {
        Self {
            min: device
                .parameter("SetpointMinC")
                .unwrap_or(DEFAULT_SETPOINT_MIN_C),
            max: device
                .parameter("SetpointMaxC")
                .unwrap_or(DEFAULT_SETPOINT_MAX_C),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

impl Default for SetpointBounds {
    fn default() -> Self {
        Self {
            min: DEFAULT_SETPOINT_MIN_C,
            max: DEFAULT_SETPOINT_MAX_C,
        }
    }
}

/// Thermostat adapter over one endpoint
#[derive(Debug, Clone)]
pub struct Thermostat {
    engine: SyncEngine,
    endpoint_id: EndpointId,
    info: AccessoryInfo,
    valid_states: Vec<TargetState>,
    bounds: SetpointBounds,
}

impl Thermostat {
    pub fn new(engine: SyncEngine, device: &Device) -> Self {
        Self {
            engine,
            endpoint_id: device.endpoint_id,
            info: AccessoryInfo {
                name: device.description.clone(),
                manufacturer: MANUFACTURER.to_string(),
                model: device.device_model.clone(),
                serial_number: device.address.clone(),
                firmware_revision: device.firmware_version.clone(),
            },
            valid_states: valid_target_states(device.capabilities),
            bounds: SetpointBounds::for_device(device),
        }
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    pub fn info(&self) -> &AccessoryInfo {
        &self.info
    }

    pub fn valid_target_states(&self) -> &[TargetState] {
        &self.valid_states
    }

    pub fn setpoint_bounds(&self) -> SetpointBounds {
        self.bounds
    }

    pub async fn target_state(&self) -> Result<Reading<TargetState>> {
        self.read(|values| {
            values
                .get(fields::MODE)
                .and_then(TargetState::from_vendor)
                .unwrap_or(TargetState::Off)
        })
        .await
    }

    pub fn set_target_state(&self, state: TargetState) -> Result<()> {
        if !self.valid_states.contains(&state) {
            return Err(SyncError::invalid_input(format!(
                "{} does not support {state:?}",
                self.info.name
            )));
        }
        info!("SET {} - TargetHeatingCoolingState @ {state:?}", self.info.name);
        self.queue(EndpointValues::new().with(fields::MODE, state.to_vendor()))
    }

    pub async fn target_temperature(&self) -> Result<Reading<f64>> {
        self.read(|values| values.get(fields::DESIRED_TEMP_C).unwrap_or(self.bounds.min))
            .await
    }

    pub fn set_target_temperature(&self, celsius: f64) -> Result<()> {
        let rounded = (celsius / SETPOINT_STEP_C).round() * SETPOINT_STEP_C;
        if !self.bounds.contains(rounded) {
            return Err(SyncError::invalid_input(format!(
                "{celsius}°C outside {}..={}",
                self.bounds.min, self.bounds.max
            )));
        }
        info!("SET {} - TargetTemperature @ {rounded}", self.info.name);
        self.queue(EndpointValues::new().with(fields::DESIRED_TEMP_C, rounded))
    }

    pub async fn current_temperature(&self) -> Result<Reading<f64>> {
        self.read(|values| values.get(fields::CURRENT_TEMP).unwrap_or_default())
            .await
    }

    async fn read<T>(&self, extract: impl FnOnce(&EndpointValues) -> T) -> Result<Reading<T>> {
        Ok(match self.engine.get_status(self.endpoint_id, false).await? {
            DeviceStatus::Ready(device) => Reading::Value(extract(&device.values)),
            DeviceStatus::Initializing => Reading::Initializing,
        })
    }

    fn queue(&self, patch: EndpointValues) -> Result<()> {
        if self.engine.queue_patch(self.endpoint_id, patch) {
            Ok(())
        } else {
            Err(SyncError::not_found(format!("endpoint {}", self.endpoint_id)))
        }
    }
}
