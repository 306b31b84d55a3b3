//! Common test utilities

#![allow(dead_code)]

pub mod fake_gateway;
pub mod solidmation_mock;

use bgh_smart_sync::client::{fields, mode, Capabilities, Device, EndpointId, EndpointValues, HomeId};
use bgh_smart_sync::config::{EngineConfig, SolidmationConfig};
use std::collections::BTreeMap;

/// A cool/heat split unit in AUTO at `temp` degrees
pub fn split_unit(endpoint: i64, home: i64, temp: f64) -> Device {
    Device {
        endpoint_id: EndpointId(endpoint),
        home_id: HomeId(home),
        address: format!("A4:CF:12:00:00:{endpoint:02X}"),
        description: format!("Split {endpoint}"),
        device_model: "BGH-SIAC".to_string(),
        firmware_version: "2.1.0".to_string(),
        is_online: true,
        endpoint_type: 20,
        capabilities: Capabilities(Capabilities::THERMOSTAT_COOL | Capabilities::THERMOSTAT_HEAT),
        parameters: BTreeMap::from([
            ("SetpointMinC".to_string(), 17.0),
            ("SetpointMaxC".to_string(), 30.0),
        ]),
        values: EndpointValues::new()
            .with(fields::MODE, mode::AUTO)
            .with(fields::CURRENT_TEMP, temp)
            .with(fields::DESIRED_TEMP_C, temp)
            .with(fields::FAN_MODE, 1.0)
            .with(fields::SWING_MODE, 0.0)
            .with(fields::FLAGS, 0.0),
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig::default()
}

pub fn solidmation_config(base_url: &str) -> SolidmationConfig {
    SolidmationConfig {
        email: "user@example.com".to_string(),
        password: "hunter2".to_string(),
        base_url: Some(base_url.parse().expect("mock server URL")),
        ..Default::default()
    }
}
