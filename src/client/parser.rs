//! Parsing of Solidmation `GetDataPacket` / `EnumHomes` payloads
//!
//! A data packet lists endpoints, the physical devices they belong to and
//! the current values of each endpoint as `(ValueType, Value)` pairs. This
//! module joins the three lists into [`Device`] records.

use crate::client::{fields, Capabilities, Device, EndpointId, EndpointValues, Home, HomeId};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Vendor value type codes and the field name each maps to
const VALUE_TYPES: &[(i64, &str)] = &[
    (13, fields::FLAGS),
    (14, fields::MODE),
    (15, fields::FAN_MODE),
    (16, fields::SWING_MODE),
    (20, fields::CURRENT_TEMP),
    (21, fields::DESIRED_TEMP_C),
];

fn field_for_value_type(value_type: i64) -> Option<&'static str> {
    VALUE_TYPES
        .iter()
        .find(|(code, _)| *code == value_type)
        .map(|(_, name)| *name)
}

#[derive(Debug, Deserialize)]
pub struct EnumHomesResponse {
    #[serde(rename = "EnumHomesResult")]
    pub result: EnumHomesResult,
}

#[derive(Debug, Deserialize)]
pub struct EnumHomesResult {
    #[serde(rename = "Homes", default)]
    pub homes: Vec<RawHome>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawHome {
    #[serde(rename = "HomeID")]
    pub home_id: i64,
    #[serde(default)]
    pub description: String,
}

impl From<RawHome> for Home {
    fn from(raw: RawHome) -> Self {
        Home {
            home_id: HomeId(raw.home_id),
            description: raw.description,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DataPacketResponse {
    #[serde(rename = "GetDataPacketResult")]
    pub result: DataPacket,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataPacket {
    #[serde(default)]
    pub endpoints: Option<Vec<RawEndpoint>>,
    #[serde(default)]
    pub devices: Vec<RawDevice>,
    #[serde(default)]
    pub endpoint_values: Vec<RawEndpointValues>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawEndpoint {
    #[serde(rename = "EndpointID")]
    pub endpoint_id: i64,
    #[serde(rename = "HomeID", default)]
    pub home_id: Option<i64>,
    #[serde(rename = "DeviceID", default)]
    pub device_id: Option<i64>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub endpoint_type: i64,
    #[serde(default)]
    pub capabilities: u32,
    #[serde(default)]
    pub parameters: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawDevice {
    #[serde(rename = "DeviceID")]
    pub device_id: i64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub device_model: String,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub is_online: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawEndpointValues {
    #[serde(rename = "EndpointID")]
    pub endpoint_id: i64,
    #[serde(default)]
    pub values: Vec<RawValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RawValue {
    pub value_type: i64,
    pub value: Value,
}

/// Parse `key=value` parameter lists such as `SetpointMinC=17,SetpointMaxC=30`
pub fn parse_parameters(raw: &str) -> BTreeMap<String, f64> {
    raw.split([',', ';'])
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let value = value.trim().parse::<f64>().ok()?;
            Some((key.trim().to_string(), value))
        })
        .collect()
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn parse_values(raw: &[RawValue]) -> EndpointValues {
    raw.iter()
        .filter_map(|v| match field_for_value_type(v.value_type) {
            Some(field) => numeric(&v.value).map(|n| (field.to_string(), n)),
            None => {
                trace!("Ignoring unmapped value type {}", v.value_type);
                None
            }
        })
        .collect()
}

/// Join a data packet into devices; `home_id` fills in endpoints that omit it
pub fn parse_devices(packet: DataPacket, home_id: HomeId) -> Vec<Device> {
    let Some(endpoints) = packet.endpoints else {
        return Vec::new();
    };

    let devices: HashMap<i64, RawDevice> = packet
        .devices
        .into_iter()
        .map(|d| (d.device_id, d))
        .collect();
    let values: HashMap<i64, EndpointValues> = packet
        .endpoint_values
        .iter()
        .map(|ev| (ev.endpoint_id, parse_values(&ev.values)))
        .collect();

    endpoints
        .into_iter()
        .map(|endpoint| {
            let physical = endpoint.device_id.and_then(|id| devices.get(&id));
            Device {
                endpoint_id: EndpointId(endpoint.endpoint_id),
                home_id: endpoint.home_id.map(HomeId).unwrap_or(home_id),
                address: physical.map(|d| d.address.clone()).unwrap_or_default(),
                description: endpoint.description,
                device_model: physical.map(|d| d.device_model.clone()).unwrap_or_default(),
                firmware_version: physical
                    .map(|d| d.firmware_version.clone())
                    .unwrap_or_default(),
                is_online: physical.map(|d| d.is_online).unwrap_or(false),
                endpoint_type: endpoint.endpoint_type,
                capabilities: Capabilities(endpoint.capabilities),
                parameters: endpoint
                    .parameters
                    .as_deref()
                    .map(parse_parameters)
                    .unwrap_or_default(),
                values: values
                    .get(&endpoint.endpoint_id)
                    .cloned()
                    .unwrap_or_default(),
            }
        })
        .collect()
}

/// Render a command payload the way `HVACSetModes` expects it
///
/// Whole numbers go out as integers; the backend rejects `1.0` for enums.
pub fn command_body(endpoint_id: EndpointId, payload: &EndpointValues) -> serde_json::Map<String, Value> {
    let mut body = serde_json::Map::new();
    for (field, value) in payload.iter() {
        let json = if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
            Value::from(value as i64)
        } else {
            Value::from(value)
        };
        body.insert(field.to_string(), json);
    }
    body.insert("endpointID".to_string(), Value::from(endpoint_id.0));
    body
}
