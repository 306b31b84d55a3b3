//! Mock implementations for testing
//!
//! [`MockGateway`] behaves like a small in-memory cloud: snapshots are served
//! from a table, accepted commands are applied to that table, and delays or
//! failures can be injected per operation.

use crate::client::{
    fields, mode, Capabilities, Device, EndpointId, EndpointValues, Gateway, Home, HomeId,
};
use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Thermostat device in AUTO with both setpoints at `temp`
pub fn test_device(endpoint: i64, home: i64, temp: f64) -> Device {
    Device {
        endpoint_id: EndpointId(endpoint),
        home_id: HomeId(home),
        address: format!("00:1A:2B:{endpoint:02X}"),
        description: format!("Split {endpoint}"),
        device_model: "BGH-SMART".to_string(),
        firmware_version: "1.0.4".to_string(),
        is_online: true,
        endpoint_type: 1,
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

/// In-memory gateway with call counters
#[derive(Default)]
pub struct MockGateway {
    homes: Mutex<Vec<Home>>,
    snapshots: Mutex<HashMap<HomeId, Vec<Device>>>,
    commands: Mutex<Vec<(EndpointId, EndpointValues)>>,
    fetch_delay: Mutex<Duration>,
    send_delay: Mutex<Duration>,
    fetch_failure: Mutex<Option<GatewayError>>,
    send_failure: Mutex<Option<GatewayError>>,
    fetches: AtomicUsize,
    sends: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a home and its devices
    pub fn with_home(self, home_id: i64, devices: Vec<Device>) -> Self {
        self.homes.lock().unwrap().push(Home {
            home_id: HomeId(home_id),
            description: format!("Home {home_id}"),
        });
        self.snapshots.lock().unwrap().insert(HomeId(home_id), devices);
        self
    }

    pub fn with_fetch_delay(self, delay: Duration) -> Self {
        *self.fetch_delay.lock().unwrap() = delay;
        self
    }

    pub fn with_send_delay(self, delay: Duration) -> Self {
        *self.send_delay.lock().unwrap() = delay;
        self
    }

    /// Make every fetch fail until cleared with `None`
    pub fn fail_fetches(&self, error: Option<GatewayError>) {
        *self.fetch_failure.lock().unwrap() = error;
    }

    /// Make every send fail until cleared with `None`
    pub fn fail_sends(&self, error: Option<GatewayError>) {
        *self.send_failure.lock().unwrap() = error;
    }

    /// Change a device on the "server" side, as another client would
    pub fn set_server_value(&self, endpoint_id: EndpointId, field: &str, value: f64) {
        let mut snapshots = self.snapshots.lock().unwrap();
        for device in snapshots.values_mut().flatten() {
            if device.endpoint_id == endpoint_id {
                device.values.set(field, value);
            }
        }
    }

    /// Drop a device from its home's snapshot, as if it were unpaired
    pub fn remove_server_device(&self, endpoint_id: EndpointId) {
        let mut snapshots = self.snapshots.lock().unwrap();
        for devices in snapshots.values_mut() {
            devices.retain(|d| d.endpoint_id != endpoint_id);
        }
    }

    pub fn server_device(&self, endpoint_id: EndpointId) -> Option<Device> {
        self.snapshots
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|d| d.endpoint_id == endpoint_id)
            .cloned()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Commands accepted so far, in order
    pub fn commands(&self) -> Vec<(EndpointId, EndpointValues)> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn list_homes(&self) -> GatewayResult<Vec<Home>> {
        Ok(self.homes.lock().unwrap().clone())
    }

    async fn fetch_snapshot(&self, home_id: HomeId) -> GatewayResult<Vec<Device>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fetch_failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(&home_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_command(
        &self,
        endpoint_id: EndpointId,
        payload: &EndpointValues,
    ) -> GatewayResult<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.send_failure.lock().unwrap().clone() {
            return Err(error);
        }

        self.commands.lock().unwrap().push((endpoint_id, payload.clone()));
        let mut snapshots = self.snapshots.lock().unwrap();
        for device in snapshots.values_mut().flatten() {
            if device.endpoint_id == endpoint_id {
                for (field, value) in payload.iter() {
                    if value != mode::NO_CHANGE {
                        device.values.set(field, value);
                    }
                }
            }
        }
        Ok(())
    }
}
