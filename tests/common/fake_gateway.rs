//! Scriptable in-memory gateway for engine-level integration tests

use bgh_smart_sync::client::{Device, EndpointId, EndpointValues, Gateway, Home, HomeId};
use bgh_smart_sync::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Gateway serving fixed homes with a scripted queue of fetch outcomes
#[derive(Default)]
pub struct FakeGateway {
    homes: Mutex<Vec<Home>>,
    devices: Mutex<HashMap<HomeId, Vec<Device>>>,
    scripted_fetches: Mutex<VecDeque<GatewayResult<()>>>,
    sent: Mutex<Vec<(EndpointId, EndpointValues)>>,
    latency: Mutex<Duration>,
    fetches: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_home(self, id: i64, description: &str, devices: Vec<Device>) -> Self {
        self.homes.lock().unwrap().push(Home {
            home_id: HomeId(id),
            description: description.to_string(),
        });
        self.devices.lock().unwrap().insert(HomeId(id), devices);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = latency;
        self
    }

    /// Queue the outcome of the next fetch; unscripted fetches succeed
    pub fn script_fetch(&self, outcome: GatewayResult<()>) {
        self.scripted_fetches.lock().unwrap().push_back(outcome);
    }

    pub fn update(&self, endpoint_id: EndpointId, field: &str, value: f64) {
        for device in self.devices.lock().unwrap().values_mut().flatten() {
            if device.endpoint_id == endpoint_id {
                device.values.set(field, value);
            }
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(EndpointId, EndpointValues)> {
        self.sent.lock().unwrap().clone()
    }

    async fn wait(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn list_homes(&self) -> GatewayResult<Vec<Home>> {
        Ok(self.homes.lock().unwrap().clone())
    }

    async fn fetch_snapshot(&self, home_id: HomeId) -> GatewayResult<Vec<Device>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if let Some(Err(e)) = self.scripted_fetches.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.devices
            .lock()
            .unwrap()
            .get(&home_id)
            .cloned()
            .ok_or_else(|| GatewayError::unknown(format!("no home {home_id}")))
    }

    async fn send_command(
        &self,
        endpoint_id: EndpointId,
        payload: &EndpointValues,
    ) -> GatewayResult<()> {
        self.wait().await;
        self.sent.lock().unwrap().push((endpoint_id, payload.clone()));
        for device in self.devices.lock().unwrap().values_mut().flatten() {
            if device.endpoint_id == endpoint_id {
                device.values.merge(payload);
            }
        }
        Ok(())
    }
}
