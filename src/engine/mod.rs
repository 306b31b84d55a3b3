//! Device sync engine
//!
//! [`SyncEngine`] owns the registry, the freshness record, the in-flight
//! refresh tokens and the command buffers. It is a cheap cloneable handle;
//! every clone drives the same state.

pub mod commands;
pub mod freshness;
pub mod refresh;
pub mod registry;

pub use commands::{
    BufferState, CommandCoalescer, CommandDispatcher, CommandMetrics, DispatchEvent,
    DispatchOutcome,
};
pub use freshness::{FreshnessCache, FreshnessStats};
pub use refresh::{RefreshCoordinator, RefreshMetrics};
pub use registry::DeviceRegistry;

use crate::client::{Device, EndpointId, EndpointValues, Gateway, Home, HomeId};
use crate::config::EngineConfig;
use crate::error::{GatewayError, GatewayResult, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Server snapshot of one home as returned by a refresh
pub type Snapshot = Arc<Vec<Device>>;

/// Result of a status read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "device", rename_all = "snake_case")]
pub enum DeviceStatus {
    Ready(Device),
    /// The device has not been loaded yet
    Initializing,
}

impl DeviceStatus {
    pub fn device(&self) -> Option<&Device> {
        match self {
            DeviceStatus::Ready(device) => Some(device),
            DeviceStatus::Initializing => None,
        }
    }

    pub fn into_device(self) -> Option<Device> {
        match self {
            DeviceStatus::Ready(device) => Some(device),
            DeviceStatus::Initializing => None,
        }
    }
}

/// Engine counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineMetrics {
    pub devices: usize,
    pub homes: usize,
    pub refresh: RefreshMetrics,
    pub freshness: FreshnessStats,
    pub commands: CommandMetrics,
}

struct EngineInner {
    gateway: Arc<dyn Gateway>,
    config: EngineConfig,
    registry: DeviceRegistry,
    freshness: FreshnessCache,
    refresh: Arc<RefreshCoordinator<HomeId, Snapshot>>,
    commands: Arc<CommandCoalescer>,
    homes: RwLock<Vec<Home>>,
    events: broadcast::Sender<DispatchEvent>,
}

/// Sync engine handle
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.inner.config)
            .field("devices", &self.inner.registry.len())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(gateway: Arc<dyn Gateway>, config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(EngineInner {
                gateway,
                registry: DeviceRegistry::new(),
                freshness: FreshnessCache::new(config.cache_window),
                refresh: Arc::new(RefreshCoordinator::new()),
                commands: Arc::new(CommandCoalescer::new(config.debounce_window)),
                homes: RwLock::new(Vec::new()),
                events,
                config,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Load the account's homes and a snapshot of each
    ///
    /// When `filter` is non-empty only homes whose description matches one
    /// of its entries (case-insensitively) are kept. Returns the number of
    /// devices known afterwards.
    pub async fn discover(&self, filter: &[String]) -> Result<usize> {
        let mut homes = self.inner.gateway.list_homes().await?;
        if !filter.is_empty() {
            homes.retain(|home| {
                filter
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(&home.description))
            });
        }
        info!("Discovered {} homes", homes.len());

        let refreshes = homes.iter().map(|home| self.refresh_home(home.home_id));
        for result in futures::future::join_all(refreshes).await {
            result?;
        }

        *self.inner.homes.write().unwrap_or_else(PoisonError::into_inner) = homes;
        Ok(self.inner.registry.len())
    }

    /// Current state of a device
    ///
    /// Serves the registry copy while the device's home is fresh; otherwise
    /// refreshes the home first, sharing any refresh already in flight.
    pub async fn get_status(&self, endpoint_id: EndpointId, force_refresh: bool) -> Result<DeviceStatus> {
        let Some(home_id) = self.inner.registry.home_of(endpoint_id) else {
            debug!("Endpoint {endpoint_id} not loaded yet");
            return Ok(DeviceStatus::Initializing);
        };

        if !force_refresh && self.inner.freshness.is_fresh(home_id) {
            return Ok(self.registry_status(endpoint_id));
        }

        self.refresh_home(home_id).await?;
        Ok(self.registry_status(endpoint_id))
    }

    /// Record a change locally and schedule it for sending
    ///
    /// Returns `false` (and buffers nothing) when the device is unknown.
    pub fn queue_patch(&self, endpoint_id: EndpointId, patch: EndpointValues) -> bool {
        // Registry write and buffering happen under the buffer lock, so a
        // concurrent refresh sees either both or neither
        let registry = &self.inner.registry;
        let queued = self
            .inner
            .commands
            .queue_with(endpoint_id, patch, self.clone(), |patch| {
                registry.patch(endpoint_id, patch)
            });
        if !queued {
            warn!("Dropping patch for unknown endpoint {endpoint_id}");
        }
        queued
    }

    /// Dispatch every buffered command now instead of waiting for its timer
    pub async fn flush_pending(&self) -> Vec<DispatchEvent> {
        let drained = self.inner.commands.drain();
        if drained.is_empty() {
            return Vec::new();
        }
        info!("Flushing {} pending commands", drained.len());

        let dispatches = drained.into_iter().map(|(endpoint_id, requested)| async move {
            let event = self.dispatch_and_publish(endpoint_id, requested).await;
            self.inner.commands.finish(endpoint_id, &event.outcome);
            event
        });
        futures::future::join_all(dispatches).await
    }

    pub fn buffer_state(&self, endpoint_id: EndpointId) -> BufferState {
        self.inner.commands.state_of(endpoint_id)
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.inner.registry.list()
    }

    pub fn list_homes(&self) -> Vec<Home> {
        self.inner
            .homes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget every device, pending command and freshness stamp
    pub fn remove_all_devices(&self) {
        let discarded = self.inner.commands.discard_all();
        self.inner.registry.clear();
        self.inner.freshness.invalidate_all();
        info!("Removed all devices ({discarded} pending commands discarded)");
    }

    /// Feed of dispatch outcomes
    pub fn subscribe_dispatches(&self) -> broadcast::Receiver<DispatchEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            devices: self.inner.registry.len(),
            homes: self
                .inner
                .homes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            refresh: self.inner.refresh.metrics(),
            freshness: self.inner.freshness.stats(),
            commands: self.inner.commands.metrics(),
        }
    }

    fn registry_status(&self, endpoint_id: EndpointId) -> DeviceStatus {
        self.inner
            .registry
            .get(endpoint_id)
            .map_or(DeviceStatus::Initializing, DeviceStatus::Ready)
    }

    /// Refresh a home, joining the refresh already in flight if any
    async fn refresh_home(&self, home_id: HomeId) -> GatewayResult<Snapshot> {
        let engine = self.clone();
        self.inner
            .refresh
            .run(home_id, move || async move { engine.fetch_home(home_id).await })
            .await
    }

    async fn fetch_home(&self, home_id: HomeId) -> GatewayResult<Snapshot> {
        let devices = self.inner.gateway.fetch_snapshot(home_id).await?;
        let added = self.inner.commands.with_pending(|pending| {
            self.inner
                .registry
                .upsert_with_pending(home_id, &devices, pending)
        });
        if added > 0 {
            info!("Home {home_id}: {added} new devices");
        }
        self.inner.freshness.mark_refreshed(home_id);
        Ok(Arc::new(devices))
    }

    async fn dispatch_command(&self, endpoint_id: EndpointId, requested: EndpointValues) -> DispatchOutcome {
        let Some(home_id) = self.inner.registry.home_of(endpoint_id) else {
            warn!("Endpoint {endpoint_id} vanished before its command was sent");
            return DispatchOutcome::Skipped;
        };

        let snapshot = match self.refresh_home(home_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!("Refresh before command to endpoint {endpoint_id} failed: {error}");
                return DispatchOutcome::Failed { error };
            }
        };
        // Diff against server truth; the registry copy holds the optimistic patch
        let Some(current) = snapshot
            .iter()
            .find(|d| d.endpoint_id == endpoint_id)
            .map(|d| d.values.clone())
        else {
            warn!("Endpoint {endpoint_id} missing from home {home_id} snapshot, command not sent");
            return DispatchOutcome::Failed {
                error: GatewayError::unknown(format!(
                    "endpoint {endpoint_id} missing from snapshot"
                )),
            };
        };

        let modified = requested.modified_keys(&current);
        if modified.is_empty() {
            debug!("Command to endpoint {endpoint_id} changes nothing, not sending");
            return DispatchOutcome::Suppressed;
        }

        let payload = commands::build_payload(&current, &requested);
        self.inner.commands.with_pending(|pending| {
            let mut local = current;
            local.merge(&payload);
            if let Some(newer) = pending.get(&endpoint_id) {
                local.merge(newer);
            }
            self.inner.registry.replace_values(endpoint_id, local);
        });

        info!("Sending command to endpoint {endpoint_id}, modified: {modified:?}");
        match self.inner.gateway.send_command(endpoint_id, &payload).await {
            Ok(()) => {
                self.inner.freshness.invalidate_all();
                DispatchOutcome::Sent { payload, modified }
            }
            Err(error) => {
                warn!("Command to endpoint {endpoint_id} failed: {error}");
                DispatchOutcome::Failed { error }
            }
        }
    }

    async fn dispatch_and_publish(&self, endpoint_id: EndpointId, requested: EndpointValues) -> DispatchEvent {
        let outcome = self.dispatch_command(endpoint_id, requested).await;
        let event = DispatchEvent {
            endpoint_id,
            at: Utc::now(),
            outcome,
        };
        // No subscribers is fine
        let _ = self.inner.events.send(event.clone());
        event
    }
}

#[async_trait]
impl CommandDispatcher for SyncEngine {
    async fn dispatch(&self, endpoint_id: EndpointId, requested: EndpointValues) -> DispatchOutcome {
        self.dispatch_and_publish(endpoint_id, requested).await.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{fields, mode};
    use crate::error::GatewayError;
    use crate::mock::{test_device, MockGateway};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn engine_with(gateway: Arc<MockGateway>) -> SyncEngine {
        SyncEngine::new(gateway, EngineConfig::default())
    }

    async fn discovered(gateway: MockGateway) -> (Arc<MockGateway>, SyncEngine) {
        let gateway = Arc::new(gateway);
        let engine = engine_with(gateway.clone());
        engine.discover(&[]).await.unwrap();
        (gateway, engine)
    }

    fn desired(engine_status: &DeviceStatus) -> Option<f64> {
        engine_status
            .device()
            .and_then(|d| d.values.get(fields::DESIRED_TEMP_C))
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_is_initializing() {
        let engine = engine_with(Arc::new(MockGateway::new()));
        let status = engine.get_status(EndpointId(1), false).await.unwrap();
        assert_eq!(status, DeviceStatus::Initializing);
        assert!(!engine.queue_patch(EndpointId(1), EndpointValues::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_applies_home_filter() {
        let gateway = Arc::new(
            MockGateway::new()
                .with_home(1, vec![test_device(10, 1, 20.0)])
                .with_home(2, vec![test_device(20, 2, 20.0)]),
        );
        let engine = engine_with(gateway.clone());

        let count = engine.discover(&["home 2".to_string()]).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(engine.list_homes().len(), 1);
        assert_eq!(engine.list_devices()[0].endpoint_id, EndpointId(20));
        assert_eq!(gateway.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_read_does_not_fetch() {
        let (gateway, engine) =
            discovered(MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0)])).await;

        tokio::time::advance(Duration::from_millis(4999)).await;
        engine.get_status(EndpointId(10), false).await.unwrap();
        assert_eq!(gateway.fetch_count(), 1);

        tokio::time::advance(Duration::from_millis(2)).await;
        engine.get_status(EndpointId(10), false).await.unwrap();
        assert_eq!(gateway.fetch_count(), 2);

        engine.get_status(EndpointId(10), true).await.unwrap();
        assert_eq!(gateway.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stale_reads_share_one_fetch() {
        let (gateway, engine) = discovered(
            MockGateway::new()
                .with_home(1, vec![test_device(10, 1, 20.0), test_device(11, 1, 21.0)])
                .with_fetch_delay(Duration::from_millis(200)),
        )
        .await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let reads = (0..10).map(|i| engine.get_status(EndpointId(10 + i % 2), false));
        let results = futures::future::join_all(reads).await;

        assert_eq!(gateway.fetch_count(), 2);
        assert!(results.iter().all(|r| matches!(r, Ok(DeviceStatus::Ready(_)))));
        assert_eq!(engine.metrics().refresh.joined, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_reaches_all_readers_and_keeps_state() {
        let (gateway, engine) = discovered(
            MockGateway::new()
                .with_home(1, vec![test_device(10, 1, 20.0)])
                .with_fetch_delay(Duration::from_millis(100)),
        )
        .await;
        tokio::time::advance(Duration::from_secs(6)).await;
        gateway.fail_fetches(Some(GatewayError::network("timeout")));

        let (a, b) = tokio::join!(
            engine.get_status(EndpointId(10), false),
            engine.get_status(EndpointId(10), false)
        );
        assert!(a.unwrap_err().is_retryable());
        assert!(b.unwrap_err().is_retryable());
        assert_eq!(gateway.fetch_count(), 2);

        // Registry untouched, freshness not stamped
        assert_eq!(engine.list_devices(), vec![test_device(10, 1, 20.0)]);
        gateway.fail_fetches(None);
        engine.get_status(EndpointId(10), false).await.unwrap();
        assert_eq!(gateway.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_sends_one_command_with_last_value() {
        let (gateway, engine) =
            discovered(MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0)])).await;
        let mut events = engine.subscribe_dispatches();
        let id = EndpointId(10);

        assert!(engine.queue_patch(id, EndpointValues::new().with(fields::DESIRED_TEMP_C, 22.0)));
        let status = engine.get_status(id, false).await.unwrap();
        assert_eq!(desired(&status), Some(22.0));

        tokio::time::sleep(Duration::from_millis(500)).await;
        engine.queue_patch(id, EndpointValues::new().with(fields::DESIRED_TEMP_C, 23.0));
        assert_eq!(engine.buffer_state(id), BufferState::Buffering);

        let event = events.recv().await.unwrap();
        assert_eq!(event.endpoint_id, id);
        match event.outcome {
            DispatchOutcome::Sent { payload, modified } => {
                assert_eq!(modified, vec![fields::DESIRED_TEMP_C.to_string()]);
                assert_eq!(payload.get(fields::DESIRED_TEMP_C), Some(23.0));
                assert_eq!(payload.get(fields::CURRENT_TEMP), None);
                assert_eq!(payload.get(fields::SWING_MODE), None);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let commands = gateway.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].1.get(fields::DESIRED_TEMP_C), Some(23.0));

        let status = engine.get_status(id, false).await.unwrap();
        assert_eq!(desired(&status), Some(23.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_matching_server_state_is_suppressed() {
        let (gateway, engine) =
            discovered(MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0)])).await;
        let mut events = engine.subscribe_dispatches();

        engine.queue_patch(
            EndpointId(10),
            EndpointValues::new().with(fields::DESIRED_TEMP_C, 20.0),
        );
        let event = events.recv().await.unwrap();
        assert_eq!(event.outcome, DispatchOutcome::Suppressed);
        assert_eq!(gateway.send_count(), 0);
        assert_eq!(engine.metrics().commands.suppressed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turning_off_forces_no_change_fields() {
        let (gateway, engine) =
            discovered(MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0)])).await;
        let mut events = engine.subscribe_dispatches();

        let off = EndpointValues::new().with(fields::MODE, mode::OFF);
        engine.queue_patch(EndpointId(10), off.clone());
        engine.queue_patch(EndpointId(10), off);
        events.recv().await.unwrap();

        let commands = gateway.commands();
        assert_eq!(commands.len(), 1);
        let payload = &commands[0].1;
        assert_eq!(payload.get(fields::MODE), Some(mode::OFF));
        assert_eq!(payload.get(fields::FAN_MODE), Some(mode::NO_CHANGE));
        assert_eq!(payload.get(fields::FLAGS), Some(mode::NO_CHANGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_diff_uses_server_truth() {
        let (gateway, engine) =
            discovered(MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0)])).await;
        let mut events = engine.subscribe_dispatches();

        // Another client already set 24 on the server
        gateway.set_server_value(EndpointId(10), fields::DESIRED_TEMP_C, 24.0);
        engine.queue_patch(
            EndpointId(10),
            EndpointValues::new().with(fields::DESIRED_TEMP_C, 24.0),
        );
        assert_eq!(
            events.recv().await.unwrap().outcome,
            DispatchOutcome::Suppressed
        );
        assert_eq!(gateway.send_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_missing_from_snapshot_fails_command() {
        let (gateway, engine) = discovered(
            MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0), test_device(11, 1, 20.0)]),
        )
        .await;
        let mut events = engine.subscribe_dispatches();
        let id = EndpointId(10);

        engine.queue_patch(id, EndpointValues::new().with(fields::DESIRED_TEMP_C, 25.0));
        gateway.remove_server_device(id);

        let event = events.recv().await.unwrap();
        assert!(matches!(event.outcome, DispatchOutcome::Failed { .. }));
        assert_eq!(gateway.send_count(), 0);
        assert_eq!(engine.metrics().commands.failed, 1);
        assert_eq!(engine.metrics().commands.suppressed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_keeps_optimistic_values() {
        let (gateway, engine) =
            discovered(MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0)])).await;
        let mut events = engine.subscribe_dispatches();
        gateway.fail_sends(Some(GatewayError::rejected("endpoint busy")));

        engine.queue_patch(
            EndpointId(10),
            EndpointValues::new().with(fields::DESIRED_TEMP_C, 26.0),
        );
        let event = events.recv().await.unwrap();
        assert_eq!(
            event.outcome,
            DispatchOutcome::Failed {
                error: GatewayError::rejected("endpoint busy")
            }
        );

        let device = engine.list_devices().remove(0);
        assert_eq!(device.values.get(fields::DESIRED_TEMP_C), Some(26.0));
        assert_eq!(engine.metrics().commands.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_during_buffering_keeps_intent() {
        let (_gateway, engine) =
            discovered(MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0)])).await;

        engine.queue_patch(
            EndpointId(10),
            EndpointValues::new().with(fields::DESIRED_TEMP_C, 25.0),
        );
        let status = engine.get_status(EndpointId(10), true).await.unwrap();
        assert_eq!(desired(&status), Some(25.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_pending_dispatches_immediately() {
        let (gateway, engine) = discovered(
            MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0), test_device(11, 1, 20.0)]),
        )
        .await;

        engine.queue_patch(EndpointId(10), EndpointValues::new().with(fields::DESIRED_TEMP_C, 21.0));
        engine.queue_patch(EndpointId(11), EndpointValues::new().with(fields::DESIRED_TEMP_C, 20.0));

        let events = engine.flush_pending().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].outcome, DispatchOutcome::Sent { .. }));
        assert_eq!(events[1].outcome, DispatchOutcome::Suppressed);
        assert_eq!(gateway.send_count(), 1);

        // Timers were cancelled
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(gateway.send_count(), 1);
        assert_eq!(engine.buffer_state(EndpointId(10)), BufferState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_all_devices() {
        let (gateway, engine) =
            discovered(MockGateway::new().with_home(1, vec![test_device(10, 1, 20.0)])).await;
        engine.queue_patch(EndpointId(10), EndpointValues::new().with(fields::MODE, mode::COOL));

        engine.remove_all_devices();
        assert!(engine.list_devices().is_empty());
        assert_eq!(
            engine.get_status(EndpointId(10), false).await.unwrap(),
            DeviceStatus::Initializing
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(gateway.send_count(), 0);
    }
}
