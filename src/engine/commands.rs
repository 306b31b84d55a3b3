//! Per-device debounced command buffers
//!
//! Each patch restarts the device's quiet period. When the period elapses
//! without another patch, the buffer is taken out of the table (so later
//! patches start a new one) and its merged contents go to a
//! [`CommandDispatcher`].

use crate::client::{fields, mode, EndpointId, EndpointValues};
use crate::error::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What happened to one dispatched buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A command went upstream
    Sent {
        payload: EndpointValues,
        modified: Vec<String>,
    },
    /// Nothing differed from the current state
    Suppressed,
    /// The device is not (or no longer) in the registry
    Skipped,
    /// The refresh or the send failed; local state keeps the optimistic values
    Failed { error: GatewayError },
}

/// Dispatch result as published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub endpoint_id: EndpointId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

/// Where buffer state stands for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferState {
    Idle,
    Buffering,
    Dispatching,
}

/// Counters for command coalescing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandMetrics {
    pub patches_queued: u64,
    pub dispatches: u64,
    pub sent: u64,
    pub suppressed: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Sends a merged buffer upstream
#[async_trait]
pub trait CommandDispatcher: Clone + Send + Sync + 'static {
    async fn dispatch(&self, endpoint_id: EndpointId, requested: EndpointValues)
        -> DispatchOutcome;
}

#[derive(Debug)]
struct PendingBuffer {
    patches: Vec<EndpointValues>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl PendingBuffer {
    fn merged(&self) -> EndpointValues {
        merge_patches(&self.patches)
    }
}

#[derive(Debug, Default)]
struct State {
    buffers: HashMap<EndpointId, PendingBuffer>,
    dispatching: HashMap<EndpointId, usize>,
    next_generation: u64,
    metrics: CommandMetrics,
}

/// Merge patches in arrival order; later patches win per field
pub fn merge_patches(patches: &[EndpointValues]) -> EndpointValues {
    patches.iter().fold(EndpointValues::new(), |mut merged, patch| {
        merged.merge(patch);
        merged
    })
}

/// Build the full-state command payload sent upstream
///
/// Read-only fields are dropped. When the unit is being switched off the
/// backend wants "no change" for fan mode and flags.
pub fn build_payload(current: &EndpointValues, requested: &EndpointValues) -> EndpointValues {
    let mut payload = current.clone();
    payload.merge(requested);

    for field in fields::READ_ONLY {
        payload.remove(field);
    }
    if payload.get(fields::MODE) == Some(mode::OFF) {
        payload.set(fields::FAN_MODE, mode::NO_CHANGE);
        payload.set(fields::FLAGS, mode::NO_CHANGE);
    }
    payload
}

/// Debounce buffers for every device
#[derive(Debug)]
pub struct CommandCoalescer {
    debounce: Duration,
    state: Mutex<State>,
}

impl CommandCoalescer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            state: Mutex::new(State::default()),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Buffer a patch and (re)arm the device's debounce timer
    pub fn queue<D: CommandDispatcher>(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        patch: EndpointValues,
        dispatcher: D,
    ) {
        self.queue_with(endpoint_id, patch, dispatcher, |_| true);
    }

    /// Like [`queue`](Self::queue), but only buffers when `apply` accepts the
    /// patch
    ///
    /// `apply` runs while the buffer table is locked, so it is ordered
    /// against [`with_pending`](Self::with_pending). Returns what `apply`
    /// returned.
    pub fn queue_with<D, F>(
        self: &Arc<Self>,
        endpoint_id: EndpointId,
        patch: EndpointValues,
        dispatcher: D,
        apply: F,
    ) -> bool
    where
        D: CommandDispatcher,
        F: FnOnce(&EndpointValues) -> bool,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !apply(&patch) {
            return false;
        }
        state.next_generation += 1;
        state.metrics.patches_queued += 1;
        let generation = state.next_generation;

        let buffer = state
            .buffers
            .entry(endpoint_id)
            .or_insert_with(|| PendingBuffer {
                patches: Vec::new(),
                generation,
                timer: None,
            });
        buffer.patches.push(patch);
        buffer.generation = generation;
        if let Some(previous) = buffer.timer.take() {
            previous.abort();
        }
        trace!(
            "Buffered patch #{} for endpoint {endpoint_id}",
            buffer.patches.len()
        );

        let coalescer = Arc::clone(self);
        let debounce = self.debounce;
        buffer.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(requested) = coalescer.take(endpoint_id, generation) {
                let outcome = dispatcher.dispatch(endpoint_id, requested).await;
                coalescer.finish(endpoint_id, &outcome);
            }
        }));
        true
    }

    /// Remove the buffer if it still belongs to `generation`
    fn take(&self, endpoint_id: EndpointId, generation: u64) -> Option<EndpointValues> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let current = state
            .buffers
            .get(&endpoint_id)
            .is_some_and(|b| b.generation == generation);
        if !current {
            return None;
        }

        let buffer = state.buffers.remove(&endpoint_id)?;
        *state.dispatching.entry(endpoint_id).or_default() += 1;
        state.metrics.dispatches += 1;
        debug!(
            "Dispatching {} buffered patches for endpoint {endpoint_id}",
            buffer.patches.len()
        );
        Some(buffer.merged())
    }

    /// Record a completed dispatch
    pub fn finish(&self, endpoint_id: EndpointId, outcome: &DispatchOutcome) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = match state.dispatching.get_mut(&endpoint_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if idle {
            state.dispatching.remove(&endpoint_id);
        }
        match outcome {
            DispatchOutcome::Sent { .. } => state.metrics.sent += 1,
            DispatchOutcome::Suppressed => state.metrics.suppressed += 1,
            DispatchOutcome::Skipped => state.metrics.skipped += 1,
            DispatchOutcome::Failed { .. } => state.metrics.failed += 1,
        }
    }

    /// Take every pending buffer now, cancelling their timers
    pub fn drain(&self) -> Vec<(EndpointId, EndpointValues)> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let buffers: Vec<(EndpointId, PendingBuffer)> = state.buffers.drain().collect();

        let mut drained = Vec::with_capacity(buffers.len());
        for (endpoint_id, mut buffer) in buffers {
            if let Some(timer) = buffer.timer.take() {
                timer.abort();
            }
            *state.dispatching.entry(endpoint_id).or_default() += 1;
            state.metrics.dispatches += 1;
            drained.push((endpoint_id, buffer.merged()));
        }
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    /// Drop every pending buffer without dispatching
    pub fn discard_all(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let count = state.buffers.len();
        for (_, buffer) in state.buffers.drain() {
            if let Some(timer) = buffer.timer {
                timer.abort();
            }
        }
        count
    }

    /// Merged intent still waiting for each device
    pub fn pending(&self) -> HashMap<EndpointId, EndpointValues> {
        self.with_pending(|pending| pending.clone())
    }

    /// Run `f` over the merged pending intent with the buffer table locked
    ///
    /// No patch can be queued until `f` returns. `f` must not call back into
    /// the coalescer.
    pub fn with_pending<R>(&self, f: impl FnOnce(&HashMap<EndpointId, EndpointValues>) -> R) -> R {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let pending: HashMap<EndpointId, EndpointValues> = state
            .buffers
            .iter()
            .map(|(id, buffer)| (*id, buffer.merged()))
            .collect();
        f(&pending)
    }

    /// Merged intent still waiting for one device
    pub fn pending_for(&self, endpoint_id: EndpointId) -> Option<EndpointValues> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buffers
            .get(&endpoint_id)
            .map(PendingBuffer::merged)
    }

    pub fn state_of(&self, endpoint_id: EndpointId) -> BufferState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.buffers.contains_key(&endpoint_id) {
            BufferState::Buffering
        } else if state.dispatching.contains_key(&endpoint_id) {
            BufferState::Dispatching
        } else {
            BufferState::Idle
        }
    }

    pub fn metrics(&self) -> CommandMetrics {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .clone()
    }
}
