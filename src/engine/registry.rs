//! In-memory table of last-known device state
//!
//! Every operation takes the lock once and releases it before returning, so
//! readers never observe a half-applied patch or snapshot.

use crate::client::{Device, EndpointId, EndpointValues, HomeId};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, trace, warn};

/// Device registry keyed by endpoint
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<EndpointId, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current copy of a device; `None` means "not loaded yet"
    pub fn get(&self, endpoint_id: EndpointId) -> Option<Device> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint_id)
            .cloned()
    }

    /// Home a device belongs to
    pub fn home_of(&self, endpoint_id: EndpointId) -> Option<HomeId> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint_id)
            .map(|d| d.home_id)
    }

    /// Replace the devices of a home from a fresh snapshot
    ///
    /// Devices of the home missing from the snapshot are kept as they were.
    /// Snapshot entries tagged with another home, or whose endpoint is
    /// already owned by another home, are skipped.
    /// Returns the number of devices seen for the first time.
    pub fn upsert(&self, home_id: HomeId, snapshot: &[Device]) -> usize {
        self.upsert_with_pending(home_id, snapshot, &HashMap::new())
    }

    /// Like [`upsert`](Self::upsert), then re-apply still-pending patches in
    /// the same critical section
    pub fn upsert_with_pending(
        &self,
        home_id: HomeId,
        snapshot: &[Device],
        pending: &HashMap<EndpointId, EndpointValues>,
    ) -> usize {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;

        for device in snapshot {
            if device.home_id != home_id {
                warn!(
                    "Snapshot for home {home_id} carried endpoint {} of home {}, ignoring it",
                    device.endpoint_id,
                    device.home_id
                );
                continue;
            }
            // An entry stays with the home that first reported it
            if let Some(owner) = devices
                .get(&device.endpoint_id)
                .map(|d| d.home_id)
                .filter(|owner| *owner != home_id)
            {
                warn!(
                    "Endpoint {} already belongs to home {owner}, ignoring copy from home {home_id}",
                    device.endpoint_id
                );
                continue;
            }
            trace!("Upserting endpoint {}", device.endpoint_id);
            let mut device = device.clone();
            if let Some(patch) = pending.get(&device.endpoint_id) {
                device.values.merge(patch);
            }
            if devices.insert(device.endpoint_id, device).is_none() {
                added += 1;
            }
        }

        debug!(
            "Upserted {} devices for home {home_id} ({added} new)",
            snapshot.len()
        );
        added
    }

    /// Merge fields into a device's values; `false` if the device is unknown
    pub fn patch(&self, endpoint_id: EndpointId, fields: &EndpointValues) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        match devices.get_mut(&endpoint_id) {
            Some(device) => {
                device.values.merge(fields);
                true
            }
            None => false,
        }
    }

    /// Overwrite a device's values entirely
    pub fn replace_values(&self, endpoint_id: EndpointId, values: EndpointValues) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        match devices.get_mut(&endpoint_id) {
            Some(device) => {
                device.values = values;
                true
            }
            None => false,
        }
    }

    /// All known devices, ordered by endpoint
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.endpoint_id);
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every device
    pub fn clear(&self) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fields;
    use crate::mock::test_device;

    #[test]
    fn test_get_unknown_is_none() {
        let registry = DeviceRegistry::new();
        assert!(registry.get(EndpointId(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_upsert_preserves_absent_devices() {
        let registry = DeviceRegistry::new();
        let a = test_device(1, 10, 20.0);
        let b = test_device(2, 10, 21.0);
        assert_eq!(registry.upsert(HomeId(10), &[a.clone(), b.clone()]), 2);

        let mut a2 = a.clone();
        a2.values.set(fields::DESIRED_TEMP_C, 25.0);
        assert_eq!(registry.upsert(HomeId(10), &[a2]), 0);

        assert_eq!(
            registry.get(EndpointId(1)).unwrap().values.get(fields::DESIRED_TEMP_C),
            Some(25.0)
        );
        assert_eq!(registry.get(EndpointId(2)), Some(b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_upsert_keeps_pending_intent() {
        let registry = DeviceRegistry::new();
        let pending = HashMap::from([(
            EndpointId(1),
            EndpointValues::new().with(fields::DESIRED_TEMP_C, 24.0),
        )]);

        registry.upsert_with_pending(HomeId(10), &[test_device(1, 10, 20.0)], &pending);
        let device = registry.get(EndpointId(1)).unwrap();
        assert_eq!(device.values.get(fields::DESIRED_TEMP_C), Some(24.0));
        assert_eq!(device.values.get(fields::CURRENT_TEMP), Some(20.0));
    }

    #[test]
    fn test_upsert_never_crosses_homes() {
        let registry = DeviceRegistry::new();
        registry.upsert(HomeId(10), &[test_device(1, 10, 20.0)]);

        // Mis-tagged entry in another home's snapshot
        assert_eq!(registry.upsert(HomeId(20), &[test_device(1, 10, 30.0), test_device(2, 20, 22.0)]), 1);
        // Same endpoint id reported by a second home
        assert_eq!(registry.upsert(HomeId(20), &[test_device(1, 20, 31.0)]), 0);

        let device = registry.get(EndpointId(1)).unwrap();
        assert_eq!(device.home_id, HomeId(10));
        assert_eq!(device.values.get(fields::DESIRED_TEMP_C), Some(20.0));
        assert_eq!(registry.home_of(EndpointId(2)), Some(HomeId(20)));
    }

    #[test]
    fn test_patch_merges_fields() {
        let registry = DeviceRegistry::new();
        registry.upsert(HomeId(10), &[test_device(1, 10, 20.0)]);

        assert!(registry.patch(
            EndpointId(1),
            &EndpointValues::new().with(fields::DESIRED_TEMP_C, 23.0)
        ));
        let device = registry.get(EndpointId(1)).unwrap();
        assert_eq!(device.values.get(fields::DESIRED_TEMP_C), Some(23.0));
        assert_eq!(device.values.get(fields::CURRENT_TEMP), Some(20.0));

        assert!(!registry.patch(EndpointId(99), &EndpointValues::new()));
    }

    #[test]
    fn test_replace_values_and_clear() {
        let registry = DeviceRegistry::new();
        registry.upsert(HomeId(10), &[test_device(1, 10, 20.0)]);
        let values = EndpointValues::new().with(fields::MODE, 0.0);

        assert!(registry.replace_values(EndpointId(1), values.clone()));
        assert_eq!(registry.get(EndpointId(1)).unwrap().values, values);
        assert_eq!(registry.home_of(EndpointId(1)), Some(HomeId(10)));

        registry.clear();
        assert!(registry.list().is_empty());
    }
}
