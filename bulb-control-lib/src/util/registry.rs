//! Bridge between bulbs, discovery and the caller's registry.
//!
//! [`DeviceTracker`] is the single source of truth for which device ids are
//! being activated (pending) or are live (active). Discovery claims ids in it;
//! [`RegistryAdapter`] promotes and releases them as bulbs register and
//! unregister. Both go through the same mutex.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::runtime::Handle;

use crate::control_interface::{Bulb, BulbConfig};
use crate::error::{BulbError, Result};
use crate::util::discovery::DeviceIdentifier;
use crate::util::lock;
use crate::util::traits::Registry;

#[derive(Debug, Default)]
struct TrackerState {
    pending: HashSet<String>,
    active: HashSet<String>,
}

/// Pending and active device ids.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    state: Mutex<TrackerState>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        DeviceTracker::default()
    }

    /// Marks `device_id` as pending. Returns false if it is already pending
    /// or active, in which case the caller must not create another bulb.
    pub fn claim(&self, device_id: &str) -> bool {
        let mut state = lock(&self.state);
        if state.active.contains(device_id) || state.pending.contains(device_id) {
            return false;
        }
        state.pending.insert(device_id.to_string())
    }

    /// Moves `device_id` from pending to active. Returns false if it was
    /// already active.
    pub fn promote(&self, device_id: &str) -> bool {
        let mut state = lock(&self.state);
        state.pending.remove(device_id);
        state.active.insert(device_id.to_string())
    }

    /// Forgets `device_id`. Returns true if it was active.
    pub fn release(&self, device_id: &str) -> bool {
        let mut state = lock(&self.state);
        state.pending.remove(device_id);
        state.active.remove(device_id)
    }

    /// Drops a pending claim. An active entry is left alone.
    pub fn abandon(&self, device_id: &str) -> bool {
        lock(&self.state).pending.remove(device_id)
    }

    pub fn is_known(&self, device_id: &str) -> bool {
        let state = lock(&self.state);
        state.active.contains(device_id) || state.pending.contains(device_id)
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        lock(&self.state).active.contains(device_id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.state).active.len()
    }
}

/// Wraps the caller's [`Registry`] and keeps the [`DeviceTracker`] in sync.
///
/// Bulbs talk to the adapter, the adapter talks to the caller. The caller only
/// sees `unregister` for devices it has seen `register` for.
pub struct RegistryAdapter {
    tracker: Arc<DeviceTracker>,
    registry: Arc<dyn Registry>,
    handle: Handle,
}

impl RegistryAdapter {
    pub fn new(handle: Handle, tracker: Arc<DeviceTracker>, registry: Arc<dyn Registry>) -> Self {
        RegistryAdapter {
            tracker,
            registry,
            handle,
        }
    }

    pub fn tracker(&self) -> &Arc<DeviceTracker> {
        &self.tracker
    }

    /// Builds and activates a bulb for a freshly discovered device.
    ///
    /// The device id is normally already claimed in the tracker (discovery
    /// does that); otherwise it is claimed here. A device that already has a
    /// live bulb is refused. On failure the claim is released so a later reply
    /// can retry.
    pub fn adopt(self: &Arc<Self>, device: DeviceIdentifier, config: BulbConfig) -> Result<Bulb> {
        let device_id = device.device_id.clone();
        if !self.tracker.claim(&device_id) && self.tracker.is_active(&device_id) {
            debug!("Bulb {} is already active, not adopting it again", device_id);
            return Err(BulbError::AlreadyActive { device_id });
        }
        let registry: Arc<dyn Registry> = self.clone();
        let bulb = Bulb::with_config(self.handle.clone(), device, config, Some(registry));
        let tracker = self.tracker.clone();
        bulb.on_retire(move |bulb| {
            if tracker.abandon(bulb.device_id()) {
                debug!(
                    "Bulb {} never came up, releasing its discovery claim",
                    bulb.device_id()
                );
            }
        });
        match bulb.activate() {
            Ok(()) => {
                debug!("Activating bulb {}", device_id);
                Ok(bulb)
            }
            Err(e) => {
                warn!("Could not activate bulb {}: {}", device_id, e);
                self.tracker.release(&device_id);
                Err(e)
            }
        }
    }

    /// A discovery handler that adopts every new device with `config`.
    pub fn new_device_handler(
        self: &Arc<Self>,
        config: BulbConfig,
    ) -> impl Fn(DeviceIdentifier) + Send + Sync + 'static {
        let adapter = self.clone();
        move |device| {
            let _ = adapter.adopt(device, config.clone());
        }
    }
}

impl Registry for RegistryAdapter {
    fn register(&self, bulb: &Bulb) {
        if self.tracker.promote(bulb.device_id()) {
            info!("Registering bulb {}", bulb.device_id());
            self.registry.register(bulb);
        }
    }

    fn unregister(&self, bulb: &Bulb) {
        if self.tracker.release(bulb.device_id()) {
            info!("Unregistering bulb {}", bulb.device_id());
            self.registry.unregister(bulb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRegistry {
        registered: AtomicUsize,
        unregistered: AtomicUsize,
    }

    impl Registry for CountingRegistry {
        fn register(&self, _bulb: &Bulb) {
            self.registered.fetch_add(1, Ordering::SeqCst);
        }

        fn unregister(&self, _bulb: &Bulb) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_claim_is_exclusive_until_released() {
        let tracker = DeviceTracker::new();
        assert!(tracker.claim("0x1"));
        assert!(!tracker.claim("0x1"));
        assert!(tracker.promote("0x1"));
        assert!(!tracker.claim("0x1"));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.active_count(), 1);
        assert!(tracker.release("0x1"));
        assert!(!tracker.is_known("0x1"));
        assert!(tracker.claim("0x1"));
    }

    #[test]
    fn test_release_of_pending_reports_inactive() {
        let tracker = DeviceTracker::new();
        tracker.claim("0x2");
        assert!(!tracker.release("0x2"));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_abandon_only_drops_pending_claims() {
        let tracker = DeviceTracker::new();
        tracker.claim("0x3");
        assert!(tracker.abandon("0x3"));
        assert!(!tracker.is_known("0x3"));

        tracker.claim("0x4");
        tracker.promote("0x4");
        assert!(!tracker.abandon("0x4"));
        assert!(tracker.is_active("0x4"));
    }

    #[tokio::test]
    async fn test_adopting_an_active_device_is_refused() {
        let tracker = Arc::new(DeviceTracker::new());
        let registry = Arc::new(CountingRegistry::default());
        let adapter = Arc::new(RegistryAdapter::new(
            Handle::current(),
            tracker.clone(),
            registry.clone(),
        ));
        assert!(tracker.claim("0x15243f"));
        assert!(tracker.promote("0x15243f"));

        let device = DeviceIdentifier::new(
            "0x15243f".to_string(),
            "127.0.0.1".parse().unwrap(),
            55443,
        );
        assert!(matches!(
            adapter.adopt(device, BulbConfig::default()),
            Err(BulbError::AlreadyActive { .. })
        ));
        assert!(tracker.is_active("0x15243f"));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(registry.registered.load(Ordering::SeqCst), 0);
        assert_eq!(registry.unregistered.load(Ordering::SeqCst), 0);
    }
}
