//! Port allocator: serializes tunnel-port → device bindings so two devices
//! can never claim the same port at the same instant.
//!
//! Every component reads and writes through this interface; nothing else
//! mutates the mapping. A single mutex guards both directions of the
//! bijection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// One live binding.
#[derive(Debug, Clone, Serialize)]
pub struct PortBinding {
    pub port: u16,
    pub device_id: String,
    pub device_name: String,
    pub allocated_at: DateTime<Utc>,
    /// Bumped by heartbeats so `sweep_stale` spares active bindings.
    pub last_active: DateTime<Utc>,
}

#[derive(Default)]
struct AllocatorInner {
    by_port: HashMap<u16, PortBinding>,
    by_device: HashMap<String, u16>,
}

/// Thread-safe port allocation table.
pub struct PortAllocator {
    inner: Mutex<AllocatorInner>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AllocatorInner::default()),
        }
    }

    /// Bind `port` to `device_id`.
    ///
    /// Re-binding the same pair is a no-op success. A device switching ports
    /// releases its old port first. A port held by another device fails
    /// unless `force`, which evicts the prior holder (logged).
    ///
    /// Returns `(ok, message)`; on a forced eviction the message names the
    /// evicted device so the caller can mark it offline.
    pub fn allocate(
        &self,
        device_id: &str,
        port: u16,
        device_name: &str,
        force: bool,
    ) -> (bool, String) {
        let mut inner = self.inner.lock();

        if let Some(&old_port) = inner.by_device.get(device_id) {
            if old_port == port {
                return (true, format!("port {port} already bound to this device"));
            }
            tracing::info!(
                device_id = %device_id,
                old_port,
                new_port = port,
                "device switching ports, releasing old binding"
            );
            release_locked(&mut inner, old_port);
        }

        if let Some(existing) = inner.by_port.get(&port) {
            let holder = existing.device_id.clone();
            if !force {
                let age = (Utc::now() - existing.allocated_at).num_seconds();
                tracing::warn!(port, holder = %holder, age_secs = age, "port conflict rejected");
                return (
                    false,
                    format!(
                        "port {port} is already occupied by {holder}; retry with force to evict"
                    ),
                );
            }
            tracing::warn!(port, evicted = %holder, claimant = %device_id, "force-evicting port holder");
            release_locked(&mut inner, port);
        }

        let now = Utc::now();
        inner.by_port.insert(
            port,
            PortBinding {
                port,
                device_id: device_id.to_owned(),
                device_name: device_name.to_owned(),
                allocated_at: now,
                last_active: now,
            },
        );
        inner.by_device.insert(device_id.to_owned(), port);
        tracing::info!(port, device_id = %device_id, name = %device_name, "port allocated");
        (true, format!("port {port} allocated"))
    }

    /// Release by device id. Returns true if a binding was removed.
    pub fn release_device(&self, device_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_device.get(device_id).copied() {
            Some(port) => release_locked(&mut inner, port),
            None => false,
        }
    }

    /// Release by port. Returns true if a binding was removed.
    pub fn release_port(&self, port: u16) -> bool {
        let mut inner = self.inner.lock();
        release_locked(&mut inner, port)
    }

    pub fn status(&self, port: u16) -> Option<PortBinding> {
        self.inner.lock().by_port.get(&port).cloned()
    }

    pub fn port_of_device(&self, device_id: &str) -> Option<u16> {
        self.inner.lock().by_device.get(device_id).copied()
    }

    /// All bindings, sorted by port.
    pub fn list(&self) -> Vec<PortBinding> {
        let inner = self.inner.lock();
        let mut bindings: Vec<_> = inner.by_port.values().cloned().collect();
        bindings.sort_by_key(|b| b.port);
        bindings
    }

    /// First unbound port within `range`.
    pub fn find_free(&self, range: std::ops::RangeInclusive<u16>) -> Option<u16> {
        let inner = self.inner.lock();
        range.into_iter().find(|p| !inner.by_port.contains_key(p))
    }

    /// Record activity on a device's binding (called on heartbeat).
    pub fn touch_device(&self, device_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(&port) = inner.by_device.get(device_id) {
            if let Some(binding) = inner.by_port.get_mut(&port) {
                binding.last_active = Utc::now();
            }
        }
    }

    /// Release bindings whose last activity is older than `max_age`.
    /// Returns the freed ports.
    pub fn sweep_stale(&self, max_age: chrono::Duration) -> Vec<u16> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let stale: Vec<u16> = inner
            .by_port
            .values()
            .filter(|b| now - b.last_active > max_age)
            .map(|b| b.port)
            .collect();
        for port in &stale {
            release_locked(&mut inner, *port);
            tracing::warn!(port, "released stale port binding");
        }
        stale
    }

    /// Drop every binding (startup cleanup after the ADB sweep).
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        let count = inner.by_port.len();
        inner.by_port.clear();
        inner.by_device.clear();
        if count > 0 {
            tracing::info!(count, "cleared all port bindings");
        }
    }
}

fn release_locked(inner: &mut AllocatorInner, port: u16) -> bool {
    match inner.by_port.remove(&port) {
        Some(binding) => {
            inner.by_device.remove(&binding.device_id);
            tracing::info!(port, device_id = %binding.device_id, "port released");
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release() {
        let alloc = PortAllocator::new();
        let (ok, _) = alloc.allocate("device_6100", 6100, "pixel", false);
        assert!(ok);
        assert_eq!(alloc.port_of_device("device_6100"), Some(6100));
        assert_eq!(alloc.status(6100).unwrap().device_name, "pixel");

        assert!(alloc.release_device("device_6100"));
        assert!(alloc.status(6100).is_none());
        assert!(!alloc.release_device("device_6100"));
    }

    #[test]
    fn conflict_rejected_without_force() {
        let alloc = PortAllocator::new();
        alloc.allocate("device_a", 6100, "a", false);
        let (ok, msg) = alloc.allocate("device_b", 6100, "b", false);
        assert!(!ok);
        assert!(msg.contains("device_a"));
        // Holder unchanged.
        assert_eq!(alloc.status(6100).unwrap().device_id, "device_a");
    }

    #[test]
    fn force_evicts_prior_holder() {
        let alloc = PortAllocator::new();
        alloc.allocate("device_a", 6100, "a", false);
        let (ok, _) = alloc.allocate("device_b", 6100, "b", true);
        assert!(ok);
        assert_eq!(alloc.status(6100).unwrap().device_id, "device_b");
        assert_eq!(alloc.port_of_device("device_a"), None);
    }

    #[test]
    fn force_same_device_same_port_is_noop() {
        let alloc = PortAllocator::new();
        alloc.allocate("device_a", 6100, "a", false);
        let (ok, msg) = alloc.allocate("device_a", 6100, "a", true);
        assert!(ok);
        assert!(msg.contains("already bound"));
        assert_eq!(alloc.list().len(), 1);
    }

    #[test]
    fn reregistration_switches_ports() {
        let alloc = PortAllocator::new();
        alloc.allocate("device_a", 6100, "a", false);
        let (ok, _) = alloc.allocate("device_a", 6101, "a", false);
        assert!(ok);
        assert!(alloc.status(6100).is_none());
        assert_eq!(alloc.port_of_device("device_a"), Some(6101));
    }

    #[test]
    fn at_most_one_device_per_port() {
        let alloc = PortAllocator::new();
        alloc.allocate("device_a", 6100, "a", false);
        alloc.allocate("device_b", 6100, "b", false);
        alloc.allocate("device_c", 6100, "c", true);
        let holders: Vec<_> = alloc
            .list()
            .into_iter()
            .filter(|b| b.port == 6100)
            .collect();
        assert_eq!(holders.len(), 1);
    }

    #[test]
    fn find_free_skips_bound_ports() {
        let alloc = PortAllocator::new();
        alloc.allocate("device_a", 6100, "a", false);
        alloc.allocate("device_b", 6101, "b", false);
        assert_eq!(alloc.find_free(6100..=6105), Some(6102));
        assert_eq!(alloc.find_free(6100..=6101), None);
    }

    #[test]
    fn sweep_stale_releases_idle_bindings() {
        let alloc = PortAllocator::new();
        alloc.allocate("device_a", 6100, "a", false);
        alloc.allocate("device_b", 6101, "b", false);

        // Backdate device_a's activity.
        {
            let mut inner = alloc.inner.lock();
            let binding = inner.by_port.get_mut(&6100).unwrap();
            binding.last_active = Utc::now() - chrono::Duration::hours(2);
        }
        alloc.touch_device("device_b");

        let freed = alloc.sweep_stale(chrono::Duration::hours(1));
        assert_eq!(freed, vec![6100]);
        assert!(alloc.status(6100).is_none());
        assert!(alloc.status(6101).is_some());
    }

    #[test]
    fn clear_all_empties_table() {
        let alloc = PortAllocator::new();
        alloc.allocate("device_a", 6100, "a", false);
        alloc.allocate("device_b", 6101, "b", false);
        alloc.clear_all();
        assert!(alloc.list().is_empty());
    }
}
