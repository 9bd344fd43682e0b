//! Canonical device registry.
//!
//! Merges three inputs into one record per device: the WebSocket
//! `device_online` report (authoritative for specs and `ws_up`), the port
//! scanner probe (authoritative for `tunnel_up`), and heartbeats. The
//! derived status follows the double-channel rule: phones need both
//! channels up, PCs only the WebSocket.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use fg_protocol::{DeviceKind, DeviceSpecs};

/// Derived device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Offline,
    Online,
    Busy,
    Error,
}

/// One fleet device. Identity is derived from the tunnel port.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub frp_port: u16,

    // Channel state.
    pub tunnel_up: bool,
    pub ws_up: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,

    // Specs (device-reported, scanner-probed for the gaps).
    pub model: Option<String>,
    pub os_version: Option<String>,
    pub screen_resolution: Option<String>,
    pub battery: Option<u8>,
    pub memory_total: Option<String>,
    pub storage_total: Option<String>,

    pub status: DeviceStatus,
    pub current_task: Option<String>,

    // Cumulative counters. Survive reconnects.
    pub total_tasks: u64,
    pub success_tasks: u64,
    pub failed_tasks: u64,

    pub registered_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Device {
    pub fn new(frp_port: u16, kind: DeviceKind, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: device_id_for_port(frp_port),
            name: name.into(),
            kind,
            frp_port,
            tunnel_up: false,
            ws_up: false,
            last_heartbeat: None,
            model: None,
            os_version: None,
            screen_resolution: None,
            battery: None,
            memory_total: None,
            storage_total: None,
            status: DeviceStatus::Offline,
            current_task: None,
            total_tasks: 0,
            success_tasks: 0,
            failed_tasks: 0,
            registered_at: now,
            last_active: now,
        }
    }

    /// Both channels up (one for PCs), online, and idle.
    pub fn is_available(&self) -> bool {
        self.channels_up()
            && self.status == DeviceStatus::Online
            && self.current_task.is_none()
    }

    fn channels_up(&self) -> bool {
        match self.kind {
            DeviceKind::Phone => self.tunnel_up && self.ws_up,
            DeviceKind::Pc => self.ws_up,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.success_tasks as f64 / self.total_tasks as f64 * 100.0
    }

    /// Re-derive `status` from the channel flags. `Error` is sticky until
    /// an explicit update clears it.
    fn derive_status(&mut self) {
        if self.status == DeviceStatus::Error {
            return;
        }
        self.status = if !self.channels_up() {
            DeviceStatus::Offline
        } else if self.current_task.is_some() {
            DeviceStatus::Busy
        } else {
            DeviceStatus::Online
        };
    }

    fn apply_specs(&mut self, specs: &DeviceSpecs) {
        self.name = specs.device_name.clone();
        self.kind = specs.device_type;
        if specs.model.is_some() {
            self.model = specs.model.clone();
        }
        if specs.os_version.is_some() {
            self.os_version = specs.os_version.clone();
        }
        if specs.screen_resolution.is_some() {
            self.screen_resolution = specs.screen_resolution.clone();
        }
        if specs.battery.is_some() {
            self.battery = specs.battery;
        }
        if specs.memory_total.is_some() {
            self.memory_total = specs.memory_total.clone();
        }
        if specs.storage_total.is_some() {
            self.storage_total = specs.storage_total.clone();
        }
    }
}

/// Stable device id derived from the tunnel port.
pub fn device_id_for_port(frp_port: u16) -> String {
    format!("device_{frp_port}")
}

/// Selective field update; unset fields are left alone. Status is re-derived
/// afterwards unless explicitly overridden.
#[derive(Debug, Default, Clone)]
pub struct DeviceUpdate {
    pub tunnel_up: Option<bool>,
    pub ws_up: Option<bool>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub battery: Option<u8>,
    pub status: Option<DeviceStatus>,
}

/// Fleet-wide aggregate counters.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_devices: usize,
    pub online_devices: usize,
    pub busy_devices: usize,
    pub offline_devices: usize,
    pub total_tasks: u64,
    pub success_tasks: u64,
    pub failed_tasks: u64,
    pub success_rate: f64,
}

/// Thread-safe registry of all known devices.
///
/// Devices are soft-deleted only: `unregister` marks them offline and
/// clears task state, but the record (and its counters) survives for the
/// next reconnect.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    /// A device silent for longer than this is marked offline.
    heartbeat_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(heartbeat_interval_secs: u64) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            // 2 × heartbeat interval, per the reconnection rule.
            heartbeat_timeout: Duration::seconds(heartbeat_interval_secs as i64 * 2),
        }
    }

    /// Register from a WebSocket `device_online` report. Reconnects update
    /// in place and keep the counters.
    pub fn register(&self, specs: &DeviceSpecs) -> Device {
        let id = device_id_for_port(specs.frp_port);
        let mut devices = self.devices.write();
        let device = devices
            .entry(id.clone())
            .or_insert_with(|| Device::new(specs.frp_port, specs.device_type, &specs.device_name));
        device.apply_specs(specs);
        device.ws_up = true;
        device.last_heartbeat = Some(Utc::now());
        device.last_active = Utc::now();
        if device.status == DeviceStatus::Error {
            device.status = DeviceStatus::Offline; // explicit recovery on re-register
        }
        device.derive_status();
        tracing::info!(
            device_id = %id,
            kind = %device.kind,
            port = device.frp_port,
            status = ?device.status,
            "device registered"
        );
        device.clone()
    }

    /// Upsert from a scanner discovery (tunnel side seen first).
    pub fn upsert_scanned(&self, frp_port: u16, kind: DeviceKind, name: &str) -> Device {
        let id = device_id_for_port(frp_port);
        let mut devices = self.devices.write();
        let device = devices
            .entry(id.clone())
            .or_insert_with(|| Device::new(frp_port, kind, name));
        device.tunnel_up = true;
        device.last_active = Utc::now();
        device.derive_status();
        device.clone()
    }

    /// Soft-delete on WS disconnect: mark offline, clear task state.
    /// Returns the freed port so the caller can release the allocator
    /// binding and drop the ADB connection.
    pub fn unregister(&self, device_id: &str) -> Option<u16> {
        let mut devices = self.devices.write();
        let device = devices.get_mut(device_id)?;
        device.ws_up = false;
        device.tunnel_up = false;
        device.current_task = None;
        device.status = DeviceStatus::Offline;
        tracing::info!(device_id = %device_id, "device unregistered");
        Some(device.frp_port)
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn list(&self, status: Option<DeviceStatus>) -> Vec<Device> {
        let devices = self.devices.read();
        let mut list: Vec<Device> = devices
            .values()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        list.sort_by_key(|d| d.frp_port);
        list
    }

    /// Apply a selective update. Returns false for unknown devices.
    pub fn update(&self, device_id: &str, update: DeviceUpdate) -> bool {
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(device_id) else {
            return false;
        };
        if let Some(tunnel_up) = update.tunnel_up {
            device.tunnel_up = tunnel_up;
        }
        if let Some(ws_up) = update.ws_up {
            device.ws_up = ws_up;
        }
        if let Some(hb) = update.heartbeat {
            device.last_heartbeat = Some(hb);
        }
        if let Some(battery) = update.battery {
            device.battery = Some(battery);
        }
        if let Some(status) = update.status {
            device.status = status;
        }
        device.last_active = Utc::now();
        if update.status.is_none() {
            device.derive_status();
        }
        true
    }

    /// Record a heartbeat (pong or any WS traffic).
    pub fn touch(&self, device_id: &str) {
        let mut devices = self.devices.write();
        if let Some(device) = devices.get_mut(device_id) {
            device.last_heartbeat = Some(Utc::now());
            device.last_active = Utc::now();
        }
    }

    /// Best available device: highest success rate among the ready ones,
    /// with stale-heartbeat devices demoted on the way.
    pub fn get_available(&self) -> Option<Device> {
        let mut devices = self.devices.write();
        let now = Utc::now();

        let mut candidates: Vec<&mut Device> = devices
            .values_mut()
            .filter(|d| d.is_available())
            .collect();

        let mut ready: Vec<&mut Device> = Vec::new();
        for device in candidates.drain(..) {
            let expired = device
                .last_heartbeat
                .is_some_and(|hb| now - hb > self.heartbeat_timeout);
            if expired {
                tracing::warn!(device_id = %device.id, "heartbeat expired, demoting to offline");
                device.ws_up = false;
                device.derive_status();
                continue;
            }
            ready.push(device);
        }

        ready.sort_by(|a, b| {
            b.success_rate()
                .partial_cmp(&a.success_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ready.first().map(|d| (**d).clone())
    }

    /// Mark a device busy with `task_id`. Fails if it is not available.
    pub fn assign_task(&self, device_id: &str, task_id: &str) -> bool {
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(device_id) else {
            return false;
        };
        if !device.is_available() {
            tracing::warn!(device_id = %device_id, status = ?device.status, "device not available for task");
            return false;
        }
        device.current_task = Some(task_id.to_owned());
        device.total_tasks += 1;
        device.derive_status();
        tracing::info!(device_id = %device_id, task_id = %task_id, "task assigned");
        true
    }

    /// Release the device at a task boundary and bump the counters.
    pub fn complete_task(&self, device_id: &str, success: bool) -> bool {
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(device_id) else {
            return false;
        };
        device.current_task = None;
        if success {
            device.success_tasks += 1;
        } else {
            device.failed_tasks += 1;
        }
        device.derive_status();
        true
    }

    /// Check one device's heartbeat; demotes to offline when stale.
    pub fn check_health(&self, device_id: &str) -> bool {
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(device_id) else {
            return false;
        };
        if let Some(hb) = device.last_heartbeat {
            if Utc::now() - hb > self.heartbeat_timeout {
                device.ws_up = false;
                device.derive_status();
                return false;
            }
        }
        device.ws_up
    }

    /// Sweep every device's heartbeat once.
    pub fn check_all(&self) {
        let ids: Vec<String> = self.devices.read().keys().cloned().collect();
        for id in ids {
            self.check_health(&id);
        }
    }

    /// Spawn the periodic heartbeat sweep.
    pub fn spawn_health_loop(
        self: &std::sync::Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "health loop started");
            loop {
                tokio::time::sleep(interval).await;
                registry.check_all();
            }
        })
    }

    /// Seed a freshly created record with counters persisted by a previous
    /// server run. No-op once the device has new history.
    pub fn restore_counters(&self, device_id: &str, total: u64, success: u64, failed: u64) {
        let mut devices = self.devices.write();
        if let Some(device) = devices.get_mut(device_id) {
            if device.total_tasks == 0 {
                device.total_tasks = total;
                device.success_tasks = success;
                device.failed_tasks = failed;
            }
        }
    }

    /// Ports of devices currently believed online (any non-offline status).
    pub fn active_ports(&self) -> Vec<u16> {
        self.devices
            .read()
            .values()
            .filter(|d| d.status != DeviceStatus::Offline)
            .map(|d| d.frp_port)
            .collect()
    }

    /// Merge scanner-probed specs into a record. Device-reported values win:
    /// probe data only fills fields that are still empty.
    pub fn merge_probed_specs(
        &self,
        device_id: &str,
        model: Option<String>,
        os_version: Option<String>,
        screen_resolution: Option<String>,
        battery: Option<u8>,
        memory_total: Option<String>,
    ) {
        let mut devices = self.devices.write();
        if let Some(device) = devices.get_mut(device_id) {
            if device.model.is_none() {
                device.model = model;
            }
            if device.os_version.is_none() {
                device.os_version = os_version;
            }
            if device.screen_resolution.is_none() {
                device.screen_resolution = screen_resolution;
            }
            if device.battery.is_none() {
                device.battery = battery;
            }
            if device.memory_total.is_none() {
                device.memory_total = memory_total;
            }
        }
    }

    pub fn rename(&self, device_id: &str, name: &str) -> bool {
        let mut devices = self.devices.write();
        match devices.get_mut(device_id) {
            Some(device) => {
                device.name = name.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let devices = self.devices.read();
        let total_tasks: u64 = devices.values().map(|d| d.total_tasks).sum();
        let success_tasks: u64 = devices.values().map(|d| d.success_tasks).sum();
        RegistryStats {
            total_devices: devices.len(),
            online_devices: devices
                .values()
                .filter(|d| d.status == DeviceStatus::Online)
                .count(),
            busy_devices: devices
                .values()
                .filter(|d| d.status == DeviceStatus::Busy)
                .count(),
            offline_devices: devices
                .values()
                .filter(|d| d.status == DeviceStatus::Offline)
                .count(),
            total_tasks,
            success_tasks,
            failed_tasks: devices.values().map(|d| d.failed_tasks).sum(),
            success_rate: if total_tasks > 0 {
                success_tasks as f64 / total_tasks as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs(port: u16, kind: DeviceKind) -> DeviceSpecs {
        DeviceSpecs {
            device_name: format!("dev-{port}"),
            device_type: kind,
            frp_port: port,
            model: Some("Pixel 8".into()),
            os_version: Some("14".into()),
            screen_resolution: Some("1080x2400".into()),
            battery: Some(90),
            memory_total: None,
            storage_total: None,
        }
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(30)
    }

    #[test]
    fn phone_needs_both_channels() {
        let reg = registry();
        let device = reg.register(&specs(6100, DeviceKind::Phone));
        // ws only — still offline.
        assert_eq!(device.status, DeviceStatus::Offline);

        reg.update(
            "device_6100",
            DeviceUpdate {
                tunnel_up: Some(true),
                ..Default::default()
            },
        );
        assert_eq!(reg.get("device_6100").unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn pc_needs_only_ws() {
        let reg = registry();
        let device = reg.register(&specs(6200, DeviceKind::Pc));
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[test]
    fn available_requires_idle_online() {
        let reg = registry();
        reg.register(&specs(6100, DeviceKind::Phone));
        reg.update(
            "device_6100",
            DeviceUpdate {
                tunnel_up: Some(true),
                ..Default::default()
            },
        );

        let picked = reg.get_available().unwrap();
        assert_eq!(picked.id, "device_6100");
        assert!(picked.tunnel_up && picked.ws_up);
        assert!(picked.current_task.is_none());

        assert!(reg.assign_task("device_6100", "t1"));
        // Busy devices are no longer selectable.
        assert!(reg.get_available().is_none());
        // And cannot be double-assigned.
        assert!(!reg.assign_task("device_6100", "t2"));
    }

    #[test]
    fn best_available_prefers_success_rate() {
        let reg = registry();
        for port in [6100u16, 6101] {
            reg.register(&specs(port, DeviceKind::Phone));
            reg.update(
                &device_id_for_port(port),
                DeviceUpdate {
                    tunnel_up: Some(true),
                    ..Default::default()
                },
            );
        }
        // device_6101 has a better record.
        {
            let mut devices = reg.devices.write();
            let a = devices.get_mut("device_6100").unwrap();
            a.total_tasks = 10;
            a.success_tasks = 5;
            let b = devices.get_mut("device_6101").unwrap();
            b.total_tasks = 10;
            b.success_tasks = 9;
        }
        assert_eq!(reg.get_available().unwrap().id, "device_6101");
    }

    #[test]
    fn stale_heartbeat_demotes_device() {
        let reg = registry();
        reg.register(&specs(6100, DeviceKind::Phone));
        reg.update(
            "device_6100",
            DeviceUpdate {
                tunnel_up: Some(true),
                heartbeat: Some(Utc::now() - Duration::seconds(120)),
                ..Default::default()
            },
        );
        assert!(reg.get_available().is_none());
        assert_eq!(
            reg.get("device_6100").unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[test]
    fn complete_task_updates_counters() {
        let reg = registry();
        reg.register(&specs(6100, DeviceKind::Phone));
        reg.update(
            "device_6100",
            DeviceUpdate {
                tunnel_up: Some(true),
                ..Default::default()
            },
        );
        reg.assign_task("device_6100", "t1");
        reg.complete_task("device_6100", true);

        let device = reg.get("device_6100").unwrap();
        assert_eq!(device.total_tasks, 1);
        assert_eq!(device.success_tasks, 1);
        assert_eq!(device.status, DeviceStatus::Online);
        assert!(device.current_task.is_none());
    }

    #[test]
    fn reconnect_keeps_counters() {
        let reg = registry();
        reg.register(&specs(6100, DeviceKind::Phone));
        reg.update(
            "device_6100",
            DeviceUpdate {
                tunnel_up: Some(true),
                ..Default::default()
            },
        );
        reg.assign_task("device_6100", "t1");
        reg.complete_task("device_6100", true);

        let port = reg.unregister("device_6100").unwrap();
        assert_eq!(port, 6100);
        assert_eq!(
            reg.get("device_6100").unwrap().status,
            DeviceStatus::Offline
        );

        // Reconnect: counters survive, task state does not.
        let device = reg.register(&specs(6100, DeviceKind::Phone));
        assert_eq!(device.total_tasks, 1);
        assert_eq!(device.success_tasks, 1);
        assert!(device.current_task.is_none());
    }

    #[test]
    fn scanner_discovery_creates_record() {
        let reg = registry();
        let device = reg.upsert_scanned(6100, DeviceKind::Phone, "Pixel-6100");
        assert!(device.tunnel_up);
        assert!(!device.ws_up);
        assert_eq!(device.status, DeviceStatus::Offline); // phone without ws
    }

    #[test]
    fn stats_aggregate() {
        let reg = registry();
        reg.register(&specs(6100, DeviceKind::Phone));
        reg.register(&specs(6200, DeviceKind::Pc));
        let stats = reg.stats();
        assert_eq!(stats.total_devices, 2);
        assert_eq!(stats.online_devices, 1); // only the PC
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn rename_device() {
        let reg = registry();
        reg.register(&specs(6100, DeviceKind::Phone));
        assert!(reg.rename("device_6100", "front-desk-phone"));
        assert_eq!(reg.get("device_6100").unwrap().name, "front-desk-phone");
        assert!(!reg.rename("device_9999", "nope"));
    }
}
