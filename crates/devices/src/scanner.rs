//! Port scanner: background sweep of the reserved tunnel-port range.
//!
//! Every sweep probes each port with a short TCP connect, classifies the
//! listener (phone band → ADB handshake, PC band → HTTP health), and feeds
//! the registry. Devices whose port vanished are marked tunnel-down and,
//! once fully offline, have their port returned to the allocator.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use fg_domain::config::PortsConfig;
use fg_protocol::DeviceKind;

use crate::adb::AdbChannel;
use crate::channel::DeviceChannel;
use crate::pc::PcChannel;
use crate::ports::PortAllocator;
use crate::registry::{device_id_for_port, DeviceRegistry, DeviceStatus, DeviceUpdate};

const PROBE_BATCH: usize = 10;

/// One confirmed listener found during a sweep.
struct Discovery {
    port: u16,
    kind: DeviceKind,
    name: String,
    model: Option<String>,
    os_version: Option<String>,
    screen_resolution: Option<String>,
    battery: Option<u8>,
    memory_total: Option<String>,
}

pub struct PortScanner {
    ports: PortsConfig,
    registry: Arc<DeviceRegistry>,
    allocator: Arc<PortAllocator>,
}

impl PortScanner {
    pub fn new(
        ports: PortsConfig,
        registry: Arc<DeviceRegistry>,
        allocator: Arc<PortAllocator>,
    ) -> Self {
        Self {
            ports,
            registry,
            allocator,
        }
    }

    /// Spawn the sweep loop.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.ports.scan_interval_secs);
        tokio::spawn(async move {
            tracing::info!(
                range = ?self.ports.full_range(),
                interval_secs = interval.as_secs(),
                "port scanner started"
            );
            loop {
                self.scan_once().await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// One full sweep of the reserved range, in parallel batches.
    pub async fn scan_once(&self) {
        let ports: Vec<u16> = self.ports.full_range().collect();
        let mut found: Vec<Discovery> = Vec::new();

        for batch in ports.chunks(PROBE_BATCH) {
            let probes = batch.iter().map(|&port| self.probe_port(port));
            for discovery in join_all(probes).await.into_iter().flatten() {
                found.push(discovery);
            }
        }

        let found_ports: Vec<u16> = found.iter().map(|d| d.port).collect();
        for discovery in found {
            self.admit(discovery).await;
        }
        self.sweep_vanished(&found_ports).await;

        tracing::debug!(listening = found_ports.len(), "port sweep complete");
    }

    /// Probe one port: TCP connect first, then a kind-specific handshake.
    async fn probe_port(&self, port: u16) -> Option<Discovery> {
        let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
        let timeout = Duration::from_secs(self.ports.probe_timeout_secs);
        if tokio::time::timeout(timeout, connect).await.ok()?.is_err() {
            return None;
        }

        // A device already known for this port keeps its declared kind;
        // otherwise the band decides.
        let known_kind = self
            .registry
            .get(&device_id_for_port(port))
            .map(|d| d.kind);
        let mut kind = known_kind.unwrap_or(if self.ports.is_pc_port(port) {
            DeviceKind::Pc
        } else {
            DeviceKind::Phone
        });
        // Never ADB-attach inside the PC band, whatever the record claims.
        if kind == DeviceKind::Phone && self.ports.is_pc_port(port) {
            tracing::warn!(port, "phone record on a pc-band port, forcing pc");
            kind = DeviceKind::Pc;
        }

        match kind {
            DeviceKind::Phone => {
                let channel = AdbChannel::new(port);
                if let Err(e) = channel.connect().await {
                    tracing::debug!(port, error = %e, "adb handshake failed");
                    return None;
                }
                let specs = channel.fetch_specs().await;
                let name = match &specs.model {
                    Some(model) => format!("{}-{port}", model.replace(' ', "-")),
                    None => format!("device-{port}"),
                };
                Some(Discovery {
                    port,
                    kind,
                    name,
                    model: specs.model,
                    os_version: specs.os_version,
                    screen_resolution: specs.screen_resolution,
                    battery: specs.battery,
                    memory_total: specs.memory_total,
                })
            }
            DeviceKind::Pc => {
                // A PC listener counts as discovered even before its agent
                // answers /health; specs arrive with the WS registration.
                let healthy = PcChannel::new(port).health_check().await.is_ok();
                if !healthy {
                    tracing::debug!(port, "pc listener without /health, keeping as bare pc");
                }
                Some(Discovery {
                    port,
                    kind,
                    name: format!("PC_{port}"),
                    model: None,
                    os_version: None,
                    screen_resolution: None,
                    battery: None,
                    memory_total: None,
                })
            }
        }
    }

    /// Bind the port and upsert the registry record for one discovery.
    async fn admit(&self, discovery: Discovery) {
        let device_id = device_id_for_port(discovery.port);

        let already_known = self
            .registry
            .get(&device_id)
            .map(|d| d.tunnel_up)
            .unwrap_or(false);
        if !already_known {
            let (ok, message) =
                self.allocator
                    .allocate(&device_id, discovery.port, &discovery.name, false);
            if !ok {
                tracing::error!(port = discovery.port, %message, "scanner could not bind port");
                if discovery.kind == DeviceKind::Phone {
                    let _ = AdbChannel::new(discovery.port).disconnect().await;
                }
                return;
            }
        }

        self.registry
            .upsert_scanned(discovery.port, discovery.kind, &discovery.name);
        self.registry.merge_probed_specs(
            &device_id,
            discovery.model,
            discovery.os_version,
            discovery.screen_resolution,
            discovery.battery,
            discovery.memory_total,
        );
    }

    /// Mark devices whose tunnel vanished; release ports of the ones that
    /// went fully offline.
    async fn sweep_vanished(&self, found_ports: &[u16]) {
        for device in self.registry.list(None) {
            if !device.tunnel_up || found_ports.contains(&device.frp_port) {
                continue;
            }
            tracing::info!(
                device_id = %device.id,
                port = device.frp_port,
                "tunnel vanished"
            );
            self.registry.update(
                &device.id,
                DeviceUpdate {
                    tunnel_up: Some(false),
                    ..Default::default()
                },
            );
            let now_offline = self
                .registry
                .get(&device.id)
                .map(|d| d.status == DeviceStatus::Offline)
                .unwrap_or(true);
            if now_offline {
                if device.kind == DeviceKind::Phone {
                    let _ = AdbChannel::new(device.frp_port).disconnect().await;
                }
                self.allocator.release_device(&device.id);
            }
        }
    }
}
