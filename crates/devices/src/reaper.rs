//! Zombie-port reaper.
//!
//! A tunnel client can die without closing its server-side listener, leaving
//! the port occupied but serving nothing. The reaper diffs the locally
//! listening ports (via `ss -tlnp`) against the devices the registry still
//! believes are online; a listener with no live device for longer than the
//! zombie timeout gets its process killed (SIGTERM, one second of grace,
//! then SIGKILL) and its binding released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use regex::Regex;
use tokio::process::Command;

use fg_domain::config::PortsConfig;

use crate::ports::PortAllocator;
use crate::registry::DeviceRegistry;

pub struct ZombieReaper {
    ports: PortsConfig,
    registry: Arc<DeviceRegistry>,
    allocator: Arc<PortAllocator>,
    /// When each orphaned listener was first noticed.
    first_seen: Mutex<HashMap<u16, Instant>>,
}

impl ZombieReaper {
    pub fn new(
        ports: PortsConfig,
        registry: Arc<DeviceRegistry>,
        allocator: Arc<PortAllocator>,
    ) -> Self {
        Self {
            ports,
            registry,
            allocator,
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.ports.reaper_interval_secs);
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "zombie reaper started");
            loop {
                tokio::time::sleep(interval).await;
                self.sweep_once().await;
            }
        })
    }

    pub async fn sweep_once(&self) {
        let listening = match self.listening_ports().await {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(error = %e, "could not enumerate listening ports");
                return;
            }
        };

        let active: HashSet<u16> = self.registry.active_ports().into_iter().collect();
        let timeout = Duration::from_secs(self.ports.zombie_timeout_secs);
        let zombies = {
            let mut first_seen = self.first_seen.lock();
            identify_zombies(&listening, &active, &mut first_seen, timeout)
        };

        if zombies.is_empty() {
            return;
        }
        tracing::info!(count = zombies.len(), "reaping zombie ports");

        for (port, pid) in zombies {
            if let Some(pid) = pid {
                kill_gracefully(pid).await;
            } else {
                tracing::warn!(port, "zombie port has no visible pid, releasing binding only");
            }
            self.first_seen.lock().remove(&port);
            self.allocator.release_port(port);
        }
    }

    /// Listening ports within the reserved range, with owning pid when
    /// `ss` can see it.
    async fn listening_ports(&self) -> std::io::Result<HashMap<u16, Option<i32>>> {
        let output = Command::new("ss").args(["-tlnp"]).output().await?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ss_output(&text, self.ports.full_range()))
    }
}

/// Decide which listeners are zombies. A port qualifies once it has been
/// orphaned (listening, no live device) for longer than `timeout`;
/// first sightings only start the clock. Ports that came back to life drop
/// off the watch list.
fn identify_zombies(
    listening: &HashMap<u16, Option<i32>>,
    active: &HashSet<u16>,
    first_seen: &mut HashMap<u16, Instant>,
    timeout: Duration,
) -> Vec<(u16, Option<i32>)> {
    let now = Instant::now();
    let mut zombies = Vec::new();

    for (&port, &pid) in listening {
        if active.contains(&port) {
            first_seen.remove(&port);
            continue;
        }
        match first_seen.get(&port) {
            None => {
                first_seen.insert(port, now);
            }
            Some(&seen) if now.duration_since(seen) > timeout => {
                zombies.push((port, pid));
            }
            Some(_) => {}
        }
    }

    // Forget listeners that disappeared on their own.
    first_seen.retain(|port, _| listening.contains_key(port));
    zombies
}

/// Parse `ss -tlnp` output into `{port → pid}` for ports inside `range`.
fn parse_ss_output(
    text: &str,
    range: std::ops::RangeInclusive<u16>,
) -> HashMap<u16, Option<i32>> {
    // Lazily compiled per call; the reaper runs every few minutes.
    let port_re = Regex::new(r"[:\]](\d+)\s").ok();
    let pid_re = Regex::new(r"pid=(\d+)").ok();
    let mut ports = HashMap::new();

    for line in text.lines() {
        if !line.contains("LISTEN") {
            continue;
        }
        let Some(port) = port_re
            .as_ref()
            .and_then(|re| re.captures(line))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
        else {
            continue;
        };
        if !range.contains(&port) {
            continue;
        }
        let pid = pid_re
            .as_ref()
            .and_then(|re| re.captures(line))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i32>().ok());
        ports.insert(port, pid);
    }
    ports
}

/// SIGTERM, wait one second, SIGKILL if the process is still there.
async fn kill_gracefully(pid: i32) {
    let target = Pid::from_raw(pid);
    tracing::info!(pid, "terminating zombie listener");
    if let Err(e) = kill(target, Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM failed");
        return;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    // Signal 0 probes liveness.
    if kill(target, None).is_ok() {
        tracing::warn!(pid, "still alive after SIGTERM, sending SIGKILL");
        let _ = kill(target, Signal::SIGKILL);
    }
}
