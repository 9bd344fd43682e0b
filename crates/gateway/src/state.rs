use std::sync::Arc;

use fg_devices::{DeviceRegistry, PortAllocator};
use fg_domain::config::Config;
use fg_screenshots::ScreenshotStore;

use crate::events::EventBus;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::ws::DeviceSockets;

/// Shared application state passed to all handlers.
///
/// Everything is constructed once at startup and owned by the server;
/// components hold references, not globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<TaskStore>,
    pub registry: Arc<DeviceRegistry>,
    pub allocator: Arc<PortAllocator>,
    pub screenshots: Arc<ScreenshotStore>,
    pub scheduler: Arc<Scheduler>,
    pub events: Arc<EventBus>,
    pub sockets: Arc<DeviceSockets>,
}
