//! The device data channel: everything the executor can do to a device,
//! behind one async trait.
//!
//! Implementations live in [`crate::adb`] (phones) and [`crate::pc`]
//! (desktops). The channel owns connection health and reconnection; the
//! executor above it is stateless and simply maps actions to calls.

use fg_domain::action::{MouseButton, NavKey};
use fg_domain::Result;
use fg_protocol::DeviceKind;
use serde::Deserialize;

/// Pixel dimensions of the device screen, taken from the most recent
/// screenshot. Used to resolve normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Screen {
    pub width: u32,
    pub height: u32,
}

impl Screen {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// UI hierarchy acquisition strategy for phones.
///
/// `uiautomator dump` occasionally wedges on some OEM builds; the `--nohup`
/// variant works there. The winning strategy is cached per device until it
/// reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpStrategy {
    #[default]
    Standard,
    Nohup,
}

/// One interactive element as reported by a PC client's perception endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteElement {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub text: String,
    /// Pixel center `[x, y]`.
    pub center: [i64; 2],
    #[serde(default)]
    pub clickable: bool,
    #[serde(default)]
    pub focusable: bool,
}

/// Result of a UI snapshot request.
///
/// Phones return the raw uiautomator XML; PCs return pre-extracted elements.
/// `Empty` means the device answered but had nothing to report — the
/// structured kernel counts those toward its fallback threshold.
#[derive(Debug, Clone)]
pub enum UiDump {
    Xml(String),
    Elements(Vec<RemoteElement>),
    Empty,
}

/// The device-side API reached through the tunnel port.
///
/// All methods classify failures as [`fg_domain::Error::Channel`] with a
/// [`fg_domain::ChannelErrorKind`]; callers never see raw transport errors.
#[async_trait::async_trait]
pub trait DeviceChannel: Send + Sync {
    fn device_id(&self) -> &str;
    fn kind(&self) -> DeviceKind;

    /// Establish (or re-establish) the channel. Phones run `adb connect`;
    /// PCs probe `/health` and refresh the pixel ratio.
    async fn connect(&self) -> Result<()>;

    /// Tear the channel down (phone: `adb disconnect`).
    async fn disconnect(&self) -> Result<()>;

    async fn health_check(&self) -> Result<()>;

    async fn screen_size(&self) -> Result<Screen>;

    /// Capture a PNG screenshot and report its dimensions.
    async fn screenshot(&self) -> Result<(Vec<u8>, Screen)>;

    /// Snapshot the interactive UI state.
    async fn ui_snapshot(&self, strategy: DumpStrategy) -> Result<UiDump>;

    async fn tap(&self, x: i64, y: i64, button: MouseButton, clicks: u32) -> Result<()>;

    async fn swipe(&self, x1: i64, y1: i64, x2: i64, y2: i64, duration_ms: u64) -> Result<()>;

    async fn input_text(&self, text: &str) -> Result<()>;

    /// Friendly key name or raw platform keycode.
    async fn key_event(&self, key: &str) -> Result<()>;

    async fn press_nav(&self, key: NavKey) -> Result<()>;

    async fn launch_app(&self, app_name: &str) -> Result<()>;

    async fn read_clipboard(&self) -> Result<String>;

    async fn write_clipboard(&self, text: &str) -> Result<()>;
}
