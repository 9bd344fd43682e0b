//! ADB channel for phones.
//!
//! The remote agent exposes an ADB server over the reverse tunnel; every
//! operation here shells out to `adb -s localhost:<port> …` with a deadline.
//! Text beyond ASCII goes through the clipboard helper the device agent
//! installs under `/data/local/tmp` (direct `input text` cannot carry CJK).

use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

use fg_domain::action::{MouseButton, NavKey};
use fg_domain::{ChannelErrorKind, Error, Result};
use fg_protocol::DeviceKind;

use crate::channel::{DeviceChannel, DumpStrategy, Screen, UiDump};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Path of the on-device clipboard helper (installed by the phone agent).
const CLIPBOARD_HELPER: &str = "/data/local/tmp/fg-clipper.jar";
/// KEYCODE_PASTE.
const KEYCODE_PASTE: &str = "279";

pub struct AdbChannel {
    device_id: String,
    serial: String,
    frp_port: u16,
}

impl AdbChannel {
    pub fn new(frp_port: u16) -> Self {
        Self {
            device_id: format!("device_{frp_port}"),
            serial: format!("localhost:{frp_port}"),
            frp_port,
        }
    }

    pub fn frp_port(&self) -> u16 {
        self.frp_port
    }

    /// Run `adb <args>` against the daemon itself (no `-s`).
    async fn adb_global(&self, args: &[&str], timeout: Duration) -> Result<Output> {
        run_adb(args, timeout).await
    }

    /// Run `adb -s <serial> <args>`.
    async fn adb(&self, args: &[&str], timeout: Duration) -> Result<Output> {
        let mut full = vec!["-s", self.serial.as_str()];
        full.extend_from_slice(args);
        run_adb(&full, timeout).await
    }

    /// Run a shell command and return trimmed stdout.
    async fn shell(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        let output = self.adb(&full, DEFAULT_TIMEOUT).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Fetch model/OS/screen/battery specs over the shell. Best-effort:
    /// individual probe failures leave the field empty.
    pub async fn fetch_specs(&self) -> AdbSpecs {
        let model = self.shell(&["getprop", "ro.product.model"]).await.ok();
        let os_version = self
            .shell(&["getprop", "ro.build.version.release"])
            .await
            .ok();
        let screen_resolution = match self.shell(&["wm", "size"]).await {
            // "Physical size: 1080x2400"
            Ok(out) => out.rsplit(':').next().map(|s| s.trim().to_owned()),
            Err(_) => None,
        };
        let battery = match self.shell(&["dumpsys", "battery"]).await {
            Ok(out) => out
                .lines()
                .find_map(|line| line.trim().strip_prefix("level:"))
                .and_then(|level| level.trim().parse::<u8>().ok()),
            Err(_) => None,
        };
        let memory_total = match self.shell(&["cat", "/proc/meminfo"]).await {
            Ok(out) => out
                .lines()
                .find_map(|line| line.strip_prefix("MemTotal:"))
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|kb| kb.parse::<u64>().ok())
                .map(|kb| format!("{:.1}GB", kb as f64 / 1024.0 / 1024.0)),
            Err(_) => None,
        };

        AdbSpecs {
            model: model.filter(|s| !s.is_empty()),
            os_version: os_version.filter(|s| !s.is_empty()),
            screen_resolution: screen_resolution.filter(|s| !s.is_empty()),
            battery,
            memory_total,
        }
    }
}

/// Startup sweep: drop any ADB connection left over from a previous server
/// run, so stale attachments cannot shadow fresh tunnel clients. Errors are
/// ignored; disconnecting a non-connection is a no-op.
pub async fn disconnect_range(range: std::ops::RangeInclusive<u16>) {
    let mut dropped = 0u32;
    for port in range {
        let serial = format!("localhost:{port}");
        if run_adb(&["disconnect", &serial], CONNECT_TIMEOUT).await.is_ok() {
            dropped += 1;
        }
    }
    tracing::info!(checked = dropped, "startup ADB sweep complete");
}

/// Specs probed over ADB by the scanner for devices that never registered.
#[derive(Debug, Clone, Default)]
pub struct AdbSpecs {
    pub model: Option<String>,
    pub os_version: Option<String>,
    pub screen_resolution: Option<String>,
    pub battery: Option<u8>,
    pub memory_total: Option<String>,
}

async fn run_adb(args: &[&str], timeout: Duration) -> Result<Output> {
    let fut = Command::new("adb").args(args).output();
    let output = tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::channel(ChannelErrorKind::Timeout, format!("adb {args:?}")))?
        .map_err(|e| Error::channel(ChannelErrorKind::Unreachable, format!("adb spawn: {e}")))?;

    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let kind = if stderr.contains("offline") || stderr.contains("not found") {
        ChannelErrorKind::Offline
    } else if stderr.contains("cannot connect") || stderr.contains("Connection refused") {
        ChannelErrorKind::Unreachable
    } else {
        ChannelErrorKind::CommandFailed
    };
    Err(Error::channel(
        kind,
        format!("adb {args:?}: {}", stderr.trim()),
    ))
}

/// Map friendly key names to Android keycodes. Raw `KEYCODE_*` names and
/// numeric codes pass through untouched.
fn resolve_keycode(key: &str) -> String {
    if key.chars().all(|c| c.is_ascii_digit()) || key.starts_with("KEYCODE_") {
        return key.to_owned();
    }
    let code = match key.to_lowercase().as_str() {
        "enter" => "66",
        "tab" => "61",
        "space" => "62",
        "delete" | "del" => "67",
        "escape" | "esc" => "111",
        "volume_up" => "24",
        "volume_down" => "25",
        "power" => "26",
        "menu" => "82",
        "paste" => KEYCODE_PASTE,
        _ => return key.to_owned(),
    };
    code.to_owned()
}

/// Resolve a human app name to a launchable package for `monkey`.
fn resolve_package(app_name: &str) -> Option<&'static str> {
    let name = app_name.trim().to_lowercase();
    let pkg = match name.as_str() {
        "settings" | "设置" => "com.android.settings",
        "camera" | "相机" => "com.android.camera",
        "chrome" => "com.android.chrome",
        "browser" | "浏览器" => "com.android.browser",
        "wechat" | "微信" => "com.tencent.mm",
        "alipay" | "支付宝" => "com.eg.android.AlipayGphone",
        "taobao" | "淘宝" => "com.taobao.taobao",
        "maps" | "地图" => "com.autonavi.minimap",
        "messages" | "短信" => "com.android.mms",
        "contacts" | "联系人" => "com.android.contacts",
        "gallery" | "相册" => "com.android.gallery3d",
        "clock" | "时钟" => "com.android.deskclock",
        _ => return None,
    };
    Some(pkg)
}

#[async_trait::async_trait]
impl DeviceChannel for AdbChannel {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Phone
    }

    async fn connect(&self) -> Result<()> {
        self.adb_global(&["connect", &self.serial], CONNECT_TIMEOUT)
            .await?;
        // `adb connect` exits 0 even on failure; verify with a shell echo.
        let probe = self.shell(&["echo", "ok"]).await?;
        if probe != "ok" {
            return Err(Error::channel(
                ChannelErrorKind::Unreachable,
                format!("{} did not answer echo probe", self.serial),
            ));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.adb_global(&["disconnect", &self.serial], CONNECT_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn health_check(&self) -> Result<()> {
        let state = self.adb(&["get-state"], CONNECT_TIMEOUT).await?;
        let state = String::from_utf8_lossy(&state.stdout);
        if state.trim() == "device" {
            Ok(())
        } else {
            Err(Error::channel(
                ChannelErrorKind::Offline,
                format!("adb state: {}", state.trim()),
            ))
        }
    }

    async fn screen_size(&self) -> Result<Screen> {
        let out = self.shell(&["wm", "size"]).await?;
        parse_wm_size(&out).ok_or_else(|| {
            Error::channel(ChannelErrorKind::CommandFailed, format!("wm size: {out}"))
        })
    }

    async fn screenshot(&self) -> Result<(Vec<u8>, Screen)> {
        let output = self
            .adb(&["exec-out", "screencap", "-p"], Duration::from_secs(15))
            .await?;
        let png = output.stdout;
        let screen = png_dimensions(&png).ok_or_else(|| {
            Error::channel(
                ChannelErrorKind::CommandFailed,
                "screencap returned invalid PNG",
            )
        })?;
        Ok((png, screen))
    }

    async fn ui_snapshot(&self, strategy: DumpStrategy) -> Result<UiDump> {
        let dump_path = "/sdcard/fg_window_dump.xml";
        let dump_args: Vec<&str> = match strategy {
            DumpStrategy::Standard => vec!["uiautomator", "dump", dump_path],
            DumpStrategy::Nohup => vec!["uiautomator", "dump", "--nohup", dump_path],
        };
        self.shell(&dump_args).await?;
        let xml = self.shell(&["cat", dump_path]).await?;
        if xml.trim().is_empty() {
            return Ok(UiDump::Empty);
        }
        Ok(UiDump::Xml(xml))
    }

    async fn tap(&self, x: i64, y: i64, _button: MouseButton, clicks: u32) -> Result<()> {
        let xs = x.to_string();
        let ys = y.to_string();
        for i in 0..clicks.max(1) {
            self.shell(&["input", "tap", &xs, &ys]).await?;
            if i + 1 < clicks {
                tokio::time::sleep(Duration::from_millis(120)).await;
            }
        }
        Ok(())
    }

    async fn swipe(&self, x1: i64, y1: i64, x2: i64, y2: i64, duration_ms: u64) -> Result<()> {
        let args = [
            x1.to_string(),
            y1.to_string(),
            x2.to_string(),
            y2.to_string(),
            duration_ms.to_string(),
        ];
        self.shell(&[
            "input", "swipe", &args[0], &args[1], &args[2], &args[3], &args[4],
        ])
        .await
        .map(|_| ())
    }

    async fn input_text(&self, text: &str) -> Result<()> {
        if text.is_ascii() {
            // `input text` understands %s for spaces; quote everything else.
            let escaped = text.replace(' ', "%s");
            self.shell(&["input", "text", &escaped]).await.map(|_| ())
        } else {
            // CJK and emoji cannot ride `input text`; go clipboard + paste.
            self.write_clipboard(text).await?;
            self.shell(&["input", "keyevent", KEYCODE_PASTE])
                .await
                .map(|_| ())
        }
    }

    async fn key_event(&self, key: &str) -> Result<()> {
        let code = resolve_keycode(key);
        self.shell(&["input", "keyevent", &code]).await.map(|_| ())
    }

    async fn press_nav(&self, key: NavKey) -> Result<()> {
        let code = match key {
            NavKey::Back => "4",
            NavKey::Home => "3",
            NavKey::Recent => "187",
        };
        self.shell(&["input", "keyevent", code]).await.map(|_| ())
    }

    async fn launch_app(&self, app_name: &str) -> Result<()> {
        let package = resolve_package(app_name).ok_or_else(|| {
            Error::channel(
                ChannelErrorKind::CommandFailed,
                format!("unknown app: {app_name}"),
            )
        })?;
        self.shell(&[
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])
        .await
        .map(|_| ())
    }

    async fn read_clipboard(&self) -> Result<String> {
        let cmd =
            format!("CLASSPATH={CLIPBOARD_HELPER} app_process / dev.fleetgate.Clipper read");
        self.shell(&[&cmd]).await
    }

    async fn write_clipboard(&self, text: &str) -> Result<()> {
        let escaped = text.replace('\'', "'\\''");
        let cmd = format!(
            "CLASSPATH={CLIPBOARD_HELPER} app_process / dev.fleetgate.Clipper write '{escaped}'"
        );
        self.shell(&[&cmd]).await.map(|_| ())
    }
}

/// Parse `wm size` output ("Physical size: 1080x2400").
fn parse_wm_size(out: &str) -> Option<Screen> {
    let dims = out.rsplit(':').next()?.trim();
    let (w, h) = dims.split_once('x')?;
    Some(Screen::new(w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Read width/height from a PNG IHDR chunk without decoding the image.
fn png_dimensions(bytes: &[u8]) -> Option<Screen> {
    if bytes.len() < 24 || &bytes[1..4] != b"PNG" {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    if width == 0 || height == 0 {
        return None;
    }
    Some(Screen::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wm_size_parses() {
        let screen = parse_wm_size("Physical size: 1080x2400").unwrap();
        assert_eq!(screen, Screen::new(1080, 2400));
        assert!(parse_wm_size("garbage").is_none());
    }

    #[test]
    fn png_header_dimensions() {
        // Minimal PNG header: signature + IHDR length/type + 13-byte payload.
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        png.extend_from_slice(&[0, 0, 0, 13]);
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&1080u32.to_be_bytes());
        png.extend_from_slice(&2400u32.to_be_bytes());
        png.extend_from_slice(&[8, 6, 0, 0, 0]);
        let screen = png_dimensions(&png).unwrap();
        assert_eq!(screen, Screen::new(1080, 2400));
        assert!(png_dimensions(b"not a png").is_none());
    }

    #[test]
    fn keycode_resolution() {
        assert_eq!(resolve_keycode("enter"), "66");
        assert_eq!(resolve_keycode("volume_up"), "24");
        assert_eq!(resolve_keycode("66"), "66");
        assert_eq!(resolve_keycode("KEYCODE_CAMERA"), "KEYCODE_CAMERA");
    }

    #[test]
    fn app_name_resolution() {
        assert_eq!(resolve_package("设置"), Some("com.android.settings"));
        assert_eq!(resolve_package("Settings"), Some("com.android.settings"));
        assert!(resolve_package("definitely-not-an-app").is_none());
    }
}
