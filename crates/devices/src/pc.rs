//! HTTP channel for PC devices.
//!
//! The PC agent exposes a JSON control API over the tunnel port. Retina and
//! other scaled displays report a pixel `ratio` in `/health`; the channel
//! divides outgoing coordinates by it so the agent always receives points in
//! its own logical space.

use std::time::Duration;

use base64::Engine;
use parking_lot::RwLock;
use serde_json::Value;

use fg_domain::action::{MouseButton, NavKey};
use fg_domain::{ChannelErrorKind, Error, Result};
use fg_protocol::DeviceKind;

use crate::channel::{DeviceChannel, DumpStrategy, RemoteElement, Screen, UiDump};

/// Platform facts reported by `/health`.
#[derive(Debug, Clone)]
struct PlatformInfo {
    ratio: f64,
    ctrl_key: String,
    search_keys: Vec<String>,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self {
            ratio: 1.0,
            ctrl_key: "ctrl".into(),
            search_keys: vec!["win".into(), "s".into()],
        }
    }
}

pub struct PcChannel {
    device_id: String,
    base_url: String,
    client: reqwest::Client,
    platform: RwLock<PlatformInfo>,
}

impl PcChannel {
    pub fn new(frp_port: u16) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            device_id: format!("device_{frp_port}"),
            base_url: format!("http://localhost:{frp_port}"),
            client,
            platform: RwLock::new(PlatformInfo::default()),
        }
    }

    fn scale(&self, v: i64) -> i64 {
        let ratio = self.platform.read().ratio;
        if ratio <= 1.0 {
            v
        } else {
            (v as f64 / ratio) as i64
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(classify_reqwest)?;
        decode_json(response).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        decode_json(response).await
    }

    async fn press_combo(&self, keys: &[String]) -> Result<()> {
        let (modifiers, key) = match keys.split_last() {
            Some((key, modifiers)) => (modifiers.to_vec(), key.clone()),
            None => return Ok(()),
        };
        self.post(
            "/api/control/key",
            serde_json::json!({ "key": key, "modifiers": modifiers }),
        )
        .await
        .map(|_| ())
    }
}

fn classify_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::channel(ChannelErrorKind::Timeout, e.to_string())
    } else if e.is_connect() {
        Error::channel(ChannelErrorKind::Unreachable, e.to_string())
    } else {
        Error::channel(ChannelErrorKind::CommandFailed, e.to_string())
    }
}

async fn decode_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let value: Value = response
        .json()
        .await
        .map_err(|e| Error::channel(ChannelErrorKind::CommandFailed, e.to_string()))?;
    if !status.is_success() {
        return Err(Error::channel(
            ChannelErrorKind::CommandFailed,
            format!("{status}: {value}"),
        ));
    }
    Ok(value)
}

#[async_trait::async_trait]
impl DeviceChannel for PcChannel {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Pc
    }

    async fn connect(&self) -> Result<()> {
        let info = self.get("/health").await?;
        let mut platform = self.platform.write();
        platform.ratio = info.get("ratio").and_then(Value::as_f64).unwrap_or(1.0);
        if let Some(ctrl) = info.get("ctrl_key").and_then(Value::as_str) {
            platform.ctrl_key = ctrl.to_owned();
        }
        if let Some(keys) = info.get("search_key").and_then(Value::as_array) {
            let parsed: Vec<String> = keys
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect();
            if !parsed.is_empty() {
                platform.search_keys = parsed;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Nothing to tear down; the tunnel belongs to the remote agent.
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.get("/health").await.map(|_| ())
    }

    async fn screen_size(&self) -> Result<Screen> {
        let value = self.get("/api/control/screen_size").await?;
        let width = value.get("width").and_then(Value::as_u64).unwrap_or(0) as u32;
        let height = value.get("height").and_then(Value::as_u64).unwrap_or(0) as u32;
        if width == 0 || height == 0 {
            return Err(Error::channel(
                ChannelErrorKind::CommandFailed,
                format!("bad screen_size reply: {value}"),
            ));
        }
        Ok(Screen::new(width, height))
    }

    async fn screenshot(&self) -> Result<(Vec<u8>, Screen)> {
        let value = self
            .post("/api/control/screenshot", serde_json::json!({}))
            .await?;
        let image_b64 = value
            .get("image")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::channel(ChannelErrorKind::CommandFailed, "no image field"))?;
        let png = base64::engine::general_purpose::STANDARD
            .decode(image_b64)
            .map_err(|e| Error::channel(ChannelErrorKind::CommandFailed, e.to_string()))?;
        let screen = self.screen_size().await?;
        Ok((png, screen))
    }

    async fn ui_snapshot(&self, _strategy: DumpStrategy) -> Result<UiDump> {
        let value = self.get("/api/control/perception").await?;
        let elements: Vec<RemoteElement> = value
            .get("elements")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::channel(ChannelErrorKind::CommandFailed, e.to_string()))?
            .unwrap_or_default();
        if elements.is_empty() {
            return Ok(UiDump::Empty);
        }
        Ok(UiDump::Elements(elements))
    }

    async fn tap(&self, x: i64, y: i64, button: MouseButton, clicks: u32) -> Result<()> {
        let button = match button {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        };
        self.post(
            "/api/control/click",
            serde_json::json!({
                "x": self.scale(x),
                "y": self.scale(y),
                "button": button,
                "clicks": clicks.max(1),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn swipe(&self, x1: i64, y1: i64, _x2: i64, y2: i64, _duration_ms: u64) -> Result<()> {
        // The PC agent has no drag primitive; approximate vertical swipes
        // with wheel clicks at the start position (~120 px per notch).
        self.post(
            "/api/control/move",
            serde_json::json!({ "x": self.scale(x1), "y": self.scale(y1) }),
        )
        .await?;
        let clicks = ((y2 - y1) / 120).clamp(-20, 20);
        self.post(
            "/api/control/scroll",
            serde_json::json!({ "clicks": clicks }),
        )
        .await
        .map(|_| ())
    }

    async fn input_text(&self, text: &str) -> Result<()> {
        self.post("/api/control/type", serde_json::json!({ "text": text }))
            .await
            .map(|_| ())
    }

    async fn key_event(&self, key: &str) -> Result<()> {
        self.post(
            "/api/control/key",
            serde_json::json!({ "key": key, "modifiers": [] }),
        )
        .await
        .map(|_| ())
    }

    async fn press_nav(&self, key: NavKey) -> Result<()> {
        match key {
            NavKey::Back => self.key_event("escape").await,
            NavKey::Home | NavKey::Recent => Err(Error::channel(
                ChannelErrorKind::CommandFailed,
                "navigation key not supported on pc",
            )),
        }
    }

    async fn launch_app(&self, app_name: &str) -> Result<()> {
        // Search-shortcut macro: open the launcher search, type the app
        // name, hit enter. The search prompt occasionally lags; the
        // follow-up keys are posted unconditionally and the launch is
        // reported as a success either way.
        let search_keys = self.platform.read().search_keys.clone();
        self.press_combo(&search_keys).await?;
        tokio::time::sleep(Duration::from_millis(600)).await;
        self.input_text(app_name).await?;
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.key_event("enter").await
    }

    async fn read_clipboard(&self) -> Result<String> {
        Err(Error::channel(
            ChannelErrorKind::CommandFailed,
            "clipboard read not supported on pc",
        ))
    }

    async fn write_clipboard(&self, _text: &str) -> Result<()> {
        Err(Error::channel(
            ChannelErrorKind::CommandFailed,
            "clipboard write not supported on pc",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_scales_coordinates() {
        let channel = PcChannel::new(6200);
        channel.platform.write().ratio = 2.0;
        assert_eq!(channel.scale(1000), 500);
        assert_eq!(channel.scale(999), 499);

        channel.platform.write().ratio = 1.0;
        assert_eq!(channel.scale(1000), 1000);
    }

    #[test]
    fn remote_elements_deserialize() {
        let raw = serde_json::json!([
            {"role": "button", "text": "OK", "center": [100, 200], "clickable": true}
        ]);
        let elements: Vec<RemoteElement> = serde_json::from_value(raw).unwrap();
        assert_eq!(elements[0].center, [100, 200]);
        assert!(elements[0].clickable);
    }
}
