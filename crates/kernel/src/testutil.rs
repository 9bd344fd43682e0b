//! Shared test doubles: a scriptable device channel and a scripted LLM.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use fg_domain::action::{MouseButton, NavKey};
use fg_domain::{ChannelErrorKind, Error, Result, TokenUsage};
use fg_devices::channel::{DeviceChannel, DumpStrategy, RemoteElement, Screen, UiDump};
use fg_protocol::DeviceKind;
use fg_providers::{ChatRequest, ChatResponse, LlmProvider};

use crate::callback::{ExecutionCallback, StepCallback, StepStart};

pub const TEST_SCREEN: Screen = Screen {
    width: 1080,
    height: 2400,
};

/// Device channel that records calls and replays scripted UI dumps.
pub struct MockChannel {
    device_id: String,
    calls: Mutex<Vec<String>>,
    ui_dumps: Mutex<VecDeque<UiDump>>,
    failures: Mutex<VecDeque<ChannelErrorKind>>,
    ui_failures: Mutex<VecDeque<ChannelErrorKind>>,
    clipboard: Mutex<String>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            device_id: "device_6100".into(),
            calls: Mutex::new(Vec::new()),
            ui_dumps: Mutex::new(VecDeque::new()),
            failures: Mutex::new(VecDeque::new()),
            ui_failures: Mutex::new(VecDeque::new()),
            clipboard: Mutex::new(String::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Queue a UI dump for the next `ui_snapshot` call. When the queue is
    /// empty a single default clickable element is returned.
    pub fn push_ui_dump(&self, dump: UiDump) {
        self.ui_dumps.lock().push_back(dump);
    }

    /// Make the next device call fail with the given kind.
    pub fn fail_next(&self, kind: ChannelErrorKind) {
        self.failures.lock().push_back(kind);
    }

    /// Make the next `ui_snapshot` call fail with the given kind.
    #[allow(dead_code)]
    pub fn fail_ui_next(&self, kind: ChannelErrorKind) {
        self.ui_failures.lock().push_back(kind);
    }

    pub fn set_clipboard(&self, text: &str) {
        *self.clipboard.lock() = text.to_owned();
    }

    fn record(&self, call: String) -> Result<()> {
        if let Some(kind) = self.failures.lock().pop_front() {
            return Err(Error::channel(kind, format!("scripted failure for {call}")));
        }
        self.calls.lock().push(call);
        Ok(())
    }

    fn default_dump() -> UiDump {
        UiDump::Elements(vec![RemoteElement {
            role: "button".into(),
            text: "OK".into(),
            center: [540, 1200],
            clickable: true,
            focusable: false,
        }])
    }
}

#[async_trait::async_trait]
impl DeviceChannel for MockChannel {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Phone
    }

    async fn connect(&self) -> Result<()> {
        self.record("connect".into())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record("disconnect".into())
    }

    async fn health_check(&self) -> Result<()> {
        self.record("health".into())
    }

    async fn screen_size(&self) -> Result<Screen> {
        Ok(TEST_SCREEN)
    }

    async fn screenshot(&self) -> Result<(Vec<u8>, Screen)> {
        self.record("screenshot".into())?;
        Ok((vec![0x89, b'P', b'N', b'G', 1, 2, 3], TEST_SCREEN))
    }

    async fn ui_snapshot(&self, _strategy: DumpStrategy) -> Result<UiDump> {
        if let Some(kind) = self.ui_failures.lock().pop_front() {
            return Err(Error::channel(kind, "scripted ui failure"));
        }
        Ok(self
            .ui_dumps
            .lock()
            .pop_front()
            .unwrap_or_else(Self::default_dump))
    }

    async fn tap(&self, x: i64, y: i64, _button: MouseButton, _clicks: u32) -> Result<()> {
        self.record(format!("tap({x},{y})"))
    }

    async fn swipe(&self, x1: i64, y1: i64, x2: i64, y2: i64, duration_ms: u64) -> Result<()> {
        self.record(format!("swipe({x1},{y1},{x2},{y2},{duration_ms})"))
    }

    async fn input_text(&self, text: &str) -> Result<()> {
        self.record(format!("input_text({text})"))
    }

    async fn key_event(&self, key: &str) -> Result<()> {
        self.record(format!("key_event({key})"))
    }

    async fn press_nav(&self, key: NavKey) -> Result<()> {
        self.record(format!("press_nav({key:?})"))
    }

    async fn launch_app(&self, app_name: &str) -> Result<()> {
        self.record(format!("launch_app({app_name})"))
    }

    async fn read_clipboard(&self) -> Result<String> {
        self.record("read_clipboard".into())?;
        Ok(self.clipboard.lock().clone())
    }

    async fn write_clipboard(&self, text: &str) -> Result<()> {
        self.record(format!("write_clipboard({text})"))
    }
}

/// LLM provider that replays a fixed script of responses.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
    pub requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(str::to_owned).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req.clone());
        let content = self.responses.lock().pop_front().ok_or(Error::Provider {
            provider: "scripted".into(),
            message: "script exhausted".into(),
        })?;
        Ok(ChatResponse {
            content,
            usage: Some(TokenUsage::new(100, 20)),
            model: "scripted".into(),
            finish_reason: Some("stop".into()),
        })
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

/// Records every callback invocation; scripts the ask-user answer.
pub struct RecordingCallback {
    pub starts: Mutex<Vec<(u32, StepStart)>>,
    pub completes: Mutex<Vec<(u32, bool, String)>>,
    pub recorded: Mutex<Vec<(String, Option<String>)>>,
    pub todos: Mutex<Vec<String>>,
    pub answer: Mutex<Option<String>>,
}

impl RecordingCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            starts: Mutex::new(Vec::new()),
            completes: Mutex::new(Vec::new()),
            recorded: Mutex::new(Vec::new()),
            todos: Mutex::new(Vec::new()),
            answer: Mutex::new(None),
        })
    }

    pub fn with_answer(answer: &str) -> Arc<Self> {
        let cb = Self::new();
        *cb.answer.lock() = Some(answer.to_owned());
        cb
    }
}

#[async_trait::async_trait]
impl StepCallback for RecordingCallback {
    async fn on_step_start(&self, step: u32, start: StepStart) {
        self.starts.lock().push((step, start));
    }

    async fn on_step_complete(&self, step: u32, success: bool, _thinking: &str, observation: &str) {
        self.completes
            .lock()
            .push((step, success, observation.to_owned()));
    }
}

#[async_trait::async_trait]
impl ExecutionCallback for RecordingCallback {
    async fn record_content(&self, content: &str, category: Option<&str>) {
        self.recorded
            .lock()
            .push((content.to_owned(), category.map(str::to_owned)));
    }

    async fn update_todos(&self, todos: &str) {
        self.todos.lock().push(todos.to_owned());
    }

    async fn ask_user(&self, _question: &str, _options: Option<&[String]>) -> Option<String> {
        self.answer.lock().clone()
    }
}
