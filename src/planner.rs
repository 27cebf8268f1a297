//! Vision-language planner: turns (task, history, screenshot) into the
//! next proposed action.
//!
//! Two interchangeable backends implement the same [`Planner`] trait:
//! - [`RemotePlanner`]: a hosted chat-completions API with bearer auth
//! - [`LocalPlanner`]: a locally served model speaking the same wire
//!   format on localhost, no auth
//!
//! The agent loop holds a `Box<dyn Planner>` and never learns which one
//! is active. Both backends bound their requests with connect and
//! whole-request timeouts so a stalled endpoint cannot hang a run, and
//! both apply the trailing-window policy to the history they are given.

use base64::Engine;
use std::process::Command;

use crate::config::{self, Lang};
use crate::device::Screenshot;
use crate::run::History;

/// Result type for planner operations
pub type PlannerResult<T> = Result<T, PlannerError>;

/// Errors that can occur while planning
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerError {
    /// Could not reach the endpoint, or the request timed out
    NetworkFailure(String),
    /// The endpoint asked us to back off
    RateLimited,
    /// The response could not be interpreted as a completion
    Malformed(String),
    /// The endpoint rejected our credentials
    AuthFailure(String),
}

impl PlannerError {
    /// Transient failures are worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlannerError::NetworkFailure(_) | PlannerError::RateLimited
        )
    }
}

impl std::fmt::Display for PlannerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlannerError::NetworkFailure(msg) => write!(f, "Network failure: {}", msg),
            PlannerError::RateLimited => write!(f, "Rate limited by the model endpoint"),
            PlannerError::Malformed(msg) => write!(f, "Malformed model response: {}", msg),
            PlannerError::AuthFailure(msg) => write!(f, "Authentication failed: {}", msg),
        }
    }
}

impl std::error::Error for PlannerError {}

impl From<std::io::Error> for PlannerError {
    fn from(e: std::io::Error) -> Self {
        PlannerError::NetworkFailure(e.to_string())
    }
}

/// Raw, unvalidated planner output believed to encode one action
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub raw: String,
}

/// Trait for action planners
pub trait Planner: Send {
    /// Propose the next action for `task` given the run so far and the
    /// current screen. The implementation decides how much trailing
    /// history actually reaches the model.
    fn plan(
        &self,
        task: &str,
        history: &History,
        screenshot: &Screenshot,
    ) -> PlannerResult<PlannedAction>;

    /// Backend identifier (e.g., "remote", "local")
    fn backend(&self) -> &str;
}

/// Planner backed by a hosted chat-completions API
pub struct RemotePlanner {
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens: u32,
    connect_timeout: u64,
    request_timeout: u64,
    history_window: usize,
    lang: Lang,
}

impl RemotePlanner {
    /// Create a remote planner from the global configuration
    pub fn from_config() -> Self {
        let cfg = config::get();
        Self {
            endpoint: cfg.model.endpoint.clone(),
            model: cfg.model.model.clone(),
            api_key: cfg.model.api_key.clone(),
            max_tokens: cfg.model.max_tokens,
            connect_timeout: cfg.model.connect_timeout,
            request_timeout: cfg.model.request_timeout,
            history_window: cfg.agent.history_window,
            lang: cfg.agent.lang,
        }
    }

    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            ..Self::from_config()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn lang(mut self, lang: Lang) -> Self {
        self.lang = lang;
        self
    }

    pub fn history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }
}

impl Planner for RemotePlanner {
    fn plan(
        &self,
        task: &str,
        history: &History,
        screenshot: &Screenshot,
    ) -> PlannerResult<PlannedAction> {
        let prompt = build_step_prompt(task, history, self.history_window, self.lang);
        let request = build_request(&self.model, screenshot, &prompt, self.max_tokens);
        let api_key = (!self.api_key.is_empty()).then_some(self.api_key.as_str());
        let body = chat_completion(
            &self.endpoint,
            api_key,
            &request,
            self.connect_timeout,
            self.request_timeout,
        )?;
        let content = parse_completion(&body)?;
        Ok(PlannedAction { raw: content })
    }

    fn backend(&self) -> &str {
        "remote"
    }
}

/// Planner backed by a locally served model (vLLM or compatible)
pub struct LocalPlanner {
    endpoint: String,
    model: String,
    max_tokens: u32,
    connect_timeout: u64,
    request_timeout: u64,
    history_window: usize,
    lang: Lang,
}

impl LocalPlanner {
    /// Create a local planner for the configured localhost port
    pub fn from_config() -> Self {
        let cfg = config::get();
        Self {
            endpoint: local_endpoint(cfg.model.local_port),
            model: "local-model".to_string(),
            max_tokens: cfg.model.max_tokens,
            connect_timeout: cfg.model.connect_timeout,
            request_timeout: cfg.model.request_timeout,
            history_window: cfg.agent.history_window,
            lang: cfg.agent.lang,
        }
    }

    pub fn on_port(port: u16) -> Self {
        Self {
            endpoint: local_endpoint(port),
            ..Self::from_config()
        }
    }

    pub fn lang(mut self, lang: Lang) -> Self {
        self.lang = lang;
        self
    }

    /// Probe whether the local server accepts connections. Cheap check
    /// used at run setup, not inside the loop.
    pub fn check_ready(&self, timeout_secs: u64) -> PlannerResult<bool> {
        check_endpoint(&self.endpoint, timeout_secs)
    }
}

impl Planner for LocalPlanner {
    fn plan(
        &self,
        task: &str,
        history: &History,
        screenshot: &Screenshot,
    ) -> PlannerResult<PlannedAction> {
        let prompt = build_step_prompt(task, history, self.history_window, self.lang);
        let request = build_request(&self.model, screenshot, &prompt, self.max_tokens);
        let body = chat_completion(
            &self.endpoint,
            None,
            &request,
            self.connect_timeout,
            self.request_timeout,
        )?;
        let content = parse_completion(&body)?;
        Ok(PlannedAction { raw: content })
    }

    fn backend(&self) -> &str {
        "local"
    }
}

fn local_endpoint(port: u16) -> String {
    format!("http://127.0.0.1:{}/v1/chat/completions", port)
}

/// Check if an endpoint is reachable (connection-only check).
///
/// Only verifies the server accepts connections; model requests can take
/// much longer than any probe should.
pub fn check_endpoint(endpoint: &str, timeout_secs: u64) -> PlannerResult<bool> {
    let url = endpoint
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let host_port = url.split('/').next().unwrap_or("127.0.0.1:8000");

    let output = Command::new("curl")
        .args([
            "-s",
            "-o",
            "/dev/null",
            "-w",
            "%{http_code}",
            "--connect-timeout",
            &timeout_secs.to_string(),
            "--max-time",
            &timeout_secs.to_string(),
            "-I",
            &format!("http://{}", host_port),
        ])
        .output()?;

    let status = String::from_utf8_lossy(&output.stdout);
    // Any HTTP status (even 4xx/5xx) means the server is reachable;
    // 000 means the connection failed entirely
    let code: u16 = status.trim().parse().unwrap_or(0);
    Ok(code > 0)
}

/// Build the chat-completions request with the screenshot attached as a
/// base64 image part
fn build_request(model: &str, screenshot: &Screenshot, prompt: &str, max_tokens: u32) -> String {
    let img_base64 = base64::engine::general_purpose::STANDARD.encode(&screenshot.png_data);

    let request = serde_json::json!({
        "model": model,
        "messages": [{
            "role": "user",
            "content": [
                {
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:image/png;base64,{}", img_base64)
                    }
                },
                {
                    "type": "text",
                    "text": prompt
                }
            ]
        }],
        "max_tokens": max_tokens
    });

    request.to_string()
}

/// POST a chat-completions request and return the response body.
///
/// The HTTP status code rides along after the body (`-w`) so failures can
/// be classified without a second request.
fn chat_completion(
    endpoint: &str,
    api_key: Option<&str>,
    request_json: &str,
    connect_timeout: u64,
    request_timeout: u64,
) -> PlannerResult<String> {
    let auth_header;
    let mut args = vec![
        "-s",
        "-X",
        "POST",
        endpoint,
        "-H",
        "Content-Type: application/json",
        "-d",
        request_json,
        "-w",
        "\n%{http_code}",
    ];
    if let Some(key) = api_key {
        auth_header = format!("Authorization: Bearer {}", key);
        args.push("-H");
        args.push(&auth_header);
    }
    let connect = connect_timeout.to_string();
    let max_time = request_timeout.to_string();
    args.extend(["--connect-timeout", &connect, "--max-time", &max_time]);

    let output = Command::new("curl").args(&args).output()?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();

    let (body, code) = split_status_trailer(&stdout).ok_or_else(|| {
        PlannerError::NetworkFailure(String::from_utf8_lossy(&output.stderr).to_string())
    })?;

    classify_status(code, body)
}

/// Split the `-w "\n%{http_code}"` trailer off the response body
fn split_status_trailer(stdout: &str) -> Option<(&str, u16)> {
    let idx = stdout.rfind('\n')?;
    let code = stdout[idx + 1..].trim().parse().ok()?;
    Some((&stdout[..idx], code))
}

/// Map an HTTP status to the planner error taxonomy
fn classify_status(code: u16, body: &str) -> PlannerResult<String> {
    match code {
        200..=299 => Ok(body.to_string()),
        401 | 403 => Err(PlannerError::AuthFailure(snippet(body))),
        429 => Err(PlannerError::RateLimited),
        0 => Err(PlannerError::NetworkFailure(
            "connection failed or timed out".to_string(),
        )),
        other => Err(PlannerError::NetworkFailure(format!(
            "HTTP {}: {}",
            other,
            snippet(body)
        ))),
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Extract the completion text from a chat-completions response body
fn parse_completion(body: &str) -> PlannerResult<String> {
    let response: serde_json::Value =
        serde_json::from_str(body).map_err(|e| PlannerError::Malformed(e.to_string()))?;

    let content = response["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("");

    // Thinking models put their text in reasoning_content instead
    let result = if content.is_empty() {
        response["choices"][0]["message"]["reasoning_content"]
            .as_str()
            .unwrap_or("")
    } else {
        content
    };

    if result.is_empty() {
        return Err(PlannerError::Malformed(
            "response carries no completion content".to_string(),
        ));
    }

    Ok(result.to_string())
}

/// Build the per-step prompt: instructions, recent history, and the task
pub fn build_step_prompt(task: &str, history: &History, window: usize, lang: Lang) -> String {
    let instructions = match lang {
        Lang::En => {
            "You are operating an Android phone to complete a task. Look at the \
             current screenshot and decide the single next action.\n\
             Reply with exactly one JSON object, nothing else:\n\
             {\"action\": \"tap\", \"x\": <px>, \"y\": <px>}\n\
             {\"action\": \"swipe\", \"start\": [x, y], \"end\": [x, y], \"duration\": <ms>}\n\
             {\"action\": \"type\", \"text\": \"...\"}\n\
             {\"action\": \"key\", \"key\": \"back|home|enter\"}\n\
             {\"action\": \"wait\", \"duration\": <ms>}\n\
             {\"action\": \"done\", \"summary\": \"...\"} when the task is complete\n\
             {\"action\": \"fail\", \"reason\": \"...\"} when the task cannot continue"
        }
        Lang::Cn => {
            "你正在操作一台安卓手机来完成任务。观察当前屏幕截图，决定下一步的单个操作。\n\
             只回复一个 JSON 对象，不要附加其他内容：\n\
             {\"action\": \"tap\", \"x\": <px>, \"y\": <px>}\n\
             {\"action\": \"swipe\", \"start\": [x, y], \"end\": [x, y], \"duration\": <ms>}\n\
             {\"action\": \"type\", \"text\": \"...\"}\n\
             {\"action\": \"key\", \"key\": \"back|home|enter\"}\n\
             {\"action\": \"wait\", \"duration\": <ms>}\n\
             任务完成时回复 {\"action\": \"done\", \"summary\": \"...\"}\n\
             无法继续时回复 {\"action\": \"fail\", \"reason\": \"...\"}"
        }
    };

    let history_block = render_history(history, window, lang);
    let task_label = match lang {
        Lang::En => "Task",
        Lang::Cn => "任务",
    };

    if history_block.is_empty() {
        format!("{}\n\n{}: {}", instructions, task_label, task)
    } else {
        format!(
            "{}\n\n{}\n\n{}: {}",
            instructions, history_block, task_label, task
        )
    }
}

/// Render the trailing window of steps into prompt lines
fn render_history(history: &History, window: usize, lang: Lang) -> String {
    if history.is_empty() {
        return String::new();
    }

    let header = match lang {
        Lang::En => "Previous steps:",
        Lang::Cn => "已执行的步骤：",
    };

    let mut lines = vec![header.to_string()];
    for step in history.tail(window) {
        let line = match (&step.action, &step.error) {
            (Some(action), _) => {
                let outcome = match &step.exec {
                    Some(exec) if exec.success => "ok".to_string(),
                    Some(exec) => format!(
                        "failed: {}",
                        exec.message.as_deref().unwrap_or("unknown error")
                    ),
                    None => "-".to_string(),
                };
                format!("{}. {} -> {}", step.index + 1, action, outcome)
            }
            (None, Some(error)) => {
                format!("{}. rejected: {}", step.index + 1, error)
            }
            (None, None) => format!("{}. (no action)", step.index + 1),
        };
        lines.push(line);
    }
    lines.join("\n")
}
