//! Planner：调用 UI 控制器模型并解析动作
//!
//! 模型输出形如 `思考... do(action="Tap", element=[500,120])` 或 `finish(message="...")`。
//! parse_thinking_and_action 拆出思考与动作文本，parse_agent_action 把动作文本解析为 Action。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;

pub const KEYCODE_HOME: i32 = 3;
pub const KEYCODE_BACK: i32 = 4;
pub const KEYCODE_CLEAR: i32 = 28;
/// 单次 Wait 的上限
pub const MAX_WAIT_MS: u64 = 60_000;
/// system prompt 中任务段的标题
pub const TASK_HEADING: &str = "\n\n# 当前任务\n";

/// 一步要执行的动作。Tap / LongPress / Swipe 的坐标是 0..=1000 的相对坐标。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Tap { x: i32, y: i32 },
    LongPress { x: i32, y: i32 },
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        /// None 时使用配置的默认时长
        duration_ms: Option<u64>,
    },
    Key { code: i32, meta: i32 },
    SetText { value: String },
    /// 应用名或包名，由执行器经应用目录解析
    StartApp { package_id: String },
    SwitchSurface { session_id: String },
    Wait { duration_ms: u64 },
    TakeOver { message: String },
    Finish { summary: String },
}

impl Action {
    /// 日志与事件中使用的短名
    pub fn name(&self) -> &'static str {
        match self {
            Action::Tap { .. } => "Tap",
            Action::LongPress { .. } => "LongPress",
            Action::Swipe { .. } => "Swipe",
            Action::Key { .. } => "Key",
            Action::SetText { .. } => "SetText",
            Action::StartApp { .. } => "StartApp",
            Action::SwitchSurface { .. } => "SwitchSurface",
            Action::Wait { .. } => "Wait",
            Action::TakeOver { .. } => "TakeOver",
            Action::Finish { .. } => "Finish",
        }
    }
}

/// 一次推理的结果：思考、动作（或解析失败原因）
#[derive(Debug, Clone)]
pub struct Decision {
    pub thinking: Option<String>,
    pub action: Result<Action, String>,
    /// 写回历史的动作文本
    pub answer: String,
}

impl Decision {
    pub fn from_output(output: &str) -> Self {
        let (thinking, answer) = parse_thinking_and_action(output);
        let action = parse_agent_action(&answer).map_err(|e| e.to_string());
        Self {
            thinking,
            action,
            answer,
        }
    }

    /// 写入对话历史的 assistant 内容
    pub fn history_entry(&self) -> String {
        format!(
            "<think>{}</think><answer>{}</answer>",
            self.thinking.as_deref().unwrap_or(""),
            self.answer
        )
    }
}

fn tag_regex(tag: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).ok()
}

fn extract_tag(text: &str, tag: &str) -> Option<String> {
    tag_regex(tag)?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// 拆分思考与动作：优先 `finish(message=`，其次 `do(action=`，再看 <think>/<answer> 标签
pub fn parse_thinking_and_action(content: &str) -> (Option<String>, String) {
    let full = content.trim();
    for marker in ["finish(message=", "do(action="] {
        if let Some(idx) = full.find(marker) {
            return (non_empty(&full[..idx]), full[idx..].trim().to_string());
        }
    }
    let think = extract_tag(full, "think");
    let answer = extract_tag(full, "answer");
    if think.is_some() || answer.is_some() {
        return (think, answer.unwrap_or_else(|| full.to_string()));
    }
    (None, full.to_string())
}

fn field_regex() -> &'static Option<Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(\w+)\s*=\s*(?:\[(.*?)\]|"(.*?)"|'([^']*)'|([^,)]+))"#).ok())
}

fn finish_regex() -> &'static Option<Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)finish\s*\(\s*message\s*=\s*"(.*)"\s*\)"#).ok())
}

/// 解析 do(...) 的字段：key=[...] / key="..." / key='...' / key=裸值
fn parse_fields(inner: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    if let Some(re) = field_regex() {
        for caps in re.captures_iter(inner) {
            let key = caps[1].to_string();
            let value = (2..=5)
                .filter_map(|i| caps.get(i))
                .map(|m| m.as_str())
                .find(|v| !v.is_empty())
                .unwrap_or("")
                .trim()
                .to_string();
            fields.insert(key, value);
        }
    }
    fields
}

fn parse_point(value: Option<&String>, field: &str) -> Result<(i32, i32), AgentError> {
    let raw = value.ok_or_else(|| AgentError::ParseError(format!("missing {field}")))?;
    let parts: Vec<&str> = raw
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .collect();
    if parts.len() < 2 {
        return Err(AgentError::ParseError(format!("bad {field}: [{raw}]")));
    }
    let x = parts[0]
        .parse::<i32>()
        .map_err(|_| AgentError::ParseError(format!("bad {field}: [{raw}]")))?;
    let y = parts[1]
        .parse::<i32>()
        .map_err(|_| AgentError::ParseError(format!("bad {field}: [{raw}]")))?;
    Ok((x, y))
}

/// "2 seconds" / "1.5" -> 毫秒，默认 1 秒，不超过 MAX_WAIT_MS
fn parse_duration_secs(value: Option<&String>) -> u64 {
    let secs = value
        .map(|v| v.replace("seconds", "").replace("second", ""))
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .unwrap_or(1.0);
    ((secs * 1000.0) as u64).min(MAX_WAIT_MS)
}

/// 解析动作文本；多个 do( / finish( 时取最后一个
pub fn parse_agent_action(raw: &str) -> Result<Action, AgentError> {
    let original = raw.trim();
    let start = match (original.rfind("finish("), original.rfind("do(")) {
        (Some(f), Some(d)) => Some(f.max(d)),
        (f, d) => f.or(d),
    };
    let trimmed = start.map(|i| original[i..].trim()).unwrap_or(original);

    if trimmed.starts_with("finish") {
        let summary = finish_regex()
            .as_ref()
            .and_then(|re| re.captures(trimmed))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        return Ok(Action::Finish { summary });
    }

    if !trimmed.starts_with("do") {
        return Err(AgentError::ParseError(preview(original)));
    }

    let mut inner = trimmed["do".len()..].trim();
    if inner.starts_with('(') && inner.ends_with(')') {
        inner = &inner[1..inner.len() - 1];
    }
    let fields = parse_fields(inner);
    let name = fields
        .get("action")
        .cloned()
        .ok_or_else(|| AgentError::ParseError(format!("do() without action: {}", preview(original))))?;

    let action = match name.as_str() {
        "Tap" => {
            let (x, y) = parse_point(fields.get("element"), "element")?;
            Action::Tap { x, y }
        }
        "Long Press" | "Long_Press" | "LongPress" => {
            let (x, y) = parse_point(fields.get("element"), "element")?;
            Action::LongPress { x, y }
        }
        "Swipe" => {
            let (x1, y1) = parse_point(fields.get("start"), "start")?;
            let (x2, y2) = parse_point(fields.get("end"), "end")?;
            let duration_ms = fields
                .get("duration")
                .map(|_| parse_duration_secs(fields.get("duration")));
            Action::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            }
        }
        "Type" | "Type_Name" => Action::SetText {
            value: fields.get("text").cloned().unwrap_or_default(),
        },
        "Launch" => {
            let app = fields
                .get("app")
                .filter(|a| !a.trim().is_empty())
                .cloned()
                .ok_or_else(|| AgentError::ParseError("No app name specified for Launch".to_string()))?;
            Action::StartApp { package_id: app }
        }
        "Back" => Action::Key {
            code: KEYCODE_BACK,
            meta: 0,
        },
        "Home" => Action::Key {
            code: KEYCODE_HOME,
            meta: 0,
        },
        "Key" => {
            let code = fields
                .get("code")
                .and_then(|c| c.parse::<i32>().ok())
                .ok_or_else(|| AgentError::ParseError("Key requires an integer code".to_string()))?;
            let meta = fields
                .get("meta")
                .and_then(|m| m.parse::<i32>().ok())
                .unwrap_or(0);
            Action::Key { code, meta }
        }
        "Wait" => Action::Wait {
            duration_ms: parse_duration_secs(fields.get("duration")),
        },
        "Take_over" => Action::TakeOver {
            message: fields
                .get("message")
                .cloned()
                .unwrap_or_else(|| "User takeover required".to_string()),
        },
        "Switch_surface" => {
            let session_id = fields
                .get("session")
                .filter(|s| !s.trim().is_empty())
                .cloned()
                .ok_or_else(|| AgentError::ParseError("Switch_surface requires session".to_string()))?;
            Action::SwitchSurface { session_id }
        }
        other => return Err(AgentError::ParseError(format!("Unknown action: {other}"))),
    };
    Ok(action)
}

fn preview(s: &str) -> String {
    const MAX: usize = 200;
    if s.chars().count() > MAX {
        format!("{}...", s.chars().take(MAX).collect::<String>())
    } else {
        s.to_string()
    }
}

/// Planner：持有 LLM 与 system prompt，拼 system + messages 后调用 LLM
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    request_timeout: Option<Duration>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 使用动态拼接的 system（基础提示词 + 当前任务）
    pub async fn plan_with_system(&self, messages: &[Message], system: &str) -> Result<String, AgentError> {
        let mut full_messages = Vec::with_capacity(messages.len() + 1);
        full_messages.push(Message::system(system.to_string()));
        full_messages.extend(messages.iter().cloned());

        let call = self.llm.complete(&full_messages);
        let result = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => Err(format!("timed out after {}s", limit.as_secs())),
            },
            None => call.await,
        };
        result.map_err(AgentError::ReasoningFailed)
    }

    /// 针对某个任务推理一步；只有推理调用本身失败才返回 Err
    pub async fn decide(&self, task: &str, messages: &[Message]) -> Result<Decision, AgentError> {
        let system = format!("{}{TASK_HEADING}{}", self.system_prompt, task);
        let output = self.plan_with_system(messages, &system).await?;
        Ok(Decision::from_output(&output))
    }
}
