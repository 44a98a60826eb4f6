//! 任务提交接口（供外层工具调用 LLM 或命令行使用）
//!
//! - run_subagent：单任务 `{intent, max_steps?, session_id?}`
//! - run_subagent_parallel：槽位 1..=4 `{intent_i, target_app_i, max_steps_i?, session_id_i?}`
//!
//! 两者都返回 `{success, message, data}` JSON，参数校验失败时不启动任何运行。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{normalize_app, OrchestratorError, SubmitOptions, Task, TaskOrchestrator, TaskReport};
use crate::react::StepResult;

/// 日志预览中每条记录的最大字符数
pub const LOG_PREVIEW_CHARS: usize = 200;
/// 并行槽位数
pub const MAX_SLOTS: usize = 4;

/// 单任务参数
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct SubagentRequest {
    /// 要完成的自然语言任务
    pub intent: String,
    /// 最大步数，默认 20
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// 复用已有会话（及其虚拟屏）
    #[serde(default)]
    pub session_id: Option<String>,
}

/// 并行任务参数：最多 4 个槽位，每个填写了 intent 的槽位必须声明 target_app
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ParallelSubagentRequest {
    #[serde(default)]
    pub intent_1: Option<String>,
    #[serde(default)]
    pub target_app_1: Option<String>,
    #[serde(default)]
    pub max_steps_1: Option<usize>,
    #[serde(default)]
    pub session_id_1: Option<String>,

    #[serde(default)]
    pub intent_2: Option<String>,
    #[serde(default)]
    pub target_app_2: Option<String>,
    #[serde(default)]
    pub max_steps_2: Option<usize>,
    #[serde(default)]
    pub session_id_2: Option<String>,

    #[serde(default)]
    pub intent_3: Option<String>,
    #[serde(default)]
    pub target_app_3: Option<String>,
    #[serde(default)]
    pub max_steps_3: Option<usize>,
    #[serde(default)]
    pub session_id_3: Option<String>,

    #[serde(default)]
    pub intent_4: Option<String>,
    #[serde(default)]
    pub target_app_4: Option<String>,
    #[serde(default)]
    pub max_steps_4: Option<usize>,
    #[serde(default)]
    pub session_id_4: Option<String>,

    /// 依次执行而不是并行
    #[serde(default)]
    pub sequential: bool,
}

impl ParallelSubagentRequest {
    /// 填写了 intent 的槽位：(槽位号, 任务)
    pub fn slots(&self) -> Vec<(usize, Task)> {
        let raw = [
            (&self.intent_1, &self.target_app_1, self.max_steps_1, &self.session_id_1),
            (&self.intent_2, &self.target_app_2, self.max_steps_2, &self.session_id_2),
            (&self.intent_3, &self.target_app_3, self.max_steps_3, &self.session_id_3),
            (&self.intent_4, &self.target_app_4, self.max_steps_4, &self.session_id_4),
        ];
        raw.into_iter()
            .enumerate()
            .filter_map(|(i, (intent, app, max_steps, session))| {
                let intent = intent.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
                Some((
                    i + 1,
                    Task {
                        intent: intent.to_string(),
                        max_steps,
                        session_id: session.clone(),
                        target_app: app.clone(),
                    },
                ))
            })
            .collect()
    }
}

/// 统一的返回结构
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    pub message: String,
    pub data: Value,
}

impl ToolResponse {
    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| String::from("{}"))
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 逐步日志的文本预览
pub fn log_preview(log: &[StepResult]) -> Vec<String> {
    log.iter()
        .map(|step| {
            let action = step
                .action
                .as_ref()
                .map(|a| a.name())
                .unwrap_or("none");
            let line = format!(
                "[{}] {} {}: {}",
                step.index,
                if step.success { "ok" } else { "fail" },
                action,
                step.message
            );
            truncate(&line, LOG_PREVIEW_CHARS)
        })
        .collect()
}

fn report_data(report: &TaskReport) -> Value {
    json!({
        "session_id": report.session_id,
        "surface_id": report.surface_id,
        "steps": report.steps(),
        "max_steps": report.max_steps,
        "finished": report.finished(),
        "status": report.status,
        "final_message": report.message,
        "log": log_preview(&report.log),
    })
}

/// 单任务：运行到终态后返回
pub async fn run_subagent(orchestrator: &TaskOrchestrator, request: SubagentRequest) -> ToolResponse {
    let task = Task {
        intent: request.intent,
        max_steps: request.max_steps,
        session_id: request.session_id,
        target_app: None,
    };
    match orchestrator.run_single(task, SubmitOptions::default()).await {
        Ok(report) => ToolResponse {
            success: report.success,
            message: report.message.clone(),
            data: report_data(&report),
        },
        Err(e) => ToolResponse::error(e.to_string()),
    }
}

/// 槽位级校验：错误信息里使用槽位号而不是批内位置
fn validate_slots(slots: &[(usize, Task)]) -> Result<(), OrchestratorError> {
    if slots.is_empty() {
        return Err(OrchestratorError::BatchSize {
            got: 0,
            max: MAX_SLOTS,
        });
    }
    let missing: Vec<usize> = slots
        .iter()
        .filter(|(_, t)| normalize_app(t.target_app.as_deref()).is_none())
        .map(|(slot, _)| *slot)
        .collect();
    if !missing.is_empty() {
        return Err(OrchestratorError::MissingTargetApp(missing));
    }
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (slot, task) in slots {
        if let Some(app) = normalize_app(task.target_app.as_deref()) {
            if let Some(&first) = seen.get(&app) {
                return Err(OrchestratorError::DuplicateTargetApp {
                    first,
                    second: *slot,
                    app: task.target_app.clone().unwrap_or_default().trim().to_string(),
                });
            }
            seen.insert(app, *slot);
        }
    }
    Ok(())
}

/// 多任务：每个槽位一个会话，汇总「成功 k 个 / 共 n 个」
pub async fn run_subagent_parallel(
    orchestrator: &TaskOrchestrator,
    request: ParallelSubagentRequest,
) -> ToolResponse {
    let slots = request.slots();
    if let Err(e) = validate_slots(&slots) {
        return ToolResponse::error(e.to_string());
    }

    let slot_numbers: Vec<usize> = slots.iter().map(|(slot, _)| *slot).collect();
    let tasks: Vec<Task> = slots.into_iter().map(|(_, t)| t).collect();
    let options = SubmitOptions {
        sequential: request.sequential,
        ..Default::default()
    };
    let handle = match orchestrator.submit(tasks, options).await {
        Ok(h) => h,
        Err(e) => return ToolResponse::error(e.to_string()),
    };
    let batch = handle.join().await;

    let results: Vec<Value> = batch
        .results
        .iter()
        .map(|report| {
            let slot = slot_numbers.get(report.index - 1).copied().unwrap_or(report.index);
            let mut entry = json!({
                "index": slot,
                "success": report.success,
                "target_app": report.target_app,
                "session_id": report.session_id,
            });
            let key = if report.success { "result" } else { "error" };
            entry[key] = Value::String(report.message.clone());
            entry["data"] = report_data(report);
            entry
        })
        .collect();

    ToolResponse {
        success: batch.success_count == batch.total(),
        message: batch.summary(),
        data: json!({ "results": results, "success_count": batch.success_count, "total": batch.total() }),
    }
}

/// 解析 JSON 请求：包含 intent_1..4 任一字段时按并行处理，否则按单任务
pub async fn handle_request(orchestrator: &TaskOrchestrator, raw: &str) -> ToolResponse {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return ToolResponse::error(format!("Invalid request JSON: {e}")),
    };
    let parallel = (1..=MAX_SLOTS).any(|i| value.get(format!("intent_{i}")).is_some());
    if parallel {
        match serde_json::from_value::<ParallelSubagentRequest>(value) {
            Ok(req) => run_subagent_parallel(orchestrator, req).await,
            Err(e) => ToolResponse::error(format!("Invalid parallel request: {e}")),
        }
    } else {
        match serde_json::from_value::<SubagentRequest>(value) {
            Ok(req) => run_subagent(orchestrator, req).await,
            Err(e) => ToolResponse::error(format!("Invalid request: {e}")),
        }
    }
}

/// 两个接口的参数 JSON Schema
pub fn request_schemas() -> Value {
    json!({
        "run_subagent": schema_for!(SubagentRequest),
        "run_subagent_parallel": schema_for!(ParallelSubagentRequest),
    })
}
