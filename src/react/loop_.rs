//! Agent 主循环
//!
//! Capture -> Reason -> Parse -> Act，每轮恰好产生一个 StepResult（包括内部失败的轮次）。
//! 终止条件：finish / Take_over（Finished）、步数耗尽（Exhausted）、取消（Cancelled）、
//! 通道恢复失败（Errored）。取消只在每轮开始前检查（Wait 例外，会提前结束），进行中的 IPC 不会被打断。
//! 每步的结果写进下一轮的观察，模型能看到上一步失败的原因。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine, RunState, SessionSupervisor};
use crate::react::{Action, ContextManager, Decision, Planner, StepEvent, StepEventKind};
use crate::tools::ActionExecutor;

/// 默认步数预算
pub const DEFAULT_MAX_STEPS: usize = 20;
/// 默认历史窗口（轮）
pub const DEFAULT_HISTORY_WINDOW: usize = 8;
/// 思考内容展示最大字符数
const THINKING_PREVIEW_CHARS: usize = 800;

/// 一轮的记录（只追加）
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// 从 1 开始
    pub index: usize,
    pub thinking: Option<String>,
    pub action: Option<Action>,
    pub message: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// 一次运行的最终结果
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    /// SwitchSurface 之后最后驱动的会话
    pub active_session_id: String,
    pub state: RunState,
    /// 以 Take_over 结束（需要用户接管）
    pub handed_over: bool,
    pub final_message: String,
    pub max_steps: usize,
    pub steps: Vec<StepResult>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.state == RunState::Finished && !self.handed_over
    }
}

fn send_event(tx: &Option<mpsc::UnboundedSender<StepEvent>>, session_id: &str, kind: StepEventKind) {
    if let Some(t) = tx {
        let _ = t.send(StepEvent {
            session_id: session_id.to_string(),
            kind,
        });
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 单个任务的运行时：绑定一个会话，驱动到终态
pub struct AgentRuntime {
    planner: Arc<Planner>,
    executor: Arc<ActionExecutor>,
    recovery: RecoveryEngine,
    session_id: String,
    task: String,
    max_steps: usize,
    history_window: usize,
    cancel_token: CancellationToken,
    event_tx: Option<mpsc::UnboundedSender<StepEvent>>,
    supervisor: Option<Arc<SessionSupervisor>>,
}

impl AgentRuntime {
    pub fn new(
        planner: Arc<Planner>,
        executor: Arc<ActionExecutor>,
        session_id: impl Into<String>,
        task: impl Into<String>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            planner,
            executor,
            recovery: RecoveryEngine::new(),
            session_id: session_id.into(),
            task: task.into(),
            max_steps: DEFAULT_MAX_STEPS,
            history_window: DEFAULT_HISTORY_WINDOW,
            cancel_token,
            event_tx: None,
            supervisor: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_history_window(mut self, turns: usize) -> Self {
        self.history_window = turns.max(1);
        self
    }

    pub fn with_event_tx(mut self, tx: mpsc::UnboundedSender<StepEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// SwitchSurface 前向监管者申请目标会话，拒绝切到其他运行中任务的会话
    pub fn with_supervisor(mut self, supervisor: Arc<SessionSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 运行到终态
    pub async fn run(self) -> RunOutcome {
        let mut context = ContextManager::new(self.history_window);
        let mut active = self.session_id.clone();
        let mut steps: Vec<StepResult> = Vec::new();
        let mut handed_over = false;
        let mut final_message: Option<String> = None;

        tracing::info!(
            "[{}] run started (max_steps={}): {}",
            self.session_id,
            self.max_steps,
            preview(&self.task, 100)
        );

        let state = loop {
            if self.cancel_token.is_cancelled() {
                break RunState::Cancelled;
            }

            let index = steps.len() + 1;
            send_event(
                &self.event_tx,
                &self.session_id,
                StepEventKind::StepStarted {
                    step: index,
                    max_steps: self.max_steps,
                },
            );

            let (step, next_state) = self.step(index, &mut active, &mut context).await;
            send_event(
                &self.event_tx,
                &self.session_id,
                StepEventKind::StepResult { result: step.clone() },
            );
            context.note_outcome(step.index, step.success, &step.message);
            let message = step.message.clone();
            steps.push(step);

            match next_state {
                StepEnd::Continue => {}
                StepEnd::Finished { handed_over: h } => {
                    handed_over = h;
                    final_message = Some(message);
                    break RunState::Finished;
                }
                StepEnd::Errored => {
                    final_message = Some(message);
                    break RunState::Errored;
                }
            }

            if steps.len() >= self.max_steps {
                break RunState::Exhausted;
            }
        };

        let final_message = match state {
            RunState::Cancelled => "Cancelled".to_string(),
            RunState::Exhausted => format!(
                "Reached max steps ({}). Last step: {}",
                self.max_steps,
                steps.last().map(|s| s.message.as_str()).unwrap_or("")
            ),
            _ => final_message.unwrap_or_default(),
        };

        match state {
            RunState::Finished if !handed_over => {
                tracing::info!("[{}] finished after {} steps", self.session_id, steps.len())
            }
            RunState::Errored => {
                tracing::error!("[{}] aborted: {}", self.session_id, final_message)
            }
            _ => tracing::warn!(
                "[{}] ended as {:?} after {} steps",
                self.session_id,
                state,
                steps.len()
            ),
        }
        let (prompt_tokens, completion_tokens, total_tokens) = self.planner.token_usage();
        tracing::debug!(
            session = %self.session_id,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            "token usage so far"
        );
        send_event(
            &self.event_tx,
            &self.session_id,
            StepEventKind::Finished {
                state,
                message: final_message.clone(),
            },
        );

        RunOutcome {
            session_id: self.session_id.clone(),
            active_session_id: active,
            state,
            handed_over,
            final_message,
            max_steps: self.max_steps,
            steps,
        }
    }

    /// 一轮：截图、推理、解析、执行；总是返回一个 StepResult
    async fn step(&self, index: usize, active: &mut String, context: &mut ContextManager) -> (StepResult, StepEnd) {
        let record = |thinking: Option<String>, action: Option<Action>, message: String, success: bool| StepResult {
            index,
            thinking,
            action,
            message,
            success,
            timestamp: Utc::now(),
        };

        let capture = self.executor.capture(active).await;
        if let Err(e) = &capture {
            if e.is_fatal() {
                let err = AgentError::Surface(e.clone());
                let message = match self.recovery.handle(&err) {
                    RecoveryAction::Abort(m) | RecoveryAction::RecordAndContinue(m) => m,
                };
                return (record(None, None, message, false), StepEnd::Errored);
            }
            tracing::debug!("[{}] capture unavailable: {}", active, e);
        }

        let current = context.observe(&capture, index, self.max_steps);
        let messages = context.to_llm_messages(&current);

        let decision: Decision = match self.planner.decide(&self.task, &messages).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("[{}] step {} reasoning failed: {}", active, index, e);
                return (self.recovered(&e, record(None, None, String::new(), false)), StepEnd::Continue);
            }
        };
        context.record_turn(current, decision.history_entry());

        if let Some(thinking) = &decision.thinking {
            send_event(
                &self.event_tx,
                &self.session_id,
                StepEventKind::Thinking {
                    text: preview(thinking, THINKING_PREVIEW_CHARS),
                },
            );
        }

        let action = match decision.action {
            Ok(action) => action,
            Err(reason) => {
                let err = AgentError::ParseError(reason);
                return (
                    self.recovered(&err, record(decision.thinking, None, String::new(), false)),
                    StepEnd::Continue,
                );
            }
        };

        if let Action::Finish { summary } = &action {
            let message = if summary.is_empty() {
                "Task finished.".to_string()
            } else {
                summary.clone()
            };
            return (
                record(decision.thinking, Some(action), message, true),
                StepEnd::Finished { handed_over: false },
            );
        }

        send_event(
            &self.event_tx,
            &self.session_id,
            StepEventKind::Action { action: action.clone() },
        );

        if let (Action::SwitchSurface { session_id: next }, Some(supervisor)) = (&action, &self.supervisor) {
            if let Err(owner) = supervisor.adopt(&self.session_id, next).await {
                let err = AgentError::ActionFailed(format!(
                    "Session {next} is driven by running task {owner}; switch refused"
                ));
                tracing::warn!("[{}] {}", self.session_id, err);
                return (
                    self.recovered(&err, record(decision.thinking, Some(action.clone()), String::new(), false)),
                    StepEnd::Continue,
                );
            }
        }

        match self
            .executor
            .execute_until_cancelled(active, &action, &self.cancel_token)
            .await
        {
            Ok(outcome) if outcome.finish => {
                let handed_over = matches!(action, Action::TakeOver { .. });
                (
                    record(decision.thinking, Some(action), outcome.message, !handed_over),
                    StepEnd::Finished { handed_over },
                )
            }
            Ok(outcome) => (
                record(decision.thinking, Some(action), outcome.message, true),
                StepEnd::Continue,
            ),
            Err(e) => match self.recovery.handle(&e) {
                RecoveryAction::RecordAndContinue(message) => (
                    record(decision.thinking, Some(action), message, false),
                    StepEnd::Continue,
                ),
                RecoveryAction::Abort(message) => (
                    record(decision.thinking, Some(action), message, false),
                    StepEnd::Errored,
                ),
            },
        }
    }

    /// 可恢复错误：把恢复引擎给出的说明写进 StepResult
    fn recovered(&self, err: &AgentError, mut step: StepResult) -> StepResult {
        step.message = match self.recovery.handle(err) {
            RecoveryAction::RecordAndContinue(m) | RecoveryAction::Abort(m) => m,
        };
        step
    }
}

/// 一轮之后循环如何继续
enum StepEnd {
    Continue,
    Finished { handed_over: bool },
    Errored,
}
