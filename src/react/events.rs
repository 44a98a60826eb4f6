//! 单步过程事件：用于实时展示每个会话的思考、动作与步骤结果

use serde::Serialize;

use crate::core::state::RunState;
use crate::react::loop_::StepResult;
use crate::react::planner::Action;

/// 带会话 id 的事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
pub struct StepEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub kind: StepEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEventKind {
    /// 第几步开始
    StepStarted { step: usize, max_steps: usize },
    /// 模型的思考内容（预览）
    Thinking { text: String },
    /// 即将执行的动作
    Action { action: Action },
    /// 本步结束
    StepResult { result: StepResult },
    /// 循环结束
    Finished { state: RunState, message: String },
}
