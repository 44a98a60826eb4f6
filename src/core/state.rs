//! 状态定义：单次运行的终态与 Task 的对外状态
//!
//! RunState 是 AgentRuntime 结束时所处的状态（运行中即逐步执行）；TaskStatus 是编排器投影给调用方的状态。

use serde::Serialize;

/// AgentRuntime 的终态：逐步执行直到 {Finished, Exhausted, Cancelled, Errored} 之一
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// 模型给出 finish（或 Take_over）
    Finished,
    /// 步数预算耗尽
    Exhausted,
    Cancelled,
    /// 通道恢复失败等致命错误
    Errored,
}

/// Task 对外状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    /// 会话存在但没有运行
    Idle,
    Running,
    Success,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// 由循环终态与「是否为用户接管」推导任务状态
    pub fn from_run(state: RunState, handed_over: bool) -> Self {
        match state {
            RunState::Finished if !handed_over => TaskStatus::Success,
            RunState::Finished | RunState::Exhausted | RunState::Errored => TaskStatus::Failed,
            RunState::Cancelled => TaskStatus::Canceled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_projection() {
        assert_eq!(TaskStatus::from_run(RunState::Finished, false), TaskStatus::Success);
        assert_eq!(TaskStatus::from_run(RunState::Finished, true), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_run(RunState::Exhausted, false), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_run(RunState::Errored, false), TaskStatus::Failed);
        assert_eq!(TaskStatus::from_run(RunState::Cancelled, false), TaskStatus::Canceled);
    }
}
