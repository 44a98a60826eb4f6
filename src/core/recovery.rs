//! 错误恢复引擎
//!
//! 根据 AgentError 返回 RecoveryAction：推理失败、解析失败、动作失败都只写入步骤日志并继续，
//! 只有通道恢复失败才终止循环。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为「记录后继续」或「终止」
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::ReasoningFailed(msg) => {
                RecoveryAction::RecordAndContinue(format!("推理调用失败: {msg}"))
            }
            AgentError::ParseError(raw) => RecoveryAction::RecordAndContinue(format!(
                "无法解析模型输出: {raw}。请只输出 do(action=...) 或 finish(message=...)。"
            )),
            AgentError::ActionFailed(msg) => RecoveryAction::RecordAndContinue(msg.clone()),
            AgentError::Surface(e) if e.is_fatal() => {
                RecoveryAction::Abort(format!("虚拟屏服务不可用: {e}"))
            }
            AgentError::Surface(e) => RecoveryAction::RecordAndContinue(e.to_string()),
        }
    }
}
