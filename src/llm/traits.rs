//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / AutoGLM / Mock）实现 LlmClient。UI 控制器模型需要识图，
//! 因此消息可以携带截图（见 Message::image）。

use async_trait::async_trait;

use crate::memory::Message;

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成；错误为人类可读的失败原因
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
