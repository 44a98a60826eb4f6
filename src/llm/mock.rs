//! Mock LLM 客户端（无需 API）
//!
//! MockLlmClient：未配置 Key 时的后备，直接以 finish 结束任务，便于本地跑通整条链路。
//! ScriptedLlmClient：按脚本或闭包给出回复，供测试驱动 AgentRuntime。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};
use crate::react::planner::TASK_HEADING;

/// Mock 客户端：复述任务并结束
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let task = messages
            .iter()
            .find(|m| matches!(m.role, Role::System))
            .and_then(|m| m.content.split_once(TASK_HEADING))
            .map(|(_, task)| task.trim())
            .filter(|task| !task.is_empty())
            .unwrap_or("(no task)");

        Ok(format!(
            "Mock 模型不会操作界面，直接结束。\nfinish(message=\"Mock: {}\")",
            task.replace('"', "'")
        ))
    }
}

type ReplyFn = dyn Fn(&[Message]) -> Result<String, String> + Send + Sync;

/// 脚本化客户端：按顺序返回预设回复（用尽后重复最后一条），或由闭包按上下文决定回复
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    reply_fn: Option<Box<ReplyFn>>,
    delay: Option<Duration>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(replies.into_iter().map(|r| Ok(r.into())))
    }

    /// 脚本中可以混入 Err，模拟推理调用失败
    pub fn with_results<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, String>>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            last: Mutex::new(None),
            reply_fn: None,
            delay: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, String> + Send + Sync + 'static,
    {
        Self {
            reply_fn: Some(Box::new(f)),
            ..Self::with_results(Vec::new())
        }
    }

    /// 每次调用前等待，用于让多个循环在时间上交错
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// 调用次数
    pub fn calls(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// 每次调用收到的完整消息
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next_reply(&self, messages: &[Message]) -> Result<String, String> {
        if let Some(f) = &self.reply_fn {
            return f(messages);
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(reply) => {
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(reply.clone());
                }
                reply
            }
            None => self
                .last
                .lock()
                .ok()
                .and_then(|l| l.clone())
                .unwrap_or_else(|| Err("script exhausted".to_string())),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_reply(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_finishes_with_task() {
        let system = format!("sys{TASK_HEADING}打开设置\n");
        let reply = MockLlmClient
            .complete(&[
                Message::system(system),
                Message::user("** Screen Info ** (step 1/20)\n\n当前屏幕"),
            ])
            .await
            .unwrap();
        assert!(reply.contains("finish(message=\"Mock: 打开设置\")"));
    }

    #[tokio::test]
    async fn test_mock_without_task_heading() {
        let reply = MockLlmClient
            .complete(&[Message::system("sys"), Message::user("** Screen Info **")])
            .await
            .unwrap();
        assert!(reply.contains("Mock: (no task)"));
    }

    #[tokio::test]
    async fn test_scripted_repeats_last_reply() {
        let client = ScriptedLlmClient::new(["a", "b"]);
        assert_eq!(client.complete(&[]).await.unwrap(), "a");
        assert_eq!(client.complete(&[]).await.unwrap(), "b");
        assert_eq!(client.complete(&[]).await.unwrap(), "b");
        assert_eq!(client.calls(), 3);
    }
}
