//! 集成测试共用：模拟服务 + 按任务文本回复的脚本化 LLM

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pane::config::AppConfig;
use pane::llm::ScriptedLlmClient;
use pane::memory::Message;
use pane::surface::MockSurfaceService;
use pane::TaskOrchestrator;

/// 所有延迟归零的配置
pub fn fast_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.surface.restart_delay_ms = 1;
    cfg.surface.screenshot_timeout_ms = 500;
    cfg.agent.post_launch_delay_ms = 0;
    cfg.agent.post_action_delay_ms = 0;
    cfg.agent.clear_settle_ms = 0;
    cfg.agent.long_press_ms = 5;
    cfg.orchestrator.idle_ttl_secs = 0;
    cfg
}

pub fn orchestrator(mock: &MockSurfaceService, llm: Arc<ScriptedLlmClient>) -> TaskOrchestrator {
    TaskOrchestrator::from_parts(&fast_config(), Arc::new(mock.clone()), llm, "SYS")
}

/// system 消息里「# 当前任务」之后的文本
pub fn task_of(messages: &[Message]) -> String {
    messages
        .first()
        .and_then(|m| m.content.split("# 当前任务\n").nth(1))
        .unwrap_or_default()
        .to_string()
}

/// 当前是第几轮（历史未被截断时成立）：system + 2 * 历史轮 + 当前
pub fn turn_of(messages: &[Message]) -> usize {
    messages.len() / 2
}

/// 任务文本形如 "打开 <应用>"：第一轮启动应用，第二轮结束；包含「慢」的任务一直等待
pub fn launch_then_finish(delay: Duration) -> Arc<ScriptedLlmClient> {
    ScriptedLlmClient::from_fn(|messages| {
        let task = task_of(messages);
        let app = task.split_whitespace().nth(1).unwrap_or("设置").to_string();
        if turn_of(messages) == 1 {
            Ok(format!("启动 {app} do(action=\"Launch\", app=\"{app}\")"))
        } else if task.contains("慢") {
            Ok("页面加载中 do(action=\"Wait\", duration=\"0 seconds\")".to_string())
        } else {
            Ok(format!("finish(message=\"{task} 完成\")"))
        }
    })
    .with_delay(delay)
    .into_arc()
}

/// 轮询直到条件成立或超时
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
