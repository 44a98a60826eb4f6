//! 单次运行的上下文
//!
//! 维护最近 K 轮的对话历史与最后一次成功的截图。组装提示词时只有当前这一轮携带图片；
//! 截图失败时退回上一张并标注为过期，连上一张都没有则告诉模型「没有可用截图」。
//! 上一步的执行结果（包括推理失败、解析失败、动作失败）写在下一轮 user 消息的开头。

use crate::core::SurfaceError;
use crate::memory::{ConversationMemory, Message};

pub const NO_SCREENSHOT: &str = "No screenshot available for this step.";

#[derive(Clone, Debug)]
pub struct ContextManager {
    pub conversation: ConversationMemory,
    last_capture: Option<Vec<u8>>,
    /// 尚未随某一轮写入历史的步骤结果
    notes: Vec<String>,
}

impl ContextManager {
    pub fn new(history_window: usize) -> Self {
        Self {
            conversation: ConversationMemory::new(history_window.max(1)),
            last_capture: None,
            notes: Vec::new(),
        }
    }

    /// 记下一步的结果，随下一轮观察一起交给模型；推理失败没有写入历史的轮次，其结果会累积到下一轮
    pub fn note_outcome(&mut self, step: usize, success: bool, message: &str) {
        let status = if success { "ok" } else { "FAILED" };
        self.notes.push(format!("[STEP {step} {status}] {message}"));
    }

    /// 由本步的截图结果生成当前 user 消息
    pub fn observe(&mut self, capture: &Result<Vec<u8>, SurfaceError>, step: usize, max_steps: usize) -> Message {
        let mut header = format!("** Screen Info ** (step {}/{})", step, max_steps);
        if !self.notes.is_empty() {
            header.push_str("\n\n");
            header.push_str(&self.notes.join("\n"));
        }
        match capture {
            Ok(bytes) => {
                self.last_capture = Some(bytes.clone());
                Message::user_with_image(
                    format!("{header}\n\n[SCREENSHOT] Below is the latest screen image."),
                    bytes,
                )
            }
            Err(e) => match &self.last_capture {
                Some(stale) => Message::user_with_image(
                    format!(
                        "{header}\n\n[SCREENSHOT] Capture failed ({e}); showing the previous screen, it may be stale."
                    ),
                    stale,
                ),
                None => Message::user(format!("{header}\n\n{NO_SCREENSHOT}")),
            },
        }
    }

    /// 历史（纯文本）+ 当前消息
    pub fn to_llm_messages(&self, current: &Message) -> Vec<Message> {
        let mut messages = self.conversation.messages().to_vec();
        messages.push(current.clone());
        messages
    }

    /// 本轮写入历史（图片会被去掉），其中携带的步骤结果随之入史
    pub fn record_turn(&mut self, user: Message, assistant: impl Into<String>) {
        self.notes.clear();
        self.conversation.push_turn(user, Message::assistant(assistant));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_capture_is_reused_and_annotated() {
        let mut ctx = ContextManager::new(8);
        let first = ctx.observe(&Ok(b"shot1".to_vec()), 1, 5);
        assert!(first.image.is_some());
        let second = ctx.observe(&Err(SurfaceError::Timeout(3000)), 2, 5);
        assert!(second.content.contains("stale"));
        assert_eq!(second.image, first.image);
    }

    #[test]
    fn test_no_capture_at_all() {
        let mut ctx = ContextManager::new(8);
        let msg = ctx.observe(&Err(SurfaceError::NoSurface("s".into())), 1, 5);
        assert!(msg.image.is_none());
        assert!(msg.content.contains(NO_SCREENSHOT));
    }

    #[test]
    fn test_outcome_enters_history_with_next_turn() {
        let mut ctx = ContextManager::new(8);
        ctx.note_outcome(1, false, "Session s1 has no bound surface");
        let next = ctx.observe(&Ok(b"shot".to_vec()), 2, 5);
        assert!(next.content.contains("[STEP 1 FAILED] Session s1 has no bound surface"));
        ctx.record_turn(next, "a2");
        ctx.note_outcome(2, true, "Tapped");

        let third = ctx.observe(&Ok(b"shot".to_vec()), 3, 5);
        assert!(!third.content.contains("STEP 1"));
        assert!(third.content.contains("[STEP 2 ok] Tapped"));
        let messages = ctx.to_llm_messages(&third);
        assert!(messages[0].content.contains("[STEP 1 FAILED]"));
    }

    #[test]
    fn test_outcomes_of_unrecorded_turns_accumulate() {
        let mut ctx = ContextManager::new(8);
        ctx.note_outcome(1, false, "no bound surface");
        // 第 2 轮推理失败，没有写入历史
        let _dropped = ctx.observe(&Ok(b"shot".to_vec()), 2, 5);
        ctx.note_outcome(2, false, "推理调用失败: 429");
        let third = ctx.observe(&Ok(b"shot".to_vec()), 3, 5);
        assert!(third.content.contains("[STEP 1 FAILED] no bound surface"));
        assert!(third.content.contains("[STEP 2 FAILED] 推理调用失败: 429"));
    }

    #[test]
    fn test_only_current_turn_carries_image() {
        let mut ctx = ContextManager::new(2);
        for i in 0..4 {
            let msg = ctx.observe(&Ok(vec![i]), i as usize + 1, 10);
            ctx.record_turn(msg, format!("a{i}"));
        }
        let current = ctx.observe(&Ok(vec![9]), 5, 10);
        let messages = ctx.to_llm_messages(&current);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages.iter().filter(|m| m.image.is_some()).count(), 1);
        assert!(messages[4].image.is_some());
        assert_eq!(messages[1].content, "a2");
    }
}
