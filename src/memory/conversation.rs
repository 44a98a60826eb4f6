//! 短期记忆：对话历史
//!
//! 保留最近 N 轮（user/assistant 对），超出时剪掉最旧的，供推理上下文使用。
//! 只有当前轮的截图携带图片，历史轮次在入库前会去掉图片。

use base64::Engine;
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// 附带的截图（base64 编码的图片字节）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            image: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            image: None,
        }
    }

    /// 带截图的 user 消息
    pub fn user_with_image(content: impl Into<String>, image_bytes: &[u8]) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            image: Some(base64::engine::general_purpose::STANDARD.encode(image_bytes)),
        }
    }

    /// 去掉图片，仅保留文本
    pub fn without_image(mut self) -> Self {
        self.image = None;
        self
    }

    /// 图片的 data URL（按字节头判断 jpeg / png）
    pub fn image_data_url(&self) -> Option<String> {
        let image = self.image.as_ref()?;
        let mime = if image.starts_with("/9j/") {
            "image/jpeg"
        } else {
            "image/png"
        };
        Some(format!("data:{};base64,{}", mime, image))
    }
}

/// 短期记忆：最近 N 轮对话（每轮含 user + assistant，故实际保留约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    /// 追加一轮；user 消息入库前去掉图片
    pub fn push_turn(&mut self, user: Message, assistant: Message) {
        self.messages.push(user.without_image());
        self.messages.push(assistant.without_image());
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 超出 max_turns*2 时丢弃最旧的消息，保留最近部分
    fn prune(&mut self) {
        if self.messages.len() > self.max_turns * 2 {
            let keep = self.max_turns * 2;
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
