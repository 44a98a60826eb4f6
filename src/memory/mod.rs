//! 记忆层：短期对话历史（带截图的消息与按轮剪枝）

pub mod conversation;

pub use conversation::{ConversationMemory, Message, Role};
