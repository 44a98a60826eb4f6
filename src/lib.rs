//! Pane - 虚拟屏 UI 自动化编排器
//!
//! 模块划分：
//! - **agent**: 任务提交接口（单任务 / 并行槽位，JSON 输入输出）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务编排、会话监管、运行调度、错误与恢复、关闭
//! - **llm**: 推理客户端抽象与实现（OpenAI 兼容 / AutoGLM / Mock）
//! - **memory**: 对话历史窗口
//! - **react**: 动作解析、上下文、Agent 主循环
//! - **surface**: 会话注册表、虚拟屏资源管理与 IPC 通道
//! - **tools**: UI 能力集、应用目录与动作执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod surface;
pub mod tools;

pub use crate::core::{BatchReport, SubmitOptions, Task, TaskOrchestrator, TaskReport};
