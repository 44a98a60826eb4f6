//! 认知层：Planner（动作解析）、上下文、事件与 Agent 主循环

pub mod events;
pub mod loop_;
pub mod memory;
pub mod planner;
pub mod prompt;

pub use events::{StepEvent, StepEventKind};
pub use loop_::{AgentRuntime, RunOutcome, StepResult, DEFAULT_HISTORY_WINDOW, DEFAULT_MAX_STEPS};
pub use memory::ContextManager;
pub use planner::{parse_agent_action, parse_thinking_and_action, Action, Decision, Planner};
pub use prompt::{build_system_prompt, load_system_prompt};
