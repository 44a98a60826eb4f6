//! 核心编排层：错误与恢复、状态、会话监管、运行调度、任务编排、关闭

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use error::{AgentError, ChannelError, OrchestratorError, RecoveryAction, SurfaceError};
pub use orchestrator::{
    normalize_app, validate_batch, BatchHandle, BatchReport, OrchestratorSettings, SubmitOptions, Task,
    TaskOrchestrator, TaskReport,
};
pub use recovery::RecoveryEngine;
pub use session_supervisor::{ClaimConflict, PendingCleanup, SessionSupervisor};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{RunState, TaskStatus};
pub use task_scheduler::TaskScheduler;
