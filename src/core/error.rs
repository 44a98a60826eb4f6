//! 错误类型与恢复动作
//!
//! 分层错误：ChannelError（IPC 通道）、SurfaceError（虚拟屏资源）、AgentError（单步循环）、
//! OrchestratorError（任务提交校验）。与 RecoveryEngine 配合决定「记录后继续」还是「终止任务」。

use thiserror::Error;

/// 与特权服务之间的 IPC 调用错误：通道死亡与应用层拒绝必须可区分
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// 远端已死亡（连接断开、进程退出），可通过重启服务恢复
    #[error("Channel dead: {0}")]
    Dead(String),

    /// 远端正常但拒绝了请求（无效 surface、参数错误等），不重试
    #[error("Rejected by service: {0}")]
    Rejected(String),
}

impl ChannelError {
    pub fn is_dead(&self) -> bool {
        matches!(self, ChannelError::Dead(_))
    }
}

/// 虚拟屏资源管理器对外的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    /// 会话尚未绑定虚拟屏，操作直接失败且不会调用服务
    #[error("Session {0} has no bound surface")]
    NoSurface(String),

    /// 服务返回了无效的 surface id
    #[error("Service returned invalid surface id {0}")]
    InvalidSurface(i64),

    #[error("Rejected by service: {0}")]
    Rejected(String),

    /// 重启服务并重试一次后仍然失败
    #[error("Channel dead after recovery: {0}")]
    ChannelDead(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),
}

impl SurfaceError {
    /// 是否为需要上报为任务失败的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, SurfaceError::ChannelDead(_))
    }
}

impl From<ChannelError> for SurfaceError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Dead(msg) => SurfaceError::ChannelDead(msg),
            ChannelError::Rejected(msg) => SurfaceError::Rejected(msg),
        }
    }
}

/// Agent 单步循环中可能出现的错误（推理、解析、动作执行、通道）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Reasoning call failed: {0}")]
    ReasoningFailed(String),

    #[error("Unparseable model output: {0}")]
    ParseError(String),

    /// 动作被拒绝执行（例如切换到另一个运行中任务的会话）
    #[error("Action failed: {0}")]
    ActionFailed(String),

    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// 任务提交时的校验错误（同步拒绝，不启动任何 AgentRuntime）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("Batch must contain 1 to {max} tasks, got {got}")]
    BatchSize { got: usize, max: usize },

    #[error("intent_{} is empty", .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", intent_"))]
    EmptyIntent(Vec<usize>),

    #[error(
        "intent_{} missing target_app_{} (target app is required for parallel runs to detect conflicts)",
        .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", intent_"),
        .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", target_app_")
    )]
    MissingTargetApp(Vec<usize>),

    #[error(
        "target_app_{first} and target_app_{second} are the same app (\"{app}\"); indices {first}, {second} conflict: one app cannot run on two surfaces at once"
    )]
    DuplicateTargetApp {
        first: usize,
        second: usize,
        app: String,
    },

    #[error("target_app \"{app}\" of task {index} is already driven by running session {session_id}")]
    TargetAppBusy {
        index: usize,
        app: String,
        session_id: String,
    },

    #[error("Session {session_id} of task {index} is already running")]
    SessionBusy { index: usize, session_id: String },
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 写入本步日志，交由下一轮推理处理
    RecordAndContinue(String),
    /// 终止当前任务
    Abort(String),
}
