//! 任务编排器
//!
//! 负责：校验并接收 1..=4 个任务、为每个任务解析会话、按会话启动 AgentRuntime（并行或顺序），
//! 汇总结果；按会话取消、全部取消、销毁会话、回收长期空闲的虚拟屏。
//!
//! 互斥：同时处于 Running 的两个任务绝不驱动同一个目标应用（去空白、忽略大小写比较），
//! 检查覆盖同一批次内部与之前批次仍在运行的任务，并在提交时同步生效。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::error::{OrchestratorError, SurfaceError};
use crate::core::session_supervisor::{ClaimConflict, PendingCleanup};
use crate::core::{RunState, SessionSupervisor, TaskScheduler, TaskStatus};
use crate::llm::LlmClient;
use crate::react::{AgentRuntime, Planner, RunOutcome, StepEvent, StepResult};
use crate::surface::{self, new_session_id, ServiceConnector, SurfaceResourceManager};
use crate::tools::{ActionExecutor, AppCatalog, ExecutorSettings, SurfaceCapabilities};

/// 调用方提交的任务
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub intent: String,
    /// None 时使用配置的默认步数
    pub max_steps: Option<usize>,
    /// 传入已有会话 id 则复用其虚拟屏，否则新建
    pub session_id: Option<String>,
    pub target_app: Option<String>,
}

impl Task {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            ..Default::default()
        }
    }

    pub fn with_target_app(mut self, app: impl Into<String>) -> Self {
        self.target_app = Some(app.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

/// 提交选项
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// 依次运行而不是并行
    pub sequential: bool,
    /// 各会话的步骤事件
    pub event_tx: Option<mpsc::UnboundedSender<StepEvent>>,
    /// 覆盖配置中的 cleanup_on_finish
    pub cleanup_on_finish: Option<bool>,
}

/// 单个任务的结果
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// 从 1 开始
    pub index: usize,
    pub session_id: String,
    pub target_app: Option<String>,
    pub status: TaskStatus,
    pub state: RunState,
    pub success: bool,
    pub message: String,
    pub surface_id: Option<i64>,
    pub max_steps: usize,
    pub log: Vec<StepResult>,
}

impl TaskReport {
    pub fn steps(&self) -> usize {
        self.log.len()
    }

    pub fn finished(&self) -> bool {
        self.state == RunState::Finished
    }
}

/// 一个批次的汇总
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub results: Vec<TaskReport>,
    pub success_count: usize,
}

impl BatchReport {
    fn new(mut results: Vec<TaskReport>) -> Self {
        results.sort_by_key(|r| r.index);
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            results,
            success_count,
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// 「成功 k 个 / 共 n 个」
    pub fn summary(&self) -> String {
        format!("成功 {} 个 / 共 {} 个", self.success_count, self.total())
    }
}

enum Runs {
    Parallel(Vec<JoinHandle<TaskReport>>),
    Sequential(JoinHandle<Vec<TaskReport>>),
}

/// 已提交批次的句柄
pub struct BatchHandle {
    session_ids: Vec<String>,
    runs: Runs,
}

impl BatchHandle {
    /// 按提交顺序的会话 id
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    /// 等待全部任务结束
    pub async fn join(self) -> BatchReport {
        let session_ids = self.session_ids;
        let failed = |index: usize, reason: &str| TaskReport {
            index,
            session_id: session_ids.get(index - 1).cloned().unwrap_or_default(),
            target_app: None,
            status: TaskStatus::Failed,
            state: RunState::Errored,
            success: false,
            message: format!("task aborted: {reason}"),
            surface_id: None,
            max_steps: 0,
            log: Vec::new(),
        };
        let results = match self.runs {
            Runs::Parallel(handles) => futures_util::future::join_all(handles)
                .await
                .into_iter()
                .enumerate()
                .map(|(i, r)| r.unwrap_or_else(|e| failed(i + 1, &e.to_string())))
                .collect(),
            Runs::Sequential(handle) => match handle.await {
                Ok(reports) => reports,
                Err(e) => {
                    let reason = e.to_string();
                    (1..=session_ids.len()).map(|i| failed(i, &reason)).collect()
                }
            },
        };
        BatchReport::new(results)
    }
}

/// 编排器配置
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_batch: usize,
    pub default_max_steps: usize,
    pub history_window: usize,
    pub cleanup_on_finish: bool,
    pub idle_ttl: Duration,
    pub reap_interval: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_batch: cfg.orchestrator.max_batch.clamp(1, 4),
            default_max_steps: cfg.agent.max_steps.max(1),
            history_window: cfg.agent.history_window.max(1),
            cleanup_on_finish: cfg.orchestrator.cleanup_on_finish,
            idle_ttl: Duration::from_secs(cfg.orchestrator.idle_ttl_secs),
            reap_interval: Duration::from_secs(cfg.orchestrator.reap_interval_secs.max(1)),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 任务编排器；clone 共享同一组资源
#[derive(Clone)]
pub struct TaskOrchestrator {
    manager: Arc<SurfaceResourceManager>,
    planner: Arc<Planner>,
    executor: Arc<ActionExecutor>,
    supervisor: Arc<SessionSupervisor>,
    scheduler: TaskScheduler,
    settings: OrchestratorSettings,
}

/// 目标应用归一化：去空白、小写；空串视为未声明
pub fn normalize_app(app: Option<&str>) -> Option<String> {
    app.map(|a| a.trim().to_lowercase()).filter(|a| !a.is_empty())
}

/// 提交前的同步校验：批次大小、空意图、缺失目标应用、批内重复目标应用 / 会话
pub fn validate_batch(tasks: &[Task], max_batch: usize) -> Result<(), OrchestratorError> {
    if tasks.is_empty() || tasks.len() > max_batch {
        return Err(OrchestratorError::BatchSize {
            got: tasks.len(),
            max: max_batch,
        });
    }

    let empty: Vec<usize> = tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.intent.trim().is_empty())
        .map(|(i, _)| i + 1)
        .collect();
    if !empty.is_empty() {
        return Err(OrchestratorError::EmptyIntent(empty));
    }

    if tasks.len() > 1 {
        let missing: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| normalize_app(t.target_app.as_deref()).is_none())
            .map(|(i, _)| i + 1)
            .collect();
        if !missing.is_empty() {
            return Err(OrchestratorError::MissingTargetApp(missing));
        }
    }

    let mut apps: HashMap<String, usize> = HashMap::new();
    let mut sessions: HashMap<String, usize> = HashMap::new();
    for (i, task) in tasks.iter().enumerate() {
        let index = i + 1;
        if let Some(app) = normalize_app(task.target_app.as_deref()) {
            if let Some(&first) = apps.get(&app) {
                return Err(OrchestratorError::DuplicateTargetApp {
                    first,
                    second: index,
                    app: task.target_app.clone().unwrap_or_default().trim().to_string(),
                });
            }
            apps.insert(app, index);
        }
        if let Some(session) = task.session_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            if sessions.insert(session.to_string(), index).is_some() {
                return Err(OrchestratorError::SessionBusy {
                    index,
                    session_id: session.to_string(),
                });
            }
        }
    }
    Ok(())
}

impl TaskOrchestrator {
    pub fn new(
        manager: Arc<SurfaceResourceManager>,
        planner: Arc<Planner>,
        executor: Arc<ActionExecutor>,
        settings: OrchestratorSettings,
        max_concurrent_runs: usize,
    ) -> Self {
        Self {
            manager,
            planner,
            executor,
            supervisor: Arc::new(SessionSupervisor::new()),
            scheduler: TaskScheduler::new(max_concurrent_runs),
            settings,
        }
    }

    /// 由配置装配：连接器、资源管理器、执行器、Planner
    pub fn from_parts(
        cfg: &AppConfig,
        connector: Arc<dyn ServiceConnector>,
        llm: Arc<dyn LlmClient>,
        system_prompt: impl Into<String>,
    ) -> Self {
        let manager = Arc::new(surface::manager_from_config(&cfg.surface, connector));
        let executor = Arc::new(ActionExecutor::new(
            Arc::new(SurfaceCapabilities::new(manager.clone())),
            AppCatalog::with_extra(&cfg.apps),
            ExecutorSettings::from_config(cfg),
        ));
        let planner = Arc::new(
            Planner::new(llm, system_prompt)
                .with_request_timeout(Duration::from_secs(cfg.llm.request_timeout_secs.max(1))),
        );
        Self::new(
            manager,
            planner,
            executor,
            OrchestratorSettings::from_config(cfg),
            cfg.orchestrator.max_concurrent_runs,
        )
    }

    /// 按配置选择服务传输与推理后端
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::from_parts(
            cfg,
            surface::connector_from_config(&cfg.surface),
            crate::llm::create_llm_from_config(cfg),
            crate::react::load_system_prompt(cfg),
        )
    }

    pub fn manager(&self) -> &Arc<SurfaceResourceManager> {
        &self.manager
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 校验并启动一个批次。校验失败时不启动任何运行。
    pub async fn submit(&self, tasks: Vec<Task>, options: SubmitOptions) -> Result<BatchHandle, OrchestratorError> {
        validate_batch(&tasks, self.settings.max_batch)?;

        let claims: Vec<(usize, String, Option<String>)> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let session_id = t
                    .session_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(new_session_id);
                (i + 1, session_id, normalize_app(t.target_app.as_deref()))
            })
            .collect();

        let tokens = self
            .supervisor
            .try_claim(&claims)
            .await
            .map_err(|conflict| match conflict {
                ClaimConflict::Session { index, session_id } => {
                    OrchestratorError::SessionBusy { index, session_id }
                }
                ClaimConflict::App {
                    index,
                    app,
                    session_id,
                } => OrchestratorError::TargetAppBusy {
                    index,
                    app,
                    session_id,
                },
            })?;

        let registry = self.manager.registry();
        for ((_, session_id, _), task) in claims.iter().zip(&tasks) {
            registry.get_or_create(session_id).await;
            registry
                .set_target_app(session_id, task.target_app.as_ref().map(|a| a.trim().to_string()))
                .await;
        }

        let cleanup = options
            .cleanup_on_finish
            .unwrap_or(self.settings.cleanup_on_finish);
        let session_ids: Vec<String> = claims.iter().map(|(_, s, _)| s.clone()).collect();
        tracing::info!(
            "Submitting batch of {} task(s){}: {:?}",
            tasks.len(),
            if options.sequential { " sequentially" } else { "" },
            session_ids
        );

        let jobs: Vec<RunJob> = tasks
            .into_iter()
            .zip(claims)
            .zip(tokens)
            .map(|((task, (index, session_id, _)), token)| RunJob {
                index,
                session_id,
                target_app: task.target_app.map(|a| a.trim().to_string()),
                max_steps: task.max_steps.unwrap_or(self.settings.default_max_steps),
                intent: task.intent,
                token,
            })
            .collect();

        let runs = if options.sequential {
            let this = self.clone();
            let event_tx = options.event_tx.clone();
            Runs::Sequential(tokio::spawn(async move {
                let mut reports = Vec::with_capacity(jobs.len());
                for job in jobs {
                    reports.push(this.run_job(job, event_tx.clone(), cleanup).await);
                }
                reports
            }))
        } else {
            Runs::Parallel(
                jobs.into_iter()
                    .map(|job| {
                        let this = self.clone();
                        let event_tx = options.event_tx.clone();
                        tokio::spawn(async move { this.run_job(job, event_tx, cleanup).await })
                    })
                    .collect(),
            )
        };

        Ok(BatchHandle { session_ids, runs })
    }

    /// 提交单个任务并等待结果
    pub async fn run_single(&self, task: Task, options: SubmitOptions) -> Result<TaskReport, OrchestratorError> {
        let handle = self.submit(vec![task], options).await?;
        let mut report = handle.join().await;
        Ok(report.results.remove(0))
    }

    async fn run_job(
        &self,
        job: RunJob,
        event_tx: Option<mpsc::UnboundedSender<StepEvent>>,
        cleanup_on_finish: bool,
    ) -> TaskReport {
        let outcome = match self.scheduler.acquire_run(&job.token).await {
            Some(_permit) => {
                let mut runtime = AgentRuntime::new(
                    self.planner.clone(),
                    self.executor.clone(),
                    job.session_id.clone(),
                    job.intent.clone(),
                    job.token.clone(),
                )
                .with_max_steps(job.max_steps)
                .with_history_window(self.settings.history_window)
                .with_supervisor(self.supervisor.clone());
                if let Some(tx) = event_tx {
                    runtime = runtime.with_event_tx(tx);
                }
                runtime.run().await
            }
            None => RunOutcome {
                session_id: job.session_id.clone(),
                active_session_id: job.session_id.clone(),
                state: RunState::Cancelled,
                handed_over: false,
                final_message: "Cancelled".to_string(),
                max_steps: job.max_steps,
                steps: Vec::new(),
            },
        };

        let surface_id = self
            .manager
            .registry()
            .surface_id(&outcome.active_session_id)
            .await;
        let mut requested = self.supervisor.release(&job.session_id).await;
        if cleanup_on_finish && !requested.iter().any(|(s, _)| *s == job.session_id) {
            requested.push((job.session_id.clone(), PendingCleanup::Surface));
        }
        for (session_id, cleanup) in requested {
            let result = match cleanup {
                PendingCleanup::Session => self.manager.release_session(&session_id).await,
                PendingCleanup::Surface => self.manager.destroy_surface(&session_id).await,
            };
            if let Err(e) = result {
                tracing::warn!("[{}] cleanup failed: {}", session_id, e);
            }
        }

        let status = TaskStatus::from_run(outcome.state, outcome.handed_over);
        TaskReport {
            index: job.index,
            session_id: job.session_id,
            target_app: job.target_app,
            status,
            state: outcome.state,
            success: outcome.success(),
            message: outcome.final_message,
            surface_id,
            max_steps: outcome.max_steps,
            log: outcome.steps,
        }
    }

    /// 会话当前状态：有运行在驱动它为 Running，已知但空闲为 Idle，未知为 None
    pub async fn session_status(&self, session_id: &str) -> Option<TaskStatus> {
        if self.supervisor.is_running(session_id).await {
            Some(TaskStatus::Running)
        } else if self.manager.registry().contains(session_id).await {
            Some(TaskStatus::Idle)
        } else {
            None
        }
    }

    /// 取消指定会话的运行，虚拟屏保留
    pub async fn cancel(&self, session_id: &str) -> bool {
        let found = self.supervisor.cancel(session_id).await;
        if found {
            tracing::info!("[{}] cancellation requested", session_id);
        }
        found
    }

    /// 取消并在运行结束时销毁其虚拟屏；没有运行时立即销毁。返回是否有运行被取消
    pub async fn cancel_and_cleanup(&self, session_id: &str) -> Result<bool, SurfaceError> {
        self.cancel_with(session_id, PendingCleanup::Surface).await
    }

    /// 取消（如在运行）并移除整个会话
    pub async fn destroy_session(&self, session_id: &str) -> Result<bool, SurfaceError> {
        self.cancel_with(session_id, PendingCleanup::Session).await
    }

    async fn cancel_with(&self, session_id: &str, cleanup: PendingCleanup) -> Result<bool, SurfaceError> {
        if self.supervisor.cancel_with_cleanup(session_id, cleanup).await {
            tracing::info!("[{}] cancellation requested, cleanup deferred to run end", session_id);
            return Ok(true);
        }
        match cleanup {
            PendingCleanup::Surface => self.manager.destroy_surface(session_id).await?,
            PendingCleanup::Session => self.manager.release_session(session_id).await?,
        }
        Ok(false)
    }

    /// 取消全部运行，返回被取消的数量
    pub async fn cancel_all(&self) -> usize {
        let n = self.supervisor.cancel_all().await;
        if n > 0 {
            tracing::info!("Cancelling {} running task(s)", n);
        }
        n
    }

    /// 销毁空闲超过 ttl 且不在运行中的会话的虚拟屏
    pub async fn reap_idle(&self, ttl: Duration) -> Vec<String> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let mut reaped = Vec::new();
        for session_id in self.manager.registry().idle_sessions(ttl).await {
            if self.supervisor.is_running(&session_id).await {
                continue;
            }
            match self.manager.destroy_surface(&session_id).await {
                Ok(()) => {
                    tracing::info!("[{}] idle surface reaped", session_id);
                    reaped.push(session_id);
                }
                Err(e) => tracing::warn!("[{}] failed to reap idle surface: {}", session_id, e),
            }
        }
        reaped
    }

    /// 周期性回收空闲虚拟屏；idle_ttl 为 0 时不启动
    pub fn spawn_idle_reaper(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if self.settings.idle_ttl.is_zero() {
            return None;
        }
        let this = self.clone();
        let ttl = self.settings.idle_ttl;
        let interval = self.settings.reap_interval;
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                this.reap_idle(ttl).await;
            }
            tracing::debug!("idle reaper stopped");
        }))
    }
}

struct RunJob {
    index: usize,
    session_id: String,
    target_app: Option<String>,
    max_steps: usize,
    intent: String,
    token: CancellationToken,
}
