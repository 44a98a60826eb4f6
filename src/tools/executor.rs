//! 动作执行器
//!
//! 把 Action 一对一翻译成 UiCapabilities 调用，不做重试。相对坐标（0..=1000）按当前虚拟屏尺寸换算；
//! 每个动作后按配置等待界面稳定。每次执行输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, SurfaceError};
use crate::react::planner::{Action, KEYCODE_CLEAR, MAX_WAIT_MS};
use crate::surface::SurfaceSpec;
use crate::tools::{AppCatalog, UiCapabilities};

/// 节奏与默认几何
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub post_launch_delay: Duration,
    pub post_action_delay: Duration,
    pub swipe_duration_ms: u64,
    pub long_press: Duration,
    pub clear_settle: Duration,
    pub default_surface: SurfaceSpec,
    pub display_fix: bool,
}

impl ExecutorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            post_launch_delay: Duration::from_millis(cfg.agent.post_launch_delay_ms),
            post_action_delay: Duration::from_millis(cfg.agent.post_action_delay_ms),
            swipe_duration_ms: cfg.agent.swipe_duration_ms,
            long_press: Duration::from_millis(cfg.agent.long_press_ms),
            clear_settle: Duration::from_millis(cfg.agent.clear_settle_ms),
            default_surface: SurfaceSpec {
                width: cfg.surface.default_width,
                height: cfg.surface.default_height,
                dpi: cfg.surface.default_dpi,
                bitrate_kbps: cfg.surface.bitrate_kbps,
            },
            display_fix: cfg.surface.virtual_display_fix,
        }
    }

    /// 不等待，测试用
    pub fn immediate(default_surface: SurfaceSpec) -> Self {
        Self {
            post_launch_delay: Duration::ZERO,
            post_action_delay: Duration::ZERO,
            swipe_duration_ms: 300,
            long_press: Duration::ZERO,
            clear_settle: Duration::ZERO,
            default_surface,
            display_fix: false,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 动作执行成功的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub message: String,
    /// 该动作要求结束循环（Take_over / Finish）
    pub finish: bool,
}

impl ActionOutcome {
    fn done(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            finish: false,
        }
    }
}

pub struct ActionExecutor {
    caps: Arc<dyn UiCapabilities>,
    apps: AppCatalog,
    settings: ExecutorSettings,
}

impl ActionExecutor {
    pub fn new(caps: Arc<dyn UiCapabilities>, apps: AppCatalog, settings: ExecutorSettings) -> Self {
        Self { caps, apps, settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// 当前会话截图（超时由能力集实现决定）
    pub async fn capture(&self, session_id: &str) -> Result<Vec<u8>, SurfaceError> {
        self.caps.screenshot(session_id).await
    }

    /// 执行一个动作。`session_id` 是本次运行当前驱动的会话，SwitchSurface 会改写它。
    pub async fn execute(&self, session_id: &mut String, action: &Action) -> Result<ActionOutcome, AgentError> {
        self.execute_until_cancelled(session_id, action, &CancellationToken::new())
            .await
    }

    /// 同 execute，但 Wait 会在 `cancel` 触发时提前结束；IPC 调用不受影响
    pub async fn execute_until_cancelled(
        &self,
        session_id: &mut String,
        action: &Action,
        cancel: &CancellationToken,
    ) -> Result<ActionOutcome, AgentError> {
        let start = Instant::now();
        let result = self.dispatch(session_id, action, cancel).await;

        let (ok, outcome) = match &result {
            Ok(_) => (true, "ok".to_string()),
            Err(e) => (false, e.to_string()),
        };
        let audit = serde_json::json!({
            "event": "action_audit",
            "session": session_id.as_str(),
            "action": action.name(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(action),
        });
        tracing::info!(audit = %audit.to_string(), "action");
        result
    }

    async fn dispatch(
        &self,
        session_id: &mut String,
        action: &Action,
        cancel: &CancellationToken,
    ) -> Result<ActionOutcome, AgentError> {
        let s = session_id.as_str();
        match action {
            Action::Tap { x, y } => {
                let (px, py) = self.to_pixels(s, *x, *y).await?;
                self.caps.tap(s, px, py).await?;
                self.settle(self.settings.post_action_delay).await;
                Ok(ActionOutcome::done(format!("Tapped ({x}, {y}) -> ({px}, {py})")))
            }
            Action::LongPress { x, y } => {
                let (px, py) = self.to_pixels(s, *x, *y).await?;
                self.caps
                    .long_press(s, px, py, self.settings.long_press)
                    .await?;
                self.settle(self.settings.post_action_delay).await;
                Ok(ActionOutcome::done(format!("Long pressed ({x}, {y})")))
            }
            Action::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => {
                let from = self.to_pixels(s, *x1, *y1).await?;
                let to = self.to_pixels(s, *x2, *y2).await?;
                let duration = duration_ms.unwrap_or(self.settings.swipe_duration_ms);
                self.caps.swipe(s, from, to, duration).await?;
                self.settle(self.settings.post_action_delay).await;
                Ok(ActionOutcome::done(format!(
                    "Swiped ({x1}, {y1}) -> ({x2}, {y2}) in {duration}ms"
                )))
            }
            Action::Key { code, meta } => {
                self.caps.key(s, *code, *meta).await?;
                self.settle(self.settings.post_action_delay).await;
                Ok(ActionOutcome::done(format!("Key {code} (meta {meta})")))
            }
            Action::SetText { value } => {
                self.caps.key(s, KEYCODE_CLEAR, 0).await?;
                self.settle(self.settings.clear_settle).await;
                self.caps.set_text(s, value).await?;
                self.settle(self.settings.post_action_delay).await;
                Ok(ActionOutcome::done(format!("Typed {} chars", value.chars().count())))
            }
            Action::StartApp { package_id } => {
                let package = self.apps.resolve(package_id);
                self.caps
                    .ensure_surface(s, self.settings.default_surface)
                    .await?;
                self.caps
                    .start_app(s, &package, self.settings.display_fix)
                    .await?;
                self.settle(self.settings.post_launch_delay).await;
                Ok(ActionOutcome::done(format!("Launched {package_id} ({package})")))
            }
            Action::SwitchSurface { session_id: next } => {
                self.caps
                    .ensure_surface(next, self.settings.default_surface)
                    .await?;
                tracing::info!("[{}] switching to surface of session {}", s, next);
                *session_id = next.clone();
                Ok(ActionOutcome::done(format!("Switched to session {next}")))
            }
            Action::Wait { duration_ms } => {
                let wait_ms = (*duration_ms).min(MAX_WAIT_MS);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        Ok(ActionOutcome::done(format!("Wait of {wait_ms}ms interrupted by cancel")))
                    }
                    _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {
                        Ok(ActionOutcome::done(format!("Waited {wait_ms}ms")))
                    }
                }
            }
            Action::TakeOver { message } => Ok(ActionOutcome {
                message: message.clone(),
                finish: true,
            }),
            Action::Finish { summary } => Ok(ActionOutcome {
                message: summary.clone(),
                finish: true,
            }),
        }
    }

    async fn to_pixels(&self, session_id: &str, x: i32, y: i32) -> Result<(i32, i32), AgentError> {
        let (width, height) = self
            .caps
            .surface_size(session_id)
            .await
            .ok_or_else(|| SurfaceError::NoSurface(session_id.to_string()))?;
        Ok((scale(x, width), scale(y, height)))
    }

    async fn settle(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// 相对坐标 0..=1000 -> 像素，落在 [0, dim) 内
fn scale(rel: i32, dim: u32) -> i32 {
    let px = (rel as f64 / 1000.0 * dim as f64) as i64;
    px.clamp(0, dim.saturating_sub(1) as i64) as i32
}

fn args_preview(action: &Action) -> String {
    let s = serde_json::to_string(action).unwrap_or_default();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
