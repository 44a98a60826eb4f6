//! 会话监管：按会话登记取消令牌
//!
//! 每个运行中的 AgentRuntime 在这里登记一个 CancellationToken；cancel(session) 只取消该会话，
//! cancel_all 取消全部。取消是协作式的：循环只在每一步开始前检查令牌。
//! 运行通过 SwitchSurface 接管的其他会话也记在它的登记里，同一会话任何时刻只归一个运行所有。

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 运行结束时要执行的清理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCleanup {
    /// 只销毁虚拟屏
    Surface,
    /// 销毁虚拟屏并移除会话
    Session,
}

/// 一次登记：取消令牌、目标应用（已归一化）、切换接管的会话与待执行的清理
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub token: CancellationToken,
    pub target_app: Option<String>,
    pub adopted: Vec<String>,
    pub cleanups: Vec<(String, PendingCleanup)>,
}

/// 当前拥有该会话的运行（以其起始会话标识）
fn owner_of<'a>(runs: &'a HashMap<String, RunEntry>, session_id: &str) -> Option<&'a String> {
    runs.iter()
        .find(|(origin, entry)| {
            origin.as_str() == session_id || entry.adopted.iter().any(|s| s == session_id)
        })
        .map(|(origin, _)| origin)
}

/// 会话级生命周期管理：session_id -> 运行登记
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    runs: RwLock<HashMap<String, RunEntry>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取消正在驱动该会话的运行，返回是否存在这样的运行
    pub async fn cancel(&self, session_id: &str) -> bool {
        let runs = self.runs.read().await;
        match owner_of(&runs, session_id).and_then(|origin| runs.get(origin)) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部运行，返回被取消的会话数
    pub async fn cancel_all(&self) -> usize {
        let runs = self.runs.read().await;
        for entry in runs.values() {
            entry.token.cancel();
        }
        runs.len()
    }

    /// 取消并登记结束后的清理；会话不在运行时返回 false，由调用方立即清理
    pub async fn cancel_with_cleanup(&self, session_id: &str, cleanup: PendingCleanup) -> bool {
        let mut runs = self.runs.write().await;
        let Some(origin) = owner_of(&runs, session_id).cloned() else {
            return false;
        };
        match runs.get_mut(&origin) {
            Some(entry) => {
                entry.cleanups.push((session_id.to_string(), cleanup));
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// 运行结束时移除登记（连同接管的会话），返回其中登记的清理
    pub async fn release(&self, session_id: &str) -> Vec<(String, PendingCleanup)> {
        self.runs
            .write()
            .await
            .remove(session_id)
            .map(|e| e.cleanups)
            .unwrap_or_default()
    }

    /// 该会话是否正被某个运行驱动（起始会话或接管的会话）
    pub async fn is_running(&self, session_id: &str) -> bool {
        let runs = self.runs.read().await;
        owner_of(&runs, session_id).is_some()
    }

    /// 以 `origin` 的运行接管 `session_id`。会话属于另一个运行时拒绝，返回那个运行的起始会话。
    pub async fn adopt(&self, origin: &str, session_id: &str) -> Result<(), String> {
        let mut runs = self.runs.write().await;
        match owner_of(&runs, session_id).cloned() {
            Some(owner) if owner == origin => Ok(()),
            Some(owner) => Err(owner),
            None => {
                if let Some(entry) = runs.get_mut(origin) {
                    entry.adopted.push(session_id.to_string());
                }
                Ok(())
            }
        }
    }

    pub async fn running_sessions(&self) -> Vec<String> {
        self.runs.read().await.keys().cloned().collect()
    }

    /// 在同一把写锁内完成「冲突检查 + 登记」，保证目标应用互斥在提交时同步生效。
    ///
    /// `claims` 为 (任务序号, session_id, 归一化目标应用)。任一冲突则全部不登记。
    pub async fn try_claim(
        &self,
        claims: &[(usize, String, Option<String>)],
    ) -> Result<Vec<CancellationToken>, ClaimConflict> {
        let mut runs = self.runs.write().await;
        for (index, session_id, app) in claims {
            if owner_of(&runs, session_id).is_some() {
                return Err(ClaimConflict::Session {
                    index: *index,
                    session_id: session_id.clone(),
                });
            }
            if let Some(app) = app {
                if let Some((busy, _)) = runs
                    .iter()
                    .find(|(_, e)| e.target_app.as_deref() == Some(app.as_str()))
                {
                    return Err(ClaimConflict::App {
                        index: *index,
                        app: app.clone(),
                        session_id: busy.clone(),
                    });
                }
            }
        }
        let mut tokens = Vec::with_capacity(claims.len());
        for (_, session_id, app) in claims {
            let token = CancellationToken::new();
            runs.insert(
                session_id.clone(),
                RunEntry {
                    token: token.clone(),
                    target_app: app.clone(),
                    adopted: Vec::new(),
                    cleanups: Vec::new(),
                },
            );
            tokens.push(token);
        }
        Ok(tokens)
    }
}

/// try_claim 的冲突原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimConflict {
    Session { index: usize, session_id: String },
    App { index: usize, app: String, session_id: String },
}
