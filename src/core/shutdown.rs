//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 后：取消全部运行中的会话，等待它们在超时内结束，
//! 然后按配置销毁虚拟屏。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::orchestrator::TaskOrchestrator;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 批次已全部结束
    Completed,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭 token：空闲回收等后台任务监听它
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, cancelling running sessions...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, cancelling running sessions...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭信号触发后取消编排器中的全部运行
pub fn cancel_on_shutdown(manager: &ShutdownManager, orchestrator: TaskOrchestrator) -> tokio::task::JoinHandle<()> {
    let token = manager.token();
    let mut reasons = manager.subscribe();
    tokio::spawn(async move {
        token.cancelled().await;
        let reason = reasons.try_recv().ok();
        if reason == Some(ShutdownReason::Completed) {
            return;
        }
        let n = orchestrator.cancel_all().await;
        tracing::info!("Shutdown ({:?}): cancelled {} run(s)", reason, n);
    })
}

/// 等待所有运行释放登记，超时则放弃等待
pub async fn drain(orchestrator: &TaskOrchestrator, timeout: Duration) -> bool {
    let wait = async {
        while !orchestrator.supervisor().running_sessions().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(()) => true,
        Err(_) => {
            tracing::warn!("Runs still active after {}s, giving up", timeout.as_secs());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_reason_is_broadcast() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::Signal);
        assert_eq!(rx.recv().await.ok(), Some(ShutdownReason::Signal));
    }
}
