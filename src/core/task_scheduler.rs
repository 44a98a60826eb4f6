//! 任务调度：限制同时运行的 AgentRuntime 数量
//!
//! 每个 AgentRuntime 是一个 tokio 任务；运行前先从 Semaphore 取得许可，
//! 许可数即「小型工作池」的宽度（默认 4，与单批最大任务数一致）。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// 运行调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    run_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_runs: usize) -> Self {
        Self {
            run_semaphore: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
        }
    }

    /// 获取运行许可；等待期间被取消则返回 None
    pub async fn acquire_run(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.run_semaphore.clone().acquire_owned() => permit.ok(),
        }
    }

    pub fn available(&self) -> usize {
        self.run_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_respects_capacity() {
        let sched = TaskScheduler::new(1);
        let token = CancellationToken::new();
        let permit = sched.acquire_run(&token).await;
        assert!(permit.is_some());
        assert_eq!(sched.available(), 0);

        let waiting = CancellationToken::new();
        waiting.cancel();
        assert!(sched.acquire_run(&waiting).await.is_none());

        drop(permit);
        assert_eq!(sched.available(), 1);
    }
}
