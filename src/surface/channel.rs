//! 与特权虚拟屏服务之间的 IPC 通道
//!
//! SurfaceService 是服务端能力的抽象；ServiceConnector 负责建立连接与重启服务进程。
//! Channel 在进程内共享一条连接：懒连接，远端死亡时清掉旧句柄、重启服务、固定延迟后重连，
//! 失败的那一次调用只重试一次。重连串行化，并以代数计数让并发等待者复用同一次重连结果。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::core::error::ChannelError;
use crate::surface::frame::FrameSink;

/// 特权服务暴露的操作。坐标均为虚拟屏像素。
#[async_trait]
pub trait SurfaceService: Send + Sync {
    /// 创建虚拟屏，返回 surface id（小于 0 视为无效）
    async fn ensure_display(
        &self,
        width: u32,
        height: u32,
        dpi: u32,
        bitrate_kbps: u32,
    ) -> Result<i64, ChannelError>;

    async fn set_frame_sink(&self, surface_id: i64, sink: Option<FrameSink>) -> Result<(), ChannelError>;

    /// 截图，返回编码后的图片字节
    async fn request_screenshot(&self, surface_id: i64) -> Result<Vec<u8>, ChannelError>;

    async fn tap(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError>;

    async fn swipe(
        &self,
        surface_id: i64,
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    ) -> Result<(), ChannelError>;

    async fn touch_down(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError>;
    async fn touch_move(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError>;
    async fn touch_up(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError>;

    async fn inject_key(&self, surface_id: i64, code: i32) -> Result<(), ChannelError>;
    async fn inject_key_with_meta(&self, surface_id: i64, code: i32, meta: i32) -> Result<(), ChannelError>;

    async fn set_text(&self, surface_id: i64, text: &str) -> Result<(), ChannelError>;

    async fn launch_app(&self, surface_id: i64, package: &str, display_fix: bool) -> Result<(), ChannelError>;

    async fn destroy_display(&self, surface_id: i64) -> Result<(), ChannelError>;

    /// 连接是否仍然存活（不产生服务端调用）
    async fn is_alive(&self) -> bool;
}

/// 建立连接 / 重启服务进程
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SurfaceService>, ChannelError>;

    /// 请求宿主重启特权服务
    async fn restart_service(&self) -> Result<(), ChannelError>;
}

type Handle = (u64, Arc<dyn SurfaceService>);

/// 进程内共享的服务通道
pub struct Channel {
    connector: Arc<dyn ServiceConnector>,
    current: RwLock<Option<Handle>>,
    reconnect_lock: Mutex<()>,
    generation: AtomicU64,
    restarts: AtomicU64,
    restart_delay: Duration,
}

impl Channel {
    pub fn new(connector: Arc<dyn ServiceConnector>, restart_delay: Duration) -> Self {
        Self {
            connector,
            current: RwLock::new(None),
            reconnect_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            restart_delay,
        }
    }

    /// 迄今为止重启服务的次数
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// 执行一次服务调用；远端死亡时恢复通道并重试恰好一次，应用层拒绝不重试。
    /// 取句柄时已经做过的恢复也计入这一次。
    pub async fn call<T, F, Fut>(&self, op: &str, f: F) -> Result<T, ChannelError>
    where
        F: Fn(Arc<dyn SurfaceService>) -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let ((generation, service), recovered) = self.acquire().await?;
        match f(service).await {
            Err(ChannelError::Dead(reason)) if recovered => {
                tracing::error!(op, %reason, "surface service died again right after recovery");
                Err(ChannelError::Dead(reason))
            }
            Err(ChannelError::Dead(reason)) => {
                tracing::warn!(op, %reason, "surface service died during call, recovering");
                let (_, service) = self.recover(generation).await?;
                let retried = f(service).await;
                if let Err(e) = &retried {
                    tracing::error!(op, error = %e, "surface call failed after recovery");
                }
                retried
            }
            other => other,
        }
    }

    /// 取得可用句柄：缓存存活直接用，已死则恢复，从未连接过则首次连接。
    /// 第二个返回值表示这次取句柄是否重启过服务。
    async fn acquire(&self) -> Result<(Handle, bool), ChannelError> {
        let cached = self.current.read().await.clone();
        match cached {
            Some((generation, service)) => {
                if service.is_alive().await {
                    Ok(((generation, service), false))
                } else {
                    let handle = self.recover(generation).await?;
                    Ok((handle, true))
                }
            }
            None => self.first_connect().await,
        }
    }

    async fn first_connect(&self) -> Result<(Handle, bool), ChannelError> {
        {
            let _guard = self.reconnect_lock.lock().await;
            if let Some(handle) = self.current.read().await.clone() {
                return Ok((handle, false));
            }
            match self.connector.connect().await {
                Ok(service) => return Ok((self.install(service).await, false)),
                Err(e) if !e.is_dead() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "surface service not reachable"),
            }
        }
        let handle = self.recover(0).await?;
        Ok((handle, true))
    }

    /// 串行化的恢复：若等锁期间别人已完成重连则直接复用
    async fn recover(&self, seen_generation: u64) -> Result<Handle, ChannelError> {
        let _guard = self.reconnect_lock.lock().await;

        let cached = self.current.read().await.clone();
        if let Some((generation, service)) = cached {
            if generation != seen_generation && service.is_alive().await {
                return Ok((generation, service));
            }
        }

        *self.current.write().await = None;
        let n = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(restart = n, "restarting surface service");
        self.connector.restart_service().await?;
        tokio::time::sleep(self.restart_delay).await;

        let service = self.connector.connect().await?;
        Ok(self.install(service).await)
    }

    async fn install(&self, service: Arc<dyn SurfaceService>) -> Handle {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.current.write().await = Some((generation, service.clone()));
        tracing::debug!(generation, "surface channel connected");
        (generation, service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::mock::MockSurfaceService;

    fn channel(mock: &Arc<MockSurfaceService>) -> Channel {
        Channel::new(mock.clone(), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_call_recovers_once_after_death() {
        let mock = Arc::new(MockSurfaceService::new());
        let ch = channel(&mock);
        mock.fail_next_calls(1);
        let id = ch
            .call("ensure_display", |s| async move { s.ensure_display(720, 1280, 320, 3000).await })
            .await
            .unwrap();
        assert!(id >= 0);
        assert_eq!(ch.restart_count(), 1);
    }

    #[tokio::test]
    async fn test_call_gives_up_after_single_retry() {
        let mock = Arc::new(MockSurfaceService::new());
        let ch = channel(&mock);
        mock.set_always_dead(true);
        let err = ch
            .call("tap", |s| async move { s.tap(1, 10, 10).await })
            .await
            .unwrap_err();
        assert!(err.is_dead());
        assert_eq!(ch.restart_count(), 1);
        assert_eq!(mock.calls_named("tap"), 2);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let mock = Arc::new(MockSurfaceService::new());
        let ch = channel(&mock);
        let err = ch
            .call("tap", |s| async move { s.tap(999, 1, 1).await })
            .await
            .unwrap_err();
        assert!(!err.is_dead());
        assert_eq!(ch.restart_count(), 0);
        assert_eq!(mock.calls_named("tap"), 1);
    }

    #[tokio::test]
    async fn test_dead_cached_handle_is_replaced_before_call() {
        let mock = Arc::new(MockSurfaceService::new());
        let ch = channel(&mock);
        ch.call("ensure_display", |s| async move { s.ensure_display(720, 1280, 320, 3000).await })
            .await
            .unwrap();
        mock.kill();
        ch.call("ensure_display", |s| async move { s.ensure_display(720, 1280, 320, 3000).await })
            .await
            .unwrap();
        assert_eq!(ch.restart_count(), 1);
    }

    #[tokio::test]
    async fn test_recovery_on_acquire_counts_as_the_retry() {
        let mock = Arc::new(MockSurfaceService::new());
        let ch = channel(&mock);
        ch.call("ensure_display", |s| async move { s.ensure_display(720, 1280, 320, 3000).await })
            .await
            .unwrap();
        mock.kill();
        mock.fail_next_calls(1);
        let err = ch
            .call("ensure_display", |s| async move { s.ensure_display(720, 1280, 320, 3000).await })
            .await
            .unwrap_err();
        assert!(err.is_dead());
        assert_eq!(ch.restart_count(), 1);
        assert_eq!(mock.calls_named("ensure_display"), 2);

        // 下一次调用照常工作
        ch.call("ensure_display", |s| async move { s.ensure_display(720, 1280, 320, 3000).await })
            .await
            .unwrap();
        assert_eq!(ch.restart_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_one_restart() {
        let mock = Arc::new(MockSurfaceService::new());
        let ch = Arc::new(channel(&mock));
        ch.call("ensure_display", |s| async move { s.ensure_display(720, 1280, 320, 3000).await })
            .await
            .unwrap();
        mock.kill();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ch = ch.clone();
            handles.push(tokio::spawn(async move {
                ch.call("ensure_display", |s| async move {
                    s.ensure_display(720, 1280, 320, 3000).await
                })
                .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(ch.restart_count(), 1);
    }
}
