//! UI 能力集
//!
//! ActionExecutor 只依赖 UiCapabilities，不直接碰虚拟屏服务；默认实现 SurfaceCapabilities
//! 委托给 SurfaceResourceManager，也可以换成其它实现（例如直接驱动物理屏）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::error::SurfaceError;
use crate::surface::{SurfaceBinding, SurfaceResourceManager, SurfaceSpec};

/// 一个会话上可执行的 UI 操作（坐标均为像素）
#[async_trait]
pub trait UiCapabilities: Send + Sync {
    async fn ensure_surface(&self, session_id: &str, spec: SurfaceSpec) -> Result<SurfaceBinding, SurfaceError>;

    async fn surface_size(&self, session_id: &str) -> Option<(u32, u32)>;

    async fn screenshot(&self, session_id: &str) -> Result<Vec<u8>, SurfaceError>;

    async fn tap(&self, session_id: &str, x: i32, y: i32) -> Result<(), SurfaceError>;

    /// 按下、保持 hold、抬起
    async fn long_press(&self, session_id: &str, x: i32, y: i32, hold: Duration) -> Result<(), SurfaceError>;

    async fn swipe(
        &self,
        session_id: &str,
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    ) -> Result<(), SurfaceError>;

    async fn key(&self, session_id: &str, code: i32, meta: i32) -> Result<(), SurfaceError>;

    async fn set_text(&self, session_id: &str, text: &str) -> Result<(), SurfaceError>;

    async fn start_app(&self, session_id: &str, package: &str, display_fix: bool) -> Result<(), SurfaceError>;
}

/// 默认能力集：基于虚拟屏资源管理器
pub struct SurfaceCapabilities {
    manager: Arc<SurfaceResourceManager>,
}

impl SurfaceCapabilities {
    pub fn new(manager: Arc<SurfaceResourceManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl UiCapabilities for SurfaceCapabilities {
    async fn ensure_surface(&self, session_id: &str, spec: SurfaceSpec) -> Result<SurfaceBinding, SurfaceError> {
        self.manager.ensure_surface(session_id, spec).await
    }

    async fn surface_size(&self, session_id: &str) -> Option<(u32, u32)> {
        self.manager.surface_size(session_id).await
    }

    async fn screenshot(&self, session_id: &str) -> Result<Vec<u8>, SurfaceError> {
        self.manager.request_screenshot(session_id, None).await
    }

    async fn tap(&self, session_id: &str, x: i32, y: i32) -> Result<(), SurfaceError> {
        self.manager.tap(session_id, x, y).await
    }

    async fn long_press(&self, session_id: &str, x: i32, y: i32, hold: Duration) -> Result<(), SurfaceError> {
        self.manager.touch_down(session_id, x, y).await?;
        tokio::time::sleep(hold).await;
        self.manager.touch_up(session_id, x, y).await
    }

    async fn swipe(
        &self,
        session_id: &str,
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    ) -> Result<(), SurfaceError> {
        self.manager.swipe(session_id, from, to, duration_ms).await
    }

    async fn key(&self, session_id: &str, code: i32, meta: i32) -> Result<(), SurfaceError> {
        self.manager.inject_key(session_id, code, meta).await
    }

    async fn set_text(&self, session_id: &str, text: &str) -> Result<(), SurfaceError> {
        self.manager.set_text(session_id, text).await
    }

    async fn start_app(&self, session_id: &str, package: &str, display_fix: bool) -> Result<(), SurfaceError> {
        self.manager.start_app(session_id, package, display_fix).await
    }
}
