//! 虚拟屏资源管理器
//!
//! 对外按 session_id 提供虚拟屏的创建 / 复用 / 销毁与输入注入。所有服务调用都经过共享 Channel，
//! 因此通道死亡后的「重启 + 重试一次」对调用方透明；恢复仍失败时返回 SurfaceError::ChannelDead。
//! 会话未绑定虚拟屏时，除 ensure_surface 外的操作直接返回 NoSurface，不会调用服务。

use std::sync::Arc;
use std::time::Duration;

use crate::core::error::SurfaceError;
use crate::surface::channel::Channel;
use crate::surface::frame::FrameSink;
use crate::surface::registry::{SurfaceBinding, SurfaceRegistry};

/// 宽高向下对齐到 8 的倍数；对齐结果为 0 时沿用原值
pub fn align_dimension(value: u32) -> u32 {
    let aligned = value & !7;
    if aligned == 0 {
        value
    } else {
        aligned
    }
}

/// 创建虚拟屏所需的几何参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSpec {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub bitrate_kbps: u32,
}

pub struct SurfaceResourceManager {
    registry: Arc<SurfaceRegistry>,
    channel: Arc<Channel>,
    screenshot_timeout: Duration,
}

impl SurfaceResourceManager {
    pub fn new(registry: Arc<SurfaceRegistry>, channel: Arc<Channel>, screenshot_timeout: Duration) -> Self {
        Self {
            registry,
            channel,
            screenshot_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SurfaceRegistry> {
        &self.registry
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// 确保会话拥有指定尺寸的虚拟屏。尺寸一致时复用并重新绑定帧接收端，
    /// 否则先销毁旧屏（恰好一次）再创建。
    pub async fn ensure_surface(&self, session_id: &str, spec: SurfaceSpec) -> Result<SurfaceBinding, SurfaceError> {
        let width = align_dimension(spec.width);
        let height = align_dimension(spec.height);
        let lock = self.registry.lifecycle_lock(session_id).await;
        let _guard = lock.lock().await;

        let session = self.registry.get_or_create(session_id).await;
        if let Some(existing) = session.surface.clone() {
            if existing.width == width && existing.height == height {
                let sink = session
                    .sink
                    .clone()
                    .unwrap_or_else(|| FrameSink::new(existing.surface_id));
                let bound = self.bind_sink(existing.surface_id, &sink).await?;
                let binding = SurfaceBinding {
                    frame_sink_bound: bound,
                    ..existing
                };
                self.registry.bind(session_id, binding.clone(), sink).await;
                tracing::debug!("[{}] reusing surface {}", session_id, binding.surface_id);
                return Ok(binding);
            }
            tracing::info!(
                "[{}] resizing surface {} from {}x{} to {}x{}",
                session_id,
                existing.surface_id,
                existing.width,
                existing.height,
                width,
                height
            );
            self.destroy_display(existing.surface_id).await?;
            self.registry.clear(session_id).await;
        }

        let (dpi, bitrate) = (spec.dpi, spec.bitrate_kbps);
        let surface_id = self
            .channel
            .call("ensure_display", |s| async move {
                s.ensure_display(width, height, dpi, bitrate).await
            })
            .await?;
        if surface_id < 0 {
            return Err(SurfaceError::InvalidSurface(surface_id));
        }

        let sink = FrameSink::new(surface_id);
        let bound = self.bind_sink(surface_id, &sink).await?;
        let binding = SurfaceBinding {
            surface_id,
            width,
            height,
            dpi,
            bitrate_kbps: bitrate,
            frame_sink_bound: bound,
        };
        self.registry.bind(session_id, binding.clone(), sink).await;
        tracing::info!("[{}] surface {} ready ({}x{})", session_id, surface_id, width, height);
        Ok(binding)
    }

    /// 绑定帧接收端；被拒绝时仅记录，通道死亡则上抛
    async fn bind_sink(&self, surface_id: i64, sink: &FrameSink) -> Result<bool, SurfaceError> {
        let result = self
            .channel
            .call("set_frame_sink", |s| {
                let sink = sink.clone();
                async move { s.set_frame_sink(surface_id, Some(sink)).await }
            })
            .await;
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_dead() => Err(e.into()),
            Err(e) => {
                tracing::warn!(surface_id, error = %e, "frame sink not bound");
                Ok(false)
            }
        }
    }

    async fn destroy_display(&self, surface_id: i64) -> Result<(), SurfaceError> {
        match self
            .channel
            .call("destroy_display", |s| async move { s.destroy_display(surface_id).await })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_dead() => Err(e.into()),
            Err(e) => {
                tracing::warn!(surface_id, error = %e, "destroy_display rejected, treating as gone");
                Ok(())
            }
        }
    }

    /// 销毁会话的虚拟屏（幂等，会话记录保留）
    pub async fn destroy_surface(&self, session_id: &str) -> Result<(), SurfaceError> {
        if self.registry.surface_id(session_id).await.is_none() {
            return Ok(());
        }
        let lock = self.registry.lifecycle_lock(session_id).await;
        let _guard = lock.lock().await;
        let Some(surface_id) = self.registry.surface_id(session_id).await else {
            return Ok(());
        };
        self.destroy_display(surface_id).await?;
        self.registry.clear(session_id).await;
        tracing::info!("[{}] surface {} destroyed", session_id, surface_id);
        Ok(())
    }

    /// 销毁虚拟屏并移除会话记录
    pub async fn release_session(&self, session_id: &str) -> Result<(), SurfaceError> {
        self.destroy_surface(session_id).await?;
        self.registry.remove(session_id).await;
        Ok(())
    }

    async fn surface_of(&self, session_id: &str) -> Result<i64, SurfaceError> {
        let id = self
            .registry
            .surface_id(session_id)
            .await
            .ok_or_else(|| SurfaceError::NoSurface(session_id.to_string()))?;
        self.registry.touch(session_id).await;
        Ok(id)
    }

    pub async fn surface_size(&self, session_id: &str) -> Option<(u32, u32)> {
        self.registry.surface_size(session_id).await
    }

    pub async fn frame_sink(&self, session_id: &str) -> Option<FrameSink> {
        self.registry.frame_sink(session_id).await
    }

    pub async fn tap(&self, session_id: &str, x: i32, y: i32) -> Result<(), SurfaceError> {
        let id = self.surface_of(session_id).await?;
        Ok(self
            .channel
            .call("tap", |s| async move { s.tap(id, x, y).await })
            .await?)
    }

    pub async fn swipe(
        &self,
        session_id: &str,
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    ) -> Result<(), SurfaceError> {
        let id = self.surface_of(session_id).await?;
        Ok(self
            .channel
            .call("swipe", |s| async move { s.swipe(id, from, to, duration_ms).await })
            .await?)
    }

    pub async fn touch_down(&self, session_id: &str, x: i32, y: i32) -> Result<(), SurfaceError> {
        let id = self.surface_of(session_id).await?;
        Ok(self
            .channel
            .call("touch_down", |s| async move { s.touch_down(id, x, y).await })
            .await?)
    }

    pub async fn touch_move(&self, session_id: &str, x: i32, y: i32) -> Result<(), SurfaceError> {
        let id = self.surface_of(session_id).await?;
        Ok(self
            .channel
            .call("touch_move", |s| async move { s.touch_move(id, x, y).await })
            .await?)
    }

    pub async fn touch_up(&self, session_id: &str, x: i32, y: i32) -> Result<(), SurfaceError> {
        let id = self.surface_of(session_id).await?;
        Ok(self
            .channel
            .call("touch_up", |s| async move { s.touch_up(id, x, y).await })
            .await?)
    }

    /// meta 为 0 时走普通按键调用，否则带修饰键
    pub async fn inject_key(&self, session_id: &str, code: i32, meta: i32) -> Result<(), SurfaceError> {
        let id = self.surface_of(session_id).await?;
        if meta == 0 {
            Ok(self
                .channel
                .call("inject_key", |s| async move { s.inject_key(id, code).await })
                .await?)
        } else {
            Ok(self
                .channel
                .call("inject_key_with_meta", |s| async move {
                    s.inject_key_with_meta(id, code, meta).await
                })
                .await?)
        }
    }

    pub async fn set_text(&self, session_id: &str, text: &str) -> Result<(), SurfaceError> {
        let id = self.surface_of(session_id).await?;
        Ok(self
            .channel
            .call("set_text", |s| async move { s.set_text(id, text).await })
            .await?)
    }

    pub async fn start_app(&self, session_id: &str, package: &str, display_fix: bool) -> Result<(), SurfaceError> {
        let id = self.surface_of(session_id).await?;
        Ok(self
            .channel
            .call("launch_app", |s| async move { s.launch_app(id, package, display_fix).await })
            .await?)
    }

    /// 截图；timeout 为 None 时使用配置的默认超时
    pub async fn request_screenshot(
        &self,
        session_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, SurfaceError> {
        let id = self.surface_of(session_id).await?;
        let limit = timeout.unwrap_or(self.screenshot_timeout);
        match tokio::time::timeout(
            limit,
            self.channel
                .call("request_screenshot", |s| async move { s.request_screenshot(id).await }),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(SurfaceError::Timeout(limit.as_millis() as u64)),
        }
    }
}
