//! 会话注册表：session_id -> Session
//!
//! 会话在首次使用某个 id 时懒创建，虚拟屏在真正需要时才绑定。整张表由一把 RwLock 保护；
//! 单个会话的虚拟屏生命周期（创建 / 重建 / 销毁）另有一把会话级互斥锁串行化。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::surface::frame::FrameSink;

/// 已绑定的虚拟屏
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurfaceBinding {
    pub surface_id: i64,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub bitrate_kbps: u32,
    pub frame_sink_bound: bool,
}

/// 一个会话：可能尚未绑定虚拟屏
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub surface: Option<SurfaceBinding>,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    /// 最近一次运行声明的目标应用（展示用，互斥由编排器保证）
    pub bound_target_app: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub sink: Option<FrameSink>,
    pub(crate) lifecycle: Arc<Mutex<()>>,
}

impl Session {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            surface: None,
            width: 0,
            height: 0,
            dpi: 0,
            bound_target_app: None,
            created_at: now,
            last_active_at: now,
            sink: None,
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    pub fn surface_id(&self) -> Option<i64> {
        self.surface.as_ref().map(|b| b.surface_id)
    }
}

/// 生成新的会话 id（8 位十六进制）
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Debug, Default)]
pub struct SurfaceRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得会话快照，不存在则创建
    pub async fn get_or_create(&self, session_id: &str) -> Session {
        if let Some(s) = self.sessions.read().await.get(session_id) {
            return s.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("[{}] session created", session_id);
                Session::new(session_id)
            })
            .clone()
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn surface_id(&self, session_id: &str) -> Option<i64> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(Session::surface_id)
    }

    pub async fn surface_size(&self, session_id: &str) -> Option<(u32, u32)> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.surface.as_ref().map(|b| (b.width, b.height)))
    }

    pub async fn frame_sink(&self, session_id: &str) -> Option<FrameSink> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.sink.clone())
    }

    /// 绑定虚拟屏与帧接收端
    pub async fn bind(&self, session_id: &str, binding: SurfaceBinding, sink: FrameSink) {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        session.width = binding.width;
        session.height = binding.height;
        session.dpi = binding.dpi;
        session.surface = Some(binding);
        session.sink = Some(sink);
        session.last_active_at = Utc::now();
    }

    /// 解除绑定，返回旧的绑定
    pub async fn clear(&self, session_id: &str) -> Option<SurfaceBinding> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id)?;
        session.sink = None;
        session.surface.take()
    }

    pub async fn touch(&self, session_id: &str) {
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            s.last_active_at = Utc::now();
        }
    }

    pub async fn set_target_app(&self, session_id: &str, app: Option<String>) {
        if let Some(s) = self.sessions.write().await.get_mut(session_id) {
            s.bound_target_app = app;
        }
    }

    pub async fn remove(&self, session_id: &str) -> Option<Session> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// 持有虚拟屏且超过 ttl 未活动的会话
    pub async fn idle_sessions(&self, ttl: chrono::Duration) -> Vec<String> {
        let cutoff = Utc::now() - ttl;
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.surface.is_some() && s.last_active_at < cutoff)
            .map(|s| s.session_id.clone())
            .collect()
    }

    pub(crate) async fn lifecycle_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.get_or_create(session_id).await.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(id: i64) -> SurfaceBinding {
        SurfaceBinding {
            surface_id: id,
            width: 720,
            height: 1280,
            dpi: 320,
            bitrate_kbps: 3000,
            frame_sink_bound: true,
        }
    }

    #[tokio::test]
    async fn test_lazy_session_has_no_surface() {
        let reg = SurfaceRegistry::new();
        let s = reg.get_or_create("abc").await;
        assert!(s.surface.is_none());
        assert_eq!(reg.surface_id("abc").await, None);
        assert!(reg.contains("abc").await);
    }

    #[tokio::test]
    async fn test_bind_and_clear() {
        let reg = SurfaceRegistry::new();
        reg.get_or_create("s1").await;
        reg.bind("s1", binding(4), FrameSink::new(4)).await;
        assert_eq!(reg.surface_id("s1").await, Some(4));
        assert_eq!(reg.surface_size("s1").await, Some((720, 1280)));
        assert_eq!(reg.clear("s1").await.map(|b| b.surface_id), Some(4));
        assert!(reg.frame_sink("s1").await.is_none());
        assert!(reg.clear("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_idle_sessions_only_with_surface() {
        let reg = SurfaceRegistry::new();
        reg.get_or_create("bare").await;
        reg.bind("bound", binding(1), FrameSink::new(1)).await;
        let idle = reg.idle_sessions(chrono::Duration::zero() - chrono::Duration::seconds(1)).await;
        assert_eq!(idle, vec!["bound".to_string()]);
        assert!(reg.idle_sessions(chrono::Duration::hours(1)).await.is_empty());
    }

    #[test]
    fn test_new_session_id_is_short_hex() {
        let id = new_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
