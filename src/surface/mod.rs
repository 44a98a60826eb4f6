//! 虚拟屏层：会话注册表、资源管理器、IPC 通道与传输实现

pub mod channel;
pub mod frame;
pub mod manager;
pub mod mock;
pub mod registry;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

pub use channel::{Channel, ServiceConnector, SurfaceService};
pub use frame::{Frame, FrameSink, MAX_EARLY_FRAMES};
pub use manager::{align_dimension, SurfaceResourceManager, SurfaceSpec};
pub use mock::MockSurfaceService;
pub use registry::{new_session_id, Session, SurfaceBinding, SurfaceRegistry};
pub use socket::SocketConnector;

use crate::config::SurfaceSection;

/// 按配置选择传输：配置了 socket_path 走 Unix socket，否则使用进程内模拟服务
pub fn connector_from_config(cfg: &SurfaceSection) -> Arc<dyn ServiceConnector> {
    match &cfg.socket_path {
        Some(path) => {
            tracing::info!("Using surface service socket {}", path.display());
            Arc::new(SocketConnector::new(path.clone(), cfg.restart_command.clone()))
        }
        None => {
            tracing::warn!("No surface socket configured, using simulated surface service");
            Arc::new(MockSurfaceService::new())
        }
    }
}

/// 由配置构建资源管理器（共享一条通道与一张注册表）
pub fn manager_from_config(cfg: &SurfaceSection, connector: Arc<dyn ServiceConnector>) -> SurfaceResourceManager {
    let channel = Arc::new(Channel::new(
        connector,
        Duration::from_millis(cfg.restart_delay_ms),
    ));
    SurfaceResourceManager::new(
        Arc::new(SurfaceRegistry::new()),
        channel,
        Duration::from_millis(cfg.screenshot_timeout_ms),
    )
}
