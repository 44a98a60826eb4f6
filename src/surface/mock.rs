//! 进程内模拟的虚拟屏服务
//!
//! 未配置 socket 时作为后备，也是测试的主要替身：记录每次调用，可模拟通道死亡、截图超时、
//! 应用拒绝等情况。同时充当 ServiceConnector，重启即「复活」。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::error::ChannelError;
use crate::surface::channel::{ServiceConnector, SurfaceService};
use crate::surface::frame::FrameSink;

/// 一次被记录的服务调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: String,
    pub surface_id: i64,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct MockDisplay {
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub bitrate_kbps: u32,
    pub sink: Option<FrameSink>,
    pub foreground: Option<String>,
    pub text: String,
}

#[derive(Debug)]
struct MockState {
    alive: bool,
    always_dead: bool,
    fail_next: usize,
    next_id: i64,
    displays: HashMap<i64, MockDisplay>,
    calls: Vec<MockCall>,
    restarts: usize,
    screenshot_delay: Option<Duration>,
    missing_packages: HashSet<String>,
    shots: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            alive: true,
            always_dead: false,
            fail_next: 0,
            next_id: 1,
            displays: HashMap::new(),
            calls: Vec::new(),
            restarts: 0,
            screenshot_delay: None,
            missing_packages: HashSet::new(),
            shots: 0,
        }
    }
}

/// 模拟服务；clone 共享同一状态
#[derive(Debug, Clone, Default)]
pub struct MockSurfaceService {
    state: Arc<Mutex<MockState>>,
}

impl MockSurfaceService {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// 服务进程死亡：is_alive 为 false，所有调用返回 Dead，直到重启
    pub fn kill(&self) {
        self.with_state(|s| s.alive = false);
    }

    /// 接下来 n 次调用在调用中途死亡（is_alive 仍为 true）
    pub fn fail_next_calls(&self, n: usize) {
        self.with_state(|s| s.fail_next = n);
    }

    /// 每次调用都死亡，重启也救不回来
    pub fn set_always_dead(&self, dead: bool) {
        self.with_state(|s| s.always_dead = dead);
    }

    pub fn set_screenshot_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.screenshot_delay = delay);
    }

    /// 让启动指定包名的请求被拒绝（模拟未安装）
    pub fn mark_package_missing(&self, package: &str) {
        self.with_state(|s| {
            s.missing_packages.insert(package.to_string());
        });
    }

    pub fn restarts(&self) -> usize {
        self.with_state(|s| s.restarts)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn calls_named(&self, op: &str) -> usize {
        self.with_state(|s| s.calls.iter().filter(|c| c.op == op).count())
    }

    /// 针对某个 surface 的调用（按时间顺序）
    pub fn calls_for(&self, surface_id: i64) -> Vec<MockCall> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|c| c.surface_id == surface_id)
                .cloned()
                .collect()
        })
    }

    pub fn display(&self, surface_id: i64) -> Option<MockDisplay> {
        self.with_state(|s| s.displays.get(&surface_id).cloned())
    }

    pub fn live_displays(&self) -> Vec<i64> {
        self.with_state(|s| {
            let mut ids: Vec<i64> = s.displays.keys().copied().collect();
            ids.sort_unstable();
            ids
        })
    }

    /// 模拟服务端推送一帧视频
    pub fn emit_frame(&self, surface_id: i64, frame: Vec<u8>) -> bool {
        let sink = self.with_state(|s| s.displays.get(&surface_id).and_then(|d| d.sink.clone()));
        match sink {
            Some(sink) => {
                sink.push(frame);
                true
            }
            None => false,
        }
    }

    /// 记录调用并判断通道是否可用；need_display 时同时校验 surface 存在
    fn enter(
        &self,
        op: &str,
        surface_id: i64,
        detail: String,
        need_display: bool,
    ) -> Result<(), ChannelError> {
        self.with_state(|s| {
            s.calls.push(MockCall {
                op: op.to_string(),
                surface_id,
                detail,
            });
            if !s.alive || s.always_dead {
                return Err(ChannelError::Dead(format!("{op}: service is dead")));
            }
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return Err(ChannelError::Dead(format!("{op}: died mid-call")));
            }
            if need_display && !s.displays.contains_key(&surface_id) {
                return Err(ChannelError::Rejected(format!("unknown surface {surface_id}")));
            }
            Ok(())
        })
    }

    fn check_point(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError> {
        self.with_state(|s| match s.displays.get(&surface_id) {
            Some(d) if x >= 0 && y >= 0 && (x as u32) < d.width && (y as u32) < d.height => Ok(()),
            Some(_) => Err(ChannelError::Rejected(format!("point ({x}, {y}) outside surface"))),
            None => Err(ChannelError::Rejected(format!("unknown surface {surface_id}"))),
        })
    }
}

#[async_trait]
impl SurfaceService for MockSurfaceService {
    async fn ensure_display(
        &self,
        width: u32,
        height: u32,
        dpi: u32,
        bitrate_kbps: u32,
    ) -> Result<i64, ChannelError> {
        self.enter("ensure_display", -1, format!("{width}x{height}@{dpi}"), false)?;
        Ok(self.with_state(|s| {
            let id = s.next_id;
            s.next_id += 1;
            s.displays.insert(
                id,
                MockDisplay {
                    width,
                    height,
                    dpi,
                    bitrate_kbps,
                    sink: None,
                    foreground: None,
                    text: String::new(),
                },
            );
            id
        }))
    }

    async fn set_frame_sink(&self, surface_id: i64, sink: Option<FrameSink>) -> Result<(), ChannelError> {
        self.enter("set_frame_sink", surface_id, String::new(), true)?;
        self.with_state(|s| {
            if let Some(d) = s.displays.get_mut(&surface_id) {
                d.sink = sink;
            }
        });
        Ok(())
    }

    async fn request_screenshot(&self, surface_id: i64) -> Result<Vec<u8>, ChannelError> {
        self.enter("request_screenshot", surface_id, String::new(), true)?;
        let delay = self.with_state(|s| s.screenshot_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.with_state(|s| {
            s.shots += 1;
            format!("mock-png:{surface_id}:{}", s.shots).into_bytes()
        }))
    }

    async fn tap(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError> {
        self.enter("tap", surface_id, format!("{x},{y}"), true)?;
        self.check_point(surface_id, x, y)
    }

    async fn swipe(
        &self,
        surface_id: i64,
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    ) -> Result<(), ChannelError> {
        self.enter(
            "swipe",
            surface_id,
            format!("{},{}->{},{} {}ms", from.0, from.1, to.0, to.1, duration_ms),
            true,
        )?;
        self.check_point(surface_id, from.0, from.1)?;
        self.check_point(surface_id, to.0, to.1)
    }

    async fn touch_down(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError> {
        self.enter("touch_down", surface_id, format!("{x},{y}"), true)?;
        self.check_point(surface_id, x, y)
    }

    async fn touch_move(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError> {
        self.enter("touch_move", surface_id, format!("{x},{y}"), true)?;
        self.check_point(surface_id, x, y)
    }

    async fn touch_up(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError> {
        self.enter("touch_up", surface_id, format!("{x},{y}"), true)?;
        self.check_point(surface_id, x, y)
    }

    async fn inject_key(&self, surface_id: i64, code: i32) -> Result<(), ChannelError> {
        self.enter("inject_key", surface_id, code.to_string(), true)
    }

    async fn inject_key_with_meta(&self, surface_id: i64, code: i32, meta: i32) -> Result<(), ChannelError> {
        self.enter("inject_key_with_meta", surface_id, format!("{code}+{meta}"), true)
    }

    async fn set_text(&self, surface_id: i64, text: &str) -> Result<(), ChannelError> {
        self.enter("set_text", surface_id, text.to_string(), true)?;
        self.with_state(|s| {
            if let Some(d) = s.displays.get_mut(&surface_id) {
                d.text = text.to_string();
            }
        });
        Ok(())
    }

    async fn launch_app(&self, surface_id: i64, package: &str, display_fix: bool) -> Result<(), ChannelError> {
        self.enter("launch_app", surface_id, format!("{package} fix={display_fix}"), true)?;
        self.with_state(|s| {
            if s.missing_packages.contains(package) {
                return Err(ChannelError::Rejected(format!("package {package} not installed")));
            }
            if let Some(d) = s.displays.get_mut(&surface_id) {
                d.foreground = Some(package.to_string());
            }
            Ok(())
        })
    }

    async fn destroy_display(&self, surface_id: i64) -> Result<(), ChannelError> {
        self.enter("destroy_display", surface_id, String::new(), false)?;
        self.with_state(|s| {
            s.displays.remove(&surface_id);
        });
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.with_state(|s| s.alive)
    }
}

#[async_trait]
impl ServiceConnector for MockSurfaceService {
    async fn connect(&self) -> Result<Arc<dyn SurfaceService>, ChannelError> {
        if self.with_state(|s| s.alive) {
            Ok(Arc::new(self.clone()))
        } else {
            Err(ChannelError::Dead("mock service is down".to_string()))
        }
    }

    async fn restart_service(&self) -> Result<(), ChannelError> {
        self.with_state(|s| {
            s.alive = true;
            s.restarts += 1;
        });
        Ok(())
    }
}
