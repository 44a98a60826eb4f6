//! 视频帧接收端
//!
//! 每个虚拟屏绑定一个 FrameSink。消费者挂上之前到达的帧先缓存（最多 120 帧，超出丢最旧的），
//! 挂上 handler 时按到达顺序回放。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// 挂上消费者前最多缓存的帧数
pub const MAX_EARLY_FRAMES: usize = 120;

/// 编码后的视频帧（原样转发服务端推送的字节）
pub type Frame = Vec<u8>;

#[derive(Debug, Default)]
struct SinkState {
    early: VecDeque<Frame>,
    handler: Option<mpsc::UnboundedSender<Frame>>,
    dropped: u64,
}

/// 单个虚拟屏的帧接收端；clone 共享同一缓冲
#[derive(Debug, Clone)]
pub struct FrameSink {
    surface_id: i64,
    state: Arc<Mutex<SinkState>>,
}

impl FrameSink {
    pub fn new(surface_id: i64) -> Self {
        Self {
            surface_id,
            state: Arc::new(Mutex::new(SinkState::default())),
        }
    }

    pub fn surface_id(&self) -> i64 {
        self.surface_id
    }

    /// 服务端推来一帧：有消费者则直接转发，否则进入早期缓冲
    pub fn push(&self, frame: Frame) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(tx) = &state.handler {
            match tx.send(frame) {
                Ok(()) => return,
                Err(mpsc::error::SendError(frame)) => {
                    // 消费者已退出，回到缓冲模式
                    state.handler = None;
                    buffer(&mut state, frame);
                }
            }
        } else {
            buffer(&mut state, frame);
        }
    }

    /// 挂上（或摘下）消费者。挂上时先按顺序回放缓冲帧。
    pub fn set_handler(&self, handler: Option<mpsc::UnboundedSender<Frame>>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(tx) = &handler {
            let replay: Vec<Frame> = state.early.drain(..).collect();
            tracing::debug!(
                surface_id = self.surface_id,
                frames = replay.len(),
                "replaying buffered frames"
            );
            for frame in replay {
                let _ = tx.send(frame);
            }
        }
        state.handler = handler;
    }

    /// 便捷接口：新建通道并挂上，返回接收端
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.set_handler(Some(tx));
        rx
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().map(|s| s.early.len()).unwrap_or(0)
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().map(|s| s.dropped).unwrap_or(0)
    }
}

fn buffer(state: &mut SinkState, frame: Frame) {
    if state.early.len() >= MAX_EARLY_FRAMES {
        state.early.pop_front();
        state.dropped += 1;
    }
    state.early.push_back(frame);
}
