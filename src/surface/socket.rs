//! Unix socket 传输：与特权服务之间的换行分隔 JSON 协议
//!
//! 请求：`{"id": 1, "method": "tap", "params": {...}}`
//! 响应：`{"id": 1, "ok": true, "result": ...}` 或 `{"id": 1, "ok": false, "error": "..."}`
//! 事件：`{"event": "frame", "surface_id": 3, "data": "<base64>"}`
//!
//! 按行分帧（LinesCodec，单行有上限）。后台读任务按 id 把响应分发给等待中的调用，
//! 把帧事件投递给对应 surface 的 FrameSink。连接断开时所有未完成调用以 ChannelError::Dead 结束。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::core::error::ChannelError;
use crate::surface::channel::{ServiceConnector, SurfaceService};
use crate::surface::frame::FrameSink;

/// 单行上限；截图以 base64 放在一行里，所以要足够大
pub const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, ChannelError>>>>>;
type Sinks = Arc<StdMutex<HashMap<i64, FrameSink>>>;

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event {
    Frame { surface_id: i64, data: String },
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Event(Event),
    Reply(Reply),
}

/// 调用方的 future 被丢弃（例如截图超时）时移除等待表中的条目
struct PendingGuard {
    pending: Pending,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

/// 通过 Unix socket 连接服务；重启时执行配置的宿主命令
pub struct SocketConnector {
    path: PathBuf,
    restart_command: Vec<String>,
}

impl SocketConnector {
    pub fn new(path: PathBuf, restart_command: Vec<String>) -> Self {
        Self { path, restart_command }
    }
}

#[async_trait]
impl ServiceConnector for SocketConnector {
    async fn connect(&self) -> Result<Arc<dyn SurfaceService>, ChannelError> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| ChannelError::Dead(format!("connect {}: {}", self.path.display(), e)))?;
        tracing::info!("connected to surface service at {}", self.path.display());
        Ok(Arc::new(SocketService::start(stream)))
    }

    async fn restart_service(&self) -> Result<(), ChannelError> {
        let Some((program, args)) = self.restart_command.split_first() else {
            tracing::warn!("no restart command configured, waiting for service to come back");
            return Ok(());
        };
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| ChannelError::Dead(format!("restart command failed to start: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(ChannelError::Dead(format!("restart command exited with {status}")))
        }
    }
}

/// 单条连接
pub struct SocketService {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    pending: Pending,
    sinks: Sinks,
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl SocketService {
    pub fn start(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let sinks: Sinks = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            pending.clone(),
            sinks.clone(),
            alive.clone(),
        ));

        Self {
            writer: Mutex::new(FramedWrite::new(
                write_half,
                LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            )),
            pending,
            sinks,
            alive,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    /// 等待回复的调用数
    pub fn in_flight(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ChannelError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ChannelError::Dead("connection closed".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id,
        };

        let line = serde_json::to_string(&Request { id, method, params })
            .map_err(|e| ChannelError::Rejected(format!("{method}: encode failed: {e}")))?;
        let written = self.writer.lock().await.send(line).await;
        if let Err(e) = written {
            self.alive.store(false, Ordering::SeqCst);
            return Err(ChannelError::Dead(format!("{method}: write failed: {e}")));
        }

        rx.await
            .map_err(|_| ChannelError::Dead(format!("{method}: connection closed")))?
    }

    async fn rpc_unit(&self, method: &str, params: Value) -> Result<(), ChannelError> {
        self.rpc(method, params).await.map(|_| ())
    }
}

impl Drop for SocketService {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut lines: FramedRead<OwnedReadHalf, LinesCodec>,
    pending: Pending,
    sinks: Sinks,
    alive: Arc<AtomicBool>,
) {
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => dispatch_line(&line, &pending, &sinks),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(max = MAX_LINE_BYTES, "oversized line from surface service dropped");
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::warn!(error = %e, "surface service read failed");
                break;
            }
        }
    }
    tracing::warn!("surface service connection closed");
    alive.store(false, Ordering::SeqCst);
    fail_all(&pending, "connection closed");
}

fn dispatch_line(line: &str, pending: &Pending, sinks: &Sinks) {
    let incoming: Incoming = match serde_json::from_str(line) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "malformed line from surface service");
            return;
        }
    };

    match incoming {
        Incoming::Event(Event::Frame { surface_id, data }) => {
            let frame = match base64::engine::general_purpose::STANDARD.decode(&data) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(surface_id, error = %e, "bad frame payload");
                    return;
                }
            };
            let sink = sinks.lock().ok().and_then(|s| s.get(&surface_id).cloned());
            if let Some(sink) = sink {
                sink.push(frame);
            }
        }
        Incoming::Reply(reply) => {
            let waiter = pending.lock().ok().and_then(|mut p| p.remove(&reply.id));
            let Some(waiter) = waiter else {
                tracing::debug!(id = reply.id, "reply for a call nobody waits on");
                return;
            };
            let result = if reply.ok {
                Ok(reply.result)
            } else {
                Err(ChannelError::Rejected(
                    reply.error.unwrap_or_else(|| "rejected".to_string()),
                ))
            };
            let _ = waiter.send(result);
        }
    }
}

fn fail_all(pending: &Pending, reason: &str) {
    if let Ok(mut p) = pending.lock() {
        for (_, waiter) in p.drain() {
            let _ = waiter.send(Err(ChannelError::Dead(reason.to_string())));
        }
    }
}

#[async_trait]
impl SurfaceService for SocketService {
    async fn ensure_display(
        &self,
        width: u32,
        height: u32,
        dpi: u32,
        bitrate_kbps: u32,
    ) -> Result<i64, ChannelError> {
        let result = self
            .rpc(
                "ensure_display",
                json!({ "width": width, "height": height, "dpi": dpi, "bitrate_kbps": bitrate_kbps }),
            )
            .await?;
        result
            .as_i64()
            .ok_or_else(|| ChannelError::Rejected(format!("unexpected ensure_display result: {result}")))
    }

    async fn set_frame_sink(&self, surface_id: i64, sink: Option<FrameSink>) -> Result<(), ChannelError> {
        let attach = sink.is_some();
        if let Ok(mut sinks) = self.sinks.lock() {
            match sink {
                Some(sink) => {
                    sinks.insert(surface_id, sink);
                }
                None => {
                    sinks.remove(&surface_id);
                }
            }
        }
        self.rpc_unit("set_frame_sink", json!({ "surface_id": surface_id, "attach": attach }))
            .await
    }

    async fn request_screenshot(&self, surface_id: i64) -> Result<Vec<u8>, ChannelError> {
        let result = self
            .rpc("request_screenshot", json!({ "surface_id": surface_id }))
            .await?;
        let encoded = result
            .as_str()
            .ok_or_else(|| ChannelError::Rejected("screenshot unavailable".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ChannelError::Rejected(format!("bad screenshot payload: {e}")))
    }

    async fn tap(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError> {
        self.rpc_unit("tap", json!({ "surface_id": surface_id, "x": x, "y": y }))
            .await
    }

    async fn swipe(
        &self,
        surface_id: i64,
        from: (i32, i32),
        to: (i32, i32),
        duration_ms: u64,
    ) -> Result<(), ChannelError> {
        self.rpc_unit(
            "swipe",
            json!({
                "surface_id": surface_id,
                "x1": from.0, "y1": from.1,
                "x2": to.0, "y2": to.1,
                "duration_ms": duration_ms,
            }),
        )
        .await
    }

    async fn touch_down(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError> {
        self.rpc_unit("touch_down", json!({ "surface_id": surface_id, "x": x, "y": y }))
            .await
    }

    async fn touch_move(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError> {
        self.rpc_unit("touch_move", json!({ "surface_id": surface_id, "x": x, "y": y }))
            .await
    }

    async fn touch_up(&self, surface_id: i64, x: i32, y: i32) -> Result<(), ChannelError> {
        self.rpc_unit("touch_up", json!({ "surface_id": surface_id, "x": x, "y": y }))
            .await
    }

    async fn inject_key(&self, surface_id: i64, code: i32) -> Result<(), ChannelError> {
        self.rpc_unit("inject_key", json!({ "surface_id": surface_id, "code": code }))
            .await
    }

    async fn inject_key_with_meta(&self, surface_id: i64, code: i32, meta: i32) -> Result<(), ChannelError> {
        self.rpc_unit(
            "inject_key_with_meta",
            json!({ "surface_id": surface_id, "code": code, "meta": meta }),
        )
        .await
    }

    async fn set_text(&self, surface_id: i64, text: &str) -> Result<(), ChannelError> {
        self.rpc_unit("set_text", json!({ "surface_id": surface_id, "text": text }))
            .await
    }

    async fn launch_app(&self, surface_id: i64, package: &str, display_fix: bool) -> Result<(), ChannelError> {
        self.rpc_unit(
            "launch_app",
            json!({ "surface_id": surface_id, "package": package, "display_fix": display_fix }),
        )
        .await
    }

    async fn destroy_display(&self, surface_id: i64) -> Result<(), ChannelError> {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.remove(&surface_id);
        }
        self.rpc_unit("destroy_display", json!({ "surface_id": surface_id }))
            .await
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    /// 一个最小的假服务：ensure_display 返回 7，截图返回 "png"（surface 99 永不回复），
    /// tap 越界拒绝，收到 set_frame_sink 后推送一帧
    async fn fake_server(listener: UnixListener, close_after: Option<usize>) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut lines = FramedRead::new(read_half, LinesCodec::new());
        let mut out = FramedWrite::new(write_half, LinesCodec::new());
        let mut handled = 0usize;
        while let Some(Ok(line)) = lines.next().await {
            if close_after == Some(handled) {
                return;
            }
            handled += 1;
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["id"].as_u64().unwrap();
            let reply = match req["method"].as_str().unwrap() {
                "ensure_display" => json!({ "id": id, "ok": true, "result": 7 }),
                "request_screenshot" if req["params"]["surface_id"] == 99 => continue,
                "request_screenshot" => json!({
                    "id": id, "ok": true,
                    "result": base64::engine::general_purpose::STANDARD.encode(b"png"),
                }),
                "tap" if req["params"]["x"].as_i64().unwrap() < 0 => {
                    json!({ "id": id, "ok": false, "error": "out of bounds" })
                }
                "set_frame_sink" => {
                    let frame = json!({
                        "event": "frame", "surface_id": 7,
                        "data": base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]),
                    });
                    out.send(frame.to_string()).await.unwrap();
                    json!({ "id": id, "ok": true, "result": null })
                }
                _ => json!({ "id": id, "ok": true, "result": null }),
            };
            out.send(reply.to_string()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_request_response_and_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_server(listener, None));

        let connector = SocketConnector::new(path, Vec::new());
        let svc = connector.connect().await.unwrap();
        assert_eq!(svc.ensure_display(720, 1280, 320, 3000).await.unwrap(), 7);

        let sink = FrameSink::new(7);
        let mut rx = sink.subscribe();
        svc.set_frame_sink(7, Some(sink)).await.unwrap();
        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));

        assert_eq!(svc.request_screenshot(7).await.unwrap(), b"png".to_vec());
        let err = svc.tap(7, -1, 0).await.unwrap_err();
        assert_eq!(err, ChannelError::Rejected("out of bounds".to_string()));
        assert!(svc.tap(7, 1, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_connection_reports_dead() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_server(listener, Some(1)));

        let connector = SocketConnector::new(path, Vec::new());
        let svc = connector.connect().await.unwrap();
        assert!(svc.ensure_display(720, 1280, 320, 3000).await.is_ok());
        let err = svc.tap(7, 1, 1).await.unwrap_err();
        assert!(err.is_dead());
        assert!(!svc.is_alive().await);
    }

    #[tokio::test]
    async fn test_abandoned_call_leaves_no_pending_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(fake_server(listener, None));

        let svc = SocketService::start(UnixStream::connect(&path).await.unwrap());
        let stalled =
            tokio::time::timeout(std::time::Duration::from_millis(50), svc.request_screenshot(99)).await;
        assert!(stalled.is_err());
        assert_eq!(svc.in_flight(), 0);

        // 连接仍然可用
        assert_eq!(svc.request_screenshot(7).await.unwrap(), b"png".to_vec());
        assert_eq!(svc.in_flight(), 0);
    }

    #[test]
    fn test_incoming_lines_are_typed() {
        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let sinks: Sinks = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(3, tx);

        dispatch_line("not json", &pending, &sinks);
        dispatch_line(r#"{"event":"frame","surface_id":1,"data":"AQID"}"#, &pending, &sinks);
        assert!(rx.try_recv().is_err());

        dispatch_line(r#"{"id":3,"ok":false,"error":"no such surface"}"#, &pending, &sinks);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(ChannelError::Rejected("no such surface".to_string()))
        );
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_is_dead() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SocketConnector::new(dir.path().join("none.sock"), Vec::new());
        match connector.connect().await {
            Err(e) => assert!(e.is_dead()),
            Ok(_) => panic!("expected connect failure"),
        }
    }
}
