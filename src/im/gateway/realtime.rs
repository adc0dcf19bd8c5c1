//! 实时通道客户端（Phoenix channel over WebSocket）
//!
//! 一个客户端只维护一条 WebSocket 连接，每个订阅对应一个 channel topic：
//! - `phx_join` 携带 `postgres_changes` 配置，等待对应 ref 的 `phx_reply`
//! - 每隔固定间隔在 `phoenix` topic 上发送心跳
//! - `postgres_changes` 推送按 topic 路由到订阅方的 sink
//! - `phx_leave` 取消订阅；`phx_error` / `phx_close` 直接丢弃 sink，订阅方据此感知通道失效

use crate::im::config::ChatConfig;
use crate::im::error::{GatewayError, GatewayResult};
use crate::im::gateway::{ChangeSink, SubscriptionHandle};
use crate::im::types::{ChangeKind, RowChange, RowFilter, Table};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// WebSocket 写入端类型别名
pub type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket 读取端类型别名
pub type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const PHOENIX_TOPIC: &str = "phoenix";
const EVENT_JOIN: &str = "phx_join";
const EVENT_LEAVE: &str = "phx_leave";
const EVENT_REPLY: &str = "phx_reply";
const EVENT_ERROR: &str = "phx_error";
const EVENT_CLOSE: &str = "phx_close";
const EVENT_HEARTBEAT: &str = "heartbeat";
const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";

/// Phoenix 协议帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: impl Into<String>, event: &str, payload: Value, reference: String) -> Self {
        Self {
            topic: topic.into(),
            event: event.to_string(),
            payload,
            reference: Some(reference),
            join_ref: None,
        }
    }

    /// 回复状态是否为 ok
    fn reply_ok(&self) -> bool {
        self.payload.get("status").and_then(|s| s.as_str()) == Some("ok")
    }
}

/// 构造 `phx_join` 的 payload
pub(crate) fn join_payload(table: Table, filter: &RowFilter, access_token: &str) -> Value {
    let mut change = json!({
        "event": "*",
        "schema": "public",
        "table": table.as_str(),
    });
    if let Some(filter) = filter.to_filter_string() {
        change["filter"] = Value::String(filter);
    }
    json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        },
        "access_token": access_token,
    })
}

/// 解析 `postgres_changes` 推送为行变更
pub(crate) fn parse_change(payload: &Value) -> Option<RowChange> {
    let data = payload.get("data")?;
    let table = Table::from_name(data.get("table")?.as_str()?)?;
    let kind = data
        .get("type")
        .or_else(|| data.get("eventType"))
        .and_then(|v| v.as_str())
        .and_then(ChangeKind::from_name)?;
    let record = data.get("record").cloned().unwrap_or(Value::Null);
    let old_record = data.get("old_record").cloned().unwrap_or(Value::Null);
    Some(RowChange::new(table, kind, record).with_old_record(old_record))
}

struct ChannelEntry {
    sink: ChangeSink,
    handle_id: String,
}

struct RealtimeInner {
    writer: Mutex<WsWriter>,
    channels: std::sync::Mutex<HashMap<String, ChannelEntry>>,
    pending_joins: std::sync::Mutex<HashMap<String, oneshot::Sender<PhoenixMessage>>>,
    next_ref: AtomicU64,
    connected: AtomicBool,
    access_token: String,
    join_timeout: Duration,
}

impl RealtimeInner {
    fn make_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    async fn send_frame(&self, frame: &PhoenixMessage) -> GatewayResult<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(GatewayError::Closed);
        }
        let text = serde_json::to_string(frame)?;
        let mut w = self.writer.lock().await;
        w.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    fn remove_channel(&self, topic: &str) -> Option<ChannelEntry> {
        self.channels.lock().ok().and_then(|mut c| c.remove(topic))
    }

    /// 连接断开：丢弃所有 sink，唤醒等待中的 join
    fn shutdown_channels(&self) {
        self.connected.store(false, Ordering::Release);
        if let Ok(mut channels) = self.channels.lock() {
            channels.clear();
        }
        if let Ok(mut pending) = self.pending_joins.lock() {
            pending.clear();
        }
    }

    fn dispatch(&self, frame: PhoenixMessage) {
        match frame.event.as_str() {
            EVENT_REPLY => {
                let waiter = frame.reference.as_ref().and_then(|r| {
                    self.pending_joins
                        .lock()
                        .ok()
                        .and_then(|mut pending| pending.remove(r))
                });
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => {
                        if !frame.reply_ok() {
                            warn!("[Realtime] topic {} 收到错误回复: {}", frame.topic, frame.payload);
                        }
                    }
                }
            }
            EVENT_POSTGRES_CHANGES => {
                let Some(change) = parse_change(&frame.payload) else {
                    warn!("[Realtime] 无法解析的变更推送: {}", frame.payload);
                    return;
                };
                let closed = match self.channels.lock() {
                    Ok(channels) => match channels.get(&frame.topic) {
                        Some(entry) => entry.sink.send(change).is_err(),
                        None => {
                            debug!("[Realtime] 未知 topic 的推送: {}", frame.topic);
                            false
                        }
                    },
                    Err(_) => false,
                };
                if closed {
                    debug!("[Realtime] 订阅方已释放，移除 topic {}", frame.topic);
                    self.remove_channel(&frame.topic);
                }
            }
            EVENT_ERROR | EVENT_CLOSE => {
                if let Some(entry) = self.remove_channel(&frame.topic) {
                    warn!(
                        "[Realtime] ⚠️ channel {} 已失效 ({}), 订阅 {}",
                        frame.topic, frame.event, entry.handle_id
                    );
                }
            }
            other => {
                debug!("[Realtime] 忽略事件 {} (topic={})", other, frame.topic);
            }
        }
    }

    /// 处理接收消息（事件循环）
    async fn handle_messages(&self, mut read: WsReader) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<PhoenixMessage>(&text) {
                    Ok(frame) => self.dispatch(frame),
                    Err(e) => warn!("[Realtime] 帧解析失败: {}, 原始数据: {}", e, text),
                },
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(frame)) => {
                    warn!("[Realtime] 👋 连接关闭: {:?}", frame);
                    break;
                }
                Err(e) => {
                    error!("[Realtime] WebSocket 错误: {}", e);
                    break;
                }
                _ => {}
            }
        }
        self.shutdown_channels();
    }
}

/// 实时通道客户端
pub struct RealtimeClient {
    inner: Arc<RealtimeInner>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// 建立连接并在内部启动心跳与消息处理任务
    pub async fn connect(config: &ChatConfig, access_token: &str) -> GatewayResult<Self> {
        let url = format!(
            "{}?apikey={}&vsn=1.0.0",
            config.realtime_endpoint(),
            config.anon_key
        );
        info!("[Realtime] 🔗 连接实时通道: {}", config.realtime_endpoint());

        let (ws_stream, response) = connect_async(&url).await?;
        info!("[Realtime] ✅ WebSocket 连接成功, 状态: {}", response.status());

        let (write, read) = ws_stream.split();
        let inner = Arc::new(RealtimeInner {
            writer: Mutex::new(write),
            channels: std::sync::Mutex::new(HashMap::new()),
            pending_joins: std::sync::Mutex::new(HashMap::new()),
            next_ref: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            access_token: access_token.to_string(),
            join_timeout: config.realtime_join_timeout,
        });

        // 启动心跳
        let heartbeat_inner = inner.clone();
        let heartbeat_every = config.realtime_heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval(heartbeat_every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = PhoenixMessage::new(
                    PHOENIX_TOPIC,
                    EVENT_HEARTBEAT,
                    json!({}),
                    heartbeat_inner.make_ref(),
                );
                if let Err(e) = heartbeat_inner.send_frame(&frame).await {
                    warn!("[Realtime] 💓 心跳发送失败，停止心跳: {}", e);
                    break;
                }
            }
        });

        let reader_inner = inner.clone();
        let reader = tokio::spawn(async move {
            reader_inner.handle_messages(read).await;
            info!("[Realtime] 📴 消息处理任务结束");
        });

        Ok(Self {
            inner,
            tasks: std::sync::Mutex::new(vec![heartbeat, reader]),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// 订阅表变更，等待服务端确认加入后返回
    pub async fn subscribe(
        &self,
        table: Table,
        filter: RowFilter,
        sink: ChangeSink,
    ) -> GatewayResult<SubscriptionHandle> {
        let topic = format!("realtime:{}:{}", table, uuid::Uuid::new_v4());
        let handle = SubscriptionHandle::new(topic.clone());
        let join_ref = self.inner.make_ref();

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.inner.pending_joins.lock() {
            pending.insert(join_ref.clone(), tx);
        }
        if let Ok(mut channels) = self.inner.channels.lock() {
            channels.insert(
                topic.clone(),
                ChannelEntry {
                    sink,
                    handle_id: handle.id.clone(),
                },
            );
        }

        let mut frame = PhoenixMessage::new(
            topic.clone(),
            EVENT_JOIN,
            join_payload(table, &filter, &self.inner.access_token),
            join_ref.clone(),
        );
        frame.join_ref = Some(join_ref.clone());

        debug!("[Realtime] ➡️ phx_join {} ({:?})", topic, filter.to_filter_string());
        let result = match self.inner.send_frame(&frame).await {
            Ok(()) => match tokio::time::timeout(self.inner.join_timeout, rx).await {
                Ok(Ok(reply)) if reply.reply_ok() => Ok(()),
                Ok(Ok(reply)) => Err(GatewayError::Realtime(format!(
                    "加入 channel 被拒绝: {}",
                    reply.payload
                ))),
                Ok(Err(_)) => Err(GatewayError::Closed),
                Err(_) => Err(GatewayError::Realtime("加入 channel 超时".to_string())),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!("[Realtime] ✅ 订阅成功 {} ({})", table, topic);
                Ok(handle)
            }
            Err(e) => {
                if let Ok(mut pending) = self.inner.pending_joins.lock() {
                    pending.remove(&join_ref);
                }
                self.inner.remove_channel(&topic);
                error!("[Realtime] ❌ 订阅失败 {}: {}", topic, e);
                Err(e)
            }
        }
    }

    /// 取消订阅（`phx_leave`），重复调用无副作用
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GatewayResult<()> {
        if self.inner.remove_channel(&handle.topic).is_none() {
            return Ok(());
        }
        let frame = PhoenixMessage::new(
            handle.topic.clone(),
            EVENT_LEAVE,
            json!({}),
            self.inner.make_ref(),
        );
        match self.inner.send_frame(&frame).await {
            Ok(()) => {
                debug!("[Realtime] ⬅️ phx_leave {}", handle.topic);
                Ok(())
            }
            // 连接已断开时 channel 也随之失效
            Err(GatewayError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 关闭连接并停止后台任务
    pub async fn close(&self) {
        {
            let mut w = self.inner.writer.lock().await;
            if let Err(e) = w.send(WsMessage::Close(None)).await {
                debug!("[Realtime] 发送关闭帧失败: {}", e);
            }
        }
        self.inner.shutdown_channels();
        self.abort_tasks();
        info!("[Realtime] 👋 实时通道已关闭");
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.abort_tasks();
        self.inner.shutdown_channels();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_payload_carries_filter() {
        let payload = join_payload(
            Table::Messages,
            &RowFilter::eq("conversation_id", "c1"),
            "jwt",
        );
        let change = &payload["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "messages");
        assert_eq!(change["event"], "*");
        assert_eq!(change["filter"], "conversation_id=eq.c1");
        assert_eq!(payload["access_token"], "jwt");

        let all = join_payload(Table::BlockedUsers, &RowFilter::All, "jwt");
        assert!(all["config"]["postgres_changes"][0].get("filter").is_none());
    }

    #[test]
    fn parses_postgres_change_frames() {
        let raw = r#"{
            "topic": "realtime:messages:abc",
            "event": "postgres_changes",
            "payload": {
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "messages",
                    "commit_timestamp": "2024-05-01T10:00:00Z",
                    "type": "UPDATE",
                    "record": {"id": "m1", "is_read": true},
                    "old_record": {"id": "m1"},
                    "errors": null
                }
            },
            "ref": null
        }"#;
        let frame: PhoenixMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.event, EVENT_POSTGRES_CHANGES);
        assert_eq!(frame.reference, None);

        let change = parse_change(&frame.payload).unwrap();
        assert_eq!(change.table, Table::Messages);
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.row_id(), Some("m1"));
    }

    #[test]
    fn unknown_tables_are_not_changes() {
        let payload = json!({"data": {"table": "cars", "type": "INSERT", "record": {}}});
        assert!(parse_change(&payload).is_none());
        assert!(parse_change(&json!({"status": "ok"})).is_none());
    }

    #[test]
    fn reply_status_is_checked() {
        let ok: PhoenixMessage = serde_json::from_str(
            r#"{"topic":"t","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1"}"#,
        )
        .unwrap();
        assert!(ok.reply_ok());
        let err: PhoenixMessage = serde_json::from_str(
            r#"{"topic":"t","event":"phx_reply","payload":{"status":"error","response":{}},"ref":"2"}"#,
        )
        .unwrap();
        assert!(!err.reply_ok());
    }
}
