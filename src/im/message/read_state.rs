//! 已读状态跟踪
//!
//! 触发点：聊天页获得焦点、应用回到前台、聊天页可见时收到对方新消息。
//! 每个触发点有各自的延迟，新的调度会取消尚未执行的旧调度。

use crate::im::config::ChatConfig;
use crate::im::error::ChatResult;
use crate::im::message::service::MessageService;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 标记已读的触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTrigger {
    /// 打开聊天页，立即执行
    Open,
    Focus,
    Foreground,
    /// 聊天页可见时收到对方消息
    Inbound,
}

impl ReadTrigger {
    pub fn delay(&self, config: &ChatConfig) -> Duration {
        match self {
            ReadTrigger::Open => Duration::ZERO,
            ReadTrigger::Focus => config.mark_read_focus_delay,
            ReadTrigger::Foreground => config.mark_read_foreground_delay,
            ReadTrigger::Inbound => config.mark_read_inbound_delay,
        }
    }
}

struct TrackerInner {
    service: MessageService,
    conversation_id: String,
    viewer_id: String,
    /// 同一会话的批量更新串行执行
    gate: tokio::sync::Mutex<()>,
}

impl TrackerInner {
    async fn mark_read(&self) -> ChatResult<u64> {
        let _guard = self.gate.lock().await;
        self.service
            .mark_read(&self.conversation_id, &self.viewer_id)
            .await
    }
}

pub struct ReadStateTracker {
    inner: Arc<TrackerInner>,
    config: Arc<ChatConfig>,
    scheduled: Mutex<Option<JoinHandle<()>>>,
}

impl ReadStateTracker {
    pub fn new(
        service: MessageService,
        config: Arc<ChatConfig>,
        conversation_id: impl Into<String>,
        viewer_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                service,
                conversation_id: conversation_id.into(),
                viewer_id: viewer_id.into(),
                gate: tokio::sync::Mutex::new(()),
            }),
            config,
            scheduled: Mutex::new(None),
        }
    }

    /// 立即执行一次批量标记，返回影响条数（没有新消息时为 0）
    pub async fn mark_read(&self) -> ChatResult<u64> {
        self.inner.mark_read().await
    }

    /// 按触发来源延迟标记，覆盖尚未执行的旧调度
    pub fn schedule(&self, trigger: ReadTrigger) {
        let delay = trigger.delay(&self.config);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match inner.mark_read().await {
                Ok(count) => debug!(
                    "[ReadState] {:?} 触发标记已读完成 conv={}, count={}",
                    trigger, inner.conversation_id, count
                ),
                Err(e) => warn!(
                    "[ReadState] ⚠️ {:?} 触发标记已读失败 conv={}: {}",
                    trigger, inner.conversation_id, e
                ),
            }
        });

        if let Ok(mut slot) = self.scheduled.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// 取消尚未执行的调度（失去焦点或关闭聊天页）
    pub fn cancel(&self) {
        if let Ok(mut slot) = self.scheduled.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    /// 是否有尚未完成的调度
    pub fn has_pending(&self) -> bool {
        self.scheduled
            .lock()
            .map(|slot| slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}

impl Drop for ReadStateTracker {
    fn drop(&mut self) {
        self.cancel();
    }
}
