//! 对方在线状态观察
//!
//! 先拉取一次对方的在线行，再订阅该行的变更，后到的推送覆盖先前的值。

use crate::im::context::ChatContext;
use crate::im::realtime::subscription::{RealtimeSubscription, SubscriptionState};
use crate::im::types::{ChangeKind, Presence, RowChange, RowFilter, Table};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 在线状态回调
#[async_trait]
pub trait PresenceListener: Send + Sync {
    async fn on_presence_changed(&self, user_id: String, is_online: bool);
}

/// 空实现（默认监听器）
pub struct EmptyPresenceListener;

#[async_trait]
impl PresenceListener for EmptyPresenceListener {
    async fn on_presence_changed(&self, _user_id: String, _is_online: bool) {}
}

pub struct PresenceObserver {
    target_id: String,
    state: watch::Receiver<Option<Presence>>,
    stale_after: chrono::Duration,
    subscription: RealtimeSubscription,
    task: Option<JoinHandle<()>>,
}

impl PresenceObserver {
    /// 开始观察 `target_id` 的在线状态；拉取或订阅失败都只记录日志
    pub async fn observe(
        ctx: &ChatContext,
        target_id: &str,
        listener: Arc<dyn PresenceListener>,
    ) -> Self {
        let gateway = ctx.gateway().clone();
        let initial = match gateway.fetch_presence(target_id).await {
            Ok(presence) => presence,
            Err(e) => {
                warn!("[Presence] ⚠️ 拉取 {} 在线状态失败: {}", target_id, e);
                None
            }
        };
        let stale_after = chrono::Duration::from_std(ctx.config().presence_stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(35));
        if let Some(presence) = &initial {
            listener
                .on_presence_changed(
                    target_id.to_string(),
                    presence.is_effectively_online(Utc::now(), stale_after),
                )
                .await;
        }
        let (state_tx, state_rx) = watch::channel(initial);

        let mut subscription = RealtimeSubscription::new(
            gateway,
            Table::UserPresence,
            RowFilter::eq("user_id", target_id),
        );
        let task = match subscription.open().await {
            Ok(rx) => Some(tokio::spawn(watch_presence(
                target_id.to_string(),
                rx,
                state_tx,
                listener,
            ))),
            Err(e) => {
                warn!("[Presence] ⚠️ 订阅 {} 在线状态失败: {}", target_id, e);
                None
            }
        };
        info!("[Presence] 👀 开始观察 {} 的在线状态", target_id);

        Self {
            target_id: target_id.to_string(),
            state: state_rx,
            stale_after,
            subscription,
            task,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// 最近一次看到的在线行
    pub fn presence(&self) -> Option<Presence> {
        self.state.borrow().clone()
    }

    /// 在线且心跳未过期
    pub fn is_online(&self) -> bool {
        self.state
            .borrow()
            .as_ref()
            .map(|p| p.is_effectively_online(Utc::now(), self.stale_after))
            .unwrap_or(false)
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.subscription.release().await;
        debug!("[Presence] 停止观察 {}", self.target_id);
    }
}

impl Drop for PresenceObserver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn watch_presence(
    target_id: String,
    mut rx: mpsc::UnboundedReceiver<RowChange>,
    state_tx: watch::Sender<Option<Presence>>,
    listener: Arc<dyn PresenceListener>,
) {
    while let Some(change) = rx.recv().await {
        if change.kind == ChangeKind::Delete {
            continue;
        }
        let presence: Presence = match change.decode() {
            Ok(p) => p,
            Err(e) => {
                warn!("[Presence] 在线状态解析失败: {}", e);
                continue;
            }
        };
        if presence.user_id != target_id {
            continue;
        }
        let is_online = presence.is_online;
        debug!(
            "[Presence] {} {}",
            target_id,
            if is_online { "ONLINE" } else { "OFFLINE" }
        );
        state_tx.send_replace(Some(presence));
        listener
            .on_presence_changed(target_id.clone(), is_online)
            .await;
    }
    warn!("[Presence] {} 的在线状态通道已关闭", target_id);
}
