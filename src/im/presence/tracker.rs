//! 在线心跳
//!
//! 聊天页存续期间按固定间隔写入 `is_online = true`；应用切到后台立即写入离线并暂停心跳，
//! 回到前台立即写入在线。`stop` 取消任务并写入离线。只允许写自己的在线状态。

use crate::im::context::ChatContext;
use crate::im::error::{ChatError, ChatResult, ValidationError};
use crate::im::gateway::RemoteGateway;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 应用前后台状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Active,
    Background,
}

impl AppState {
    pub fn is_active(&self) -> bool {
        matches!(self, AppState::Active)
    }
}

pub struct PresenceTracker {
    ctx: ChatContext,
    state_tx: watch::Sender<AppState>,
    /// 串行化心跳写入，保证前后台切换的那次写入最后落地
    gate: Arc<tokio::sync::Mutex<()>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceTracker {
    pub fn new(ctx: ChatContext) -> Self {
        let (state_tx, _) = watch::channel(AppState::Active);
        Self {
            ctx,
            state_tx,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            task: Mutex::new(None),
        }
    }

    pub fn app_state(&self) -> AppState {
        *self.state_tx.borrow()
    }

    /// 写入一次在线状态；`user_id` 必须是当前用户
    pub async fn heartbeat(&self, user_id: &str, is_online: bool) -> ChatResult<()> {
        if user_id != self.ctx.user_id() {
            return Err(ValidationError::ForeignPresence {
                current: self.ctx.user_id().to_string(),
                target: user_id.to_string(),
            }
            .into());
        }
        let _guard = self.gate.lock().await;
        write_presence(self.ctx.gateway().as_ref(), user_id, is_online)
            .await
            .map_err(ChatError::Update)
    }

    /// 启动心跳任务（第一次心跳立即执行），重复调用无副作用
    pub fn start(&self) {
        let Ok(mut slot) = self.task.lock() else {
            return;
        };
        if slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let gateway = self.ctx.gateway().clone();
        let user_id = self.ctx.user_id().to_string();
        let every = self.ctx.config().presence_interval;
        let state_rx = self.state_tx.subscribe();
        let gate = self.gate.clone();

        info!("[Presence] 💓 启动在线心跳 user={}, 间隔 {:?}", user_id, every);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let _guard = gate.lock().await;
                if !state_rx.borrow().is_active() {
                    continue;
                }
                if let Err(e) = write_presence(gateway.as_ref(), &user_id, true).await {
                    warn!("[Presence] ⚠️ 心跳写入失败: {}", e);
                }
            }
        }));
    }

    /// 前后台切换：立即写入，后台期间暂停周期心跳
    pub async fn set_app_state(&self, state: AppState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("[Presence] 应用状态 {:?} -> {:?}", previous, state);
        }
        let _guard = self.gate.lock().await;
        if let Err(e) =
            write_presence(self.ctx.gateway().as_ref(), self.ctx.user_id(), state.is_active()).await
        {
            warn!("[Presence] ⚠️ 前后台切换写入失败: {}", e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|slot| slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// 只停止心跳任务，不写入离线（同步上下文使用）
    pub fn abort(&self) {
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            task.abort();
            info!("[Presence] 🛑 停止在线心跳 user={}", self.ctx.user_id());
        }
    }

    /// 停止心跳并写入离线
    pub async fn stop(&self) {
        self.abort();
        let _guard = self.gate.lock().await;
        if let Err(e) = write_presence(self.ctx.gateway().as_ref(), self.ctx.user_id(), false).await
        {
            warn!("[Presence] ⚠️ 写入离线状态失败: {}", e);
        }
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

async fn write_presence(
    gateway: &dyn RemoteGateway,
    user_id: &str,
    is_online: bool,
) -> crate::im::error::GatewayResult<()> {
    gateway.upsert_presence(user_id, is_online, Utc::now()).await?;
    debug!("[Presence] user={} online={}", user_id, is_online);
    Ok(())
}
