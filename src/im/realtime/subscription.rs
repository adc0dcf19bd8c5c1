//! 实时订阅生命周期
//!
//! 状态机：Idle → Subscribing → Active → (Closed | Error)。
//! 订阅句柄是有作用域的资源：显式 `release`，或在 Drop 时后台取消订阅。

use crate::im::error::{ChatError, ChatResult};
use crate::im::gateway::{ChangeSink, RemoteGateway, SubscriptionHandle};
use crate::im::types::{RowChange, RowFilter, Table};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Active,
    Closed,
    Error,
}

impl SubscriptionState {
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionState::Active)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Idle => "IDLE",
            SubscriptionState::Subscribing => "SUBSCRIBING",
            SubscriptionState::Active => "ACTIVE",
            SubscriptionState::Closed => "CLOSED",
            SubscriptionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

pub struct RealtimeSubscription {
    gateway: Arc<dyn RemoteGateway>,
    table: Table,
    filter: RowFilter,
    state: SubscriptionState,
    handle: Option<SubscriptionHandle>,
}

impl RealtimeSubscription {
    pub fn new(gateway: Arc<dyn RemoteGateway>, table: Table, filter: RowFilter) -> Self {
        Self {
            gateway,
            table,
            filter,
            state: SubscriptionState::Idle,
            handle: None,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// 建立订阅，返回事件接收端
    pub async fn open(&mut self) -> ChatResult<mpsc::UnboundedReceiver<RowChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.open_with_sink(tx).await?;
        Ok(rx)
    }

    /// 使用外部 sink 建立订阅（多个订阅汇入同一个接收端）
    pub async fn open_with_sink(&mut self, sink: ChangeSink) -> ChatResult<()> {
        // 重新订阅前先释放旧句柄
        self.release().await;
        self.state = SubscriptionState::Subscribing;
        debug!(
            "[Realtime] 订阅 {} ({:?}) -> {}",
            self.table,
            self.filter.to_filter_string(),
            self.state
        );

        match self
            .gateway
            .subscribe_row_changes(self.table, self.filter.clone(), sink)
            .await
        {
            Ok(handle) => {
                info!("[Realtime] ✅ 订阅生效 {} ({})", self.table, handle.topic);
                self.handle = Some(handle);
                self.state = SubscriptionState::Active;
                Ok(())
            }
            Err(e) => {
                warn!("[Realtime] ⚠️ 订阅失败 {}: {}", self.table, e);
                self.state = SubscriptionState::Error;
                Err(ChatError::Subscription(e))
            }
        }
    }

    /// 接收端发现通道已断开
    pub fn mark_failed(&mut self) {
        if self.state == SubscriptionState::Active {
            warn!("[Realtime] 订阅 {} 通道已断开", self.table);
            self.state = SubscriptionState::Error;
        }
    }

    /// 释放订阅，重复调用无副作用
    pub async fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.gateway.unsubscribe(&handle).await {
                warn!("[Realtime] 取消订阅失败 {}: {}", handle.topic, e);
            }
            debug!("[Realtime] 已释放订阅 {}", handle.topic);
        }
        if self.state != SubscriptionState::Idle {
            self.state = SubscriptionState::Closed;
        }
    }
}

impl Drop for RealtimeSubscription {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let gateway = self.gateway.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = gateway.unsubscribe(&handle).await {
                        warn!("[Realtime] Drop 时取消订阅失败 {}: {}", handle.topic, e);
                    }
                });
            }
            Err(_) => warn!("[Realtime] 运行时已退出，未能取消订阅 {}", handle.topic),
        }
    }
}
