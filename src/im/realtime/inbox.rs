//! 收件箱监听：订阅与当前用户相关的所有会话和消息
//!
//! 任意变更都会触发一次会话列表 + 未读数刷新，并回调 [`ConversationListener`]。

use crate::im::context::ChatContext;
use crate::im::conversation::{ConversationListener, ConversationManager};
use crate::im::error::ChatResult;
use crate::im::realtime::subscription::RealtimeSubscription;
use crate::im::types::{ChangeKind, Conversation, RowChange, RowFilter, Table};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct InboxWatcher {
    subscriptions: Vec<RealtimeSubscription>,
    task: Option<JoinHandle<()>>,
}

impl InboxWatcher {
    /// 先建立订阅，再推送初始列表，然后开始监听
    ///
    /// 订阅失败不影响初始列表，只是失去实时更新。
    pub async fn start(
        ctx: ChatContext,
        listener: Arc<dyn ConversationListener>,
    ) -> ChatResult<Self> {
        let user_id = ctx.user_id().to_string();
        let manager = ConversationManager::new(ctx.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let scopes = [
            (Table::Messages, RowFilter::eq("receiver_id", &user_id)),
            (Table::Conversations, RowFilter::eq("buyer_id", &user_id)),
            (Table::Conversations, RowFilter::eq("seller_id", &user_id)),
        ];
        let mut subscriptions = Vec::with_capacity(scopes.len());
        for (table, filter) in scopes {
            let mut subscription = RealtimeSubscription::new(ctx.gateway().clone(), table, filter);
            if let Err(e) = subscription.open_with_sink(tx.clone()).await {
                warn!("[Inbox] ⚠️ 收件箱订阅失败，降级为手动刷新: {}", e);
            }
            subscriptions.push(subscription);
        }
        // 只保留订阅持有的发送端，全部失效时接收端会结束
        drop(tx);

        // 订阅之后才拉列表：拉取期间的变更留在通道里，稍后再触发一次刷新
        refresh(&manager, &user_id, listener.as_ref()).await?;

        let task = tokio::spawn(watch_loop(manager, user_id, listener, rx));
        info!("[Inbox] 📬 收件箱监听已启动");
        Ok(Self {
            subscriptions,
            task: Some(task),
        })
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|s| s.state().is_live())
            .count()
    }

    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        for subscription in &mut self.subscriptions {
            subscription.release().await;
        }
        info!("[Inbox] 收件箱监听已停止");
    }
}

impl Drop for InboxWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn watch_loop(
    manager: ConversationManager,
    user_id: String,
    listener: Arc<dyn ConversationListener>,
    mut rx: mpsc::UnboundedReceiver<RowChange>,
) {
    while let Some(change) = rx.recv().await {
        notify_new_conversation(&change, listener.as_ref()).await;
        // 合并同一批到达的变更，只刷新一次
        while let Ok(more) = rx.try_recv() {
            notify_new_conversation(&more, listener.as_ref()).await;
        }
        if let Err(e) = refresh(&manager, &user_id, listener.as_ref()).await {
            warn!("[Inbox] ⚠️ 刷新会话列表失败: {}", e);
        }
    }
    warn!("[Inbox] 所有订阅通道已关闭，停止实时刷新");
}

async fn notify_new_conversation(change: &RowChange, listener: &dyn ConversationListener) {
    if change.table != Table::Conversations || change.kind != ChangeKind::Insert {
        return;
    }
    match change.decode::<Conversation>() {
        Ok(conversation) => {
            debug!("[Inbox] 🆕 新会话 {}", conversation.id);
            listener.on_new_conversation(conversation).await;
        }
        Err(e) => warn!("[Inbox] 新会话解析失败: {}", e),
    }
}

async fn refresh(
    manager: &ConversationManager,
    user_id: &str,
    listener: &dyn ConversationListener,
) -> ChatResult<()> {
    let items = manager.inbox(user_id).await?;
    let total: u64 = items.iter().map(|item| item.unread_count).sum();
    debug!("[Inbox] 会话 {} 个，未读总数 {}", items.len(), total);
    listener.on_conversation_list_changed(items).await;
    listener.on_total_unread_changed(total).await;
    Ok(())
}
