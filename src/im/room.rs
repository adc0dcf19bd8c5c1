//! 聊天页编排
//!
//! 一个 [`ChatRoom`] 对应一个打开的聊天页，负责：
//! - 打开时标记已读、加载历史、订阅消息与屏蔽变更、启动心跳、观察对方在线状态
//! - 发送时乐观追加，失败时撤回并把草稿交还给调用方
//! - 关闭（或 Drop）时释放所有订阅和后台任务，之后到达的事件和响应一律忽略

use crate::im::block::{BlockService, BlockStatus};
use crate::im::context::ChatContext;
use crate::im::conversation::ConversationManager;
use crate::im::error::{ChatError, ChatResult, SendFailure, ValidationError};
use crate::im::message::listener::{EmptyMessageListener, MessageListener};
use crate::im::message::read_state::{ReadStateTracker, ReadTrigger};
use crate::im::message::service::MessageService;
use crate::im::presence::observer::{EmptyPresenceListener, PresenceListener, PresenceObserver};
use crate::im::presence::tracker::{AppState, PresenceTracker};
use crate::im::realtime::subscription::{RealtimeSubscription, SubscriptionState};
use crate::im::realtime::timeline::{ApplyOutcome, MessageTimeline, TimelineEntry};
use crate::im::types::{Conversation, Message, RowChange, RowFilter, Table};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct RoomInner {
    ctx: ChatContext,
    conversation: Conversation,
    counterpart_id: String,
    messages: MessageService,
    blocks: BlockService,
    read_state: ReadStateTracker,
    presence: PresenceTracker,
    observer: tokio::sync::Mutex<Option<PresenceObserver>>,
    timeline: Mutex<MessageTimeline>,
    block_status: Mutex<BlockStatus>,
    message_sub: tokio::sync::Mutex<RealtimeSubscription>,
    /// 每次（重新）订阅消息加一，旧通道结束时据此判断是否已被替换
    message_generation: AtomicU64,
    block_sub: tokio::sync::Mutex<RealtimeSubscription>,
    focused: AtomicBool,
    closed: AtomicBool,
    listener: Arc<dyn MessageListener>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RoomInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn block_status(&self) -> BlockStatus {
        *lock(&self.block_status)
    }

    async fn refresh_block_status(&self) -> ChatResult<BlockStatus> {
        let status = self.blocks.status(&self.counterpart_id).await?;
        if self.is_closed() {
            return Ok(status);
        }
        let previous = std::mem::replace(&mut *lock(&self.block_status), status);
        if previous != status {
            info!(
                "[Room] 屏蔽状态变更 conv={}: {:?} -> {:?}",
                self.conversation.id, previous, status
            );
            self.listener.on_block_status_changed(status).await;
        }
        Ok(status)
    }

    async fn handle_message_change(&self, change: RowChange) {
        let outcome = lock(&self.timeline).apply(&change);
        match outcome {
            ApplyOutcome::Appended { message, inbound } => {
                debug!("[Room] 新消息 {} (inbound={})", message.id, inbound);
                self.listener.on_recv_new_message(message).await;
                // 只有前台且聚焦时才自动已读
                if inbound
                    && self.focused.load(Ordering::Acquire)
                    && self.presence.app_state().is_active()
                {
                    self.read_state.schedule(ReadTrigger::Inbound);
                }
            }
            ApplyOutcome::EchoConfirmed(message) => {
                self.listener.on_message_confirmed(message).await;
            }
            ApplyOutcome::Replaced(message) => {
                self.listener.on_message_updated(message).await;
            }
            ApplyOutcome::Removed(id) => {
                self.listener.on_message_removed(id).await;
            }
            ApplyOutcome::Ignored(reason) => {
                debug!("[Room] 忽略变更 {:?}: {:?}", change.kind, reason);
            }
        }
    }

    /// 建立消息订阅；事件先留在通道里，由调用方在加载历史后再启动消费
    async fn subscribe_messages(&self) -> ChatResult<LiveFeed> {
        let mut sub = self.message_sub.lock().await;
        let generation = self.message_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let result = sub.open().await;
        let state = sub.state();
        drop(sub);
        self.listener.on_subscription_state_changed(state).await;
        Ok(LiveFeed {
            rx: result?,
            generation,
        })
    }

    fn spawn_message_loop(self: &Arc<Self>, feed: LiveFeed) -> JoinHandle<()> {
        tokio::spawn(message_loop(self.clone(), feed.rx, feed.generation))
    }

    async fn open_block_subscription(self: &Arc<Self>) -> ChatResult<JoinHandle<()>> {
        let rx = self.block_sub.lock().await.open().await?;
        Ok(tokio::spawn(block_loop(self.clone(), rx)))
    }
}

struct LiveFeed {
    rx: mpsc::UnboundedReceiver<RowChange>,
    generation: u64,
}

async fn message_loop(
    inner: Arc<RoomInner>,
    mut rx: mpsc::UnboundedReceiver<RowChange>,
    generation: u64,
) {
    while let Some(change) = rx.recv().await {
        if inner.is_closed() {
            return;
        }
        inner.handle_message_change(change).await;
    }
    if inner.is_closed() || inner.message_generation.load(Ordering::Acquire) != generation {
        return;
    }
    // 通道断开：降级为手动刷新，等待调用方重新订阅
    inner.message_sub.lock().await.mark_failed();
    inner
        .listener
        .on_subscription_state_changed(SubscriptionState::Error)
        .await;
}

async fn block_loop(inner: Arc<RoomInner>, mut rx: mpsc::UnboundedReceiver<RowChange>) {
    while let Some(_change) = rx.recv().await {
        if inner.is_closed() {
            return;
        }
        // 任何屏蔽变更都重新查询一次，由查询决定是否与本会话相关
        if let Err(e) = inner.refresh_block_status().await {
            warn!("[Room] ⚠️ 刷新屏蔽状态失败: {}", e);
        }
    }
    if !inner.is_closed() {
        inner.block_sub.lock().await.mark_failed();
    }
}

/// 一个打开的聊天页
pub struct ChatRoom {
    inner: Arc<RoomInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatRoom {
    /// 使用默认（空）监听器打开
    pub async fn open(ctx: ChatContext, conversation_id: &str) -> ChatResult<Self> {
        Self::open_with_listeners(
            ctx,
            conversation_id,
            Arc::new(EmptyMessageListener),
            Arc::new(EmptyPresenceListener),
        )
        .await
    }

    pub async fn open_with_listeners(
        ctx: ChatContext,
        conversation_id: &str,
        listener: Arc<dyn MessageListener>,
        presence_listener: Arc<dyn PresenceListener>,
    ) -> ChatResult<Self> {
        let conversation = ConversationManager::new(ctx.clone())
            .require(conversation_id)
            .await?;
        let counterpart_id = conversation
            .counterpart_of(ctx.user_id())
            .ok_or_else(|| ValidationError::NotParticipant {
                user_id: ctx.user_id().to_string(),
                conversation_id: conversation_id.to_string(),
            })?
            .to_string();
        info!(
            "[Room] 🚪 打开聊天 conv={}, user={}, counterpart={}",
            conversation.id,
            ctx.user_id(),
            counterpart_id
        );

        let messages = MessageService::new(ctx.clone());
        let read_state = ReadStateTracker::new(
            messages.clone(),
            ctx.shared_config(),
            conversation.id.clone(),
            ctx.user_id(),
        );
        let gateway = ctx.gateway().clone();
        let inner = Arc::new(RoomInner {
            blocks: BlockService::new(ctx.clone()),
            presence: PresenceTracker::new(ctx.clone()),
            observer: tokio::sync::Mutex::new(None),
            timeline: Mutex::new(MessageTimeline::new(conversation.id.clone(), ctx.user_id())),
            block_status: Mutex::new(BlockStatus::None),
            message_sub: tokio::sync::Mutex::new(RealtimeSubscription::new(
                gateway.clone(),
                Table::Messages,
                RowFilter::eq("conversation_id", &conversation.id),
            )),
            message_generation: AtomicU64::new(0),
            block_sub: tokio::sync::Mutex::new(RealtimeSubscription::new(
                gateway,
                Table::BlockedUsers,
                RowFilter::All,
            )),
            focused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            ctx,
            conversation,
            counterpart_id,
            messages,
            read_state,
            listener,
        });
        let room = Self {
            inner: inner.clone(),
            tasks: Mutex::new(Vec::new()),
        };

        if let Err(e) = inner.read_state.mark_read().await {
            warn!("[Room] ⚠️ 打开时标记已读失败: {}", e);
        }

        // 先订阅再拉历史：拉取期间到达的变更留在通道里，历史加载后按 ID 去重合并
        let feed = match inner.subscribe_messages().await {
            Ok(feed) => Some(feed),
            Err(e) => {
                warn!("[Room] ⚠️ 消息订阅失败，仅保留手动刷新: {}", e);
                None
            }
        };
        room.refresh().await?;
        if let Some(feed) = feed {
            room.track(inner.spawn_message_loop(feed));
        }
        if let Err(e) = inner.refresh_block_status().await {
            warn!("[Room] ⚠️ 查询屏蔽状态失败: {}", e);
        }
        match inner.open_block_subscription().await {
            Ok(task) => room.track(task),
            Err(e) => warn!("[Room] ⚠️ 屏蔽订阅失败: {}", e),
        }

        inner.presence.start();
        let observer =
            PresenceObserver::observe(&inner.ctx, &inner.counterpart_id, presence_listener).await;
        *inner.observer.lock().await = Some(observer);

        Ok(room)
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub fn conversation(&self) -> &Conversation {
        &self.inner.conversation
    }

    pub fn counterpart_id(&self) -> &str {
        &self.inner.counterpart_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// 当前时间线（含待确认项）
    pub fn entries(&self) -> Vec<TimelineEntry> {
        lock(&self.inner.timeline).entries().to_vec()
    }

    /// 已确认的消息
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.inner.timeline).messages()
    }

    pub fn block_status(&self) -> BlockStatus {
        self.inner.block_status()
    }

    pub async fn subscription_state(&self) -> SubscriptionState {
        self.inner.message_sub.lock().await.state()
    }

    /// 对方是否在线
    pub async fn counterpart_online(&self) -> bool {
        self.inner
            .observer
            .lock()
            .await
            .as_ref()
            .map(|o| o.is_online())
            .unwrap_or(false)
    }

    /// 发送消息；失败时返回草稿，供界面恢复输入框
    pub async fn send(&self, content: &str) -> Result<Message, SendFailure> {
        let fail = |error: ChatError| SendFailure {
            draft: content.to_string(),
            error,
        };
        if self.is_closed() {
            return Err(fail(ValidationError::RoomClosed.into()));
        }
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(fail(ValidationError::EmptyContent.into()));
        }
        if self.inner.ctx.config().enforce_blocks {
            if let Some(err) = self.inner.block_status().to_error() {
                return Err(fail(err.into()));
            }
        }

        let correlation_id = lock(&self.inner.timeline).push_pending(trimmed);
        let result = self
            .inner
            .messages
            .send(&self.inner.conversation.id, self.inner.ctx.user_id(), trimmed)
            .await;

        match result {
            Ok(message) => {
                if self.is_closed() {
                    return Ok(message);
                }
                let outcome = lock(&self.inner.timeline).confirm(correlation_id, message.clone());
                debug!("[Room] 发送确认 {}: {:?}", message.id, outcome);
                // 回显先到时已经通知过
                match outcome {
                    ApplyOutcome::EchoConfirmed(confirmed)
                    | ApplyOutcome::Appended {
                        message: confirmed, ..
                    } => {
                        self.inner.listener.on_message_confirmed(confirmed).await;
                    }
                    _ => {}
                }
                Ok(message)
            }
            Err(error) => {
                lock(&self.inner.timeline).discard_pending(correlation_id);
                warn!("[Room] ❌ 发送失败，草稿已退回: {}", error);
                Err(fail(error))
            }
        }
    }

    /// 重新加载历史（刷新即聚焦时的兜底）
    pub async fn refresh(&self) -> ChatResult<Vec<Message>> {
        let history = self
            .inner
            .messages
            .fetch_history(&self.inner.conversation.id)
            .await?;
        if self.is_closed() {
            return Ok(history);
        }
        lock(&self.inner.timeline).load_history(history.clone());
        self.inner
            .listener
            .on_history_loaded(history.clone())
            .await;
        Ok(history)
    }

    /// 聊天页获得焦点：补拉一次历史，再调度标记已读
    pub async fn focus(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.focused.store(true, Ordering::Release);
        if let Err(e) = self.refresh().await {
            warn!("[Room] ⚠️ 聚焦时刷新失败: {}", e);
        }
        if self.is_closed() {
            return;
        }
        self.inner.read_state.schedule(ReadTrigger::Focus);
    }

    /// 聊天页失去焦点
    pub fn blur(&self) {
        self.inner.focused.store(false, Ordering::Release);
        self.inner.read_state.cancel();
    }

    pub async fn set_app_state(&self, state: AppState) {
        if self.is_closed() {
            return;
        }
        self.inner.presence.set_app_state(state).await;
        match state {
            AppState::Active if self.inner.focused.load(Ordering::Acquire) => {
                self.inner.read_state.schedule(ReadTrigger::Foreground);
            }
            AppState::Active => {}
            AppState::Background => self.inner.read_state.cancel(),
        }
    }

    /// 立即标记已读
    pub async fn mark_read(&self) -> ChatResult<u64> {
        self.inner.read_state.mark_read().await
    }

    /// 消息订阅失效后重新订阅，并补拉一次历史
    pub async fn resubscribe(&self) -> ChatResult<()> {
        if self.is_closed() {
            return Err(ValidationError::RoomClosed.into());
        }
        let feed = self.inner.subscribe_messages().await?;
        let refreshed = self.refresh().await;
        self.track(self.inner.spawn_message_loop(feed));
        refreshed.map(|_| ())
    }

    /// 清空会话消息
    pub async fn clear_messages(&self) -> ChatResult<u64> {
        let removed = self
            .inner
            .messages
            .clear(&self.inner.conversation.id, self.inner.ctx.user_id())
            .await?;
        lock(&self.inner.timeline).clear();
        Ok(removed)
    }

    /// 删除会话并关闭聊天页
    pub async fn delete_conversation(&self) -> ChatResult<()> {
        ConversationManager::new(self.inner.ctx.clone())
            .delete(&self.inner.conversation.id, self.inner.ctx.user_id())
            .await?;
        self.close().await;
        Ok(())
    }

    pub async fn block_counterpart(&self) -> ChatResult<BlockStatus> {
        self.inner.blocks.block(&self.inner.counterpart_id).await?;
        self.inner.refresh_block_status().await
    }

    pub async fn unblock_counterpart(&self) -> ChatResult<BlockStatus> {
        self.inner.blocks.unblock(&self.inner.counterpart_id).await?;
        self.inner.refresh_block_status().await
    }

    /// 关闭聊天页：停止任务、释放订阅、写入离线；重复调用无副作用
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.inner.read_state.cancel();
        self.inner.message_sub.lock().await.release().await;
        self.inner.block_sub.lock().await.release().await;
        if let Some(mut observer) = self.inner.observer.lock().await.take() {
            observer.stop().await;
        }
        self.inner.presence.stop().await;
        info!("[Room] 👋 聊天页已关闭 conv={}", self.inner.conversation.id);
    }
}

impl Drop for ChatRoom {
    fn drop(&mut self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.inner.read_state.cancel();
        // 先停心跳，避免迟到的在线写入覆盖下面的离线
        self.inner.presence.abort();
        // 订阅句柄随 RoomInner 释放时在后台取消；这里补写一次离线
        let gateway = self.inner.ctx.gateway().clone();
        let user_id = self.inner.ctx.user_id().to_string();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = gateway
                    .upsert_presence(&user_id, false, chrono::Utc::now())
                    .await
                {
                    warn!("[Room] Drop 时写入离线失败: {}", e);
                }
            });
        }
    }
}
