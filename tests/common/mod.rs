//! 集成测试公共夹具：内存 SQLite 网关 + 故障注入 / 调用计数包装

#![allow(dead_code)]

use async_trait::async_trait;
use carchat_sdk_core::im::block::BlockStatus;
use carchat_sdk_core::im::config::ChatConfig;
use carchat_sdk_core::im::context::ChatContext;
use carchat_sdk_core::im::error::{GatewayError, GatewayResult};
use carchat_sdk_core::im::gateway::sqlite::SqliteGatewayOptions;
use carchat_sdk_core::im::gateway::{
    ChangeSink, NewMessage, RemoteGateway, SqliteGateway, SubscriptionHandle,
};
use carchat_sdk_core::im::conversation::{ConversationListener, InboxItem};
use carchat_sdk_core::im::message::{MessageListener, MessageService};
use carchat_sdk_core::im::realtime::SubscriptionState;
use carchat_sdk_core::im::types::{
    BlockRecord, Conversation, ListingSummary, Message, Presence, ProfileSummary, RowFilter, Table,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::Barrier;

pub const BUYER: &str = "buyer-1";
pub const SELLER: &str = "seller-1";
pub const OTHER: &str = "other-1";
pub const LISTING: &str = "car-1";

static INIT_LOGGER: Once = Once::new();

pub fn init_test_logger() {
    INIT_LOGGER.call_once(|| {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        let filter_layer = EnvFilter::new("info,carchat_sdk_core=debug,sqlx=warn");

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .with_test_writer();

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}

/// 故障开关
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Find,
    Create,
    Insert,
    ListMessages,
    MarkRead,
    Subscribe,
    Presence,
}

/// 在某次读取返回之前由另一方写入的消息
struct LateMessage {
    sender: ChatContext,
    conversation_id: String,
    content: String,
}

/// 包装真实网关：记录每个方法的调用次数，并按开关注入失败
pub struct FaultyGateway {
    inner: Arc<SqliteGateway>,
    calls: Mutex<HashMap<&'static str, usize>>,
    faults: Mutex<HashMap<Fault, bool>>,
    find_barrier: Option<Arc<Barrier>>,
    find_calls: AtomicUsize,
    barrier_parties: usize,
    late_messages: Mutex<HashMap<&'static str, LateMessage>>,
}

impl FaultyGateway {
    pub fn new(inner: Arc<SqliteGateway>) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            find_barrier: None,
            find_calls: AtomicUsize::new(0),
            barrier_parties: 0,
            late_messages: Mutex::new(HashMap::new()),
        }
    }

    /// 前 `parties` 次查找在返回前互相等待，用于复现"先查后建"竞态
    pub fn with_find_barrier(mut self, parties: usize) -> Self {
        self.find_barrier = Some(Arc::new(Barrier::new(parties)));
        self.barrier_parties = parties;
        self
    }

    pub fn inner(&self) -> &Arc<SqliteGateway> {
        &self.inner
    }

    pub fn set_fault(&self, fault: Fault, enabled: bool) {
        self.faults.lock().unwrap().insert(fault, enabled);
    }

    fn faulty(&self, fault: Fault) -> bool {
        self.faults
            .lock()
            .unwrap()
            .get(&fault)
            .copied()
            .unwrap_or(false)
    }

    fn record(&self, name: &'static str) {
        *self.calls.lock().unwrap().entry(name).or_insert(0) += 1;
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// `method` 下一次读到结果后、返回之前，以 `sender` 身份发送一条消息
    ///
    /// 模拟"读取之后、订阅生效之前"到达的消息。
    pub fn send_after_next(
        &self,
        method: &'static str,
        sender: ChatContext,
        conversation_id: &str,
        content: &str,
    ) {
        self.late_messages.lock().unwrap().insert(
            method,
            LateMessage {
                sender,
                conversation_id: conversation_id.to_string(),
                content: content.to_string(),
            },
        );
    }

    async fn deliver_late_message(&self, method: &'static str) {
        let late = self.late_messages.lock().unwrap().remove(method);
        if let Some(late) = late {
            MessageService::new(late.sender.clone())
                .send(&late.conversation_id, late.sender.user_id(), &late.content)
                .await
                .unwrap();
        }
    }

    fn injected(name: &str) -> GatewayError {
        GatewayError::Transport(format!("注入故障: {}", name))
    }
}

#[async_trait]
impl RemoteGateway for FaultyGateway {
    async fn find_conversation(
        &self,
        listing_id: Option<&str>,
        buyer_id: &str,
        seller_id: &str,
    ) -> GatewayResult<Option<Conversation>> {
        self.record("find_conversation");
        if self.faulty(Fault::Find) {
            return Err(Self::injected("find_conversation"));
        }
        let result = self
            .inner
            .find_conversation(listing_id, buyer_id, seller_id)
            .await;
        if let Some(barrier) = &self.find_barrier {
            if self.find_calls.fetch_add(1, Ordering::SeqCst) < self.barrier_parties {
                barrier.wait().await;
            }
        }
        result
    }

    async fn create_conversation(
        &self,
        listing_id: Option<&str>,
        buyer_id: &str,
        seller_id: &str,
    ) -> GatewayResult<Conversation> {
        self.record("create_conversation");
        if self.faulty(Fault::Create) {
            return Err(Self::injected("create_conversation"));
        }
        self.inner
            .create_conversation(listing_id, buyer_id, seller_id)
            .await
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> GatewayResult<Option<Conversation>> {
        self.record("fetch_conversation");
        if self.faulty(Fault::Find) {
            return Err(Self::injected("fetch_conversation"));
        }
        self.inner.fetch_conversation(conversation_id).await
    }

    async fn list_conversations(&self, user_id: &str) -> GatewayResult<Vec<Conversation>> {
        self.record("list_conversations");
        let result = self.inner.list_conversations(user_id).await;
        self.deliver_late_message("list_conversations").await;
        result
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        self.record("touch_conversation");
        self.inner
            .touch_conversation(conversation_id, last_message, at)
            .await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> GatewayResult<()> {
        self.record("delete_conversation");
        self.inner.delete_conversation(conversation_id).await
    }

    async fn insert_message(&self, message: &NewMessage) -> GatewayResult<Message> {
        self.record("insert_message");
        if self.faulty(Fault::Insert) {
            return Err(Self::injected("insert_message"));
        }
        self.inner.insert_message(message).await
    }

    async fn list_messages(&self, conversation_id: &str) -> GatewayResult<Vec<Message>> {
        self.record("list_messages");
        if self.faulty(Fault::ListMessages) {
            return Err(Self::injected("list_messages"));
        }
        let result = self.inner.list_messages(conversation_id).await;
        self.deliver_late_message("list_messages").await;
        result
    }

    async fn update_messages_read_flag(
        &self,
        conversation_id: &str,
        exclude_sender_id: &str,
    ) -> GatewayResult<u64> {
        self.record("update_messages_read_flag");
        if self.faulty(Fault::MarkRead) {
            return Err(Self::injected("update_messages_read_flag"));
        }
        self.inner
            .update_messages_read_flag(conversation_id, exclude_sender_id)
            .await
    }

    async fn count_unread(&self, conversation_id: &str, user_id: &str) -> GatewayResult<u64> {
        self.record("count_unread");
        self.inner.count_unread(conversation_id, user_id).await
    }

    async fn delete_messages(&self, conversation_id: &str) -> GatewayResult<u64> {
        self.record("delete_messages");
        self.inner.delete_messages(conversation_id).await
    }

    async fn subscribe_row_changes(
        &self,
        table: Table,
        filter: RowFilter,
        sink: ChangeSink,
    ) -> GatewayResult<SubscriptionHandle> {
        self.record("subscribe_row_changes");
        if self.faulty(Fault::Subscribe) {
            return Err(GatewayError::Realtime("注入故障: subscribe".to_string()));
        }
        self.inner.subscribe_row_changes(table, filter, sink).await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GatewayResult<()> {
        self.record("unsubscribe");
        self.inner.unsubscribe(handle).await
    }

    async fn upsert_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> GatewayResult<()> {
        self.record("upsert_presence");
        if self.faulty(Fault::Presence) {
            return Err(Self::injected("upsert_presence"));
        }
        self.inner.upsert_presence(user_id, is_online, last_seen).await
    }

    async fn fetch_presence(&self, user_id: &str) -> GatewayResult<Option<Presence>> {
        self.record("fetch_presence");
        if self.faulty(Fault::Presence) {
            return Err(Self::injected("fetch_presence"));
        }
        self.inner.fetch_presence(user_id).await
    }

    async fn find_block(&self, user_a: &str, user_b: &str) -> GatewayResult<Vec<BlockRecord>> {
        self.record("find_block");
        self.inner.find_block(user_a, user_b).await
    }

    async fn upsert_block(&self, blocker_id: &str, blocked_id: &str) -> GatewayResult<BlockRecord> {
        self.record("upsert_block");
        self.inner.upsert_block(blocker_id, blocked_id).await
    }

    async fn delete_block(&self, user_a: &str, user_b: &str) -> GatewayResult<u64> {
        self.record("delete_block");
        self.inner.delete_block(user_a, user_b).await
    }
}

/// 测试用配置：缩短各类延迟
pub fn test_config() -> ChatConfig {
    ChatConfig {
        presence_interval: Duration::from_millis(50),
        mark_read_focus_delay: Duration::from_millis(30),
        mark_read_foreground_delay: Duration::from_millis(20),
        mark_read_inbound_delay: Duration::from_millis(10),
        ..ChatConfig::default()
    }
}

pub struct Fixture {
    pub sqlite: Arc<SqliteGateway>,
    pub gateway: Arc<FaultyGateway>,
    pub config: Arc<ChatConfig>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::build(SqliteGatewayOptions::default(), None).await
    }

    pub async fn with_options(options: SqliteGatewayOptions, find_barrier: Option<usize>) -> Self {
        Self::build(options, find_barrier).await
    }

    async fn build(options: SqliteGatewayOptions, find_barrier: Option<usize>) -> Self {
        init_test_logger();
        let sqlite = Arc::new(SqliteGateway::in_memory_with(options).await.unwrap());
        seed(&sqlite).await;
        let mut gateway = FaultyGateway::new(sqlite.clone());
        if let Some(parties) = find_barrier {
            gateway = gateway.with_find_barrier(parties);
        }
        Self {
            sqlite,
            gateway: Arc::new(gateway),
            config: Arc::new(test_config()),
        }
    }

    pub fn ctx(&self, user_id: &str) -> ChatContext {
        ChatContext::new(user_id, self.gateway.clone(), self.config.clone())
    }
}

async fn seed(gateway: &SqliteGateway) {
    for (id, name) in [(BUYER, "Budi"), (SELLER, "Sari"), (OTHER, "Oki")] {
        gateway
            .upsert_profile(&ProfileSummary {
                id: id.to_string(),
                full_name: Some(name.to_string()),
                avatar_url: None,
            })
            .await
            .unwrap();
    }
    gateway
        .upsert_listing(&ListingSummary {
            id: LISTING.to_string(),
            user_id: SELLER.to_string(),
            brand: "Toyota".to_string(),
            model: "Avanza".to_string(),
            year: 2019,
            price: 165_000_000,
            images: vec!["https://img.example/avanza.jpg".to_string()],
            is_sold: false,
        })
        .await
        .unwrap();
}

/// 轮询直到条件成立或超时
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// 记录消息回调的监听器
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    History(usize),
    New(Message),
    Confirmed(Message),
    Updated(Message),
    Removed(String),
    Block(BlockStatus),
    Subscription(SubscriptionState),
}

#[derive(Default)]
pub struct RecordingMessageListener {
    events: Mutex<Vec<RoomEvent>>,
}

impl RecordingMessageListener {
    pub fn events(&self) -> Vec<RoomEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn new_messages(&self) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RoomEvent::New(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RoomEvent::Updated(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: RoomEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl MessageListener for RecordingMessageListener {
    async fn on_history_loaded(&self, messages: Vec<Message>) {
        self.push(RoomEvent::History(messages.len()));
    }

    async fn on_recv_new_message(&self, message: Message) {
        self.push(RoomEvent::New(message));
    }

    async fn on_message_confirmed(&self, message: Message) {
        self.push(RoomEvent::Confirmed(message));
    }

    async fn on_message_updated(&self, message: Message) {
        self.push(RoomEvent::Updated(message));
    }

    async fn on_message_removed(&self, message_id: String) {
        self.push(RoomEvent::Removed(message_id));
    }

    async fn on_block_status_changed(&self, status: BlockStatus) {
        self.push(RoomEvent::Block(status));
    }

    async fn on_subscription_state_changed(&self, state: SubscriptionState) {
        self.push(RoomEvent::Subscription(state));
    }
}

/// 记录会话回调的监听器
#[derive(Default)]
pub struct RecordingConversationListener {
    pub lists: Mutex<Vec<Vec<InboxItem>>>,
    pub totals: Mutex<Vec<u64>>,
    pub created: Mutex<Vec<Conversation>>,
}

impl RecordingConversationListener {
    pub fn last_total(&self) -> Option<u64> {
        self.totals.lock().unwrap().last().copied()
    }

    pub fn last_list(&self) -> Option<Vec<InboxItem>> {
        self.lists.lock().unwrap().last().cloned()
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.id.clone())
            .collect()
    }
}

#[async_trait]
impl ConversationListener for RecordingConversationListener {
    async fn on_conversation_list_changed(&self, items: Vec<InboxItem>) {
        self.lists.lock().unwrap().push(items);
    }

    async fn on_total_unread_changed(&self, total: u64) {
        self.totals.lock().unwrap().push(total);
    }

    async fn on_new_conversation(&self, conversation: Conversation) {
        self.created.lock().unwrap().push(conversation);
    }
}
