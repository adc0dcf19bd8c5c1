//! 远端数据网关
//!
//! 聊天核心只通过 [`RemoteGateway`] 访问托管数据平台：行级增删改查、过滤查询，
//! 以及通过长连接推送的行变更订阅。

pub mod realtime;
pub mod rest;
pub mod sqlite;

pub use realtime::RealtimeClient;
pub use rest::RestGateway;
pub use sqlite::SqliteGateway;

use crate::im::error::GatewayResult;
use crate::im::types::{BlockRecord, Conversation, Message, Presence, RowChange, RowFilter, Table};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// 待写入的消息
///
/// 只能在 crate 内构造：接收方由消息存储根据会话角色推导，调用方无法指定。
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub is_delivered: bool,
}

impl NewMessage {
    pub(crate) fn new(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
        is_delivered: bool,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            content: content.into(),
            is_delivered,
        }
    }
}

/// 订阅句柄，用于取消订阅
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: String,
    pub topic: String,
}

impl SubscriptionHandle {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
        }
    }
}

/// 变更事件投递端；订阅方持有对应的接收端，接收端关闭即表示通道失效
pub type ChangeSink = mpsc::UnboundedSender<RowChange>;

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    // ========== 会话 ==========

    /// 按 (车源, 买家, 卖家) 精确查找；`listing_id = None` 匹配 NULL
    async fn find_conversation(
        &self,
        listing_id: Option<&str>,
        buyer_id: &str,
        seller_id: &str,
    ) -> GatewayResult<Option<Conversation>>;

    /// 新建会话（最新消息为空，时间为当前时间），返回带关联摘要的行
    async fn create_conversation(
        &self,
        listing_id: Option<&str>,
        buyer_id: &str,
        seller_id: &str,
    ) -> GatewayResult<Conversation>;

    async fn fetch_conversation(&self, conversation_id: &str) -> GatewayResult<Option<Conversation>>;

    /// 用户参与的全部会话，按最新消息时间倒序
    async fn list_conversations(&self, user_id: &str) -> GatewayResult<Vec<Conversation>>;

    /// 刷新最新消息快照
    async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> GatewayResult<()>;

    /// 删除会话（级联删除消息）
    async fn delete_conversation(&self, conversation_id: &str) -> GatewayResult<()>;

    // ========== 消息 ==========

    async fn insert_message(&self, message: &NewMessage) -> GatewayResult<Message>;

    /// 会话全部消息，按创建时间升序
    async fn list_messages(&self, conversation_id: &str) -> GatewayResult<Vec<Message>>;

    /// 将会话中非 `exclude_sender_id` 发送且未读的消息批量置为已读 + 已送达，返回影响行数
    async fn update_messages_read_flag(
        &self,
        conversation_id: &str,
        exclude_sender_id: &str,
    ) -> GatewayResult<u64>;

    /// `user_id` 在会话中的未读数
    async fn count_unread(&self, conversation_id: &str, user_id: &str) -> GatewayResult<u64>;

    /// 清空会话消息，返回删除行数
    async fn delete_messages(&self, conversation_id: &str) -> GatewayResult<u64>;

    // ========== 订阅 ==========

    async fn subscribe_row_changes(
        &self,
        table: Table,
        filter: RowFilter,
        sink: ChangeSink,
    ) -> GatewayResult<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GatewayResult<()>;

    // ========== 在线状态 ==========

    async fn upsert_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> GatewayResult<()>;

    async fn fetch_presence(&self, user_id: &str) -> GatewayResult<Option<Presence>>;

    // ========== 屏蔽 ==========

    /// 任一方向的屏蔽关系
    async fn find_block(&self, user_a: &str, user_b: &str) -> GatewayResult<Vec<BlockRecord>>;

    async fn upsert_block(&self, blocker_id: &str, blocked_id: &str) -> GatewayResult<BlockRecord>;

    /// 删除两个方向的屏蔽关系，返回删除行数
    async fn delete_block(&self, user_a: &str, user_b: &str) -> GatewayResult<u64>;
}
