//! 会话监听器回调接口

use crate::im::conversation::models::InboxItem;
use crate::im::types::Conversation;
use async_trait::async_trait;

/// 会话监听器回调接口
#[async_trait]
pub trait ConversationListener: Send + Sync {
    /// 会话列表变更（已按最新消息时间倒序，附带未读数）
    async fn on_conversation_list_changed(&self, items: Vec<InboxItem>);

    /// 总未读消息数变更
    async fn on_total_unread_changed(&self, total_unread_count: u64);

    /// 新会话
    async fn on_new_conversation(&self, conversation: Conversation);
}

/// 空实现（默认监听器）
pub struct EmptyConversationListener;

#[async_trait]
impl ConversationListener for EmptyConversationListener {
    async fn on_conversation_list_changed(&self, _items: Vec<InboxItem>) {}
    async fn on_total_unread_changed(&self, _total_unread_count: u64) {}
    async fn on_new_conversation(&self, _conversation: Conversation) {}
}
