//! 聊天页消息监听器

use crate::im::block::BlockStatus;
use crate::im::realtime::SubscriptionState;
use crate::im::types::Message;
use async_trait::async_trait;

/// 聊天页回调接口，由 [`ChatRoom`](crate::im::room::ChatRoom) 触发
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// 历史消息加载完成（按创建时间升序）
    async fn on_history_loaded(&self, messages: Vec<Message>);

    /// 收到新消息（对方发送，或自己在其他设备上发送）
    async fn on_recv_new_message(&self, message: Message);

    /// 自己发送的消息已被服务端确认
    async fn on_message_confirmed(&self, message: Message);

    /// 消息已读/送达状态变更
    async fn on_message_updated(&self, message: Message);

    /// 消息被删除
    async fn on_message_removed(&self, message_id: String);

    /// 屏蔽状态变更
    async fn on_block_status_changed(&self, status: BlockStatus);

    /// 实时订阅状态变更
    async fn on_subscription_state_changed(&self, state: SubscriptionState);
}

/// 空实现（默认监听器）
pub struct EmptyMessageListener;

#[async_trait]
impl MessageListener for EmptyMessageListener {
    async fn on_history_loaded(&self, _messages: Vec<Message>) {}
    async fn on_recv_new_message(&self, _message: Message) {}
    async fn on_message_confirmed(&self, _message: Message) {}
    async fn on_message_updated(&self, _message: Message) {}
    async fn on_message_removed(&self, _message_id: String) {}
    async fn on_block_status_changed(&self, _status: BlockStatus) {}
    async fn on_subscription_state_changed(&self, _state: SubscriptionState) {}
}
