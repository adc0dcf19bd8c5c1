//! 消息存储适配层
//!
//! 接收方永远由会话的买家/卖家字段推导，调用方无法指定；这一步查询不可省略。

use crate::im::context::ChatContext;
use crate::im::error::{ChatError, ChatResult, ValidationError};
use crate::im::gateway::NewMessage;
use crate::im::types::{Conversation, Message};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct MessageService {
    ctx: ChatContext,
}

impl MessageService {
    pub fn new(ctx: ChatContext) -> Self {
        Self { ctx }
    }

    /// 发送消息
    ///
    /// 内容为空、发送者不是当前用户时在任何网络调用之前拒绝。
    /// 写入失败直接返回，不做自动重试（避免重复发送）。
    pub async fn send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> ChatResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        if sender_id != self.ctx.user_id() {
            return Err(ValidationError::SenderMismatch {
                current: self.ctx.user_id().to_string(),
                claimed: sender_id.to_string(),
            }
            .into());
        }

        let conversation = self.load_conversation(conversation_id).await?;
        let receiver_id = conversation
            .counterpart_of(sender_id)
            .ok_or_else(|| ValidationError::NotParticipant {
                user_id: sender_id.to_string(),
                conversation_id: conversation_id.to_string(),
            })?
            .to_string();

        let config = self.ctx.config();
        let new_message = NewMessage::new(
            conversation_id,
            sender_id,
            receiver_id,
            content,
            config.delivered_on_insert,
        );
        let message = self
            .ctx
            .gateway()
            .insert_message(&new_message)
            .await
            .map_err(|e| {
                error!("[MsgStore] ❌ 消息写入失败 conv={}: {}", conversation_id, e);
                ChatError::Creation(e)
            })?;
        info!(
            "[MsgStore] ✉️ 消息已发送 {} ({} -> {})",
            message.id, message.sender_id, message.receiver_id
        );

        if config.refresh_last_message {
            if let Err(e) = self
                .ctx
                .gateway()
                .touch_conversation(conversation_id, &message.content, message.created_at)
                .await
            {
                warn!("[MsgStore] ⚠️ 刷新会话最新消息失败 conv={}: {}", conversation_id, e);
            }
        }
        Ok(message)
    }

    /// 会话的全部历史消息，按创建时间升序
    pub async fn fetch_history(&self, conversation_id: &str) -> ChatResult<Vec<Message>> {
        let mut messages = self
            .ctx
            .gateway()
            .list_messages(conversation_id)
            .await
            .map_err(ChatError::Lookup)?;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        debug!(
            "[MsgStore] 会话 {} 历史消息 {} 条",
            conversation_id,
            messages.len()
        );
        Ok(messages)
    }

    /// 将会话中对方发来的未读消息批量标记为已读，返回影响条数
    pub async fn mark_read(&self, conversation_id: &str, viewer_id: &str) -> ChatResult<u64> {
        let updated = self
            .ctx
            .gateway()
            .update_messages_read_flag(conversation_id, viewer_id)
            .await
            .map_err(ChatError::Update)?;
        if updated > 0 {
            info!("[MsgStore] 👀 会话 {} 标记已读 {} 条", conversation_id, updated);
        }
        Ok(updated)
    }

    pub async fn unread_count(&self, conversation_id: &str, user_id: &str) -> ChatResult<u64> {
        self.ctx
            .gateway()
            .count_unread(conversation_id, user_id)
            .await
            .map_err(ChatError::Lookup)
    }

    /// 用户所有会话的未读总数
    pub async fn total_unread_count(&self, user_id: &str) -> ChatResult<u64> {
        let gateway = self.ctx.gateway();
        let conversations = gateway
            .list_conversations(user_id)
            .await
            .map_err(ChatError::Lookup)?;
        let mut total = 0;
        for conversation in &conversations {
            total += gateway
                .count_unread(&conversation.id, user_id)
                .await
                .map_err(ChatError::Lookup)?;
        }
        Ok(total)
    }

    /// 清空会话消息，只有参与者可以清空
    pub async fn clear(&self, conversation_id: &str, requester_id: &str) -> ChatResult<u64> {
        let conversation = self.load_conversation(conversation_id).await?;
        if !conversation.is_participant(requester_id) {
            return Err(ValidationError::NotParticipant {
                user_id: requester_id.to_string(),
                conversation_id: conversation_id.to_string(),
            }
            .into());
        }
        let removed = self
            .ctx
            .gateway()
            .delete_messages(conversation_id)
            .await
            .map_err(ChatError::Update)?;
        info!("[MsgStore] 🧹 会话 {} 已清空 {} 条消息", conversation_id, removed);
        Ok(removed)
    }

    async fn load_conversation(&self, conversation_id: &str) -> ChatResult<Conversation> {
        self.ctx
            .gateway()
            .fetch_conversation(conversation_id)
            .await
            .map_err(ChatError::Lookup)?
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))
    }
}
