//! 会话管理服务层
//!
//! 查找必须先于创建，创建只是查找未命中时的兜底。查找失败绝不能当作"未找到"去创建，
//! 否则会破坏"同一三元组至多一个会话"的约束。

use crate::im::context::ChatContext;
use crate::im::conversation::models::{ConversationEntry, InboxItem};
use crate::im::error::{ChatError, ChatResult, GatewayError, ValidationError};
use crate::im::types::Conversation;
use tracing::{debug, error, info, warn};

/// 会话管理器
#[derive(Clone)]
pub struct ConversationManager {
    ctx: ChatContext,
}

impl ConversationManager {
    pub fn new(ctx: ChatContext) -> Self {
        Self { ctx }
    }

    /// 获取或创建 (车源, 买家, 卖家) 对应的会话
    ///
    /// 三元组是有序的：(买家, 卖家) 与 (卖家, 买家) 是两个不同的会话。
    /// 存储层有唯一约束时，创建冲突说明对方刚刚建好了会话，重新查找并返回该行。
    pub async fn get_or_create(
        &self,
        listing_id: Option<&str>,
        buyer_id: &str,
        seller_id: &str,
    ) -> ChatResult<Conversation> {
        let buyer_id = buyer_id.trim();
        let seller_id = seller_id.trim();
        if buyer_id.is_empty() {
            return Err(ValidationError::EmptyIdentity("buyer_id").into());
        }
        if seller_id.is_empty() {
            return Err(ValidationError::EmptyIdentity("seller_id").into());
        }
        if buyer_id == seller_id {
            return Err(ValidationError::SameParticipants(buyer_id.to_string()).into());
        }
        let listing_id = listing_id.map(str::trim).filter(|id| !id.is_empty());

        let gateway = self.ctx.gateway();
        match gateway
            .find_conversation(listing_id, buyer_id, seller_id)
            .await
        {
            Ok(Some(existing)) => {
                debug!("[ConvMgr] 命中已有会话 {}", existing.id);
                return Ok(existing);
            }
            Ok(None) => {}
            Err(e) => {
                error!("[ConvMgr] ❌ 查找会话失败: {}", e);
                return Err(ChatError::Lookup(e));
            }
        }

        info!(
            "[ConvMgr] 🆕 创建会话 listing={:?}, buyer={}, seller={}",
            listing_id, buyer_id, seller_id
        );
        match gateway
            .create_conversation(listing_id, buyer_id, seller_id)
            .await
        {
            Ok(created) => {
                info!("[ConvMgr] ✅ 会话已创建 {}", created.id);
                Ok(created)
            }
            Err(GatewayError::Conflict(detail)) => {
                warn!("[ConvMgr] 创建会话冲突（{}），重新查找", detail);
                match gateway
                    .find_conversation(listing_id, buyer_id, seller_id)
                    .await
                {
                    Ok(Some(winner)) => Ok(winner),
                    Ok(None) => Err(ChatError::Lookup(GatewayError::NotFound(
                        "冲突后未找到会话".to_string(),
                    ))),
                    Err(e) => Err(ChatError::Lookup(e)),
                }
            }
            Err(e) => {
                error!("[ConvMgr] ❌ 创建会话失败: {}", e);
                Err(ChatError::Creation(e))
            }
        }
    }

    /// 用户参与的全部会话，最近活跃在前
    pub async fn list_for_user(&self, user_id: &str) -> ChatResult<Vec<ConversationEntry>> {
        let conversations = self
            .ctx
            .gateway()
            .list_conversations(user_id)
            .await
            .map_err(ChatError::Lookup)?;

        let mut entries: Vec<ConversationEntry> = conversations
            .into_iter()
            .filter_map(|c| ConversationEntry::for_viewer(c, user_id))
            .collect();
        // 稳定排序，不依赖网关的返回顺序
        entries.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
        });
        debug!("[ConvMgr] 用户 {} 共 {} 个会话", user_id, entries.len());
        Ok(entries)
    }

    /// 会话列表 + 每个会话的未读数
    pub async fn inbox(&self, user_id: &str) -> ChatResult<Vec<InboxItem>> {
        let entries = self.list_for_user(user_id).await?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            let unread_count = self
                .ctx
                .gateway()
                .count_unread(entry.id(), user_id)
                .await
                .map_err(ChatError::Lookup)?;
            items.push(InboxItem {
                entry,
                unread_count,
            });
        }
        Ok(items)
    }

    pub async fn find(&self, conversation_id: &str) -> ChatResult<Option<Conversation>> {
        self.ctx
            .gateway()
            .fetch_conversation(conversation_id)
            .await
            .map_err(ChatError::Lookup)
    }

    /// 查找会话，不存在时报错
    pub async fn require(&self, conversation_id: &str) -> ChatResult<Conversation> {
        self.find(conversation_id)
            .await?
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))
    }

    /// 删除会话（级联删除消息），只有参与者可以删除
    pub async fn delete(&self, conversation_id: &str, requester_id: &str) -> ChatResult<()> {
        let conversation = self.require(conversation_id).await?;
        if !conversation.is_participant(requester_id) {
            return Err(ValidationError::NotParticipant {
                user_id: requester_id.to_string(),
                conversation_id: conversation_id.to_string(),
            }
            .into());
        }
        self.ctx
            .gateway()
            .delete_conversation(conversation_id)
            .await
            .map_err(ChatError::Update)?;
        info!("[ConvMgr] 🗑️ 会话 {} 已删除", conversation_id);
        Ok(())
    }
}
