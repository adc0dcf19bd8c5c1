//! 屏蔽关系
//!
//! 任一方屏蔽对方后，双方都不能再在该会话中发送消息。

use crate::im::context::ChatContext;
use crate::im::error::{ChatError, ChatResult, ValidationError};
use crate::im::types::BlockRecord;
use tracing::info;

/// 当前用户与对方之间的屏蔽状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockStatus {
    None,
    /// 自己屏蔽了对方
    BlockedBySelf,
    /// 对方屏蔽了自己
    BlockedByOther,
}

impl BlockStatus {
    pub fn is_blocked(&self) -> bool {
        !matches!(self, BlockStatus::None)
    }

    /// 从屏蔽记录推导状态，自己发起的屏蔽优先
    pub fn from_records(records: &[BlockRecord], viewer_id: &str) -> Self {
        if records.iter().any(|r| r.blocker_id == viewer_id) {
            BlockStatus::BlockedBySelf
        } else if records.is_empty() {
            BlockStatus::None
        } else {
            BlockStatus::BlockedByOther
        }
    }

    /// 被屏蔽时发送应返回的校验错误
    pub fn to_error(&self) -> Option<ValidationError> {
        match self {
            BlockStatus::None => None,
            BlockStatus::BlockedBySelf => Some(ValidationError::Blocked { by_self: true }),
            BlockStatus::BlockedByOther => Some(ValidationError::Blocked { by_self: false }),
        }
    }
}

#[derive(Clone)]
pub struct BlockService {
    ctx: ChatContext,
}

impl BlockService {
    pub fn new(ctx: ChatContext) -> Self {
        Self { ctx }
    }

    pub async fn status(&self, other_id: &str) -> ChatResult<BlockStatus> {
        let records = self
            .ctx
            .gateway()
            .find_block(self.ctx.user_id(), other_id)
            .await
            .map_err(ChatError::Lookup)?;
        Ok(BlockStatus::from_records(&records, self.ctx.user_id()))
    }

    /// 屏蔽对方（已屏蔽时不重复写入）
    pub async fn block(&self, other_id: &str) -> ChatResult<BlockRecord> {
        if other_id == self.ctx.user_id() {
            return Err(ValidationError::SameParticipants(other_id.to_string()).into());
        }
        let record = self
            .ctx
            .gateway()
            .upsert_block(self.ctx.user_id(), other_id)
            .await
            .map_err(ChatError::Update)?;
        info!("[Block] 🚫 {} 屏蔽了 {}", self.ctx.user_id(), other_id);
        Ok(record)
    }

    /// 解除双方之间的全部屏蔽关系
    pub async fn unblock(&self, other_id: &str) -> ChatResult<u64> {
        let removed = self
            .ctx
            .gateway()
            .delete_block(self.ctx.user_id(), other_id)
            .await
            .map_err(ChatError::Update)?;
        info!(
            "[Block] ✅ {} 与 {} 之间解除屏蔽 {} 条",
            self.ctx.user_id(),
            other_id,
            removed
        );
        Ok(removed)
    }
}
