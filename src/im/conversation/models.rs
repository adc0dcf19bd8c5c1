//! 会话列表展示模型

use crate::im::format::{format_list_time, truncate_preview};
use crate::im::message::content::MessageContent;
use crate::im::types::{Conversation, ListingSummary, ProfileSummary};
use chrono::{DateTime, FixedOffset, Utc};

/// 会话列表中的一项：会话本身 + 对方资料 + 车源摘要
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub conversation: Conversation,
    pub counterpart_id: String,
    pub counterpart: Option<ProfileSummary>,
    pub listing: Option<ListingSummary>,
}

impl ConversationEntry {
    /// 以 `viewer_id` 的视角构造；viewer 不是参与者时返回 None
    pub fn for_viewer(conversation: Conversation, viewer_id: &str) -> Option<Self> {
        let counterpart_id = conversation.counterpart_of(viewer_id)?.to_string();
        let counterpart = conversation.counterpart_profile(viewer_id).cloned();
        let listing = conversation.listing.clone();
        Some(Self {
            conversation,
            counterpart_id,
            counterpart,
            listing,
        })
    }

    pub fn id(&self) -> &str {
        &self.conversation.id
    }

    pub fn display_name(&self) -> &str {
        self.counterpart
            .as_ref()
            .map(|p| p.display_name())
            .unwrap_or("Unknown User")
    }

    /// 最新消息摘要（附件显示为图标文案）
    pub fn preview(&self, max_chars: usize) -> String {
        match self.conversation.last_message.as_deref() {
            Some(raw) if !raw.is_empty() => {
                truncate_preview(&MessageContent::parse(raw).preview(), max_chars)
            }
            _ => String::new(),
        }
    }

    pub fn list_time(&self, now: DateTime<Utc>, offset: FixedOffset) -> String {
        format_list_time(self.conversation.last_message_at, now, offset)
    }
}

/// 收件箱条目：会话 + 未读数
#[derive(Debug, Clone, PartialEq)]
pub struct InboxItem {
    pub entry: ConversationEntry,
    pub unread_count: u64,
}
