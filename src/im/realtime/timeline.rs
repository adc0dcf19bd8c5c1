//! 聊天页消息时间线：本地乐观追加与实时推送的合并
//!
//! 自己发送的消息先以 `Pending` 追加（带客户端生成的关联 ID），插入成功后替换为
//! `Confirmed`。自己消息的 INSERT 回显会消费最早一条内容相同的待确认项，而不会重复追加。
//! 已确认的消息始终按 ID 去重。

use crate::im::message::models::DeliveryStatus;
use crate::im::types::{ChangeKind, Message, RowChange, Table};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 本地已追加、尚未被服务端确认的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub correlation_id: Uuid,
    pub sender_id: String,
    pub content: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    Pending(PendingMessage),
    Confirmed(Message),
}

impl TimelineEntry {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            TimelineEntry::Pending(_) => None,
            TimelineEntry::Confirmed(m) => Some(&m.id),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            TimelineEntry::Pending(p) => &p.content,
            TimelineEntry::Confirmed(m) => &m.content,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            TimelineEntry::Pending(p) => &p.sender_id,
            TimelineEntry::Confirmed(m) => &m.sender_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Pending(p) => p.queued_at,
            TimelineEntry::Confirmed(m) => m.created_at,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TimelineEntry::Pending(_))
    }

    /// 以 `viewer_id` 视角的投递状态（对方消息为 None）
    pub fn delivery_status(&self, viewer_id: &str) -> Option<DeliveryStatus> {
        match self {
            TimelineEntry::Pending(p) if p.sender_id == viewer_id => Some(DeliveryStatus::Pending),
            TimelineEntry::Pending(_) => None,
            TimelineEntry::Confirmed(m) => DeliveryStatus::for_message(m, viewer_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// 已存在同 ID 的消息
    Duplicate,
    /// 更新/删除的目标不在本地
    Stale,
    OtherConversation,
    Undecodable,
}

/// 合并一条变更的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// 新消息追加到末尾；`inbound` 表示来自对方
    Appended { message: Message, inbound: bool },
    /// 自己消息的回显，消费了一条待确认项
    EchoConfirmed(Message),
    /// 本地消息被更新（标记单调合并）
    Replaced(Message),
    Removed(String),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone)]
pub struct MessageTimeline {
    conversation_id: String,
    viewer_id: String,
    entries: Vec<TimelineEntry>,
}

impl MessageTimeline {
    pub fn new(conversation_id: impl Into<String>, viewer_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            viewer_id: viewer_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// 已确认的消息
    pub fn messages(&self) -> Vec<Message> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                TimelineEntry::Confirmed(m) => Some(m.clone()),
                TimelineEntry::Pending(_) => None,
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 用历史消息重建已确认部分，待确认项保留在末尾
    ///
    /// 同 ID 的本地行与历史行合并，标记不回退。历史里没有、但比历史最新一条还新的本地行
    /// 是拉取期间才推送到的，保留；更早的视为已被删除。
    pub fn load_history(&mut self, mut history: Vec<Message>) {
        history.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let newest = history.last().map(|m| m.created_at);

        let mut local = Vec::new();
        let mut pending = Vec::new();
        for entry in self.entries.drain(..) {
            match entry {
                TimelineEntry::Confirmed(m) => local.push(m),
                TimelineEntry::Pending(_) => pending.push(entry),
            }
        }

        let mut merged: Vec<Message> = Vec::with_capacity(history.len() + local.len());
        for message in history {
            if merged.iter().any(|m| m.id == message.id) {
                continue;
            }
            match local.iter().position(|m| m.id == message.id) {
                Some(index) => {
                    let mut known = local.swap_remove(index);
                    known.merge_from(message);
                    merged.push(known);
                }
                None => merged.push(message),
            }
        }
        merged.extend(
            local
                .into_iter()
                .filter(|m| newest.map_or(true, |at| m.created_at > at)),
        );
        merged.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        self.entries = merged.into_iter().map(TimelineEntry::Confirmed).collect();
        self.entries.extend(pending);
    }

    /// 乐观追加自己的消息，返回关联 ID
    pub fn push_pending(&mut self, content: impl Into<String>) -> Uuid {
        let correlation_id = Uuid::new_v4();
        self.entries.push(TimelineEntry::Pending(PendingMessage {
            correlation_id,
            sender_id: self.viewer_id.clone(),
            content: content.into(),
            queued_at: Utc::now(),
        }));
        correlation_id
    }

    /// 插入成功：用服务端返回的行替换待确认项
    pub fn confirm(&mut self, correlation_id: Uuid, message: Message) -> ApplyOutcome {
        // 回显已经先到：合并到已有行，丢掉这条待确认项
        if let Some(existing) = self.find_confirmed_mut(&message.id) {
            existing.merge_from(message);
            let merged = existing.clone();
            self.remove_pending(correlation_id);
            return ApplyOutcome::Replaced(merged);
        }
        if let Some(index) = self.pending_index(correlation_id) {
            self.entries[index] = TimelineEntry::Confirmed(message.clone());
            return ApplyOutcome::EchoConfirmed(message);
        }
        // 自己的待确认项已被另一条同内容消息的回显消费
        if let Some(index) = self.oldest_pending_with(&message.sender_id, &message.content) {
            self.entries[index] = TimelineEntry::Confirmed(message.clone());
            return ApplyOutcome::EchoConfirmed(message);
        }
        self.insert_before_pending(TimelineEntry::Confirmed(message.clone()));
        ApplyOutcome::Appended {
            message,
            inbound: false,
        }
    }

    /// 发送失败：移除待确认项，返回草稿内容
    pub fn discard_pending(&mut self, correlation_id: Uuid) -> Option<String> {
        self.remove_pending(correlation_id).map(|p| p.content)
    }

    /// 合并一条实时推送
    pub fn apply(&mut self, change: &RowChange) -> ApplyOutcome {
        if change.table != Table::Messages {
            return ApplyOutcome::Ignored(IgnoreReason::OtherConversation);
        }
        match change.kind {
            ChangeKind::Insert => {
                let Ok(message) = change.decode::<Message>() else {
                    return ApplyOutcome::Ignored(IgnoreReason::Undecodable);
                };
                self.apply_insert(message)
            }
            ChangeKind::Update => {
                let Ok(message) = change.decode::<Message>() else {
                    return ApplyOutcome::Ignored(IgnoreReason::Undecodable);
                };
                if message.conversation_id != self.conversation_id {
                    return ApplyOutcome::Ignored(IgnoreReason::OtherConversation);
                }
                match self.find_confirmed_mut(&message.id) {
                    Some(existing) => {
                        existing.merge_from(message);
                        ApplyOutcome::Replaced(existing.clone())
                    }
                    None => ApplyOutcome::Ignored(IgnoreReason::Stale),
                }
            }
            ChangeKind::Delete => {
                let Some(id) = change.row_id() else {
                    return ApplyOutcome::Ignored(IgnoreReason::Undecodable);
                };
                let before = self.entries.len();
                self.entries.retain(|e| e.message_id() != Some(id));
                if self.entries.len() < before {
                    ApplyOutcome::Removed(id.to_string())
                } else {
                    ApplyOutcome::Ignored(IgnoreReason::Stale)
                }
            }
        }
    }

    fn apply_insert(&mut self, message: Message) -> ApplyOutcome {
        if message.conversation_id != self.conversation_id {
            return ApplyOutcome::Ignored(IgnoreReason::OtherConversation);
        }
        if self.find_confirmed_mut(&message.id).is_some() {
            return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
        }
        if !message.is_inbound_for(&self.viewer_id) {
            if let Some(index) = self.oldest_pending_with(&message.sender_id, &message.content) {
                self.entries[index] = TimelineEntry::Confirmed(message.clone());
                return ApplyOutcome::EchoConfirmed(message);
            }
            // 自己在其他设备上发送的消息
            self.insert_before_pending(TimelineEntry::Confirmed(message.clone()));
            return ApplyOutcome::Appended {
                message,
                inbound: false,
            };
        }
        self.insert_before_pending(TimelineEntry::Confirmed(message.clone()));
        ApplyOutcome::Appended {
            message,
            inbound: true,
        }
    }

    fn find_confirmed_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.entries.iter_mut().find_map(|e| match e {
            TimelineEntry::Confirmed(m) if m.id == id => Some(m),
            _ => None,
        })
    }

    fn pending_index(&self, correlation_id: Uuid) -> Option<usize> {
        self.entries.iter().position(
            |e| matches!(e, TimelineEntry::Pending(p) if p.correlation_id == correlation_id),
        )
    }

    fn oldest_pending_with(&self, sender_id: &str, content: &str) -> Option<usize> {
        self.entries.iter().position(|e| {
            matches!(e, TimelineEntry::Pending(p) if p.sender_id == sender_id && p.content == content)
        })
    }

    fn remove_pending(&mut self, correlation_id: Uuid) -> Option<PendingMessage> {
        let index = self.pending_index(correlation_id)?;
        match self.entries.remove(index) {
            TimelineEntry::Pending(p) => Some(p),
            TimelineEntry::Confirmed(_) => None,
        }
    }

    /// 已确认的新行放在所有待确认项之前
    fn insert_before_pending(&mut self, entry: TimelineEntry) {
        let index = self
            .entries
            .iter()
            .position(TimelineEntry::is_pending)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, entry);
    }
}
