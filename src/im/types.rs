//! 行模型与变更流类型
//!
//! 字段名与远端表结构保持一致（`car_id`、`buyer_id` 等），以便直接从网关响应
//! 和实时推送的 `record` 反序列化。

use crate::im::error::GatewayError;
use crate::im::message::content::MessageContent;
use crate::im::serialization::{deserialize_null_default, deserialize_timestamp};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 用户资料摘要（会话列表展示用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub id: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl ProfileSummary {
    pub fn display_name(&self) -> &str {
        match self.full_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => "Unknown User",
        }
    }
}

/// 车源摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: String,
    /// 发布者（卖家）
    pub user_id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub brand: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub model: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub year: i32,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub price: i64,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub images: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_sold: bool,
}

impl ListingSummary {
    pub fn title(&self) -> String {
        format!("{} {} {}", self.brand, self.model, self.year)
            .trim()
            .to_string()
    }
}

/// 会话（一个车源下买家与卖家之间的对话）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// 关联车源，可为空（会话可能早于或晚于某个车源存在）
    #[serde(rename = "car_id", default)]
    pub listing_id: Option<String>,
    pub buyer_id: String,
    pub seller_id: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_message_at: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    /// 关联查询得到的车源摘要
    #[serde(rename = "car", default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<ListingSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buyer: Option<ProfileSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller: Option<ProfileSummary>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }

    /// 对方用户 ID；`user_id` 不是参与者时返回 None
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        if self.buyer_id == user_id {
            Some(&self.seller_id)
        } else if self.seller_id == user_id {
            Some(&self.buyer_id)
        } else {
            None
        }
    }

    pub fn counterpart_profile(&self, user_id: &str) -> Option<&ProfileSummary> {
        if self.buyer_id == user_id {
            self.seller.as_ref()
        } else if self.seller_id == user_id {
            self.buyer.as_ref()
        } else {
            None
        }
    }
}

/// 聊天消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_read: bool,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_delivered: bool,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// 解析内容标记（图片 / 文件 / 纯文本）
    pub fn parsed_content(&self) -> MessageContent {
        MessageContent::parse(&self.content)
    }

    pub fn is_inbound_for(&self, viewer_id: &str) -> bool {
        self.sender_id != viewer_id
    }

    /// 用较新的行覆盖本地副本，已读/送达标记只进不退
    pub fn merge_from(&mut self, newer: Message) {
        let is_read = self.is_read || newer.is_read;
        let is_delivered = self.is_delivered || newer.is_delivered || is_read;
        *self = newer;
        self.is_read = is_read;
        self.is_delivered = is_delivered;
    }
}

/// 在线状态行（每个用户一行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub is_online: bool,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_seen: DateTime<Utc>,
}

impl Presence {
    /// 心跳过旧的在线行视为离线
    pub fn is_effectively_online(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.is_online && now.signed_duration_since(self.last_seen) <= stale_after
    }
}

/// 屏蔽关系
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: String,
    pub blocker_id: String,
    pub blocked_id: String,
}

// ========== 变更流 ==========

/// 可订阅的远端表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Conversations,
    Messages,
    UserPresence,
    BlockedUsers,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Conversations => "conversations",
            Table::Messages => "messages",
            Table::UserPresence => "user_presence",
            Table::BlockedUsers => "blocked_users",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "conversations" => Some(Table::Conversations),
            "messages" => Some(Table::Messages),
            "user_presence" => Some(Table::UserPresence),
            "blocked_users" => Some(Table::BlockedUsers),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 订阅过滤条件（只支持单列等值，与远端实时服务一致）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    All,
    Eq { column: String, value: String },
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        RowFilter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// 渲染为 `column=eq.value`，`All` 返回 None
    pub fn to_filter_string(&self) -> Option<String> {
        match self {
            RowFilter::All => None,
            RowFilter::Eq { column, value } => Some(format!("{}=eq.{}", column, value)),
        }
    }

    /// 判断一行是否命中过滤条件（删除事件看 old_record）
    pub fn matches(&self, record: &serde_json::Value) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Eq { column, value } => match record.get(column) {
                Some(serde_json::Value::String(s)) => s == value,
                Some(serde_json::Value::Bool(b)) => value == if *b { "true" } else { "false" },
                Some(serde_json::Value::Number(n)) => n.to_string() == *value,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// 行级变更事件
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub table: Table,
    pub kind: ChangeKind,
    /// 新行（DELETE 时为 Null）
    pub record: serde_json::Value,
    /// 旧行（通常只包含主键）
    pub old_record: serde_json::Value,
}

impl RowChange {
    pub fn new(table: Table, kind: ChangeKind, record: serde_json::Value) -> Self {
        Self {
            table,
            kind,
            record,
            old_record: serde_json::Value::Null,
        }
    }

    pub fn with_old_record(mut self, old_record: serde_json::Value) -> Self {
        self.old_record = old_record;
        self
    }

    /// 将新行反序列化为具体类型
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        serde_json::from_value(self.record.clone()).map_err(GatewayError::from)
    }

    /// 变更行的主键（优先新行，其次旧行）
    pub fn row_id(&self) -> Option<&str> {
        self.record
            .get("id")
            .and_then(|v| v.as_str())
            .or_else(|| self.old_record.get("id").and_then(|v| v.as_str()))
    }

    pub fn matches(&self, table: Table, filter: &RowFilter) -> bool {
        if self.table != table {
            return false;
        }
        match self.kind {
            ChangeKind::Delete => filter.matches(&self.old_record) || filter.matches(&self.record),
            _ => filter.matches(&self.record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conversation_deserializes_embedded_rows() {
        let raw = json!({
            "id": "c1",
            "car_id": null,
            "buyer_id": "b",
            "seller_id": "s",
            "last_message": null,
            "last_message_at": "2024-05-01T10:00:00+00:00",
            "created_at": "2024-05-01 09:00:00+00",
            "buyer": {"id": "b", "full_name": "Budi", "avatar_url": null},
            "seller": {"id": "s", "full_name": null}
        });
        let conv: Conversation = serde_json::from_value(raw).unwrap();
        assert_eq!(conv.listing_id, None);
        assert_eq!(conv.counterpart_of("b"), Some("s"));
        assert_eq!(conv.counterpart_of("x"), None);
        assert_eq!(conv.counterpart_profile("s").unwrap().display_name(), "Budi");
        assert_eq!(conv.counterpart_profile("b").unwrap().display_name(), "Unknown User");
    }

    #[test]
    fn merge_never_clears_flags() {
        let mut local = Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
            content: "hi".into(),
            is_read: true,
            is_delivered: true,
            created_at: Utc::now(),
        };
        let mut stale = local.clone();
        stale.is_read = false;
        stale.is_delivered = false;
        local.merge_from(stale);
        assert!(local.is_read);
        assert!(local.is_delivered);
    }

    #[test]
    fn filter_matches_record_columns() {
        let filter = RowFilter::eq("conversation_id", "c1");
        assert_eq!(filter.to_filter_string().as_deref(), Some("conversation_id=eq.c1"));
        assert!(filter.matches(&json!({"conversation_id": "c1"})));
        assert!(!filter.matches(&json!({"conversation_id": "c2"})));
        assert!(!filter.matches(&json!({})));
        assert!(RowFilter::All.matches(&json!({})));

        let delete = RowChange::new(Table::Messages, ChangeKind::Delete, serde_json::Value::Null)
            .with_old_record(json!({"id": "m1", "conversation_id": "c1"}));
        assert!(delete.matches(Table::Messages, &filter));
        assert!(!delete.matches(Table::Conversations, &filter));
        assert_eq!(delete.row_id(), Some("m1"));
    }
}
