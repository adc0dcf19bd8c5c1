//! 消息展示模型

use crate::im::types::Message;

/// 自己发出的消息的投递状态（对方消息没有状态）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    /// 本地已追加，服务端尚未确认
    Pending,
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// 以 `viewer_id` 的视角计算状态
    pub fn for_message(message: &Message, viewer_id: &str) -> Option<Self> {
        if message.sender_id != viewer_id {
            return None;
        }
        Some(if message.is_read {
            DeliveryStatus::Read
        } else if message.is_delivered {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }
}
