//! 实时合并
//!
//! 订阅生命周期、聊天页时间线合并、收件箱监听

pub mod inbox;
pub mod subscription;
pub mod timeline;

pub use inbox::InboxWatcher;
pub use subscription::{RealtimeSubscription, SubscriptionState};
pub use timeline::{
    ApplyOutcome, IgnoreReason, MessageTimeline, PendingMessage, TimelineEntry,
};
