//! 会话模块
//!
//! 会话的创建、查找与列表（每个 车源/买家/卖家 三元组至多一个会话）

pub mod listener;
pub mod models;
pub mod service;

pub use listener::{ConversationListener, EmptyConversationListener};
pub use models::{ConversationEntry, InboxItem};
pub use service::ConversationManager;
