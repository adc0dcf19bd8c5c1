//! 消息模块
//!
//! 消息写入与历史、内容标记、已读状态

pub mod content;
pub mod listener;
pub mod models;
pub mod read_state;
pub mod service;

pub use content::MessageContent;
pub use listener::{EmptyMessageListener, MessageListener};
pub use models::DeliveryStatus;
pub use read_state::{ReadStateTracker, ReadTrigger};
pub use service::MessageService;
