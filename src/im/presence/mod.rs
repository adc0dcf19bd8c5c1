//! 在线状态
//!
//! 自己的心跳写入与对方在线状态观察

pub mod observer;
pub mod tracker;

pub use observer::{EmptyPresenceListener, PresenceListener, PresenceObserver};
pub use tracker::{AppState, PresenceTracker};
