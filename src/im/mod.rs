pub mod auth;
pub mod block;
pub mod client;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod format;
pub mod gateway;
pub mod message;
pub mod presence;
pub mod realtime;
pub mod room;
pub mod serialization;
pub mod types;

// 重新导出认证相关函数
pub use auth::{sign_in_with_password, AuthSession};

// 重新导出错误类型
pub use error::{ChatError, ChatResult, GatewayError, SendFailure, ValidationError};
