pub mod im;

// 重新导出常用类型和函数，方便外部使用
pub use im::{
    block::BlockStatus,
    client::ChatClient,
    config::ChatConfig,
    context::ChatContext,
    conversation::{ConversationEntry, ConversationListener, InboxItem},
    error::{ChatError, ChatResult, GatewayError, SendFailure, ValidationError},
    gateway::{RemoteGateway, RestGateway, SqliteGateway},
    message::{MessageContent, MessageListener},
    presence::{AppState, PresenceListener},
    room::ChatRoom,
    sign_in_with_password,
    types::{Conversation, Message, Presence},
    AuthSession,
};
