//! 错误类型定义
//!
//! 网关层错误（`GatewayError`）只描述远端调用本身出了什么问题；
//! 业务层错误（`ChatError`）区分"查询失败"与"创建失败"等语义，调用方据此决定是否提示重试。

use thiserror::Error;

/// 远端数据网关错误
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// HTTP 状态码非 2xx 且响应体无法识别
    #[error("HTTP 错误 {status}: {body}")]
    Http { status: u16, body: String },

    /// 服务器返回了结构化错误
    #[error("服务器错误 {code}: {message}")]
    Server { code: String, message: String },

    /// 唯一约束冲突（例如同一三元组的会话已存在）
    #[error("唯一约束冲突: {0}")]
    Conflict(String),

    /// 目标记录不存在
    #[error("记录不存在: {0}")]
    NotFound(String),

    /// 网络请求失败
    #[error("网络请求失败: {0}")]
    Transport(String),

    /// 响应解析失败
    #[error("数据解析失败: {0}")]
    Decode(String),

    /// 本地存储错误
    #[error("存储错误: {0}")]
    Storage(String),

    /// 实时通道错误
    #[error("实时通道错误: {0}")]
    Realtime(String),

    /// 连接已关闭
    #[error("连接已关闭")]
    Closed,
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Decode(e.to_string())
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => GatewayError::NotFound("行不存在".to_string()),
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                GatewayError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => GatewayError::Decode(e.to_string()),
            other => GatewayError::Storage(other.to_string()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Realtime(e.to_string())
    }
}

/// 网关调用结果
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// 参数校验错误，在发起任何写入前拒绝
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("消息内容不能为空")]
    EmptyContent,

    #[error("买家和卖家不能是同一个用户: {0}")]
    SameParticipants(String),

    #[error("{0} 不能为空")]
    EmptyIdentity(&'static str),

    #[error("用户 {user_id} 不是会话 {conversation_id} 的参与者")]
    NotParticipant {
        user_id: String,
        conversation_id: String,
    },

    #[error("当前登录用户 {current} 不能以 {claimed} 的身份发送消息")]
    SenderMismatch { current: String, claimed: String },

    #[error("只能写入自己的在线状态（当前用户 {current}，目标 {target}）")]
    ForeignPresence { current: String, target: String },

    #[error("会话已被屏蔽（由自己屏蔽: {by_self}）")]
    Blocked { by_self: bool },

    #[error("聊天页已关闭")]
    RoomClosed,
}

/// 聊天核心业务错误
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("参数校验失败: {0}")]
    Validation(#[from] ValidationError),

    /// 查询失败，绝不能当作"未找到"处理
    #[error("查询失败: {0}")]
    Lookup(#[source] GatewayError),

    /// 写入失败，调用方不应自动重试
    #[error("创建失败: {0}")]
    Creation(#[source] GatewayError),

    #[error("更新失败: {0}")]
    Update(#[source] GatewayError),

    /// 实时订阅失败，仅影响实时更新
    #[error("实时订阅失败: {0}")]
    Subscription(#[source] GatewayError),

    #[error("会话不存在: {0}")]
    ConversationNotFound(String),
}

impl ChatError {
    /// 是否为参数校验错误（未产生任何写入）
    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::Validation(_))
    }
}

/// 聊天业务结果
pub type ChatResult<T> = std::result::Result<T, ChatError>;

/// 发送失败：携带原始草稿，界面据此把文本恢复到输入框
#[derive(Debug, Clone, Error)]
#[error("发送失败: {error}")]
pub struct SendFailure {
    pub draft: String,
    #[source]
    pub error: ChatError,
}
