//! 聊天客户端入口
//!
//! 持有登录会话、远端网关和各类监听器，对外提供"联系卖家""会话列表""打开聊天页"等操作。

use crate::im::auth::AuthSession;
use crate::im::block::{BlockService, BlockStatus};
use crate::im::config::ChatConfig;
use crate::im::context::ChatContext;
use crate::im::conversation::{
    ConversationEntry, ConversationListener, ConversationManager, EmptyConversationListener,
    InboxItem,
};
use crate::im::error::ChatResult;
use crate::im::gateway::{RealtimeClient, RemoteGateway, RestGateway};
use crate::im::message::{EmptyMessageListener, MessageListener, MessageService};
use crate::im::presence::{EmptyPresenceListener, PresenceListener};
use crate::im::realtime::InboxWatcher;
use crate::im::room::ChatRoom;
use crate::im::types::Conversation;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// 聊天客户端
pub struct ChatClient {
    ctx: ChatContext,
    session: Option<AuthSession>,
    realtime: Option<Arc<RealtimeClient>>,
    conversation_listener: Arc<dyn ConversationListener>,
    message_listener: Arc<dyn MessageListener>,
    presence_listener: Arc<dyn PresenceListener>,
    inbox: Option<InboxWatcher>,
}

impl ChatClient {
    /// 用登录会话连接托管后端
    ///
    /// 实时通道连接失败时仍返回客户端，此时所有订阅都会失败，界面退化为手动刷新。
    pub async fn connect(config: ChatConfig, session: AuthSession) -> Result<Self> {
        info!(
            "[Client] 🔗 连接到聊天后端 {} (user={})",
            config.api_base_url, session.user_id
        );
        let realtime = match RealtimeClient::connect(&config, &session.access_token).await {
            Ok(client) => {
                info!("[Client] ✅ 实时通道已连接");
                Some(Arc::new(client))
            }
            Err(e) => {
                warn!("[Client] ⚠️ 实时通道连接失败，仅使用 REST: {}", e);
                None
            }
        };

        let mut rest = RestGateway::new(&config, &session.access_token)
            .context("创建 REST 网关失败")?;
        if let Some(realtime) = &realtime {
            rest = rest.with_realtime(realtime.clone());
        }

        let ctx = ChatContext::new(session.user_id.clone(), Arc::new(rest), Arc::new(config));
        Ok(Self {
            session: Some(session),
            realtime,
            ..Self::with_context(ctx)
        })
    }

    /// 使用任意网关构造（本地演示和测试用）
    pub fn with_gateway(
        user_id: impl Into<String>,
        gateway: Arc<dyn RemoteGateway>,
        config: ChatConfig,
    ) -> Self {
        Self::with_context(ChatContext::new(user_id, gateway, Arc::new(config)))
    }

    pub fn with_context(ctx: ChatContext) -> Self {
        Self {
            ctx,
            session: None,
            realtime: None,
            conversation_listener: Arc::new(EmptyConversationListener),
            message_listener: Arc::new(EmptyMessageListener),
            presence_listener: Arc::new(EmptyPresenceListener),
            inbox: None,
        }
    }

    pub fn context(&self) -> &ChatContext {
        &self.ctx
    }

    pub fn user_id(&self) -> &str {
        self.ctx.user_id()
    }

    pub fn session(&self) -> Option<&AuthSession> {
        self.session.as_ref()
    }

    pub fn is_realtime_connected(&self) -> bool {
        self.realtime
            .as_ref()
            .map(|r| r.is_connected())
            .unwrap_or(false)
    }

    /// 注册会话监听器；之后启动的收件箱监听使用新的监听器
    pub fn set_conversation_listener(&mut self, listener: Arc<dyn ConversationListener>) {
        self.conversation_listener = listener;
    }

    /// 注册消息监听器；之后打开的聊天页使用新的监听器
    pub fn set_message_listener(&mut self, listener: Arc<dyn MessageListener>) {
        self.message_listener = listener;
    }

    pub fn set_presence_listener(&mut self, listener: Arc<dyn PresenceListener>) {
        self.presence_listener = listener;
    }

    pub fn conversations(&self) -> ConversationManager {
        ConversationManager::new(self.ctx.clone())
    }

    pub fn messages(&self) -> MessageService {
        MessageService::new(self.ctx.clone())
    }

    pub fn blocks(&self) -> BlockService {
        BlockService::new(self.ctx.clone())
    }

    /// 以买家身份联系卖家：已有会话直接返回，否则创建
    pub async fn contact_seller(
        &self,
        listing_id: Option<&str>,
        seller_id: &str,
    ) -> ChatResult<Conversation> {
        self.conversations()
            .get_or_create(listing_id, self.ctx.user_id(), seller_id)
            .await
    }

    /// 当前用户的会话列表，最近活跃的在前
    pub async fn list_conversations(&self) -> ChatResult<Vec<ConversationEntry>> {
        self.conversations().list_for_user(self.ctx.user_id()).await
    }

    /// 会话列表 + 每个会话的未读数
    pub async fn inbox(&self) -> ChatResult<Vec<InboxItem>> {
        self.conversations().inbox(self.ctx.user_id()).await
    }

    pub async fn total_unread_count(&self) -> ChatResult<u64> {
        self.messages().total_unread_count(self.ctx.user_id()).await
    }

    pub async fn block_status(&self, other_id: &str) -> ChatResult<BlockStatus> {
        self.blocks().status(other_id).await
    }

    /// 打开聊天页
    pub async fn open_room(&self, conversation_id: &str) -> ChatResult<ChatRoom> {
        ChatRoom::open_with_listeners(
            self.ctx.clone(),
            conversation_id,
            self.message_listener.clone(),
            self.presence_listener.clone(),
        )
        .await
    }

    /// 启动收件箱监听（已启动时先停止旧的）
    pub async fn watch_inbox(&mut self) -> ChatResult<()> {
        if let Some(mut previous) = self.inbox.take() {
            previous.stop().await;
        }
        let watcher =
            InboxWatcher::start(self.ctx.clone(), self.conversation_listener.clone()).await?;
        self.inbox = Some(watcher);
        Ok(())
    }

    pub async fn stop_inbox(&mut self) {
        if let Some(mut watcher) = self.inbox.take() {
            watcher.stop().await;
        }
    }

    /// 停止所有监听并关闭实时通道
    pub async fn shutdown(&mut self) {
        self.stop_inbox().await;
        if let Some(realtime) = self.realtime.take() {
            realtime.close().await;
        }
        info!("[Client] 👋 客户端已关闭 user={}", self.ctx.user_id());
    }
}
