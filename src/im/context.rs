//! 显式的聊天上下文：当前用户、网关与配置
//!
//! 聊天组件在构造时接收上下文，而不是读取进程级全局状态，测试可以直接注入夹具。

use crate::im::config::ChatConfig;
use crate::im::gateway::RemoteGateway;
use std::sync::Arc;

#[derive(Clone)]
pub struct ChatContext {
    user_id: String,
    gateway: Arc<dyn RemoteGateway>,
    config: Arc<ChatConfig>,
}

impl ChatContext {
    pub fn new(
        user_id: impl Into<String>,
        gateway: Arc<dyn RemoteGateway>,
        config: Arc<ChatConfig>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            gateway,
            config,
        }
    }

    /// 当前登录用户
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn gateway(&self) -> &Arc<dyn RemoteGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<ChatConfig> {
        self.config.clone()
    }

    /// 共享网关与配置，切换到另一个用户（同进程多账号演示和测试用）
    pub fn for_user(&self, user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            gateway: self.gateway.clone(),
            config: self.config.clone(),
        }
    }
}

impl std::fmt::Debug for ChatContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatContext")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}
