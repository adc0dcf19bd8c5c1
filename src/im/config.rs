//! 客户端配置

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use std::time::Duration;

/// 聊天核心配置
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// 托管平台基础地址，例如 `https://xyz.supabase.co`
    pub api_base_url: String,
    /// 匿名 API key（所有请求都要带上）
    pub anon_key: String,
    /// 实时通道地址，为空时由 `api_base_url` 推导
    pub realtime_url: Option<String>,
    /// 在线心跳间隔
    pub presence_interval: Duration,
    /// 心跳超过该时长未刷新即视为离线
    pub presence_stale_after: Duration,
    /// 聊天页获得焦点后延迟标记已读
    pub mark_read_focus_delay: Duration,
    /// 应用回到前台后延迟标记已读
    pub mark_read_foreground_delay: Duration,
    /// 收到对方新消息后延迟标记已读
    pub mark_read_inbound_delay: Duration,
    /// 实时通道心跳间隔
    pub realtime_heartbeat_interval: Duration,
    /// 订阅加入（phx_join）等待回复的超时
    pub realtime_join_timeout: Duration,
    /// HTTP 请求超时
    pub request_timeout: Duration,
    /// 展示时间使用的时区偏移（小时），默认 WIB (+7)
    pub utc_offset_hours: i32,
    /// 新消息写入时 is_delivered 的初始值
    pub delivered_on_insert: bool,
    /// 发送成功后是否由客户端刷新会话的最新消息快照
    pub refresh_last_message: bool,
    /// 被屏蔽时是否拒绝发送
    pub enforce_blocks: bool,
    /// 会话列表预览最大字符数
    pub preview_max_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:54321".to_string(),
            anon_key: String::new(),
            realtime_url: None,
            presence_interval: Duration::from_secs(10),
            presence_stale_after: Duration::from_secs(35),
            mark_read_focus_delay: Duration::from_millis(500),
            mark_read_foreground_delay: Duration::from_millis(300),
            mark_read_inbound_delay: Duration::from_millis(200),
            realtime_heartbeat_interval: Duration::from_secs(25),
            realtime_join_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
            utc_offset_hours: 7,
            delivered_on_insert: true,
            refresh_last_message: true,
            enforce_blocks: true,
            preview_max_chars: 50,
        }
    }
}

impl ChatConfig {
    /// 创建默认配置
    pub fn new(api_base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            ..Self::default()
        }
    }

    /// 从环境变量读取配置
    ///
    /// 必需：`SUPABASE_URL`、`SUPABASE_ANON_KEY`
    /// 可选：`CARCHAT_REALTIME_URL`、`CARCHAT_PRESENCE_INTERVAL_SECS`、`CARCHAT_UTC_OFFSET_HOURS`
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SUPABASE_URL").context("缺少环境变量 SUPABASE_URL")?;
        let key = std::env::var("SUPABASE_ANON_KEY").context("缺少环境变量 SUPABASE_ANON_KEY")?;
        let mut config = Self::new(url, key);

        if let Ok(realtime_url) = std::env::var("CARCHAT_REALTIME_URL") {
            if !realtime_url.is_empty() {
                config.realtime_url = Some(realtime_url);
            }
        }
        if let Ok(secs) = std::env::var("CARCHAT_PRESENCE_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .context("CARCHAT_PRESENCE_INTERVAL_SECS 必须是整数")?;
            config.presence_interval = Duration::from_secs(secs.max(1));
        }
        if let Ok(hours) = std::env::var("CARCHAT_UTC_OFFSET_HOURS") {
            let hours: i32 = hours
                .parse()
                .context("CARCHAT_UTC_OFFSET_HOURS 必须是整数")?;
            config.utc_offset_hours = validate_offset_hours(hours)?;
        }
        Ok(config)
    }

    /// REST 接口根地址
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.api_base_url)
    }

    /// 认证接口根地址
    pub fn auth_url(&self) -> String {
        format!("{}/auth/v1", self.api_base_url)
    }

    /// 实时通道 WebSocket 地址（不含查询参数）
    pub fn realtime_endpoint(&self) -> String {
        if let Some(url) = &self.realtime_url {
            return url.clone();
        }
        let ws_base = if let Some(rest) = self.api_base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.api_base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.api_base_url.clone()
        };
        format!("{}/realtime/v1/websocket", ws_base)
    }

    /// 展示用时区，偏移非法时回退到 UTC
    pub fn display_offset(&self) -> FixedOffset {
        offset_seconds(self.utc_offset_hours)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }
}

fn offset_seconds(hours: i32) -> Option<i32> {
    hours.checked_mul(3600)
}

/// 时区偏移必须落在 ±23 小时内
fn validate_offset_hours(hours: i32) -> Result<i32> {
    offset_seconds(hours)
        .and_then(FixedOffset::east_opt)
        .map(|_| hours)
        .ok_or_else(|| anyhow::anyhow!("CARCHAT_UTC_OFFSET_HOURS 超出范围: {}", hours))
}
