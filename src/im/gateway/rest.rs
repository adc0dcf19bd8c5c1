//! 托管平台 REST 网关（PostgREST 约定）
//!
//! 所有请求都带 `apikey` 与 `Authorization: Bearer <token>` 默认请求头；
//! 实时订阅委托给 [`RealtimeClient`]。

use crate::im::config::ChatConfig;
use crate::im::error::{GatewayError, GatewayResult};
use crate::im::gateway::{ChangeSink, NewMessage, RealtimeClient, RemoteGateway, SubscriptionHandle};
use crate::im::types::{BlockRecord, Conversation, Message, Presence, RowFilter, Table};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 会话查询时一并关联车源和双方资料
const CONVERSATION_SELECT: &str = "*,\
car:cars(id,user_id,brand,model,year,price,images,is_sold),\
buyer:profiles!conversations_buyer_id_fkey(id,full_name,avatar_url),\
seller:profiles!conversations_seller_id_fkey(id,full_name,avatar_url)";

/// 唯一约束冲突的 Postgres 错误码
const UNIQUE_VIOLATION: &str = "23505";

/// PostgREST 错误响应体
#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    hint: Option<String>,
}

pub struct RestGateway {
    client: reqwest::Client,
    rest_url: String,
    realtime: Option<Arc<RealtimeClient>>,
}

impl RestGateway {
    /// 创建带认证请求头的网关
    pub fn new(config: &ChatConfig, access_token: &str) -> GatewayResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("apikey"),
            HeaderValue::from_str(&config.anon_key)
                .map_err(|e| GatewayError::Transport(format!("无效的 apikey: {}", e)))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|e| GatewayError::Transport(format!("无效的 token: {}", e)))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            rest_url: config.rest_url(),
            realtime: None,
        })
    }

    /// 挂载实时通道，启用订阅能力
    pub fn with_realtime(mut self, realtime: Arc<RealtimeClient>) -> Self {
        self.realtime = Some(realtime);
        self
    }

    pub fn realtime(&self) -> Option<&Arc<RealtimeClient>> {
        self.realtime.as_ref()
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, table))
    }

    fn realtime_or_err(&self) -> GatewayResult<&Arc<RealtimeClient>> {
        self.realtime
            .as_ref()
            .ok_or_else(|| GatewayError::Realtime("实时通道未配置".to_string()))
    }
}

/// 统一处理响应：非 2xx 映射为网关错误，成功时反序列化响应体
async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
    operation: &str,
) -> GatewayResult<T> {
    let status = response.status();
    let body = response.bytes().await?;
    let body_str = String::from_utf8_lossy(&body);

    if !status.is_success() {
        let err = map_error(status.as_u16(), &body_str);
        error!("[RestGW] {} 请求失败，HTTP状态: {}, 错误: {}", operation, status, err);
        return Err(err);
    }
    debug!("[RestGW] {} 请求成功，HTTP状态: {}", operation, status);

    serde_json::from_slice(&body).map_err(|e| {
        error!("[RestGW] {} 反序列化失败: {}\n原始响应: {}", operation, e, body_str);
        GatewayError::from(e)
    })
}

/// 只关心是否成功的请求
async fn expect_success(response: reqwest::Response, operation: &str) -> GatewayResult<()> {
    let status = response.status();
    if status.is_success() {
        debug!("[RestGW] {} 请求成功，HTTP状态: {}", operation, status);
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    let err = map_error(status.as_u16(), &body);
    error!("[RestGW] {} 请求失败，HTTP状态: {}, 错误: {}", operation, status, err);
    Err(err)
}

fn map_error(status: u16, body: &str) -> GatewayError {
    match serde_json::from_str::<PostgrestError>(body) {
        Ok(pg) => {
            let code = pg.code.unwrap_or_default();
            let mut message = pg.message.unwrap_or_default();
            if let Some(details) = pg.details.filter(|d| !d.is_empty()) {
                message = format!("{} ({})", message, details);
            }
            if let Some(hint) = pg.hint.filter(|h| !h.is_empty()) {
                message = format!("{} [hint: {}]", message, hint);
            }
            if code == UNIQUE_VIOLATION || status == 409 {
                GatewayError::Conflict(message)
            } else if code.is_empty() && message.is_empty() {
                GatewayError::Http {
                    status,
                    body: body.to_string(),
                }
            } else {
                GatewayError::Server { code, message }
            }
        }
        Err(_) if status == 409 => GatewayError::Conflict(body.to_string()),
        Err(_) => GatewayError::Http {
            status,
            body: body.to_string(),
        },
    }
}

/// 解析 `Content-Range: 0-9/42` 或 `*/42` 中的总数
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

/// 任一方向的屏蔽关系过滤
fn block_pair_filter(user_a: &str, user_b: &str) -> String {
    format!(
        "(and(blocker_id.eq.{a},blocked_id.eq.{b}),and(blocker_id.eq.{b},blocked_id.eq.{a}))",
        a = user_a,
        b = user_b
    )
}

#[async_trait]
impl RemoteGateway for RestGateway {
    async fn find_conversation(
        &self,
        listing_id: Option<&str>,
        buyer_id: &str,
        seller_id: &str,
    ) -> GatewayResult<Option<Conversation>> {
        let car_filter = match listing_id {
            Some(id) => eq(id),
            None => "is.null".to_string(),
        };
        let response = self
            .request(Method::GET, "conversations")
            .query(&[
                ("select", CONVERSATION_SELECT.to_string()),
                ("car_id", car_filter),
                ("buyer_id", eq(buyer_id)),
                ("seller_id", eq(seller_id)),
                ("order", "created_at.asc".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<Conversation> = handle_response(response, "查找会话").await?;
        Ok(rows.into_iter().next())
    }

    async fn create_conversation(
        &self,
        listing_id: Option<&str>,
        buyer_id: &str,
        seller_id: &str,
    ) -> GatewayResult<Conversation> {
        let response = self
            .request(Method::POST, "conversations")
            .query(&[("select", CONVERSATION_SELECT)])
            .header("Prefer", "return=representation")
            .json(&json!({
                "car_id": listing_id,
                "buyer_id": buyer_id,
                "seller_id": seller_id,
                "last_message": null,
                "last_message_at": Utc::now().to_rfc3339(),
            }))
            .send()
            .await?;
        let rows: Vec<Conversation> = handle_response(response, "创建会话").await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode("创建会话未返回数据".to_string()))
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> GatewayResult<Option<Conversation>> {
        let response = self
            .request(Method::GET, "conversations")
            .query(&[
                ("select", CONVERSATION_SELECT.to_string()),
                ("id", eq(conversation_id)),
            ])
            .send()
            .await?;
        let rows: Vec<Conversation> = handle_response(response, "获取会话").await?;
        Ok(rows.into_iter().next())
    }

    async fn list_conversations(&self, user_id: &str) -> GatewayResult<Vec<Conversation>> {
        let response = self
            .request(Method::GET, "conversations")
            .query(&[
                ("select", CONVERSATION_SELECT.to_string()),
                (
                    "or",
                    format!("(buyer_id.eq.{u},seller_id.eq.{u})", u = user_id),
                ),
                ("order", "last_message_at.desc".to_string()),
            ])
            .send()
            .await?;
        handle_response(response, "会话列表").await
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let response = self
            .request(Method::PATCH, "conversations")
            .query(&[("id", eq(conversation_id))])
            .header("Prefer", "return=minimal")
            .json(&json!({
                "last_message": last_message,
                "last_message_at": at.to_rfc3339(),
            }))
            .send()
            .await?;
        expect_success(response, "刷新最新消息").await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> GatewayResult<()> {
        // 先删消息，不依赖服务端的级联配置
        self.delete_messages(conversation_id).await?;
        let response = self
            .request(Method::DELETE, "conversations")
            .query(&[("id", eq(conversation_id))])
            .send()
            .await?;
        expect_success(response, "删除会话").await
    }

    async fn insert_message(&self, message: &NewMessage) -> GatewayResult<Message> {
        let response = self
            .request(Method::POST, "messages")
            .header("Prefer", "return=representation")
            .json(&json!({
                "conversation_id": message.conversation_id,
                "sender_id": message.sender_id,
                "receiver_id": message.receiver_id,
                "content": message.content,
                "is_read": false,
                "is_delivered": message.is_delivered,
            }))
            .send()
            .await?;
        let rows: Vec<Message> = handle_response(response, "发送消息").await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode("发送消息未返回数据".to_string()))
    }

    async fn list_messages(&self, conversation_id: &str) -> GatewayResult<Vec<Message>> {
        let response = self
            .request(Method::GET, "messages")
            .query(&[
                ("select", "*".to_string()),
                ("conversation_id", eq(conversation_id)),
                ("order", "created_at.asc".to_string()),
            ])
            .send()
            .await?;
        handle_response(response, "历史消息").await
    }

    async fn update_messages_read_flag(
        &self,
        conversation_id: &str,
        exclude_sender_id: &str,
    ) -> GatewayResult<u64> {
        let response = self
            .request(Method::PATCH, "messages")
            .query(&[
                ("conversation_id", eq(conversation_id)),
                ("sender_id", format!("neq.{}", exclude_sender_id)),
                ("is_read", "eq.false".to_string()),
                ("select", "id".to_string()),
            ])
            .header("Prefer", "return=representation")
            .json(&json!({ "is_read": true, "is_delivered": true }))
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = handle_response(response, "标记已读").await?;
        Ok(rows.len() as u64)
    }

    async fn count_unread(&self, conversation_id: &str, user_id: &str) -> GatewayResult<u64> {
        let response = self
            .request(Method::HEAD, "messages")
            .query(&[
                ("select", "id".to_string()),
                ("conversation_id", eq(conversation_id)),
                ("sender_id", format!("neq.{}", user_id)),
                ("is_read", "eq.false".to_string()),
            ])
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| GatewayError::Decode("响应缺少 Content-Range".to_string()))
    }

    async fn delete_messages(&self, conversation_id: &str) -> GatewayResult<u64> {
        let response = self
            .request(Method::DELETE, "messages")
            .query(&[
                ("conversation_id", eq(conversation_id)),
                ("select", "id".to_string()),
            ])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = handle_response(response, "清空消息").await?;
        Ok(rows.len() as u64)
    }

    async fn subscribe_row_changes(
        &self,
        table: Table,
        filter: RowFilter,
        sink: ChangeSink,
    ) -> GatewayResult<SubscriptionHandle> {
        self.realtime_or_err()?.subscribe(table, filter, sink).await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GatewayResult<()> {
        match &self.realtime {
            Some(realtime) => realtime.unsubscribe(handle).await,
            None => {
                warn!("[RestGW] 未配置实时通道，忽略取消订阅 {}", handle.topic);
                Ok(())
            }
        }
    }

    async fn upsert_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let response = self
            .request(Method::POST, "user_presence")
            .query(&[("on_conflict", "user_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&json!({
                "user_id": user_id,
                "is_online": is_online,
                "last_seen": last_seen.to_rfc3339(),
            }))
            .send()
            .await?;
        expect_success(response, "更新在线状态").await
    }

    async fn fetch_presence(&self, user_id: &str) -> GatewayResult<Option<Presence>> {
        let response = self
            .request(Method::GET, "user_presence")
            .query(&[("select", "*".to_string()), ("user_id", eq(user_id))])
            .send()
            .await?;
        let rows: Vec<Presence> = handle_response(response, "获取在线状态").await?;
        Ok(rows.into_iter().next())
    }

    async fn find_block(&self, user_a: &str, user_b: &str) -> GatewayResult<Vec<BlockRecord>> {
        let response = self
            .request(Method::GET, "blocked_users")
            .query(&[
                ("select", "id,blocker_id,blocked_id".to_string()),
                ("or", block_pair_filter(user_a, user_b)),
            ])
            .send()
            .await?;
        handle_response(response, "查询屏蔽").await
    }

    async fn upsert_block(&self, blocker_id: &str, blocked_id: &str) -> GatewayResult<BlockRecord> {
        let response = self
            .request(Method::POST, "blocked_users")
            .query(&[
                ("on_conflict", "blocker_id,blocked_id"),
                ("select", "id,blocker_id,blocked_id"),
            ])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&json!({ "blocker_id": blocker_id, "blocked_id": blocked_id }))
            .send()
            .await?;
        let rows: Vec<BlockRecord> = handle_response(response, "屏蔽用户").await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode("屏蔽用户未返回数据".to_string()))
    }

    async fn delete_block(&self, user_a: &str, user_b: &str) -> GatewayResult<u64> {
        let response = self
            .request(Method::DELETE, "blocked_users")
            .query(&[
                ("or", block_pair_filter(user_a, user_b)),
                ("select", "id".to_string()),
            ])
            .header("Prefer", "return=representation")
            .send()
            .await?;
        let rows: Vec<serde_json::Value> = handle_response(response, "解除屏蔽").await?;
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_postgrest_errors() {
        let conflict = map_error(
            409,
            r#"{"code":"23505","message":"duplicate key value violates unique constraint","details":null,"hint":null}"#,
        );
        assert!(matches!(conflict, GatewayError::Conflict(_)));

        let server = map_error(
            400,
            r#"{"code":"PGRST100","message":"failed to parse filter","details":"bad","hint":null}"#,
        );
        match server {
            GatewayError::Server { code, message } => {
                assert_eq!(code, "PGRST100");
                assert_eq!(message, "failed to parse filter (bad)");
            }
            other => panic!("unexpected {:?}", other),
        }

        let raw = map_error(502, "Bad Gateway");
        assert!(matches!(raw, GatewayError::Http { status: 502, .. }));
    }

    #[test]
    fn parses_count_from_content_range() {
        assert_eq!(parse_content_range_total("0-9/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn block_filter_covers_both_directions() {
        assert_eq!(
            block_pair_filter("a", "b"),
            "(and(blocker_id.eq.a,blocked_id.eq.b),and(blocker_id.eq.b,blocked_id.eq.a))"
        );
    }
}
