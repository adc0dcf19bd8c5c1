//! 认证边界
//!
//! 登录与会话管理由托管平台负责，这里只负责拿到 access token 并解析出当前用户 ID。

use crate::im::config::ChatConfig;
use crate::im::serialization::decode_jwt_claims;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct PasswordLoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
}

/// 已登录会话
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub access_token: String,
    pub user_id: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    /// 直接使用已有的 access token（从 JWT 的 `sub` 中取用户 ID）
    pub fn from_access_token(access_token: impl Into<String>) -> Result<Self> {
        let access_token = access_token.into();
        let claims = decode_jwt_claims(&access_token).map_err(|e| anyhow!(e))?;
        let user_id = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("token 中缺少 sub 字段"))?
            .to_string();
        let expires_at = claims
            .get("exp")
            .and_then(|v| v.as_i64())
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single());
        Ok(Self {
            access_token,
            user_id,
            refresh_token: None,
            expires_at,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// 邮箱密码登录
pub async fn sign_in_with_password(
    config: &ChatConfig,
    email: &str,
    password: &str,
) -> Result<AuthSession> {
    let url = format!("{}/token?grant_type=password", config.auth_url());

    info!("[Auth] 🔐 正在登录...");
    debug!("[Auth]   URL: {}", url);
    debug!("[Auth]   邮箱: {}", email);

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("创建 HTTP 客户端失败")?;

    let response = client
        .post(&url)
        .header("apikey", &config.anon_key)
        .header("Content-Type", "application/json")
        .json(&PasswordLoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })
        .send()
        .await
        .context("登录请求失败")?;

    let status = response.status();
    let text = response.text().await.context("读取登录响应失败")?;
    if !status.is_success() {
        return Err(anyhow!("HTTP 错误 {}: {}", status, text));
    }

    let token: TokenResponse =
        serde_json::from_str(&text).with_context(|| format!("解析登录响应失败，原始响应: {}", text))?;

    let mut session = AuthSession::from_access_token(token.access_token)?;
    session.refresh_token = token.refresh_token;
    if let Some(exp) = token.expires_at {
        session.expires_at = Utc.timestamp_opt(exp, 0).single().or(session.expires_at);
    }
    info!("[Auth] ✅ 登录成功, user={}", session.user_id);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn token_with(payload: &str) -> String {
        let body = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload.as_bytes());
        format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", body)
    }

    #[test]
    fn session_from_token_reads_subject_and_expiry() {
        let session =
            AuthSession::from_access_token(token_with(r#"{"sub":"buyer-1","exp":1700000000}"#))
                .unwrap();
        assert_eq!(session.user_id, "buyer-1");
        assert!(session.is_expired(Utc::now()));
    }

    #[test]
    fn token_without_subject_is_rejected() {
        assert!(AuthSession::from_access_token(token_with(r#"{"role":"anon"}"#)).is_err());
        assert!(AuthSession::from_access_token(token_with(r#"{"sub":""}"#)).is_err());
    }
}
