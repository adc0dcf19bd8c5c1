use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

/// 宽松的时间戳反序列化
///
/// 兼容 RFC3339（`2024-05-01T10:00:00.123+00:00`）、
/// Postgres 文本格式（`2024-05-01 10:00:00.123+00`）以及不带时区的写法（按 UTC 处理）。
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_timestamp(&s).ok_or_else(|| serde::de::Error::custom(format!("无法解析时间戳: {}", s)))
}

/// null 值按类型默认值处理（数据库里布尔列可能为 NULL）
pub fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let opt: Option<T> = Deserialize::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Postgres 文本输出：空格分隔，时区可能只有小时
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// 解码 JWT 的 payload 段（不校验签名，签名由服务端负责）
pub fn decode_jwt_claims(token: &str) -> Result<serde_json::Value, String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| "token 不是合法的 JWT".to_string())?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| format!("JWT payload base64 解码失败: {}", e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("JWT payload 不是合法 JSON: {}", e))
}
