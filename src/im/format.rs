//! 展示格式化（时间、预览截断）

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};

/// 印尼语月份缩写
pub const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "Mei", "Jun", "Jul", "Ags", "Sep", "Okt", "Nov", "Des",
];

pub const YESTERDAY_LABEL: &str = "Kemarin";

/// 气泡里的消息时间：`HH:MM`
pub fn format_message_time(at: DateTime<Utc>, offset: FixedOffset) -> String {
    let local = at.with_timezone(&offset);
    format!("{:02}:{:02}", local.hour(), local.minute())
}

/// 会话列表时间：当天显示 `HH:MM`，48 小时内显示"昨天"，更早显示 `日 月`
pub fn format_list_time(at: DateTime<Utc>, now: DateTime<Utc>, offset: FixedOffset) -> String {
    let local = at.with_timezone(&offset);
    let local_now = now.with_timezone(&offset);
    let elapsed = now.signed_duration_since(at);

    if elapsed < chrono::Duration::hours(24) && local.date_naive() == local_now.date_naive() {
        format!("{:02}:{:02}", local.hour(), local.minute())
    } else if elapsed < chrono::Duration::hours(48) {
        YESTERDAY_LABEL.to_string()
    } else {
        let month = MONTH_NAMES[local.month0() as usize];
        format!("{} {}", local.day(), month)
    }
}

/// 按字符截断预览，超长追加 `...`
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
