//! 消息内容标记
//!
//! 存量数据的约定（必须逐字节保持兼容）：
//! - 图片：`[IMAGE]<url>`
//! - 文件：`[FILE]<文件名>|<url>`
//! - 其他内容均为纯文本

use std::fmt;

pub const IMAGE_MARKER: &str = "[IMAGE]";
pub const FILE_MARKER: &str = "[FILE]";
pub const FILE_SEPARATOR: char = '|';

/// 文件名为空时写入的默认名
const DEFAULT_FILE_NAME: &str = "file";

/// 解析后的消息内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Image { url: String },
    File { name: String, url: String },
}

impl MessageContent {
    /// 解析原始内容；先检查标记，再按纯文本处理
    pub fn parse(raw: &str) -> Self {
        if let Some(url) = raw.strip_prefix(IMAGE_MARKER) {
            return MessageContent::Image {
                url: url.to_string(),
            };
        }
        if let Some(rest) = raw.strip_prefix(FILE_MARKER) {
            // url 可能包含分隔符，只按第一个切分
            return match rest.split_once(FILE_SEPARATOR) {
                Some((name, url)) => MessageContent::File {
                    name: name.to_string(),
                    url: url.to_string(),
                },
                None => MessageContent::File {
                    name: rest.to_string(),
                    url: String::new(),
                },
            };
        }
        MessageContent::Text(raw.to_string())
    }

    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text(text.into())
    }

    pub fn image(url: impl Into<String>) -> Self {
        MessageContent::Image { url: url.into() }
    }

    pub fn file(name: impl Into<String>, url: impl Into<String>) -> Self {
        MessageContent::File {
            name: name.into(),
            url: url.into(),
        }
    }

    /// 编码为存储格式
    pub fn encode(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Image { url } => format!("{}{}", IMAGE_MARKER, url),
            MessageContent::File { name, url } => {
                let name = if name.is_empty() {
                    DEFAULT_FILE_NAME
                } else {
                    name.as_str()
                };
                format!("{}{}{}{}", FILE_MARKER, name, FILE_SEPARATOR, url)
            }
        }
    }

    pub fn is_attachment(&self) -> bool {
        !matches!(self, MessageContent::Text(_))
    }

    /// 会话列表里展示的摘要
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Image { .. } => "📷 Foto".to_string(),
            MessageContent::File { name, .. } => format!("📎 {}", name),
        }
    }
}

impl fmt::Display for MessageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for MessageContent {
    fn from(raw: &str) -> Self {
        MessageContent::parse(raw)
    }
}
