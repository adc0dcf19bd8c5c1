//! 二手车聊天 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示聊天功能：
//! - `inbox`：监听会话列表和未读数
//! - `room`：打开一个聊天页，标准输入的每一行作为一条消息发送
//! - `contact`：以买家身份联系卖家
//! - `demo`：使用内存 SQLite 网关，两个用户在同一进程内对话

use anyhow::{anyhow, Context, Result};
use carchat_sdk_core::im::conversation::{ConversationListener, InboxItem};
use carchat_sdk_core::im::format::format_message_time;
use carchat_sdk_core::im::gateway::SqliteGateway;
use carchat_sdk_core::im::message::MessageListener;
use carchat_sdk_core::im::presence::PresenceListener;
use carchat_sdk_core::im::realtime::SubscriptionState;
use carchat_sdk_core::im::types::{ListingSummary, ProfileSummary};
use carchat_sdk_core::{
    sign_in_with_password, AuthSession, BlockStatus, ChatClient, ChatConfig, Conversation,
    Message,
};
use chrono::{FixedOffset, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

/// 二手车聊天 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "carchat-cli")]
#[command(about = "二手车聊天 CLI 客户端 - 用于测试和展示聊天功能", long_about = None)]
struct Args {
    /// 访问令牌（未指定时读取环境变量 CARCHAT_ACCESS_TOKEN）
    #[arg(long, global = true)]
    token: Option<String>,

    /// 登录邮箱（与 --password 一起使用）
    #[arg(long, global = true)]
    email: Option<String>,

    /// 登录密码
    #[arg(long, global = true)]
    password: Option<String>,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0", global = true)]
    duration: u64,

    /// 日志级别（默认: info,carchat_sdk_core=debug）
    #[arg(long, default_value = "info,carchat_sdk_core=debug", global = true)]
    log_level: String,

    /// 日志文件
    #[arg(long, default_value = "debug.log", global = true)]
    log_file: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 监听会话列表和总未读数
    Inbox,
    /// 打开聊天页，标准输入每行发送一条消息
    Room {
        /// 会话 ID
        #[arg(short, long)]
        conversation: String,
        /// 只发送这一条消息，不读取标准输入
        #[arg(long)]
        send: Option<String>,
    },
    /// 以买家身份联系卖家
    Contact {
        /// 卖家用户 ID
        #[arg(short, long)]
        seller: String,
        /// 车源 ID（可选）
        #[arg(short, long)]
        listing: Option<String>,
    },
    /// 本地演示：内存数据库中两个用户互发消息
    Demo,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str, log_file: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("无法创建日志文件 {}", log_file))?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: {}", log_file);
    Ok(())
}

struct CliConversationListener {
    label: String,
    offset: FixedOffset,
    preview_max_chars: usize,
}

#[async_trait::async_trait]
impl ConversationListener for CliConversationListener {
    async fn on_conversation_list_changed(&self, items: Vec<InboxItem>) {
        info!("[CLI/{}] 📋 会话列表（共 {} 个）:", self.label, items.len());
        let now = Utc::now();
        for item in &items {
            info!(
                "[CLI/{}]   - {} | 未读: {} | {} | {}",
                self.label,
                item.entry.display_name(),
                item.unread_count,
                item.entry.list_time(now, self.offset),
                item.entry.preview(self.preview_max_chars)
            );
        }
    }

    async fn on_total_unread_changed(&self, total: u64) {
        info!("[CLI/{}] 📬 总未读数: {}", self.label, total);
    }

    async fn on_new_conversation(&self, conversation: Conversation) {
        info!("[CLI/{}] 🆕 新会话: {}", self.label, conversation.id);
    }
}

struct CliMessageListener {
    label: String,
    offset: FixedOffset,
}

impl CliMessageListener {
    fn line(&self, message: &Message) -> String {
        format!(
            "[{}] {}: {}",
            format_message_time(message.created_at, self.offset),
            message.sender_id,
            message.parsed_content()
        )
    }
}

#[async_trait::async_trait]
impl MessageListener for CliMessageListener {
    async fn on_history_loaded(&self, messages: Vec<Message>) {
        info!("[CLI/{}] 📜 历史消息 {} 条", self.label, messages.len());
        for message in &messages {
            info!("[CLI/{}]   {}", self.label, self.line(message));
        }
    }

    async fn on_recv_new_message(&self, message: Message) {
        info!("[CLI/{}] 📨 {}", self.label, self.line(&message));
    }

    async fn on_message_confirmed(&self, message: Message) {
        info!("[CLI/{}] ✅ 已发送 {}", self.label, self.line(&message));
    }

    async fn on_message_updated(&self, message: Message) {
        info!(
            "[CLI/{}] 🔄 消息 {} 已读={}",
            self.label, message.id, message.is_read
        );
    }

    async fn on_message_removed(&self, message_id: String) {
        info!("[CLI/{}] 🗑️ 消息删除: {}", self.label, message_id);
    }

    async fn on_block_status_changed(&self, status: BlockStatus) {
        warn!("[CLI/{}] 🚫 屏蔽状态: {:?}", self.label, status);
    }

    async fn on_subscription_state_changed(&self, state: SubscriptionState) {
        if state == SubscriptionState::Error {
            error!("[CLI/{}] 🔗 实时订阅失效，退化为手动刷新", self.label);
        } else {
            info!("[CLI/{}] 🔗 订阅状态: {}", self.label, state);
        }
    }
}

struct CliPresenceListener {
    label: String,
}

#[async_trait::async_trait]
impl PresenceListener for CliPresenceListener {
    async fn on_presence_changed(&self, user_id: String, is_online: bool) {
        info!(
            "[CLI/{}] 👤 {} {}",
            self.label,
            user_id,
            if is_online { "在线" } else { "离线" }
        );
    }
}

fn setup_listeners(client: &mut ChatClient, label: &str) {
    let config = client.context().config();
    let offset = config.display_offset();
    let preview_max_chars = config.preview_max_chars;
    client.set_conversation_listener(Arc::new(CliConversationListener {
        label: label.to_string(),
        offset,
        preview_max_chars,
    }));
    client.set_message_listener(Arc::new(CliMessageListener {
        label: label.to_string(),
        offset,
    }));
    client.set_presence_listener(Arc::new(CliPresenceListener {
        label: label.to_string(),
    }));
}

async fn login(args: &Args, config: &ChatConfig) -> Result<AuthSession> {
    let token = args
        .token
        .clone()
        .or_else(|| std::env::var("CARCHAT_ACCESS_TOKEN").ok());
    if let Some(token) = token {
        return AuthSession::from_access_token(token);
    }
    match (&args.email, &args.password) {
        (Some(email), Some(password)) => sign_in_with_password(config, email, password).await,
        _ => Err(anyhow!(
            "需要 --token（或 CARCHAT_ACCESS_TOKEN），或者同时提供 --email 和 --password"
        )),
    }
}

async fn wait(duration: u64) {
    if duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", duration);
        sleep(Duration::from_secs(duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[CLI] 等待 Ctrl+C 失败: {}", e);
        }
    }
}

async fn connect(args: &Args) -> Result<ChatClient> {
    let config = ChatConfig::from_env()?;
    info!("[CLI] 🔐 正在登录...");
    let session = login(args, &config).await?;
    info!("[CLI] ✅ 登录成功！用户ID: {}", session.user_id);
    let mut client = ChatClient::connect(config, session).await?;
    setup_listeners(&mut client, "Me");
    Ok(client)
}

async fn run_inbox(args: &Args) -> Result<()> {
    let mut client = connect(args).await?;
    client.watch_inbox().await?;
    info!("[CLI] 📥 开始监听会话...");
    wait(args.duration).await;
    client.shutdown().await;
    Ok(())
}

async fn run_room(args: &Args, conversation_id: &str, text: Option<&str>) -> Result<()> {
    let mut client = connect(args).await?;
    let room = client.open_room(conversation_id).await?;

    if let Some(text) = text {
        match room.send(text).await {
            Ok(message) => info!("[CLI] ✅ 消息已发送: {}", message.id),
            Err(failure) => error!("[CLI] ❌ {}（草稿: {}）", failure, failure.draft),
        }
        if args.duration > 0 {
            wait(args.duration).await;
        }
        room.close().await;
        client.shutdown().await;
        return Ok(());
    }
    info!(
        "[CLI] 💬 已打开聊天 {}，对方 {}；输入内容后回车发送",
        conversation_id,
        room.counterpart_id()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let deadline = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let input = async {
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if let Err(failure) = room.send(&line).await {
                error!("[CLI] ❌ {}（草稿: {}）", failure, failure.draft);
            }
        }
    };
    match deadline {
        Some(limit) => {
            let _ = tokio::time::timeout(limit, input).await;
        }
        None => input.await,
    }

    room.close().await;
    client.shutdown().await;
    Ok(())
}

async fn run_contact(args: &Args, seller_id: &str, listing_id: Option<&str>) -> Result<()> {
    let mut client = connect(args).await?;
    let conversation = client.contact_seller(listing_id, seller_id).await?;
    match conversation.listing.as_ref() {
        Some(listing) => info!("[CLI] ✅ 会话 ID: {}（车源: {}）", conversation.id, listing.title()),
        None => info!("[CLI] ✅ 会话 ID: {}", conversation.id),
    }
    println!("{}", conversation.id);
    client.shutdown().await;
    Ok(())
}

async fn run_demo(args: &Args) -> Result<()> {
    info!("[CLI] 🧪 本地演示模式（内存 SQLite）");
    let gateway = Arc::new(SqliteGateway::in_memory().await?);
    gateway
        .upsert_profile(&ProfileSummary {
            id: "buyer-1".into(),
            full_name: Some("Budi".into()),
            avatar_url: None,
        })
        .await?;
    gateway
        .upsert_profile(&ProfileSummary {
            id: "seller-1".into(),
            full_name: Some("Sari".into()),
            avatar_url: None,
        })
        .await?;
    gateway
        .upsert_listing(&ListingSummary {
            id: "car-1".into(),
            user_id: "seller-1".into(),
            brand: "Toyota".into(),
            model: "Avanza".into(),
            year: 2019,
            price: 165_000_000,
            images: vec!["https://img.example/avanza.jpg".into()],
            is_sold: false,
        })
        .await?;

    let config = ChatConfig::default();
    let mut buyer = ChatClient::with_gateway("buyer-1", gateway.clone(), config.clone());
    let mut seller = ChatClient::with_gateway("seller-1", gateway.clone(), config);
    setup_listeners(&mut buyer, "Budi");
    setup_listeners(&mut seller, "Sari");
    seller.watch_inbox().await?;

    let conversation = buyer.contact_seller(Some("car-1"), "seller-1").await?;
    let buyer_room = buyer.open_room(&conversation.id).await?;
    buyer_room
        .send("Halo, mobilnya masih ada?")
        .await
        .map_err(|f| anyhow!(f.to_string()))?;
    sleep(Duration::from_millis(100)).await;

    info!(
        "[CLI] 📬 Sari 未读数: {}",
        seller.total_unread_count().await?
    );
    let seller_room = seller.open_room(&conversation.id).await?;
    seller_room
        .send("Masih, silakan lihat dulu")
        .await
        .map_err(|f| anyhow!(f.to_string()))?;
    buyer_room
        .send("[IMAGE]https://img.example/ktp.jpg")
        .await
        .map_err(|f| anyhow!(f.to_string()))?;

    sleep(Duration::from_millis(500)).await;
    info!(
        "[CLI] 📬 Sari 未读数: {}（聊天页聚焦中会自动已读）",
        seller.total_unread_count().await?
    );
    for entry in buyer_room.entries() {
        info!(
            "[CLI]   {} {} {:?}",
            entry.sender_id(),
            entry.content(),
            entry.delivery_status("buyer-1")
        );
    }

    if args.duration > 0 {
        wait(args.duration).await;
    }
    buyer_room.close().await;
    seller_room.close().await;
    seller.shutdown().await;
    buyer.shutdown().await;
    info!("[CLI] 👋 演示结束");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level, &args.log_file)?;

    info!("[CLI] 🚀 二手车聊天 CLI 客户端（测试模式）");
    match &args.command {
        Command::Inbox => run_inbox(&args).await,
        Command::Room { conversation, send } => {
            run_room(&args, conversation, send.as_deref()).await
        }
        Command::Contact { seller, listing } => {
            run_contact(&args, seller, listing.as_deref()).await
        }
        Command::Demo => run_demo(&args).await,
    }
}
