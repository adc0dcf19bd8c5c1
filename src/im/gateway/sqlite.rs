//! 本地 SQLite 网关（sqlx）
//!
//! 完整实现 [`RemoteGateway`]，用于本地开发、演示和测试：
//! - 表结构与托管平台一致（profiles / cars / conversations / messages / user_presence / blocked_users）
//! - 时间戳以微秒整数存储，并保证严格递增（模拟服务端分配的创建时间）
//! - 每次写入都会在进程内广播一条 [`RowChange`]，订阅按表和过滤条件转发

use crate::im::error::{GatewayError, GatewayResult};
use crate::im::gateway::{ChangeSink, NewMessage, RemoteGateway, SubscriptionHandle};
use crate::im::types::{
    BlockRecord, ChangeKind, Conversation, ListingSummary, Message, Presence, ProfileSummary,
    RowChange, RowFilter, Table,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 变更广播缓冲区大小
const CHANGE_FEED_CAPACITY: usize = 1024;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id          TEXT PRIMARY KEY,
        full_name   TEXT,
        avatar_url  TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cars (
        id       TEXT PRIMARY KEY,
        user_id  TEXT NOT NULL,
        brand    TEXT NOT NULL DEFAULT '',
        model    TEXT NOT NULL DEFAULT '',
        year     INTEGER NOT NULL DEFAULT 0,
        price    INTEGER NOT NULL DEFAULT 0,
        images   TEXT NOT NULL DEFAULT '[]',
        is_sold  INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id               TEXT PRIMARY KEY,
        car_id           TEXT,
        buyer_id         TEXT NOT NULL,
        seller_id        TEXT NOT NULL,
        last_message     TEXT,
        last_message_at  INTEGER NOT NULL,
        created_at       INTEGER NOT NULL,
        CHECK (buyer_id <> seller_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_conversations_buyer ON conversations(buyer_id)",
    "CREATE INDEX IF NOT EXISTS idx_conversations_seller ON conversations(seller_id)",
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
        sender_id        TEXT NOT NULL,
        receiver_id      TEXT NOT NULL,
        content          TEXT NOT NULL,
        is_read          INTEGER NOT NULL DEFAULT 0,
        is_delivered     INTEGER NOT NULL DEFAULT 0,
        created_at       INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS user_presence (
        user_id    TEXT PRIMARY KEY,
        is_online  INTEGER NOT NULL DEFAULT 0,
        last_seen  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS blocked_users (
        id          TEXT PRIMARY KEY,
        blocker_id  TEXT NOT NULL,
        blocked_id  TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        UNIQUE (blocker_id, blocked_id)
    )
    "#,
];

/// 同一 (车源, 买家, 卖家) 只允许一个会话；车源为 NULL 时按空串参与唯一性判断
const UNIQUE_TRIPLE_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_triple \
     ON conversations(IFNULL(car_id, ''), buyer_id, seller_id)";

#[derive(Debug, Clone, Default)]
pub struct SqliteGatewayOptions {
    /// 为会话三元组添加唯一索引，并发首次联系时由约束兜底
    pub enforce_unique_triple: bool,
}

pub struct SqliteGateway {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<RowChange>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    /// 上一次分配的时间戳（微秒）
    last_micros: Mutex<i64>,
}

impl SqliteGateway {
    /// 连接（或创建）数据库并初始化表结构
    pub async fn connect(db_url: &str, options: SqliteGatewayOptions) -> GatewayResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = db_url.contains(":memory:") || db_url.contains("mode=memory");
        // 内存库每个连接都是独立的数据库，必须只用一个且不能回收
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let gateway = Self {
            pool,
            changes,
            subscriptions: Mutex::new(HashMap::new()),
            last_micros: Mutex::new(0),
        };
        gateway.init_schema(&options).await?;
        info!(
            "[SqliteGW] ✅ 数据库已就绪: {} (unique_triple={})",
            db_url, options.enforce_unique_triple
        );
        Ok(gateway)
    }

    pub async fn in_memory() -> GatewayResult<Self> {
        Self::connect("sqlite::memory:", SqliteGatewayOptions::default()).await
    }

    pub async fn in_memory_with(options: SqliteGatewayOptions) -> GatewayResult<Self> {
        Self::connect("sqlite::memory:", options).await
    }

    async fn init_schema(&self, options: &SqliteGatewayOptions) -> GatewayResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        if options.enforce_unique_triple {
            sqlx::query(UNIQUE_TRIPLE_INDEX).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// 写入或更新用户资料（种子数据）
    pub async fn upsert_profile(&self, profile: &ProfileSummary) -> GatewayResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, full_name, avatar_url) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET full_name = excluded.full_name, avatar_url = excluded.avatar_url
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.full_name)
        .bind(&profile.avatar_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 写入或更新车源（种子数据）
    pub async fn upsert_listing(&self, listing: &ListingSummary) -> GatewayResult<()> {
        let images = serde_json::to_string(&listing.images)?;
        sqlx::query(
            r#"
            INSERT INTO cars (id, user_id, brand, model, year, price, images, is_sold)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id, brand = excluded.brand, model = excluded.model,
                year = excluded.year, price = excluded.price, images = excluded.images,
                is_sold = excluded.is_sold
            "#,
        )
        .bind(&listing.id)
        .bind(&listing.user_id)
        .bind(&listing.brand)
        .bind(&listing.model)
        .bind(listing.year)
        .bind(listing.price)
        .bind(images)
        .bind(listing.is_sold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 当前活跃的订阅数
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().map(|subs| subs.len()).unwrap_or(0)
    }

    /// 分配严格递增的服务端时间戳
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let micros = match self.last_micros.lock() {
            Ok(mut last) => {
                let next = now.max(*last + 1);
                *last = next;
                next
            }
            Err(_) => now,
        };
        from_micros(micros)
    }

    fn publish<T: Serialize>(&self, table: Table, kind: ChangeKind, row: &T) {
        let value = match serde_json::to_value(row) {
            Ok(v) => v,
            Err(e) => {
                warn!("[SqliteGW] 变更序列化失败: table={}, err={}", table, e);
                return;
            }
        };
        let change = match kind {
            ChangeKind::Delete => {
                RowChange::new(table, kind, serde_json::Value::Null).with_old_record(value)
            }
            _ => RowChange::new(table, kind, value),
        };
        // 没有订阅者时发送失败是正常情况
        let _ = self.changes.send(change);
    }

    async fn enrich(&self, row: &SqliteRow) -> GatewayResult<Conversation> {
        let mut conversation = row_to_conversation(row)?;
        if let Some(listing_id) = &conversation.listing_id {
            conversation.listing = self.load_listing(listing_id).await?;
        }
        conversation.buyer = self.load_profile(&conversation.buyer_id).await?;
        conversation.seller = self.load_profile(&conversation.seller_id).await?;
        Ok(conversation)
    }

    async fn load_profile(&self, user_id: &str) -> GatewayResult<Option<ProfileSummary>> {
        let row = sqlx::query("SELECT id, full_name, avatar_url FROM profiles WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> GatewayResult<ProfileSummary> {
            Ok(ProfileSummary {
                id: r.try_get("id")?,
                full_name: r.try_get("full_name")?,
                avatar_url: r.try_get("avatar_url")?,
            })
        })
        .transpose()
    }

    async fn load_listing(&self, listing_id: &str) -> GatewayResult<Option<ListingSummary>> {
        let row = sqlx::query("SELECT * FROM cars WHERE id = ?")
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> GatewayResult<ListingSummary> {
            let images: String = r.try_get("images")?;
            Ok(ListingSummary {
                id: r.try_get("id")?,
                user_id: r.try_get("user_id")?,
                brand: r.try_get("brand")?,
                model: r.try_get("model")?,
                year: r.try_get("year")?,
                price: r.try_get("price")?,
                images: serde_json::from_str(&images).unwrap_or_default(),
                is_sold: r.try_get("is_sold")?,
            })
        })
        .transpose()
    }

    /// 写入已提交后的通知；行解析失败只记录日志
    fn publish_decoded<T: Serialize>(&self, table: Table, kind: ChangeKind, row: GatewayResult<T>) {
        match row {
            Ok(row) => self.publish(table, kind, &row),
            Err(e) => warn!("[SqliteGW] 变更行解析失败: table={}, err={}", table, e),
        }
    }
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn timestamp_column(row: &SqliteRow, column: &str) -> GatewayResult<DateTime<Utc>> {
    let micros: i64 = row.try_get(column)?;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| GatewayError::Decode(format!("{} 超出时间范围: {}", column, micros)))
}

fn row_to_conversation(row: &SqliteRow) -> GatewayResult<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        listing_id: row.try_get("car_id")?,
        buyer_id: row.try_get("buyer_id")?,
        seller_id: row.try_get("seller_id")?,
        last_message: row.try_get("last_message")?,
        last_message_at: timestamp_column(row, "last_message_at")?,
        created_at: timestamp_column(row, "created_at")?,
        listing: None,
        buyer: None,
        seller: None,
    })
}

fn row_to_message(row: &SqliteRow) -> GatewayResult<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        receiver_id: row.try_get("receiver_id")?,
        content: row.try_get("content")?,
        is_read: row.try_get("is_read")?,
        is_delivered: row.try_get("is_delivered")?,
        created_at: timestamp_column(row, "created_at")?,
    })
}

fn row_to_block(row: &SqliteRow) -> GatewayResult<BlockRecord> {
    Ok(BlockRecord {
        id: row.try_get("id")?,
        blocker_id: row.try_get("blocker_id")?,
        blocked_id: row.try_get("blocked_id")?,
    })
}

#[async_trait]
impl RemoteGateway for SqliteGateway {
    async fn find_conversation(
        &self,
        listing_id: Option<&str>,
        buyer_id: &str,
        seller_id: &str,
    ) -> GatewayResult<Option<Conversation>> {
        // `IS` 同时匹配 NULL 与具体值
        let row = sqlx::query(
            r#"
            SELECT * FROM conversations
            WHERE car_id IS ? AND buyer_id = ? AND seller_id = ?
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(listing_id)
        .bind(buyer_id)
        .bind(seller_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.enrich(&row).await?)),
            None => Ok(None),
        }
    }

    async fn create_conversation(
        &self,
        listing_id: Option<&str>,
        buyer_id: &str,
        seller_id: &str,
    ) -> GatewayResult<Conversation> {
        let id = Uuid::new_v4().to_string();
        let now = self.next_timestamp();
        sqlx::query(
            r#"
            INSERT INTO conversations (id, car_id, buyer_id, seller_id, last_message, last_message_at, created_at)
            VALUES (?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(listing_id)
        .bind(buyer_id)
        .bind(seller_id)
        .bind(now.timestamp_micros())
        .bind(now.timestamp_micros())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        self.publish_decoded(Table::Conversations, ChangeKind::Insert, row_to_conversation(&row));
        debug!("[SqliteGW] 新建会话 {} ({} -> {})", id, buyer_id, seller_id);
        self.enrich(&row).await
    }

    async fn fetch_conversation(&self, conversation_id: &str) -> GatewayResult<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.enrich(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_conversations(&self, user_id: &str) -> GatewayResult<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM conversations
            WHERE buyer_id = ? OR seller_id = ?
            ORDER BY last_message_at DESC
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in &rows {
            conversations.push(self.enrich(row).await?);
        }
        Ok(conversations)
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let row = sqlx::query(
            "UPDATE conversations SET last_message = ?, last_message_at = ? WHERE id = ? RETURNING *",
        )
        .bind(last_message)
        .bind(at.timestamp_micros())
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| GatewayError::NotFound(format!("conversation {}", conversation_id)))?;
        self.publish_decoded(Table::Conversations, ChangeKind::Update, row_to_conversation(&row));
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await?;
        let message_rows = sqlx::query("DELETE FROM messages WHERE conversation_id = ? RETURNING *")
            .bind(conversation_id)
            .fetch_all(&mut *tx)
            .await?;
        let conversation_row = sqlx::query("DELETE FROM conversations WHERE id = ? RETURNING *")
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;

        for row in &message_rows {
            self.publish_decoded(Table::Messages, ChangeKind::Delete, row_to_message(row));
        }
        match conversation_row {
            Some(row) => {
                self.publish_decoded(Table::Conversations, ChangeKind::Delete, row_to_conversation(&row));
                Ok(())
            }
            None => Err(GatewayError::NotFound(format!(
                "conversation {}",
                conversation_id
            ))),
        }
    }

    async fn insert_message(&self, message: &NewMessage) -> GatewayResult<Message> {
        let stored = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            content: message.content.clone(),
            is_read: false,
            is_delivered: message.is_delivered,
            created_at: self.next_timestamp(),
        };
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, receiver_id, content, is_read, is_delivered, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stored.id)
        .bind(&stored.conversation_id)
        .bind(&stored.sender_id)
        .bind(&stored.receiver_id)
        .bind(&stored.content)
        .bind(stored.is_read)
        .bind(stored.is_delivered)
        .bind(stored.created_at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        self.publish(Table::Messages, ChangeKind::Insert, &stored);
        Ok(stored)
    }

    async fn list_messages(&self, conversation_id: &str) -> GatewayResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn update_messages_read_flag(
        &self,
        conversation_id: &str,
        exclude_sender_id: &str,
    ) -> GatewayResult<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE messages SET is_read = 1, is_delivered = 1
            WHERE conversation_id = ? AND sender_id != ? AND is_read = 0
            RETURNING *
            "#,
        )
        .bind(conversation_id)
        .bind(exclude_sender_id)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            self.publish_decoded(Table::Messages, ChangeKind::Update, row_to_message(row));
        }
        Ok(rows.len() as u64)
    }

    async fn count_unread(&self, conversation_id: &str, user_id: &str) -> GatewayResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ? AND sender_id != ? AND is_read = 0",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_messages(&self, conversation_id: &str) -> GatewayResult<u64> {
        let rows = sqlx::query("DELETE FROM messages WHERE conversation_id = ? RETURNING *")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            self.publish_decoded(Table::Messages, ChangeKind::Delete, row_to_message(row));
        }
        Ok(rows.len() as u64)
    }

    async fn subscribe_row_changes(
        &self,
        table: Table,
        filter: RowFilter,
        sink: ChangeSink,
    ) -> GatewayResult<SubscriptionHandle> {
        let topic = match filter.to_filter_string() {
            Some(f) => format!("{}:{}", table, f),
            None => table.to_string(),
        };
        let handle = SubscriptionHandle::new(topic);
        // 先挂上接收端再返回，保证之后的写入一定能被看到
        let mut receiver = self.changes.subscribe();
        let topic = handle.topic.clone();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(change) => {
                        if !change.matches(table, &filter) {
                            continue;
                        }
                        if sink.send(change).is_err() {
                            debug!("[SqliteGW] 订阅接收端已关闭: {}", topic);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[SqliteGW] 订阅 {} 落后，丢弃 {} 条变更", topic, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(handle.id.clone(), task);
        }
        debug!("[SqliteGW] 新订阅 {} ({})", handle.id, handle.topic);
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> GatewayResult<()> {
        let task = self
            .subscriptions
            .lock()
            .ok()
            .and_then(|mut subs| subs.remove(&handle.id));
        if let Some(task) = task {
            task.abort();
            debug!("[SqliteGW] 取消订阅 {} ({})", handle.id, handle.topic);
        }
        Ok(())
    }

    async fn upsert_presence(
        &self,
        user_id: &str,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let existed: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM user_presence WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        sqlx::query(
            r#"
            INSERT INTO user_presence (user_id, is_online, last_seen) VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET is_online = excluded.is_online, last_seen = excluded.last_seen
            "#,
        )
        .bind(user_id)
        .bind(is_online)
        .bind(last_seen.timestamp_micros())
        .execute(&self.pool)
        .await?;

        let presence = Presence {
            user_id: user_id.to_string(),
            is_online,
            last_seen: from_micros(last_seen.timestamp_micros()),
        };
        let kind = if existed.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        self.publish(Table::UserPresence, kind, &presence);
        Ok(())
    }

    async fn fetch_presence(&self, user_id: &str) -> GatewayResult<Option<Presence>> {
        let row = sqlx::query("SELECT * FROM user_presence WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| -> GatewayResult<Presence> {
            Ok(Presence {
                user_id: r.try_get("user_id")?,
                is_online: r.try_get("is_online")?,
                last_seen: timestamp_column(&r, "last_seen")?,
            })
        })
        .transpose()
    }

    async fn find_block(&self, user_a: &str, user_b: &str) -> GatewayResult<Vec<BlockRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM blocked_users
            WHERE (blocker_id = ? AND blocked_id = ?) OR (blocker_id = ? AND blocked_id = ?)
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .bind(user_b)
        .bind(user_a)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_block).collect()
    }

    async fn upsert_block(&self, blocker_id: &str, blocked_id: &str) -> GatewayResult<BlockRecord> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO blocked_users (id, blocker_id, blocked_id, created_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(blocker_id, blocked_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(blocker_id)
        .bind(blocked_id)
        .bind(self.next_timestamp().timestamp_micros())
        .execute(&self.pool)
        .await?
        .rows_affected();

        let row = sqlx::query("SELECT * FROM blocked_users WHERE blocker_id = ? AND blocked_id = ?")
            .bind(blocker_id)
            .bind(blocked_id)
            .fetch_one(&self.pool)
            .await?;
        let record = row_to_block(&row)?;
        if inserted > 0 {
            self.publish(Table::BlockedUsers, ChangeKind::Insert, &record);
        }
        Ok(record)
    }

    async fn delete_block(&self, user_a: &str, user_b: &str) -> GatewayResult<u64> {
        let rows = sqlx::query(
            r#"
            DELETE FROM blocked_users
            WHERE (blocker_id = ? AND blocked_id = ?) OR (blocker_id = ? AND blocked_id = ?)
            RETURNING *
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .bind(user_b)
        .bind(user_a)
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            self.publish_decoded(Table::BlockedUsers, ChangeKind::Delete, row_to_block(row));
        }
        Ok(rows.len() as u64)
    }
}

impl Drop for SqliteGateway {
    fn drop(&mut self) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            for (_, task) in subs.drain() {
                task.abort();
            }
        }
    }
}
