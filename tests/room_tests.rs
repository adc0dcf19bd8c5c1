mod common;

use carchat_sdk_core::im::block::{BlockService, BlockStatus};
use carchat_sdk_core::im::conversation::ConversationManager;
use carchat_sdk_core::im::error::{ChatError, ValidationError};
use carchat_sdk_core::im::gateway::RemoteGateway;
use carchat_sdk_core::im::message::MessageService;
use carchat_sdk_core::im::presence::{AppState, EmptyPresenceListener};
use carchat_sdk_core::im::realtime::SubscriptionState;
use carchat_sdk_core::im::room::ChatRoom;
use carchat_sdk_core::im::types::Conversation;
use common::{
    eventually, Fault, Fixture, RecordingMessageListener, RoomEvent, BUYER, LISTING, OTHER, SELLER,
};
use std::sync::Arc;
use std::time::Duration;

async fn conversation(fx: &Fixture) -> Conversation {
    ConversationManager::new(fx.ctx(BUYER))
        .get_or_create(Some(LISTING), BUYER, SELLER)
        .await
        .unwrap()
}

async fn open_recorded(fx: &Fixture, user: &str, id: &str) -> (ChatRoom, Arc<RecordingMessageListener>) {
    let listener = Arc::new(RecordingMessageListener::default());
    let room = ChatRoom::open_with_listeners(
        fx.ctx(user),
        id,
        listener.clone(),
        Arc::new(EmptyPresenceListener),
    )
    .await
    .unwrap();
    (room, listener)
}

#[tokio::test]
async fn open_requires_existing_conversation_and_participation() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;

    let err = ChatRoom::open(fx.ctx(OTHER), &conv.id).await.err().unwrap();
    assert!(matches!(
        err,
        ChatError::Validation(ValidationError::NotParticipant { .. })
    ));
    let err = ChatRoom::open(fx.ctx(BUYER), "missing").await.err().unwrap();
    assert!(matches!(err, ChatError::ConversationNotFound(_)));

    fx.gateway.set_fault(Fault::Find, true);
    let err = ChatRoom::open(fx.ctx(BUYER), &conv.id).await.err().unwrap();
    assert!(matches!(err, ChatError::Lookup(_)));
}

#[tokio::test]
async fn open_loads_history_and_reports_counterpart() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    MessageService::new(fx.ctx(SELLER))
        .send(&conv.id, SELLER, "Selamat datang")
        .await
        .unwrap();

    let (room, listener) = open_recorded(&fx, BUYER, &conv.id).await;
    assert_eq!(room.counterpart_id(), SELLER);
    assert_eq!(room.conversation().id, conv.id);
    assert_eq!(room.messages().len(), 1);
    assert!(listener.events().contains(&RoomEvent::History(1)));
    // 打开即已读
    assert_eq!(fx.sqlite.count_unread(&conv.id, BUYER).await.unwrap(), 0);
    // 心跳已启动
    assert!(eventually(|| fx.gateway.calls("upsert_presence") > 0).await);

    room.close().await;
    assert_eq!(
        fx.sqlite.fetch_presence(BUYER).await.unwrap().map(|p| p.is_online),
        Some(false)
    );
}

#[tokio::test]
async fn failed_send_restores_draft_without_leftovers() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let (room, _listener) = open_recorded(&fx, BUYER, &conv.id).await;

    fx.gateway.set_fault(Fault::Insert, true);
    let failure = room.send("Harga nego?").await.unwrap_err();
    assert_eq!(failure.draft, "Harga nego?");
    assert!(matches!(failure.error, ChatError::Creation(_)));
    assert!(room.entries().is_empty());

    fx.gateway.set_fault(Fault::Insert, false);
    let sent = room.send("Harga nego?").await.unwrap();
    let entries = room.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message_id(), Some(sent.id.as_str()));

    room.close().await;
}

#[tokio::test]
async fn empty_send_makes_no_gateway_calls() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let (room, _listener) = open_recorded(&fx, BUYER, &conv.id).await;
    // 等打开时的后台写入完成
    tokio::time::sleep(Duration::from_millis(20)).await;
    fx.gateway.reset_calls();

    let failure = room.send("   ").await.unwrap_err();
    assert_eq!(failure.draft, "   ");
    assert!(failure.error.is_validation());
    assert_eq!(fx.gateway.calls("insert_message"), 0);
    assert_eq!(fx.gateway.calls("fetch_conversation"), 0);
    assert!(room.entries().is_empty());

    room.close().await;
}

#[tokio::test]
async fn blocked_conversation_refuses_to_send() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let (room, listener) = open_recorded(&fx, BUYER, &conv.id).await;
    assert_eq!(room.block_status(), BlockStatus::None);

    BlockService::new(fx.ctx(SELLER)).block(BUYER).await.unwrap();
    assert!(eventually(|| room.block_status() == BlockStatus::BlockedByOther).await);
    assert!(listener
        .events()
        .contains(&RoomEvent::Block(BlockStatus::BlockedByOther)));

    let failure = room.send("Halo?").await.unwrap_err();
    assert!(matches!(
        failure.error,
        ChatError::Validation(ValidationError::Blocked { by_self: false })
    ));
    assert_eq!(fx.gateway.calls("insert_message"), 0);

    // 自己也屏蔽对方后，状态以自己为准；解除后双方向都被清掉
    assert_eq!(
        room.block_counterpart().await.unwrap(),
        BlockStatus::BlockedBySelf
    );
    assert_eq!(room.unblock_counterpart().await.unwrap(), BlockStatus::None);
    assert!(fx.sqlite.find_block(BUYER, SELLER).await.unwrap().is_empty());

    room.send("Halo lagi").await.unwrap();
    room.close().await;
}

#[tokio::test]
async fn inbound_messages_are_marked_read_only_while_focused() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let (room, listener) = open_recorded(&fx, SELLER, &conv.id).await;
    let buyer = MessageService::new(fx.ctx(BUYER));

    buyer.send(&conv.id, BUYER, "Satu").await.unwrap();
    assert!(eventually(|| listener.new_messages().len() == 1).await);
    assert!(
        eventually_unread(&fx, &conv.id, SELLER, 0).await,
        "focused room marks inbound read"
    );

    room.blur();
    buyer.send(&conv.id, BUYER, "Dua").await.unwrap();
    assert!(eventually(|| listener.new_messages().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.sqlite.count_unread(&conv.id, SELLER).await.unwrap(), 1);

    room.focus().await;
    assert!(eventually_unread(&fx, &conv.id, SELLER, 0).await);

    room.close().await;
}

async fn eventually_unread(fx: &Fixture, conversation_id: &str, user: &str, expected: u64) -> bool {
    for _ in 0..100 {
        if fx.sqlite.count_unread(conversation_id, user).await.unwrap() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn message_stored_while_opening_reaches_the_timeline() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    // 历史读取完成后、房间开始消费事件前，卖家发来一条消息
    fx.gateway
        .send_after_next("list_messages", fx.ctx(SELLER), &conv.id, "Masih ada?");

    let (room, listener) = open_recorded(&fx, BUYER, &conv.id).await;
    assert!(listener.events().contains(&RoomEvent::History(0)));
    assert!(eventually(|| room.messages().len() == 1).await);
    assert_eq!(room.messages()[0].content, "Masih ada?");
    assert_eq!(listener.new_messages().len(), 1);
    assert!(eventually_unread(&fx, &conv.id, BUYER, 0).await);

    room.close().await;
}

#[tokio::test]
async fn focus_recovers_messages_the_subscription_missed() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    fx.gateway.set_fault(Fault::Subscribe, true);
    let (room, listener) = open_recorded(&fx, BUYER, &conv.id).await;
    assert_eq!(room.subscription_state().await, SubscriptionState::Error);

    room.blur();
    MessageService::new(fx.ctx(SELLER))
        .send(&conv.id, SELLER, "Halo")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(room.messages().is_empty());

    // 重新聚焦时补拉历史，并把补到的消息标记已读
    room.focus().await;
    assert_eq!(room.messages().len(), 1);
    assert_eq!(room.messages()[0].content, "Halo");
    assert!(listener.events().contains(&RoomEvent::History(1)));
    assert!(eventually_unread(&fx, &conv.id, BUYER, 0).await);

    room.close().await;
}

#[tokio::test]
async fn each_send_is_confirmed_once() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let (room, listener) = open_recorded(&fx, BUYER, &conv.id).await;

    let first = room.send("Halo").await.unwrap();
    let second = room.send("Halo").await.unwrap();
    let third = room.send("Mobilnya masih ada?").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = listener.events();
    for sent in [&first, &second, &third] {
        let confirmations = events
            .iter()
            .filter(|e| matches!(e, RoomEvent::Confirmed(m) if m.id == sent.id))
            .count();
        assert_eq!(confirmations, 1, "message {} confirmed once", sent.id);
    }
    assert_eq!(room.messages().len(), 3);
    assert!(room.entries().iter().all(|e| !e.is_pending()));

    room.close().await;
}

#[tokio::test]
async fn app_state_drives_presence_and_read_state() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let (room, _listener) = open_recorded(&fx, SELLER, &conv.id).await;

    room.set_app_state(AppState::Background).await;
    assert_eq!(
        fx.sqlite.fetch_presence(SELLER).await.unwrap().map(|p| p.is_online),
        Some(false)
    );

    // 后台期间收到的消息保持未读
    MessageService::new(fx.ctx(BUYER))
        .send(&conv.id, BUYER, "Halo")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fx.sqlite.count_unread(&conv.id, SELLER).await.unwrap(), 1);

    room.blur();
    room.set_app_state(AppState::Active).await;
    assert_eq!(
        fx.sqlite.fetch_presence(SELLER).await.unwrap().map(|p| p.is_online),
        Some(true)
    );
    // 未聚焦时回到前台不会标记
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(fx.sqlite.count_unread(&conv.id, SELLER).await.unwrap(), 1);

    // 聚焦后回到前台立即调度
    room.focus().await;
    room.set_app_state(AppState::Background).await;
    room.set_app_state(AppState::Active).await;
    assert!(eventually_unread(&fx, &conv.id, SELLER, 0).await);

    room.close().await;
}

#[tokio::test]
async fn clear_and_delete_from_the_room() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let (room, listener) = open_recorded(&fx, BUYER, &conv.id).await;
    room.send("Satu").await.unwrap();
    room.send("Dua").await.unwrap();

    assert_eq!(room.clear_messages().await.unwrap(), 2);
    assert!(room.entries().is_empty());
    // 随后到达的删除事件不会让时间线出错
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(room.entries().is_empty());
    assert!(listener.new_messages().is_empty());

    room.delete_conversation().await.unwrap();
    assert!(room.is_closed());
    assert!(fx.sqlite.fetch_conversation(&conv.id).await.unwrap().is_none());
    assert_eq!(fx.sqlite.active_subscriptions(), 0);
}
