mod common;

use carchat_sdk_core::im::conversation::ConversationManager;
use carchat_sdk_core::im::error::{ChatError, ValidationError};
use carchat_sdk_core::im::gateway::RemoteGateway;
use carchat_sdk_core::im::message::{
    DeliveryStatus, MessageContent, MessageService, ReadStateTracker, ReadTrigger,
};
use carchat_sdk_core::im::types::Conversation;
use common::{Fault, Fixture, BUYER, LISTING, OTHER, SELLER};
use std::time::Duration;

async fn conversation(fx: &Fixture) -> Conversation {
    ConversationManager::new(fx.ctx(BUYER))
        .get_or_create(Some(LISTING), BUYER, SELLER)
        .await
        .unwrap()
}

#[tokio::test]
async fn receiver_is_always_the_other_participant() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;

    let from_buyer = MessageService::new(fx.ctx(BUYER))
        .send(&conv.id, BUYER, "Halo")
        .await
        .unwrap();
    assert_eq!(from_buyer.sender_id, BUYER);
    assert_eq!(from_buyer.receiver_id, SELLER);
    assert!(!from_buyer.is_read);
    assert!(from_buyer.is_delivered);

    let from_seller = MessageService::new(fx.ctx(SELLER))
        .send(&conv.id, SELLER, "Halo juga")
        .await
        .unwrap();
    assert_eq!(from_seller.receiver_id, BUYER);
}

#[tokio::test]
async fn impersonation_and_outsiders_are_rejected_without_insert() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;

    let err = MessageService::new(fx.ctx(BUYER))
        .send(&conv.id, SELLER, "Saya penjual")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChatError::Validation(ValidationError::SenderMismatch { .. })
    ));

    let err = MessageService::new(fx.ctx(OTHER))
        .send(&conv.id, OTHER, "Numpang")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChatError::Validation(ValidationError::NotParticipant { .. })
    ));

    assert_eq!(fx.gateway.calls("insert_message"), 0);
}

#[tokio::test]
async fn empty_content_is_rejected_before_any_network_call() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    fx.gateway.reset_calls();

    let service = MessageService::new(fx.ctx(BUYER));
    for content in ["", "   ", "\n\t "] {
        let err = service.send(&conv.id, BUYER, content).await.unwrap_err();
        assert_eq!(err.to_string(), ChatError::from(ValidationError::EmptyContent).to_string());
    }
    assert_eq!(fx.gateway.total_calls(), 0);
}

#[tokio::test]
async fn content_is_trimmed_and_snapshot_refreshed() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;

    let sent = MessageService::new(fx.ctx(BUYER))
        .send(&conv.id, BUYER, "  Masih ada?  ")
        .await
        .unwrap();
    assert_eq!(sent.content, "Masih ada?");

    let refreshed = fx.sqlite.fetch_conversation(&conv.id).await.unwrap().unwrap();
    assert_eq!(refreshed.last_message.as_deref(), Some("Masih ada?"));
    assert_eq!(refreshed.last_message_at, sent.created_at);
}

#[tokio::test]
async fn insert_failure_is_a_creation_error() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    fx.gateway.set_fault(Fault::Insert, true);

    let err = MessageService::new(fx.ctx(BUYER))
        .send(&conv.id, BUYER, "Halo")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Creation(_)), "{err:?}");
    assert_eq!(fx.gateway.calls("touch_conversation"), 0);
}

#[tokio::test]
async fn mark_read_is_idempotent() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let seller = MessageService::new(fx.ctx(SELLER));
    seller.send(&conv.id, SELLER, "Satu").await.unwrap();
    seller.send(&conv.id, SELLER, "Dua").await.unwrap();

    let buyer = MessageService::new(fx.ctx(BUYER));
    assert_eq!(buyer.mark_read(&conv.id, BUYER).await.unwrap(), 2);
    assert_eq!(buyer.mark_read(&conv.id, BUYER).await.unwrap(), 0);
    assert_eq!(buyer.unread_count(&conv.id, BUYER).await.unwrap(), 0);
}

#[tokio::test]
async fn read_and_delivered_flags_never_regress() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let seller = MessageService::new(fx.ctx(SELLER));
    let buyer = MessageService::new(fx.ctx(BUYER));

    seller.send(&conv.id, SELLER, "Satu").await.unwrap();
    buyer.mark_read(&conv.id, BUYER).await.unwrap();
    // 自己发的消息不会被自己的标记已读影响
    buyer.send(&conv.id, BUYER, "Oke").await.unwrap();
    buyer.mark_read(&conv.id, BUYER).await.unwrap();
    seller.mark_read(&conv.id, SELLER).await.unwrap();
    seller.send(&conv.id, SELLER, "Dua").await.unwrap();

    let history = buyer.fetch_history(&conv.id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].is_read && history[0].is_delivered);
    assert!(history[1].is_read && history[1].is_delivered);
    assert!(!history[2].is_read);

    // 旧快照合并进新行不会回退标记
    let mut local = history[0].clone();
    let mut stale = history[0].clone();
    stale.is_read = false;
    stale.is_delivered = false;
    local.merge_from(stale);
    assert!(local.is_read && local.is_delivered);
}

#[tokio::test]
async fn history_is_ordered_by_creation_time() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let buyer = MessageService::new(fx.ctx(BUYER));
    let seller = MessageService::new(fx.ctx(SELLER));
    for i in 0..5 {
        buyer.send(&conv.id, BUYER, &format!("b{i}")).await.unwrap();
        seller.send(&conv.id, SELLER, &format!("s{i}")).await.unwrap();
    }

    let history = buyer.fetch_history(&conv.id).await.unwrap();
    assert_eq!(history.len(), 10);
    assert!(history
        .windows(2)
        .all(|pair| pair[0].created_at <= pair[1].created_at));
    assert_eq!(history[0].content, "b0");
    assert_eq!(history[9].content, "s4");
}

#[tokio::test]
async fn tagged_content_survives_storage() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let buyer = MessageService::new(fx.ctx(BUYER));
    buyer
        .send(&conv.id, BUYER, "[IMAGE]https://x/y.png")
        .await
        .unwrap();
    buyer
        .send(&conv.id, BUYER, "[FILE]report.pdf|https://x/z.pdf")
        .await
        .unwrap();

    let history = buyer.fetch_history(&conv.id).await.unwrap();
    assert_eq!(
        history[0].parsed_content(),
        MessageContent::Image {
            url: "https://x/y.png".into()
        }
    );
    assert_eq!(
        history[1].parsed_content(),
        MessageContent::File {
            name: "report.pdf".into(),
            url: "https://x/z.pdf".into()
        }
    );
}

#[tokio::test]
async fn total_unread_sums_all_conversations() {
    let fx = Fixture::new().await;
    let with_seller = conversation(&fx).await;
    let with_other = ConversationManager::new(fx.ctx(BUYER))
        .get_or_create(None, BUYER, OTHER)
        .await
        .unwrap();
    MessageService::new(fx.ctx(SELLER))
        .send(&with_seller.id, SELLER, "Satu")
        .await
        .unwrap();
    let other = MessageService::new(fx.ctx(OTHER));
    other.send(&with_other.id, OTHER, "Dua").await.unwrap();
    other.send(&with_other.id, OTHER, "Tiga").await.unwrap();

    let buyer = MessageService::new(fx.ctx(BUYER));
    assert_eq!(buyer.total_unread_count(BUYER).await.unwrap(), 3);
    buyer.mark_read(&with_other.id, BUYER).await.unwrap();
    assert_eq!(buyer.total_unread_count(BUYER).await.unwrap(), 1);
}

#[tokio::test]
async fn clear_is_participant_only() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let buyer = MessageService::new(fx.ctx(BUYER));
    buyer.send(&conv.id, BUYER, "Satu").await.unwrap();
    buyer.send(&conv.id, BUYER, "Dua").await.unwrap();

    let err = MessageService::new(fx.ctx(OTHER))
        .clear(&conv.id, OTHER)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    assert_eq!(buyer.clear(&conv.id, BUYER).await.unwrap(), 2);
    assert!(buyer.fetch_history(&conv.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn delivery_status_follows_flags() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    let sent = MessageService::new(fx.ctx(BUYER))
        .send(&conv.id, BUYER, "Halo")
        .await
        .unwrap();
    assert_eq!(
        DeliveryStatus::for_message(&sent, BUYER),
        Some(DeliveryStatus::Delivered)
    );
    assert_eq!(DeliveryStatus::for_message(&sent, SELLER), None);

    MessageService::new(fx.ctx(SELLER))
        .mark_read(&conv.id, SELLER)
        .await
        .unwrap();
    let read = &fx.sqlite.list_messages(&conv.id).await.unwrap()[0];
    assert_eq!(
        DeliveryStatus::for_message(read, BUYER),
        Some(DeliveryStatus::Read)
    );
}

#[tokio::test]
async fn scheduled_mark_read_is_debounced_and_cancellable() {
    let fx = Fixture::new().await;
    let conv = conversation(&fx).await;
    MessageService::new(fx.ctx(SELLER))
        .send(&conv.id, SELLER, "Halo")
        .await
        .unwrap();

    let tracker = ReadStateTracker::new(
        MessageService::new(fx.ctx(BUYER)),
        fx.config.clone(),
        conv.id.clone(),
        BUYER,
    );

    // 取消后不会写入
    tracker.schedule(ReadTrigger::Focus);
    tracker.cancel();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(fx.gateway.calls("update_messages_read_flag"), 0);

    // 连续调度只执行最后一次
    tracker.schedule(ReadTrigger::Focus);
    tracker.schedule(ReadTrigger::Inbound);
    tracker.schedule(ReadTrigger::Foreground);
    assert!(tracker.has_pending());
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(fx.gateway.calls("update_messages_read_flag"), 1);
    assert_eq!(
        fx.sqlite.count_unread(&conv.id, BUYER).await.unwrap(),
        0
    );
}
