//! Connection lifecycle integration tests.
//!
//! - basket-level connect and disconnect events
//! - parked requests replayed once a backend connects
//! - reset, adapter removal and late registration

mod common;

use basket_adapter::{MessageAdapter, SimBehavior};
use basket_core::{
    Capabilities, DataKind, DisconnectMessage, InstrumentLookup, MarketDataRequest, Message,
    MessageKind, ReplyErrorKind, ResetMessage,
};
use basket_routing::{ConnectionState, RouterConfig};
use common::{aapl, count_of, is_response_for, test_config, Harness};

fn refusing() -> SimBehavior {
    SimBehavior {
        fail_connect: true,
        ..Default::default()
    }
}

fn ticks() -> Capabilities {
    Capabilities::new().with_market_data(DataKind::Ticks)
}

#[tokio::test]
async fn test_connect_fails_when_every_backend_fails() {
    let mut h = Harness::new();
    h.add_with("a", ticks(), refusing());
    h.add_with("b", ticks(), refusing());

    match h.connect().await {
        Message::Connect(c) => {
            let error = c.error.expect("connect error");
            assert_eq!(error.kind, ReplyErrorKind::Aggregate);
            assert_eq!(error.inner.len(), 2);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h
        .router
        .connection_states()
        .iter()
        .all(|s| s.state == ConnectionState::Failed));
}

#[tokio::test]
async fn test_connect_succeeds_with_one_backend_up() {
    let mut h = Harness::with_config(RouterConfig {
        connect_event_on_first_adapter: true,
        ..test_config()
    });
    h.add_with("down", ticks(), refusing());
    let up = h.add("up", ticks());

    assert_eq!(h.connect().await, Message::Connect(Default::default()));
    // Exactly one basket-level connect event.
    assert!(!h
        .drain()
        .await
        .iter()
        .any(|m| matches!(m, Message::Connect(_))));

    let tx = h.next_id();
    h.send(MarketDataRequest::subscribe(tx, DataKind::Ticks, Some(aapl())));
    h.recv_until(|m| matches!(m, Message::SubscriptionOnline(_)))
        .await;
    assert_eq!(count_of(&up, MessageKind::MarketData), 1);
}

#[tokio::test]
async fn test_parked_request_replayed_after_connect() {
    let mut h = Harness::new();
    let tx = h.next_id();
    h.send(InstrumentLookup::new(tx, Some(aapl())));
    assert!(h.drain().await.is_empty());

    let sim = h.add_with(
        "late",
        Capabilities::new().with_message_kind(MessageKind::InstrumentLookup),
        SimBehavior {
            securities: vec![aapl()],
            ..Default::default()
        },
    );
    h.connect().await;

    let replies = h
        .recv_until(|m| matches!(m, Message::SubscriptionFinished(_)))
        .await;
    assert_eq!(count_of(&sim, MessageKind::InstrumentLookup), 1);
    assert!(replies.iter().any(|m| matches!(m, Message::Instrument(_))));
    h.assert_caller_ids(&replies);
}

#[tokio::test]
async fn test_request_without_connected_backend_fails() {
    let mut h = Harness::new();
    h.add("idle", ticks());

    let tx = h.next_id();
    h.send(MarketDataRequest::subscribe(tx, DataKind::Ticks, Some(aapl())));
    let replies = h.recv_until(is_response_for(tx)).await;
    match replies.last() {
        Some(Message::SubscriptionResponse(r)) => {
            assert_eq!(r.error.as_ref().unwrap().kind, ReplyErrorKind::Connection)
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_reset_clears_subscriptions() {
    let mut h = Harness::new();
    let sim = h.add("sim", ticks());
    h.connect().await;

    let tx = h.next_id();
    h.send(MarketDataRequest::subscribe(tx, DataKind::Ticks, Some(aapl())));
    h.recv_until(|m| matches!(m, Message::SubscriptionOnline(_)))
        .await;
    assert_eq!(h.router.subscribers(DataKind::Ticks), vec![tx]);

    let reset = h.next_id();
    h.send(ResetMessage {
        transaction_id: reset,
    });
    assert!(h.router.subscribers(DataKind::Ticks).is_empty());
    assert_eq!(count_of(&sim, MessageKind::Reset), 1);
    assert!(h
        .router
        .connection_states()
        .iter()
        .all(|s| s.state == ConnectionState::Disconnected));
}

#[tokio::test]
async fn test_disconnect_reported_once_all_down() {
    let mut h = Harness::new();
    let a = h.add("a", ticks());
    let b = h.add("b", ticks());
    h.connect().await;

    h.send(DisconnectMessage::default());
    let replies = h
        .recv_until(|m| matches!(m, Message::Disconnect(_)))
        .await;
    assert_eq!(
        replies
            .iter()
            .filter(|m| matches!(m, Message::Disconnect(_)))
            .count(),
        1
    );
    assert!(!a.is_connected());
    assert!(!b.is_connected());
    assert!(h.drain().await.is_empty());
}

#[tokio::test]
async fn test_removed_backend_fails_its_subscriptions() {
    let mut h = Harness::new();
    let a = h.add("a", ticks());
    h.connect().await;

    let tx = h.next_id();
    h.send(MarketDataRequest::subscribe(tx, DataKind::Ticks, Some(aapl())));
    h.recv_until(|m| matches!(m, Message::SubscriptionOnline(_)))
        .await;

    h.router.remove_adapter(a.id()).unwrap();
    let replies = h.recv_until(|m| matches!(m, Message::Error(_))).await;
    match replies.last() {
        Some(Message::Error(e)) => assert_eq!(e.original_transaction_id, Some(tx)),
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.router.adapters().is_empty());
    assert!(h.router.subscribers(DataKind::Ticks).is_empty());
}

#[tokio::test]
async fn test_adapter_added_after_connect_is_connected() {
    let mut h = Harness::new();
    h.add("first", ticks());
    h.connect().await;

    let late = h.add("late", ticks());
    let tx = h.next_id();
    // Buffered until the late backend finishes connecting.
    h.send(MarketDataRequest::subscribe(tx, DataKind::Ticks, Some(aapl())));
    h.recv_until(|m| matches!(m, Message::SubscriptionOnline(_)))
        .await;
    assert!(late.is_connected());
    assert_eq!(count_of(&late, MessageKind::MarketData), 1);
}
