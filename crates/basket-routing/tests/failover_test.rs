//! Single-destination routing integration tests.
//!
//! - failover retry after "not supported"
//! - bounded retries when every backend declines
//! - order registration, cancel and replace routing

mod common;

use basket_adapter::SimBehavior;
use basket_core::{
    Capabilities, DataKind, MarketDataRequest, Message, MessageKind, OrderCancel, OrderRegister,
    OrderReplace, OrderSide, PortfolioLookup, ReplyErrorKind, TransactionId,
};
use basket_routing::RouterConfig;
use common::{aapl, count_of, is_response_for, responses_for, test_config, Harness};
use rust_decimal_macros::dec;
use std::collections::HashSet;

fn candles() -> Capabilities {
    Capabilities::new().with_market_data(DataKind::Candles)
}

fn declines_candles() -> SimBehavior {
    SimBehavior {
        decline: HashSet::from([DataKind::Candles]),
        ..Default::default()
    }
}

fn register(tx: TransactionId, portfolio: &str) -> OrderRegister {
    OrderRegister {
        transaction_id: tx,
        security_id: aapl(),
        portfolio: portfolio.into(),
        side: OrderSide::Buy,
        price: dec!(187.25),
        volume: dec!(10),
        adapter: None,
    }
}

fn is_execution_for(tx: TransactionId) -> impl Fn(&Message) -> bool {
    move |m| matches!(m, Message::Execution(e) if e.ids.original_transaction_id == Some(tx))
}

#[tokio::test]
async fn test_not_supported_moves_to_next_backend() {
    let mut h = Harness::new();
    let first = h.add_with("first", candles(), declines_candles());
    let second = h.add("second", candles());
    h.connect().await;

    let tx = h.next_id();
    h.send(MarketDataRequest::subscribe(tx, DataKind::Candles, Some(aapl())));
    let mut replies = h
        .recv_until(|m| matches!(m, Message::SubscriptionOnline(_)))
        .await;
    replies.extend(h.drain().await);

    let responses = responses_for(&replies, tx);
    assert_eq!(responses.len(), 1);
    assert!(matches!(responses[0], Message::SubscriptionResponse(r) if r.is_ok()));
    assert_eq!(count_of(&first, MessageKind::MarketData), 1);
    assert_eq!(count_of(&second, MessageKind::MarketData), 1);
    // Failover keeps the caller's id end to end.
    assert_eq!(second.active_subscriptions(), vec![tx]);

    second.publish_market_data(dec!(50)).unwrap();
    let data = h.drain().await;
    assert_eq!(data.len(), 1);
    assert_eq!(
        data[0].subscription_ids().unwrap().original_transaction_id,
        Some(tx)
    );
    h.assert_caller_ids(&data);
    assert_eq!(h.router.subscribers(DataKind::Candles), vec![tx]);
}

/// A declining backend is tried once; then the request fails.
#[tokio::test]
async fn test_single_backend_decline_is_final() {
    let mut h = Harness::new();
    let only = h.add_with("only", candles(), declines_candles());
    h.connect().await;

    let tx = h.next_id();
    h.send(MarketDataRequest::subscribe(tx, DataKind::Candles, Some(aapl())));
    let mut replies = h.recv_until(is_response_for(tx)).await;
    replies.extend(h.drain().await);

    assert_eq!(count_of(&only, MessageKind::MarketData), 1);
    let responses = responses_for(&replies, tx);
    assert_eq!(responses.len(), 1);
    match responses[0] {
        Message::SubscriptionResponse(r) => {
            assert_eq!(r.error.as_ref().unwrap().kind, ReplyErrorKind::NotSupported)
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.router.subscribers(DataKind::Candles).is_empty());
}

#[tokio::test]
async fn test_every_backend_declines_once() {
    let mut h = Harness::new();
    let sims: Vec<_> = (0..3)
        .map(|i| h.add_with(&format!("sim-{i}"), candles(), declines_candles()))
        .collect();
    h.connect().await;

    let tx = h.next_id();
    h.send(MarketDataRequest::subscribe(tx, DataKind::Candles, Some(aapl())));
    let mut replies = h.recv_until(is_response_for(tx)).await;
    replies.extend(h.drain().await);

    for sim in &sims {
        assert_eq!(count_of(sim, MessageKind::MarketData), 1);
    }
    assert_eq!(responses_for(&replies, tx).len(), 1);
}

#[tokio::test]
async fn test_failover_unsubscribe_reaches_serving_backend() {
    let mut h = Harness::new();
    let first = h.add_with("first", candles(), declines_candles());
    let second = h.add("second", candles());
    h.connect().await;

    let tx = h.next_id();
    h.send(MarketDataRequest::subscribe(tx, DataKind::Candles, Some(aapl())));
    h.recv_until(|m| matches!(m, Message::SubscriptionOnline(_)))
        .await;

    let stop = h.next_id();
    h.send(MarketDataRequest::unsubscribe(stop, tx, DataKind::Candles, Some(aapl())));
    let replies = h.recv_until(is_response_for(stop)).await;
    assert!(matches!(replies.last(), Some(Message::SubscriptionResponse(r)) if r.is_ok()));
    assert_eq!(count_of(&first, MessageKind::MarketData), 1);
    assert_eq!(count_of(&second, MessageKind::MarketData), 2);
    assert!(second.active_subscriptions().is_empty());
    assert!(h.router.subscribers(DataKind::Candles).is_empty());
}

#[tokio::test]
async fn test_order_lifecycle_stays_on_one_backend() {
    let mut h = Harness::new();
    let a = h.add("a", Capabilities::trading());
    let b = h.add("b", Capabilities::trading());
    h.connect().await;

    // No pin: the first trading backend takes the order.
    let order = h.next_id();
    h.send(register(order, "acc-1"));
    let replies = h.recv_until(is_execution_for(order)).await;
    assert!(matches!(replies.last(), Some(Message::Execution(e)) if e.error.is_none()));
    assert_eq!(count_of(&a, MessageKind::OrderRegister), 1);
    assert_eq!(count_of(&b, MessageKind::OrderRegister), 0);

    let replaced = h.next_id();
    h.send(OrderReplace {
        transaction_id: replaced,
        original_transaction_id: order,
        security_id: aapl(),
        portfolio: "acc-1".into(),
        price: dec!(187.5),
        volume: dec!(10),
    });
    h.recv_until(is_execution_for(replaced)).await;

    let cancel = h.next_id();
    h.send(OrderCancel {
        transaction_id: cancel,
        original_transaction_id: replaced,
        security_id: aapl(),
        portfolio: "acc-1".into(),
    });
    let replies = h.recv_until(is_execution_for(cancel)).await;
    assert!(matches!(replies.last(), Some(Message::Execution(e)) if e.error.is_none()));
    assert_eq!(count_of(&a, MessageKind::OrderCancel), 1);
    assert_eq!(count_of(&b, MessageKind::OrderReplace), 0);
    assert_eq!(count_of(&b, MessageKind::OrderCancel), 0);
}

#[tokio::test]
async fn test_cancel_of_unknown_order() {
    let mut h = Harness::new();
    let a = h.add("a", Capabilities::trading());
    h.connect().await;

    let cancel = h.next_id();
    let unknown = h.next_id();
    h.send(OrderCancel {
        transaction_id: cancel,
        original_transaction_id: unknown,
        security_id: aapl(),
        portfolio: "acc-1".into(),
    });
    let replies = h.recv_until(is_execution_for(cancel)).await;
    match replies.last() {
        Some(Message::Execution(e)) => {
            assert_eq!(e.error.as_ref().unwrap().kind, ReplyErrorKind::RoutingMiss)
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(count_of(&a, MessageKind::OrderCancel), 0);
}

#[tokio::test]
async fn test_learned_portfolio_route_pins_orders() {
    let mut h = Harness::with_config(RouterConfig {
        learn_routes_from_replies: true,
        ..test_config()
    });
    let a = h.add("a", Capabilities::trading());
    let b = h.add_with(
        "b",
        Capabilities::trading(),
        SimBehavior {
            portfolios: vec!["acc-7".into()],
            ..Default::default()
        },
    );
    h.connect().await;

    let lookup = h.next_id();
    h.send(PortfolioLookup::new(lookup, Some("acc-7".into())));
    let replies = h
        .recv_until(|m| matches!(m, Message::SubscriptionFinished(_)))
        .await;
    assert!(replies.iter().any(|m| matches!(m, Message::Portfolio(_))));

    let order = h.next_id();
    h.send(register(order, "ACC-7"));
    h.recv_until(is_execution_for(order)).await;
    assert_eq!(count_of(&a, MessageKind::OrderRegister), 0);
    assert_eq!(count_of(&b, MessageKind::OrderRegister), 1);
}
