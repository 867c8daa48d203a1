// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_rpc::{
    message::{MessageMetadata, SubscribeOptions, Subscription},
    queue::{QueueBinding, QueueDefinition},
    InMemoryBroker, MessageBus, RpcCaller, RpcError, RpcResponder, RpcTopology, Transform,
    Uppercase,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};

type Replies = mpsc::UnboundedReceiver<Result<String, RpcError>>;

fn collector() -> (
    impl Fn() -> Box<dyn FnOnce(Result<Vec<u8>, RpcError>) + Send>,
    Replies,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let make = move || -> Box<dyn FnOnce(Result<Vec<u8>, RpcError>) + Send> {
        let tx = tx.clone();
        Box::new(move |reply: Result<Vec<u8>, RpcError>| {
            let _ = tx.send(reply.map(|payload| String::from_utf8_lossy(&payload).into_owned()));
        })
    };
    (make, rx)
}

async fn next_reply(rx: &mut Replies) -> Result<String, RpcError> {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("reply expected")
        .expect("channel open")
}

async fn no_more_replies(rx: &mut Replies) {
    assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
}

fn connect(broker: &InMemoryBroker) -> Arc<dyn MessageBus> {
    Arc::new(broker.connect())
}

/// Declares the request side by hand so a test controls when and how
/// replies go out.
async fn manual_responder(broker: &InMemoryBroker, topology: &RpcTopology) -> (Arc<dyn MessageBus>, Subscription) {
    let bus = connect(broker);
    bus.declare_exchange(&topology.exchange_definition()).await.unwrap();
    bus.declare_queue(&QueueDefinition::new(&topology.request_queue))
        .await
        .unwrap();
    bus.bind(
        &QueueBinding::new(&topology.request_queue)
            .exchange(&topology.exchange)
            .routing_key(&topology.request_routing_key),
    )
    .await
    .unwrap();

    let requests = bus
        .subscribe(&topology.request_queue, &SubscribeOptions::new("").auto_ack())
        .await
        .unwrap();

    (bus, requests)
}

async fn reply(bus: &Arc<dyn MessageBus>, topology: &RpcTopology, request: &rabbitmq_rpc::message::Delivery, payload: &[u8]) {
    let metadata = MessageMetadata::new()
        .with_correlation_id(request.metadata.correlation_id.clone().unwrap());
    bus.publish(
        &topology.exchange,
        request.metadata.reply_to.as_deref().unwrap(),
        &metadata,
        payload,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn hello_round_trip_invokes_handler_once() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let responder = RpcResponder::new(connect(&broker), topology.clone(), Uppercase)
        .await
        .unwrap();
    let caller = RpcCaller::new(connect(&broker), topology).await.unwrap();

    let (handler, mut replies) = collector();
    caller.call(b"hello", handler()).await.unwrap();

    assert_eq!(next_reply(&mut replies).await.unwrap(), "HELLO");
    no_more_replies(&mut replies).await;
    assert_eq!(caller.pending(), 0);

    caller.close().await.unwrap();
    responder.close().await.unwrap();
}

#[tokio::test]
async fn request_waits_for_reply() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let _responder = RpcResponder::new(connect(&broker), topology.clone(), Uppercase)
        .await
        .unwrap();
    let caller = RpcCaller::new(connect(&broker), topology).await.unwrap();

    assert_eq!(caller.request(b"hello").await.unwrap(), b"HELLO");
}

#[tokio::test]
async fn out_of_order_replies_reach_their_own_handlers() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let (responder_bus, mut requests) = manual_responder(&broker, &topology).await;
    let caller = RpcCaller::new(connect(&broker), topology.clone()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    for payload in ["a", "b"] {
        let tx = tx.clone();
        caller
            .call(payload.as_bytes(), move |reply| {
                let _ = tx.send((payload, reply));
            })
            .await
            .unwrap();
    }
    assert_eq!(caller.pending(), 2);

    let first = requests.next().await.unwrap();
    let second = requests.next().await.unwrap();
    assert_eq!(first.payload, b"a");
    assert_eq!(second.payload, b"b");

    reply(&responder_bus, &topology, &second, b"B").await;
    reply(&responder_bus, &topology, &first, b"A").await;

    let (sent, got) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!((sent, got.unwrap()), ("b", b"B".to_vec()));
    let (sent, got) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!((sent, got.unwrap()), ("a", b"A".to_vec()));

    assert_eq!(caller.pending(), 0);
}

#[tokio::test]
async fn concurrent_callers_do_not_cross_talk() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let _responder = RpcResponder::new(connect(&broker), topology.clone(), Uppercase)
        .await
        .unwrap();
    let first = RpcCaller::new(connect(&broker), topology.clone()).await.unwrap();
    let second = RpcCaller::new(connect(&broker), topology).await.unwrap();
    assert_ne!(first.reply_routing_key(), second.reply_routing_key());

    let (a, b, c) = tokio::join!(
        first.request(b"apple"),
        second.request(b"banana"),
        first.request(b"cherry"),
    );

    assert_eq!(a.unwrap(), b"APPLE");
    assert_eq!(b.unwrap(), b"BANANA");
    assert_eq!(c.unwrap(), b"CHERRY");
}

#[tokio::test]
async fn shared_reply_key_drops_foreign_replies() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default().with_reply_routing_key("client-routing-key");

    let _responder = RpcResponder::new(connect(&broker), topology.clone(), Uppercase)
        .await
        .unwrap();
    let first = RpcCaller::new(connect(&broker), topology.clone()).await.unwrap();
    let second = RpcCaller::new(connect(&broker), topology).await.unwrap();

    let (one, two) = tokio::join!(first.request(b"one"), second.request(b"two"));

    assert_eq!(one.unwrap(), b"ONE");
    assert_eq!(two.unwrap(), b"TWO");
    assert_eq!(first.pending(), 0);
    assert_eq!(second.pending(), 0);
}

#[tokio::test]
async fn clear_abandons_pending_request() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let (responder_bus, mut requests) = manual_responder(&broker, &topology).await;
    let caller = RpcCaller::new(connect(&broker), topology.clone()).await.unwrap();

    let (handler, mut replies) = collector();
    caller.call(b"hello", handler()).await.unwrap();
    let request = requests.next().await.unwrap();

    caller.pending_requests().clear();
    assert!(caller.pending_requests().is_empty());

    reply(&responder_bus, &topology, &request, b"HELLO").await;
    no_more_replies(&mut replies).await;
    assert_eq!(caller.pending(), 0);
}

#[tokio::test]
async fn unknown_and_duplicate_replies_are_dropped() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let (responder_bus, mut requests) = manual_responder(&broker, &topology).await;
    let caller = RpcCaller::new(connect(&broker), topology.clone()).await.unwrap();

    let (handler, mut replies) = collector();
    let id = caller.call(b"hello", handler()).await.unwrap();
    let request = requests.next().await.unwrap();

    let stray = MessageMetadata::new().with_correlation_id(rabbitmq_rpc::CorrelationId::new().to_string());
    responder_bus
        .publish(&topology.exchange, caller.reply_routing_key(), &stray, b"STRAY")
        .await
        .unwrap();
    no_more_replies(&mut replies).await;
    assert!(caller.pending_requests().contains(&id));

    reply(&responder_bus, &topology, &request, b"HELLO").await;
    reply(&responder_bus, &topology, &request, b"HELLO").await;

    assert_eq!(next_reply(&mut replies).await.unwrap(), "HELLO");
    no_more_replies(&mut replies).await;
    assert_eq!(caller.pending(), 0);
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();
    let caller = RpcCaller::new(connect(&broker), topology).await.unwrap();

    let (handler, mut replies) = collector();
    let id = caller
        .call_with_timeout(b"hello", Duration::from_millis(50), handler())
        .await
        .unwrap();

    assert_eq!(next_reply(&mut replies).await, Err(RpcError::Timeout(id)));
    assert_eq!(caller.pending(), 0);
}

#[tokio::test]
async fn topology_timeout_applies_to_requests() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default().with_request_timeout(Duration::from_millis(50));
    let caller = RpcCaller::new(connect(&broker), topology).await.unwrap();

    let err = caller.request(b"hello").await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));
}

#[tokio::test]
async fn responder_survives_transform_failure() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let _responder = RpcResponder::new(connect(&broker), topology.clone(), Uppercase)
        .await
        .unwrap();
    let caller = RpcCaller::new(connect(&broker), topology).await.unwrap();

    let err = caller
        .request_with_timeout(&[0xff, 0xfe], Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));

    assert_eq!(caller.request(b"still here").await.unwrap(), b"STILL HERE");
}

#[tokio::test]
async fn json_requests() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::new("calc.exchange", "calc.queue", "calc");

    let double = |payload: &[u8]| -> Result<Vec<u8>, RpcError> {
        let body: Value = serde_json::from_slice(payload)?;
        let n = body["n"].as_i64().unwrap_or_default();
        Ok(serde_json::to_vec(&json!({ "n": n * 2 }))?)
    };

    let _responder = RpcResponder::new(connect(&broker), topology.clone(), double)
        .await
        .unwrap();
    let caller = RpcCaller::new(connect(&broker), topology).await.unwrap();

    let reply: Value = caller.request_json(&json!({ "n": 21 })).await.unwrap();
    assert_eq!(reply, json!({ "n": 42 }));
}

#[tokio::test]
async fn mismatched_exchange_kind_fails_construction() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let other = connect(&broker);
    other
        .declare_exchange(
            &rabbitmq_rpc::exchange::ExchangeDefinition::new(&topology.exchange)
                .fanout()
                .durable(),
        )
        .await
        .unwrap();

    let err = RpcCaller::new(connect(&broker), topology).await.err().unwrap();
    assert!(matches!(err, RpcError::BusUnavailable(_)));
}

#[tokio::test]
async fn closed_caller_fails_pending_requests() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();
    let (_responder_bus, _requests) = manual_responder(&broker, &topology).await;
    let caller = Arc::new(RpcCaller::new(connect(&broker), topology).await.unwrap());

    let waiting = tokio::spawn({
        let caller = caller.clone();
        async move { caller.request(b"hello").await }
    });

    while caller.pending() == 0 {
        tokio::task::yield_now().await;
    }
    caller.close().await.unwrap();

    assert_eq!(waiting.await.unwrap(), Err(RpcError::Closed));
    assert!(!broker.has_queue(caller.reply_queue()));
}

#[tokio::test]
async fn panicking_response_handler_does_not_stop_the_caller() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let _responder = RpcResponder::new(connect(&broker), topology.clone(), Uppercase)
        .await
        .unwrap();
    let caller = RpcCaller::new(connect(&broker), topology).await.unwrap();

    caller
        .call(b"boom", |_| panic!("response handler failure"))
        .await
        .unwrap();

    let reply = caller
        .request_with_timeout(b"after", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, b"AFTER");
    assert_eq!(caller.pending(), 0);
}

#[tokio::test]
async fn panicking_transform_does_not_stop_the_responder() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let fragile = |payload: &[u8]| -> Result<Vec<u8>, RpcError> {
        if payload == b"boom" {
            panic!("transform failure");
        }
        Uppercase.transform(payload)
    };

    let _responder = RpcResponder::new(connect(&broker), topology.clone(), fragile)
        .await
        .unwrap();
    let caller = RpcCaller::new(connect(&broker), topology).await.unwrap();

    let err = caller
        .request_with_timeout(b"boom", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));

    let reply = caller
        .request_with_timeout(b"after", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, b"AFTER");
}

#[tokio::test]
async fn abandoned_request_leaves_nothing_pending() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();
    let (responder_bus, mut requests) = manual_responder(&broker, &topology).await;
    let caller = RpcCaller::new(connect(&broker), topology.clone()).await.unwrap();

    let outcome = timeout(Duration::from_millis(50), caller.request(b"hello")).await;
    assert!(outcome.is_err());
    assert_eq!(caller.pending(), 0);

    let request = timeout(Duration::from_secs(1), requests.next())
        .await
        .expect("request expected")
        .expect("subscription open");
    reply(&responder_bus, &topology, &request, b"late").await;

    let (handler, mut replies) = collector();
    caller.call(b"next", handler()).await.unwrap();
    assert_eq!(caller.pending(), 1);
    no_more_replies(&mut replies).await;
}

#[tokio::test]
async fn dropped_caller_releases_its_reply_queue() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default().with_request_timeout(Duration::from_secs(5));
    let caller = RpcCaller::new(connect(&broker), topology).await.unwrap();
    let reply_queue = caller.reply_queue().to_owned();
    assert!(broker.has_queue(&reply_queue));

    drop(caller);

    timeout(Duration::from_secs(1), async {
        while broker.has_queue(&reply_queue) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reply queue released");
}

#[tokio::test]
async fn dropped_responder_stops_serving() {
    let broker = InMemoryBroker::new();
    let topology = RpcTopology::default();

    let responder = RpcResponder::new(connect(&broker), topology.clone(), Uppercase)
        .await
        .unwrap();
    let caller = RpcCaller::new(connect(&broker), topology.clone()).await.unwrap();
    assert_eq!(caller.request(b"hello").await.unwrap(), b"HELLO");

    drop(responder);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = caller
        .request_with_timeout(b"unanswered", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));
    assert_eq!(broker.ready_count(&topology.request_queue), Some(1));
}
