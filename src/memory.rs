// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Message Bus
//!
//! A broker living inside the process, for tests and broker-less runs.
//! `InMemoryBroker` holds the exchanges, queues and bindings; every
//! `InMemoryBus` obtained from `connect` behaves like one channel on it.
//!
//! Routing follows RabbitMQ: direct, fanout and topic exchanges, the default
//! exchange `""` addressing queues by name, server-named queues, round-robin
//! delivery to competing consumers and per-consumer prefetch. Messages that
//! reach a queue without consumers wait there until one subscribes.

use crate::{
    bus::MessageBus,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{AckHandle, Delivery, MessageMetadata, SubscribeOptions, Subscription},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    metadata: MessageMetadata,
    payload: Vec<u8>,
    redelivered: bool,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<(String, String)>,
}

struct ConsumerState {
    tag: String,
    bus_id: u64,
    auto_ack: bool,
    prefetch: u16,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < self.prefetch as usize
    }
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    next_consumer: usize,
    owner: Option<u64>,
    auto_delete: bool,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    bus_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_bus_id: u64,
}

impl BrokerState {
    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.messages.push_back(message);
            self.pump(queue);
        }
    }

    /// Hands ready messages to consumers with spare capacity, round-robin.
    fn pump(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() {
                return;
            }

            queue.consumers.retain(|c| !c.tx.is_closed());
            let count = queue.consumers.len();
            if count == 0 {
                return;
            }

            let start = queue.next_consumer % count;
            let Some(idx) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|idx| queue.consumers[*idx].has_capacity())
            else {
                return;
            };

            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            queue.next_consumer = (idx + 1) % count;

            self.next_tag += 1;
            let tag = self.next_tag;
            let consumer = &mut queue.consumers[idx];

            let delivery = Delivery {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                metadata: message.metadata.clone(),
                payload: message.payload.clone(),
                ack: if consumer.auto_ack {
                    AckHandle::auto_acked(tag)
                } else {
                    AckHandle::new(tag)
                },
            };

            if consumer.tx.send(delivery).is_err() {
                queue.consumers.remove(idx);
                queue.messages.push_front(message);
                continue;
            }

            if !consumer.auto_ack {
                consumer.in_flight += 1;
                self.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue_name.to_owned(),
                        consumer_tag: consumer.tag.clone(),
                        bus_id: consumer.bus_id,
                        message,
                    },
                );
            }
        }
    }

    fn settle(&mut self, tag: u64, requeue: bool) {
        let Some(unacked) = self.unacked.remove(&tag) else {
            return;
        };

        let queue_name = unacked.queue.clone();
        if let Some(queue) = self.queues.get_mut(&queue_name) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.tag == unacked.consumer_tag)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }

            if requeue {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }

        self.pump(&queue_name);
    }

    fn remove_consumer(&mut self, bus_id: u64, consumer_tag: &str) -> bool {
        let mut removed = false;
        let mut emptied = vec![];

        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.bus_id == bus_id && c.tag == consumer_tag));
            if queue.consumers.len() != before {
                removed = true;
                if queue.auto_delete && queue.consumers.is_empty() {
                    emptied.push(name.clone());
                }
            }
        }

        for name in emptied {
            self.delete_queue(&name);
        }

        removed
    }

    fn delete_queue(&mut self, name: &str) {
        debug!(queue = name, "deleting queue");
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
        self.unacked.retain(|_, unacked| unacked.queue != name);
    }

    fn disconnect(&mut self, bus_id: u64) {
        let mut released = vec![];
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.bus_id != bus_id);
            let emptied = before > 0 && queue.consumers.is_empty() && queue.auto_delete;

            if queue.owner == Some(bus_id) || emptied {
                released.push(name.clone());
            }
        }
        for name in &released {
            self.delete_queue(name);
        }

        let orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.bus_id == bus_id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in orphaned {
            self.settle(tag, true);
        }
    }
}

/// Shared in-process broker state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new channel on this broker.
    pub fn connect(&self) -> InMemoryBus {
        let id = {
            let mut state = self.lock();
            state.next_bus_id += 1;
            state.next_bus_id
        };

        InMemoryBus {
            broker: self.clone(),
            id,
            prefetch: AtomicU16::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.messages.len())
    }

    /// Deliveries handed out but not yet acknowledged, across all queues.
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One channel on an `InMemoryBroker`.
///
/// Dropping the bus closes it.
pub struct InMemoryBus {
    broker: InMemoryBroker,
    id: u64,
    prefetch: AtomicU16,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ClosedError);
        }
        Ok(())
    }
}

impl Drop for InMemoryBus {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.lock().disconnect(self.id);
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        if def.name.is_empty() {
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }

        let mut state = self.broker.lock();
        match state.exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind || existing.durable != def.durable => {
                warn!(exchange = %def.name, "exchange redeclared with different settings");
                Err(AmqpError::ExchangeKindMismatch(def.name.clone()))
            }
            Some(_) => Ok(()),
            None if def.passive => Err(AmqpError::UnknownExchange(def.name.clone())),
            None => {
                debug!(exchange = %def.name, kind = ?def.kind, "exchange declared");
                state.exchanges.insert(
                    def.name.clone(),
                    ExchangeState {
                        kind: def.kind,
                        durable: def.durable,
                        bindings: vec![],
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_open()?;

        let name = if def.is_server_named() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            def.name.clone()
        };

        let mut state = self.broker.lock();
        match state.queues.get(&name) {
            Some(existing) => match existing.owner {
                Some(owner) if owner != self.id => Err(AmqpError::DeclareQueueError(name)),
                _ => Ok(name),
            },
            None if def.passive => Err(AmqpError::UnknownQueue(name)),
            None => {
                debug!(queue = %name, "queue declared");
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        owner: def.exclusive.then_some(self.id),
                        auto_delete: def.delete,
                        ..Default::default()
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let mut state = self.broker.lock();
        if !state.queues.contains_key(&binding.queue_name) {
            return Err(AmqpError::UnknownQueue(binding.queue_name.clone()));
        }

        let Some(exchange) = state.exchanges.get_mut(&binding.exchange_name) else {
            return Err(AmqpError::UnknownExchange(binding.exchange_name.clone()));
        };

        let entry = (binding.queue_name.clone(), binding.routing_key.clone());
        if !exchange.bindings.contains(&entry) {
            exchange.bindings.push(entry);
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            metadata: metadata.clone(),
            payload: payload.to_vec(),
            redelivered: false,
        };

        let mut state = self.broker.lock();
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let Some(ex) = state.exchanges.get(exchange) else {
                return Err(AmqpError::UnknownExchange(exchange.to_owned()));
            };

            let mut targets: Vec<String> = ex
                .bindings
                .iter()
                .filter(|(_, key)| ex.kind.routes(key, routing_key))
                .map(|(queue, _)| queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }

        for queue in targets {
            state.enqueue(&queue, message.clone());
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        options: &SubscribeOptions,
    ) -> Result<Subscription, AmqpError> {
        self.ensure_open()?;

        let tag = if options.consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            options.consumer_tag.clone()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.lock();
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(AmqpError::UnknownQueue(queue.to_owned()));
        };

        if options.exclusive && !queue_state.consumers.is_empty() {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        queue_state.consumers.push(ConsumerState {
            tag: tag.clone(),
            bus_id: self.id,
            auto_ack: options.auto_ack,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            in_flight: 0,
            tx,
        });
        state.pump(queue);

        Ok(Subscription::new(&tag, rx))
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), AmqpError> {
        self.ensure_open()?;
        if handle.settle() {
            self.broker.lock().settle(handle.delivery_tag(), false);
        }
        Ok(())
    }

    async fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        if handle.settle() {
            self.broker.lock().settle(handle.delivery_tag(), requeue);
        }
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        if self.broker.lock().remove_consumer(self.id, consumer_tag) {
            Ok(())
        } else {
            Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.broker.lock().disconnect(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(sub: &mut Subscription) -> Delivery {
        timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("delivery expected")
            .expect("subscription open")
    }

    async fn nothing(sub: &mut Subscription) {
        assert!(timeout(Duration::from_millis(50), sub.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let bus = broker.connect();
        let queue = bus.declare_queue(&QueueDefinition::new("elex.queue.01")).await.unwrap();

        bus.publish("", &queue, &MessageMetadata::new(), b"Hello, 0").await.unwrap();

        let mut sub = bus
            .subscribe(&queue, &SubscribeOptions::new("").auto_ack())
            .await
            .unwrap();
        assert_eq!(next(&mut sub).await.payload, b"Hello, 0");
    }

    #[tokio::test]
    async fn test_server_named_queues_are_unique() {
        let bus = InMemoryBroker::new().connect();
        let a = bus.declare_queue(&QueueDefinition::server_named()).await.unwrap();
        let b = bus.declare_queue(&QueueDefinition::server_named()).await.unwrap();

        assert!(a.starts_with("amq.gen-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_exchange_redeclare_with_other_kind_fails() {
        let bus = InMemoryBroker::new().connect();
        let direct = ExchangeDefinition::new("elex.rpc.exchange").direct().durable();

        bus.declare_exchange(&direct).await.unwrap();
        bus.declare_exchange(&direct).await.unwrap();

        let err = bus
            .declare_exchange(&ExchangeDefinition::new("elex.rpc.exchange").fanout().durable())
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::ExchangeKindMismatch("elex.rpc.exchange".to_owned()));
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        let bus = InMemoryBroker::new().connect();
        let err = bus
            .publish("missing", "key", &MessageMetadata::new(), b"x")
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::UnknownExchange("missing".to_owned()));
    }

    #[tokio::test]
    async fn test_competing_consumers_round_robin() {
        let broker = InMemoryBroker::new();
        let bus = broker.connect();
        bus.declare_exchange(&ExchangeDefinition::new("elex.direct.exchange").durable())
            .await
            .unwrap();
        let queue = bus.declare_queue(&QueueDefinition::new("elex.queue")).await.unwrap();
        bus.bind(
            &QueueBinding::new(&queue)
                .exchange("elex.direct.exchange")
                .routing_key("elex-routing-key"),
        )
        .await
        .unwrap();

        let mut first = bus.subscribe(&queue, &SubscribeOptions::new("c1").auto_ack()).await.unwrap();
        let mut second = bus.subscribe(&queue, &SubscribeOptions::new("c2").auto_ack()).await.unwrap();

        for i in 0..4 {
            bus.publish(
                "elex.direct.exchange",
                "elex-routing-key",
                &MessageMetadata::new(),
                format!("Hello, {}", i).as_bytes(),
            )
            .await
            .unwrap();
        }

        assert_eq!(next(&mut first).await.text(), "Hello, 0");
        assert_eq!(next(&mut second).await.text(), "Hello, 1");
        assert_eq!(next(&mut first).await.text(), "Hello, 2");
        assert_eq!(next(&mut second).await.text(), "Hello, 3");
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_until_ack() {
        let broker = InMemoryBroker::new();
        let bus = broker.connect();
        let queue = bus.declare_queue(&QueueDefinition::new("work")).await.unwrap();
        bus.qos(1).await.unwrap();
        let mut sub = bus.subscribe(&queue, &SubscribeOptions::new("worker")).await.unwrap();

        bus.publish("", &queue, &MessageMetadata::new(), b"one").await.unwrap();
        bus.publish("", &queue, &MessageMetadata::new(), b"two").await.unwrap();

        let first = next(&mut sub).await;
        assert_eq!(first.payload, b"one");
        nothing(&mut sub).await;
        assert_eq!(broker.ready_count(&queue), Some(1));
        assert_eq!(broker.unacked_count(), 1);

        bus.ack(&first.ack).await.unwrap();
        assert_eq!(next(&mut sub).await.payload, b"two");
    }

    #[tokio::test]
    async fn test_nack_requeue_marks_redelivered() {
        let broker = InMemoryBroker::new();
        let bus = broker.connect();
        let queue = bus.declare_queue(&QueueDefinition::new("retry")).await.unwrap();
        let mut sub = bus.subscribe(&queue, &SubscribeOptions::new("")).await.unwrap();

        bus.publish("", &queue, &MessageMetadata::new(), b"job").await.unwrap();
        let first = next(&mut sub).await;
        assert!(!first.redelivered);

        bus.nack(&first.ack, true).await.unwrap();
        let again = next(&mut sub).await;
        assert!(again.redelivered);
        assert_eq!(again.payload, b"job");

        bus.nack(&again.ack, false).await.unwrap();
        nothing(&mut sub).await;
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_double_ack_is_noop() {
        let broker = InMemoryBroker::new();
        let bus = broker.connect();
        let queue = bus.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        let mut sub = bus.subscribe(&queue, &SubscribeOptions::new("")).await.unwrap();
        bus.publish("", &queue, &MessageMetadata::new(), b"x").await.unwrap();

        let delivery = next(&mut sub).await;
        bus.ack(&delivery.ack).await.unwrap();
        bus.ack(&delivery.ack).await.unwrap();
        bus.nack(&delivery.ack, true).await.unwrap();

        nothing(&mut sub).await;
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let bus = InMemoryBroker::new().connect();
        let queue = bus.declare_queue(&QueueDefinition::new("q")).await.unwrap();
        let mut sub = bus.subscribe(&queue, &SubscribeOptions::new("tag")).await.unwrap();

        bus.cancel(sub.consumer_tag()).await.unwrap();
        assert!(sub.next().await.is_none());
        assert!(bus.cancel("tag").await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_bus_releases_its_queues() {
        let broker = InMemoryBroker::new();
        let owner = broker.connect();
        let private = owner.declare_queue(&QueueDefinition::server_named()).await.unwrap();
        let _sub = owner.subscribe(&private, &SubscribeOptions::new("")).await.unwrap();

        drop(owner);
        assert!(!broker.has_queue(&private));
    }

    #[tokio::test]
    async fn test_close_releases_exclusive_queues_and_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let owner = broker.connect();
        let private = owner.declare_queue(&QueueDefinition::server_named()).await.unwrap();
        let shared = owner.declare_queue(&QueueDefinition::new("shared")).await.unwrap();
        let mut sub = owner.subscribe(&shared, &SubscribeOptions::new("")).await.unwrap();

        owner.publish("", &shared, &MessageMetadata::new(), b"pending").await.unwrap();
        let _in_flight = next(&mut sub).await;

        let other = broker.connect();
        assert!(other.declare_queue(&QueueDefinition::new(&private)).await.is_err());

        owner.close().await.unwrap();

        assert!(!broker.has_queue(&private));
        assert_eq!(broker.ready_count(&shared), Some(1));
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(
            owner.publish("", &shared, &MessageMetadata::new(), b"x").await,
            Err(AmqpError::ClosedError)
        );

        let mut other_sub = other.subscribe(&shared, &SubscribeOptions::new("").auto_ack()).await.unwrap();
        let redelivered = next(&mut other_sub).await;
        assert!(redelivered.redelivered);
    }
}
