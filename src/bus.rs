// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Bus Abstraction
//!
//! The `MessageBus` trait is the only view the rest of the crate has of the
//! broker. `AmqpBus` implements it over a RabbitMQ channel and `InMemoryBus`
//! implements it inside the process.
//!
//! Each bus instance stands for one channel and is owned by a single caller,
//! responder or subscriber; instances are not shared between them.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{AckHandle, MessageMetadata, SubscribeOptions, Subscription},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;

/// Publish/subscribe/acknowledge primitives required from a message broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Declares an exchange. Redeclaring with identical settings is a no-op.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, which is assigned by the bus
    /// when the definition's name is empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Binds a queue to an exchange under a routing key or pattern.
    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message. Fire-and-forget: success means the bus accepted
    /// it, not that anyone received it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<(), AmqpError>;

    /// Starts consuming a queue. Deliveries arrive on the returned stream,
    /// independently of whatever task is publishing.
    async fn subscribe(
        &self,
        queue: &str,
        options: &SubscribeOptions,
    ) -> Result<Subscription, AmqpError>;

    /// Acknowledges a delivery. Acknowledging a settled delivery is a no-op.
    async fn ack(&self, handle: &AckHandle) -> Result<(), AmqpError>;

    /// Rejects a delivery, optionally putting it back on its queue.
    async fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries in flight per consumer on this bus.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Stops a consumer; its subscription stream ends.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Releases the underlying channel and connection.
    async fn close(&self) -> Result<(), AmqpError>;
}
