// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish/Subscribe Patterns
//!
//! Ready-made subscribers for the common broker patterns:
//!
//! - `Subscriber::fanout`: every subscriber gets every message.
//! - `Subscriber::topic`: subscribers get messages whose routing key matches
//!   their pattern.
//! - `Subscriber::work_queue`: competing consumers share one durable queue,
//!   each taking a limited number of unacknowledged messages at a time.

use crate::{
    bus::MessageBus,
    dispatcher::{ConsumerHandle, Dispatcher, Disposition, MessageHandler},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, MessageMetadata, SubscribeOptions, TEXT_CONTENT_TYPE, UTF8_ENCODING},
    queue::{QueueBinding, QueueDefinition},
    topology::{BusTopology, Topology},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{fmt::Display, sync::Arc};
use tracing::{debug, error};

/// Declares a queue for one pattern and consumes it.
pub struct Subscriber {
    bus: Arc<dyn MessageBus>,
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    binding_key: String,
    prefetch: Option<u16>,
    auto_ack: bool,
}

impl Subscriber {
    /// Private queue bound to a non-durable fanout exchange.
    pub fn fanout(bus: Arc<dyn MessageBus>, exchange: &str) -> Self {
        Subscriber {
            bus,
            exchange: ExchangeDefinition::new(exchange).fanout(),
            queue: QueueDefinition::server_named(),
            binding_key: String::new(),
            prefetch: None,
            auto_ack: true,
        }
    }

    /// Private queue bound to a topic exchange under `pattern`.
    pub fn topic(bus: Arc<dyn MessageBus>, exchange: &str, pattern: &str) -> Self {
        Subscriber {
            bus,
            exchange: ExchangeDefinition::new(exchange).topic(),
            queue: QueueDefinition::server_named(),
            binding_key: pattern.to_owned(),
            prefetch: None,
            auto_ack: true,
        }
    }

    /// Shared durable queue on a durable direct exchange.
    ///
    /// Deliveries are acked once the handler succeeds and rejected without
    /// requeue when it fails.
    ///
    /// # Parameters
    /// * `bus` - The message bus to subscribe on
    /// * `exchange` - Direct exchange the producers publish to
    /// * `queue` - Queue shared by every worker
    /// * `routing_key` - Key binding the queue to the exchange
    /// * `prefetch` - Unacknowledged deliveries a worker may hold at once
    pub fn work_queue(
        bus: Arc<dyn MessageBus>,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        prefetch: u16,
    ) -> Self {
        Subscriber {
            bus,
            exchange: ExchangeDefinition::new(exchange).direct().durable(),
            queue: QueueDefinition::new(queue).durable(),
            binding_key: routing_key.to_owned(),
            prefetch: Some(prefetch),
            auto_ack: false,
        }
    }

    /// Starts consuming with a plain function as handler.
    ///
    /// # Parameters
    /// * `handler` - Called for every delivery; an `Err` rejects it
    ///
    /// # Returns
    /// A handle naming the queue in use, or the first declaration or
    /// subscription error
    pub async fn start<H, E>(self, handler: H) -> Result<SubscriberHandle, AmqpError>
    where
        H: Fn(&Delivery) -> Result<(), E> + Send + Sync + 'static,
        E: Display + 'static,
    {
        self.start_handler(Arc::new(FnHandler(handler))).await
    }

    pub async fn start_handler(
        self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriberHandle, AmqpError> {
        if let Some(prefetch) = self.prefetch {
            self.bus.qos(prefetch).await?;
        }

        let binding = QueueBinding::new(self.queue.name())
            .exchange(self.exchange.name())
            .routing_key(&self.binding_key);

        let declared = BusTopology::new(self.bus.clone())
            .exchange(&self.exchange)
            .queue(&self.queue)
            .queue_binding(&binding)
            .install()
            .await?;

        let queue = declared
            .into_iter()
            .next()
            .ok_or(AmqpError::InternalError)?;

        let options = if self.auto_ack {
            SubscribeOptions::new("").auto_ack()
        } else {
            SubscribeOptions::new("").manual_ack()
        };

        let consumer = Dispatcher::new(self.bus.clone())
            .consume(&queue, options, handler)
            .await?;

        debug!(
            exchange = self.exchange.name(),
            queue = %queue,
            binding_key = %self.binding_key,
            "subscriber started"
        );

        Ok(SubscriberHandle { queue, consumer })
    }
}

/// A running subscriber.
pub struct SubscriberHandle {
    queue: String,
    consumer: ConsumerHandle,
}

impl SubscriberHandle {
    /// Name of the queue being consumed.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        self.consumer.consumer_tag()
    }

    pub async fn stop(self) -> Result<(), AmqpError> {
        self.consumer.stop().await
    }
}

struct FnHandler<H>(H);

#[async_trait]
impl<H, E> MessageHandler for FnHandler<H>
where
    H: Fn(&Delivery) -> Result<(), E> + Send + Sync + 'static,
    E: Display + 'static,
{
    async fn handle(&self, _ctx: &Context, delivery: &Delivery) -> Disposition {
        match (self.0)(delivery) {
            Ok(()) => Disposition::Ack,
            Err(err) => {
                error!(error = %err, routing_key = %delivery.routing_key, "handler failed");
                Disposition::Reject { requeue: false }
            }
        }
    }
}

/// Publishes `text` as a UTF-8 plain text message.
pub async fn publish_text(
    bus: &dyn MessageBus,
    exchange: &str,
    routing_key: &str,
    text: &str,
) -> Result<(), AmqpError> {
    let metadata = MessageMetadata::new()
        .with_content_type(TEXT_CONTENT_TYPE)
        .with_content_encoding(UTF8_ENCODING);

    bus.publish(exchange, routing_key, &metadata, text.as_bytes())
        .await
}
