// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! This module runs subscriptions. `Dispatcher::consume` subscribes to a
//! queue and spawns one task that feeds every delivery to a `MessageHandler`,
//! so handler code never runs on the transport's own I/O loop.
//!
//! Each delivery is processed inside an OpenTelemetry consumer span and
//! acknowledged according to the `Disposition` the handler returns.

use crate::{
    bus::MessageBus,
    consumer::consume,
    errors::AmqpError,
    message::{Delivery, SubscribeOptions},
};
use async_trait::async_trait;
use opentelemetry::{global, Context};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// What to do with a delivery once its handler returns.
///
/// Ignored for deliveries that were auto-acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge the delivery.
    Ack,
    /// Negatively acknowledge it, optionally putting it back on the queue.
    Reject { requeue: bool },
    /// Leave it unacknowledged.
    Ignore,
}

/// Handles deliveries from one subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `ctx` is the trace context extracted from the delivery's headers.
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Disposition;
}

/// Starts consumers over a message bus.
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
}

impl Dispatcher {
    /// Creates a dispatcher whose consumers subscribe through `bus`.
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Dispatcher { bus }
    }

    /// Subscribes to `queue` and hands every delivery to `handler` on a
    /// spawned task.
    ///
    /// The task runs until the consumer is cancelled or the bus closes. A
    /// handler that fails or panics on one delivery does not end it.
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to consume from
    /// * `options` - Consumer tag and acknowledgement mode
    /// * `handler` - Handler invoked for every delivery, one at a time
    ///
    /// # Returns
    /// A handle to stop or await the consumer, or the subscription error
    pub async fn consume(
        &self,
        queue: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle, AmqpError> {
        let mut subscription = self.bus.subscribe(queue, &options).await?;
        let consumer_tag = subscription.consumer_tag().to_owned();

        let task = tokio::spawn({
            let bus = self.bus.clone();
            let queue = queue.to_owned();
            let tag = consumer_tag.clone();

            async move {
                let tracer = global::tracer("amqp consumer");

                while let Some(delivery) = subscription.next().await {
                    if let Err(err) =
                        consume(&tracer, &queue, &delivery, handler.as_ref(), bus.as_ref()).await
                    {
                        error!(error = err.to_string(), consumer_tag = %tag, "error consume msg");
                    }
                }

                debug!(consumer_tag = %tag, queue = %queue, "consumer stopped");
            }
        });

        Ok(ConsumerHandle {
            consumer_tag,
            bus: self.bus.clone(),
            task,
        })
    }
}

/// A running consumer started by `Dispatcher::consume`.
pub struct ConsumerHandle {
    consumer_tag: String,
    bus: Arc<dyn MessageBus>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the consumer and waits for the delivery in progress, if any,
    /// to finish.
    pub async fn stop(self) -> Result<(), AmqpError> {
        if let Err(err) = self.bus.cancel(&self.consumer_tag).await {
            self.task.abort();
            return Err(err);
        }

        if let Err(err) = self.task.await {
            error!(error = err.to_string(), "consumer task failed");
            return Err(AmqpError::InternalError);
        }

        Ok(())
    }

    /// Stops the consumer task without cancelling the subscription.
    ///
    /// Deliveries still held by the bus stay unacknowledged until the
    /// subscription goes away with its channel.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits until the consumer ends on its own.
    pub async fn wait(self) -> Result<(), AmqpError> {
        self.task.await.map_err(|err| {
            error!(error = err.to_string(), "consumer task failed");
            AmqpError::InternalError
        })
    }
}
