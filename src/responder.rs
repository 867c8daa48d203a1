// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Responder
//!
//! Serves requests from the well-known request queue. Each request payload
//! goes through a `Transform`; the result is published back on the request
//! exchange under the request's `reply_to` key, carrying the request's
//! correlation id unchanged.
//!
//! Requests are auto-acknowledged on delivery. A request whose transform
//! fails or panics is logged and lost, and the responder moves on to the
//! next one.

use crate::{
    bus::MessageBus,
    config::{AmqpConfig, RpcTopology},
    dispatcher::{ConsumerHandle, Dispatcher, Disposition, MessageHandler},
    errors::RpcError,
    message::{Delivery, MessageMetadata, SubscribeOptions},
    otel,
    queue::{QueueBinding, QueueDefinition},
    rabbitmq::AmqpBus,
    topology::{BusTopology, Topology},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Computes a reply payload from a request payload.
pub trait Transform: Send + Sync {
    fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, RpcError>;
}

impl<F> Transform for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, RpcError> + Send + Sync,
{
    fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        self(payload)
    }
}

/// Uppercases UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uppercase;

impl Transform for Uppercase {
    fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        std::str::from_utf8(payload)
            .map(|text| text.to_uppercase().into_bytes())
            .map_err(|err| RpcError::TransformFailure(err.to_string()))
    }
}

/// Server side of the request/response protocol.
pub struct RpcResponder {
    bus: Arc<dyn MessageBus>,
    topology: RpcTopology,
    consumer: Mutex<Option<ConsumerHandle>>,
}

impl RpcResponder {
    /// Connects to RabbitMQ and starts serving on its own channel.
    ///
    /// # Parameters
    /// * `cfg` - Connection settings for the broker
    /// * `topology` - Exchange, request queue and routing key to serve
    /// * `transform` - Computes each reply from its request payload
    ///
    /// # Returns
    /// A serving responder, or `RpcError::BusUnavailable` on any connection
    /// or declaration failure
    pub async fn connect<T>(
        cfg: &AmqpConfig,
        topology: RpcTopology,
        transform: T,
    ) -> Result<RpcResponder, RpcError>
    where
        T: Transform + 'static,
    {
        let bus = AmqpBus::connect(cfg)
            .await
            .map_err(RpcError::BusUnavailable)?;

        RpcResponder::new(Arc::new(bus), topology, transform).await
    }

    /// Declares the request exchange and queue, binds them under the request
    /// routing key and starts consuming with automatic acknowledgement.
    ///
    /// Dropping the responder without closing it stops serving.
    pub async fn new<T>(
        bus: Arc<dyn MessageBus>,
        topology: RpcTopology,
        transform: T,
    ) -> Result<RpcResponder, RpcError>
    where
        T: Transform + 'static,
    {
        let exchange = topology.exchange_definition();
        let queue = QueueDefinition::new(&topology.request_queue);
        let binding = QueueBinding::new(&topology.request_queue)
            .exchange(&topology.exchange)
            .routing_key(&topology.request_routing_key);

        BusTopology::new(bus.clone())
            .exchange(&exchange)
            .queue(&queue)
            .queue_binding(&binding)
            .install()
            .await
            .map_err(RpcError::BusUnavailable)?;

        let consumer = Dispatcher::new(bus.clone())
            .consume(
                &topology.request_queue,
                SubscribeOptions::new("").auto_ack(),
                Arc::new(RequestHandler {
                    bus: bus.clone(),
                    exchange: topology.exchange.clone(),
                    transform: Box::new(transform),
                }),
            )
            .await
            .map_err(RpcError::BusUnavailable)?;

        info!(
            queue = %topology.request_queue,
            routing_key = %topology.request_routing_key,
            "rpc responder awaiting requests"
        );

        Ok(RpcResponder {
            bus,
            topology,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    pub fn topology(&self) -> &RpcTopology {
        &self.topology
    }

    /// Stops consuming and closes the bus.
    pub async fn close(&self) -> Result<(), RpcError> {
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(consumer) = consumer else {
            return Ok(());
        };

        if let Err(err) = consumer.stop().await {
            warn!(error = err.to_string(), "failure to stop request consumer");
        }

        self.bus.close().await?;
        info!(queue = %self.topology.request_queue, "rpc responder closed");
        Ok(())
    }
}

impl Drop for RpcResponder {
    fn drop(&mut self) {
        if let Some(consumer) = self
            .consumer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            consumer.abort();
        }
    }
}

struct RequestHandler {
    bus: Arc<dyn MessageBus>,
    exchange: String,
    transform: Box<dyn Transform>,
}

#[async_trait]
impl MessageHandler for RequestHandler {
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Disposition {
        let (Some(reply_to), Some(correlation_id)) = (
            delivery.metadata.reply_to.as_deref(),
            delivery.metadata.correlation_id.as_deref(),
        ) else {
            warn!(
                routing_key = %delivery.routing_key,
                "request without reply address or correlation id, dropped"
            );
            return Disposition::Reject { requeue: false };
        };

        let reply = match self.transform.transform(&delivery.payload) {
            Ok(reply) => reply,
            Err(err) => {
                error!(error = err.to_string(), correlation_id, "failure to transform request");
                return Disposition::Reject { requeue: false };
            }
        };

        let mut metadata = MessageMetadata::new().with_correlation_id(correlation_id);
        otel::inject_context(ctx, &mut metadata.headers);

        if let Err(err) = self
            .bus
            .publish(&self.exchange, reply_to, &metadata, &reply)
            .await
        {
            error!(error = err.to_string(), correlation_id, "failure to publish reply");
            return Disposition::Reject { requeue: false };
        }

        debug!(correlation_id, reply_to, "reply published");
        Disposition::Ack
    }
}
