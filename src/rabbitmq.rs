// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Bus
//!
//! `AmqpBus` implements `MessageBus` over one lapin connection and channel.
//! Each subscription gets a task that drains the lapin consumer stream into
//! the subscription's queue, so deliveries are handled away from the
//! connection's I/O loop.

use crate::{
    bus::MessageBus,
    channel::new_amqp_channel,
    config::AmqpConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{AckHandle, Delivery, MessageMetadata, SubscribeOptions, Subscription},
    publisher::{RabbitMQPublisher, PERSISTENT_DELIVERY_MODE},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
    Channel, Connection,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// `MessageBus` backed by a RabbitMQ channel.
pub struct AmqpBus {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    publisher: RabbitMQPublisher,
}

impl AmqpBus {
    /// Connects to the broker described by `cfg` and opens a channel.
    pub async fn connect(cfg: &AmqpConfig) -> Result<AmqpBus, AmqpError> {
        let (connection, channel) = new_amqp_channel(cfg).await?;
        Ok(AmqpBus::new(connection, channel))
    }

    pub fn new(connection: Arc<Connection>, channel: Arc<Channel>) -> AmqpBus {
        AmqpBus {
            connection,
            publisher: RabbitMQPublisher::new(channel.clone()),
            channel,
        }
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {:?}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                let name = queue.name().to_string();
                debug!("queue: {} was created", name);
                Ok(name)
            }
        }
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.publisher
            .publish(exchange, routing_key, metadata, payload)
            .await
    }

    async fn subscribe(
        &self,
        queue: &str,
        options: &SubscribeOptions,
    ) -> Result<Subscription, AmqpError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer.tag().to_string();
        let auto_ack = options.auto_ack;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn({
            let tag = tag.clone();
            async move {
                while let Some(result) = consumer.next().await {
                    match result {
                        Ok(delivery) => {
                            let ack = if auto_ack {
                                AckHandle::auto_acked(delivery.delivery_tag)
                            } else {
                                AckHandle::new(delivery.delivery_tag)
                            };

                            let delivery = Delivery {
                                exchange: delivery.exchange.to_string(),
                                routing_key: delivery.routing_key.to_string(),
                                redelivered: delivery.redelivered,
                                metadata: metadata_from_properties(&delivery.properties),
                                payload: delivery.data,
                                ack,
                            };

                            if tx.send(delivery).is_err() {
                                warn!(consumer_tag = %tag, "subscription dropped, stop forwarding");
                                break;
                            }
                        }
                        Err(err) => error!(error = err.to_string(), "errors consume msg"),
                    }
                }

                debug!(consumer_tag = %tag, "consumer stream ended");
            }
        });

        Ok(Subscription::new(&tag, rx))
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), AmqpError> {
        if !handle.settle() {
            return Ok(());
        }

        self.channel
            .basic_ack(handle.delivery_tag(), BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<(), AmqpError> {
        if !handle.settle() {
            return Ok(());
        }

        self.channel
            .basic_nack(
                handle.delivery_tag(),
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "OK").await {
            warn!(error = err.to_string(), "failure to close channel");
        }

        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError
            })
    }
}

/// Extracts the metadata carried by AMQP basic properties.
///
/// Only string-valued headers are kept; other header types are not used by
/// this crate.
pub(crate) fn metadata_from_properties(props: &AMQPProperties) -> MessageMetadata {
    let short = |value: &Option<lapin::types::ShortString>| value.as_ref().map(|v| v.to_string());

    let headers = match props.headers() {
        Some(table) => table
            .inner()
            .iter()
            .filter_map(|(key, value)| match value {
                AMQPValue::LongString(v) => Some((
                    key.to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )),
                AMQPValue::ShortString(v) => Some((key.to_string(), v.to_string())),
                _ => None,
            })
            .collect(),
        None => BTreeMap::new(),
    };

    MessageMetadata {
        reply_to: short(props.reply_to()),
        correlation_id: short(props.correlation_id()),
        content_type: short(props.content_type()),
        content_encoding: short(props.content_encoding()),
        message_id: short(props.message_id()),
        kind: short(props.kind()),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}
