// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages to RabbitMQ exchanges on behalf of
//! `AmqpBus`. It maps `MessageMetadata` onto AMQP basic properties and
//! propagates OpenTelemetry trace context in the message headers.

use crate::{errors::AmqpError, message::MessageMetadata, otel};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// AMQP delivery mode asking the broker to persist the message.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// AMQP delivery mode for transient messages.
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Publishes messages over one RabbitMQ channel.
pub struct RabbitMQPublisher {
    channel: Arc<Channel>,
}

impl RabbitMQPublisher {
    pub fn new(channel: Arc<Channel>) -> RabbitMQPublisher {
        RabbitMQPublisher { channel }
    }

    /// Publishes `payload` to `exchange` under `routing_key`.
    ///
    /// The current OpenTelemetry context is injected next to the metadata's
    /// own headers. Publisher confirms are not awaited.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        metadata: &MessageMetadata,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let mut headers = metadata.headers.clone();
        otel::inject_context(&Context::current(), &mut headers);

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties(metadata, &headers),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
        }
    }
}

/// Maps metadata onto AMQP basic properties.
pub(crate) fn properties(
    metadata: &MessageMetadata,
    headers: &BTreeMap<String, String>,
) -> BasicProperties {
    let mut props = BasicProperties::default().with_delivery_mode(if metadata.persistent {
        PERSISTENT_DELIVERY_MODE
    } else {
        TRANSIENT_DELIVERY_MODE
    });

    if let Some(reply_to) = &metadata.reply_to {
        props = props.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(correlation_id) = &metadata.correlation_id {
        props = props.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(content_type) = &metadata.content_type {
        props = props.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(encoding) = &metadata.content_encoding {
        props = props.with_content_encoding(ShortString::from(encoding.as_str()));
    }
    if let Some(message_id) = &metadata.message_id {
        props = props.with_message_id(ShortString::from(message_id.as_str()));
    }
    if let Some(kind) = &metadata.kind {
        props = props.with_kind(ShortString::from(kind.as_str()));
    }
    if !headers.is_empty() {
        props = props.with_headers(field_table(headers));
    }

    props
}

fn field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            )
        })
        .collect();

    FieldTable::from(btree)
}
