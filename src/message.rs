// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Deliveries
//!
//! Broker-independent representations of what goes over the bus: the metadata
//! attached to a published message, a delivery handed to a subscriber, and the
//! handle used to acknowledge it.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;

/// Content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for plain text messages
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content encoding used for text payloads
pub const UTF8_ENCODING: &str = "UTF-8";

/// Properties travelling with a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Routing key the receiver should publish its reply under.
    pub reply_to: Option<String>,
    /// Token copied verbatim from a request onto its reply.
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub message_id: Option<String>,
    /// Application-level message type.
    pub kind: Option<String>,
    /// Requests broker-side persistence (delivery mode 2).
    pub persistent: bool,
    /// String headers, used for trace context propagation.
    pub headers: BTreeMap<String, String>,
}

impl MessageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// Identifies one delivery for acknowledgement.
///
/// Clones share settlement state: once any clone has been acked or nacked,
/// further acknowledgements of the same delivery are no-ops.
#[derive(Debug, Clone)]
pub struct AckHandle {
    delivery_tag: u64,
    settled: Arc<AtomicBool>,
}

impl AckHandle {
    pub fn new(delivery_tag: u64) -> Self {
        AckHandle {
            delivery_tag,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for a delivery the bus already acknowledged on hand-over.
    pub(crate) fn auto_acked(delivery_tag: u64) -> Self {
        AckHandle {
            delivery_tag,
            settled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Marks the delivery settled, returning `true` only for the first call.
    pub(crate) fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::SeqCst)
    }
}

/// A message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub metadata: MessageMetadata,
    pub payload: Vec<u8>,
    pub ack: AckHandle,
}

impl Delivery {
    /// Payload as text, replacing invalid UTF-8 sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Options for starting a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Consumer tag; empty lets the bus generate one.
    pub consumer_tag: String,
    /// Deliveries count as acknowledged as soon as they are handed over.
    pub auto_ack: bool,
    pub exclusive: bool,
}

impl SubscribeOptions {
    pub fn new(consumer_tag: &str) -> Self {
        SubscribeOptions {
            consumer_tag: consumer_tag.to_owned(),
            ..Default::default()
        }
    }

    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    pub fn manual_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Stream of deliveries for one consumer.
///
/// The stream ends once the consumer is cancelled or the bus is closed.
#[derive(Debug)]
pub struct Subscription {
    consumer_tag: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    pub fn new(consumer_tag: &str, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Subscription {
            consumer_tag: consumer_tag.to_owned(),
            receiver,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Waits for the next delivery.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}
