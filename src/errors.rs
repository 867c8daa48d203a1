// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Two error families live here. `AmqpError` covers everything the message bus
//! can fail at: connecting, declaring topology, publishing, acknowledging.
//! `RpcError` covers the request/response correlation layer built on top of it.

use crate::correlation::CorrelationId;
use thiserror::Error;

/// Represents errors that can occur during message bus operations.
///
/// Each variant names the operation that failed. Variants carrying a `String`
/// hold the name of the resource involved or the underlying cause.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error loading the TLS material for an `amqps` connection
    #[error("failure to load tls configuration `{0}`")]
    TlsConfigError(String),

    /// Error loading or deserializing configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// An exchange was redeclared with a different kind
    #[error("exchange `{0}` already declared with a different kind")]
    ExchangeKindMismatch(String),

    /// Publishing or binding against an exchange that was never declared
    #[error("unknown exchange `{0}`")]
    UnknownExchange(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Binding or consuming a queue that was never declared
    #[error("unknown queue `{0}`")]
    UnknownQueue(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The bus was closed and can no longer be used
    #[error("bus is closed")]
    ClosedError,
}

/// Errors surfaced by the request/response correlation layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The bus could not be set up while constructing a caller or responder.
    #[error("message bus unavailable: {0}")]
    BusUnavailable(AmqpError),

    /// A correlation identifier was registered twice. Never expected with
    /// random identifiers; treated as a broken contract.
    #[error("correlation id `{0}` is already pending")]
    DuplicateCorrelationId(CorrelationId),

    /// A bus operation failed after setup, typically while publishing a request.
    #[error(transparent)]
    Bus(#[from] AmqpError),

    /// No reply arrived before the request's deadline.
    #[error("request `{0}` timed out")]
    Timeout(CorrelationId),

    /// The caller was closed before a reply arrived.
    #[error("caller closed before the reply arrived")]
    Closed,

    /// The responder's transformation rejected a request payload.
    #[error("failure to transform request: {0}")]
    TransformFailure(String),

    /// A JSON request or reply could not be (de)serialized.
    #[error("failure to (de)serialize payload: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}
