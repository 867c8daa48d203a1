// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Request/response calls and publish/subscribe patterns over RabbitMQ.
//!
//! `RpcCaller` and `RpcResponder` implement correlation-id based RPC on top
//! of any `MessageBus`: `AmqpBus` talks to a broker through lapin and
//! `InMemoryBus` keeps everything inside the process.

mod consumer;
mod otel;

pub mod bus;
pub mod caller;
pub mod channel;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod message;
pub mod pending;
pub mod publisher;
pub mod pubsub;
pub mod queue;
pub mod rabbitmq;
pub mod responder;
pub mod tls;
pub mod topology;

pub use bus::MessageBus;
pub use caller::RpcCaller;
pub use config::{AmqpConfig, RpcTopology};
pub use correlation::CorrelationId;
pub use errors::{AmqpError, RpcError};
pub use memory::{InMemoryBroker, InMemoryBus};
pub use rabbitmq::AmqpBus;
pub use responder::{RpcResponder, Transform, Uppercase};
