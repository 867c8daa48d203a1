// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection settings for the broker and the topology callers and responders
//! agree on. Both can be built in code or loaded from environment variables:
//!
//! - `RABBITMQ__HOST`, `RABBITMQ__PORT`, `RABBITMQ__USER`, `RABBITMQ__PASSWORD`,
//!   `RABBITMQ__VHOST`, `RABBITMQ__CONNECTION_NAME`, `RABBITMQ__TLS__CA_CERT_PATH`
//! - `RPC__EXCHANGE`, `RPC__EXCHANGE_DURABLE`, `RPC__REQUEST_QUEUE`,
//!   `RPC__REQUEST_ROUTING_KEY`, `RPC__REPLY_ROUTING_KEY`, `RPC__REQUEST_TIMEOUT_MS`

use crate::{errors::AmqpError, exchange::ExchangeDefinition, tls::TlsConfig};
use ::config::{Config, Environment};
use serde::{de::DeserializeOwned, Deserialize};
use std::time::Duration;

/// Prefix for broker connection environment variables.
pub const AMQP_ENV_PREFIX: &str = "RABBITMQ";
/// Prefix for RPC topology environment variables.
pub const RPC_ENV_PREFIX: &str = "RPC";

pub const DEFAULT_AMQP_PORT: u16 = 5672;
pub const DEFAULT_AMQPS_PORT: u16 = 5671;

pub const DEFAULT_RPC_EXCHANGE: &str = "elex.rpc.exchange";
pub const DEFAULT_RPC_QUEUE: &str = "elex.rpc.queue";
pub const DEFAULT_RPC_ROUTING_KEY: &str = "elex-routing-key";

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub host: String,
    /// Defaults to 5671 with TLS and 5672 without.
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name reported to the broker for this connection.
    pub connection_name: String,
    /// Connect over `amqps` when present.
    pub tls: Option<TlsConfig>,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: None,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: env!("CARGO_PKG_NAME").to_owned(),
            tls: None,
        }
    }
}

impl AmqpConfig {
    /// Loads settings from `RABBITMQ__*` environment variables.
    pub fn from_env() -> Result<Self, AmqpError> {
        load_with_prefix(AMQP_ENV_PREFIX)
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn port(&self) -> u16 {
        match (self.port, &self.tls) {
            (Some(port), _) => port,
            (None, Some(_)) => DEFAULT_AMQPS_PORT,
            (None, None) => DEFAULT_AMQP_PORT,
        }
    }

    /// Connection URI; the vhost is percent-encoded so `/` survives.
    pub fn uri(&self) -> String {
        let scheme = if self.tls.is_some() { "amqps" } else { "amqp" };
        format!(
            "{}://{}:{}@{}:{}/{}",
            scheme,
            self.user,
            self.password,
            self.host,
            self.port(),
            self.vhost.replace('/', "%2f")
        )
    }
}

/// Shared address space of callers and responders.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcTopology {
    /// Direct exchange carrying both requests and replies.
    pub exchange: String,
    /// Must match across every party declaring the exchange.
    pub exchange_durable: bool,
    /// Well-known queue the responders consume.
    pub request_queue: String,
    pub request_routing_key: String,
    /// Reply routing key shared by callers. When unset, each caller uses its
    /// bus-assigned reply queue name, which keeps replies private.
    pub reply_routing_key: Option<String>,
    /// Default deadline for requests; none means wait forever.
    pub request_timeout_ms: Option<u64>,
}

impl Default for RpcTopology {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_RPC_EXCHANGE.to_owned(),
            exchange_durable: true,
            request_queue: DEFAULT_RPC_QUEUE.to_owned(),
            request_routing_key: DEFAULT_RPC_ROUTING_KEY.to_owned(),
            reply_routing_key: None,
            request_timeout_ms: None,
        }
    }
}

impl RpcTopology {
    pub fn new(exchange: &str, request_queue: &str, request_routing_key: &str) -> Self {
        Self {
            exchange: exchange.to_owned(),
            request_queue: request_queue.to_owned(),
            request_routing_key: request_routing_key.to_owned(),
            ..Default::default()
        }
    }

    /// Loads the topology from `RPC__*` environment variables.
    pub fn from_env() -> Result<Self, AmqpError> {
        load_with_prefix(RPC_ENV_PREFIX)
    }

    pub fn with_reply_routing_key(mut self, key: &str) -> Self {
        self.reply_routing_key = Some(key.to_owned());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// The request exchange as every party must declare it.
    pub fn exchange_definition(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.exchange)
            .direct()
            .durable_if(self.exchange_durable)
    }
}

fn load_with_prefix<T: DeserializeOwned>(prefix: &str) -> Result<T, AmqpError> {
    Config::builder()
        .add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|cfg| cfg.try_deserialize::<T>())
        .map_err(|err| AmqpError::ConfigError(err.to_string()))
}
