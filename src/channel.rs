// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels.
//! Plain connections use `amqp://`; when the configuration carries TLS
//! settings the connection is made over `amqps://` with the configured
//! trust store.

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// This function establishes a connection to RabbitMQ using `cfg`, then
/// creates a channel on that connection. Both are wrapped in `Arc` so the
/// consumer tasks can hold on to them.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), rabbitmq_rpc::errors::AmqpError> {
/// use rabbitmq_rpc::{channel::new_amqp_channel, config::AmqpConfig};
///
/// let (conn, channel) = new_amqp_channel(&AmqpConfig::default()).await?;
/// # Ok(())
/// # }
/// ```
pub async fn new_amqp_channel(
    cfg: &AmqpConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!(host = %cfg.host, port = cfg.port(), "creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let uri = cfg.uri();

    let connected = match &cfg.tls {
        Some(tls) => {
            let tls_config = tls.connector_config()?;
            Connection::connect_with_config(&uri, options, tls_config).await
        }
        None => Connection::connect(&uri, options).await,
    };

    let conn = match connected {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!(tls = cfg.tls.is_some(), "amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}
