// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module collects exchanges, queues and the bindings between them and
//! declares them through a `MessageBus` in one go.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `BusTopology`: Implementation of the Topology trait over any bus

use crate::{
    bus::MessageBus,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues and bindings,
/// as well as installing the topology on the broker.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Installs the topology, returning the declared queue names in the
    /// order the queues were added.
    async fn install(&self) -> Result<Vec<String>, AmqpError>;
}

/// Topology declared through a `MessageBus`.
///
/// Server-named queues only learn their name during `install`. A binding
/// with an empty queue name targets the last server-named queue declared
/// before it.
pub struct BusTopology<'tp> {
    bus: Arc<dyn MessageBus>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
}

impl<'tp> BusTopology<'tp> {
    pub fn new(bus: Arc<dyn MessageBus>) -> BusTopology<'tp> {
        BusTopology {
            bus,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for BusTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares all exchanges, then all queues, then binds them.
    async fn install(&self) -> Result<Vec<String>, AmqpError> {
        self.install_exchange().await?;
        let declared = self.install_queue().await?;
        self.binding_queues(&declared).await?;
        Ok(declared)
    }
}

impl BusTopology<'_> {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.bus.declare_exchange(exch).await?;
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<Vec<String>, AmqpError> {
        let mut declared = Vec::with_capacity(self.queues.len());
        for def in &self.queues {
            declared.push(self.bus.declare_queue(def).await?);
        }

        Ok(declared)
    }

    async fn binding_queues(&self, declared: &[String]) -> Result<(), AmqpError> {
        let server_named = self
            .queues
            .iter()
            .zip(declared)
            .filter(|(def, _)| def.is_server_named())
            .map(|(_, name)| name.as_str())
            .last();

        for binding in &self.queues_binding {
            if !binding.queue_name.is_empty() {
                self.bus.bind(binding).await?;
                continue;
            }

            let Some(queue) = server_named else {
                return Err(AmqpError::UnknownQueue(String::new()));
            };

            let resolved = QueueBinding::new(queue)
                .exchange(&binding.exchange_name)
                .routing_key(&binding.routing_key);
            self.bus.bind(&resolved).await?;
        }

        debug!("queues were bound");

        Ok(())
    }
}
