// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Caller
//!
//! Turns one-way publish/consume into request/response calls. Every request
//! carries a fresh correlation id and the caller's reply routing key; the
//! caller keeps the handler waiting for it in a `PendingRequests` table and
//! a reply consumer task matches incoming replies back to their handler.
//!
//! Replies may arrive in any order. A reply whose correlation id is unknown
//! (already answered, expired, or foreign) is dropped without an ack.
//!
//! Requests wait forever by default. When a timeout is configured on the
//! topology or passed per call, a background sweep expires overdue entries
//! and invokes their handler with `RpcError::Timeout`.

use crate::{
    bus::MessageBus,
    config::{AmqpConfig, RpcTopology},
    correlation::CorrelationId,
    dispatcher::{ConsumerHandle, Dispatcher, Disposition, MessageHandler},
    errors::{AmqpError, RpcError},
    message::{
        Delivery, MessageMetadata, SubscribeOptions, JSON_CONTENT_TYPE, TEXT_CONTENT_TYPE,
        UTF8_ENCODING,
    },
    pending::{PendingRequests, ReplyResult, ResponseHandler},
    queue::{QueueBinding, QueueDefinition},
    rabbitmq::AmqpBus,
    topology::{BusTopology, Topology},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Client side of the request/response protocol.
pub struct RpcCaller {
    bus: Arc<dyn MessageBus>,
    topology: RpcTopology,
    pending: Arc<PendingRequests>,
    reply_queue: String,
    reply_routing_key: String,
    consumer: Mutex<Option<ConsumerHandle>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RpcCaller {
    /// Connects to RabbitMQ and sets the caller up on its own channel.
    ///
    /// # Parameters
    /// * `cfg` - Connection settings for the broker
    /// * `topology` - Exchange and routing keys shared with the responder
    ///
    /// # Returns
    /// A ready caller, or `RpcError::BusUnavailable` if the broker cannot be
    /// reached or the topology cannot be declared
    pub async fn connect(cfg: &AmqpConfig, topology: RpcTopology) -> Result<RpcCaller, RpcError> {
        let bus = AmqpBus::connect(cfg)
            .await
            .map_err(RpcError::BusUnavailable)?;

        RpcCaller::new(Arc::new(bus), topology).await
    }

    /// Declares the request exchange and a private reply queue on `bus`, then
    /// starts consuming replies with manual acknowledgement.
    ///
    /// The bus belongs to this caller from now on and is closed by `close`.
    /// Dropping the caller without closing it stops its background tasks.
    ///
    /// # Parameters
    /// * `bus` - The message bus to send requests and receive replies on
    /// * `topology` - Exchange and routing keys shared with the responder
    ///
    /// # Returns
    /// A ready caller, or `RpcError::BusUnavailable` if any declaration,
    /// binding or subscription fails
    pub async fn new(bus: Arc<dyn MessageBus>, topology: RpcTopology) -> Result<RpcCaller, RpcError> {
        let exchange = topology.exchange_definition();
        let queue = QueueDefinition::server_named();

        let declared = BusTopology::new(bus.clone())
            .exchange(&exchange)
            .queue(&queue)
            .install()
            .await
            .map_err(RpcError::BusUnavailable)?;

        let reply_queue = declared
            .into_iter()
            .next()
            .ok_or(RpcError::BusUnavailable(AmqpError::InternalError))?;

        let reply_routing_key = topology
            .reply_routing_key
            .clone()
            .unwrap_or_else(|| reply_queue.clone());

        bus.bind(
            &QueueBinding::new(&reply_queue)
                .exchange(&topology.exchange)
                .routing_key(&reply_routing_key),
        )
        .await
        .map_err(RpcError::BusUnavailable)?;

        let pending = Arc::new(PendingRequests::new());
        let consumer = Dispatcher::new(bus.clone())
            .consume(
                &reply_queue,
                SubscribeOptions::new("").manual_ack(),
                Arc::new(ReplyHandler {
                    pending: pending.clone(),
                }),
            )
            .await
            .map_err(RpcError::BusUnavailable)?;

        info!(
            reply_queue = %reply_queue,
            reply_routing_key = %reply_routing_key,
            "rpc caller ready"
        );

        let caller = RpcCaller {
            bus,
            pending,
            reply_queue,
            reply_routing_key,
            consumer: Mutex::new(Some(consumer)),
            sweeper: Mutex::new(None),
            closed: AtomicBool::new(false),
            topology,
        };

        if let Some(timeout) = caller.topology.request_timeout() {
            caller.ensure_sweeper(timeout);
        }

        Ok(caller)
    }

    /// Publishes `payload` as a request and returns at once.
    ///
    /// `handler` runs exactly once on the reply consumer task when the reply
    /// arrives, or with `RpcError::Timeout` if the topology sets a timeout
    /// and it passes first. Handlers should not block. A handler that panics
    /// loses its reply but does not stop the caller.
    ///
    /// # Parameters
    /// * `payload` - Request body, sent as UTF-8 text
    /// * `handler` - Callback receiving the reply payload or the failure
    ///
    /// # Returns
    /// The correlation id of the published request. If publishing fails the
    /// request is forgotten and `handler` is dropped without being invoked.
    pub async fn call<F>(&self, payload: &[u8], handler: F) -> Result<CorrelationId, RpcError>
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        self.send(
            payload,
            TEXT_CONTENT_TYPE,
            self.topology.request_timeout(),
            Box::new(handler),
        )
        .await
        .map(Registration::keep)
    }

    /// Like `call`, with a deadline for this request only.
    pub async fn call_with_timeout<F>(
        &self,
        payload: &[u8],
        timeout: Duration,
        handler: F,
    ) -> Result<CorrelationId, RpcError>
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        self.send(payload, TEXT_CONTENT_TYPE, Some(timeout), Box::new(handler))
            .await
            .map(Registration::keep)
    }

    /// Sends a request and waits for its reply.
    ///
    /// Fails with `RpcError::Closed` if the caller is closed first. Dropping
    /// the returned future withdraws the request, and a late reply is then
    /// dropped as unmatched.
    pub async fn request(&self, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.request_with(payload, TEXT_CONTENT_TYPE, self.topology.request_timeout())
            .await
    }

    pub async fn request_with_timeout(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        self.request_with(payload, TEXT_CONTENT_TYPE, Some(timeout))
            .await
    }

    /// Sends `body` as JSON and decodes the reply as JSON.
    pub async fn request_json<Req, Resp>(&self, body: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body)?;
        let reply = self
            .request_with(&payload, JSON_CONTENT_TYPE, self.topology.request_timeout())
            .await?;

        Ok(serde_json::from_slice(&reply)?)
    }

    /// Number of requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_requests(&self) -> &PendingRequests {
        &self.pending
    }

    /// Bus-assigned name of the private reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Routing key requests carry as their reply address.
    pub fn reply_routing_key(&self) -> &str {
        &self.reply_routing_key
    }

    pub fn topology(&self) -> &RpcTopology {
        &self.topology
    }

    /// Stops the reply consumer, closes the bus and drops every pending
    /// handler without invoking it.
    pub async fn close(&self) -> Result<(), RpcError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(sweeper) = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.abort();
        }

        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(consumer) = consumer {
            if let Err(err) = consumer.stop().await {
                warn!(error = err.to_string(), "failure to stop reply consumer");
            }
        }

        let abandoned = self.pending.len();
        self.pending.clear();
        if abandoned > 0 {
            warn!(abandoned, "caller closed with requests pending");
        }

        self.bus.close().await?;
        info!(reply_queue = %self.reply_queue, "rpc caller closed");
        Ok(())
    }

    async fn request_with(
        &self,
        payload: &[u8],
        content_type: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RpcError> {
        let (tx, rx) = oneshot::channel();
        let _registration = self
            .send(
                payload,
                content_type,
                timeout,
                Box::new(move |reply| {
                    let _ = tx.send(reply);
                }),
            )
            .await?;

        rx.await.map_err(|_| RpcError::Closed)?
    }

    async fn send(
        &self,
        payload: &[u8],
        content_type: &str,
        timeout: Option<Duration>,
        handler: ResponseHandler,
    ) -> Result<Registration<'_>, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }

        let id = CorrelationId::new();
        let deadline = timeout.map(|timeout| {
            self.ensure_sweeper(timeout);
            (Instant::now() + timeout).into_std()
        });

        self.pending.register(id, handler, deadline)?;
        let registration = Registration {
            pending: &self.pending,
            id,
        };

        let metadata = MessageMetadata::new()
            .with_reply_to(&self.reply_routing_key)
            .with_correlation_id(id.to_string())
            .with_content_type(content_type)
            .with_content_encoding(UTF8_ENCODING)
            .with_message_id(Uuid::new_v4().to_string())
            .persistent();

        if let Err(err) = self
            .bus
            .publish(
                &self.topology.exchange,
                &self.topology.request_routing_key,
                &metadata,
                payload,
            )
            .await
        {
            error!(error = err.to_string(), correlation_id = %id, "failure to publish request");
            return Err(RpcError::Bus(err));
        }

        debug!(correlation_id = %id, "request published");
        Ok(registration)
    }

    fn ensure_sweeper(&self, timeout: Duration) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }

        *sweeper = Some(tokio::spawn(sweep(
            Arc::downgrade(&self.pending),
            sweep_interval(timeout),
        )));
    }
}

impl Drop for RpcCaller {
    fn drop(&mut self) {
        if let Some(sweeper) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sweeper.abort();
        }

        if let Some(consumer) = self
            .consumer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            debug!(reply_queue = %self.reply_queue, "rpc caller dropped without close");
            consumer.abort();
        }
    }
}

/// A request registered in the pending table.
///
/// Removes the entry when dropped, unless `keep` hands it over to the reply
/// consumer. Once a reply or timeout has taken the entry, dropping is a no-op.
struct Registration<'a> {
    pending: &'a PendingRequests,
    id: CorrelationId,
}

impl Registration<'_> {
    fn keep(self) -> CorrelationId {
        let id = self.id;
        std::mem::forget(self);
        id
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.pending.take(&self.id).is_some() {
            debug!(correlation_id = %self.id, "request withdrawn");
        }
    }
}

/// Half the timeout, clamped to 10..=100ms.
fn sweep_interval(timeout: Duration) -> Duration {
    (timeout / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

async fn sweep(pending: Weak<PendingRequests>, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(pending) = pending.upgrade() else {
            return;
        };

        for (id, handler) in pending.expire(Instant::now().into_std()) {
            warn!(correlation_id = %id, "request timed out");
            let expired = AssertUnwindSafe(|| handler(Err(RpcError::Timeout(id))));
            if panic::catch_unwind(expired).is_err() {
                error!(correlation_id = %id, "response handler panicked on timeout");
            }
        }
    }
}

struct ReplyHandler {
    pending: Arc<PendingRequests>,
}

#[async_trait]
impl MessageHandler for ReplyHandler {
    async fn handle(&self, _ctx: &Context, delivery: &Delivery) -> Disposition {
        let Some(raw) = delivery.metadata.correlation_id.as_deref() else {
            debug!("reply without correlation id, dropped");
            return Disposition::Ignore;
        };

        let Ok(id) = raw.parse::<CorrelationId>() else {
            debug!(correlation_id = raw, "reply with foreign correlation id, dropped");
            return Disposition::Ignore;
        };

        match self.pending.take(&id) {
            Some(handler) => {
                handler(Ok(delivery.payload.clone()));
                Disposition::Ack
            }
            None => {
                debug!(correlation_id = %id, "unmatched reply, dropped");
                Disposition::Ignore
            }
        }
    }
}
