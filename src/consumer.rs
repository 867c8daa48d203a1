// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Processes one delivery for the dispatcher: opens a consumer span from the
//! propagated trace context, runs the handler and settles the delivery
//! according to the returned `Disposition`. A handler that panics rejects
//! its delivery without requeue and leaves the consumer running.

use crate::{
    bus::MessageBus,
    dispatcher::{Disposition, MessageHandler},
    errors::AmqpError,
    message::Delivery,
    otel,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use futures_util::FutureExt;
use std::{borrow::Cow, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Runs `handler` on `delivery` and acknowledges it on `bus`.
///
/// The span is named after the message type, falling back to the queue name.
/// Deliveries that were auto-acknowledged are never settled again.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: &Delivery,
    handler: &dyn MessageHandler,
    bus: &dyn MessageBus,
) -> Result<(), AmqpError> {
    let name = delivery.metadata.kind.as_deref().unwrap_or(queue);
    let (ctx, mut span) = otel::new_span(&delivery.metadata.headers, tracer, name);

    debug!(
        exchange = %delivery.exchange,
        routing_key = %delivery.routing_key,
        redelivered = delivery.redelivered,
        "received: {}",
        name
    );

    let disposition = match AssertUnwindSafe(handler.handle(&ctx, delivery))
        .catch_unwind()
        .await
    {
        Ok(disposition) => disposition,
        Err(_) => {
            error!(
                routing_key = %delivery.routing_key,
                "handler panicked, message rejected"
            );
            Disposition::Reject { requeue: false }
        }
    };
    let auto_acked = delivery.ack.is_settled();

    match disposition {
        Disposition::Ack => {
            debug!("message successfully processed");
            if auto_acked {
                span.set_status(Status::Ok);
                return Ok(());
            }

            match bus.ack(&delivery.ack).await {
                Err(err) => {
                    error!("error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
            }
        }

        Disposition::Reject { requeue } => {
            warn!(requeue, "message rejected by handler");
            span.set_status(Status::Error {
                description: Cow::from("message rejected by handler"),
            });
            if auto_acked {
                return Ok(());
            }

            bus.nack(&delivery.ack, requeue).await.map_err(|err| {
                error!("error whiling nack msg");
                span.record_error(&err);
                err
            })
        }

        Disposition::Ignore => {
            debug!("message left unacknowledged");
            Ok(())
        }
    }
}
