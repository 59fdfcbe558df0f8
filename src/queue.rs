// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues and Message Routing
//!
//! A [`Queue`] owns the routing table of one broker queue. Every delivery of
//! the queue is parsed into a [`Message`] and handed to the first registered
//! consumer that was attached through the delivery's exchange and whose
//! routing rule matches. If none matches, the queue's default handler gets the
//! message; without one the message is reported to the topology listeners as
//! unhandled.

use crate::{
    consumer::{Consumer, ConsumerHandler, Routing, RoutingMatcher},
    content::ContentParser,
    errors::{AmqpError, HandlerError},
    message::Message,
    otel,
    topology::{AmqpTopology, ConsumeCallback, WeakTopology},
    transport::{ChannelHandle, Delivery},
};
use futures_util::future::BoxFuture;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use tracing::{debug, error};

/// Process-local queue identity. Temporary queues are known by a sequence
/// number because the broker assigns their name on every declaration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueId {
    Named(String),
    Temporary(u64),
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueId::Named(name) => write!(f, "{}", name),
            QueueId::Temporary(id) => write!(f, "temporary#{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOptions {
    pub exclusive: bool,
    ///Default: true
    pub durable: bool,
    ///Default: true
    pub auto_delete: bool,
}

impl Default for QueueDeclareOptions {
    fn default() -> Self {
        Self {
            exclusive: false,
            durable: true,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueConsumeOptions {
    /// Generated from the queue name when missing.
    pub consumer_tag: Option<String>,
    pub no_ack: bool,
    pub exclusive: bool,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub declare: QueueDeclareOptions,
    pub consume: QueueConsumeOptions,
}

impl QueueOptions {
    /// Options of a server-named queue: exclusive, non-durable, auto-delete.
    pub fn temporary(no_ack: bool) -> QueueOptions {
        QueueOptions {
            declare: QueueDeclareOptions {
                exclusive: true,
                durable: false,
                auto_delete: true,
            },
            consume: QueueConsumeOptions {
                consumer_tag: None,
                no_ack,
                exclusive: true,
                priority: None,
            },
        }
    }
}

#[derive(Default)]
struct Routes {
    consumers: Vec<Consumer>,
    default: Option<Arc<dyn ConsumerHandler>>,
}

struct Router {
    routes: RwLock<Routes>,
    parser: Arc<RwLock<ContentParser>>,
    topology: WeakTopology,
}

impl Router {
    fn callback(self: &Arc<Self>) -> ConsumeCallback {
        let router = self.clone();
        Arc::new(
            move |queue: QueueId,
                  channel: ChannelHandle,
                  delivery: Option<Delivery>|
                  -> BoxFuture<'static, Result<(), HandlerError>> {
                Box::pin(router.clone().on_message(queue, channel, delivery))
            },
        )
    }

    async fn on_message(
        self: Arc<Self>,
        queue: QueueId,
        channel: ChannelHandle,
        delivery: Option<Delivery>,
    ) -> Result<(), HandlerError> {
        let Some(delivery) = delivery else {
            debug!(queue = queue.to_string(), "consumer cancelled by the broker");
            if let Some(topology) = self.topology.upgrade() {
                topology.restore_queue(&queue);
            }
            return Ok(());
        };

        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &delivery.routing_key);

        let msg = {
            let parser = self.parser.read().unwrap_or_else(PoisonError::into_inner);
            Message::new(delivery, channel, &parser)
        };

        debug!(
            "received: {} - exchange: {}",
            msg.routing_key(),
            msg.exchange(),
        );

        if let Some(err) = msg.parse_error() {
            debug!(error = err.to_string(), "message body could not be parsed");
        }

        let handler = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
            routes
                .consumers
                .iter()
                .find(|consumer| consumer.accepts(&msg))
                .map(|consumer| consumer.handler.clone())
                .or_else(|| routes.default.clone())
        };

        let Some(handler) = handler else {
            span.set_status(Status::Error {
                description: Cow::from("unhandled message"),
            });
            if let Some(topology) = self.topology.upgrade() {
                topology.report_unhandled(queue, msg);
            }
            return Ok(());
        };

        match handler.exec(&ctx, &msg).await {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), queue = queue.to_string(), "error handling msg");
                span.record_error(err.as_ref());
                span.set_status(Status::Error {
                    description: Cow::from("error handling msg"),
                });
                Err(err)
            }
        }
    }
}

/// Handle of a declared queue. Clones share the routing table.
#[derive(Clone)]
pub struct Queue {
    id: QueueId,
    topology: AmqpTopology,
    router: Arc<Router>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue").field("id", &self.id).finish()
    }
}

impl Queue {
    /// Process-local handle, stable across redeclarations.
    pub fn id(&self) -> &QueueId {
        &self.id
    }

    /// Server-side name, once the broker declared the queue.
    pub fn name(&self) -> Option<String> {
        self.topology.queue_name(&self.id)
    }

    /// Sets the handler for messages no routed consumer accepted.
    pub fn consume(&self, handler: Arc<dyn ConsumerHandler>) {
        self.router
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .default = Some(handler);
    }

    /// Binds the queue to `exchange` and routes matching messages of that
    /// exchange to `handler`.
    pub(crate) fn consume_routing(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        exchange: &str,
        routing: &Routing,
    ) -> Result<(), AmqpError> {
        let (routing_key, arguments) = routing.binding();
        self.topology
            .bind_queue(exchange, &self.id, &routing_key, arguments)?;

        self.router
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .consumers
            .push(Consumer {
                exchange: exchange.to_owned(),
                matcher: RoutingMatcher::new(routing),
                handler,
            });

        Ok(())
    }
}

/// Shared by the dispatcher and every exchange it hands out.
pub(crate) struct ConsumeContext {
    pub(crate) topology: AmqpTopology,
    pub(crate) parser: Arc<RwLock<ContentParser>>,
    named_queues: Mutex<HashMap<String, Queue>>,
}

impl ConsumeContext {
    pub(crate) fn new(topology: AmqpTopology) -> ConsumeContext {
        ConsumeContext {
            topology,
            parser: Arc::new(RwLock::new(ContentParser::default())),
            named_queues: Mutex::new(HashMap::new()),
        }
    }

    fn router(&self) -> Arc<Router> {
        Arc::new(Router {
            routes: RwLock::new(Routes::default()),
            parser: self.parser.clone(),
            topology: self.topology.downgrade(),
        })
    }

    /// Declares a named queue. Asking again for the same name returns the
    /// same routing table once the options were validated.
    pub(crate) fn named_queue(&self, name: &str, options: QueueOptions) -> Result<Queue, AmqpError> {
        let mut queues = self
            .named_queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(queue) = queues.get(name) {
            self.topology
                .declare_queue(name, options, queue.router.callback())?;
            return Ok(queue.clone());
        }

        let router = self.router();
        self.topology
            .declare_queue(name, options, router.callback())?;

        let queue = Queue {
            id: QueueId::Named(name.to_owned()),
            topology: self.topology.clone(),
            router,
        };
        queues.insert(name.to_owned(), queue.clone());

        Ok(queue)
    }

    pub(crate) fn temporary_queue(&self, no_ack: bool) -> Result<Queue, AmqpError> {
        let router = self.router();
        let id = self
            .topology
            .declare_temporary_queue(router.callback(), no_ack)?;

        Ok(Queue {
            id,
            topology: self.topology.clone(),
            router,
        })
    }
}
