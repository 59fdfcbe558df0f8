// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! [`RabbitMQDispatcher`] is the application entry point. It owns the topology
//! manager and the content pipeline, declares top-level queues and exchanges,
//! and exposes the manager's lifecycle events.
//!
//! ```no_run
//! # use rabbitmq_topology::{configs::*, dispatcher::RabbitMQDispatcher, exchange::QueueTarget};
//! # use rabbitmq_topology::consumer::ConsumerHandler;
//! # use std::sync::Arc;
//! # async fn run(handler: Arc<dyn ConsumerHandler>) -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = RabbitMQDispatcher::connect(
//!     &RabbitMQConfigs::from_env(),
//!     &TopologyConfigs::default(),
//! );
//!
//! dispatcher
//!     .topic("orders", None)?
//!     .consume(QueueTarget::named("billing"), &["orders.*.created"], handler)?;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::LapinTransport,
    configs::{RabbitMQConfigs, TopologyConfigs},
    consumer::ConsumerHandler,
    content::{ContentParser, Decoder, Parser},
    errors::AmqpError,
    exchange::{
        DirectExchange, ExchangeKind, ExchangeOptions, FanoutExchange, HeadersExchange,
        RoutedExchange, TopicExchange,
    },
    queue::{ConsumeContext, Queue, QueueOptions},
    topology::{AmqpTopology, ManagerEvent},
    transport::Transport,
};
use std::sync::{Arc, PoisonError, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// Entry point owning the topology manager and the content pipeline.
pub struct RabbitMQDispatcher {
    ctx: Arc<ConsumeContext>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher over any transport.
    pub fn new(transport: Arc<dyn Transport>, configs: &TopologyConfigs) -> Self {
        RabbitMQDispatcher {
            ctx: Arc::new(ConsumeContext::new(AmqpTopology::new(transport, configs))),
        }
    }

    /// Creates a dispatcher backed by a lapin connection. The connection is
    /// opened by the first setup cycle.
    pub fn connect(cfg: &RabbitMQConfigs, configs: &TopologyConfigs) -> Self {
        debug!(host = cfg.host, "creating rabbitmq dispatcher");
        Self::new(Arc::new(LapinTransport::new(cfg)), configs)
    }

    /// Underlying manager, for declarations the builders do not cover.
    pub fn topology(&self) -> &AmqpTopology {
        &self.ctx.topology
    }

    /// Receives setup outcomes, unhandled messages and channel closures.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        self.ctx.topology.subscribe()
    }

    /// Declares a named queue. Options default to a durable, auto-delete,
    /// non-exclusive queue consumed in ack mode.
    pub fn queue(&self, name: &str, options: Option<QueueOptions>) -> Result<Queue, AmqpError> {
        self.ctx.named_queue(name, options.unwrap_or_default())
    }

    /// Declares a server-named, exclusive queue.
    ///
    /// # Parameters
    /// * `no_ack` - Consume without acknowledgements
    ///
    /// # Returns
    /// A handle usable right away. [`Queue::name`] stays `None` until the
    /// broker assigned a name.
    pub fn temporary_queue(&self, no_ack: bool) -> Result<Queue, AmqpError> {
        self.ctx.temporary_queue(no_ack)
    }

    /// Consumes every message of a named queue with `handler`.
    pub fn consume(
        &self,
        name: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: Option<QueueOptions>,
    ) -> Result<Queue, AmqpError> {
        let queue = self.queue(name, options)?;
        queue.consume(handler);
        Ok(queue)
    }

    /// Declares a top-level fanout exchange.
    ///
    /// # Parameters
    /// * `name` - Exchange name
    /// * `options` - Declare options, durable and not internal by default
    ///
    /// # Returns
    /// A builder for consumers and child exchanges, or `ConfigurationConflict`
    /// when `name` was declared with another kind or other options.
    pub fn fanout(
        &self,
        name: &str,
        options: Option<ExchangeOptions>,
    ) -> Result<FanoutExchange, AmqpError> {
        FanoutExchange::declare(self.ctx.clone(), name, options.unwrap_or_default())
    }

    /// Declares a top-level direct exchange. See [`RabbitMQDispatcher::fanout`].
    pub fn direct(
        &self,
        name: &str,
        options: Option<ExchangeOptions>,
    ) -> Result<DirectExchange, AmqpError> {
        RoutedExchange::declare(
            self.ctx.clone(),
            name,
            ExchangeKind::Direct,
            options.unwrap_or_default(),
        )
    }

    /// Declares a top-level topic exchange. Consumers match routing keys
    /// locally with the same `*` and `#` rules the broker applies.
    pub fn topic(
        &self,
        name: &str,
        options: Option<ExchangeOptions>,
    ) -> Result<TopicExchange, AmqpError> {
        RoutedExchange::declare(
            self.ctx.clone(),
            name,
            ExchangeKind::Topic,
            options.unwrap_or_default(),
        )
    }

    /// Declares a top-level headers exchange.
    pub fn headers(
        &self,
        name: &str,
        options: Option<ExchangeOptions>,
    ) -> Result<HeadersExchange, AmqpError> {
        HeadersExchange::declare(self.ctx.clone(), name, options.unwrap_or_default())
    }

    fn parser(&self) -> RwLockWriteGuard<'_, ContentParser> {
        self.ctx
            .parser
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a decoder for a `content-encoding` token, e.g. `gzip`.
    pub fn set_decoder(&self, encoding: &str, decoder: Decoder) {
        self.parser().set_decoder(encoding, decoder);
    }

    /// Decoder for messages without a `content-encoding`.
    pub fn set_default_decoder(&self, decoder: Decoder) {
        self.parser().set_default_decoder(decoder);
    }

    /// Registers a parser for a mime type, e.g. `application/xml`.
    pub fn set_parser(&self, mime_type: &str, parser: Parser) {
        self.parser().set_parser(mime_type, parser);
    }

    /// Parser for messages without a `content-type`.
    pub fn set_default_parser(&self, parser: Parser) {
        self.parser().set_default_parser(parser);
    }

    /// Stops topology restoration and closes the transport.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.ctx.topology.close().await
    }
}
