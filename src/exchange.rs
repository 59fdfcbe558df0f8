// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! Exchanges are declared through the dispatcher or by chaining from another
//! exchange. Chaining declares the new exchange (internal by default) and
//! binds it to the parent with the given routing. Consuming from an exchange
//! declares or reuses a queue, binds it and registers the handler on the
//! queue's routing table.

use crate::{
    consumer::{ConsumerHandler, Routing, RoutingHeaders},
    errors::AmqpError,
    queue::{ConsumeContext, Queue, QueueOptions},
};
use std::{fmt, sync::Arc};

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOptions {
    ///Default: true
    pub durable: bool,
    pub auto_delete: bool,
    /// Internal exchanges only receive messages from other exchanges.
    pub internal: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            internal: false,
        }
    }
}

impl ExchangeOptions {
    /// Defaults of an exchange created by chaining.
    pub fn internal() -> Self {
        Self {
            internal: true,
            ..Self::default()
        }
    }
}

/// Queue a consume call reads from.
#[derive(Debug, Clone)]
pub enum QueueTarget {
    /// A new server-named queue.
    Temporary { no_ack: bool },
    /// A named queue, declared with the given options or the named defaults.
    Named {
        name: String,
        options: Option<QueueOptions>,
    },
    Existing(Queue),
}

impl QueueTarget {
    pub fn temporary() -> QueueTarget {
        QueueTarget::Temporary { no_ack: false }
    }

    pub fn named(name: &str) -> QueueTarget {
        QueueTarget::Named {
            name: name.to_owned(),
            options: None,
        }
    }
}

impl From<Queue> for QueueTarget {
    fn from(queue: Queue) -> Self {
        QueueTarget::Existing(queue)
    }
}

/// Anything that can be bound below another exchange.
pub trait AmqpExchange {
    fn name(&self) -> &str;
}

#[derive(Clone)]
struct ExchangeCore {
    ctx: Arc<ConsumeContext>,
    name: String,
}

impl fmt::Debug for ExchangeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange").field("name", &self.name).finish()
    }
}

impl ExchangeCore {
    fn declare(
        ctx: Arc<ConsumeContext>,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<ExchangeCore, AmqpError> {
        ctx.topology.declare_exchange(name, kind, options)?;

        Ok(ExchangeCore {
            ctx,
            name: name.to_owned(),
        })
    }

    fn consume(
        &self,
        target: QueueTarget,
        routings: &[Routing],
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Queue, AmqpError> {
        let queue = match target {
            QueueTarget::Temporary { no_ack } => self.ctx.temporary_queue(no_ack)?,
            QueueTarget::Named { name, options } => self
                .ctx
                .named_queue(&name, options.unwrap_or_default())?,
            QueueTarget::Existing(queue) => queue,
        };

        for routing in routings {
            queue.consume_routing(handler.clone(), &self.name, routing)?;
        }

        Ok(queue)
    }

    fn child(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: Option<ExchangeOptions>,
    ) -> Result<ExchangeCore, AmqpError> {
        ExchangeCore::declare(
            self.ctx.clone(),
            name,
            kind,
            options.unwrap_or_else(ExchangeOptions::internal),
        )
    }

    fn bind<E: AmqpExchange>(&self, exchange: E, routings: &[Routing]) -> Result<E, AmqpError> {
        for routing in routings {
            let (routing_key, arguments) = routing.binding();
            self.ctx
                .topology
                .bind_exchange(&self.name, exchange.name(), &routing_key, arguments)?;
        }

        Ok(exchange)
    }
}

fn routing_keys(keys: &[&str]) -> Vec<Routing> {
    keys.iter().map(|key| Routing::from(*key)).collect()
}

/// Broadcasts every message to each bound queue and exchange.
#[derive(Debug, Clone)]
pub struct FanoutExchange {
    core: ExchangeCore,
}

impl AmqpExchange for FanoutExchange {
    fn name(&self) -> &str {
        &self.core.name
    }
}

impl FanoutExchange {
    pub(crate) fn declare(
        ctx: Arc<ConsumeContext>,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<Self, AmqpError> {
        let core = ExchangeCore::declare(ctx, name, ExchangeKind::Fanout, options)?;
        Ok(Self { core })
    }

    /// Binds `target` to this exchange and hands every message it routes
    /// there to `handler`.
    ///
    /// # Parameters
    /// * `target` - Queue to bind, declared on demand when named or temporary
    /// * `handler` - Handler for the messages of this exchange
    ///
    /// # Returns
    /// The bound queue, to attach further consumers to
    pub fn consume(
        &self,
        target: QueueTarget,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Queue, AmqpError> {
        self.core.consume(target, &[Routing::from("")], handler)
    }

    /// Declares an internal fanout exchange bound below this one.
    pub fn fanout(
        &self,
        name: &str,
        options: Option<ExchangeOptions>,
    ) -> Result<FanoutExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Fanout, options)?;
        self.exchange(FanoutExchange { core })
    }

    pub fn direct(
        &self,
        name: &str,
        options: Option<ExchangeOptions>,
    ) -> Result<DirectExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Direct, options)?;
        self.exchange(RoutedExchange { core })
    }

    pub fn topic(
        &self,
        name: &str,
        options: Option<ExchangeOptions>,
    ) -> Result<TopicExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Topic, options)?;
        self.exchange(RoutedExchange { core })
    }

    pub fn headers(
        &self,
        name: &str,
        options: Option<ExchangeOptions>,
    ) -> Result<HeadersExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Headers, options)?;
        self.exchange(HeadersExchange { core })
    }

    /// Binds an already declared exchange below this one.
    pub fn exchange<E: AmqpExchange>(&self, exchange: E) -> Result<E, AmqpError> {
        self.core.bind(exchange, &[Routing::from("")])
    }
}

/// Routes by routing key: exact match for direct exchanges, patterns for
/// topic exchanges. Every call takes a list of keys and creates one binding
/// per key.
#[derive(Debug, Clone)]
pub struct RoutedExchange {
    core: ExchangeCore,
}

pub type DirectExchange = RoutedExchange;
pub type TopicExchange = RoutedExchange;

impl AmqpExchange for RoutedExchange {
    fn name(&self) -> &str {
        &self.core.name
    }
}

impl RoutedExchange {
    pub(crate) fn declare(
        ctx: Arc<ConsumeContext>,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<Self, AmqpError> {
        let core = ExchangeCore::declare(ctx, name, kind, options)?;
        Ok(Self { core })
    }

    /// Binds `target` once per key and routes messages whose key matches one
    /// of `keys` to `handler`.
    ///
    /// # Parameters
    /// * `target` - Queue to bind
    /// * `keys` - Routing keys or topic patterns, an empty list binds nothing
    /// * `handler` - Handler for matching messages
    pub fn consume(
        &self,
        target: QueueTarget,
        keys: &[&str],
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Queue, AmqpError> {
        self.core.consume(target, &routing_keys(keys), handler)
    }

    pub fn fanout(
        &self,
        name: &str,
        keys: &[&str],
        options: Option<ExchangeOptions>,
    ) -> Result<FanoutExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Fanout, options)?;
        self.exchange(FanoutExchange { core }, keys)
    }

    pub fn direct(
        &self,
        name: &str,
        keys: &[&str],
        options: Option<ExchangeOptions>,
    ) -> Result<DirectExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Direct, options)?;
        self.exchange(RoutedExchange { core }, keys)
    }

    pub fn topic(
        &self,
        name: &str,
        keys: &[&str],
        options: Option<ExchangeOptions>,
    ) -> Result<TopicExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Topic, options)?;
        self.exchange(RoutedExchange { core }, keys)
    }

    pub fn headers(
        &self,
        name: &str,
        keys: &[&str],
        options: Option<ExchangeOptions>,
    ) -> Result<HeadersExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Headers, options)?;
        self.exchange(HeadersExchange { core }, keys)
    }

    /// Binds an already declared exchange below this one, once per key.
    pub fn exchange<E: AmqpExchange>(&self, exchange: E, keys: &[&str]) -> Result<E, AmqpError> {
        self.core.bind(exchange, &routing_keys(keys))
    }
}

/// Routes by application headers.
#[derive(Debug, Clone)]
pub struct HeadersExchange {
    core: ExchangeCore,
}

impl AmqpExchange for HeadersExchange {
    fn name(&self) -> &str {
        &self.core.name
    }
}

impl HeadersExchange {
    pub(crate) fn declare(
        ctx: Arc<ConsumeContext>,
        name: &str,
        options: ExchangeOptions,
    ) -> Result<Self, AmqpError> {
        let core = ExchangeCore::declare(ctx, name, ExchangeKind::Headers, options)?;
        Ok(Self { core })
    }

    /// Binds `target` with `headers` as binding arguments. Messages are
    /// matched locally against the same headers before reaching `handler`.
    pub fn consume(
        &self,
        target: QueueTarget,
        headers: RoutingHeaders,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Queue, AmqpError> {
        self.core.consume(target, &[Routing::from(headers)], handler)
    }

    pub fn fanout(
        &self,
        name: &str,
        headers: RoutingHeaders,
        options: Option<ExchangeOptions>,
    ) -> Result<FanoutExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Fanout, options)?;
        self.exchange(FanoutExchange { core }, headers)
    }

    pub fn direct(
        &self,
        name: &str,
        headers: RoutingHeaders,
        options: Option<ExchangeOptions>,
    ) -> Result<DirectExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Direct, options)?;
        self.exchange(RoutedExchange { core }, headers)
    }

    pub fn topic(
        &self,
        name: &str,
        headers: RoutingHeaders,
        options: Option<ExchangeOptions>,
    ) -> Result<TopicExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Topic, options)?;
        self.exchange(RoutedExchange { core }, headers)
    }

    pub fn headers(
        &self,
        name: &str,
        headers: RoutingHeaders,
        options: Option<ExchangeOptions>,
    ) -> Result<HeadersExchange, AmqpError> {
        let core = self.core.child(name, ExchangeKind::Headers, options)?;
        self.exchange(HeadersExchange { core }, headers)
    }

    pub fn exchange<E: AmqpExchange>(
        &self,
        exchange: E,
        headers: RoutingHeaders,
    ) -> Result<E, AmqpError> {
        self.core.bind(exchange, &[Routing::from(headers)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::TopologyConfigs,
        consumer::MockConsumerHandler,
        errors::ConflictKind,
        headers_pattern::AMQP_HEADERS_MATCH,
        mocks::{wait_setup, FakeTransport},
        queue::QueueId,
        topology::AmqpTopology,
    };
    use lapin::types::{AMQPValue, LongString};

    fn context(transport: &Arc<FakeTransport>) -> Arc<ConsumeContext> {
        Arc::new(ConsumeContext::new(AmqpTopology::new(
            transport.clone(),
            &TopologyConfigs::default(),
        )))
    }

    fn handler() -> Arc<dyn ConsumerHandler> {
        Arc::new(MockConsumerHandler::new())
    }

    #[test]
    fn converts_to_lapin_kinds() {
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        );
        assert_eq!(
            lapin::ExchangeKind::from(ExchangeKind::Headers),
            lapin::ExchangeKind::Headers
        );
    }

    #[test]
    fn option_defaults() {
        let options = ExchangeOptions::default();
        assert!(options.durable);
        assert!(!options.auto_delete);
        assert!(!options.internal);
        assert!(ExchangeOptions::internal().internal);
        assert!(ExchangeOptions::internal().durable);
    }

    #[tokio::test]
    async fn fanout_consume_uses_a_temporary_queue() {
        let transport = FakeTransport::new();
        let ctx = context(&transport);
        let mut events = ctx.topology.subscribe();

        let fanout = FanoutExchange::declare(ctx.clone(), "testex", ExchangeOptions::default())
            .unwrap();
        let queue = fanout
            .consume(QueueTarget::Temporary { no_ack: true }, handler())
            .unwrap();
        wait_setup(&mut events).await;

        assert_eq!(queue.id(), &QueueId::Temporary(1));
        let channel = transport.current();
        assert_eq!(
            channel.calls(),
            vec![
                "declare_exchange-testex",
                "declare_queue-amq.gen-1",
                "consume-amq.gen-1",
                "bind_queue-amq.gen-1-testex",
            ]
        );
        assert_eq!(
            channel.exchange("testex"),
            Some((ExchangeKind::Fanout, ExchangeOptions::default()))
        );
        assert_eq!(
            channel.consume_options("amq.gen-1"),
            Some(QueueOptions::temporary(true).consume)
        );
    }

    #[tokio::test]
    async fn direct_consume_binds_every_key() {
        let transport = FakeTransport::new();
        let ctx = context(&transport);
        let mut events = ctx.topology.subscribe();

        let direct =
            RoutedExchange::declare(ctx.clone(), "testex", ExchangeKind::Direct, ExchangeOptions::default())
                .unwrap();
        direct
            .consume(QueueTarget::named("testq"), &["created", "deleted"], handler())
            .unwrap();
        wait_setup(&mut events).await;

        let channel = transport.current();
        assert_eq!(
            channel.calls(),
            vec![
                "declare_exchange-testex",
                "declare_queue-testq",
                "consume-testq",
                "bind_queue-testq-testex",
                "bind_queue-testq-testex",
            ]
        );
        let keys: Vec<String> = channel
            .bindings()
            .into_iter()
            .map(|binding| binding.routing_key)
            .collect();
        assert_eq!(keys, vec!["created", "deleted"]);
        assert_eq!(
            channel.declare_options("testq"),
            Some(QueueOptions::default().declare)
        );
    }

    #[tokio::test]
    async fn headers_consume_binds_with_arguments() {
        let transport = FakeTransport::new();
        let ctx = context(&transport);
        let mut events = ctx.topology.subscribe();

        let headers = HeadersExchange::declare(ctx.clone(), "testex", ExchangeOptions::default())
            .unwrap();
        headers
            .consume(
                QueueTarget::temporary(),
                RoutingHeaders::all().header("kind", AMQPValue::LongLongInt(1)),
                handler(),
            )
            .unwrap();
        wait_setup(&mut events).await;

        let bindings = transport.current().bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].source, "testex");
        assert_eq!(bindings[0].destination, "amq.gen-1");
        assert_eq!(bindings[0].routing_key, "");
        assert_eq!(
            bindings[0].arguments.inner().get(AMQP_HEADERS_MATCH),
            Some(&AMQPValue::LongString(LongString::from("all")))
        );
        assert_eq!(
            bindings[0].arguments.inner().get("kind"),
            Some(&AMQPValue::LongLongInt(1))
        );
    }

    #[tokio::test]
    async fn chained_exchanges_are_internal_and_bound() {
        let transport = FakeTransport::new();
        let ctx = context(&transport);
        let mut events = ctx.topology.subscribe();

        let topic =
            RoutedExchange::declare(ctx.clone(), "root", ExchangeKind::Topic, ExchangeOptions::default())
                .unwrap();
        let fanout = topic.fanout("child", &["orders.#"], None).unwrap();
        assert_eq!(fanout.name(), "child");
        fanout
            .direct(
                "grandchild",
                Some(ExchangeOptions {
                    auto_delete: true,
                    ..ExchangeOptions::default()
                }),
            )
            .unwrap();
        wait_setup(&mut events).await;

        let channel = transport.current();
        assert_eq!(
            channel.calls(),
            vec![
                "declare_exchange-root",
                "declare_exchange-child",
                "bind_exchange-child-root",
                "declare_exchange-grandchild",
                "bind_exchange-grandchild-child",
            ]
        );
        assert_eq!(
            channel.exchange("child"),
            Some((ExchangeKind::Fanout, ExchangeOptions::internal()))
        );
        assert_eq!(
            channel.exchange("grandchild"),
            Some((
                ExchangeKind::Direct,
                ExchangeOptions {
                    auto_delete: true,
                    ..ExchangeOptions::default()
                }
            ))
        );
        let bindings: Vec<(String, String, String)> = channel
            .bindings()
            .into_iter()
            .map(|binding| (binding.source, binding.destination, binding.routing_key))
            .collect();
        assert_eq!(
            bindings,
            vec![
                ("root".to_owned(), "child".to_owned(), "orders.#".to_owned()),
                ("child".to_owned(), "grandchild".to_owned(), "".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn binds_existing_exchange_and_queue() {
        let transport = FakeTransport::new();
        let ctx = context(&transport);
        let mut events = ctx.topology.subscribe();

        let root = FanoutExchange::declare(ctx.clone(), "root", ExchangeOptions::default()).unwrap();
        let other = HeadersExchange::declare(ctx.clone(), "other", ExchangeOptions::default())
            .unwrap();
        let other = root.exchange(other).unwrap();

        let queue = ctx
            .named_queue("testq", QueueOptions::default())
            .unwrap();
        other
            .consume(
                queue.clone().into(),
                RoutingHeaders::any().header("a", AMQPValue::LongLongInt(1)),
                handler(),
            )
            .unwrap();
        wait_setup(&mut events).await;

        assert_eq!(
            transport.current().calls(),
            vec![
                "declare_exchange-root",
                "declare_exchange-other",
                "bind_exchange-other-root",
                "declare_queue-testq",
                "consume-testq",
                "bind_queue-testq-other",
            ]
        );
    }

    #[tokio::test]
    async fn redeclaring_with_another_kind_fails() {
        let transport = FakeTransport::new();
        let ctx = context(&transport);

        FanoutExchange::declare(ctx.clone(), "testex", ExchangeOptions::default()).unwrap();
        let err = HeadersExchange::declare(ctx.clone(), "testex", ExchangeOptions::default())
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::ConfigurationConflict {
                name: "testex".to_owned(),
                conflict: ConflictKind::ExchangeKind
            }
        );
    }
}
