// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! [`LapinTransport`] is the production [`Transport`]: it connects to RabbitMQ
//! on the first request for a channel, reports connection and channel failures
//! as [`ChannelEvent::Closed`] and reconnects on the next request.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeOptions},
    queue::{QueueConsumeOptions, QueueDeclareOptions},
    transport::{ChannelEvent, DeliveryCallback, Transport, TransportChannel},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error};

pub const AMQP_CONSUMER_PRIORITY: &str = "x-priority";

/// Creates a new AMQP connection and a channel on it.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// Error hook shared by the connection and its channel. A failure on either
/// one ends the channel the topology was declared on.
fn notify_closed(
    events: broadcast::Sender<ChannelEvent>,
    source: &'static str,
) -> impl FnMut(lapin::Error) + Send + 'static {
    move |err| {
        error!(error = err.to_string(), source, "amqp error, channel closed");
        let _ = events.send(ChannelEvent::Closed);
    }
}

#[derive(Default)]
struct Connected {
    connection: Option<Arc<Connection>>,
    channel: Option<Arc<LapinChannel>>,
}

pub struct LapinTransport {
    configs: RabbitMQConfigs,
    connected: Mutex<Connected>,
    closed: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
}

impl LapinTransport {
    pub fn new(configs: &RabbitMQConfigs) -> LapinTransport {
        let (events, _) = broadcast::channel(16);

        LapinTransport {
            configs: configs.clone(),
            connected: Mutex::new(Connected::default()),
            closed: AtomicBool::new(false),
            events,
        }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }

        let mut connected = self.connected.lock().await;
        if let Some(channel) = &connected.channel {
            if channel.channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let (connection, channel) = new_amqp_channel(&self.configs).await?;

        connection.on_error(notify_closed(self.events.clone(), "connection"));
        channel.on_error(notify_closed(self.events.clone(), "channel"));

        let channel = Arc::new(LapinChannel { channel });
        connected.connection = Some(connection);
        connected.channel = Some(channel.clone());

        let _ = self.events.send(ChannelEvent::Opened(channel.clone()));

        Ok(channel)
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);

        let connection = {
            let mut connected = self.connected.lock().await;
            connected.channel = None;
            connected.connection.take()
        };

        let result = match connection {
            Some(connection) => connection.close(200, "OK").await.map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::ConnectionError
            }),
            None => Ok(()),
        };

        let _ = self.events.send(ChannelEvent::Closed);
        debug!("amqp connection closed");

        result
    }
}

pub struct LapinChannel {
    channel: Channel,
}

fn consumer_tag(queue: &str, options: &QueueConsumeOptions) -> String {
    options
        .consumer_tag
        .clone()
        .unwrap_or_else(|| format!("{}-{}", queue, uuid::Uuid::new_v4()))
}

fn consume_arguments(options: &QueueConsumeOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(priority) = options.priority {
        arguments.insert(
            ShortString::from(AMQP_CONSUMER_PRIORITY),
            AMQPValue::LongInt(priority),
        );
    }
    arguments
}

#[async_trait]
impl TransportChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        opts: &ExchangeOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                options::ExchangeDeclareOptions {
                    passive: false,
                    durable: opts.durable,
                    auto_delete: opts.auto_delete,
                    internal: opts.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange = name, "failure to declare exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn check_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                options::ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange = name, "failure to check exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn declare_queue(
        &self,
        name: &str,
        opts: &QueueDeclareOptions,
    ) -> Result<String, AmqpError> {
        self.channel
            .queue_declare(
                name,
                options::QueueDeclareOptions {
                    passive: false,
                    durable: opts.durable,
                    exclusive: opts.exclusive,
                    auto_delete: opts.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map(|queue| queue.name().to_string())
            .map_err(|err| {
                error!(error = err.to_string(), queue = name, "failure to declare queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })
    }

    async fn check_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                name,
                options::QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), queue = name, "failure to check queue");
                AmqpError::DeclareQueueError(name.to_owned())
            })
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                options::ExchangeBindOptions::default(),
                arguments.clone(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                AmqpError::BindingExchangeError(source.to_owned(), destination.to_owned())
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                options::QueueBindOptions::default(),
                arguments.clone(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        opts: &QueueConsumeOptions,
        callback: DeliveryCallback,
    ) -> Result<String, AmqpError> {
        let tag = consumer_tag(queue, opts);

        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                &tag,
                options::BasicConsumeOptions {
                    no_local: false,
                    no_ack: opts.no_ack,
                    exclusive: opts.exclusive,
                    nowait: false,
                },
                consume_arguments(opts),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let channel = self.channel.clone();
        let queue = queue.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) = callback(Some(delivery.into())).await {
                            error!(error = err.to_string(), queue, "error consume msg");
                        }
                    }

                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            if channel.status().connected() {
                debug!(queue, "consumer cancelled by the broker");
                if let Err(err) = callback(None).await {
                    error!(error = err.to_string(), queue, "error restoring consumer");
                }
            }
        });

        Ok(tag)
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, options::BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, options::BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_tag_defaults_to_queue_and_uuid() {
        let tag = consumer_tag("orders", &QueueConsumeOptions::default());
        assert!(tag.starts_with("orders-"));
        assert_eq!(tag.len(), "orders-".len() + 36);

        let options = QueueConsumeOptions {
            consumer_tag: Some("custom".to_owned()),
            ..QueueConsumeOptions::default()
        };
        assert_eq!(consumer_tag("orders", &options), "custom");
    }

    #[test]
    fn priority_becomes_a_consume_argument() {
        assert!(consume_arguments(&QueueConsumeOptions::default())
            .inner()
            .is_empty());

        let options = QueueConsumeOptions {
            priority: Some(5),
            ..QueueConsumeOptions::default()
        };
        assert_eq!(
            consume_arguments(&options).inner().get(AMQP_CONSUMER_PRIORITY),
            Some(&AMQPValue::LongInt(5))
        );
    }

    #[tokio::test]
    async fn connection_and_channel_errors_report_closed() {
        let transport = LapinTransport::new(&RabbitMQConfigs::default());
        let mut events = transport.events();

        let mut on_connection = notify_closed(transport.events.clone(), "connection");
        let mut on_channel = notify_closed(transport.events.clone(), "channel");
        on_connection(lapin::Error::ChannelsLimitReached);
        on_channel(lapin::Error::ChannelsLimitReached);

        assert!(matches!(events.recv().await, Ok(ChannelEvent::Closed)));
        assert!(matches!(events.recv().await, Ok(ChannelEvent::Closed)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_transport_refuses_channels() {
        let transport = LapinTransport::new(&RabbitMQConfigs::default());
        let mut events = transport.events();

        transport.close().await.unwrap();

        assert!(matches!(events.recv().await, Ok(ChannelEvent::Closed)));
        assert_eq!(
            transport.channel().await.err(),
            Some(AmqpError::ChannelError)
        );
    }
}
