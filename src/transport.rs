// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Channel Seam
//!
//! The topology manager does not talk to the broker itself. It drives a
//! [`Transport`], which hands out live [`TransportChannel`]s and reports
//! channel lifecycle through [`ChannelEvent`]s. The production implementation
//! lives in [`crate::channel`]; tests use the fakes in `mocks`.

use crate::{
    errors::{AmqpError, HandlerError},
    exchange::{ExchangeKind, ExchangeOptions},
    queue::{QueueConsumeOptions, QueueDeclareOptions},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lapin::types::FieldTable;
#[cfg(test)]
use mockall::automock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Callback invoked by the transport for every delivery of a consumer.
///
/// `None` means the broker cancelled the consumer (for example because the
/// queue was deleted) while the channel itself stayed open.
pub type DeliveryCallback =
    Arc<dyn Fn(Option<Delivery>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Channel lifecycle reported by a [`Transport`].
#[derive(Clone)]
pub enum ChannelEvent {
    Opened(Arc<dyn TransportChannel>),
    Closed,
}

/// An inbound message as handed over by the transport.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: FieldTable,
    pub data: Vec<u8>,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|value| value.to_string()),
            content_encoding: delivery
                .properties
                .content_encoding()
                .as_ref()
                .map(|value| value.to_string()),
            headers: delivery.properties.headers().clone().unwrap_or_default(),
            data: delivery.data,
        }
    }
}

/// Request/response primitives of one live broker channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), AmqpError>;

    async fn check_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Declares a queue and returns its server-side name. An empty `name`
    /// asks the broker to generate one.
    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueDeclareOptions,
    ) -> Result<String, AmqpError>;

    async fn check_queue(&self, name: &str) -> Result<(), AmqpError>;

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError>;

    /// Starts consuming and returns the consumer tag.
    async fn consume(
        &self,
        queue: &str,
        options: &QueueConsumeOptions,
        callback: DeliveryCallback,
    ) -> Result<String, AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;
}

/// Source of live channels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the live channel, opening one if needed. Fails when the
    /// transport was closed or no channel can be created.
    async fn channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    fn events(&self) -> broadcast::Receiver<ChannelEvent>;

    async fn close(&self) -> Result<(), AmqpError>;
}

pub(crate) fn same_channel(a: &Arc<dyn TransportChannel>, b: &Arc<dyn TransportChannel>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

/// Acknowledgment capability bound to the channel a message was delivered on.
///
/// Every channel the manager sees gets a fresh generation. Once that channel
/// closes the shared current generation moves on and ack/nack through an old
/// handle become no-ops returning `false`.
#[derive(Clone)]
pub struct ChannelHandle {
    generation: u64,
    channel: Arc<dyn TransportChannel>,
    current: Arc<AtomicU64>,
}

impl ChannelHandle {
    pub(crate) fn new(
        generation: u64,
        channel: Arc<dyn TransportChannel>,
        current: Arc<AtomicU64>,
    ) -> Self {
        ChannelHandle {
            generation,
            channel,
            current,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    pub(crate) fn channel(&self) -> &Arc<dyn TransportChannel> {
        &self.channel
    }

    pub async fn ack(&self, delivery_tag: u64, multiple: bool) -> bool {
        if !self.is_live() {
            debug!(delivery_tag, "channel closed, skipping ack");
            return false;
        }

        match self.channel.ack(delivery_tag, multiple).await {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error to ack msg");
                false
            }
            _ => true,
        }
    }

    pub async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> bool {
        if !self.is_live() {
            debug!(delivery_tag, "channel closed, skipping nack");
            return false;
        }

        match self.channel.nack(delivery_tag, multiple, requeue).await {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error to nack msg");
                false
            }
            _ => true,
        }
    }
}
