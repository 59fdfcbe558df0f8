// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Recording fakes of the transport used across the test modules.

use crate::{
    consumer::ConsumerHandler,
    errors::{AmqpError, HandlerError},
    exchange::{ExchangeKind, ExchangeOptions},
    message::Message,
    queue::{QueueConsumeOptions, QueueDeclareOptions, QueueId},
    topology::{ConsumeCallback, ManagerEvent},
    transport::{ChannelEvent, Delivery, DeliveryCallback, Transport, TransportChannel},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lapin::types::FieldTable;
use opentelemetry::Context;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub(crate) destination: String,
    pub(crate) source: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: FieldTable,
}

#[derive(Default)]
struct ChannelState {
    calls: Vec<String>,
    acks: Vec<(u64, bool)>,
    exchanges: HashMap<String, (ExchangeKind, ExchangeOptions)>,
    queues: HashMap<String, QueueDeclareOptions>,
    consumers: HashMap<String, (QueueConsumeOptions, DeliveryCallback)>,
    bindings: Vec<Binding>,
    generated: u64,
    fail: bool,
    delays: HashMap<String, Duration>,
}

type CallHook = Box<dyn Fn(&str) + Send + Sync>;

/// Channel that records every wire call as `<operation>-<name>[-<source>]`.
#[derive(Default)]
pub(crate) struct FakeChannel {
    state: Mutex<ChannelState>,
    hook: Mutex<Option<CallHook>>,
}

impl FakeChannel {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn clear(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Makes every following wire call fail.
    pub(crate) fn fail(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    /// Runs `hook` after each recorded call.
    pub(crate) fn on_call(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    /// Keeps `call` in flight for `delay` before it completes.
    pub(crate) fn delay(&self, call: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(call.to_owned(), delay);
    }

    pub(crate) fn acks(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().acks.clone()
    }

    pub(crate) fn exchange(&self, name: &str) -> Option<(ExchangeKind, ExchangeOptions)> {
        self.state.lock().unwrap().exchanges.get(name).cloned()
    }

    pub(crate) fn declare_options(&self, queue: &str) -> Option<QueueDeclareOptions> {
        self.state.lock().unwrap().queues.get(queue).cloned()
    }

    pub(crate) fn consume_options(&self, queue: &str) -> Option<QueueConsumeOptions> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .get(queue)
            .map(|(options, _)| options.clone())
    }

    /// Exchange and queue bindings in the order they were made.
    pub(crate) fn bindings(&self) -> Vec<Binding> {
        self.state.lock().unwrap().bindings.clone()
    }

    /// Pushes a delivery (or a consumer cancellation) to the consumer of `queue`.
    pub(crate) async fn deliver(
        &self,
        queue: &str,
        delivery: Option<Delivery>,
    ) -> Result<(), HandlerError> {
        let callback = self
            .state
            .lock()
            .unwrap()
            .consumers
            .get(queue)
            .map(|(_, callback)| callback.clone())
            .unwrap_or_else(|| panic!("no consumer on {queue}"));

        callback(delivery).await
    }

    async fn record(&self, call: String) -> bool {
        let (fail, delay) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.clone());
            (state.fail, state.delays.get(&call).copied())
        };

        {
            let hook = self.hook.lock().unwrap();
            if let Some(hook) = hook.as_ref() {
                hook(&call);
            }
        }

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        fail
    }
}

#[async_trait]
impl TransportChannel for FakeChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), AmqpError> {
        if self.record(format!("declare_exchange-{name}")).await {
            return Err(AmqpError::DeclareExchangeError(name.to_owned()));
        }
        self.state
            .lock()
            .unwrap()
            .exchanges
            .insert(name.to_owned(), (kind, options.clone()));
        Ok(())
    }

    async fn check_exchange(&self, name: &str) -> Result<(), AmqpError> {
        if self.record(format!("check_exchange-{name}")).await {
            return Err(AmqpError::DeclareExchangeError(name.to_owned()));
        }
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueDeclareOptions,
    ) -> Result<String, AmqpError> {
        let name = if name.is_empty() {
            let mut state = self.state.lock().unwrap();
            state.generated += 1;
            format!("amq.gen-{}", state.generated)
        } else {
            name.to_owned()
        };

        if self.record(format!("declare_queue-{name}")).await {
            return Err(AmqpError::DeclareQueueError(name));
        }
        self.state
            .lock()
            .unwrap()
            .queues
            .insert(name.clone(), options.clone());
        Ok(name)
    }

    async fn check_queue(&self, name: &str) -> Result<(), AmqpError> {
        if self.record(format!("check_queue-{name}")).await {
            return Err(AmqpError::DeclareQueueError(name.to_owned()));
        }
        Ok(())
    }

    async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        if self.record(format!("bind_exchange-{destination}-{source}")).await {
            return Err(AmqpError::BindingExchangeError(
                source.to_owned(),
                destination.to_owned(),
            ));
        }
        self.state.lock().unwrap().bindings.push(Binding {
            destination: destination.to_owned(),
            source: source.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments: arguments.clone(),
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &FieldTable,
    ) -> Result<(), AmqpError> {
        if self.record(format!("bind_queue-{queue}-{exchange}")).await {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }
        self.state.lock().unwrap().bindings.push(Binding {
            destination: queue.to_owned(),
            source: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments: arguments.clone(),
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &QueueConsumeOptions,
        callback: DeliveryCallback,
    ) -> Result<String, AmqpError> {
        if self.record(format!("consume-{queue}")).await {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }
        self.state
            .lock()
            .unwrap()
            .consumers
            .insert(queue.to_owned(), (options.clone(), callback));
        Ok(options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{queue}-tag")))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.state.lock().unwrap().acks.push((delivery_tag, multiple));
        Ok(())
    }

    async fn nack(
        &self,
        _delivery_tag: u64,
        _multiple: bool,
        _requeue: bool,
    ) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// Transport over [`FakeChannel`]s that can simulate a channel loss.
pub(crate) struct FakeTransport {
    channel: Mutex<Arc<FakeChannel>>,
    closed: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<FakeTransport> {
        let (events, _) = broadcast::channel(16);
        Arc::new(FakeTransport {
            channel: Mutex::new(Arc::new(FakeChannel::default())),
            closed: AtomicBool::new(false),
            events,
        })
    }

    pub(crate) fn current(&self) -> Arc<FakeChannel> {
        self.channel.lock().unwrap().clone()
    }

    /// Replaces the live channel the way a broker-side channel close followed
    /// by a reconnect would.
    pub(crate) fn drop_channel(&self) {
        let replacement = Arc::new(FakeChannel::default());
        *self.channel.lock().unwrap() = replacement.clone();

        let _ = self.events.send(ChannelEvent::Closed);
        let _ = self.events.send(ChannelEvent::Opened(replacement));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelError);
        }
        Ok(self.current())
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Closed);
        Ok(())
    }
}

pub(crate) fn noop_callback() -> ConsumeCallback {
    Arc::new(
        |_: QueueId,
         _: crate::transport::ChannelHandle,
         _: Option<Delivery>|
         -> BoxFuture<'static, Result<(), HandlerError>> { Box::pin(async { Ok(()) }) },
    )
}

/// Waits for the end of the running setup cycle, skipping other events.
pub(crate) async fn wait_setup(events: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> ManagerEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("setup did not finish in time")
            .expect("event stream ended");

        if matches!(
            event,
            ManagerEvent::SetupComplete | ManagerEvent::SetupFailed(_)
        ) {
            return event;
        }
    }
}

pub(crate) fn delivery(exchange: &str, routing_key: &str) -> Delivery {
    Delivery {
        delivery_tag: 1,
        exchange: exchange.to_owned(),
        routing_key: routing_key.to_owned(),
        ..Delivery::default()
    }
}

/// Hands out handlers that record `(label, routing key)` for each message.
#[derive(Clone, Default)]
pub(crate) struct RecordingHandler {
    hits: Arc<Mutex<Vec<(String, String)>>>,
}

struct Labeled {
    label: String,
    hits: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl ConsumerHandler for Labeled {
    async fn exec(&self, _ctx: &Context, msg: &Message) -> Result<(), HandlerError> {
        self.hits
            .lock()
            .unwrap()
            .push((self.label.clone(), msg.routing_key().to_owned()));
        Ok(())
    }
}

impl RecordingHandler {
    pub(crate) fn labeled(&self, label: &str) -> Arc<dyn ConsumerHandler> {
        Arc::new(Labeled {
            label: label.to_owned(),
            hits: self.hits.clone(),
        })
    }

    pub(crate) fn hits(&self) -> Vec<(String, String)> {
        self.hits.lock().unwrap().clone()
    }
}
