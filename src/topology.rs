// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! [`AmqpTopology`] keeps track of every exchange, queue and binding the
//! application declared and makes sure the broker converges to that shape.
//!
//! Declarations are validated synchronously and turned into setup tasks.
//! Tasks run in submission order against a single channel, one setup cycle
//! at a time; a cycle keeps draining until the pending queue is empty, so
//! tasks submitted while it runs are picked up by the same cycle.
//!
//! When the transport reports the channel closed, every record is flagged
//! undeclared and replayed in declaration order: exchanges, queues,
//! exchange bindings, queue bindings. That is the only automatic retry; a
//! failing setup cycle closes the manager.

use crate::{
    errors::{AmqpError, ConflictKind, HandlerError},
    exchange::{ExchangeKind, ExchangeOptions},
    message::Message,
    queue::{QueueId, QueueOptions},
    transport::{
        same_channel, ChannelEvent, ChannelHandle, Delivery, DeliveryCallback, Transport,
        TransportChannel,
    },
    configs::TopologyConfigs,
};
use futures_util::future::BoxFuture;
use lapin::types::FieldTable;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

/// Callback a queue registers to receive its deliveries. The manager binds
/// the queue identity and the handle of the delivering channel.
pub type ConsumeCallback = Arc<
    dyn Fn(QueueId, ChannelHandle, Option<Delivery>) -> BoxFuture<'static, Result<(), HandlerError>>
        + Send
        + Sync,
>;

/// Notifications emitted to the owner of the manager.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A setup cycle drained every pending task.
    SetupComplete,
    /// A setup cycle failed; the manager is closed.
    SetupFailed(AmqpError),
    /// No consumer and no default handler accepted the message.
    UnhandledMessage { queue: QueueId, message: Arc<Message> },
    /// The transport channel closed.
    Closed,
}

struct ExchangeRecord {
    name: String,
    kind: ExchangeKind,
    options: ExchangeOptions,
    declared: bool,
}

struct QueueRecord {
    id: QueueId,
    /// Server-side name. Known upfront for named queues, resolved on every
    /// declaration for temporary ones.
    server_name: Option<String>,
    options: QueueOptions,
    callback: ConsumeCallback,
    declared: bool,
}

struct ExchangeBinding {
    source: String,
    destination: String,
    routing_key: String,
    arguments: FieldTable,
    bound: bool,
}

struct QueueBinding {
    exchange: String,
    queue: QueueId,
    routing_key: String,
    arguments: FieldTable,
    bound: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupTask {
    DeclareExchange(usize),
    DeclareQueue(usize),
    BindExchange(usize),
    BindQueue(usize),
}

enum CycleOutcome {
    Completed,
    Interrupted,
}

struct LiveChannel {
    channel: Arc<dyn TransportChannel>,
    handle: ChannelHandle,
}

#[derive(Default)]
struct State {
    exchanges: Vec<ExchangeRecord>,
    exchanges_index: HashMap<String, usize>,
    queues: Vec<QueueRecord>,
    queues_index: HashMap<QueueId, usize>,
    exchanges_binding: Vec<ExchangeBinding>,
    queues_binding: Vec<QueueBinding>,
    pending: VecDeque<SetupTask>,
    running: bool,
    closed: bool,
    temporary_seq: u64,
    generation_seq: u64,
    live: Option<LiveChannel>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    passive: bool,
    state: Mutex<State>,
    current_generation: Arc<AtomicU64>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ManagerEvent>>>,
}

/// Topology manager bound to one transport.
///
/// Cloning is cheap and every clone drives the same state. Must be created
/// inside a tokio runtime: construction spawns the lifecycle watcher and
/// declarations spawn setup cycles.
#[derive(Clone)]
pub struct AmqpTopology {
    inner: Arc<Inner>,
}

/// Non-owning reference held by queue routers, so the manager and its
/// callbacks do not keep each other alive.
#[derive(Clone)]
pub(crate) struct WeakTopology {
    inner: Weak<Inner>,
}

impl WeakTopology {
    pub(crate) fn upgrade(&self) -> Option<AmqpTopology> {
        self.inner.upgrade().map(|inner| AmqpTopology { inner })
    }
}

impl AmqpTopology {
    /// Creates a topology manager over `transport` and starts watching its
    /// channel lifecycle. Must be called inside a tokio runtime.
    ///
    /// # Parameters
    /// * `transport` - Source of channels and lifecycle events
    /// * `configs` - Manager settings, e.g. passive declarations
    ///
    /// # Returns
    /// A manager with an empty topology. Nothing goes on the wire until the
    /// first declaration.
    pub fn new(transport: Arc<dyn Transport>, configs: &TopologyConfigs) -> AmqpTopology {
        let events = transport.events();
        let inner = Arc::new(Inner {
            transport,
            passive: configs.passive,
            state: Mutex::new(State::default()),
            current_generation: Arc::new(AtomicU64::new(0)),
            listeners: Mutex::new(vec![]),
        });

        tokio::spawn(watch_lifecycle(Arc::downgrade(&inner), events));

        AmqpTopology { inner }
    }

    /// Registers an exchange, or validates a redeclaration against the first
    /// one. Only the first registration schedules a wire declaration.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), AmqpError> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(AmqpError::ManagerClosed);
        }

        if let Some(&index) = state.exchanges_index.get(name) {
            let exchange = &state.exchanges[index];
            if exchange.kind != kind {
                return Err(conflict(name, ConflictKind::ExchangeKind));
            }
            if exchange.options != options {
                return Err(conflict(name, ConflictKind::ExchangeOptions));
            }
            return Ok(());
        }

        let index = state.exchanges.len();
        state.exchanges.push(ExchangeRecord {
            name: name.to_owned(),
            kind,
            options,
            declared: false,
        });
        state.exchanges_index.insert(name.to_owned(), index);
        self.inner.defer(state, [SetupTask::DeclareExchange(index)]);

        Ok(())
    }

    /// Registers a named queue, or validates a redeclaration. Declare and
    /// consume options are compared separately so the error says which group
    /// differs. The callback of a redeclaration is ignored.
    pub fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        callback: ConsumeCallback,
    ) -> Result<(), AmqpError> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(AmqpError::ManagerClosed);
        }

        let id = QueueId::Named(name.to_owned());
        if let Some(&index) = state.queues_index.get(&id) {
            let queue = &state.queues[index];
            if queue.options.declare != options.declare {
                return Err(conflict(name, ConflictKind::QueueDeclareOptions));
            }
            if queue.options.consume != options.consume {
                return Err(conflict(name, ConflictKind::QueueConsumeOptions));
            }
            return Ok(());
        }

        let index = state.queues.len();
        state.queues.push(QueueRecord {
            id: id.clone(),
            server_name: Some(name.to_owned()),
            options,
            callback,
            declared: false,
        });
        state.queues_index.insert(id, index);
        self.inner.defer(state, [SetupTask::DeclareQueue(index)]);

        Ok(())
    }

    /// Registers a server-named queue and returns its process-local handle
    /// right away, before the broker assigned a name.
    pub fn declare_temporary_queue(
        &self,
        callback: ConsumeCallback,
        no_ack: bool,
    ) -> Result<QueueId, AmqpError> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(AmqpError::ManagerClosed);
        }

        state.temporary_seq += 1;
        let id = QueueId::Temporary(state.temporary_seq);

        let index = state.queues.len();
        state.queues.push(QueueRecord {
            id: id.clone(),
            server_name: None,
            options: QueueOptions::temporary(no_ack),
            callback,
            declared: false,
        });
        state.queues_index.insert(id.clone(), index);
        self.inner.defer(state, [SetupTask::DeclareQueue(index)]);

        Ok(id)
    }

    /// Records a binding that routes messages of `source` into `destination`.
    /// Both exchanges must be registered already.
    ///
    /// # Parameters
    /// * `source` - Exchange messages come from
    /// * `destination` - Exchange messages are routed to
    /// * `routing_key` - Binding key, empty for fanout and headers exchanges
    /// * `arguments` - Binding arguments, e.g. `x-match` for headers exchanges
    ///
    /// # Returns
    /// `BindingPrerequisiteMissing` naming the unknown exchange, or
    /// `ManagerClosed` once the manager is closed.
    pub fn bind_exchange(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<(), AmqpError> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(AmqpError::ManagerClosed);
        }
        if !state.exchanges_index.contains_key(source) {
            return Err(missing("source exchange", source));
        }
        if !state.exchanges_index.contains_key(destination) {
            return Err(missing("destination exchange", destination));
        }

        let index = state.exchanges_binding.len();
        state.exchanges_binding.push(ExchangeBinding {
            source: source.to_owned(),
            destination: destination.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments: arguments.unwrap_or_default(),
            bound: false,
        });
        self.inner.defer(state, [SetupTask::BindExchange(index)]);

        Ok(())
    }

    /// Records a binding of `queue` to `exchange`. A temporary queue is bound
    /// under whatever name the broker assigned to it on the current channel.
    ///
    /// # Parameters
    /// * `exchange` - Registered source exchange
    /// * `queue` - Handle returned by a queue declaration
    /// * `routing_key` - Binding key
    /// * `arguments` - Optional binding arguments
    pub fn bind_queue(
        &self,
        exchange: &str,
        queue: &QueueId,
        routing_key: &str,
        arguments: Option<FieldTable>,
    ) -> Result<(), AmqpError> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(AmqpError::ManagerClosed);
        }
        if !state.exchanges_index.contains_key(exchange) {
            return Err(missing("source exchange", exchange));
        }
        if !state.queues_index.contains_key(queue) {
            return Err(missing("queue", &queue.to_string()));
        }

        let index = state.queues_binding.len();
        state.queues_binding.push(QueueBinding {
            exchange: exchange.to_owned(),
            queue: queue.clone(),
            routing_key: routing_key.to_owned(),
            arguments: arguments.unwrap_or_default(),
            bound: false,
        });
        self.inner.defer(state, [SetupTask::BindQueue(index)]);

        Ok(())
    }

    /// Redeclares a queue and its bindings after the broker cancelled its
    /// consumer without closing the channel.
    pub fn restore_queue(&self, queue: &QueueId) {
        let mut state = self.inner.lock_state();
        if state.closed {
            return;
        }

        let Some(&index) = state.queues_index.get(queue) else {
            error!(queue = queue.to_string(), "cannot restore an undeclared queue");
            return;
        };

        debug!(queue = queue.to_string(), "restoring queue");

        state.queues[index].declared = false;
        let mut tasks = vec![SetupTask::DeclareQueue(index)];
        for (index, binding) in state.queues_binding.iter_mut().enumerate() {
            if &binding.queue == queue {
                binding.bound = false;
                tasks.push(SetupTask::BindQueue(index));
            }
        }

        self.inner.defer(state, tasks);
    }

    /// Closes the manager and the transport. Topology is no longer restored;
    /// a wire operation already in flight is not aborted.
    pub async fn close(&self) -> Result<(), AmqpError> {
        {
            let mut state = self.inner.lock_state();
            state.closed = true;
            state.pending.clear();
        }

        debug!("closing topology manager");
        self.inner.transport.close().await
    }

    /// True once [`AmqpTopology::close`] ran or a setup cycle failed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Server-side name of a queue, if it was resolved already.
    pub fn queue_name(&self, queue: &QueueId) -> Option<String> {
        let state = self.inner.lock_state();
        state
            .queues_index
            .get(queue)
            .and_then(|&index| state.queues[index].server_name.clone())
    }

    /// Subscribes to manager events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) fn downgrade(&self) -> WeakTopology {
        WeakTopology {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn report_unhandled(&self, queue: QueueId, message: Message) {
        warn!(
            queue = queue.to_string(),
            exchange = message.exchange(),
            routing_key = message.routing_key(),
            "unhandled message"
        );
        self.inner.emit(ManagerEvent::UnhandledMessage {
            queue,
            message: Arc::new(message),
        });
    }
}

fn conflict(name: &str, conflict: ConflictKind) -> AmqpError {
    error!(entity = name, "{}", conflict);
    AmqpError::ConfigurationConflict {
        name: name.to_owned(),
        conflict,
    }
}

/// Bindings wait for their endpoints: a binding task queued before a channel
/// loss runs again after the replayed declarations.
fn exchange_declared(state: &State, name: &str) -> bool {
    state
        .exchanges_index
        .get(name)
        .is_some_and(|&index| state.exchanges[index].declared)
}

fn missing(role: &'static str, name: &str) -> AmqpError {
    error!(entity = name, "cannot bind: {} not declared", role);
    AmqpError::BindingPrerequisiteMissing {
        role,
        name: name.to_owned(),
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ManagerEvent) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Enqueues tasks and starts a setup cycle unless one is already running.
    fn defer(
        self: &Arc<Self>,
        mut state: MutexGuard<'_, State>,
        tasks: impl IntoIterator<Item = SetupTask>,
    ) {
        state.pending.extend(tasks);
        if state.running {
            return;
        }
        state.running = true;
        drop(state);

        tokio::spawn(self.clone().setup());
    }

    async fn setup(self: Arc<Self>) {
        match self.drain().await {
            Ok(CycleOutcome::Completed) => {
                debug!("topology setup completed");
                self.emit(ManagerEvent::SetupComplete);
            }
            Ok(CycleOutcome::Interrupted) => {
                debug!("topology setup interrupted by close");
            }
            Err(err) => {
                error!(error = err.to_string(), "topology setup failed");
                {
                    let mut state = self.lock_state();
                    state.closed = true;
                    state.running = false;
                    state.pending.clear();
                }
                self.emit(ManagerEvent::SetupFailed(err));
            }
        }
    }

    /// Runs pending tasks one by one until none is left.
    async fn drain(&self) -> Result<CycleOutcome, AmqpError> {
        let mut handle = self.acquire_channel().await?;

        loop {
            let task = {
                let mut state = self.lock_state();
                if state.closed {
                    state.pending.clear();
                    state.running = false;
                    return Ok(CycleOutcome::Interrupted);
                }
                match state.pending.pop_front() {
                    Some(task) => task,
                    None => {
                        state.running = false;
                        return Ok(CycleOutcome::Completed);
                    }
                }
            };

            if !handle.is_live() {
                debug!("channel lost during setup, acquiring a new one");
                handle = self.acquire_channel().await?;
            }

            self.run(&handle, task).await?;
        }
    }

    async fn acquire_channel(&self) -> Result<ChannelHandle, AmqpError> {
        match self.transport.channel().await {
            Ok(channel) => Ok(self.attach_channel(channel)),
            Err(err) => {
                error!(error = err.to_string(), "cannot create channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Returns the handle of `channel`, minting a new generation when the
    /// channel was not seen before.
    fn attach_channel(&self, channel: Arc<dyn TransportChannel>) -> ChannelHandle {
        let mut state = self.lock_state();
        if let Some(live) = &state.live {
            if same_channel(&live.channel, &channel) {
                return live.handle.clone();
            }
        }

        state.generation_seq += 1;
        let generation = state.generation_seq;
        self.current_generation.store(generation, Ordering::SeqCst);

        debug!(generation, "channel attached");

        let handle = ChannelHandle::new(generation, channel.clone(), self.current_generation.clone());
        state.live = Some(LiveChannel {
            channel,
            handle: handle.clone(),
        });
        handle
    }

    fn on_channel_closed(self: &Arc<Self>) {
        let mut state = self.lock_state();
        state.live = None;
        self.current_generation.store(0, Ordering::SeqCst);

        if state.closed {
            drop(state);
            debug!("channel closed");
            self.emit(ManagerEvent::Closed);
            return;
        }

        warn!("channel closed, restoring topology");

        let mut tasks = vec![];
        for (index, exchange) in state.exchanges.iter_mut().enumerate() {
            exchange.declared = false;
            tasks.push(SetupTask::DeclareExchange(index));
        }
        for (index, queue) in state.queues.iter_mut().enumerate() {
            queue.declared = false;
            tasks.push(SetupTask::DeclareQueue(index));
        }
        for (index, binding) in state.exchanges_binding.iter_mut().enumerate() {
            binding.bound = false;
            tasks.push(SetupTask::BindExchange(index));
        }
        for (index, binding) in state.queues_binding.iter_mut().enumerate() {
            binding.bound = false;
            tasks.push(SetupTask::BindQueue(index));
        }

        self.defer(state, tasks);
        self.emit(ManagerEvent::Closed);
    }

    /// Flags the record of a finished task. A task whose channel closed while
    /// the wire call was in flight stays pending for the replay the close
    /// scheduled.
    fn complete(&self, handle: &ChannelHandle, done: impl FnOnce(&mut State)) -> bool {
        let mut state = self.lock_state();
        if !handle.is_live() {
            debug!(
                generation = handle.generation(),
                "channel closed during the call, left to the replay"
            );
            return false;
        }
        done(&mut *state);
        true
    }

    async fn run(&self, handle: &ChannelHandle, task: SetupTask) -> Result<(), AmqpError> {
        match task {
            SetupTask::DeclareExchange(index) => self.declare_exchange(handle, index).await,
            SetupTask::DeclareQueue(index) => self.declare_queue(handle, index).await,
            SetupTask::BindExchange(index) => self.bind_exchange(handle, index).await,
            SetupTask::BindQueue(index) => self.bind_queue(handle, index).await,
        }
    }

    async fn declare_exchange(&self, handle: &ChannelHandle, index: usize) -> Result<(), AmqpError> {
        let (name, kind, options) = {
            let state = self.lock_state();
            let exchange = &state.exchanges[index];
            if exchange.declared {
                return Ok(());
            }
            (exchange.name.clone(), exchange.kind, exchange.options.clone())
        };

        debug!("creating exchange: {}", name);

        let channel = handle.channel();
        let result = if self.passive {
            channel.check_exchange(&name).await
        } else {
            channel.declare_exchange(&name, kind, &options).await
        };

        result.map_err(|err| {
            error!(error = err.to_string(), exchange = name, "error to declare the exchange");
            err
        })?;

        if self.complete(handle, |state| state.exchanges[index].declared = true) {
            debug!("exchange: {} was created", name);
        }

        Ok(())
    }

    async fn declare_queue(&self, handle: &ChannelHandle, index: usize) -> Result<(), AmqpError> {
        let (id, options, callback) = {
            let state = self.lock_state();
            let queue = &state.queues[index];
            if queue.declared {
                return Ok(());
            }
            (queue.id.clone(), queue.options.clone(), queue.callback.clone())
        };

        debug!("creating queue: {}", id);

        let channel = handle.channel();
        let name = match &id {
            QueueId::Named(name) if self.passive => {
                channel.check_queue(name).await.map(|_| name.clone())
            }
            QueueId::Named(name) => channel.declare_queue(name, &options.declare).await,
            QueueId::Temporary(_) => channel.declare_queue("", &options.declare).await,
        }
        .map_err(|err| {
            error!(error = err.to_string(), queue = id.to_string(), "error to declare the queue");
            err
        })?;

        self.lock_state().queues[index].server_name = Some(name.clone());

        let delivery_handle = handle.clone();
        let delivery_id = id.clone();
        let on_delivery: DeliveryCallback = Arc::new(move |delivery: Option<Delivery>| {
            callback(delivery_id.clone(), delivery_handle.clone(), delivery)
        });

        let tag = channel
            .consume(&name, &options.consume, on_delivery)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = name, "error to create the consumer");
                err
            })?;

        if self.complete(handle, |state| state.queues[index].declared = true) {
            debug!(consumer_tag = tag, "queue: {} was created", name);
        }

        Ok(())
    }

    async fn bind_exchange(&self, handle: &ChannelHandle, index: usize) -> Result<(), AmqpError> {
        let (source, destination, routing_key, arguments) = {
            let state = self.lock_state();
            let binding = &state.exchanges_binding[index];
            if binding.bound
                || !exchange_declared(&state, &binding.source)
                || !exchange_declared(&state, &binding.destination)
            {
                return Ok(());
            }
            (
                binding.source.clone(),
                binding.destination.clone(),
                binding.routing_key.clone(),
                binding.arguments.clone(),
            )
        };

        debug!(
            "binding exchange: {} to the exchange: {} with the key: {}",
            destination, source, routing_key
        );

        handle
            .channel()
            .bind_exchange(&destination, &source, &routing_key, &arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                err
            })?;

        self.complete(handle, |state| state.exchanges_binding[index].bound = true);

        Ok(())
    }

    async fn bind_queue(&self, handle: &ChannelHandle, index: usize) -> Result<(), AmqpError> {
        let (exchange, queue, routing_key, arguments) = {
            let state = self.lock_state();
            let binding = &state.queues_binding[index];
            let record = state
                .queues_index
                .get(&binding.queue)
                .map(|&queue| &state.queues[queue]);
            if binding.bound
                || !exchange_declared(&state, &binding.exchange)
                || !record.is_some_and(|queue| queue.declared)
            {
                return Ok(());
            }
            let queue = record
                .and_then(|queue| queue.server_name.clone())
                .ok_or_else(|| {
                    error!(queue = binding.queue.to_string(), "queue name not resolved");
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange.clone(),
                        binding.queue.to_string(),
                    )
                })?;
            (
                binding.exchange.clone(),
                queue,
                binding.routing_key.clone(),
                binding.arguments.clone(),
            )
        };

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        handle
            .channel()
            .bind_queue(&queue, &exchange, &routing_key, &arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                err
            })?;

        self.complete(handle, |state| state.queues_binding[index].bound = true);

        Ok(())
    }
}

async fn watch_lifecycle(inner: Weak<Inner>, mut events: broadcast::Receiver<ChannelEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "channel lifecycle events lagged, replaying topology");
                ChannelEvent::Closed
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };

        match event {
            ChannelEvent::Opened(channel) => {
                inner.attach_channel(channel);
            }
            ChannelEvent::Closed => inner.on_channel_closed(),
        }
    }
}
