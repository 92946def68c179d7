//! The routing engine, the single entry point of the broker core.
//!
//! One [`tokio::sync::RwLock`] covers the topology (exchanges and queues). Topology changes such as
//! bind, unbind, create and delete take the write lock. Message flow operations such as publish,
//! consumer registration, acknowledge and requeue take the read lock and may run concurrently.
//! Consumer-count transitions and delivery task registration are guarded per queue by
//! [`QueueHandler`] itself.
//!
//! Every operation takes the [`Principal`] it runs for and asks the [`Authorizer`] before touching
//! any state. Durable changes go to the [`Store`] first and are applied in memory only when the store
//! accepted them.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use itertools::Itertools;
use tokio::sync::RwLock;

use crate::acl::{Action, AllowAll, Authorizer, Resource};
use crate::consumer::{Consumer, FlowListener};
use crate::delivery::DeliveryScheduler;
use crate::exchange::{Binding, BindingDef, Exchange, ExchangeKind};
use crate::message::{Message, MessageIdGenerator};
use crate::queue::{Queue, QueueHandler, QueueInfo, Watermarks};
use crate::settings::Settings;
use crate::stats::Stats;
use crate::store::{NoopStore, Store, StoredMessage};
use crate::types::{
    Arguments, DeliveryTag, ExchangeName, HashMap, Principal, QueueName, ARG_SELECTOR, DEFAULT_EXCHANGE,
    HEADER_ORIGIN_EXCHANGE, HEADER_ORIGIN_QUEUE, HEADER_ORIGIN_ROUTING_KEY,
};
use crate::unacked::UnackedTracker;
use crate::{BrokerError, Result};

#[derive(Default)]
struct Topology {
    exchanges: HashMap<ExchangeName, Exchange>,
    queues: HashMap<QueueName, Arc<QueueHandler>>,
}

impl Topology {
    #[inline]
    fn exchange(&self, name: &str) -> Result<&Exchange> {
        self.exchanges.get(name).ok_or_else(|| BrokerError::validation(format!("no exchange '{}'", name)))
    }

    #[inline]
    fn exchange_mut(&mut self, name: &str) -> Result<&mut Exchange> {
        self.exchanges.get_mut(name).ok_or_else(|| BrokerError::validation(format!("no exchange '{}'", name)))
    }

    #[inline]
    fn queue(&self, name: &str) -> Result<&Arc<QueueHandler>> {
        self.queues.get(name).ok_or_else(|| BrokerError::validation(format!("no queue '{}'", name)))
    }
}

#[inline]
fn store_failed(op: &str, target: &str, e: anyhow::Error) -> BrokerError {
    log::error!("store {} of {:?} failed, {:?}", op, target, e);
    BrokerError::internal(format!("store {} of {:?} failed, {}", op, target, e))
}

pub struct RoutingEngineBuilder {
    settings: Settings,
    store: Arc<dyn Store>,
    authorizer: Arc<dyn Authorizer>,
    flow_listener: Option<Arc<dyn FlowListener>>,
}

impl RoutingEngineBuilder {
    #[inline]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    #[inline]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    #[inline]
    pub fn flow_listener(mut self, listener: Arc<dyn FlowListener>) -> Self {
        self.flow_listener = Some(listener);
        self
    }

    /// Builds the engine with only the default exchange. Must be called from within a tokio
    /// runtime; call [`RoutingEngine::start`] before use.
    pub fn build(self) -> RoutingEngine {
        let scheduler = DeliveryScheduler::new(&self.settings.delivery);
        let stats = Arc::new(Stats::new());
        let mut topology = Topology::default();
        topology
            .exchanges
            .insert(DEFAULT_EXCHANGE.into(), Exchange::new(DEFAULT_EXCHANGE, ExchangeKind::Direct, true));
        stats.exchanges.inc();
        RoutingEngine {
            inner: Arc::new(RoutingEngineInner {
                settings: self.settings,
                stats,
                scheduler,
                topology: RwLock::new(topology),
                store: self.store,
                authorizer: self.authorizer,
                flow_listener: self.flow_listener,
                ids: MessageIdGenerator::new(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct RoutingEngine {
    inner: Arc<RoutingEngineInner>,
}

pub struct RoutingEngineInner {
    pub settings: Settings,
    pub stats: Arc<Stats>,
    pub scheduler: DeliveryScheduler,
    topology: RwLock<Topology>,
    store: Arc<dyn Store>,
    authorizer: Arc<dyn Authorizer>,
    flow_listener: Option<Arc<dyn FlowListener>>,
    ids: MessageIdGenerator,
}

impl Deref for RoutingEngine {
    type Target = RoutingEngineInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingEngine {{ settings: {:?} }}", self.settings)
    }
}

impl RoutingEngine {
    #[inline]
    pub fn builder(settings: Settings) -> RoutingEngineBuilder {
        RoutingEngineBuilder {
            settings,
            store: Arc::new(NoopStore),
            authorizer: Arc::new(AllowAll),
            flow_listener: None,
        }
    }

    /// Loads durable state from the store and creates the dead-letter exchange and queue.
    /// Loaded state is not written back.
    pub async fn start(&self) -> Result<()> {
        self.settings.logs();
        let snapshot = self.store.load().await.map_err(|e| store_failed("load", "snapshot", e))?;
        let mut topology = self.topology.write().await;

        for def in snapshot.exchanges {
            if !topology.exchanges.contains_key(&def.name) {
                self.insert_exchange(&mut topology, Exchange::new(def.name, def.kind, def.durable));
            }
        }
        for queue in snapshot.queues {
            if !topology.queues.contains_key(&queue.name) {
                let handler = self.new_handler(queue);
                self.insert_queue(&mut topology, handler)?;
            }
        }
        self.ensure_dead_letter(&mut topology)?;

        for def in snapshot.bindings {
            if !topology.queues.contains_key(&def.queue) {
                log::warn!("skip stored binding {:?}, no queue", def);
                continue;
            }
            let Some(exchange) = topology.exchanges.get_mut(&def.exchange) else {
                log::warn!("skip stored binding {:?}, no exchange", def);
                continue;
            };
            match Binding::new(def.queue.clone(), def.routing_key.clone(), def.arguments.clone()) {
                Ok(binding) => {
                    if let Err(e) = exchange.bind(binding) {
                        log::warn!("skip stored binding {:?}, {}", def, e);
                    }
                }
                Err(e) => log::warn!("skip stored binding {:?}, {}", def, e),
            }
        }

        let mut loaded = 0;
        for (queue, messages) in snapshot.messages {
            let Some(handler) = topology.queues.get(&queue) else {
                log::warn!("skip {} stored messages of unknown queue {:?}", messages.len(), queue);
                continue;
            };
            for m in messages {
                self.ids.observe(m.metadata.message_id);
                match handler.enqueue(m.into_message()) {
                    Ok(()) => loaded += 1,
                    Err(m) => {
                        log::warn!("{} is full, stored message {} not loaded", queue, m.id());
                        m.release();
                    }
                }
            }
        }

        log::info!(
            "routing engine started, exchanges: {}, queues: {}, messages: {}",
            topology.exchanges.len(),
            topology.queues.len(),
            loaded
        );
        Ok(())
    }

    /// Stops the delivery scheduler. In-flight deliveries complete.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        log::info!("routing engine stopped");
    }

    async fn check(&self, principal: &Principal, action: Action, resource: Resource<'_>) -> Result<()> {
        if self.authorizer.authorize(principal, action, resource).await? {
            Ok(())
        } else {
            Err(BrokerError::Authorization(format!("{} may not {:?} {}", principal, action, resource)))
        }
    }

    fn new_handler(&self, queue: Queue) -> Arc<QueueHandler> {
        let cfg = &self.settings.queue;
        let watermarks = Watermarks::from_ratios(queue.capacity, cfg.flow_high_watermark, cfg.flow_low_watermark);
        let (pushed, popped) = (self.stats.clone(), self.stats.clone());
        let unacked = UnackedTracker::new().on_push(move || pushed.unacked.inc()).on_pop(move || popped.unacked.dec());
        Arc::new(QueueHandler::new(queue, watermarks, unacked).flow_listener(self.flow_listener.clone()))
    }

    #[inline]
    fn insert_exchange(&self, topology: &mut Topology, exchange: Exchange) {
        log::debug!("add exchange {:?}", exchange);
        topology.exchanges.insert(exchange.name.clone(), exchange);
        self.stats.exchanges.inc();
    }

    /// Adds the queue and binds it to the default exchange under its own name.
    fn insert_queue(&self, topology: &mut Topology, handler: Arc<QueueHandler>) -> Result<()> {
        let name = handler.name().clone();
        topology.exchange_mut(DEFAULT_EXCHANGE)?.bind(Binding::new(name.clone(), name.clone(), Arguments::new())?)?;
        log::debug!("add queue {:?}", handler.queue());
        topology.queues.insert(name, handler);
        self.stats.queues.inc();
        Ok(())
    }

    /// Drops the queue with every binding to it. Returns the number of ready messages it held.
    fn remove_queue(&self, topology: &mut Topology, handler: &Arc<QueueHandler>) -> usize {
        let name = handler.name();
        topology.queues.remove(name);
        for exchange in topology.exchanges.values_mut() {
            exchange.remove_queue(name);
        }
        self.scheduler.deregister(name);
        let ready = handler.purge();
        handler.reject_all(None);
        handler.purge();
        self.stats.queues.dec();
        log::debug!("queue {} removed, {} ready messages dropped", name, ready);
        ready
    }

    fn ensure_dead_letter(&self, topology: &mut Topology) -> Result<()> {
        let dl = &self.settings.dead_letter;
        if !dl.enabled {
            return Ok(());
        }
        if !topology.exchanges.contains_key(dl.exchange.as_str()) {
            self.insert_exchange(topology, Exchange::new(dl.exchange.as_str(), ExchangeKind::Direct, true));
        }
        if !topology.queues.contains_key(dl.queue.as_str()) {
            let queue = Queue::new(dl.queue.as_str(), true, false, self.settings.queue.default_capacity);
            let handler = self.new_handler(queue);
            self.insert_queue(topology, handler)?;
        }
        topology.exchange_mut(&dl.exchange)?.bind(Binding::new(dl.queue.as_str(), dl.queue.as_str(), Arguments::new())?)?;
        Ok(())
    }

    #[inline]
    fn is_builtin_exchange(&self, name: &str) -> bool {
        name == DEFAULT_EXCHANGE || (self.settings.dead_letter.enabled && name == self.settings.dead_letter.exchange)
    }

    /// Routes `message` through its exchange. The engine assigns the message id.
    ///
    /// Returns the number of queues the message was enqueued to. A message without any matching
    /// binding is dropped and traced, which is not an error.
    pub async fn publish(&self, principal: &Principal, mut message: Message) -> Result<usize> {
        let exchange = message.metadata().exchange.clone();
        let routing_key = message.metadata().routing_key.clone();
        self.check(principal, Action::Publish, Resource::Exchange(&exchange)).await?;
        self.check(principal, Action::Publish, Resource::RoutingKey(&routing_key)).await?;

        let topology = self.topology.read().await;
        let targets = topology.exchange(&exchange)?.bindings_for_route(&routing_key).resolve(message.metadata());
        message.metadata_mut().message_id = self.ids.next_id();
        self.stats.published.inc();
        self.route(&topology, message, &targets).await
    }

    /// Persists `message` once for the durable targets, then enqueues one copy per target queue.
    async fn route(&self, topology: &Topology, message: Message, targets: &[QueueName]) -> Result<usize> {
        let handlers = targets.iter().filter_map(|q| topology.queues.get(q)).collect_vec();
        if handlers.is_empty() {
            log::trace!(
                "no routes, exchange: {:?}, routing key: {:?}, message: {}",
                message.metadata().exchange,
                message.metadata().routing_key,
                message.id()
            );
            self.stats.unroutable.inc();
            message.release();
            return Ok(0);
        }

        let durable = handlers.iter().filter(|h| h.queue().durable).map(|h| h.name().clone()).collect_vec();
        if !durable.is_empty() {
            self.store
                .persist_message(&StoredMessage::from_message(&message), &durable)
                .await
                .map_err(|e| store_failed("persist message", &message.metadata().routing_key, e))?;
        }

        let mut routed = 0;
        for handler in handlers {
            match handler.enqueue(message.shallow_copy()) {
                Ok(()) => routed += 1,
                Err(dropped) => {
                    log::warn!("{} is full, message {} dropped", handler.name(), dropped.id());
                    self.stats.overflowed.inc();
                    if handler.queue().durable {
                        if let Err(e) = self.store.detach_message(handler.name(), dropped.id()).await {
                            log::warn!("{} detach of dropped message {} failed, {:?}", handler.name(), dropped.id(), e);
                        }
                    }
                    dropped.release();
                }
            }
        }
        message.release();
        self.stats.routed.incs(routed as isize);
        Ok(routed)
    }

    /// Declares an exchange. Returns false when it already exists with the same attributes, or
    /// when `passive` and it exists.
    pub async fn create_exchange(
        &self,
        principal: &Principal,
        name: &str,
        kind: ExchangeKind,
        passive: bool,
        durable: bool,
    ) -> Result<bool> {
        self.check(principal, Action::Create, Resource::Exchange(name)).await?;
        if name == DEFAULT_EXCHANGE && !passive {
            return Err(BrokerError::validation("the default exchange can not be declared"));
        }
        let mut topology = self.topology.write().await;
        if let Some(exchange) = topology.exchanges.get(name) {
            if passive || (exchange.kind == kind && exchange.durable == durable) {
                return Ok(false);
            }
            return Err(BrokerError::validation(format!(
                "exchange '{}' exists as {} durable={}",
                name, exchange.kind, exchange.durable
            )));
        }
        if passive {
            return Err(BrokerError::validation(format!("no exchange '{}'", name)));
        }

        let exchange = Exchange::new(name, kind, durable);
        if durable {
            self.store.add_exchange(&exchange.def()).await.map_err(|e| store_failed("add exchange", name, e))?;
        }
        self.insert_exchange(&mut topology, exchange);
        Ok(true)
    }

    /// Deletes an exchange. Deleting an unknown exchange returns false.
    pub async fn delete_exchange(&self, principal: &Principal, name: &str, if_unused: bool) -> Result<bool> {
        self.check(principal, Action::Delete, Resource::Exchange(name)).await?;
        let mut topology = self.topology.write().await;
        let Some(exchange) = topology.exchanges.get(name) else {
            return Ok(false);
        };
        if self.is_builtin_exchange(name) {
            return Err(BrokerError::validation(format!("exchange '{}' is built in", name)));
        }
        if if_unused && !exchange.is_unused() {
            return Err(BrokerError::validation(format!(
                "exchange '{}' has {} bindings",
                name,
                exchange.bindings_count()
            )));
        }
        if exchange.durable {
            self.store
                .delete_exchange(&exchange.name)
                .await
                .map_err(|e| store_failed("delete exchange", name, e))?;
        }
        topology.exchanges.remove(name);
        self.stats.exchanges.dec();
        log::debug!("exchange {:?} deleted", name);
        Ok(true)
    }

    /// Declares a queue with the default capacity, see [`Self::create_queue_with`].
    pub async fn create_queue(
        &self,
        principal: &Principal,
        name: &str,
        passive: bool,
        durable: bool,
        auto_delete: bool,
    ) -> Result<bool> {
        let queue = Queue::new(name, durable, auto_delete, self.settings.queue.default_capacity);
        self.create_queue_with(principal, queue, passive).await
    }

    /// Declares a queue and binds it to the default exchange under its own name.
    ///
    /// Returns false without changing anything when the queue already exists with the same
    /// durable and auto-delete flags. `passive` only checks that the queue exists.
    pub async fn create_queue_with(&self, principal: &Principal, queue: Queue, passive: bool) -> Result<bool> {
        self.check(principal, Action::Create, Resource::Queue(&queue.name)).await?;
        if queue.name.is_empty() {
            return Err(BrokerError::validation("queue name must not be empty"));
        }
        if queue.capacity == 0 {
            return Err(BrokerError::validation(format!("queue '{}' capacity must be positive", queue.name)));
        }

        let mut topology = self.topology.write().await;
        if let Some(handler) = topology.queues.get(&queue.name) {
            let existing = handler.queue();
            if passive || (existing.durable == queue.durable && existing.auto_delete == queue.auto_delete) {
                return Ok(false);
            }
            return Err(BrokerError::validation(format!(
                "queue '{}' exists with durable={} auto_delete={}",
                queue.name, existing.durable, existing.auto_delete
            )));
        }
        if passive {
            return Err(BrokerError::validation(format!("no queue '{}'", queue.name)));
        }

        if queue.durable {
            self.store.add_queue(&queue).await.map_err(|e| store_failed("add queue", &queue.name, e))?;
        }
        let handler = self.new_handler(queue);
        self.insert_queue(&mut topology, handler)?;
        Ok(true)
    }

    /// Deletes a queue and returns the number of ready messages it held. An unknown queue counts as
    /// already deleted and returns 0.
    pub async fn delete_queue(&self, principal: &Principal, name: &str, if_unused: bool, if_empty: bool) -> Result<usize> {
        self.check(principal, Action::Delete, Resource::Queue(name)).await?;
        let mut topology = self.topology.write().await;
        let Some(handler) = topology.queues.get(name).cloned() else {
            log::debug!("delete queue {:?}, not found", name);
            return Ok(0);
        };
        if if_unused && handler.consumer_count() > 0 {
            return Err(BrokerError::validation(format!(
                "queue '{}' has {} consumers",
                name,
                handler.consumer_count()
            )));
        }
        if if_empty && !handler.is_empty() {
            return Err(BrokerError::validation(format!("queue '{}' has {} messages", name, handler.size())));
        }
        if handler.queue().durable {
            self.store.delete_queue(handler.name()).await.map_err(|e| store_failed("delete queue", name, e))?;
        }
        Ok(self.remove_queue(&mut topology, &handler))
    }

    /// Binds `queue` to `exchange`. A selector in `arguments` under [`ARG_SELECTOR`] makes the
    /// binding filtered. Returns false when the same binding already exists.
    pub async fn bind(
        &self,
        principal: &Principal,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: Arguments,
    ) -> Result<bool> {
        self.check(principal, Action::Bind, Resource::Exchange(exchange)).await?;
        self.check(principal, Action::Bind, Resource::Queue(queue)).await?;
        self.check(principal, Action::Bind, Resource::RoutingKey(routing_key)).await?;
        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::validation("the default exchange can not be bound explicitly"));
        }
        let binding = Binding::new(queue, routing_key, arguments)?;

        let mut topology = self.topology.write().await;
        let queue_durable = topology.queue(queue)?.queue().durable;
        let ex = topology.exchange_mut(exchange)?;
        if !ex.accepts(&binding)? {
            return Ok(false);
        }
        if ex.durable && queue_durable {
            self.store.add_binding(&ex.binding_def(&binding)).await.map_err(|e| store_failed("add binding", exchange, e))?;
        }
        log::debug!("bind {:?} to {:?}", binding, exchange);
        ex.bind(binding)
    }

    /// Removes the binding with the same queue, routing key and selector. Returns false when there
    /// was no such binding.
    pub async fn unbind(
        &self,
        principal: &Principal,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<bool> {
        self.check(principal, Action::Unbind, Resource::Exchange(exchange)).await?;
        self.check(principal, Action::Unbind, Resource::Queue(queue)).await?;
        self.check(principal, Action::Unbind, Resource::RoutingKey(routing_key)).await?;
        if exchange == DEFAULT_EXCHANGE {
            return Err(BrokerError::validation("the default exchange can not be unbound explicitly"));
        }
        let selector = arguments.get(ARG_SELECTOR).map(String::as_str).filter(|s| !s.trim().is_empty());

        let mut topology = self.topology.write().await;
        let queue_durable = topology.queue(queue)?.queue().durable;
        let ex = topology.exchange_mut(exchange)?;
        let Some(binding) = ex.find(queue, routing_key, selector).cloned() else {
            log::debug!("unbind {:?} from {:?}, no binding for {:?}", queue, exchange, routing_key);
            return Ok(false);
        };
        if ex.durable && queue_durable {
            self.store
                .remove_binding(&ex.binding_def(&binding))
                .await
                .map_err(|e| store_failed("remove binding", exchange, e))?;
        }
        ex.unbind(queue, routing_key, selector);
        log::debug!("unbind {:?} from {:?}", binding, exchange);
        Ok(true)
    }

    /// Registers a consumer on its queue, starting the queue's delivery task for the first one.
    pub async fn add_consumer(&self, principal: &Principal, consumer: Consumer) -> Result<Arc<Consumer>> {
        self.check(principal, Action::Consume, Resource::Queue(&consumer.queue)).await?;
        let topology = self.topology.read().await;
        let handler = topology.queue(&consumer.queue)?;
        let consumer = Arc::new(consumer);
        handler.add_consumer(consumer.clone(), &self.scheduler)?;
        Ok(consumer)
    }

    /// Closes a consumer. Its unacknowledged messages go back to the head of the queue. Returns true
    /// when this deleted an auto-delete queue.
    pub async fn remove_consumer(&self, principal: &Principal, queue: &str, tag: &str) -> Result<bool> {
        self.check(principal, Action::Consume, Resource::Queue(queue)).await?;
        let handler = {
            let topology = self.topology.read().await;
            let handler = topology.queue(queue)?.clone();
            let (_, last) = handler.remove_consumer(tag, &self.scheduler)?;
            if !(last && handler.queue().auto_delete) {
                return Ok(false);
            }
            handler
        };

        let mut topology = self.topology.write().await;
        match topology.queues.get(queue) {
            Some(current) if Arc::ptr_eq(current, &handler) && current.consumer_count() == 0 => {}
            _ => return Ok(false),
        }
        if handler.queue().durable {
            self.store.delete_queue(handler.name()).await.map_err(|e| store_failed("delete queue", queue, e))?;
        }
        self.remove_queue(&mut topology, &handler);
        log::debug!("auto-delete queue {:?}", queue);
        Ok(true)
    }

    /// Acknowledges the delivery `tag` of `queue`.
    pub async fn acknowledge(&self, principal: &Principal, queue: &str, tag: DeliveryTag) -> Result<()> {
        self.check(principal, Action::Acknowledge, Resource::Queue(queue)).await?;
        let topology = self.topology.read().await;
        self.ack(topology.queue(queue)?, tag).await
    }

    async fn ack(&self, handler: &QueueHandler, tag: DeliveryTag) -> Result<()> {
        let id = handler.unacked_id(tag)?;
        if handler.queue().durable {
            self.store
                .detach_message(handler.name(), id)
                .await
                .map_err(|e| store_failed("detach message", handler.name(), e))?;
        }
        handler.acknowledge(tag)?.message.release();
        self.stats.acknowledged.inc();
        Ok(())
    }

    /// Rejects a delivery. With `requeue` it goes back to the head of the queue, otherwise it is
    /// dead-lettered through [`Self::move_to_dlc`].
    pub async fn reject(&self, principal: &Principal, queue: &str, tag: DeliveryTag, requeue: bool) -> Result<()> {
        if !requeue {
            return self.move_to_dlc(principal, queue, tag).await;
        }
        self.check(principal, Action::Acknowledge, Resource::Queue(queue)).await?;
        let topology = self.topology.read().await;
        topology.queue(queue)?.reject(tag, true)?;
        Ok(())
    }

    /// Publishes a copy of the unacknowledged delivery `tag` to the dead-letter exchange, then
    /// acknowledges the original.
    ///
    /// The copy gets a new message id, the dead-letter queue as routing key and the origin queue,
    /// exchange and routing key headers. If the copy is not enqueued anywhere, because of a store
    /// error, a full dead-letter queue or a missing binding, the call fails and the original stays
    /// unacknowledged. Once the copy is enqueued the original is acknowledged in memory; a failed
    /// store detach is only logged and the stored original comes back after a restart. With
    /// dead-lettering disabled the original is only acknowledged.
    pub async fn move_to_dlc(&self, principal: &Principal, queue: &str, tag: DeliveryTag) -> Result<()> {
        self.check(principal, Action::Acknowledge, Resource::Queue(queue)).await?;
        let topology = self.topology.read().await;
        let handler = topology.queue(queue)?;
        let Some(original) = handler.reject(tag, false)? else {
            return Ok(());
        };

        let dl = &self.settings.dead_letter;
        if !dl.enabled {
            log::debug!("{} message {} discarded, dead-lettering is disabled", queue, original.id());
            original.release();
            return self.ack(handler, tag).await;
        }

        let dead = self.dead_letter(handler.name(), &original);
        original.release();
        let targets = topology
            .exchanges
            .get(dl.exchange.as_str())
            .ok_or_else(|| BrokerError::internal(format!("no dead-letter exchange '{}'", dl.exchange)))?
            .bindings_for_route(&dl.queue)
            .resolve(dead.metadata());
        let id = dead.id();
        if self.route(&topology, dead, &targets).await? == 0 {
            return Err(BrokerError::internal(format!(
                "dead-letter copy {} of {} delivery {} was not enqueued",
                id, queue, tag
            )));
        }

        // The copy is enqueued, so the original leaves memory even if the store keeps it.
        let acked = handler.acknowledge(tag)?;
        if handler.queue().durable {
            if let Err(e) = self.store.detach_message(handler.name(), acked.message.id()).await {
                log::warn!("{} detach of dead-lettered message {} failed, {:?}", queue, acked.message.id(), e);
            }
        }
        acked.message.release();
        self.stats.acknowledged.inc();
        self.stats.dead_lettered.inc();
        log::debug!("{} delivery {} dead-lettered as message {}", queue, tag, id);
        Ok(())
    }

    fn dead_letter(&self, queue: &QueueName, original: &Message) -> Message {
        let meta = original.metadata();
        let mut dead = meta
            .clone()
            .header(HEADER_ORIGIN_QUEUE, queue)
            .header(HEADER_ORIGIN_EXCHANGE, &meta.exchange)
            .header(HEADER_ORIGIN_ROUTING_KEY, &meta.routing_key);
        dead.message_id = self.ids.next_id();
        dead.exchange = self.settings.dead_letter.exchange.as_str().into();
        dead.routing_key = self.settings.dead_letter.queue.as_str().into();
        Message::new(dead, original.chunks().to_vec())
    }

    /// Recovers the unacknowledged deliveries of `consumer_tag`, see [`QueueHandler::recover`].
    pub async fn recover(&self, principal: &Principal, queue: &str, consumer_tag: &str, requeue: bool) -> Result<usize> {
        self.check(principal, Action::Consume, Resource::Queue(queue)).await?;
        let handler = self.topology.read().await.queue(queue)?.clone();
        handler.recover(consumer_tag, requeue).await
    }

    /// Puts a message held by the caller back at the head of `queue`, marked redelivered.
    pub async fn requeue(&self, principal: &Principal, queue: &str, message: Message) -> Result<()> {
        self.check(principal, Action::Consume, Resource::Queue(queue)).await?;
        let topology = self.topology.read().await;
        topology.queue(queue)?.requeue(message);
        Ok(())
    }

    pub async fn queue_info(&self, name: &str) -> Result<QueueInfo> {
        self.topology
            .read()
            .await
            .queues
            .get(name)
            .map(|h| h.info())
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{}'", name)))
    }

    pub async fn queue_names(&self) -> Vec<QueueName> {
        self.topology.read().await.queues.keys().cloned().sorted().collect()
    }

    pub async fn exchange_names(&self) -> Vec<ExchangeName> {
        self.topology.read().await.exchanges.keys().cloned().sorted().collect()
    }

    pub async fn bindings(&self, exchange: &str) -> Result<Vec<BindingDef>> {
        let topology = self.topology.read().await;
        let ex = topology
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{}'", exchange)))?;
        Ok(ex.bindings().map(|b| ex.binding_def(b)).collect())
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let exec = self.scheduler.exec_stats().await;
        serde_json::json!({
            "stats": self.stats.to_json(),
            "delivery": serde_json::to_value(exec).unwrap_or_default(),
        })
    }
}
