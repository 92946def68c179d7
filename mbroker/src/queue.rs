use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::consumer::{Consumer, ConsumerSet, Delivery, FlowEvent, FlowListener};
use crate::delivery::DeliveryScheduler;
use crate::message::Message;
use crate::types::{DeliveryTag, MessageId, QueueName};
use crate::unacked::{Unacked, UnackedTracker};
use crate::{BrokerError, Result};

/// Queue attributes, also the persisted form of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub name: QueueName,
    pub durable: bool,
    pub auto_delete: bool,
    pub capacity: usize,
}

impl Queue {
    #[inline]
    pub fn new<N: Into<QueueName>>(name: N, durable: bool, auto_delete: bool, capacity: usize) -> Self {
        Self { name: name.into(), durable, auto_delete, capacity }
    }
}

/// Occupancy thresholds for flow-control notifications, in messages.
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    #[inline]
    pub fn from_ratios(capacity: usize, high: f64, low: f64) -> Self {
        let high = ((capacity as f64 * high).ceil() as usize).clamp(1, capacity.max(1));
        let low = ((capacity as f64 * low).floor() as usize).min(high);
        Self { high, low }
    }
}

struct Body {
    messages: VecDeque<Message>,
    blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: QueueName,
    pub durable: bool,
    pub auto_delete: bool,
    pub capacity: usize,
    pub size: usize,
    pub consumers: usize,
    pub unacked: usize,
}

/// Runtime state of one queue: message body, consumers and unacknowledged deliveries.
///
/// Lock order is consumers, then body, then unacked. The consumers lock also covers delivery task
/// registration, so a consumer-count transition and the matching scheduler change are one step.
pub struct QueueHandler {
    queue: Queue,
    watermarks: Watermarks,
    body: Mutex<Body>,
    consumers: Mutex<ConsumerSet>,
    unacked: Mutex<UnackedTracker>,
    flow_listener: Option<Arc<dyn FlowListener>>,
    notify: Notify,
}

impl QueueHandler {
    #[inline]
    pub fn new(queue: Queue, watermarks: Watermarks, unacked: UnackedTracker) -> Self {
        Self {
            queue,
            watermarks,
            body: Mutex::new(Body { messages: VecDeque::new(), blocked: false }),
            consumers: Mutex::new(ConsumerSet::default()),
            unacked: Mutex::new(unacked),
            flow_listener: None,
            notify: Notify::new(),
        }
    }

    #[inline]
    pub fn flow_listener(mut self, listener: Option<Arc<dyn FlowListener>>) -> Self {
        self.flow_listener = listener;
        self
    }

    #[inline]
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    #[inline]
    pub fn name(&self) -> &QueueName {
        &self.queue.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.queue.capacity
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.body.lock().messages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    #[inline]
    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }

    #[inline]
    pub fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.queue.name.clone(),
            durable: self.queue.durable,
            auto_delete: self.queue.auto_delete,
            capacity: self.queue.capacity,
            size: self.size(),
            consumers: self.consumer_count(),
            unacked: self.unacked_count(),
        }
    }

    /// Resolves when messages were added or consumers became available.
    #[inline]
    pub(crate) async fn notified(&self) {
        self.notify.notified().await
    }

    #[inline]
    pub fn wakeup(&self) {
        self.notify.notify_one();
    }

    #[inline]
    fn flow_changed(&self, event: Option<FlowEvent>) {
        if let (Some(event), Some(listener)) = (event, self.flow_listener.as_ref()) {
            log::debug!("{} flow {:?}", self.queue.name, event);
            listener.on_flow(&self.queue.name, event);
        }
    }

    #[inline]
    fn after_push(&self, body: &mut Body) -> Option<FlowEvent> {
        if !body.blocked && body.messages.len() >= self.watermarks.high {
            body.blocked = true;
            Some(FlowEvent::Blocked)
        } else {
            None
        }
    }

    #[inline]
    fn after_pop(&self, body: &mut Body) -> Option<FlowEvent> {
        if body.blocked && body.messages.len() <= self.watermarks.low {
            body.blocked = false;
            Some(FlowEvent::Unblocked)
        } else {
            None
        }
    }

    /// Appends `message`. A full queue drops the message and returns it back.
    pub fn enqueue(&self, message: Message) -> std::result::Result<(), Message> {
        let event = {
            let mut body = self.body.lock();
            if body.messages.len() >= self.queue.capacity {
                return Err(message);
            }
            body.messages.push_back(message);
            self.after_push(&mut body)
        };
        self.flow_changed(event);
        self.wakeup();
        Ok(())
    }

    /// Puts messages back at the head of the queue, keeping their relative order. Capacity is not
    /// checked; these messages were already accepted once.
    fn enqueue_front(&self, messages: Vec<Message>, redelivered: bool) -> usize {
        if messages.is_empty() {
            return 0;
        }
        let n = messages.len();
        let event = {
            let mut body = self.body.lock();
            for mut m in messages.into_iter().rev() {
                if redelivered {
                    m.set_redeliver();
                }
                body.messages.push_front(m);
            }
            self.after_push(&mut body)
        };
        self.flow_changed(event);
        self.wakeup();
        n
    }

    /// Returns a message held by the caller to the head of the queue, marked redelivered.
    #[inline]
    pub fn requeue(&self, message: Message) {
        self.enqueue_front(vec![message], true);
    }

    /// Adds a consumer, starting the delivery task when it is the first one.
    /// Returns true on the 0 -> 1 transition.
    pub fn add_consumer(self: &Arc<Self>, consumer: Arc<Consumer>, scheduler: &DeliveryScheduler) -> Result<bool> {
        let mut consumers = self.consumers.lock();
        if consumers.get(&consumer.tag).is_some() {
            return Err(BrokerError::validation(format!(
                "consumer tag {} already in use on queue {}",
                consumer.tag, self.queue.name
            )));
        }
        if consumers.has_exclusive() || (consumer.exclusive && !consumers.is_empty()) {
            return Err(BrokerError::validation(format!("queue {} has an exclusive consumer conflict", self.queue.name)));
        }
        let first = consumers.is_empty();
        if first {
            scheduler.register(self.clone())?;
            log::debug!("{} consumers 0 -> 1, delivery task registered", self.queue.name);
        }
        consumers.push(consumer);
        drop(consumers);
        self.wakeup();
        Ok(first)
    }

    /// Removes a consumer and returns its unacknowledged messages to the head of the queue.
    /// Returns the consumer and whether it was the last one.
    pub fn remove_consumer(&self, tag: &str, scheduler: &DeliveryScheduler) -> Result<(Arc<Consumer>, bool)> {
        let (consumer, last, returned) = {
            let mut consumers = self.consumers.lock();
            let consumer = consumers.remove(tag).ok_or_else(|| {
                BrokerError::validation(format!("unknown consumer {} on queue {}", tag, self.queue.name))
            })?;
            let last = consumers.is_empty();
            if last {
                scheduler.deregister(&self.queue.name);
                log::debug!("{} consumers 1 -> 0, delivery task deregistered", self.queue.name);
            }
            let returned = self.unacked.lock().take(Some(tag));
            (consumer, last, returned)
        };
        let n = self.enqueue_front(returned.into_iter().map(|(_, u)| u.message).collect_vec(), true);
        if n > 0 {
            log::debug!("{} requeued {} unacked messages of consumer {}", self.queue.name, n, tag);
        }
        Ok((consumer, last))
    }

    /// Takes the next message for the next ready consumer and tracks it as unacknowledged.
    pub(crate) fn next_delivery(&self, tags: &AtomicU64) -> Option<(Arc<Consumer>, Delivery)> {
        let mut consumers = self.consumers.lock();
        let (consumer, message, event) = {
            let mut body = self.body.lock();
            if body.messages.is_empty() {
                return None;
            }
            let consumer = consumers.next_ready()?;
            let message = body.messages.pop_front()?;
            let event = self.after_pop(&mut body);
            (consumer, message, event)
        };
        let tag = tags.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            tag,
            consumer_tag: consumer.tag.clone(),
            queue: self.queue.name.clone(),
            message: message.shallow_copy(),
        };
        self.unacked.lock().push_back(tag, Unacked::new(message, consumer.tag.clone(), self.queue.name.clone()));
        drop(consumers);
        self.flow_changed(event);
        Some((consumer, delivery))
    }

    /// Undoes [`Self::next_delivery`] after the sink refused the message.
    pub(crate) fn delivery_failed(&self, tag: DeliveryTag) {
        let Some(u) = self.unacked.lock().remove(&tag) else {
            return;
        };
        // no wakeup, the driver retries after its idle delay
        let event = {
            let mut body = self.body.lock();
            body.messages.push_front(u.message);
            self.after_push(&mut body)
        };
        self.flow_changed(event);
    }

    #[inline]
    pub(crate) fn has_work(&self) -> bool {
        self.consumers.lock().has_ready() && !self.is_empty()
    }

    /// Id of the message delivered under `tag`
    pub fn unacked_id(&self, tag: DeliveryTag) -> Result<MessageId> {
        self.unacked.lock().get(&tag).map(|u| u.message.id()).ok_or_else(|| {
            BrokerError::validation(format!("unknown delivery tag {} on queue {}", tag, self.queue.name))
        })
    }

    pub fn acknowledge(&self, tag: DeliveryTag) -> Result<Unacked> {
        self.unacked.lock().remove(&tag).ok_or_else(|| {
            BrokerError::validation(format!("unknown delivery tag {} on queue {}", tag, self.queue.name))
        })
    }

    /// Rejects a delivery. With `requeue` the message goes back to the head of the queue and `None`
    /// is returned; otherwise the message stays tracked and a copy is returned for dead-lettering.
    pub fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<Option<Message>> {
        if requeue {
            let u = self.acknowledge(tag)?;
            self.enqueue_front(vec![u.message], true);
            Ok(None)
        } else {
            let unacked = self.unacked.lock();
            let u = unacked.get(&tag).ok_or_else(|| {
                BrokerError::validation(format!("unknown delivery tag {} on queue {}", tag, self.queue.name))
            })?;
            Ok(Some(u.message.shallow_copy()))
        }
    }

    /// Returns unacknowledged messages of `consumer_tag` (or all of them) to the head of the queue
    /// in delivery order, marked redelivered.
    pub fn reject_all(&self, consumer_tag: Option<&str>) -> usize {
        let returned = self.unacked.lock().take(consumer_tag);
        self.enqueue_front(returned.into_iter().map(|(_, u)| u.message).collect_vec(), true)
    }

    /// Recovers the unacknowledged deliveries of one consumer.
    ///
    /// Without `requeue` every delivery is sent again to the same consumer under its original tag,
    /// oldest first, and stays unacknowledged; a paused consumer is refused. With `requeue` they go
    /// back to the queue through [`Self::reject_all`] and are scheduled again like new messages.
    pub async fn recover(&self, consumer_tag: &str, requeue: bool) -> Result<usize> {
        if requeue {
            return Ok(self.reject_all(Some(consumer_tag)));
        }
        let consumer = self.consumers.lock().get(consumer_tag).cloned().ok_or_else(|| {
            BrokerError::validation(format!("unknown consumer {} on queue {}", consumer_tag, self.queue.name))
        })?;
        if !consumer.is_ready() {
            return Err(BrokerError::validation(format!(
                "consumer {} on queue {} is paused",
                consumer_tag, self.queue.name
            )));
        }
        let copies = self.unacked.lock().redeliver(consumer_tag);
        let n = copies.len();
        for (tag, message) in copies {
            let delivery = Delivery { tag, consumer_tag: consumer.tag.clone(), queue: self.queue.name.clone(), message };
            consumer.sink().deliver(delivery).await.map_err(|e| BrokerError::internal(e.to_string()))?;
        }
        Ok(n)
    }

    /// Removes every queued message, returning how many there were.
    pub fn purge(&self) -> usize {
        let (messages, event) = {
            let mut body = self.body.lock();
            let messages = std::mem::take(&mut body.messages);
            let event = self.after_pop(&mut body);
            (messages, event)
        };
        self.flow_changed(event);
        let n = messages.len();
        messages.into_iter().for_each(Message::release);
        n
    }
}

impl fmt::Debug for QueueHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueHandler {{ queue: {:?}, size: {} }}", self.queue, self.size())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::consumer::ChannelSink;
    use crate::message::Metadata;

    fn handler(capacity: usize) -> Arc<QueueHandler> {
        let q = Queue::new("q", false, false, capacity);
        Arc::new(QueueHandler::new(q, Watermarks::from_ratios(capacity, 0.8, 0.5), UnackedTracker::new()))
    }

    fn msg(id: u64) -> Message {
        Message::with_body(Metadata::new(id, "", "q"), "x")
    }

    #[test]
    fn watermarks() {
        let w = Watermarks::from_ratios(10, 0.8, 0.5);
        assert_eq!((w.high, w.low), (8, 5));
        let w = Watermarks::from_ratios(1, 0.8, 0.5);
        assert_eq!((w.high, w.low), (1, 0));
    }

    #[test]
    fn capacity_and_flow_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events1 = events.clone();
        let q = Queue::new("q", false, false, 4);
        let listener: Arc<dyn FlowListener> =
            Arc::new(move |_: &QueueName, e: FlowEvent| events1.lock().push(e));
        let h = QueueHandler::new(q, Watermarks::from_ratios(4, 0.75, 0.25), UnackedTracker::new())
            .flow_listener(Some(listener));

        for id in 0..4 {
            assert!(h.enqueue(msg(id)).is_ok());
        }
        assert_eq!(h.enqueue(msg(9)).unwrap_err().id(), 9);
        assert_eq!(h.size(), 4);
        assert_eq!(*events.lock(), vec![FlowEvent::Blocked]);

        assert_eq!(h.purge(), 4);
        assert_eq!(*events.lock(), vec![FlowEvent::Blocked, FlowEvent::Unblocked]);
        assert!(h.is_empty());
    }

    #[test]
    fn reject_requeues_to_front() {
        let h = handler(10);
        let (sink, _rx) = ChannelSink::channel();
        h.consumers.lock().push(Arc::new(Consumer::new("q", "c1", false, sink)));
        h.enqueue(msg(1)).unwrap();
        h.enqueue(msg(2)).unwrap();

        let tags = AtomicU64::new(1);
        let (_, d) = h.next_delivery(&tags).unwrap();
        assert_eq!(d.message.id(), 1);
        assert_eq!(h.unacked_count(), 1);

        // dead-letter path keeps the original tracked
        assert_eq!(h.reject(d.tag, false).unwrap().unwrap().id(), 1);
        assert_eq!(h.unacked_count(), 1);

        assert!(h.reject(d.tag, true).unwrap().is_none());
        assert_eq!(h.unacked_count(), 0);
        let (_, d) = h.next_delivery(&tags).unwrap();
        assert_eq!(d.message.id(), 1);
        assert!(d.message.is_redelivered());

        assert!(h.acknowledge(d.tag).is_ok());
        assert!(h.acknowledge(d.tag).unwrap_err().is_validation());
    }

    #[test]
    fn reject_all_keeps_delivery_order() {
        let h = handler(10);
        let (sink, _rx) = ChannelSink::channel();
        h.consumers.lock().push(Arc::new(Consumer::new("q", "c1", false, sink)));
        for id in 1..=4 {
            h.enqueue(msg(id)).unwrap();
        }
        let tags = AtomicU64::new(1);
        h.next_delivery(&tags).unwrap();
        h.next_delivery(&tags).unwrap();

        assert_eq!(h.reject_all(Some("c1")), 2);
        let ids = (0..4).filter_map(|_| h.next_delivery(&tags)).map(|(_, d)| d.message.id()).collect_vec();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!((h.size(), h.unacked_count()), (0, 4));
    }

    #[test]
    fn no_delivery_without_ready_consumer() {
        let h = handler(10);
        h.enqueue(msg(1)).unwrap();
        let tags = AtomicU64::new(1);
        assert!(h.next_delivery(&tags).is_none());

        let (sink, _rx) = ChannelSink::channel();
        let c = Arc::new(Consumer::new("q", "c1", false, sink));
        c.set_ready(false);
        h.consumers.lock().push(c.clone());
        assert!(!h.has_work());
        assert!(h.next_delivery(&tags).is_none());
        assert_eq!(h.size(), 1);

        c.set_ready(true);
        assert!(h.has_work());
        assert!(h.next_delivery(&tags).is_some());
    }

    #[tokio::test]
    async fn recover_resends_in_order() {
        let h = handler(10);
        let (sink, mut rx) = ChannelSink::channel();
        let c = Arc::new(Consumer::new("q", "c1", false, sink));
        h.consumers.lock().push(c.clone());
        for id in 1..=3 {
            h.enqueue(msg(id)).unwrap();
        }
        let tags = AtomicU64::new(1);
        let delivered = (0..3).filter_map(|_| h.next_delivery(&tags)).map(|(_, d)| d.tag).collect_vec();

        assert_eq!(h.recover("c1", false).await.unwrap(), 3);
        let mut resent = Vec::new();
        while let Ok(Some(d)) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            assert!(d.message.is_redelivered());
            resent.push(d.tag);
        }
        assert_eq!(resent, delivered);
        assert_eq!(h.unacked_count(), 3);

        c.set_ready(false);
        assert!(h.recover("c1", false).await.unwrap_err().is_validation());
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        assert_eq!(h.unacked_count(), 3);

        assert_eq!(h.recover("c1", true).await.unwrap(), 3);
        assert_eq!(h.unacked_count(), 0);
        assert_eq!(h.size(), 3);
        assert!(h.recover("nobody", false).await.unwrap_err().is_validation());
    }
}
