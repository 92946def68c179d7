use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::message::Message;
use crate::types::{ConsumerTag, DeliveryTag, QueueName};

/// One message handed to a consumer.
#[derive(Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub consumer_tag: ConsumerTag,
    pub queue: QueueName,
    pub message: Message,
}

/// Outbound path from the core to the protocol layer for one consumer.
#[async_trait]
pub trait DeliverySink: Sync + Send {
    /// A failed delivery puts the message back at the front of its queue.
    async fn deliver(&self, delivery: Delivery) -> anyhow::Result<()>;
}

/// Sink forwarding deliveries into a tokio channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelSink {
    #[inline]
    pub fn new(tx: mpsc::UnboundedSender<Delivery>) -> Self {
        Self { tx }
    }

    #[inline]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl DeliverySink for ChannelSink {
    #[inline]
    async fn deliver(&self, delivery: Delivery) -> anyhow::Result<()> {
        self.tx.send(delivery).map_err(|e| anyhow!("consumer channel closed, delivery tag: {}", e.0.tag))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    /// Queue occupancy reached the high watermark
    Blocked,
    /// Queue occupancy fell back to the low watermark
    Unblocked,
}

pub trait FlowListener: Sync + Send {
    fn on_flow(&self, queue: &QueueName, event: FlowEvent);
}

impl<F> FlowListener for F
where
    F: Fn(&QueueName, FlowEvent) + Sync + Send,
{
    #[inline]
    fn on_flow(&self, queue: &QueueName, event: FlowEvent) {
        self(queue, event)
    }
}

pub struct Consumer {
    pub queue: QueueName,
    pub tag: ConsumerTag,
    pub exclusive: bool,
    ready: AtomicBool,
    sink: Arc<dyn DeliverySink>,
}

impl Consumer {
    #[inline]
    pub fn new<Q, T>(queue: Q, tag: T, exclusive: bool, sink: Arc<dyn DeliverySink>) -> Self
    where
        Q: Into<QueueName>,
        T: Into<ConsumerTag>,
    {
        Self { queue: queue.into(), tag: tag.into(), exclusive, ready: AtomicBool::new(true), sink }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Pauses or resumes delivery to this consumer.
    #[inline]
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    #[inline]
    pub fn sink(&self) -> &Arc<dyn DeliverySink> {
        &self.sink
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Consumer {{ queue: {}, tag: {}, exclusive: {}, ready: {} }}",
            self.queue,
            self.tag,
            self.exclusive,
            self.is_ready()
        )
    }
}

/// Consumers of one queue with a round-robin cursor.
#[derive(Default)]
pub(crate) struct ConsumerSet {
    consumers: Vec<Arc<Consumer>>,
    cursor: usize,
}

impl ConsumerSet {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.consumers.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    #[inline]
    pub(crate) fn get(&self, tag: &str) -> Option<&Arc<Consumer>> {
        self.consumers.iter().find(|c| c.tag == tag)
    }

    #[inline]
    pub(crate) fn has_exclusive(&self) -> bool {
        self.consumers.iter().any(|c| c.exclusive)
    }

    #[inline]
    pub(crate) fn push(&mut self, c: Arc<Consumer>) {
        self.consumers.push(c);
    }

    #[inline]
    pub(crate) fn remove(&mut self, tag: &str) -> Option<Arc<Consumer>> {
        let pos = self.consumers.iter().position(|c| c.tag == tag)?;
        if pos < self.cursor {
            self.cursor -= 1;
        }
        Some(self.consumers.remove(pos))
    }

    #[inline]
    pub(crate) fn has_ready(&self) -> bool {
        self.consumers.iter().any(|c| c.is_ready())
    }

    /// Next ready consumer after the previously selected one.
    pub(crate) fn next_ready(&mut self) -> Option<Arc<Consumer>> {
        let len = self.consumers.len();
        for i in 0..len {
            let idx = (self.cursor + i) % len;
            if self.consumers[idx].is_ready() {
                self.cursor = (idx + 1) % len;
                return Some(self.consumers[idx].clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(tag: &str) -> Arc<Consumer> {
        let (sink, _rx) = ChannelSink::channel();
        Arc::new(Consumer::new("q", tag, false, sink))
    }

    #[test]
    fn round_robin_skips_paused() {
        let mut set = ConsumerSet::default();
        set.push(consumer("c1"));
        set.push(consumer("c2"));
        set.push(consumer("c3"));

        let tags = (0..4).filter_map(|_| set.next_ready()).map(|c| c.tag.to_string()).collect::<Vec<_>>();
        assert_eq!(tags, vec!["c1", "c2", "c3", "c1"]);

        set.get("c2").unwrap().set_ready(false);
        let tags = (0..3).filter_map(|_| set.next_ready()).map(|c| c.tag.to_string()).collect::<Vec<_>>();
        assert_eq!(tags, vec!["c3", "c1", "c3"]);

        set.get("c1").unwrap().set_ready(false);
        set.get("c3").unwrap().set_ready(false);
        assert!(!set.has_ready());
        assert!(set.next_ready().is_none());
    }

    #[test]
    fn remove_keeps_cursor_in_range() {
        let mut set = ConsumerSet::default();
        set.push(consumer("c1"));
        set.push(consumer("c2"));
        assert_eq!(set.next_ready().unwrap().tag, "c1");
        assert!(set.remove("c1").is_some());
        assert!(set.remove("c1").is_none());
        assert_eq!(set.next_ready().unwrap().tag, "c2");
        set.remove("c2");
        assert!(set.is_empty());
        assert!(set.next_ready().is_none());
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelSink::channel();
        drop(rx);
        let d = Delivery {
            tag: 1,
            consumer_tag: "c".into(),
            queue: "q".into(),
            message: Message::with_body(crate::message::Metadata::new(1, "", "q"), "x"),
        };
        assert!(sink.deliver(d).await.is_err());
    }
}
