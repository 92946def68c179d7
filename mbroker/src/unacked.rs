use std::sync::Arc;

use itertools::Itertools;
use rust_box::dequemap::DequeBTreeMap as DequeMap;

use crate::message::Message;
use crate::types::{ConsumerTag, DeliveryTag, QueueName, TimestampMillis};
use crate::utils::timestamp_millis;

type Entries = DequeMap<DeliveryTag, Unacked>;

pub trait OnEventFn: 'static + Sync + Send + Fn() {}
impl<T> OnEventFn for T where T: 'static + Sync + Send + Fn() {}

/// A delivered message waiting for acknowledgment.
#[derive(Debug)]
pub struct Unacked {
    pub message: Message,
    pub consumer_tag: ConsumerTag,
    pub queue: QueueName,
    pub delivered_at: TimestampMillis,
}

impl Unacked {
    #[inline]
    pub fn new(message: Message, consumer_tag: ConsumerTag, queue: QueueName) -> Self {
        Self { message, consumer_tag, queue, delivered_at: timestamp_millis() }
    }
}

/// Unacknowledged deliveries of one queue in delivery order.
#[derive(Default)]
pub struct UnackedTracker {
    entries: Entries,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl UnackedTracker {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn on_push<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_push_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn on_pop<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_pop_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    fn popped(&self) {
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
    }

    /// Tracks a delivery. Returns the entry previously held under `tag`, if any.
    #[inline]
    pub fn push_back(&mut self, tag: DeliveryTag, m: Unacked) -> Option<Unacked> {
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        let old = self.entries.insert(tag, m);
        if old.is_some() {
            self.popped();
        }
        old
    }

    #[inline]
    pub fn get(&self, tag: &DeliveryTag) -> Option<&Unacked> {
        self.entries.get(tag)
    }

    #[inline]
    pub fn remove(&mut self, tag: &DeliveryTag) -> Option<Unacked> {
        let m = self.entries.remove(tag)?;
        self.popped();
        Some(m)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Delivery tags held by `consumer_tag`, oldest first, or every tag when `None`.
    #[inline]
    pub fn tags(&self, consumer_tag: Option<&str>) -> Vec<DeliveryTag> {
        self.entries
            .iter()
            .filter(|(_, m)| consumer_tag.map(|c| m.consumer_tag == c).unwrap_or(true))
            .map(|(tag, _)| *tag)
            .collect_vec()
    }

    /// Removes and returns the deliveries held by `consumer_tag` (or all of them), oldest first.
    #[inline]
    pub fn take(&mut self, consumer_tag: Option<&str>) -> Vec<(DeliveryTag, Unacked)> {
        self.tags(consumer_tag).into_iter().filter_map(|tag| self.remove(&tag).map(|m| (tag, m))).collect_vec()
    }

    /// Redelivery copies of the deliveries held by `consumer_tag`, oldest first. Entries stay tracked
    /// and are flagged redelivered.
    pub fn redeliver(&mut self, consumer_tag: &str) -> Vec<(DeliveryTag, Message)> {
        let tags = self.tags(Some(consumer_tag));
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            if let Some(m) = self.entries.get_mut(&tag) {
                m.message.set_redeliver();
                m.delivered_at = timestamp_millis();
                out.push((tag, m.message.shallow_copy()));
            }
        }
        out
    }
}
