//! Persistence boundary for durable exchanges, queues, bindings and message bodies.
//!
//! The engine calls the store before it mutates its in-memory topology and applies the change only
//! when the store call succeeded. Stores are never retried by the engine.
//!
//! [`NoopStore`] persists nothing. [`RamStore`] keeps everything in memory and can be told to fail
//! writes, which makes it useful in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::exchange::{BindingDef, ExchangeDef};
use crate::message::{ContentChunk, Message, Metadata};
use crate::queue::Queue;
use crate::types::{ExchangeName, HashMap, MessageId, QueueName};

/// Persisted form of a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub metadata: Metadata,
    pub body: Bytes,
}

impl StoredMessage {
    #[inline]
    pub fn from_message(m: &Message) -> Self {
        Self { metadata: m.metadata().clone(), body: m.content() }
    }

    #[inline]
    pub fn into_message(self) -> Message {
        Message::new(self.metadata, vec![ContentChunk::new(self.body)])
    }
}

/// Everything a store holds, as loaded at startup.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub exchanges: Vec<ExchangeDef>,
    pub queues: Vec<Queue>,
    pub bindings: Vec<BindingDef>,
    /// Messages per queue, oldest first
    pub messages: Vec<(QueueName, Vec<StoredMessage>)>,
}

#[async_trait]
pub trait Store: Sync + Send {
    #[inline]
    async fn load(&self) -> Result<Snapshot> {
        Ok(Snapshot::default())
    }

    #[inline]
    async fn add_exchange(&self, _exchange: &ExchangeDef) -> Result<()> {
        Ok(())
    }

    #[inline]
    async fn delete_exchange(&self, _name: &ExchangeName) -> Result<()> {
        Ok(())
    }

    #[inline]
    async fn add_queue(&self, _queue: &Queue) -> Result<()> {
        Ok(())
    }

    ///Deletes the queue, its bindings and its message references
    #[inline]
    async fn delete_queue(&self, _name: &QueueName) -> Result<()> {
        Ok(())
    }

    #[inline]
    async fn add_binding(&self, _binding: &BindingDef) -> Result<()> {
        Ok(())
    }

    #[inline]
    async fn remove_binding(&self, _binding: &BindingDef) -> Result<()> {
        Ok(())
    }

    ///Stores one message body once, referenced by every queue in `queues`
    #[inline]
    async fn persist_message(&self, _message: &StoredMessage, _queues: &[QueueName]) -> Result<()> {
        Ok(())
    }

    ///Drops the reference of `queue` to a message; the body goes when no queue references it
    #[inline]
    async fn detach_message(&self, _queue: &QueueName, _id: MessageId) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct NoopStore;

impl Store for NoopStore {}

#[derive(Default)]
struct RamState {
    exchanges: BTreeMap<ExchangeName, ExchangeDef>,
    queues: BTreeMap<QueueName, Queue>,
    bindings: Vec<BindingDef>,
    bodies: HashMap<MessageId, (StoredMessage, usize)>,
    queue_messages: BTreeMap<QueueName, BTreeSet<MessageId>>,
}

impl RamState {
    fn detach(&mut self, queue: &QueueName, id: MessageId) {
        let removed = self.queue_messages.get_mut(queue).map(|ids| ids.remove(&id)).unwrap_or(false);
        if !removed {
            return;
        }
        if let Some((_, refs)) = self.bodies.get_mut(&id) {
            *refs -= 1;
            if *refs == 0 {
                self.bodies.remove(&id);
            }
        }
    }
}

#[derive(Default)]
pub struct RamStore {
    state: RwLock<RamState>,
    fail_writes: AtomicBool,
}

impl RamStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail until reset.
    #[inline]
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[inline]
    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(anyhow!("store write failed"))
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn exchange_count(&self) -> usize {
        self.state.read().exchanges.len()
    }

    #[inline]
    pub fn queue_count(&self) -> usize {
        self.state.read().queues.len()
    }

    #[inline]
    pub fn binding_count(&self) -> usize {
        self.state.read().bindings.len()
    }

    /// Number of message bodies held
    #[inline]
    pub fn message_count(&self) -> usize {
        self.state.read().bodies.len()
    }

    #[inline]
    pub fn queue_message_count(&self, queue: &str) -> usize {
        self.state.read().queue_messages.get(queue).map(|ids| ids.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Store for RamStore {
    async fn load(&self) -> Result<Snapshot> {
        let state = self.state.read();
        let messages = state
            .queue_messages
            .iter()
            .map(|(q, ids)| {
                let msgs = ids.iter().filter_map(|id| state.bodies.get(id).map(|(m, _)| m.clone())).collect();
                (q.clone(), msgs)
            })
            .collect();
        Ok(Snapshot {
            exchanges: state.exchanges.values().cloned().collect(),
            queues: state.queues.values().cloned().collect(),
            bindings: state.bindings.clone(),
            messages,
        })
    }

    async fn add_exchange(&self, exchange: &ExchangeDef) -> Result<()> {
        self.check_write()?;
        self.state.write().exchanges.insert(exchange.name.clone(), exchange.clone());
        Ok(())
    }

    async fn delete_exchange(&self, name: &ExchangeName) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.write();
        state.exchanges.remove(name);
        state.bindings.retain(|b| &b.exchange != name);
        Ok(())
    }

    async fn add_queue(&self, queue: &Queue) -> Result<()> {
        self.check_write()?;
        self.state.write().queues.insert(queue.name.clone(), queue.clone());
        Ok(())
    }

    async fn delete_queue(&self, name: &QueueName) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.write();
        state.queues.remove(name);
        state.bindings.retain(|b| &b.queue != name);
        let ids = state.queue_messages.get(name).cloned().unwrap_or_default();
        for id in ids {
            state.detach(name, id);
        }
        state.queue_messages.remove(name);
        Ok(())
    }

    async fn add_binding(&self, binding: &BindingDef) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.write();
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn remove_binding(&self, binding: &BindingDef) -> Result<()> {
        self.check_write()?;
        self.state.write().bindings.retain(|b| b != binding);
        Ok(())
    }

    async fn persist_message(&self, message: &StoredMessage, queues: &[QueueName]) -> Result<()> {
        self.check_write()?;
        let mut state = self.state.write();
        let id = message.metadata.message_id;
        let mut added = 0;
        for q in queues {
            if state.queue_messages.entry(q.clone()).or_default().insert(id) {
                added += 1;
            }
        }
        if added > 0 {
            state.bodies.entry(id).or_insert_with(|| (message.clone(), 0)).1 += added;
        }
        Ok(())
    }

    async fn detach_message(&self, queue: &QueueName, id: MessageId) -> Result<()> {
        self.check_write()?;
        self.state.write().detach(queue, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;

    fn stored(id: MessageId) -> StoredMessage {
        StoredMessage::from_message(&Message::with_body(Metadata::new(id, "amq.direct", "k"), "body"))
    }

    #[tokio::test]
    async fn message_bodies_are_shared_between_queues() {
        let store = RamStore::new();
        let (q1, q2) = (QueueName::from("q1"), QueueName::from("q2"));
        store.persist_message(&stored(1), &[q1.clone(), q2.clone()]).await.unwrap();
        assert_eq!(store.message_count(), 1);
        assert_eq!(store.queue_message_count("q1"), 1);

        store.detach_message(&q1, 1).await.unwrap();
        assert_eq!(store.message_count(), 1);
        store.detach_message(&q1, 1).await.unwrap();
        assert_eq!(store.message_count(), 1);

        store.detach_message(&q2, 1).await.unwrap();
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn load_returns_what_was_written() {
        let store = RamStore::new();
        let ex = ExchangeDef { name: "amq.topic".into(), kind: ExchangeKind::Topic, durable: true };
        let q = Queue::new("q1", true, false, 10);
        let b = BindingDef {
            exchange: "amq.topic".into(),
            queue: "q1".into(),
            routing_key: "a.*".into(),
            arguments: Default::default(),
        };
        store.add_exchange(&ex).await.unwrap();
        store.add_queue(&q).await.unwrap();
        store.add_binding(&b).await.unwrap();
        store.add_binding(&b).await.unwrap();
        store.persist_message(&stored(2), &[q.name.clone()]).await.unwrap();
        store.persist_message(&stored(1), &[q.name.clone()]).await.unwrap();

        let snap = store.load().await.unwrap();
        assert_eq!(snap.exchanges, vec![ex]);
        assert_eq!(snap.queues, vec![q.clone()]);
        assert_eq!(snap.bindings.len(), 1);
        let ids = snap.messages[0].1.iter().map(|m| m.metadata.message_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(snap.messages[0].1[0].clone().into_message().content(), Bytes::from_static(b"body"));

        store.delete_queue(&q.name).await.unwrap();
        assert_eq!(store.queue_count(), 0);
        assert_eq!(store.binding_count(), 0);
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn failing_writes() {
        let store = RamStore::new();
        store.fail_writes(true);
        assert!(store.add_queue(&Queue::new("q", true, false, 1)).await.is_err());
        assert_eq!(store.queue_count(), 0);
        store.fail_writes(false);
        assert!(store.add_queue(&Queue::new("q", true, false, 1)).await.is_ok());
        assert_eq!(store.queue_count(), 1);
    }
}
