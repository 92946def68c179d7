//! Message model: metadata, reference counted content chunks and queue-local message copies.
//!
//! A [`Message`] is cheap to copy. [`Message::shallow_copy`] shares the [`Metadata`] and every
//! [`ContentChunk`] with the source and only duplicates the per-copy redelivery state, so one
//! published payload can sit in many queues at once. Chunk bytes are freed when the last copy
//! holding them is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::types::{ExchangeName, HashMap, MessageId, RoutingKey, TimestampMillis};
use crate::utils::timestamp_millis;

/// Immutable byte range shared between message copies.
///
/// Cloning increments an atomic reference count, dropping decrements it.
#[derive(Clone)]
pub struct ContentChunk {
    inner: Arc<ChunkInner>,
}

struct ChunkInner {
    bytes: Bytes,
}

impl ContentChunk {
    #[inline]
    pub fn new<B: Into<Bytes>>(bytes: B) -> Self {
        Self { inner: Arc::new(ChunkInner { bytes: bytes.into() }) }
    }

    #[inline]
    pub fn bytes(&self) -> &Bytes {
        &self.inner.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.bytes.is_empty()
    }

    /// Number of message copies currently holding this chunk
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Handle that observes the chunk without keeping its bytes alive
    #[inline]
    pub fn watch(&self) -> ChunkWatch {
        ChunkWatch(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for ContentChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentChunk {{ len: {}, refs: {} }}", self.len(), self.ref_count())
    }
}

pub struct ChunkWatch(Weak<ChunkInner>);

impl ChunkWatch {
    #[inline]
    pub fn is_released(&self) -> bool {
        self.0.strong_count() == 0
    }

    #[inline]
    pub fn holders(&self) -> usize {
        self.0.strong_count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    String(String),
    Long(i64),
    Double(f64),
    Bool(bool),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::String(s) => f.write_str(s),
            HeaderValue::Long(v) => write!(f, "{v}"),
            HeaderValue::Double(v) => write!(f, "{v}"),
            HeaderValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::String(s.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::String(s)
    }
}

impl From<&ByteString> for HeaderValue {
    fn from(s: &ByteString) -> Self {
        HeaderValue::String(s.to_string())
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Long(v)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Double(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

pub type Headers = HashMap<ByteString, HeaderValue>;

/// Routing information and headers of a published message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub message_id: MessageId,
    pub exchange: ExchangeName,
    pub routing_key: RoutingKey,
    pub headers: Headers,
    pub content_length: usize,
    pub published_at: TimestampMillis,
}

impl Metadata {
    #[inline]
    pub fn new<E, R>(message_id: MessageId, exchange: E, routing_key: R) -> Self
    where
        E: Into<ExchangeName>,
        R: Into<RoutingKey>,
    {
        Self {
            message_id,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            headers: Headers::default(),
            content_length: 0,
            published_at: timestamp_millis(),
        }
    }

    #[inline]
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: Into<ByteString>,
        V: Into<HeaderValue>,
    {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[inline]
    pub fn get_header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }
}

/// A queue-local handle on a published message.
pub struct Message {
    metadata: Arc<Metadata>,
    chunks: Vec<ContentChunk>,
    redelivered: bool,
}

impl Message {
    /// Builds a message, fixing `content_length` to the total chunk size.
    #[inline]
    pub fn new(mut metadata: Metadata, chunks: Vec<ContentChunk>) -> Self {
        metadata.content_length = chunks.iter().map(|c| c.len()).sum();
        Self { metadata: Arc::new(metadata), chunks, redelivered: false }
    }

    #[inline]
    pub fn with_body<B: Into<Bytes>>(metadata: Metadata, body: B) -> Self {
        Self::new(metadata, vec![ContentChunk::new(body)])
    }

    /// A new copy sharing metadata and content with `self`.
    #[inline]
    pub fn shallow_copy(&self) -> Self {
        Self { metadata: self.metadata.clone(), chunks: self.chunks.clone(), redelivered: self.redelivered }
    }

    #[inline]
    pub fn id(&self) -> MessageId {
        self.metadata.message_id
    }

    #[inline]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable metadata for this copy only; other copies keep seeing the original.
    #[inline]
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        Arc::make_mut(&mut self.metadata)
    }

    #[inline]
    pub fn chunks(&self) -> &[ContentChunk] {
        &self.chunks
    }

    #[inline]
    pub fn content_length(&self) -> usize {
        self.metadata.content_length
    }

    /// The payload as one contiguous buffer.
    #[inline]
    pub fn content(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [one] => one.bytes().clone(),
            many => {
                let mut buf = BytesMut::with_capacity(self.content_length());
                for c in many {
                    buf.extend_from_slice(c.bytes());
                }
                buf.freeze()
            }
        }
    }

    #[inline]
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    #[inline]
    pub fn set_redeliver(&mut self) {
        self.redelivered = true;
    }

    /// Disposes this copy. Content bytes go away once no other copy holds them.
    #[inline]
    pub fn release(self) {
        log::trace!("release message {}", self.id());
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.metadata.message_id)
            .field("exchange", &self.metadata.exchange)
            .field("routing_key", &self.metadata.routing_key)
            .field("content_length", &self.metadata.content_length)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Hands out increasing message ids seeded from the wall clock, so ids stay unique across restarts.
pub struct MessageIdGenerator {
    last: AtomicU64,
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdGenerator {
    const SEQ_BITS: u32 = 12;

    #[inline]
    pub fn new() -> Self {
        Self { last: AtomicU64::new(0) }
    }

    #[inline]
    pub fn next_id(&self) -> MessageId {
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let floor = (timestamp_millis().max(0) as u64) << Self::SEQ_BITS;
            let next = floor.max(prev + 1);
            match self.last.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Ensures future ids are greater than `id`, used after loading stored messages.
    #[inline]
    pub fn observe(&self, id: MessageId) {
        self.last.fetch_max(id, Ordering::SeqCst);
    }
}
