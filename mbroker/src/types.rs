use std::fmt;

use bytestring::ByteString;
use serde::{Deserialize, Serialize};

pub type QueueName = ByteString;
pub type ExchangeName = ByteString;
pub type RoutingKey = ByteString;
pub type ConsumerTag = ByteString;
/// Engine-wide identifier of one delivery of one message to one consumer
pub type DeliveryTag = u64;
pub type MessageId = u64;
pub type TimestampMillis = mbroker_utils::TimestampMillis;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Binding argument carrying a selector expression
pub const ARG_SELECTOR: &str = "x-filter-jms-selector";

/// Headers stamped on a message moved to the dead-letter queue
pub const HEADER_ORIGIN_QUEUE: &str = "x-origin-queue";
pub const HEADER_ORIGIN_EXCHANGE: &str = "x-origin-exchange";
pub const HEADER_ORIGIN_ROUTING_KEY: &str = "x-origin-routing-key";

/// The nameless direct exchange every queue is bound to under its own name
pub const DEFAULT_EXCHANGE: &str = "";

/// Identity on whose behalf an operation runs, resolved by the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub name: ByteString,
    /// Skips rule evaluation in the rule based authorizer
    pub superuser: bool,
}

impl Principal {
    #[inline]
    pub fn new<N: Into<ByteString>>(name: N) -> Self {
        Self { name: name.into(), superuser: false }
    }

    #[inline]
    pub fn superuser<N: Into<ByteString>>(name: N) -> Self {
        Self { name: name.into(), superuser: true }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Arguments attached to a binding, e.g. its selector.
pub type Arguments = std::collections::BTreeMap<String, String>;
