//! Engine-wide message flow statistics.
//!
//! Counters are updated without locks from the publish, acknowledge and dead-letter paths and from
//! every queue's unacked tracker. Each one also remembers its peak value.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::utils::Counter;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stats {
    pub published: Counter,
    /// Queue-local copies enqueued
    pub routed: Counter,
    /// Publishes dropped with no matching binding
    pub unroutable: Counter,
    /// Copies dropped because the target queue was full
    pub overflowed: Counter,
    pub dead_lettered: Counter,
    pub acknowledged: Counter,
    pub unacked: Counter,
    pub queues: Counter,
    pub exchanges: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "published": self.published.count(),
            "routed": self.routed.count(),
            "unroutable": self.unroutable.count(),
            "overflowed": self.overflowed.count(),
            "dead_lettered": self.dead_lettered.count(),
            "acknowledged": self.acknowledged.count(),
            "unacked.count": self.unacked.count(),
            "unacked.max": self.unacked.max(),
            "queues.count": self.queues.count(),
            "queues.max": self.queues.max(),
            "exchanges.count": self.exchanges.count(),
            "exchanges.max": self.exchanges.max(),
        })
    }
}
