use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::message::Metadata;
use crate::selector::{Selector, SelectorError};
use crate::topic::{Pattern, TopicMatcher};
use crate::types::{Arguments, ExchangeName, HashMap, QueueName, RoutingKey, ARG_SELECTOR, DEFAULT_EXCHANGE};
use crate::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    /// Whether bindings of this kind need a non-empty routing pattern
    #[inline]
    pub fn requires_routing_key(&self) -> bool {
        !matches!(self, ExchangeKind::Fanout)
    }
}

impl FromStr for ExchangeKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            _ => Err(BrokerError::validation(format!("unknown exchange type '{s}'"))),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        })
    }
}

/// A routing rule from an exchange to a queue.
#[derive(Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: QueueName,
    pub pattern: RoutingKey,
    pub selector: Option<Arc<Selector>>,
    pub arguments: Arguments,
}

impl Binding {
    /// Builds a binding, parsing the selector found in `arguments`, if any.
    pub fn new<Q, P>(queue: Q, pattern: P, arguments: Arguments) -> std::result::Result<Self, SelectorError>
    where
        Q: Into<QueueName>,
        P: Into<RoutingKey>,
    {
        let selector = match arguments.get(ARG_SELECTOR) {
            Some(text) if !text.trim().is_empty() => Some(Arc::new(Selector::parse(text)?)),
            _ => None,
        };
        Ok(Binding { queue: queue.into(), pattern: pattern.into(), selector, arguments })
    }

    #[inline]
    pub fn selector_text(&self) -> Option<&str> {
        self.selector.as_ref().map(|s| s.as_str())
    }

    /// Same (queue, pattern, selector) triple
    #[inline]
    pub fn same_route(&self, queue: &str, pattern: &str, selector: Option<&str>) -> bool {
        self.queue == queue && self.pattern == pattern && self.selector_text() == selector
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binding {{ queue: {}, pattern: {:?}, selector: {:?} }}", self.queue, self.pattern, self.selector_text())
    }
}

/// Bindings that match one routing key, split by whether they carry a selector.
#[derive(Debug, Default, Clone)]
pub struct BindingSet {
    pub unfiltered: Vec<Arc<Binding>>,
    pub filtered: Vec<Arc<Binding>>,
}

impl BindingSet {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.unfiltered.is_empty() && self.filtered.is_empty()
    }

    #[inline]
    fn push(&mut self, b: &Arc<Binding>) {
        if b.selector.is_some() {
            self.filtered.push(b.clone());
        } else {
            self.unfiltered.push(b.clone());
        }
    }

    /// Distinct destination queues for a message with `meta`, in first-seen order.
    pub fn resolve(&self, meta: &Metadata) -> Vec<QueueName> {
        self.unfiltered
            .iter()
            .chain(self.filtered.iter().filter(|b| b.selector.as_ref().map(|s| s.matches(meta)).unwrap_or(true)))
            .map(|b| b.queue.clone())
            .unique()
            .collect()
    }
}

#[derive(Default)]
struct RoutingTable {
    routes: HashMap<RoutingKey, Vec<Arc<Binding>>>,
    matcher: TopicMatcher,
}

pub struct Exchange {
    pub name: ExchangeName,
    pub kind: ExchangeKind,
    pub durable: bool,
    table: RoutingTable,
}

impl Exchange {
    #[inline]
    pub fn new<N: Into<ExchangeName>>(name: N, kind: ExchangeKind, durable: bool) -> Self {
        Self { name: name.into(), kind, durable, table: RoutingTable::default() }
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_EXCHANGE
    }

    /// Adds `binding`. Returns false when an identical binding already exists, or when the pattern
    /// is empty on a non-default exchange that needs one, which is silently skipped.
    pub fn bind(&mut self, binding: Binding) -> Result<bool> {
        if !self.accepts(&binding)? {
            return Ok(false);
        }
        if matches!(self.kind, ExchangeKind::Topic) {
            self.table.matcher.add(&Pattern::parse(&binding.pattern));
        }
        self.table.routes.entry(binding.pattern.clone()).or_default().push(Arc::new(binding));
        Ok(true)
    }

    /// Whether [`Self::bind`] would add `binding`, without changing anything.
    pub fn accepts(&self, binding: &Binding) -> Result<bool> {
        if binding.pattern.is_empty() && self.kind.requires_routing_key() {
            if self.is_default() {
                return Err(BrokerError::validation("routing key must not be empty on the default exchange"));
            }
            log::debug!("{} skip binding of {} with empty routing key", self.name, binding.queue);
            return Ok(false);
        }
        Ok(!self.contains(&binding.queue, &binding.pattern, binding.selector_text()))
    }

    #[inline]
    pub fn find(&self, queue: &str, pattern: &str, selector: Option<&str>) -> Option<&Arc<Binding>> {
        self.table.routes.get(pattern)?.iter().find(|b| b.same_route(queue, pattern, selector))
    }

    #[inline]
    pub fn contains(&self, queue: &str, pattern: &str, selector: Option<&str>) -> bool {
        self.find(queue, pattern, selector).is_some()
    }

    /// Persisted form of `binding` on this exchange
    #[inline]
    pub fn binding_def(&self, binding: &Binding) -> BindingDef {
        BindingDef {
            exchange: self.name.clone(),
            queue: binding.queue.clone(),
            routing_key: binding.pattern.clone(),
            arguments: binding.arguments.clone(),
        }
    }

    /// Removes the binding with exactly this triple. Unknown bindings are ignored.
    pub fn unbind(&mut self, queue: &str, pattern: &str, selector: Option<&str>) -> Option<Arc<Binding>> {
        let bindings = self.table.routes.get_mut(pattern)?;
        let pos = bindings.iter().position(|b| b.same_route(queue, pattern, selector))?;
        let removed = bindings.remove(pos);
        if bindings.is_empty() {
            self.table.routes.remove(pattern);
        }
        if matches!(self.kind, ExchangeKind::Topic) {
            self.table.matcher.remove(&Pattern::parse(pattern));
        }
        Some(removed)
    }

    /// Removes every binding to `queue`, returning them.
    pub fn remove_queue(&mut self, queue: &str) -> Vec<Arc<Binding>> {
        let targets = self
            .table
            .routes
            .values()
            .flatten()
            .filter(|b| b.queue == queue)
            .map(|b| (b.pattern.clone(), b.selector_text().map(String::from)))
            .collect::<Vec<_>>();
        targets.into_iter().filter_map(|(pattern, selector)| self.unbind(queue, &pattern, selector.as_deref())).collect()
    }

    pub fn bindings_for_route(&self, routing_key: &str) -> BindingSet {
        let mut set = BindingSet::default();
        match self.kind {
            ExchangeKind::Direct => {
                if let Some(bindings) = self.table.routes.get(routing_key) {
                    bindings.iter().for_each(|b| set.push(b));
                }
            }
            ExchangeKind::Topic => {
                for pattern in self.table.matcher.matches(routing_key) {
                    if let Some(bindings) = self.table.routes.get(pattern) {
                        bindings.iter().for_each(|b| set.push(b));
                    }
                }
            }
            ExchangeKind::Fanout => self.table.routes.values().flatten().for_each(|b| set.push(b)),
        }
        set
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.table.routes.is_empty()
    }

    #[inline]
    pub fn bindings(&self) -> impl Iterator<Item = &Arc<Binding>> {
        self.table.routes.values().flatten()
    }

    #[inline]
    pub fn bindings_count(&self) -> usize {
        self.table.routes.values().map(|b| b.len()).sum()
    }

    #[inline]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.bindings().any(|b| b.queue == queue)
    }

    #[inline]
    pub fn def(&self) -> ExchangeDef {
        ExchangeDef { name: self.name.clone(), kind: self.kind, durable: self.durable }
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exchange {{ name: {:?}, kind: {}, durable: {}, bindings: {} }}", self.name, self.kind, self.durable, self.bindings_count())
    }
}

/// Persisted form of an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDef {
    pub name: ExchangeName,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Persisted form of a binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingDef {
    pub exchange: ExchangeName,
    pub queue: QueueName,
    pub routing_key: RoutingKey,
    pub arguments: Arguments,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(queue: &str, pattern: &str) -> Binding {
        Binding::new(queue, pattern, Arguments::new()).unwrap()
    }

    fn filtered(queue: &str, pattern: &str, selector: &str) -> Binding {
        let mut args = Arguments::new();
        args.insert(ARG_SELECTOR.into(), selector.into());
        Binding::new(queue, pattern, args).unwrap()
    }

    fn queues(ex: &Exchange, key: &str) -> Vec<QueueName> {
        let mut qs = ex.bindings_for_route(key).resolve(&Metadata::new(1, ex.name.clone(), key));
        qs.sort();
        qs
    }

    #[test]
    fn bind_is_idempotent() {
        let mut ex = Exchange::new("amq.direct", ExchangeKind::Direct, true);
        assert!(ex.bind(binding("q1", "k")).unwrap());
        assert!(!ex.bind(binding("q1", "k")).unwrap());
        assert_eq!(ex.bindings_count(), 1);
        assert_eq!(ex.bindings_for_route("k").unfiltered.len(), 1);

        // a different selector is a different route
        assert!(ex.bind(filtered("q1", "k", "a = 1")).unwrap());
        assert_eq!(ex.bindings_count(), 2);
    }

    #[test]
    fn direct_routing() {
        let mut ex = Exchange::new("amq.direct", ExchangeKind::Direct, true);
        ex.bind(binding("q1", "a")).unwrap();
        ex.bind(binding("q2", "a")).unwrap();
        ex.bind(binding("q3", "b")).unwrap();
        assert_eq!(queues(&ex, "a"), vec!["q1", "q2"]);
        assert!(queues(&ex, "c").is_empty());
    }

    #[test]
    fn topic_routing_deduplicates_queues() {
        let mut ex = Exchange::new("amq.topic", ExchangeKind::Topic, true);
        ex.bind(binding("q1", "sports.*")).unwrap();
        ex.bind(binding("q1", "sports.#")).unwrap();
        ex.bind(binding("q2", "*.cricket.bowlers")).unwrap();

        assert_eq!(ex.bindings_for_route("sports.cricket").unfiltered.len(), 2);
        assert_eq!(queues(&ex, "sports.cricket"), vec!["q1"]);
        assert_eq!(queues(&ex, "srilanka.cricket.bowlers"), vec!["q2"]);

        ex.unbind("q1", "sports.#", None);
        assert!(queues(&ex, "sports.cricket.batsmen").is_empty());
        assert_eq!(queues(&ex, "sports.cricket"), vec!["q1"]);
    }

    #[test]
    fn fanout_ignores_key() {
        let mut ex = Exchange::new("amq.fanout", ExchangeKind::Fanout, true);
        ex.bind(binding("q1", "")).unwrap();
        ex.bind(binding("q2", "anything")).unwrap();
        assert_eq!(queues(&ex, "whatever"), vec!["q1", "q2"]);
    }

    #[test]
    fn empty_routing_key() {
        let mut ex = Exchange::new("amq.direct", ExchangeKind::Direct, true);
        assert!(!ex.bind(binding("q1", "")).unwrap());
        assert!(ex.is_unused());

        let mut default = Exchange::new(DEFAULT_EXCHANGE, ExchangeKind::Direct, true);
        assert!(default.bind(binding("q1", "")).unwrap_err().is_validation());
    }

    #[test]
    fn filtered_bindings() {
        let mut ex = Exchange::new("amq.topic", ExchangeKind::Topic, true);
        ex.bind(filtered("eu", "orders.#", "region = 'eu'")).unwrap();
        ex.bind(filtered("us", "orders.#", "region = 'us'")).unwrap();
        ex.bind(binding("all", "orders.#")).unwrap();

        let set = ex.bindings_for_route("orders.new");
        assert_eq!(set.unfiltered.len(), 1);
        assert_eq!(set.filtered.len(), 2);

        let meta = Metadata::new(1, "amq.topic", "orders.new").header("region", "eu");
        let mut qs = set.resolve(&meta);
        qs.sort();
        assert_eq!(qs, vec!["all", "eu"]);

        let bad = {
            let mut args = Arguments::new();
            args.insert(ARG_SELECTOR.into(), "region =".into());
            Binding::new("q", "k", args)
        };
        assert!(bad.is_err());
    }

    #[test]
    fn unbind_and_remove_queue() {
        let mut ex = Exchange::new("amq.topic", ExchangeKind::Topic, true);
        assert!(ex.unbind("q1", "never", None).is_none());

        ex.bind(binding("q1", "a.*")).unwrap();
        ex.bind(binding("q1", "b.#")).unwrap();
        ex.bind(binding("q2", "a.*")).unwrap();
        assert!(ex.has_queue("q1"));

        let removed = ex.remove_queue("q1");
        assert_eq!(removed.len(), 2);
        assert!(!ex.has_queue("q1"));
        assert_eq!(queues(&ex, "a.x"), vec!["q2"]);
        assert!(queues(&ex, "b.x").is_empty());

        ex.unbind("q2", "a.*", None);
        assert!(ex.is_unused());
    }
}
