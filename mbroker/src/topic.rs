//! Wildcard routing pattern index.
//!
//! Patterns are `.` separated words. `*` matches exactly one word, a trailing `#` matches zero or
//! more remaining words. A `#` anywhere but the last position is an ordinary word.
//!
//! [`TopicMatcher`] keeps patterns in a tree keyed by word position. Each node has literal word
//! children, at most one `*` child and two terminal markers: one for patterns ending exactly at the
//! node and one for patterns ending at the node with a trailing `#`. Markers are reference counted
//! so the same pattern registered by several bindings is removed independently.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::types::HashMap;

const WORD_SEPARATOR: char = '.';
const SINGLE_WILDCARD: &str = "*";
const MULTI_WILDCARD: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Level {
    Word(String),
    /// `*`
    SingleWildcard,
    /// trailing `#`
    MultiWildcard,
}

/// A parsed routing pattern. Parsing never fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    raw: Arc<str>,
    levels: Vec<Level>,
}

impl Pattern {
    #[inline]
    pub fn parse(s: &str) -> Pattern {
        let words = split_words(s);
        let last = words.len().saturating_sub(1);
        let levels = words
            .iter()
            .enumerate()
            .map(|(i, w)| match *w {
                SINGLE_WILDCARD => Level::SingleWildcard,
                MULTI_WILDCARD if i == last => Level::MultiWildcard,
                w => Level::Word(w.to_owned()),
            })
            .collect();
        Pattern { raw: Arc::from(s), levels }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Matches a single concrete routing key against this pattern.
    pub fn matches(&self, key: &str) -> bool {
        let words = split_words(key);
        let mut pos = 0;
        for level in &self.levels {
            match level {
                Level::MultiWildcard => return true,
                Level::SingleWildcard => {
                    if pos >= words.len() {
                        return false;
                    }
                }
                Level::Word(w) => {
                    if words.get(pos) != Some(&w.as_str()) {
                        return false;
                    }
                }
            }
            pos += 1;
        }
        pos == words.len()
    }

    /// Levels before a trailing `#` and whether the pattern ends with one.
    #[inline]
    fn path(&self) -> (&[Level], bool) {
        match self.levels.split_last() {
            Some((Level::MultiWildcard, prefix)) => (prefix, true),
            _ => (&self.levels, false),
        }
    }
}

impl FromStr for Pattern {
    type Err = std::convert::Infallible;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Pattern::parse(s))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[inline]
fn split_words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split(WORD_SEPARATOR).collect()
    }
}

#[derive(Debug)]
struct Terminal {
    pattern: Arc<str>,
    refs: usize,
}

#[derive(Default)]
struct Node {
    words: HashMap<String, Node>,
    star: Option<Box<Node>>,
    hash_end: Option<Terminal>,
    exact_end: Option<Terminal>,
}

impl Node {
    #[inline]
    fn is_empty(&self) -> bool {
        self.words.is_empty() && self.star.is_none() && self.hash_end.is_none() && self.exact_end.is_none()
    }

    fn insert(&mut self, path: &[Level], hash: bool, pattern: &Arc<str>) -> bool {
        match path.split_first() {
            None => {
                let slot = if hash { &mut self.hash_end } else { &mut self.exact_end };
                if let Some(t) = slot.as_mut() {
                    t.refs += 1;
                    false
                } else {
                    *slot = Some(Terminal { pattern: pattern.clone(), refs: 1 });
                    true
                }
            }
            Some((Level::Word(w), rest)) => self.words.entry(w.clone()).or_default().insert(rest, hash, pattern),
            Some((_, rest)) => self.star.get_or_insert_with(Box::default).insert(rest, hash, pattern),
        }
    }

    /// Returns `Some(true)` when the last reference of the pattern went away.
    fn remove(&mut self, path: &[Level], hash: bool) -> Option<bool> {
        match path.split_first() {
            None => {
                let slot = if hash { &mut self.hash_end } else { &mut self.exact_end };
                let t = slot.as_mut()?;
                t.refs -= 1;
                if t.refs == 0 {
                    *slot = None;
                    Some(true)
                } else {
                    Some(false)
                }
            }
            Some((Level::Word(w), rest)) => {
                let child = self.words.get_mut(w.as_str())?;
                let res = child.remove(rest, hash);
                if child.is_empty() {
                    self.words.remove(w.as_str());
                }
                res
            }
            Some((_, rest)) => {
                let child = self.star.as_mut()?;
                let res = child.remove(rest, hash);
                if child.is_empty() {
                    self.star = None;
                }
                res
            }
        }
    }

    fn nodes_size(&self) -> usize {
        let words: usize = self.words.values().map(|n| 1 + n.nodes_size()).sum();
        words + self.star.as_ref().map(|n| 1 + n.nodes_size()).unwrap_or_default()
    }
}

/// Incrementally maintained set of routing patterns.
#[derive(Default)]
pub struct TopicMatcher {
    root: Node,
    patterns: usize,
}

impl TopicMatcher {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one reference to `pattern`. Returns true if the pattern was not present before.
    #[inline]
    pub fn add(&mut self, pattern: &Pattern) -> bool {
        let (path, hash) = pattern.path();
        let added = self.root.insert(path, hash, &pattern.raw);
        if added {
            self.patterns += 1;
        }
        added
    }

    /// Drops one reference to `pattern`. Returns true if that was the last reference.
    /// Removing an unknown pattern is a no-op.
    #[inline]
    pub fn remove(&mut self, pattern: &Pattern) -> bool {
        let (path, hash) = pattern.path();
        let removed = self.root.remove(path, hash).unwrap_or(false);
        if removed {
            self.patterns -= 1;
        }
        removed
    }

    /// Lazily yields every registered pattern matching `key`, each once, in no particular order.
    #[inline]
    pub fn matches<'a>(&'a self, key: &'a str) -> Matches<'a> {
        Matches { words: split_words(key), stack: vec![(&self.root, 0)], pending: Vec::new() }
    }

    #[inline]
    pub fn is_match(&self, key: &str) -> bool {
        self.matches(key).next().is_some()
    }

    /// Number of distinct patterns
    #[inline]
    pub fn len(&self) -> usize {
        self.patterns
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.patterns == 0
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        self.root.nodes_size()
    }
}

impl fmt::Debug for TopicMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicMatcher {{ patterns: {}, nodes: {} }}", self.patterns, self.nodes_size())
    }
}

/// Depth-first walk over the pattern tree for one routing key.
#[derive(Clone)]
pub struct Matches<'a> {
    words: Vec<&'a str>,
    stack: Vec<(&'a Node, usize)>,
    pending: Vec<&'a str>,
}

impl<'a> Iterator for Matches<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(p) = self.pending.pop() {
                return Some(p);
            }
            let (node, pos) = self.stack.pop()?;

            // a trailing `#` accepts whatever is left of the key
            if let Some(t) = &node.hash_end {
                self.pending.push(t.pattern.as_ref());
            }

            if pos == self.words.len() {
                if let Some(t) = &node.exact_end {
                    self.pending.push(t.pattern.as_ref());
                }
                continue;
            }

            if let Some(child) = node.words.get(self.words[pos]) {
                self.stack.push((child, pos + 1));
            }
            if let Some(child) = node.star.as_deref() {
                self.stack.push((child, pos + 1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn matcher(patterns: &[&str]) -> TopicMatcher {
        let mut m = TopicMatcher::new();
        for p in patterns {
            m.add(&Pattern::parse(p));
        }
        m
    }

    fn matched(m: &TopicMatcher, key: &str) -> BTreeSet<String> {
        m.matches(key).map(String::from).collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_word_wildcard() {
        let m = matcher(&["sports.*"]);
        assert_eq!(matched(&m, "sports.cricket"), set(&["sports.*"]));
        assert!(matched(&m, "sports.cricket.batsmen").is_empty());
        assert!(matched(&m, "sports").is_empty());

        let m = matcher(&["*.cricket.bowlers"]);
        assert!(m.is_match("srilanka.cricket.bowlers"));
        assert!(!m.is_match("cricket.bowlers"));
    }

    #[test]
    fn trailing_multi_word_wildcard() {
        let m = matcher(&["sports.#"]);
        assert!(m.is_match("sports.cricket"));
        assert!(m.is_match("sports.cricket.batsmen"));
        assert!(m.is_match("sports"));
        assert!(!m.is_match("cricket"));

        let m = matcher(&["#"]);
        assert!(m.is_match(""));
        assert!(m.is_match("a.b.c"));
    }

    #[test]
    fn inner_hash_is_a_word() {
        let m = matcher(&["a.#.c"]);
        assert!(m.is_match("a.#.c"));
        assert!(!m.is_match("a.b.c"));
        assert!(matches!(Pattern::parse("a.#.c").levels()[1], Level::Word(_)));
    }

    #[test]
    fn overlapping_patterns() {
        let m = matcher(&["stock.nyse.ibm", "stock.*.ibm", "stock.#", "*.nyse.*", "#", "stock.nyse"]);
        assert_eq!(
            matched(&m, "stock.nyse.ibm"),
            set(&["stock.nyse.ibm", "stock.*.ibm", "stock.#", "*.nyse.*", "#"])
        );
        assert_eq!(matched(&m, "stock.nyse"), set(&["stock.#", "#", "stock.nyse"]));
        assert_eq!(matched(&m, "bond"), set(&["#"]));
    }

    #[test]
    fn matches_is_restartable() {
        let m = matcher(&["a.*", "a.b"]);
        let it = m.matches("a.b");
        assert_eq!(it.clone().count(), 2);
        assert_eq!(it.count(), 2);
        assert_eq!(m.matches("a.b").count(), 2);
    }

    #[test]
    fn reference_counted_removal() {
        let mut m = TopicMatcher::new();
        let p = Pattern::parse("sports.#");
        assert!(m.add(&p));
        assert!(!m.add(&p));
        assert_eq!(m.len(), 1);

        assert!(!m.remove(&p));
        assert!(m.is_match("sports.cricket"));
        assert!(m.remove(&p));
        assert!(!m.is_match("sports.cricket"));
        assert!(m.is_empty());
        assert_eq!(m.nodes_size(), 0);

        assert!(!m.remove(&Pattern::parse("never.added")));
    }

    #[test]
    fn removal_prunes_only_unused_nodes() {
        let mut m = matcher(&["a.b.c", "a.b", "a.*.c"]);
        assert!(m.remove(&Pattern::parse("a.b.c")));
        assert!(m.is_match("a.b"));
        assert_eq!(matched(&m, "a.b.c"), set(&["a.*.c"]));
        assert!(m.remove(&Pattern::parse("a.*.c")));
        assert!(m.remove(&Pattern::parse("a.b")));
        assert_eq!(m.nodes_size(), 0);
    }

    #[test]
    fn empty_matcher() {
        let m = TopicMatcher::new();
        assert_eq!(m.matches("any.key").count(), 0);
    }

    #[test]
    fn single_pattern_matching() {
        assert!(Pattern::parse("sports.*").matches("sports.cricket"));
        assert!(!Pattern::parse("sports.*").matches("sports.cricket.batsmen"));
        assert!(Pattern::parse("sports.#").matches("sports"));
        assert!(Pattern::parse("*.cricket.bowlers").matches("srilanka.cricket.bowlers"));
        assert!(!Pattern::parse("*").matches(""));
        assert!(Pattern::parse("").matches(""));
    }
}
