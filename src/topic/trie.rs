//! Topic Trie for efficient subscription matching
//!
//! A trie (token tree) storing subscription patterns. Each level maps literal
//! tokens to child nodes and has at most one partial (`*`) and one full (`>`)
//! wildcard child. Resolved literal topics are memoized in a bounded cache
//! that is kept consistent with every insert and remove.
//!
//! Performance optimizations:
//! - Uses compact_str for memory-efficient token storage
//! - Uses SmallVec to tokenize typical topic depths without heap allocation
//! - Cache hits only take the shared lock

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use ahash::AHashMap;
use compact_str::CompactString;
use parking_lot::RwLock;
use rand::Rng;
use smallvec::SmallVec;

use super::validation::{pattern_matches, tokenize, validate_pattern, Token, TopicError};

/// Default bound on the number of cached literal topics
pub const DEFAULT_CACHE_MAX: usize = 1024;

type Tokens<'a> = SmallVec<[&'a str; 16]>;

/// Node in the topic trie
#[derive(Debug)]
struct Node<V> {
    /// Subscriptions whose pattern terminates at this node
    subs: Vec<V>,
    /// Children for longer patterns
    next: Option<Box<Level<V>>>,
}

impl<V> Node<V> {
    fn new() -> Self {
        Self {
            subs: Vec::with_capacity(4),
            next: None,
        }
    }

    /// A node may be pruned once it holds nothing and leads nowhere
    fn is_empty(&self) -> bool {
        self.subs.is_empty() && self.next.as_ref().map_or(true, |l| l.num_nodes() == 0)
    }
}

/// A group of sibling nodes plus the wildcard slots
#[derive(Debug)]
struct Level<V> {
    nodes: AHashMap<CompactString, Node<V>>,
    /// Partial wildcard (`*`) child
    pwc: Option<Box<Node<V>>>,
    /// Full wildcard (`>`) child
    fwc: Option<Box<Node<V>>>,
}

impl<V> Level<V> {
    fn new() -> Self {
        Self {
            nodes: AHashMap::with_capacity(4),
            pwc: None,
            fwc: None,
        }
    }

    fn num_nodes(&self) -> usize {
        self.nodes.len() + usize::from(self.pwc.is_some()) + usize::from(self.fwc.is_some())
    }

    /// Get the child for a pattern token, creating it if missing
    fn child_or_insert(&mut self, token: &str) -> &mut Node<V> {
        match Token::parse(token) {
            Token::Partial => &mut **self.pwc.get_or_insert_with(|| Box::new(Node::new())),
            Token::Full => &mut **self.fwc.get_or_insert_with(|| Box::new(Node::new())),
            Token::Literal(t) => self
                .nodes
                .entry(CompactString::new(t))
                .or_insert_with(Node::new),
        }
    }

    fn child_mut(&mut self, token: &str) -> Option<&mut Node<V>> {
        match Token::parse(token) {
            Token::Partial => self.pwc.as_deref_mut(),
            Token::Full => self.fwc.as_deref_mut(),
            Token::Literal(t) => self.nodes.get_mut(t),
        }
    }

    fn prune(&mut self, token: &str) {
        match Token::parse(token) {
            Token::Partial => self.pwc = None,
            Token::Full => self.fwc = None,
            Token::Literal(t) => {
                self.nodes.remove(t);
            }
        }
    }
}

/// Counters guarded by the trie lock
#[derive(Debug)]
struct Counters {
    inserts: u64,
    removes: u64,
    since: SystemTime,
}

impl Counters {
    fn new() -> Self {
        Self {
            inserts: 0,
            removes: 0,
            since: SystemTime::now(),
        }
    }
}

/// Trie and cache are one unit: pruning and cache maintenance touch both.
#[derive(Debug)]
struct Inner<V> {
    root: Level<V>,
    count: usize,
    cache: AHashMap<String, Vec<V>>,
    cache_max: usize,
    counters: Counters,
}

impl<V: Clone> Inner<V> {
    /// Store a resolved result, evicting a random entry when at capacity
    fn cache_store(&mut self, topic: &str, results: Vec<V>) {
        if self.cache_max == 0 {
            return;
        }
        if self.cache.len() >= self.cache_max && !self.cache.contains_key(topic) {
            let victim = rand::thread_rng().gen_range(0..self.cache.len());
            if let Some(key) = self.cache.keys().nth(victim).cloned() {
                self.cache.remove(&key);
            }
        }
        self.cache.insert(topic.to_owned(), results);
    }
}

/// Snapshot of trie statistics
#[derive(Debug, Clone, PartialEq)]
pub struct TrieStats {
    /// Number of stored subscriptions
    pub num_subs: usize,
    /// Number of cached literal topics
    pub num_cache: usize,
    pub num_inserts: u64,
    pub num_removes: u64,
    pub num_matches: u64,
    /// Cache hits divided by matches (0 when nothing was matched yet)
    pub cache_hit_rate: f64,
    /// Largest cached result
    pub max_fanout: usize,
    /// Mean cached result size (0 when the cache is empty)
    pub avg_fanout: f64,
    /// When counting started (construction or last reset)
    pub stats_since: SystemTime,
}

/// Thread-safe topic trie with a bounded match cache
#[derive(Debug)]
pub struct TopicTrie<V> {
    inner: RwLock<Inner<V>>,
    matches: AtomicU64,
    cache_hits: AtomicU64,
}

impl<V: Clone + PartialEq> TopicTrie<V> {
    pub fn new() -> Self {
        Self::with_cache_max(DEFAULT_CACHE_MAX)
    }

    /// Create a trie whose cache holds at most `cache_max` literal topics
    /// (0 disables caching)
    pub fn with_cache_max(cache_max: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                root: Level::new(),
                count: 0,
                cache: AHashMap::with_capacity(cache_max.min(DEFAULT_CACHE_MAX)),
                cache_max,
                counters: Counters::new(),
            }),
            matches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Insert a subscription under a pattern
    ///
    /// Cached topics the pattern matches get the new subscription appended
    /// so hot entries survive inserts.
    pub fn insert(&self, pattern: &str, sub: V) -> Result<(), TopicError> {
        validate_pattern(pattern)?;
        let tokens: Tokens<'_> = tokenize(pattern).collect();
        let Some((last, init)) = tokens.split_last() else {
            return Err(TopicError::Empty);
        };

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let mut level = &mut inner.root;
        for token in init {
            level = &mut **level
                .child_or_insert(token)
                .next
                .get_or_insert_with(|| Box::new(Level::new()));
        }
        level.child_or_insert(last).subs.push(sub.clone());

        inner.count += 1;
        inner.counters.inserts += 1;

        for (topic, results) in inner.cache.iter_mut() {
            if pattern_matches(topic, pattern) {
                results.push(sub.clone());
            }
        }

        Ok(())
    }

    /// Remove a subscription stored under a pattern
    ///
    /// Returns false (and changes nothing) if the pair is not present. Empty
    /// nodes along the path are pruned bottom-up and cache entries the
    /// pattern could have matched are dropped.
    pub fn remove(&self, pattern: &str, sub: &V) -> bool {
        let tokens: Tokens<'_> = tokenize(pattern).collect();

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if !Self::remove_from_level(&mut inner.root, &tokens, sub) {
            return false;
        }

        inner.count -= 1;
        inner.counters.removes += 1;
        inner
            .cache
            .retain(|topic, _| !pattern_matches(topic, pattern));

        true
    }

    fn remove_from_level(level: &mut Level<V>, tokens: &[&str], sub: &V) -> bool {
        let Some((token, rest)) = tokens.split_first() else {
            return false;
        };
        let Some(node) = level.child_mut(token) else {
            return false;
        };

        let removed = if rest.is_empty() {
            match node.subs.iter().position(|s| s == sub) {
                Some(pos) => {
                    node.subs.remove(pos);
                    true
                }
                None => false,
            }
        } else {
            match node.next.as_deref_mut() {
                Some(next) => Self::remove_from_level(next, rest, sub),
                None => false,
            }
        };
        if !removed {
            return false;
        }

        if node.next.as_ref().is_some_and(|l| l.num_nodes() == 0) {
            node.next = None;
        }
        if node.is_empty() {
            level.prune(token);
        }
        true
    }

    /// Find all subscriptions whose pattern matches a literal topic
    ///
    /// Result order is unspecified.
    pub fn matches(&self, topic: &str) -> Vec<V> {
        self.matches.fetch_add(1, Ordering::Relaxed);

        if let Some(hit) = self.inner.read().cache.get(topic) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return hit.clone();
        }

        // Tokenize outside the lock
        let tokens: Tokens<'_> = tokenize(topic).collect();
        let mut results = Vec::with_capacity(4);

        let mut inner = self.inner.write();
        Self::match_level(&inner.root, &tokens, &mut results);
        inner.cache_store(topic, results.clone());

        results
    }

    fn match_level(level: &Level<V>, tokens: &[&str], results: &mut Vec<V>) {
        let Some((token, rest)) = tokens.split_first() else {
            return;
        };

        // `>` absorbs this token and everything after it
        if let Some(ref fwc) = level.fwc {
            results.extend(fwc.subs.iter().cloned());
        }
        if let Some(ref pwc) = level.pwc {
            Self::match_node(pwc, rest, results);
        }
        if let Some(node) = level.nodes.get(*token) {
            Self::match_node(node, rest, results);
        }
    }

    fn match_node(node: &Node<V>, rest: &[&str], results: &mut Vec<V>) {
        if rest.is_empty() {
            results.extend(node.subs.iter().cloned());
        } else if let Some(ref next) = node.next {
            Self::match_level(next, rest, results);
        }
    }

    /// Number of stored subscriptions
    pub fn count(&self) -> usize {
        self.inner.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of cached literal topics
    pub fn cache_len(&self) -> usize {
        self.inner.read().cache.len()
    }

    /// Maximum number of levels in the tree
    pub fn depth(&self) -> usize {
        Self::visit_level(&self.inner.read().root, 0)
    }

    fn visit_level(level: &Level<V>, depth: usize) -> usize {
        if level.num_nodes() == 0 {
            return depth;
        }

        let depth = depth + 1;
        let children = level
            .nodes
            .values()
            .chain(level.pwc.as_deref())
            .chain(level.fwc.as_deref());

        children
            .map(|node| match node.next {
                Some(ref next) => Self::visit_level(next, depth),
                None => depth,
            })
            .max()
            .unwrap_or(depth)
    }

    /// Current statistics
    pub fn stats(&self) -> TrieStats {
        let inner = self.inner.read();
        let matches = self.matches.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);

        let (total, max) = inner
            .cache
            .values()
            .fold((0usize, 0usize), |(total, max), r| (total + r.len(), max.max(r.len())));

        TrieStats {
            num_subs: inner.count,
            num_cache: inner.cache.len(),
            num_inserts: inner.counters.inserts,
            num_removes: inner.counters.removes,
            num_matches: matches,
            cache_hit_rate: if matches > 0 {
                hits as f64 / matches as f64
            } else {
                0.0
            },
            max_fanout: max,
            avg_fanout: if inner.cache.is_empty() {
                0.0
            } else {
                total as f64 / inner.cache.len() as f64
            },
            stats_since: inner.counters.since,
        }
    }

    /// Clear counters and restart the stats clock
    pub fn reset_stats(&self) {
        let mut inner = self.inner.write();
        inner.counters = Counters::new();
        self.matches.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
    }
}

impl<V: Clone + PartialEq> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sorted(mut v: Vec<&'static str>) -> Vec<&'static str> {
        v.sort_unstable();
        v
    }

    #[test]
    fn test_insert_count() {
        let trie = TopicTrie::new();
        trie.insert("foo", "a").unwrap();
        trie.insert("bar", "b").unwrap();
        trie.insert("foo.bar", "b").unwrap();
        trie.insert("foo", "c").unwrap();
        assert_eq!(trie.count(), 4);
    }

    #[test]
    fn test_exact_match() {
        let trie = TopicTrie::new();
        trie.insert("foo.bar.baz", 1).unwrap();

        assert_eq!(trie.matches("foo.bar.baz"), vec![1]);
        assert!(trie.matches("foo.bar").is_empty());
        assert!(trie.matches("foo.bar.baz.qux").is_empty());
    }

    #[test]
    fn test_partial_wildcard() {
        let trie = TopicTrie::new();
        trie.insert("a.b.c", "literal").unwrap();
        trie.insert("a.*.c", "pwc").unwrap();
        trie.insert("a.b.*", "pwc_end").unwrap();

        assert_eq!(
            sorted(trie.matches("a.b.c")),
            vec!["literal", "pwc", "pwc_end"]
        );
        assert_eq!(trie.matches("a.xyz.c"), vec!["pwc"]);
        assert!(trie.matches("a.c").is_empty());
    }

    #[test]
    fn test_full_wildcard() {
        let trie = TopicTrie::new();
        trie.insert("a.>", "fwc").unwrap();
        trie.insert(">", "root").unwrap();

        assert_eq!(sorted(trie.matches("a.b")), vec!["fwc", "root"]);
        assert_eq!(sorted(trie.matches("a.b.c")), vec!["fwc", "root"]);
        assert_eq!(sorted(trie.matches("a.b.c.d")), vec!["fwc", "root"]);
        assert_eq!(trie.matches("a"), vec!["root"]);
    }

    #[test]
    fn test_shorter_and_longer_topics() {
        let trie = TopicTrie::new();
        trie.insert("a.b.c", 1).unwrap();

        // Node exists for "a.b" but holds nothing
        assert!(trie.matches("a.b").is_empty());
        assert!(trie.matches("a.b.c.d").is_empty());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let trie = TopicTrie::new();
        assert_eq!(
            trie.insert("a.>.c", 1),
            Err(TopicError::FullWildcardNotLast)
        );
        assert_eq!(trie.insert("", 1), Err(TopicError::Empty));
        assert_eq!(trie.insert("a..b", 1), Err(TopicError::EmptyToken));
        assert_eq!(trie.count(), 0);
        assert_eq!(trie.depth(), 0);
    }

    #[test]
    fn test_remove() {
        let trie = TopicTrie::new();
        trie.insert("a.b.c.d", "value").unwrap();
        assert_eq!(trie.count(), 1);

        // Unknown value and unknown pattern are no-ops
        assert!(!trie.remove("a.b.c.d", &"other"));
        assert!(!trie.remove("a.b.c", &"value"));
        assert_eq!(trie.count(), 1);

        assert!(trie.remove("a.b.c.d", &"value"));
        assert_eq!(trie.count(), 0);
        assert!(trie.matches("a.b.c.d").is_empty());

        // Second removal does nothing
        assert!(!trie.remove("a.b.c.d", &"value"));
        assert_eq!(trie.count(), 0);
    }

    #[test]
    fn test_remove_one_of_duplicates() {
        let trie = TopicTrie::new();
        trie.insert("a.b", 1).unwrap();
        trie.insert("a.b", 2).unwrap();
        trie.insert("a.*", 3).unwrap();
        assert_eq!(trie.count(), 3);

        assert!(trie.remove("a.b", &1));
        assert_eq!(trie.count(), 2);

        let mut matched = trie.matches("a.b");
        matched.sort_unstable();
        assert_eq!(matched, vec![2, 3]);
    }

    #[test]
    fn test_remove_wildcards() {
        let trie = TopicTrie::new();
        trie.insert("a.b.*.d", "v").unwrap();
        trie.insert("a.b.>", "v").unwrap();
        trie.insert("a.b.c.d", "v").unwrap();
        assert_eq!(trie.matches("a.b.c.d").len(), 3);

        assert!(trie.remove("a.b.c.d", &"v"));
        assert_eq!(trie.matches("a.b.c.d").len(), 2);
        assert!(trie.remove("a.b.>", &"v"));
        assert_eq!(trie.matches("a.b.c.d").len(), 1);
        assert!(trie.remove("a.b.*.d", &"v"));
        assert!(trie.matches("a.b.c.d").is_empty());
        assert_eq!(trie.count(), 0);
    }

    #[test]
    fn test_remove_prunes_nodes() {
        let trie = TopicTrie::new();
        assert_eq!(trie.depth(), 0);

        trie.insert("a.b.c.d.e.f", 1).unwrap();
        assert_eq!(trie.depth(), 6);

        assert!(trie.remove("a.b.c.d.e.f", &1));
        assert_eq!(trie.depth(), 0);
    }

    #[test]
    fn test_remove_prunes_wildcards() {
        let trie = TopicTrie::new();
        trie.insert("a.*.c.>", 1).unwrap();
        assert_eq!(trie.depth(), 4);

        assert!(trie.remove("a.*.c.>", &1));
        assert_eq!(trie.depth(), 0);
    }

    #[test]
    fn test_prune_keeps_shared_prefix() {
        let trie = TopicTrie::new();
        trie.insert("a.b", 1).unwrap();
        trie.insert("a.b.c.d", 2).unwrap();
        assert_eq!(trie.depth(), 4);

        assert!(trie.remove("a.b.c.d", &2));
        assert_eq!(trie.depth(), 2);
        assert_eq!(trie.matches("a.b"), vec![1]);
    }

    #[test]
    fn test_cache_insert_keeps_entries_fresh() {
        let trie = TopicTrie::new();
        trie.insert("a.b.c", "a").unwrap();
        assert_eq!(trie.matches("a.b.c"), vec!["a"]);
        assert_eq!(trie.cache_len(), 1);

        trie.insert("a.>", "b").unwrap();
        assert_eq!(trie.cache_len(), 1);
        assert_eq!(sorted(trie.matches("a.b.c")), vec!["a", "b"]);

        // Unrelated pattern leaves the entry alone
        trie.insert("x.*", "c").unwrap();
        assert_eq!(sorted(trie.matches("a.b.c")), vec!["a", "b"]);
    }

    #[test]
    fn test_cache_remove_drops_stale_entries() {
        let trie = TopicTrie::new();
        trie.insert("a.b.c", "a").unwrap();
        trie.insert("a.>", "b").unwrap();
        assert_eq!(sorted(trie.matches("a.b.c")), vec!["a", "b"]);
        trie.matches("x.y");
        assert_eq!(trie.cache_len(), 2);

        assert!(trie.remove("a.>", &"b"));
        assert_eq!(trie.cache_len(), 1);
        assert_eq!(trie.matches("a.b.c"), vec!["a"]);
    }

    #[test]
    fn test_cache_bounds() {
        let trie = TopicTrie::with_cache_max(16);
        trie.insert("cache.>", "foo").unwrap();

        for i in 0..100 {
            let topic = format!("cache.test.{}", i);
            assert_eq!(trie.matches(&topic), vec!["foo"]);
            assert!(trie.cache_len() <= 16);
        }
        assert_eq!(trie.cache_len(), 16);
    }

    #[test]
    fn test_cache_disabled() {
        let trie = TopicTrie::with_cache_max(0);
        trie.insert("a.*", 1).unwrap();
        assert_eq!(trie.matches("a.b"), vec![1]);
        assert_eq!(trie.cache_len(), 0);
        assert_eq!(trie.matches("a.b"), vec![1]);
    }

    #[test]
    fn test_stats() {
        let trie = TopicTrie::new();
        trie.insert("stats.>", "fwc").unwrap();
        for i in 0..10 {
            trie.insert(&format!("stats.test.{}", i), "l").unwrap();
        }

        let stats = trie.stats();
        assert_eq!(stats.num_subs, 11);
        assert_eq!(stats.num_inserts, 11);
        assert_eq!(stats.num_removes, 0);
        assert_eq!(stats.num_matches, 0);
        assert_eq!(stats.cache_hit_rate, 0.0);
        assert_eq!(stats.avg_fanout, 0.0);

        assert!(trie.remove("stats.test.9", &"l"));
        for _ in 0..4 {
            trie.matches("stats.test.2");
        }
        trie.insert("stats.*.*", "pwc").unwrap();
        trie.matches("stats.test.2");

        let stats = trie.stats();
        assert_eq!(stats.num_subs, 11);
        assert_eq!(stats.num_inserts, 12);
        assert_eq!(stats.num_removes, 1);
        assert_eq!(stats.num_matches, 5);
        assert_eq!(stats.num_cache, 1);
        assert_eq!(stats.cache_hit_rate, 0.8);
        assert_eq!(stats.max_fanout, 3);
        assert_eq!(stats.avg_fanout, 3.0);

        trie.reset_stats();
        let stats = trie.stats();
        assert_eq!(stats.num_subs, 11);
        assert_eq!(stats.num_inserts, 0);
        assert_eq!(stats.num_removes, 0);
        assert_eq!(stats.num_matches, 0);
        assert_eq!(stats.cache_hit_rate, 0.0);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;

        let trie = Arc::new(TopicTrie::with_cache_max(64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let trie = trie.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let pattern = format!("t{}.{}.*", t, i % 10);
                        trie.insert(&pattern, (t, i)).unwrap();
                        trie.matches(&format!("t{}.{}.x", t, i % 10));
                        assert!(trie.remove(&pattern, &(t, i)));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(trie.count(), 0);
        assert_eq!(trie.depth(), 0);
        assert!(trie.cache_len() <= 64);
    }

    mod proptest_tests {
        use super::*;
        use crate::topic::validation::pattern_matches;
        use proptest::prelude::*;

        fn token() -> impl Strategy<Value = String> {
            prop_oneof![Just("a"), Just("b"), Just("c")].prop_map(String::from)
        }

        fn pattern_token() -> impl Strategy<Value = String> {
            prop_oneof![Just("a"), Just("b"), Just("c"), Just("*")].prop_map(String::from)
        }

        fn pattern() -> impl Strategy<Value = String> {
            (prop::collection::vec(pattern_token(), 1..4), any::<bool>()).prop_map(
                |(mut tokens, full)| {
                    if full {
                        tokens.push(">".to_string());
                    }
                    tokens.join(".")
                },
            )
        }

        fn topic() -> impl Strategy<Value = String> {
            prop::collection::vec(token(), 1..5).prop_map(|t| t.join("."))
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            #[test]
            fn prop_matches_reference_matcher(
                patterns in prop::collection::vec(pattern(), 1..12),
                topics in prop::collection::vec(topic(), 1..12),
            ) {
                let trie = TopicTrie::with_cache_max(4);
                for (i, p) in patterns.iter().enumerate() {
                    trie.insert(p, i).unwrap();
                }

                // Run twice so the second pass goes through the cache
                for _ in 0..2 {
                    for t in &topics {
                        let mut got = trie.matches(t);
                        got.sort_unstable();
                        let expected: Vec<usize> = patterns
                            .iter()
                            .enumerate()
                            .filter(|(_, p)| pattern_matches(t, p))
                            .map(|(i, _)| i)
                            .collect();
                        prop_assert_eq!(got, expected);
                    }
                }

                for (i, p) in patterns.iter().enumerate() {
                    prop_assert!(trie.remove(p, &i));
                }
                prop_assert_eq!(trie.count(), 0);
                prop_assert_eq!(trie.depth(), 0);
                for t in &topics {
                    prop_assert!(trie.matches(t).is_empty());
                }
            }
        }
    }
}
