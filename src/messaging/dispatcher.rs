//! Stand-alone publish/subscribe dispatcher built on the topic trie.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use rand::Rng;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{Message, MessagingError, SubscribeHandler, TaskExecutor};
use crate::topic::{validate_pattern, validate_topic, TopicTrie, TrieStats};

/// A subscription as stored in the trie
struct Entry {
    /// Unique subscription id
    sid: String,
    pattern: String,
    /// Queue group name (None = fan-out)
    queue: Option<String>,
    handler: Arc<dyn SubscribeHandler>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.sid == other.sid
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("sid", &self.sid)
            .field("pattern", &self.pattern)
            .field("queue", &self.queue)
            .finish()
    }
}

struct Shared {
    trie: TopicTrie<Arc<Entry>>,
    executor: TaskExecutor,
}

/// Publish/subscribe dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Create a dispatcher running handlers on the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics if called outside the context of a tokio runtime.
    pub fn new(cache_max: usize) -> Self {
        Self::with_executor(cache_max, TaskExecutor::current())
    }

    pub fn with_executor(cache_max: usize, executor: TaskExecutor) -> Self {
        Self {
            shared: Arc::new(Shared {
                trie: TopicTrie::with_cache_max(cache_max),
                executor,
            }),
        }
    }

    /// Fan-out subscription: the handler receives every matching publish
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn SubscribeHandler>,
    ) -> Result<Subscription, MessagingError> {
        self.add(pattern, None, handler)
    }

    /// Queue subscription: each matching publish reaches exactly one member
    /// of the queue group
    ///
    /// An empty queue name is treated as a fan-out subscription.
    pub fn queue_subscribe(
        &self,
        pattern: &str,
        queue: &str,
        handler: Arc<dyn SubscribeHandler>,
    ) -> Result<Subscription, MessagingError> {
        let queue = (!queue.is_empty()).then(|| queue.to_owned());
        self.add(pattern, queue, handler)
    }

    fn add(
        &self,
        pattern: &str,
        queue: Option<String>,
        handler: Arc<dyn SubscribeHandler>,
    ) -> Result<Subscription, MessagingError> {
        validate_pattern(pattern).map_err(MessagingError::InvalidPattern)?;

        let entry = Arc::new(Entry {
            sid: uuid::Uuid::new_v4().simple().to_string(),
            pattern: pattern.to_owned(),
            queue,
            handler,
        });

        self.shared
            .trie
            .insert(pattern, entry.clone())
            .map_err(MessagingError::InvalidPattern)?;

        debug!(
            sid = %entry.sid,
            pattern = %entry.pattern,
            queue = ?entry.queue,
            "Subscribed"
        );

        Ok(Subscription {
            entry,
            dispatcher: Arc::downgrade(&self.shared),
            active: AtomicBool::new(true),
        })
    }

    /// Publish a message to a literal topic
    ///
    /// Returns once every selected handler has been submitted to the
    /// executor. Zero matches is not an error.
    pub fn publish(&self, topic: &str, message: Message) -> Result<(), MessagingError> {
        validate_topic(topic).map_err(MessagingError::InvalidTopic)?;

        // The trie lock is released before any handler is scheduled
        let matched = self.shared.trie.matches(topic);
        if matched.is_empty() {
            trace!(topic, "No subscribers");
            return Ok(());
        }

        let topic: Arc<str> = Arc::from(topic);
        let message = Arc::new(message);
        let mut groups: AHashMap<&str, SmallVec<[&Arc<Entry>; 4]>> = AHashMap::new();

        for entry in &matched {
            match entry.queue.as_deref() {
                Some(queue) => groups.entry(queue).or_default().push(entry),
                None => self.deliver(entry, &topic, &message),
            }
        }

        let mut rng = rand::thread_rng();
        for members in groups.values() {
            let chosen = members[rng.gen_range(0..members.len())];
            self.deliver(chosen, &topic, &message);
        }

        Ok(())
    }

    fn deliver(&self, entry: &Arc<Entry>, topic: &Arc<str>, message: &Arc<Message>) {
        let entry = entry.clone();
        let topic = topic.clone();
        let message = message.clone();

        self.shared.executor.submit(async move {
            if let Err(e) = entry.handler.handle(&topic, message).await {
                debug!(sid = %entry.sid, topic = %topic, "Handler error: {}", e);
            }
        });
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.shared.trie.count()
    }

    pub fn stats(&self) -> TrieStats {
        self.shared.trie.stats()
    }

    pub fn reset_stats(&self) {
        self.shared.trie.reset_stats();
    }

    /// Executor running handler invocations
    pub fn executor(&self) -> &TaskExecutor {
        &self.shared.executor
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscriptions", &self.subscription_count())
            .field("in_flight", &self.shared.executor.in_flight())
            .finish()
    }
}

/// Handle to a subscription
///
/// Dropping the handle does not unsubscribe; the subscription lives until
/// [`Subscription::unsubscribe`] is called.
pub struct Subscription {
    entry: Arc<Entry>,
    dispatcher: Weak<Shared>,
    active: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.entry.sid
    }

    pub fn pattern(&self) -> &str {
        &self.entry.pattern
    }

    /// Queue group name, if any
    pub fn queue(&self) -> Option<&str> {
        self.entry.queue.as_deref()
    }

    /// Remove the subscription. Returns false if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let Some(shared) = self.dispatcher.upgrade() else {
            return false;
        };

        let removed = shared.trie.remove(&self.entry.pattern, &self.entry);
        if removed {
            debug!(sid = %self.entry.sid, pattern = %self.entry.pattern, "Unsubscribed");
        }
        removed
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("entry", &self.entry)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}
