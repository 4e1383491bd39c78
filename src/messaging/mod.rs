//! Publish/Subscribe Messaging
//!
//! The [`Dispatcher`] routes each published [`Message`] to every fan-out
//! subscription whose pattern matches the topic, and to exactly one randomly
//! chosen member of every matching queue group. Handlers run as independent
//! tasks on a [`TaskExecutor`]; a publish never waits for them.

mod dispatcher;
mod executor;


pub use dispatcher::{Dispatcher, Subscription};
pub use executor::TaskExecutor;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::topic::TopicError;

/// Messaging error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Publish topic failed validation
    InvalidTopic(TopicError),
    /// Subscription pattern failed validation
    InvalidPattern(TopicError),
}

impl fmt::Display for MessagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessagingError::InvalidTopic(e) => write!(f, "Invalid topic: {}", e),
            MessagingError::InvalidPattern(e) => write!(f, "Invalid pattern: {}", e),
        }
    }
}

impl std::error::Error for MessagingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MessagingError::InvalidTopic(e) | MessagingError::InvalidPattern(e) => Some(e),
        }
    }
}

/// Error returned by a subscriber handler
///
/// Handler errors are logged by the dispatcher and never reach the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler's destination is gone
    Closed,
    /// Handler-specific failure
    Failed(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Closed => write!(f, "Handler destination closed"),
            HandlerError::Failed(msg) => write!(f, "Handler failed: {}", msg),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Handler result type
pub type HandlerResult = Result<(), HandlerError>;

/// An immutable message routed through the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: String,
    service: String,
    topic: String,
    payload: Bytes,
    /// Unix timestamp in milliseconds
    time: u64,
}

impl Message {
    /// Create a message with a fresh random id, stamped with the current time
    pub fn new(
        service: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            service: service.into(),
            topic: topic.into(),
            payload: payload.into(),
            time,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tag of the service the message originated from
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Unix timestamp in milliseconds
    pub fn time(&self) -> u64 {
        self.time
    }
}

/// Subscriber callback
///
/// The message is shared between every handler a publish reaches, so
/// handlers only ever see it by reference.
#[async_trait]
pub trait SubscribeHandler: Send + Sync + 'static {
    async fn handle(&self, topic: &str, message: Arc<Message>) -> HandlerResult;
}

/// Adapter turning an async closure into a [`SubscribeHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> SubscribeHandler for FnHandler<F>
where
    F: Fn(String, Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, topic: &str, message: Arc<Message>) -> HandlerResult {
        (self.0)(topic.to_owned(), message).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn SubscribeHandler>
where
    F: Fn(String, Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
