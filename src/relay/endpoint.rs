//! Relay endpoints: a connection plus the metadata of whoever is on the
//! other end of it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::service::PeerInfo;
use super::RelayError;
use crate::messaging::{HandlerError, HandlerResult, Message, SubscribeHandler, Subscription};
use crate::session::{Connection, SessionError};

/// Metadata of a connected service worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub service: String,
    pub queue: String,
}

/// A client peer
pub type Peer = Endpoint<PeerInfo>;
/// A service worker
pub type Worker = Endpoint<WorkerInfo>;

/// A relayed connection with its metadata
pub struct Endpoint<M> {
    id: String,
    meta: M,
    conn: Arc<dyn Connection>,
    /// Set once the inbound loop has started
    receiving: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
}

impl<M> Endpoint<M> {
    pub(super) fn new(meta: M, conn: Arc<dyn Connection>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            meta,
            conn,
            receiving: AtomicBool::new(false),
            subscription: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn meta(&self) -> &M {
        &self.meta
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Deliver a message's payload to the far end
    pub async fn send(&self, message: &Message) -> Result<usize, SessionError> {
        if self.conn.is_closed() {
            return Err(SessionError::Closed);
        }
        self.conn.write(message.payload().clone()).await
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Claim the inbound stream. Only the first call succeeds.
    pub(super) fn start_receiving(&self) -> Result<(), RelayError> {
        if self.receiving.swap(true, Ordering::AcqRel) {
            return Err(RelayError::AlreadyReceiving);
        }
        Ok(())
    }

    pub(super) fn set_subscription(&self, subscription: Subscription) {
        if let Some(previous) = self.subscription.lock().replace(subscription) {
            previous.unsubscribe();
        }
    }

    /// Drop the endpoint's subscription, if any
    pub fn unsubscribe(&self) -> bool {
        match self.subscription.lock().take() {
            Some(subscription) => subscription.unsubscribe(),
            None => false,
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Endpoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .field("closed", &self.conn.is_closed())
            .finish()
    }
}

/// Subscription handler writing delivered messages to an endpoint
pub(super) struct Forward<M> {
    pub(super) endpoint: Arc<Endpoint<M>>,
}

#[async_trait]
impl<M> SubscribeHandler for Forward<M>
where
    M: Send + Sync + 'static,
{
    async fn handle(&self, _topic: &str, message: Arc<Message>) -> HandlerResult {
        match self.endpoint.send(&message).await {
            Ok(_) => Ok(()),
            Err(SessionError::Closed) => Err(HandlerError::Closed),
            Err(e) => Err(HandlerError::Failed(e.to_string())),
        }
    }
}
