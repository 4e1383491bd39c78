//! Relay
//!
//! Bridges connections onto the dispatcher. A client peer's auth attempt is
//! announced on `$.auth`; once its service accepts it, the peer is announced
//! on `$.join`, subscribed to its inbound topic,
//! and every frame it sends is published to its outbound topic. A service
//! worker joins its service's queue group on `$.service.<name>.sub` and
//! publishes what it sends to `$.service.<name>.pub`.

mod endpoint;
mod registry;
mod service;


pub use endpoint::{Endpoint, Peer, Worker, WorkerInfo};
pub use registry::Registry;
pub use service::{IndexEntry, PeerInfo, Service, ServiceIdentity, ServiceInfo, StaticService};

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::messaging::{Dispatcher, Message, MessagingError};
use crate::session::{Connection, SessionError};
use crate::topic::{TOPIC_AUTH, TOPIC_JOIN};
use endpoint::Forward;

/// Relay error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// No service registered under this name
    ServiceNotFound(String),
    /// Service rejected the peer's token
    AuthFailed(String),
    /// The endpoint's inbound stream is already being consumed
    AlreadyReceiving,
    /// Control payload could not be encoded
    Encode(String),
    Session(SessionError),
    Messaging(MessagingError),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::ServiceNotFound(name) => write!(f, "Service not found: {}", name),
            RelayError::AuthFailed(name) => write!(f, "Authentication failed for service {}", name),
            RelayError::AlreadyReceiving => write!(f, "Endpoint is already receiving"),
            RelayError::Encode(e) => write!(f, "Encode error: {}", e),
            RelayError::Session(e) => write!(f, "Session error: {}", e),
            RelayError::Messaging(e) => write!(f, "Messaging error: {}", e),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Session(e) => Some(e),
            RelayError::Messaging(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SessionError> for RelayError {
    fn from(e: SessionError) -> Self {
        RelayError::Session(e)
    }
}

impl From<MessagingError> for RelayError {
    fn from(e: MessagingError) -> Self {
        RelayError::Messaging(e)
    }
}

/// Payload published to `$.auth` before a peer's token is checked
#[derive(Debug, Serialize)]
struct AuthEvent<'a> {
    ip: &'a str,
    token: &'a str,
}

/// Payload published to `$.join` when a peer attaches
#[derive(Debug, Serialize)]
struct JoinEvent<'a> {
    ip: &'a str,
    client_id: &'a str,
    identity: &'a str,
}

/// Peer/worker bridge over a shared dispatcher
pub struct Relay {
    dispatcher: Dispatcher,
    services: Registry<String, Arc<dyn Service>>,
    peers: Registry<String, Arc<Peer>>,
    workers: Registry<String, Arc<Worker>>,
}

impl Relay {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            services: Registry::new(),
            peers: Registry::new(),
            workers: Registry::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn services(&self) -> &Registry<String, Arc<dyn Service>> {
        &self.services
    }

    pub fn peers(&self) -> &Registry<String, Arc<Peer>> {
        &self.peers
    }

    pub fn workers(&self) -> &Registry<String, Arc<Worker>> {
        &self.workers
    }

    /// Register a service, replacing any service of the same name
    pub fn add_service(&self, service: Arc<dyn Service>) {
        let name = service.info().name.clone();
        info!(service = %name, "Service registered");
        self.services.add(name, service);
    }

    pub fn service(&self, name: &str) -> Result<Arc<dyn Service>, RelayError> {
        self.services
            .get(&name.to_string())
            .ok_or_else(|| RelayError::ServiceNotFound(name.to_string()))
    }

    /// Authenticate and register a client peer
    ///
    /// The attempt is announced on `$.auth` before the token is checked.
    /// On success the peer is announced on `$.join` and subscribed to its
    /// inbound topic. Frames it sends are not read until [`Relay::run_peer`].
    pub async fn attach_peer(
        &self,
        mut info: PeerInfo,
        conn: Arc<dyn Connection>,
    ) -> Result<Arc<Peer>, RelayError> {
        let service = self.service(&info.service)?;
        let auth = encode(&AuthEvent {
            ip: &info.ip,
            token: &info.service_token,
        })?;
        self.announce(TOPIC_AUTH, &info.service, auth);
        info.identity = service.auth(&info.service_token).await?;

        let (_, sub_topic) = service.peer_topics(&info);
        let join = encode(&JoinEvent {
            ip: &info.ip,
            client_id: &info.client_id,
            identity: &info.identity.identity,
        })?;

        let peer = Arc::new(Peer::new(info, conn));
        self.peers.add(peer.id().to_string(), peer.clone());

        let meta = peer.meta();
        self.announce(TOPIC_JOIN, &meta.service, join);

        let subscription = match self.dispatcher.subscribe(
            &sub_topic,
            Arc::new(Forward {
                endpoint: peer.clone(),
            }),
        ) {
            Ok(subscription) => subscription,
            Err(e) => {
                self.peers.remove(&peer.id().to_string());
                return Err(e.into());
            }
        };
        peer.set_subscription(subscription);

        info!(
            peer = %peer.id(),
            client_id = %meta.client_id,
            service = %meta.service,
            ip = %meta.ip,
            "Peer attached"
        );
        Ok(peer)
    }

    /// Forward the peer's inbound frames until its connection fails
    pub async fn run_peer(&self, peer: &Arc<Peer>) -> Result<(), RelayError> {
        let service = self.service(&peer.meta().service)?;
        let (pub_topic, _) = service.peer_topics(peer.meta());
        peer.start_receiving()?;
        self.forward_inbound(peer, &peer.meta().service, &pub_topic)
            .await
    }

    /// Unsubscribe, deregister and close a peer
    pub async fn detach_peer(&self, peer: &Arc<Peer>) {
        peer.unsubscribe();
        self.peers.remove(&peer.id().to_string());
        peer.close().await;
        info!(peer = %peer.id(), "Peer detached");
    }

    /// Attach, run and detach a peer
    pub async fn serve_peer(
        &self,
        info: PeerInfo,
        conn: Arc<dyn Connection>,
    ) -> Result<(), RelayError> {
        let peer = match self.attach_peer(info, conn.clone()).await {
            Ok(peer) => peer,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        let result = self.run_peer(&peer).await;
        self.detach_peer(&peer).await;
        result
    }

    /// Register a worker and join it to its service's queue group
    pub async fn attach_worker(
        &self,
        service: &str,
        conn: Arc<dyn Connection>,
    ) -> Result<Arc<Worker>, RelayError> {
        let service = self.service(service)?;
        let info = service.info();
        let (_, sub_topic) = info.topics();

        let worker = Arc::new(Worker::new(
            WorkerInfo {
                service: info.name.clone(),
                queue: info.queue.clone(),
            },
            conn,
        ));

        let subscription = self.dispatcher.queue_subscribe(
            &sub_topic,
            &info.queue,
            Arc::new(Forward {
                endpoint: worker.clone(),
            }),
        )?;
        worker.set_subscription(subscription);
        self.workers.add(worker.id().to_string(), worker.clone());

        info!(
            worker = %worker.id(),
            service = %info.name,
            queue = %info.queue,
            "Worker attached"
        );
        Ok(worker)
    }

    /// Forward the worker's inbound frames until its connection fails
    pub async fn run_worker(&self, worker: &Arc<Worker>) -> Result<(), RelayError> {
        let meta = worker.meta();
        let (pub_topic, _) = ServiceInfo::new(&meta.service, &meta.queue).topics();
        worker.start_receiving()?;
        self.forward_inbound(worker, &meta.service, &pub_topic)
            .await
    }

    pub async fn detach_worker(&self, worker: &Arc<Worker>) {
        worker.unsubscribe();
        self.workers.remove(&worker.id().to_string());
        worker.close().await;
        info!(worker = %worker.id(), "Worker detached");
    }

    /// Attach, run and detach a worker
    pub async fn serve_worker(
        &self,
        service: &str,
        conn: Arc<dyn Connection>,
    ) -> Result<(), RelayError> {
        let worker = match self.attach_worker(service, conn.clone()).await {
            Ok(worker) => worker,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        let result = self.run_worker(&worker).await;
        self.detach_worker(&worker).await;
        result
    }

    /// Publish a control event; failures are logged, not returned
    fn announce(&self, topic: &str, service: &str, payload: Vec<u8>) {
        let published = self
            .dispatcher
            .publish(topic, Message::new(service, topic, payload));
        if let Err(e) = published {
            warn!(topic, service, "Failed to publish control event: {}", e);
        }
    }

    /// Publish every inbound frame of `endpoint` to `topic`
    ///
    /// Ends normally when the first read fails.
    async fn forward_inbound<M>(
        &self,
        endpoint: &Endpoint<M>,
        service: &str,
        topic: &str,
    ) -> Result<(), RelayError> {
        loop {
            let payload = match endpoint.connection().read_frame().await {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(endpoint = %endpoint.id(), "Inbound stream ended: {}", e);
                    return Ok(());
                }
            };
            self.dispatcher
                .publish(topic, Message::new(service, topic, payload))?;
        }
    }
}

fn encode<T: Serialize>(event: &T) -> Result<Vec<u8>, RelayError> {
    serde_json::to_vec(event).map_err(|e| RelayError::Encode(e.to_string()))
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("services", &self.services.count())
            .field("peers", &self.peers.count())
            .field("workers", &self.workers.count())
            .finish()
    }
}
