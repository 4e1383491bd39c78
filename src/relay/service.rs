//! Service model: who a peer is, which service it talks to, and how the
//! service derives the peer's topics.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::RelayError;
use crate::config::ServiceConfig;
use crate::topic::{service_pub_topic, service_sub_topic};

/// Searchable attributes of a service identity
pub type IndexEntry = HashMap<String, String>;

/// Identity a service grants to an authenticated peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Unique user id within the service
    pub identity: String,
    /// Searchable attributes
    #[serde(default)]
    pub indexed_info: IndexEntry,
    /// Opaque extra attributes
    #[serde(default)]
    pub extra_info: serde_json::Value,
}

/// Metadata of a connected client peer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Payload protocol tag (only `json` is served today)
    pub protocol: String,
    pub client_id: String,
    /// Originating address
    pub ip: String,
    /// Target service name
    pub service: String,
    #[serde(skip_serializing, default)]
    pub service_token: String,
    /// Filled in after authentication
    #[serde(rename = "client_identity", default)]
    pub identity: ServiceIdentity,
}

/// Static description of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    /// Queue group name for the service's workers
    pub queue: String,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
        }
    }

    /// `(publish topic, subscribe topic)` of the service's workers
    pub fn topics(&self) -> (String, String) {
        (service_pub_topic(&self.name), service_sub_topic(&self.name))
    }
}

/// A backend service peers connect to
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn info(&self) -> &ServiceInfo;

    /// Resolve a peer's service token to an identity
    async fn auth(&self, token: &str) -> Result<ServiceIdentity, RelayError>;

    /// `(publish topic, subscribe topic)` for a peer of this service
    fn peer_topics(&self, peer: &PeerInfo) -> (String, String);
}

/// Service backed by a fixed token table
///
/// Peers publish into the workers' inbound topic and receive whatever the
/// workers publish.
#[derive(Debug, Clone)]
pub struct StaticService {
    info: ServiceInfo,
    /// token -> identity
    tokens: HashMap<String, String>,
}

impl StaticService {
    pub fn new(info: ServiceInfo) -> Self {
        Self {
            info,
            tokens: HashMap::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), identity.into());
        self
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        let info = ServiceInfo::new(&config.name, &config.queue);
        config
            .tokens
            .iter()
            .fold(Self::new(info), |service, t| {
                service.with_token(&t.token, &t.identity)
            })
    }
}

#[async_trait]
impl Service for StaticService {
    fn info(&self) -> &ServiceInfo {
        &self.info
    }

    async fn auth(&self, token: &str) -> Result<ServiceIdentity, RelayError> {
        // No tokens configured: open service, anonymous identity
        if self.tokens.is_empty() {
            return Ok(ServiceIdentity::default());
        }
        match self.tokens.get(token) {
            Some(identity) => Ok(ServiceIdentity {
                identity: identity.clone(),
                ..Default::default()
            }),
            None => Err(RelayError::AuthFailed(self.info.name.clone())),
        }
    }

    fn peer_topics(&self, _peer: &PeerInfo) -> (String, String) {
        let (worker_pub, worker_sub) = self.info.topics();
        (worker_sub, worker_pub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;

    #[test]
    fn test_service_topics() {
        let info = ServiceInfo::new("chat", "default");
        assert_eq!(
            info.topics(),
            ("$.service.chat.pub".to_string(), "$.service.chat.sub".to_string())
        );

        let service = StaticService::new(info);
        let (peer_pub, peer_sub) = service.peer_topics(&PeerInfo::default());
        assert_eq!(peer_pub, "$.service.chat.sub");
        assert_eq!(peer_sub, "$.service.chat.pub");
    }

    #[tokio::test]
    async fn test_open_service_auth() {
        let service = StaticService::new(ServiceInfo::new("chat", "default"));
        let identity = service.auth("anything").await.unwrap();
        assert_eq!(identity, ServiceIdentity::default());
    }

    #[tokio::test]
    async fn test_token_auth() {
        let service = StaticService::from_config(&ServiceConfig {
            name: "chat".into(),
            queue: "workers".into(),
            tokens: vec![TokenConfig {
                token: "t1".into(),
                identity: "alice".into(),
            }],
        });
        assert_eq!(service.info().queue, "workers");
        assert_eq!(service.auth("t1").await.unwrap().identity, "alice");
        assert!(matches!(
            service.auth("t2").await,
            Err(RelayError::AuthFailed(name)) if name == "chat"
        ));
        assert!(service.auth("").await.is_err());
    }

    #[test]
    fn test_peer_info_json_hides_token() {
        let info = PeerInfo {
            protocol: "json".into(),
            client_id: "c1".into(),
            ip: "10.0.0.1".into(),
            service: "chat".into(),
            service_token: "secret".into(),
            identity: ServiceIdentity {
                identity: "alice".into(),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("service_token").is_none());
        assert_eq!(json["client_identity"]["identity"], "alice");
        assert_eq!(json["ip"], "10.0.0.1");
    }
}
