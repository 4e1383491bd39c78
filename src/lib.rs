//! Comet - Real-time WebSocket message gateway
//!
//! Client peers and backend service workers connect over WebSocket and
//! exchange topic-addressed messages through an in-process publish/subscribe
//! core with `*`/`>` wildcard matching and queue-group load balancing.

pub mod config;
pub mod gateway;
pub mod messaging;
pub mod relay;
pub mod session;
pub mod topic;

pub use config::Config;
pub use gateway::{Gateway, GatewayConfig};
pub use messaging::{handler_fn, Dispatcher, Message, SubscribeHandler, Subscription};
pub use relay::{Relay, Service, StaticService};
pub use session::{Connection, SessionOptions, WsSession};
pub use topic::{TopicTrie, TrieStats};
