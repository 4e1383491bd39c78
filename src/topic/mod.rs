//! Topic matching and subscription indexing
//!
//! Topics are `.`-separated token strings. Subscription patterns may use
//! `*` to match exactly one token and `>` (last position only) to match
//! one or more trailing tokens.
//!
//! The [`TopicTrie`] stores patterns and resolves literal topics to the
//! matching subscription set, memoizing results in a bounded cache.

mod trie;
pub mod validation;

pub use trie::{TopicTrie, TrieStats, DEFAULT_CACHE_MAX};
pub use validation::{
    pattern_matches, tokenize, validate_pattern, validate_topic, Token, TopicError,
};

/// Reserved control topic announcing peer authentication attempts
pub const TOPIC_AUTH: &str = "$.auth";
/// Reserved control topic announcing joined peers
pub const TOPIC_JOIN: &str = "$.join";

/// Outbound topic of a service's workers
pub fn service_pub_topic(service: &str) -> String {
    format!("$.service.{}.pub", service)
}

/// Inbound topic of a service's workers
pub fn service_sub_topic(service: &str) -> String {
    format!("$.service.{}.sub", service)
}
