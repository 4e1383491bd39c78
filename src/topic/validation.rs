//! Topic and pattern validation
//!
//! Key rules:
//! - Tokens are separated by `.` and no token may be empty
//! - Publish topics MUST NOT contain wildcards (`*` or `>`)
//! - `*` (partial wildcard) must occupy an entire token
//! - `>` (full wildcard) must occupy an entire token and be the last token

use std::fmt;

/// Token separator
pub const SEPARATOR: char = '.';
/// Partial wildcard, matches exactly one token
pub const PARTIAL_WILDCARD: &str = "*";
/// Full wildcard, matches one or more trailing tokens
pub const FULL_WILDCARD: &str = ">";

/// Represents a token in a pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    /// Literal token
    Literal(&'a str),
    /// Partial wildcard (`*`)
    Partial,
    /// Full wildcard (`>`)
    Full,
}

impl<'a> Token<'a> {
    pub fn parse(token: &'a str) -> Self {
        match token {
            PARTIAL_WILDCARD => Token::Partial,
            FULL_WILDCARD => Token::Full,
            s => Token::Literal(s),
        }
    }
}

/// Topic validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Topic or pattern is the empty string
    Empty,
    /// A token between two separators (or at either end) is empty
    EmptyToken,
    /// A publish topic contains `*` or `>`
    WildcardInTopic,
    /// `>` appears somewhere other than the last token
    FullWildcardNotLast,
    /// A wildcard character shares a token with other characters
    PartialTokenWildcard,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::Empty => write!(f, "topic cannot be empty"),
            TopicError::EmptyToken => write!(f, "topic cannot contain empty tokens"),
            TopicError::WildcardInTopic => write!(f, "publish topic cannot contain wildcards"),
            TopicError::FullWildcardNotLast => {
                write!(f, "full wildcard '>' must be the last token")
            }
            TopicError::PartialTokenWildcard => {
                write!(f, "wildcard must occupy an entire token")
            }
        }
    }
}

impl std::error::Error for TopicError {}

/// Split a topic or pattern into tokens
pub fn tokenize(topic: &str) -> impl Iterator<Item = &str> {
    topic.split(SEPARATOR)
}

/// Validate a publish topic
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    for token in tokenize(topic) {
        if token.is_empty() {
            return Err(TopicError::EmptyToken);
        }
        if token.contains('*') || token.contains('>') {
            return Err(TopicError::WildcardInTopic);
        }
    }

    Ok(())
}

/// Validate a subscription pattern
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::Empty);
    }

    let mut tokens = tokenize(pattern).peekable();
    while let Some(token) = tokens.next() {
        if token.is_empty() {
            return Err(TopicError::EmptyToken);
        }
        match Token::parse(token) {
            Token::Full if tokens.peek().is_some() => {
                return Err(TopicError::FullWildcardNotLast);
            }
            Token::Literal(s) if s.contains('*') || s.contains('>') => {
                return Err(TopicError::PartialTokenWildcard);
            }
            _ => {}
        }
    }

    Ok(())
}

/// Check if a pattern matches a literal topic
///
/// Both arguments are assumed to be valid. `*` consumes exactly one topic
/// token, `>` consumes one or more.
pub fn pattern_matches(topic: &str, pattern: &str) -> bool {
    let mut topic_tokens = tokenize(topic);

    for token in tokenize(pattern) {
        match Token::parse(token) {
            Token::Full => return topic_tokens.next().is_some(),
            Token::Partial => {
                if topic_tokens.next().is_none() {
                    return false;
                }
            }
            Token::Literal(literal) => match topic_tokens.next() {
                Some(t) if t == literal => {}
                _ => return false,
            },
        }
    }

    topic_tokens.next().is_none()
}
