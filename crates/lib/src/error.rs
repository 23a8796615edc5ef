//! Error types shared by rules, the dispatcher, and rule-table construction.

use std::time::Duration;

/// A rule's predicate or action failed while handling one message.
/// Always recovered by the dispatcher: logged, optionally reported, and skipped.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("predicate failed: {0}")]
    Predicate(String),
    #[error("action failed: {0}")]
    Action(String),
    #[error("panicked: {0}")]
    Panicked(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl RuleError {
    pub fn predicate(msg: impl Into<String>) -> Self {
        RuleError::Predicate(msg.into())
    }

    pub fn action(msg: impl Into<String>) -> Self {
        RuleError::Action(msg.into())
    }

    /// Build a `Panicked` error from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        RuleError::Panicked(msg)
    }
}

/// The send capability could not deliver a reply. Not retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The chat API answered but refused the call (e.g. `channel_not_found`, `ratelimited`).
    #[error("api refused reply: {0}")]
    Api(String),
    /// Network, HTTP status, or decoding failure.
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
}

/// Malformed rule configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("rule #{index} has an empty name")]
    EmptyName { index: usize },
    #[error("rule name `{0}` is used more than once")]
    DuplicateName(String),
    #[error("rule `{rule}`: invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule `{0}`: queries must contain at least one non-empty string")]
    EmptyQueries(String),
    #[error("rule `{0}`: needs a reply, a reaction, or both")]
    MissingResponse(String),
    #[error("rule `{0}`: `channels` and `directOnly` cannot both be set")]
    ConflictingScope(String),
}
