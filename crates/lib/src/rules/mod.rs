//! Rules: (predicate, action) pairs and the ordered table the dispatcher walks.
//!
//! A rule's predicate is synchronous and must not have side effects; its action is async
//! and may call the chat API through `RuleContext::api` (e.g. look a user up) before returning
//! the replies to send. Tables are assembled once at startup and are read-only after being
//! handed to a dispatcher.

mod build;
mod builtin;

pub use builtin::{ContainsRule, DiceRule, EmailRule, FnRule, RegexRule};

use crate::error::RuleError;
use crate::message::{Message, Reply};
use crate::slack::ApiError;
use crate::workspace::Workspace;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Chat API calls available to rule actions.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Call a Web API method; returns the response body when it succeeded.
    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Value, ApiError>;

    /// Download a workspace-private file (a snippet's `url_private`) as text.
    async fn fetch_private(&self, url: &str) -> Result<String, ApiError>;
}

/// API handle for runs without a connection (`quip try`, tests). Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineApi;

#[async_trait]
impl ChatApi for OfflineApi {
    async fn call(&self, _method: &str, _params: &[(&str, String)]) -> Result<Value, ApiError> {
        Err(ApiError::Offline)
    }

    async fn fetch_private(&self, _url: &str) -> Result<String, ApiError> {
        Err(ApiError::Offline)
    }
}

/// Environment available to a rule while it handles one message or loads.
#[derive(Clone)]
pub struct RuleContext {
    pub workspace: Arc<Workspace>,
    pub api: Arc<dyn ChatApi>,
}

impl RuleContext {
    pub fn new(workspace: Arc<Workspace>, api: Arc<dyn ChatApi>) -> Self {
        Self { workspace, api }
    }

    /// Context whose API calls all fail with `ApiError::Offline`.
    pub fn offline(workspace: Arc<Workspace>) -> Self {
        Self::new(workspace, Arc::new(OfflineApi))
    }
}

impl std::fmt::Debug for RuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleContext")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

/// One automated reaction.
#[async_trait]
pub trait Rule: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Whether this rule wants to respond to `message`.
    fn matches(&self, message: &Message, ctx: &RuleContext) -> Result<bool, RuleError>;

    /// Replies to send for a matched message (possibly none).
    async fn respond(&self, message: &Message, ctx: &RuleContext) -> Result<Vec<Reply>, RuleError>;

    /// Runs on every (re)connect, after the workspace directories are refreshed.
    async fn load(&self, _ctx: &RuleContext) -> Result<(), RuleError> {
        Ok(())
    }
}

/// Which channels a rule listens in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelScope {
    #[default]
    Any,
    /// Direct messages only.
    DirectOnly,
    /// Channels whose name (or raw id) is listed. Unknown channels are not admitted.
    Named(Vec<String>),
}

impl ChannelScope {
    pub fn admits(&self, channel: &str, workspace: &Workspace) -> bool {
        match self {
            ChannelScope::Any => true,
            ChannelScope::DirectOnly => channel.starts_with('D'),
            ChannelScope::Named(names) => names
                .iter()
                .any(|n| n == channel || workspace.channels.id(n) == Some(channel)),
        }
    }
}

/// A rule together with the channels it applies to.
pub struct RuleEntry {
    pub scope: ChannelScope,
    pub rule: Box<dyn Rule>,
}

/// Ordered rule table. Order decides evaluation order and, under first-match, which rule wins.
#[derive(Default)]
pub struct RuleTable {
    entries: Vec<RuleEntry>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule that applies in every channel.
    pub fn with(self, rule: impl Rule + 'static) -> Self {
        self.with_scoped(ChannelScope::Any, rule)
    }

    /// Append a rule restricted to `scope`.
    pub fn with_scoped(mut self, scope: ChannelScope, rule: impl Rule + 'static) -> Self {
        self.entries.push(RuleEntry {
            scope,
            rule: Box::new(rule),
        });
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rule names in table order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.rule.name()).collect()
    }
}

impl std::fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleTable")
            .field("rules", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace {
            bot_user_id: None,
            users: Default::default(),
            channels: [("C1", "random"), ("C2", "general")].into_iter().collect(),
        }
    }

    #[test]
    fn named_scope_matches_name_or_id() {
        let ws = workspace();
        let scope = ChannelScope::Named(vec!["random".into(), "C9".into()]);
        assert!(scope.admits("C1", &ws));
        assert!(!scope.admits("C2", &ws));
        assert!(scope.admits("C9", &ws));
        assert!(!scope.admits("C404", &ws));
    }

    #[test]
    fn direct_scope_only_admits_dms() {
        let ws = workspace();
        assert!(ChannelScope::DirectOnly.admits("D1", &ws));
        assert!(!ChannelScope::DirectOnly.admits("C1", &ws));
        assert!(ChannelScope::Any.admits("C404", &ws));
    }

    #[test]
    fn table_keeps_insertion_order() {
        let table = RuleTable::new()
            .with(FnRule::new("b", |_| true, |_| Vec::new()))
            .with(FnRule::new("a", |_| true, |_| Vec::new()))
            .with_scoped(
                ChannelScope::DirectOnly,
                FnRule::new("c", |_| true, |_| Vec::new()),
            );
        assert_eq!(table.names(), vec!["b", "a", "c"]);
        assert_eq!(table.len(), 3);
        assert!(RuleTable::new().is_empty());
    }
}
