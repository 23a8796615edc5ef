//! Dispatcher: evaluate the rule table against one inbound message and forward the replies.
//!
//! Every entry is visited in table order. A rule that errors, panics, or times out is logged
//! (and reported to the operator when `report_to` is set) and the walk continues; a failed or
//! timed-out send is handled the same way and is never retried. Under `MatchPolicy::All` every matching rule
//! fires; under `MatchPolicy::First` the walk stops after the first rule whose predicate matched.

use crate::error::{RuleError, SendError};
use crate::message::{Message, Reply};
use crate::rules::{ChatApi, OfflineApi, RuleContext, RuleEntry, RuleTable};
use crate::workspace::{SharedWorkspace, Workspace};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_RULE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound send capability (chat API client, or an in-memory sink for dry runs).
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, reply: &Reply) -> Result<(), SendError>;
}

/// Whether all matching rules fire, or only the first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    #[default]
    All,
    First,
}

/// What happened while handling one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Message came from the bot itself; no rule was evaluated.
    pub ignored: bool,
    /// Table entries visited.
    pub evaluated: usize,
    /// Names of rules whose predicate matched, in table order.
    pub matched: Vec<String>,
    /// Replies delivered by the sink.
    pub sent: usize,
    /// Rule errors, timeouts, panics, and failed or timed-out sends.
    pub failures: usize,
}

pub struct Dispatcher {
    table: Arc<RuleTable>,
    sink: Arc<dyn ReplySink>,
    api: Arc<dyn ChatApi>,
    workspace: SharedWorkspace,
    policy: MatchPolicy,
    rule_timeout: Duration,
    send_timeout: Duration,
    report_to: Option<String>,
}

impl Dispatcher {
    pub fn new(table: RuleTable, sink: Arc<dyn ReplySink>, workspace: SharedWorkspace) -> Self {
        Self {
            table: Arc::new(table),
            sink,
            api: Arc::new(OfflineApi),
            workspace,
            policy: MatchPolicy::default(),
            rule_timeout: DEFAULT_RULE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            report_to: None,
        }
    }

    /// API handle rules see as `RuleContext::api`. Defaults to `OfflineApi`.
    pub fn with_api(mut self, api: Arc<dyn ChatApi>) -> Self {
        self.api = api;
        self
    }

    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_rule_timeout(mut self, timeout: Duration) -> Self {
        self.rule_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Also post failure reports to this user or channel id.
    pub fn with_report_to(mut self, report_to: Option<String>) -> Self {
        self.report_to = report_to.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn table(&self) -> &RuleTable {
        &self.table
    }

    /// Handle one inbound message. Never fails; problems are logged and counted in the report.
    pub async fn handle(&self, message: &Message) -> DispatchReport {
        let workspace = self.workspace.snapshot().await;
        let mut report = DispatchReport::default();

        if workspace.bot_user_id.as_deref() == Some(message.sender.as_str()) {
            report.ignored = true;
            return report;
        }
        if message.is_direct() {
            log::info!(
                "dispatch: direct message {} at {}: {}",
                workspace.describe(&message.channel, &message.sender),
                sent_at(message),
                message.text
            );
        }

        let ctx = RuleContext::new(workspace.clone(), self.api.clone());
        for entry in self.table.iter() {
            report.evaluated += 1;
            if !entry.scope.admits(&message.channel, &workspace) {
                continue;
            }
            let name = entry.rule.name();
            match evaluate(entry, message, &ctx) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    report.failures += 1;
                    self.rule_failed(name, &e, message, &workspace).await;
                    continue;
                }
            }
            report.matched.push(name.to_string());

            match self.run_action(entry, message, &ctx).await {
                Ok(replies) => {
                    if !replies.is_empty() {
                        log::info!(
                            "dispatch: rule `{}` responding with {} reply(s)",
                            name,
                            replies.len()
                        );
                    }
                    for reply in &replies {
                        match self.deliver(reply).await {
                            Ok(()) => report.sent += 1,
                            Err(e) => {
                                report.failures += 1;
                                self.send_failed(name, reply, &e).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    report.failures += 1;
                    self.rule_failed(name, &e, message, &workspace).await;
                }
            }

            if self.policy == MatchPolicy::First {
                break;
            }
        }
        report
    }

    /// Run every rule's `load` hook, in table order. Called by the transport on each
    /// (re)connect. Failures are isolated like action failures; returns how many failed.
    pub async fn load_rules(&self) -> usize {
        let ctx = RuleContext::new(self.workspace.snapshot().await, self.api.clone());
        let mut failures = 0;
        for entry in self.table.iter() {
            if let Err(e) = self.guarded(entry.rule.load(&ctx)).await {
                failures += 1;
                let text = format!("rule `{}` failed to load: {}", entry.rule.name(), e);
                log::error!("dispatch: {}", text);
                self.report(text).await;
            }
        }
        failures
    }

    async fn run_action(
        &self,
        entry: &RuleEntry,
        message: &Message,
        ctx: &RuleContext,
    ) -> Result<Vec<Reply>, RuleError> {
        self.guarded(entry.rule.respond(message, ctx)).await
    }

    /// Await a rule future under the rule timeout, turning a panic into a rule error.
    async fn guarded<T, F>(&self, fut: F) -> Result<T, RuleError>
    where
        F: Future<Output = Result<T, RuleError>>,
    {
        match tokio::time::timeout(self.rule_timeout, AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(RuleError::from_panic(panic)),
            Err(_) => Err(RuleError::TimedOut(self.rule_timeout)),
        }
    }

    /// Send one reply under the send timeout.
    async fn deliver(&self, reply: &Reply) -> Result<(), SendError> {
        match tokio::time::timeout(self.send_timeout, self.sink.send(reply)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::TimedOut(self.send_timeout)),
        }
    }

    async fn rule_failed(&self, rule: &str, err: &RuleError, message: &Message, ws: &Workspace) {
        let text = format!(
            "rule `{}` failed: {}\non message {} at {} (ts={}): `{}`",
            rule,
            err,
            ws.describe(&message.channel, &message.sender),
            sent_at(message),
            message.ts,
            message.text
        );
        log::error!("dispatch: {}", text);
        self.report(text).await;
    }

    async fn send_failed(&self, rule: &str, reply: &Reply, err: &SendError) {
        let text = format!(
            "rule `{}` reply to {} not delivered: {}",
            rule,
            reply.channel(),
            err
        );
        log::warn!("dispatch: {}", text);
        self.report(text).await;
    }

    async fn report(&self, text: String) {
        let Some(ref to) = self.report_to else {
            return;
        };
        if let Err(e) = self.deliver(&Reply::text(to.clone(), text)).await {
            log::warn!("dispatch: failure report to {} not delivered: {}", to, e);
        }
    }
}

/// Message time for logs and reports; the raw `ts` when it does not parse.
fn sent_at(message: &Message) -> String {
    message
        .timestamp()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| message.ts.clone())
}

/// Run a rule's predicate, turning a panic into a rule error.
fn evaluate(entry: &RuleEntry, message: &Message, ctx: &RuleContext) -> Result<bool, RuleError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| entry.rule.matches(message, ctx))) {
        Ok(result) => result,
        Err(panic) => Err(RuleError::from_panic(panic)),
    }
}

/// Sink that keeps replies in memory instead of sending them (dry runs, tests).
#[derive(Debug, Default)]
pub struct CollectSink {
    replies: Mutex<Vec<Reply>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything collected so far.
    pub async fn take(&self) -> Vec<Reply> {
        std::mem::take(&mut *self.replies.lock().await)
    }
}

#[async_trait]
impl ReplySink for CollectSink {
    async fn send(&self, reply: &Reply) -> Result<(), SendError> {
        self.replies.lock().await.push(reply.clone());
        Ok(())
    }
}
