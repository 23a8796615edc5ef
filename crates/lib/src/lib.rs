//! quip core library: rule table, dispatcher, channel router, and the Slack transport
//! used by the `quip` CLI.

pub mod bot;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod init;
pub mod message;
pub mod router;
pub mod rules;
pub mod slack;
pub mod workspace;

pub use dispatch::{CollectSink, DispatchReport, Dispatcher, MatchPolicy, ReplySink};
pub use error::{ConfigError, RuleError, SendError};
pub use message::{Message, Reply, SharedFile};
pub use rules::{ChannelScope, ChatApi, Rule, RuleContext, RuleTable};
