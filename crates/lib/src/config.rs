//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.quip/config.json`) and environment.
//! The `rules` section is turned into a rule table by `RuleTable::from_config`.

use crate::dispatch::MatchPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Slack connection settings.
    #[serde(default)]
    pub slack: SlackConfig,

    /// Dispatch policy and limits.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Rules, evaluated in this order.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Slack token, API endpoint, and failure reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    /// Bot token (xoxb-...). Overridden by SLACK_BOT_TOKEN env when set.
    pub bot_token: Option<String>,

    /// Web API base URL (default https://slack.com/api).
    pub api_base: Option<String>,

    /// User or channel id that receives rule/send failure reports. Omit to only log failures.
    pub report_to: Option<String>,
}

/// How the dispatcher walks the rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// "all" (default): every matching rule fires. "first": stop after the first match.
    #[serde(default)]
    pub policy: MatchPolicy,

    /// Upper bound on one rule action or load hook, in seconds (default 20).
    #[serde(default = "default_rule_timeout_secs")]
    pub rule_timeout_secs: u64,

    /// Upper bound on delivering one reply, in seconds (default 10).
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// Queued messages per channel; further messages for a full channel are dropped (default 64).
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,

    /// Seconds a channel lane may sit idle before it is closed (default 300).
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_secs: u64,
}

fn default_rule_timeout_secs() -> u64 {
    20
}

fn default_send_timeout_secs() -> u64 {
    10
}

fn default_lane_capacity() -> usize {
    64
}

fn default_lane_idle_secs() -> u64 {
    300
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            policy: MatchPolicy::default(),
            rule_timeout_secs: default_rule_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            lane_capacity: default_lane_capacity(),
            lane_idle_secs: default_lane_idle_secs(),
        }
    }
}

/// One rule entry: a name, a matcher, where it listens, and what it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub name: String,

    #[serde(flatten)]
    pub matcher: MatcherConfig,

    /// Channel names (with or without `#`) or ids. Empty means every channel.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,

    /// Only respond in direct messages. Cannot be combined with `channels`.
    #[serde(default)]
    pub direct_only: bool,

    /// Reply text. For regex rules, `$1` / `${name}` expand to capture groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,

    /// Emoji name to react with (e.g. "heart").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<String>,
}

/// Matcher kind, selected by the `kind` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MatcherConfig {
    /// Regular expression searched in the message text.
    Regex {
        pattern: String,
        #[serde(default, rename = "caseInsensitive")]
        case_insensitive: bool,
    },
    /// Any of the queries appears in the text (case-insensitive).
    Contains {
        queries: Vec<String>,
        /// Also search snippet files shared with the message.
        #[serde(default)]
        snippets: bool,
    },
    /// Dice roller (`d20`, `3d6 drop lowest`).
    Dice,
    /// "what is @user's email": looks the tagged user up with users.info.
    Email,
}

/// Resolve the Slack bot token: env SLACK_BOT_TOKEN overrides config.
pub fn resolve_slack_token(config: &Config) -> Option<String> {
    std::env::var("SLACK_BOT_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .slack
                .bot_token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("QUIP_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".quip").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (QUIP_CONFIG_PATH / ~/.quip/config.json).
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
