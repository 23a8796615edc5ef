//! Build a rule table from the `rules` section of the config. Any malformed entry aborts startup.

use super::{ChannelScope, ContainsRule, DiceRule, EmailRule, RegexRule, RuleTable};
use crate::config::{MatcherConfig, RuleConfig};
use crate::error::ConfigError;
use regex::RegexBuilder;
use std::collections::HashSet;

impl RuleTable {
    /// Build the table in config order. Fails on the first malformed entry.
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self, ConfigError> {
        let mut table = RuleTable::new();
        let mut seen = HashSet::new();
        for (index, rc) in rules.iter().enumerate() {
            let name = rc.name.trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyName { index });
            }
            if !seen.insert(name.to_string()) {
                return Err(ConfigError::DuplicateName(name.to_string()));
            }
            let scope = scope_for(name, rc)?;
            table = match &rc.matcher {
                MatcherConfig::Regex {
                    pattern,
                    case_insensitive,
                } => {
                    let regex = RegexBuilder::new(pattern)
                        .case_insensitive(*case_insensitive)
                        .build()
                        .map_err(|source| ConfigError::InvalidPattern {
                            rule: name.to_string(),
                            source,
                        })?;
                    let mut rule = RegexRule::new(name, regex);
                    if let Some(ref r) = rc.reply {
                        rule = rule.reply(r.clone());
                    }
                    if let Some(ref r) = rc.reaction {
                        rule = rule.reaction(r.clone());
                    }
                    if !rule.has_response() {
                        return Err(ConfigError::MissingResponse(name.to_string()));
                    }
                    table.with_scoped(scope, rule)
                }
                MatcherConfig::Contains { queries, snippets } => {
                    let mut rule = ContainsRule::new(name, queries);
                    if !rule.has_queries() {
                        return Err(ConfigError::EmptyQueries(name.to_string()));
                    }
                    if *snippets {
                        rule = rule.snippets();
                    }
                    if let Some(ref r) = rc.reply {
                        rule = rule.reply(r.clone());
                    }
                    if let Some(ref r) = rc.reaction {
                        rule = rule.reaction(r.clone());
                    }
                    if !rule.has_response() {
                        return Err(ConfigError::MissingResponse(name.to_string()));
                    }
                    table.with_scoped(scope, rule)
                }
                MatcherConfig::Dice => {
                    if rc.reply.is_some() || rc.reaction.is_some() {
                        log::warn!("rule `{}`: dice rules ignore reply and reaction", name);
                    }
                    table.with_scoped(scope, DiceRule::new(name))
                }
                MatcherConfig::Email => {
                    if rc.reply.is_some() || rc.reaction.is_some() {
                        log::warn!("rule `{}`: email rules ignore reply and reaction", name);
                    }
                    table.with_scoped(scope, EmailRule::new(name))
                }
            };
        }
        Ok(table)
    }
}

fn scope_for(name: &str, rc: &RuleConfig) -> Result<ChannelScope, ConfigError> {
    let channels: Vec<String> = rc
        .channels
        .iter()
        .map(|c| c.trim().trim_start_matches('#').to_string())
        .filter(|c| !c.is_empty())
        .collect();
    match (channels.is_empty(), rc.direct_only) {
        (true, false) => Ok(ChannelScope::Any),
        (true, true) => Ok(ChannelScope::DirectOnly),
        (false, false) => Ok(ChannelScope::Named(channels)),
        (false, true) => Err(ConfigError::ConflictingScope(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(json: &str) -> Vec<RuleConfig> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn builds_table_in_order() {
        let table = RuleTable::from_config(&rules(
            r##"[
                {"name": "ping", "kind": "regex", "pattern": "^ping$", "reply": "pong"},
                {"name": "listening", "kind": "contains", "queries": ["are you there"],
                 "channels": ["#random"], "reply": "yes"},
                {"name": "love", "kind": "contains", "queries": ["love me"],
                 "directOnly": true, "reaction": "heart"},
                {"name": "dice", "kind": "dice"},
                {"name": "email", "kind": "email"}
            ]"##,
        ))
        .unwrap();
        assert_eq!(table.names(), vec!["ping", "listening", "love", "dice", "email"]);
        let scopes: Vec<_> = table.iter().map(|e| e.scope.clone()).collect();
        assert_eq!(
            scopes,
            vec![
                ChannelScope::Any,
                ChannelScope::Named(vec!["random".into()]),
                ChannelScope::DirectOnly,
                ChannelScope::Any,
                ChannelScope::Any,
            ]
        );
    }

    #[test]
    fn snippets_flag_enables_snippet_matching() {
        use crate::message::{Message, SharedFile};
        use crate::rules::RuleContext;
        use crate::workspace::Workspace;
        use std::sync::Arc;

        let table = RuleTable::from_config(&rules(
            r#"[{"name": "s", "kind": "contains", "queries": ["todo"], "snippets": true, "reply": "x"},
                {"name": "t", "kind": "contains", "queries": ["todo"], "reply": "x"}]"#,
        ))
        .unwrap();
        let ctx = RuleContext::offline(Arc::new(Workspace::default()));
        let shared = Message::new("U1", "C1", "", "1").with_file(SharedFile::snippet("https://f/1"));
        let matched: Vec<bool> = table
            .iter()
            .map(|e| e.rule.matches(&shared, &ctx).unwrap())
            .collect();
        assert_eq!(matched, vec![true, false]);
    }

    #[test]
    fn invalid_pattern_is_fatal() {
        let err = RuleTable::from_config(&rules(
            r#"[{"name": "bad", "kind": "regex", "pattern": "(unclosed", "reply": "x"}]"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { ref rule, .. } if rule == "bad"));
    }

    #[test]
    fn rules_without_response_are_rejected() {
        let err = RuleTable::from_config(&rules(
            r#"[{"name": "mute", "kind": "regex", "pattern": "x"}]"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingResponse(ref n) if n == "mute"));
    }

    #[test]
    fn empty_queries_are_rejected() {
        let err = RuleTable::from_config(&rules(
            r#"[{"name": "q", "kind": "contains", "queries": ["", ""], "reply": "x"}]"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyQueries(_)));
    }

    #[test]
    fn names_must_be_present_and_unique() {
        let err = RuleTable::from_config(&rules(
            r#"[{"name": " ", "kind": "dice"}]"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyName { index: 0 }));

        let err = RuleTable::from_config(&rules(
            r#"[{"name": "d", "kind": "dice"}, {"name": "d", "kind": "dice"}]"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(ref n) if n == "d"));
    }

    #[test]
    fn channels_and_direct_only_conflict() {
        let err = RuleTable::from_config(&rules(
            r#"[{"name": "d", "kind": "dice", "channels": ["random"], "directOnly": true}]"#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingScope(_)));
    }

    #[test]
    fn case_insensitive_flag_is_honored() {
        use crate::message::Message;
        use crate::rules::RuleContext;
        use crate::workspace::Workspace;
        use std::sync::Arc;

        let table = RuleTable::from_config(&rules(
            r#"[{"name": "p", "kind": "regex", "pattern": "^ping$", "caseInsensitive": true, "reply": "pong"}]"#,
        ))
        .unwrap();
        let ctx = RuleContext::offline(Arc::new(Workspace::default()));
        let entry = table.iter().next().unwrap();
        assert!(entry
            .rule
            .matches(&Message::new("U1", "C1", "PING", "1"), &ctx)
            .unwrap());
    }
}
