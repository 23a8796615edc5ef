//! Built-in rule kinds: regex match, substring match, dice roller, email lookup, and
//! closure-backed rules.

use super::{Rule, RuleContext};
use crate::error::RuleError;
use crate::message::{Message, Reply};
use async_trait::async_trait;
use rand::Rng;
use regex::Regex;

/// Replies configured on a rule: text (possibly a template) and/or an emoji reaction.
#[derive(Debug, Clone, Default)]
pub(crate) struct Response {
    pub reply: Option<String>,
    pub reaction: Option<String>,
}

impl Response {
    fn is_empty(&self) -> bool {
        self.reply.is_none() && self.reaction.is_none()
    }

    fn replies(&self, message: &Message, text: Option<String>) -> Vec<Reply> {
        let mut out = Vec::with_capacity(2);
        if let Some(text) = text {
            out.push(message.reply(text));
        }
        if let Some(ref name) = self.reaction {
            out.push(message.react(name.trim_matches(':')));
        }
        out
    }
}

/// Matches when the regex finds a match in the message text. Reply templates may
/// reference capture groups (`$1`, `${name}`).
#[derive(Debug, Clone)]
pub struct RegexRule {
    name: String,
    regex: Regex,
    response: Response,
}

impl RegexRule {
    pub fn new(name: impl Into<String>, regex: Regex) -> Self {
        Self {
            name: name.into(),
            regex,
            response: Response::default(),
        }
    }

    pub fn reply(mut self, template: impl Into<String>) -> Self {
        self.response.reply = Some(template.into());
        self
    }

    pub fn reaction(mut self, name: impl Into<String>) -> Self {
        self.response.reaction = Some(name.into());
        self
    }

    pub(crate) fn has_response(&self) -> bool {
        !self.response.is_empty()
    }
}

#[async_trait]
impl Rule for RegexRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, message: &Message, _ctx: &RuleContext) -> Result<bool, RuleError> {
        Ok(self.regex.is_match(&message.text))
    }

    async fn respond(&self, message: &Message, _ctx: &RuleContext) -> Result<Vec<Reply>, RuleError> {
        let text = match self.response.reply {
            Some(ref template) => {
                // The predicate already matched, but the text is re-scanned here; a miss means
                // the rule was invoked directly without checking `matches` first.
                let caps = self.regex.captures(&message.text).ok_or_else(|| {
                    RuleError::action("pattern no longer matches message text")
                })?;
                let mut out = String::new();
                caps.expand(template, &mut out);
                Some(out)
            }
            None => None,
        };
        Ok(self.response.replies(message, text))
    }
}

/// Matches when any query appears in the message text, ignoring case. With `snippets`, a
/// query inside a snippet shared with the message counts too.
#[derive(Debug, Clone)]
pub struct ContainsRule {
    name: String,
    queries: Vec<String>,
    snippets: bool,
    response: Response,
}

impl ContainsRule {
    pub fn new<I, S>(name: impl Into<String>, queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            queries: queries
                .into_iter()
                .map(|q| q.as_ref().to_lowercase())
                .filter(|q| !q.is_empty())
                .collect(),
            snippets: false,
            response: Response::default(),
        }
    }

    /// Also search snippet files shared with the message.
    pub fn snippets(mut self) -> Self {
        self.snippets = true;
        self
    }

    pub fn reply(mut self, text: impl Into<String>) -> Self {
        self.response.reply = Some(text.into());
        self
    }

    pub fn reaction(mut self, name: impl Into<String>) -> Self {
        self.response.reaction = Some(name.into());
        self
    }

    pub(crate) fn has_queries(&self) -> bool {
        !self.queries.is_empty()
    }

    fn found_in(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.queries.iter().any(|q| text.contains(q.as_str()))
    }

    pub(crate) fn has_response(&self) -> bool {
        !self.response.is_empty()
    }
}

#[async_trait]
impl Rule for ContainsRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, message: &Message, _ctx: &RuleContext) -> Result<bool, RuleError> {
        Ok(self.found_in(&message.text) || (self.snippets && message.snippets().next().is_some()))
    }

    async fn respond(&self, message: &Message, ctx: &RuleContext) -> Result<Vec<Reply>, RuleError> {
        if !self.found_in(&message.text) {
            // Matched on a shared snippet; its contents decide.
            let mut found = false;
            for file in message.snippets() {
                let contents = ctx.api.fetch_private(&file.url_private).await?;
                if self.found_in(&contents) {
                    found = true;
                    break;
                }
            }
            if !found {
                return Ok(Vec::new());
            }
        }
        Ok(self.response.replies(message, self.response.reply.clone()))
    }
}

const DICE_PATTERN: &str = r"\b(\d*)d(\d+)\b";
const MAX_DICE: usize = 100;
const MAX_SIDES: u32 = 1_000_000;

/// Rolls `AdX` dice (`d20`, `3d6 drop lowest`) and replies with the sorted rolls and their sum.
#[derive(Debug, Clone)]
pub struct DiceRule {
    name: String,
    regex: Regex,
}

impl DiceRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            regex: Regex::new(DICE_PATTERN).expect("dice pattern compiles"),
        }
    }

    fn parse(&self, text: &str) -> Result<(usize, u32), RuleError> {
        let caps = self
            .regex
            .captures(text)
            .ok_or_else(|| RuleError::action("no dice expression in message"))?;
        let count = match caps.get(1).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
            Some(s) => s
                .parse::<usize>()
                .map_err(|_| RuleError::action(format!("too many dice: {}", s)))?,
            None => 1,
        };
        let sides = caps[2]
            .parse::<u32>()
            .map_err(|_| RuleError::action(format!("too many sides: {}", &caps[2])))?;
        if count > MAX_DICE {
            return Err(RuleError::action(format!("too many dice: {}", count)));
        }
        if sides == 0 || sides > MAX_SIDES {
            return Err(RuleError::action(format!("unsupported die: d{}", sides)));
        }
        Ok((count, sides))
    }
}

/// Sort the rolls, apply "drop lowest"/"drop highest" from `text`, and format the summary.
pub(crate) fn roll_summary(mut rolls: Vec<u32>, text: &str) -> String {
    rolls.sort_unstable();
    let text = text.to_lowercase();
    if text.contains("drop lowest") && !rolls.is_empty() {
        rolls.remove(0);
    }
    if text.contains("drop highest") {
        rolls.pop();
    }
    let sum: u64 = rolls.iter().map(|&r| u64::from(r)).sum();
    let listed: Vec<String> = rolls.iter().map(|r| r.to_string()).collect();
    format!("Sum of {} from rolling: {}", sum, listed.join(", "))
}

#[async_trait]
impl Rule for DiceRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, message: &Message, _ctx: &RuleContext) -> Result<bool, RuleError> {
        Ok(self.regex.is_match(&message.text))
    }

    async fn respond(&self, message: &Message, _ctx: &RuleContext) -> Result<Vec<Reply>, RuleError> {
        let (count, sides) = self.parse(&message.text)?;
        let rolls: Vec<u32> = {
            let mut rng = rand::thread_rng();
            (0..count).map(|_| rng.gen_range(1..=sides)).collect()
        };
        Ok(vec![message.reply(roll_summary(rolls, &message.text))])
    }
}

const MENTION_PATTERN: &str = r"<@(U\w+)>";
const NO_EMAIL: &str = "No email found :(";

/// Answers "what is @someone's email" by looking the tagged user up with users.info.
/// In channels it only speaks when someone is tagged; in direct messages it asks for a tag.
#[derive(Debug, Clone)]
pub struct EmailRule {
    name: String,
    mention: Regex,
}

impl EmailRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mention: Regex::new(MENTION_PATTERN).expect("mention pattern compiles"),
        }
    }

    fn tagged<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.mention
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }
}

#[async_trait]
impl Rule for EmailRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, message: &Message, _ctx: &RuleContext) -> Result<bool, RuleError> {
        Ok(message.text.to_lowercase().contains("email")
            && (message.is_direct() || self.tagged(&message.text).is_some()))
    }

    async fn respond(&self, message: &Message, ctx: &RuleContext) -> Result<Vec<Reply>, RuleError> {
        let Some(user) = self.tagged(&message.text) else {
            return Ok(vec![message.reply("You have to @tag the person")]);
        };
        if ctx.workspace.bot_user_id.as_deref() == Some(user) {
            return Ok(vec![message.reply(
                "I hope you'll excuse me, but I am a bot who values my privacy.",
            )]);
        }
        let info = ctx.api.call("users.info", &[("user", user.to_string())]).await?;
        let email = info
            .pointer("/user/profile/email")
            .and_then(|v| v.as_str())
            .unwrap_or(NO_EMAIL);
        Ok(vec![message.reply(email)])
    }
}

type Predicate = dyn Fn(&Message) -> Result<bool, RuleError> + Send + Sync;
type Action = dyn Fn(&Message) -> Result<Vec<Reply>, RuleError> + Send + Sync;

/// Rule backed by plain closures, for rules defined in code rather than config.
pub struct FnRule {
    name: String,
    predicate: Box<Predicate>,
    action: Box<Action>,
}

impl FnRule {
    pub fn new<P, A>(name: impl Into<String>, predicate: P, action: A) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
        A: Fn(&Message) -> Vec<Reply> + Send + Sync + 'static,
    {
        Self::fallible(name, move |m| Ok(predicate(m)), move |m| Ok(action(m)))
    }

    /// Like `new`, but the closures may fail; failures are reported like any other rule error.
    pub fn fallible<P, A>(name: impl Into<String>, predicate: P, action: A) -> Self
    where
        P: Fn(&Message) -> Result<bool, RuleError> + Send + Sync + 'static,
        A: Fn(&Message) -> Result<Vec<Reply>, RuleError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            action: Box::new(action),
        }
    }
}

#[async_trait]
impl Rule for FnRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, message: &Message, _ctx: &RuleContext) -> Result<bool, RuleError> {
        (self.predicate)(message)
    }

    async fn respond(&self, message: &Message, _ctx: &RuleContext) -> Result<Vec<Reply>, RuleError> {
        (self.action)(message)
    }
}
