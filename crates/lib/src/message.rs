//! Inbound chat messages and the replies rules produce for them.

use chrono::{DateTime, Utc};

/// One inbound chat event. Rules only ever see it by shared reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// User id of the sender (or bot id for bot posts).
    pub sender: String,
    /// Channel id (`C…` public, `G…` private, `D…` direct message).
    pub channel: String,
    /// Message text; empty when the event carried none.
    pub text: String,
    /// Raw Slack timestamp (`"1700000000.000100"`), also the message id within a channel.
    pub ts: String,
    /// Parent thread timestamp when the message was posted in a thread.
    pub thread_ts: Option<String>,
    /// Event subtype (e.g. `bot_message`, `file_share`).
    pub subtype: Option<String>,
    /// Files shared with the message (`file_share` events).
    pub files: Vec<SharedFile>,
}

/// A file attached to a `file_share` message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedFile {
    /// Display mode (`snippet`, `hosted`, `post`, ...).
    pub mode: String,
    /// Download URL; needs the bot token.
    pub url_private: String,
}

impl SharedFile {
    pub fn snippet(url_private: impl Into<String>) -> Self {
        Self {
            mode: "snippet".to_string(),
            url_private: url_private.into(),
        }
    }

    pub fn is_snippet(&self) -> bool {
        self.mode == "snippet" && !self.url_private.is_empty()
    }
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        channel: impl Into<String>,
        text: impl Into<String>,
        ts: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            channel: channel.into(),
            text: text.into(),
            ts: ts.into(),
            thread_ts: None,
            subtype: None,
            files: Vec::new(),
        }
    }

    pub fn in_thread(mut self, thread_ts: impl Into<String>) -> Self {
        self.thread_ts = Some(thread_ts.into());
        self
    }

    /// Mark the message as a `file_share` carrying `file`.
    pub fn with_file(mut self, file: SharedFile) -> Self {
        self.subtype = Some("file_share".to_string());
        self.files.push(file);
        self
    }

    /// Snippet files shared with this message, if it is a `file_share`.
    pub fn snippets(&self) -> impl Iterator<Item = &SharedFile> {
        let shared = self.subtype.as_deref() == Some("file_share");
        self.files.iter().filter(move |f| shared && f.is_snippet())
    }

    /// Direct-message channels have ids starting with `D`.
    pub fn is_direct(&self) -> bool {
        self.channel.starts_with('D')
    }

    /// Timestamp as a UTC datetime; None when `ts` is not a decimal seconds string.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_ts(&self.ts)
    }

    /// Text reply in the same channel, threaded when the message was in a thread.
    pub fn reply(&self, text: impl Into<String>) -> Reply {
        Reply::Text {
            channel: self.channel.clone(),
            text: text.into(),
            thread_ts: self.thread_ts.clone(),
        }
    }

    /// Emoji reaction (name without colons) on this message.
    pub fn react(&self, name: impl Into<String>) -> Reply {
        Reply::Reaction {
            channel: self.channel.clone(),
            timestamp: self.ts.clone(),
            name: name.into(),
        }
    }
}

/// Parse a Slack `ts` ("seconds.micros") into a UTC datetime.
pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match ts.split_once('.') {
        Some((s, f)) => (s, f),
        None => (ts, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let nanos = if frac.is_empty() {
        0
    } else {
        if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let padded = format!("{:0<9}", frac);
        padded.parse::<u32>().ok()?
    };
    DateTime::<Utc>::from_timestamp(secs, nanos)
}

/// Outbound content plus destination, produced by a matched rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Post `text` to `channel` (in a thread when `thread_ts` is set).
    Text {
        channel: String,
        text: String,
        thread_ts: Option<String>,
    },
    /// Add reaction `name` to the message at `timestamp` in `channel`.
    Reaction {
        channel: String,
        timestamp: String,
        name: String,
    },
}

impl Reply {
    /// Unthreaded text post, e.g. for operator reports.
    pub fn text(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Reply::Text {
            channel: channel.into(),
            text: text.into(),
            thread_ts: None,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            Reply::Text { channel, .. } | Reply::Reaction { channel, .. } => channel,
        }
    }
}
