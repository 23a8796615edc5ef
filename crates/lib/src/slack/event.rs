//! Decoding of RTM websocket frames into messages.

use crate::message::{Message, SharedFile};
use serde::Deserialize;

/// Message subtypes that describe edits to earlier messages rather than new text.
const SKIPPED_SUBTYPES: &[&str] = &["message_changed", "message_deleted", "message_replied"];

#[derive(Debug, Default, Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    /// Older events carry a single `file`, newer ones a `files` array.
    #[serde(default)]
    file: Option<RawFile>,
    #[serde(default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFile {
    #[serde(default)]
    mode: String,
    #[serde(default)]
    url_private: String,
}

/// One decoded RTM frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Connection established.
    Hello,
    /// Server is about to close the connection; reconnect.
    Goodbye,
    Message(Message),
    /// Any other event, or a message event we do not dispatch.
    Other,
}

/// Decode a text frame. Only JSON errors fail; unknown events are `Frame::Other`.
pub fn decode_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let raw: RawEvent = serde_json::from_str(text)?;
    let frame = match raw.kind.as_deref() {
        Some("hello") => Frame::Hello,
        Some("goodbye") => Frame::Goodbye,
        Some("message") => message_from(raw).map_or(Frame::Other, Frame::Message),
        _ => Frame::Other,
    };
    Ok(frame)
}

fn message_from(raw: RawEvent) -> Option<Message> {
    if raw.hidden {
        return None;
    }
    if let Some(ref st) = raw.subtype {
        if SKIPPED_SUBTYPES.contains(&st.as_str()) {
            return None;
        }
    }
    let channel = raw.channel.filter(|c| !c.is_empty())?;
    let ts = raw.ts.filter(|t| !t.is_empty())?;
    let sender = raw.user.or(raw.bot_id).unwrap_or_default();
    let files = raw
        .file
        .into_iter()
        .chain(raw.files)
        .map(|f| SharedFile {
            mode: f.mode,
            url_private: f.url_private,
        })
        .collect();
    Some(Message {
        sender,
        channel,
        text: raw.text.unwrap_or_default(),
        ts,
        thread_ts: raw.thread_ts,
        subtype: raw.subtype,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plain_message() {
        let frame = decode_frame(
            r#"{"type":"message","channel":"C2147483705","user":"U2147483697",
                "text":"Hello world","ts":"1355517523.000005"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            Frame::Message(Message::new(
                "U2147483697",
                "C2147483705",
                "Hello world",
                "1355517523.000005"
            ))
        );
    }

    #[test]
    fn missing_text_becomes_empty_and_bots_use_bot_id() {
        let frame = decode_frame(
            r#"{"type":"message","subtype":"bot_message","channel":"C1","bot_id":"B1",
                "ts":"1.0","thread_ts":"0.5"}"#,
        )
        .unwrap();
        let Frame::Message(m) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(m.sender, "B1");
        assert_eq!(m.text, "");
        assert_eq!(m.thread_ts.as_deref(), Some("0.5"));
        assert_eq!(m.subtype.as_deref(), Some("bot_message"));
    }

    #[test]
    fn edits_and_acks_are_not_dispatched() {
        let edit = r#"{"type":"message","subtype":"message_changed","hidden":true,"channel":"C1",
                       "ts":"2.0","message":{"text":"new"}}"#;
        assert_eq!(decode_frame(edit).unwrap(), Frame::Other);
        let ack = r#"{"ok":true,"reply_to":1,"ts":"1355517523.000005","text":"Hello world"}"#;
        assert_eq!(decode_frame(ack).unwrap(), Frame::Other);
        let no_channel = r#"{"type":"message","user":"U1","text":"x","ts":"1.0"}"#;
        assert_eq!(decode_frame(no_channel).unwrap(), Frame::Other);
    }

    #[test]
    fn file_share_carries_snippet() {
        let frame = decode_frame(
            r#"{"type":"message","subtype":"file_share","channel":"C1","user":"U1","ts":"3.0",
                "files":[{"mode":"snippet","url_private":"https://files.slack.com/F1/snip.txt"}]}"#,
        )
        .unwrap();
        let Frame::Message(m) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(
            m.snippets().collect::<Vec<_>>(),
            vec![&SharedFile::snippet("https://files.slack.com/F1/snip.txt")]
        );

        let legacy = decode_frame(
            r#"{"type":"message","subtype":"file_share","channel":"C1","user":"U1","ts":"4.0",
                "file":{"mode":"snippet","url_private":"https://files/F2"}}"#,
        )
        .unwrap();
        assert!(matches!(legacy, Frame::Message(ref m) if m.snippets().count() == 1));
    }

    #[test]
    fn control_frames() {
        assert_eq!(decode_frame(r#"{"type":"hello"}"#).unwrap(), Frame::Hello);
        assert_eq!(decode_frame(r#"{"type":"goodbye"}"#).unwrap(), Frame::Goodbye);
        assert_eq!(
            decode_frame(r#"{"type":"user_typing","channel":"C1","user":"U1"}"#).unwrap(),
            Frame::Other
        );
        assert!(decode_frame("not json").is_err());
    }
}
