//! Slack Web API client: form-encoded POSTs to `{base}/{method}` with a bearer token.
//! Used for rtm.connect, directory loading, delivering replies, and rule lookups.

use crate::dispatch::ReplySink;
use crate::error::{RuleError, SendError};
use crate::message::Reply;
use crate::rules::ChatApi;
use crate::workspace::Directory;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const SLACK_API_BASE: &str = "https://slack.com/api";
const PAGE_LIMIT: u32 = 300;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("slack request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("slack http error: {0}")]
    Status(String),
    /// The call reached Slack but returned `"ok": false`; holds Slack's `error` code.
    #[error("slack api error: {0}")]
    Api(String),
    #[error("slack response malformed: {0}")]
    Decode(String),
    #[error("slack api not available offline")]
    Offline,
}

impl From<ApiError> for RuleError {
    fn from(e: ApiError) -> Self {
        RuleError::Action(e.to_string())
    }
}

/// Result of rtm.connect: where to open the websocket and who we are.
#[derive(Debug, Clone)]
pub struct RtmSession {
    pub url: String,
    pub self_id: String,
    pub team: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RtmConnectResponse {
    url: String,
    #[serde(rename = "self")]
    me: RtmSelf,
    #[serde(default)]
    team: Option<RtmTeam>,
}

#[derive(Debug, Deserialize)]
struct RtmSelf {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RtmTeam {
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedItem {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

/// Slack Web API client.
#[derive(Clone)]
pub struct SlackApi {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl SlackApi {
    pub fn new(token: impl Into<String>, base_url: Option<String>) -> Result<Self, ApiError> {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| SLACK_API_BASE.to_string());
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url,
            token: token.into(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Call `method` with form params. Returns the whole response body when `ok` is true.
    pub async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let url = format!("{}/{}", self.base_url, method);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .form(params)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ApiError::Status(format!("{} {} {}", method, status, body)));
        }
        let data: Value = res.json().await?;
        check_ok(data)
    }

    /// Call a cursor-paginated list method and concatenate every page's `collect_key` array.
    pub async fn paginated(
        &self,
        method: &str,
        collect_key: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Value>, ApiError> {
        let mut base: Vec<(&str, String)> = params.to_vec();
        base.push(("limit", PAGE_LIMIT.to_string()));
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut page_params = base.clone();
            if let Some(c) = cursor.take() {
                page_params.push(("cursor", c));
            }
            let data = self.call(method, &page_params).await?;
            match data.get(collect_key).and_then(|v| v.as_array()) {
                Some(page) => items.extend(page.iter().cloned()),
                None => {
                    return Err(ApiError::Decode(format!(
                        "{} response has no `{}` array",
                        method, collect_key
                    )))
                }
            }
            cursor = next_cursor(&data);
            if cursor.is_none() {
                break;
            }
        }
        Ok(items)
    }

    /// rtm.connect: websocket URL and the bot's own user id.
    pub async fn rtm_connect(&self) -> Result<RtmSession, ApiError> {
        let data = self.call("rtm.connect", &[]).await?;
        let resp: RtmConnectResponse =
            serde_json::from_value(data).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(RtmSession {
            url: resp.url,
            self_id: resp.me.id,
            team: resp.team.and_then(|t| t.domain),
        })
    }

    /// Load the user and channel directories (users.list, conversations.list).
    pub async fn load_directories(&self) -> Result<(Directory, Directory), ApiError> {
        let users = self.paginated("users.list", "members", &[]).await?;
        let channels = self
            .paginated(
                "conversations.list",
                "channels",
                &[("types", "public_channel,private_channel".to_string())],
            )
            .await?;
        Ok((directory_from(&users), directory_from(&channels)))
    }

    /// GET a private file URL with the bot token and return its body as text.
    pub async fn fetch_private(&self, url: &str) -> Result<String, ApiError> {
        let res = self.client.get(url).bearer_auth(&self.token).send().await?;
        if !res.status().is_success() {
            return Err(ApiError::Status(format!("GET {} {}", url, res.status())));
        }
        Ok(res.text().await?)
    }

    /// Deliver one reply (chat.postMessage or reactions.add).
    pub async fn post(&self, reply: &Reply) -> Result<(), ApiError> {
        let (method, params) = reply_request(reply);
        self.call(method, &params).await.map(|_| ())
    }
}

#[async_trait]
impl ReplySink for SlackApi {
    async fn send(&self, reply: &Reply) -> Result<(), SendError> {
        self.post(reply).await.map_err(|e| match e {
            ApiError::Api(code) => SendError::Api(code),
            other => SendError::Transport(other.to_string()),
        })
    }
}

#[async_trait]
impl ChatApi for SlackApi {
    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Value, ApiError> {
        SlackApi::call(self, method, params).await
    }

    async fn fetch_private(&self, url: &str) -> Result<String, ApiError> {
        SlackApi::fetch_private(self, url).await
    }
}

/// Map an `ok: false` body to `ApiError::Api` with Slack's error code.
pub fn check_ok(data: Value) -> Result<Value, ApiError> {
    if data.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        return Ok(data);
    }
    let code = data
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown_error");
    Err(ApiError::Api(code.to_string()))
}

/// Non-empty `response_metadata.next_cursor`, if any.
pub fn next_cursor(data: &Value) -> Option<String> {
    data.get("response_metadata")
        .and_then(|m| m.get("next_cursor"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(String::from)
}

/// API method and form params for a reply.
pub fn reply_request(reply: &Reply) -> (&'static str, Vec<(&'static str, String)>) {
    match reply {
        Reply::Text {
            channel,
            text,
            thread_ts,
        } => {
            let mut params = vec![("channel", channel.clone()), ("text", text.clone())];
            if let Some(ts) = thread_ts {
                params.push(("thread_ts", ts.clone()));
            }
            ("chat.postMessage", params)
        }
        Reply::Reaction {
            channel,
            timestamp,
            name,
        } => (
            "reactions.add",
            vec![
                ("channel", channel.clone()),
                ("timestamp", timestamp.clone()),
                ("name", name.clone()),
            ],
        ),
    }
}

fn directory_from(items: &[Value]) -> Directory {
    items
        .iter()
        .filter_map(|v| serde_json::from_value::<NamedItem>(v.clone()).ok())
        .filter_map(|item| item.name.map(|name| (item.id, name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn check_ok_surfaces_slack_error_code() {
        assert!(check_ok(json!({"ok": true, "x": 1})).is_ok());
        match check_ok(json!({"ok": false, "error": "invalid_auth"})) {
            Err(ApiError::Api(code)) => assert_eq!(code, "invalid_auth"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(check_ok(json!({})), Err(ApiError::Api(ref c)) if c == "unknown_error"));
    }

    #[test]
    fn next_cursor_ignores_empty() {
        assert_eq!(
            next_cursor(&json!({"response_metadata": {"next_cursor": "dXNlcjpVMDYx"}})),
            Some("dXNlcjpVMDYx".to_string())
        );
        assert_eq!(next_cursor(&json!({"response_metadata": {"next_cursor": ""}})), None);
        assert_eq!(next_cursor(&json!({"ok": true})), None);
    }

    #[test]
    fn reply_requests() {
        let (method, params) = reply_request(&Reply::Text {
            channel: "C1".into(),
            text: "pong".into(),
            thread_ts: Some("1.5".into()),
        });
        assert_eq!(method, "chat.postMessage");
        assert_eq!(
            params,
            vec![
                ("channel", "C1".to_string()),
                ("text", "pong".to_string()),
                ("thread_ts", "1.5".to_string()),
            ]
        );

        let (method, params) = reply_request(&Reply::Reaction {
            channel: "D1".into(),
            timestamp: "2.0".into(),
            name: "heart".into(),
        });
        assert_eq!(method, "reactions.add");
        assert_eq!(params.len(), 3);
        assert_eq!(params[2], ("name", "heart".to_string()));
    }

    #[test]
    fn directory_skips_unnamed_entries() {
        let d = directory_from(&[
            json!({"id": "U1", "name": "ana"}),
            json!({"id": "D1", "is_im": true}),
            json!({"name": "no-id"}),
        ]);
        assert_eq!(d.len(), 1);
        assert_eq!(d.name("U1"), Some("ana"));
    }

    #[test]
    fn api_errors_become_action_failures() {
        let e: RuleError = ApiError::Api("user_not_found".into()).into();
        assert!(matches!(e, RuleError::Action(ref m) if m.contains("user_not_found")));
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let api = SlackApi::new("xoxb-1", Some("http://localhost:9999/api/".into())).unwrap();
        assert_eq!(api.base_url(), "http://localhost:9999/api");
        assert_eq!(SlackApi::new("xoxb-1", None).unwrap().base_url(), SLACK_API_BASE);
    }
}
