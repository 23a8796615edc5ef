//! RTM connector: rtm.connect, refresh the workspace directories, run the rules' load hooks,
//! then read websocket frames and forward messages to the router. Reconnects when the
//! connection drops.

use super::api::{ApiError, SlackApi};
use super::event::{decode_frame, Frame};
use crate::dispatch::Dispatcher;
use crate::message::Message;
use crate::workspace::{SharedWorkspace, Workspace};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// Ping the server when nothing arrived for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(20);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum RtmError {
    /// Slack refused rtm.connect (bad token, missing scope). Retrying will not help.
    #[error("rtm.connect refused: {0}")]
    Refused(String),
}

/// Why one websocket session ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    Stopped,
    InboundClosed,
    Disconnected(String),
}

/// Real-time connector for one workspace.
pub struct RtmClient {
    api: Arc<SlackApi>,
    workspace: SharedWorkspace,
    dispatcher: Option<Arc<Dispatcher>>,
    running: AtomicBool,
}

impl RtmClient {
    pub fn new(api: Arc<SlackApi>, workspace: SharedWorkspace) -> Self {
        Self {
            api,
            workspace,
            dispatcher: None,
            running: AtomicBool::new(false),
        }
    }

    /// Run this dispatcher's rule load hooks after every (re)connect.
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to stop after the current frame (or idle timeout).
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Start the connect/read loop, forwarding messages to `inbound_tx`.
    /// The task ends with an error only when Slack refuses the token.
    pub fn start_inbound(
        self: Arc<Self>,
        inbound_tx: mpsc::Sender<Message>,
    ) -> JoinHandle<Result<(), RtmError>> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("rtm: starting connect loop");
        tokio::spawn(async move { run_rtm_loop(self, inbound_tx).await })
    }

    /// Replace the workspace snapshot after a (re)connect. Keeps the previous directories
    /// when the directory calls fail so channel-scoped rules keep working.
    async fn refresh_workspace(&self, self_id: &str) {
        let previous = self.workspace.snapshot().await;
        let (users, channels) = match self.api.load_directories().await {
            Ok((users, channels)) => {
                log::info!(
                    "rtm: loaded {} user(s), {} channel(s)",
                    users.len(),
                    channels.len()
                );
                (users, channels)
            }
            Err(e) => {
                log::warn!("rtm: loading directories failed, keeping previous: {}", e);
                (previous.users.clone(), previous.channels.clone())
            }
        };
        self.workspace
            .replace(Workspace {
                bot_user_id: Some(self_id.to_string()),
                users,
                channels,
            })
            .await;
    }

    /// Session setup after rtm.connect: new workspace snapshot, then rule load hooks.
    pub(crate) async fn connected(&self, self_id: &str) {
        self.refresh_workspace(self_id).await;
        if let Some(ref dispatcher) = self.dispatcher {
            let failed = dispatcher.load_rules().await;
            if failed > 0 {
                log::warn!("rtm: {} rule(s) failed to load", failed);
            }
        }
    }
}

async fn run_rtm_loop(
    client: Arc<RtmClient>,
    inbound_tx: mpsc::Sender<Message>,
) -> Result<(), RtmError> {
    while client.running() {
        let session = match client.api.rtm_connect().await {
            Ok(s) => s,
            Err(ApiError::Api(code)) => {
                log::error!("rtm: rtm.connect refused: {}", code);
                return Err(RtmError::Refused(code));
            }
            Err(e) => {
                log::warn!("rtm: rtm.connect failed: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        client.connected(&session.self_id).await;

        let ws = match tokio_tungstenite::connect_async(session.url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::warn!("rtm: websocket connect failed: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        log::info!(
            "rtm: connected as {} ({})",
            session.self_id,
            session.team.as_deref().unwrap_or("unknown team")
        );

        match read_frames(ws, &client.running, &inbound_tx).await {
            SessionEnd::Stopped => break,
            SessionEnd::InboundClosed => {
                log::debug!("rtm: inbound channel closed, stopping loop");
                return Ok(());
            }
            SessionEnd::Disconnected(reason) => {
                log::info!("rtm: disconnected ({}), reconnecting", reason);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    log::info!("rtm: connect loop stopped");
    Ok(())
}

/// Read frames until the session ends. Sends a ping after `IDLE_TIMEOUT` of silence.
pub(crate) async fn read_frames<S>(
    mut ws: WebSocketStream<S>,
    running: &AtomicBool,
    inbound_tx: &mpsc::Sender<Message>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while running.load(Ordering::SeqCst) {
        let frame = match tokio::time::timeout(IDLE_TIMEOUT, ws.next()).await {
            Err(_) => {
                match tokio::time::timeout(PING_TIMEOUT, ws.send(WsMessage::Ping(Vec::new()))).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => return SessionEnd::Disconnected(format!("ping failed: {}", e)),
                    Err(_) => return SessionEnd::Disconnected("ping timed out".to_string()),
                }
            }
            Ok(None) => return SessionEnd::Disconnected("stream ended".to_string()),
            Ok(Some(Err(e))) => return SessionEnd::Disconnected(e.to_string()),
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            WsMessage::Text(text) => match decode_frame(&text) {
                Ok(Frame::Message(message)) => {
                    if inbound_tx.send(message).await.is_err() {
                        return SessionEnd::InboundClosed;
                    }
                }
                Ok(Frame::Hello) => log::debug!("rtm: hello"),
                Ok(Frame::Goodbye) => {
                    return SessionEnd::Disconnected("server sent goodbye".to_string())
                }
                Ok(Frame::Other) => {}
                Err(e) => log::debug!("rtm: undecodable frame: {}", e),
            },
            WsMessage::Close(_) => return SessionEnd::Disconnected("closed by server".to_string()),
            _ => {}
        }
    }
    let _ = ws.close(None).await;
    SessionEnd::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CollectSink;
    use crate::error::RuleError;
    use crate::message::Reply;
    use crate::rules::{Rule, RuleContext, RuleTable};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[tokio::test]
    async fn forwards_messages_until_goodbye() {
        let (client, mut server) = pair().await;
        let (tx, mut rx) = mpsc::channel(8);
        let running = AtomicBool::new(true);

        let frames = [
            r#"{"type":"hello"}"#,
            r#"{"type":"user_typing","channel":"C1","user":"U1"}"#,
            r#"{"type":"message","channel":"C1","user":"U1","text":"ping","ts":"1.0"}"#,
            "garbage",
            r#"{"type":"message","channel":"D1","user":"U2","text":"hi","ts":"2.0"}"#,
            r#"{"type":"goodbye"}"#,
        ];
        for f in frames {
            server.send(WsMessage::Text(f.to_string())).await.unwrap();
        }

        let end = read_frames(client, &running, &tx).await;
        assert_eq!(end, SessionEnd::Disconnected("server sent goodbye".to_string()));
        assert_eq!(rx.recv().await.unwrap(), Message::new("U1", "C1", "ping", "1.0"));
        assert_eq!(rx.recv().await.unwrap(), Message::new("U2", "D1", "hi", "2.0"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stops_when_inbound_closed() {
        let (client, mut server) = pair().await;
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let running = AtomicBool::new(true);
        server
            .send(WsMessage::Text(
                r#"{"type":"message","channel":"C1","user":"U1","text":"x","ts":"1.0"}"#.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(read_frames(client, &running, &tx).await, SessionEnd::InboundClosed);
    }

    #[tokio::test]
    async fn server_close_disconnects() {
        let (client, mut server) = pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let running = AtomicBool::new(true);
        server.close(None).await.unwrap();
        let end = read_frames(client, &running, &tx).await;
        assert!(matches!(end, SessionEnd::Disconnected(_)));
    }

    type Seen = Arc<std::sync::Mutex<Vec<Option<String>>>>;

    /// Records the bot id each load saw; fails from the second load on.
    struct Warmup {
        seen: Seen,
    }

    #[async_trait::async_trait]
    impl Rule for Warmup {
        fn name(&self) -> &str {
            "warmup"
        }

        fn matches(&self, _message: &Message, _ctx: &RuleContext) -> Result<bool, RuleError> {
            Ok(false)
        }

        async fn respond(&self, _message: &Message, _ctx: &RuleContext) -> Result<Vec<Reply>, RuleError> {
            Ok(Vec::new())
        }

        async fn load(&self, ctx: &RuleContext) -> Result<(), RuleError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(ctx.workspace.bot_user_id.clone());
            if seen.len() > 1 {
                return Err(RuleError::action("cache warmup failed"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn connect_refreshes_workspace_then_loads_rules() {
        let seen: Seen = Arc::default();
        let workspace = SharedWorkspace::default();
        let sink = Arc::new(CollectSink::new());
        let table = RuleTable::new().with(Warmup { seen: seen.clone() });
        let dispatcher = Arc::new(
            Dispatcher::new(table, sink.clone(), workspace.clone()).with_report_to(Some("UOPS".into())),
        );
        // Nothing listens here, so directory loading fails and the previous (empty) ones are kept.
        let api = Arc::new(SlackApi::new("xoxb-test", Some("http://127.0.0.1:9".into())).unwrap());
        let client = RtmClient::new(api, workspace.clone()).with_dispatcher(dispatcher);

        client.connected("UBOT").await;
        assert_eq!(workspace.snapshot().await.bot_user_id.as_deref(), Some("UBOT"));
        assert_eq!(*seen.lock().unwrap(), vec![Some("UBOT".to_string())]);
        assert!(sink.take().await.is_empty());

        // A failing load hook is reported, not fatal.
        client.connected("UBOT").await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        let reports = sink.take().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].channel(), "UOPS");
    }

    #[tokio::test]
    async fn not_running_returns_immediately() {
        let (client, _server) = pair().await;
        let (tx, _rx) = mpsc::channel(8);
        let running = AtomicBool::new(false);
        assert_eq!(read_frames(client, &running, &tx).await, SessionEnd::Stopped);
    }
}
