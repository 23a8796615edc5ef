//! Bot runtime: build the rule table and dispatcher from config, connect to Slack,
//! and route inbound messages until shutdown.

use crate::config::{self, Config};
use crate::dispatch::{Dispatcher, ReplySink};
use crate::message::Message;
use crate::router::ChannelRouter;
use crate::rules::RuleTable;
use crate::slack::{RtmClient, SlackApi};
use crate::workspace::SharedWorkspace;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Dispatcher configured from the `dispatch` and `slack.reportTo` settings.
pub fn build_dispatcher(
    table: RuleTable,
    sink: Arc<dyn ReplySink>,
    workspace: SharedWorkspace,
    config: &Config,
) -> Dispatcher {
    Dispatcher::new(table, sink, workspace)
        .with_policy(config.dispatch.policy)
        .with_rule_timeout(Duration::from_secs(config.dispatch.rule_timeout_secs.max(1)))
        .with_send_timeout(Duration::from_secs(config.dispatch.send_timeout_secs.max(1)))
        .with_report_to(config.slack.report_to.clone())
}

/// Run the bot. Fails before connecting when the rules are malformed or no token is set,
/// and afterwards only when Slack refuses the token. Blocks until Ctrl+C / SIGTERM.
pub async fn run_bot(config: Config) -> Result<()> {
    let table = RuleTable::from_config(&config.rules).context("invalid rule configuration")?;
    if table.is_empty() {
        log::warn!("no rules configured; the bot will never reply");
    } else {
        log::info!("loaded {} rule(s): {}", table.len(), table.names().join(", "));
    }
    let token = config::resolve_slack_token(&config).ok_or_else(|| {
        anyhow!("slack bot token not configured (set slack.botToken or SLACK_BOT_TOKEN)")
    })?;

    let api = Arc::new(
        SlackApi::new(token, config.slack.api_base.clone()).context("building slack client")?,
    );
    let workspace = SharedWorkspace::default();
    let dispatcher = Arc::new(
        build_dispatcher(table, api.clone(), workspace.clone(), &config).with_api(api.clone()),
    );
    log::info!("dispatch policy: {:?}", dispatcher.policy());

    let lane_capacity = config.dispatch.lane_capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(lane_capacity);
    let router = ChannelRouter::new(dispatcher.clone(), lane_capacity)
        .with_idle_timeout(Duration::from_secs(config.dispatch.lane_idle_secs.max(1)));
    let router_task = tokio::spawn(router.run(inbound_rx));

    let rtm = Arc::new(RtmClient::new(api, workspace).with_dispatcher(dispatcher));
    let mut inbound = rtm.clone().start_inbound(inbound_tx);

    let finished = tokio::select! {
        res = &mut inbound => Some(res),
        _ = shutdown_signal() => None,
    };
    let result = match finished {
        Some(Ok(Ok(()))) => Ok(()),
        Some(Ok(Err(e))) => Err(anyhow::Error::new(e)),
        Some(Err(e)) => Err(anyhow!("rtm task failed: {}", e)),
        None => {
            log::info!("shutdown signal received, stopping");
            rtm.stop();
            inbound.abort();
            Ok(())
        }
    };

    // The inbound sender is gone once the rtm task ends, so the router drains and exits.
    let _ = router_task.await;
    log::info!("bot stopped");
    result
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
