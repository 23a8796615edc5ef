use clap::{Parser, Subcommand};
use quip::workspace::{SharedWorkspace, Workspace};
use quip::{CollectSink, Message, Reply, RuleTable};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quip")]
#[command(about = "Rule-driven auto-responder for Slack", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a starter config with example rules.
    Init {
        /// Config file path (default: QUIP_CONFIG_PATH or ~/.quip/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Validate the config and its rules without connecting.
    Check {
        /// Config file path (default: QUIP_CONFIG_PATH or ~/.quip/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run one message through the rules and print the replies that would be sent.
    Try {
        /// Config file path (default: QUIP_CONFIG_PATH or ~/.quip/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Channel id the message appears in (ids starting with D are direct messages).
        #[arg(long, default_value = "C0000000000")]
        channel: String,

        /// Channel name for channel-scoped rules (e.g. "random").
        #[arg(long, value_name = "NAME")]
        channel_name: Option<String>,

        /// Sender user id.
        #[arg(long, default_value = "U0000000000")]
        user: String,

        /// Message text.
        text: String,
    },

    /// Connect to Slack and answer messages until Ctrl+C.
    Run {
        /// Config file path (default: QUIP_CONFIG_PATH or ~/.quip/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("quip {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Check { config }) => {
            if let Err(e) = run_check(config) {
                eprintln!("config error: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Try {
            config,
            channel,
            channel_name,
            user,
            text,
        }) => {
            if let Err(e) = run_try(config, channel, channel_name, user, text).await {
                eprintln!("try failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config }) => {
            if let Err(e) = run_bot(config).await {
                log::error!("bot failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(quip::config::default_config_path);
    let dir = quip::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

fn run_check(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = quip::config::load_config(config_path)?;
    let table = RuleTable::from_config(&config.rules)?;
    println!("{}: {} rule(s) ok", path.display(), table.len());
    for name in table.names() {
        println!("  {}", name);
    }
    if quip::config::resolve_slack_token(&config).is_none() {
        println!("warning: no slack token (set slack.botToken or SLACK_BOT_TOKEN)");
    }
    Ok(())
}

async fn run_try(
    config_path: Option<PathBuf>,
    channel: String,
    channel_name: Option<String>,
    user: String,
    text: String,
) -> anyhow::Result<()> {
    let (config, _) = quip::config::load_config(config_path)?;
    let table = RuleTable::from_config(&config.rules)?;

    let mut workspace = Workspace::default();
    if let Some(name) = channel_name {
        workspace.channels.insert(channel.clone(), name);
    }
    let sink = Arc::new(CollectSink::new());
    // Failure reports would land in the sink too; keep the output to rule replies.
    let mut config = config;
    config.slack.report_to = None;
    let dispatcher = quip::bot::build_dispatcher(
        table,
        sink.clone(),
        SharedWorkspace::new(workspace),
        &config,
    );

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let ts = format!("{}.000000", now);
    let message = Message::new(user, channel, text, ts);
    let report = dispatcher.handle(&message).await;

    if report.matched.is_empty() {
        println!("no rule matched ({} evaluated)", report.evaluated);
    } else {
        println!("matched: {}", report.matched.join(", "));
    }
    for reply in sink.take().await {
        match reply {
            Reply::Text { channel, text, .. } => println!("-> {}: {}", channel, text),
            Reply::Reaction { channel, name, .. } => println!("-> {}: :{}:", channel, name),
        }
    }
    if report.failures > 0 {
        println!("{} failure(s), see log output above", report.failures);
    }
    Ok(())
}

async fn run_bot(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, path) = quip::config::load_config(config_path)?;
    log::info!("starting with config {}", path.display());
    quip::bot::run_bot(config).await
}
