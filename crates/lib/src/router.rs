//! Channel router: one serial lane per channel so each channel's messages are handled in
//! arrival order, while different channels are handled concurrently.
//!
//! Routing never waits on a lane. A channel whose lane is full (its replies are stuck) loses
//! the overflow instead of stalling intake for every other channel. Lanes close themselves
//! after sitting idle and are reopened on the next message, so only recently active channels
//! hold a task.

use crate::dispatch::Dispatcher;
use crate::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

const DEFAULT_LANE_IDLE: Duration = Duration::from_secs(300);

struct Lane {
    tx: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

/// Routes inbound messages to per-channel lanes, creating lanes on first use.
pub struct ChannelRouter {
    dispatcher: Arc<Dispatcher>,
    lane_capacity: usize,
    lane_idle: Duration,
    lanes: HashMap<String, Lane>,
    dropped: u64,
}

impl ChannelRouter {
    pub fn new(dispatcher: Arc<Dispatcher>, lane_capacity: usize) -> Self {
        Self {
            dispatcher,
            lane_capacity: lane_capacity.max(1),
            lane_idle: DEFAULT_LANE_IDLE,
            lanes: HashMap::new(),
            dropped: 0,
        }
    }

    /// Close a lane after it has had nothing to do for `idle`.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.lane_idle = idle;
        self
    }

    /// Queue a message on its channel's lane without waiting. Returns false when the message
    /// was dropped because that lane is full.
    pub fn route(&mut self, message: Message) -> bool {
        let channel = message.channel.clone();
        let message = match self.lane(&channel).tx.try_send(message) {
            Ok(()) => return true,
            Err(TrySendError::Full(message)) => {
                self.dropped += 1;
                log::warn!(
                    "router: lane for {} is full ({} queued), dropping message ts={}",
                    channel,
                    self.lane_capacity,
                    message.ts
                );
                return false;
            }
            Err(TrySendError::Closed(message)) => message,
        };

        // The lane went idle (or its task died) since we last used it; open a fresh one.
        log::debug!("router: lane for {} closed, reopening", channel);
        self.lanes.remove(&channel);
        match self.lane(&channel).tx.try_send(message) {
            Ok(()) => true,
            Err(_) => {
                self.dropped += 1;
                log::error!("router: dropping message for {}", channel);
                false
            }
        }
    }

    /// Lanes currently held (open, or closed and not yet pruned).
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Messages dropped because their lane was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Route everything from `inbound` until it closes, then drain all lanes.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Message>) {
        while let Some(message) = inbound.recv().await {
            self.route(message);
        }
        log::debug!(
            "router: inbound closed, draining {} lane(s), {} message(s) dropped",
            self.lanes.len(),
            self.dropped
        );
        self.shutdown().await;
    }

    /// Close every lane and wait for queued messages to be handled.
    pub async fn shutdown(self) {
        let tasks: Vec<JoinHandle<()>> = self
            .lanes
            .into_values()
            .map(|lane| {
                drop(lane.tx);
                lane.task
            })
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// The lane for `channel`, opened if missing. Opening a lane also prunes closed ones.
    fn lane(&mut self, channel: &str) -> &Lane {
        if !self.lanes.contains_key(channel) {
            self.lanes.retain(|_, lane| !lane.tx.is_closed());
            let lane = spawn_lane(
                self.dispatcher.clone(),
                self.lane_capacity,
                self.lane_idle,
                channel,
            );
            self.lanes.insert(channel.to_string(), lane);
        }
        &self.lanes[channel]
    }
}

fn spawn_lane(dispatcher: Arc<Dispatcher>, capacity: usize, idle: Duration, channel: &str) -> Lane {
    let (tx, mut rx) = mpsc::channel::<Message>(capacity);
    log::debug!("router: opening lane for {}", channel);
    let channel = channel.to_string();
    let task = tokio::spawn(async move {
        loop {
            match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(message)) => handle(&dispatcher, &message).await,
                Ok(None) => break,
                Err(_) => {
                    rx.close();
                    // Anything queued before the close still gets handled.
                    while let Ok(message) = rx.try_recv() {
                        handle(&dispatcher, &message).await;
                    }
                    log::debug!("router: lane for {} idle, closing", channel);
                    break;
                }
            }
        }
    });
    Lane { tx, task }
}

async fn handle(dispatcher: &Dispatcher, message: &Message) {
    let report = dispatcher.handle(message).await;
    log::debug!(
        "router: {} ts={} evaluated={} matched={:?} sent={} failures={}",
        message.channel,
        message.ts,
        report.evaluated,
        report.matched,
        report.sent,
        report.failures
    );
}
