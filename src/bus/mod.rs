use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const INTERNAL_CHANNEL: &str = "internal";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub message_id: Option<i64>,
    pub content: String,
    pub reply_to: Option<String>,
    pub media: Vec<String>,
}

impl InboundMessage {
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    pub fn is_internal(&self) -> bool {
        self.channel == INTERNAL_CHANNEL
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub reply_to_message_id: Option<i64>,
    pub content: String,
    pub files: Vec<PathBuf>,
}

impl OutboundMessage {
    pub fn text(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }
}

/// Handles one inbound message to completion.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, msg: InboundMessage, cancel: CancellationToken);
}

/// Delivers outbound messages for one channel.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    fn channel(&self) -> &str;
    async fn deliver(&self, msg: OutboundMessage) -> Result<()>;
}

/// Producer side of the bus. Cloning is cheap; sends block when the queue is
/// full.
#[derive(Debug, Clone)]
pub struct MessageBus {
    inbound: mpsc::Sender<InboundMessage>,
    outbound: mpsc::Sender<OutboundMessage>,
}

pub struct BusReceiver {
    inbound: mpsc::Receiver<InboundMessage>,
    outbound: mpsc::Receiver<OutboundMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> (Self, BusReceiver) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        (
            Self {
                inbound: inbound_tx,
                outbound: outbound_tx,
            },
            BusReceiver {
                inbound: inbound_rx,
                outbound: outbound_rx,
            },
        )
    }

    pub async fn send_inbound(&self, msg: InboundMessage) {
        if self.inbound.send(msg).await.is_err() {
            warn!("Inbound queue closed, message dropped");
        }
    }

    pub async fn send_outbound(&self, msg: OutboundMessage) {
        if self.outbound.send(msg).await.is_err() {
            warn!("Outbound queue closed, message dropped");
        }
    }
}

impl BusReceiver {
    pub async fn recv_inbound(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }

    pub async fn recv_outbound(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }
}

pub struct Dispatcher {
    receiver: BusReceiver,
    handler: Arc<dyn InboundHandler>,
    sinks: HashMap<String, Arc<dyn OutboundSink>>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(receiver: BusReceiver, handler: Arc<dyn InboundHandler>) -> Self {
        Self {
            receiver,
            handler,
            sinks: HashMap::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn OutboundSink>) {
        self.sinks.insert(sink.channel().to_string(), sink);
    }

    /// Tracker for the per-message conversation tasks. Await `wait()` after
    /// `run` returns to drain in-flight turns.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Message dispatcher started ({} sink(s))", self.sinks.len());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(msg) = self.receiver.inbound.recv() => {
                    info!(
                        "Received message from {} (chat {} via {})",
                        msg.sender_id, msg.chat_id, msg.channel
                    );
                    let handler = self.handler.clone();
                    let turn_cancel = cancel.child_token();
                    self.tracker.spawn(async move {
                        handler.handle(msg, turn_cancel).await;
                    });
                }
                Some(msg) = self.receiver.outbound.recv() => {
                    self.route(msg).await;
                }
                else => break,
            }
        }

        self.tracker.close();
        info!("Message dispatcher stopped ({} turn(s) still running)", self.tracker.len());
    }

    async fn route(&self, msg: OutboundMessage) {
        match self.sinks.get(&msg.channel) {
            Some(sink) => {
                debug!("Delivering message to {} chat {}", msg.channel, msg.chat_id);
                let channel = msg.channel.clone();
                if let Err(e) = sink.deliver(msg).await {
                    error!("Failed to deliver {} message: {}", channel, e);
                }
            }
            None => debug!("No sink for channel '{}', message dropped", msg.channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{Mutex, Notify};

    struct Echo {
        bus: MessageBus,
    }

    #[async_trait]
    impl InboundHandler for Echo {
        async fn handle(&self, msg: InboundMessage, _cancel: CancellationToken) {
            let reply = format!("echo: {}", msg.content);
            self.bus
                .send_outbound(OutboundMessage::text(&msg.channel, &msg.chat_id, &reply))
                .await;
        }
    }

    /// Holds "slow" messages until released; answers everything else at once.
    struct Gated {
        bus: MessageBus,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl InboundHandler for Gated {
        async fn handle(&self, msg: InboundMessage, _cancel: CancellationToken) {
            if msg.content == "slow" {
                self.release.notified().await;
            }
            self.bus
                .send_outbound(OutboundMessage::text(&msg.channel, &msg.chat_id, &msg.content))
                .await;
        }
    }

    async fn wait_for(sink: &Collect, count: usize) {
        for _ in 0..200 {
            if sink.seen.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl OutboundSink for Collect {
        fn channel(&self) -> &str {
            "chat"
        }

        async fn deliver(&self, msg: OutboundMessage) -> Result<()> {
            self.seen.lock().await.push(msg);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatcher_round_trips_through_handler_and_sink() {
        let (bus, receiver) = MessageBus::new(8);
        let sink = Arc::new(Collect::default());
        let mut dispatcher = Dispatcher::new(receiver, Arc::new(Echo { bus: bus.clone() }));
        dispatcher.add_sink(sink.clone());

        let cancel = CancellationToken::new();
        let run = tokio::spawn(dispatcher.run(cancel.clone()));

        bus.send_inbound(InboundMessage::new("chat", "u1", "42", "hi")).await;
        bus.send_outbound(OutboundMessage::text("elsewhere", "1", "dropped"))
            .await;

        for _ in 0..50 {
            if !sink.seen.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        run.await.unwrap();

        let seen = sink.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].chat_id, "42");
        assert_eq!(seen[0].content, "echo: hi");
    }

    #[tokio::test]
    async fn a_slow_turn_does_not_hold_up_the_next_message() {
        let (bus, receiver) = MessageBus::new(8);
        let sink = Arc::new(Collect::default());
        let release = Arc::new(Notify::new());
        let handler = Arc::new(Gated {
            bus: bus.clone(),
            release: release.clone(),
        });
        let mut dispatcher = Dispatcher::new(receiver, handler);
        dispatcher.add_sink(sink.clone());
        let tracker = dispatcher.tracker();

        let cancel = CancellationToken::new();
        let run = tokio::spawn(dispatcher.run(cancel.clone()));

        bus.send_inbound(InboundMessage::new("chat", "u1", "1", "slow")).await;
        bus.send_inbound(InboundMessage::new("chat", "u2", "2", "fast")).await;

        wait_for(&sink, 1).await;
        {
            let seen = sink.seen.lock().await;
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].content, "fast");
        }
        assert!(!tracker.is_empty());

        release.notify_one();
        wait_for(&sink, 2).await;
        assert_eq!(sink.seen.lock().await[1].content, "slow");

        cancel.cancel();
        run.await.unwrap();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let (bus, mut receiver) = MessageBus::new(1);
        bus.send_inbound(InboundMessage::new("chat", "u", "1", "first")).await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            bus.send_inbound(InboundMessage::new("chat", "u", "1", "second")),
        )
        .await;
        assert!(blocked.is_err(), "second send should wait for capacity");

        assert_eq!(receiver.recv_inbound().await.unwrap().content, "first");
        bus.send_inbound(InboundMessage::new("chat", "u", "1", "third")).await;
        assert_eq!(receiver.recv_inbound().await.unwrap().content, "third");
    }
}
