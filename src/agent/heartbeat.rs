use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{InboundMessage, MessageBus, INTERNAL_CHANNEL};

pub const CONSOLIDATION_CHAT: &str = "internal_memory";
pub const CONSOLIDATION_REQUEST: &str = "[SYSTEM CONSOLIDATION REQUEST]\n\
Read the recent HISTORY.md file. \n\
Extract any core facts, user preferences, projects, or entity relationships.\n\
Update MEMORY.md and specific ENTITIES/*.md files.\n\
You MUST be concise. Do not chat. Only use tools to read and write.";

/// Set while a consolidation turn is queued or running. The heartbeat opens
/// it, the agent closes it when the turn ends.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationGate(Arc<AtomicBool>);

impl ConsolidationGate {
    pub fn in_flight(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn try_begin(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn finish(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Closes the gate when dropped, however the turn ends.
    pub(crate) fn finish_on_drop(&self) -> FinishOnDrop<'_> {
        FinishOnDrop(self)
    }
}

pub(crate) struct FinishOnDrop<'a>(&'a ConsolidationGate);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Periodically posts a consolidation request on the internal channel. The
/// first request goes out as soon as `run` starts. A tick that lands while
/// the previous consolidation is still running is skipped.
pub struct Heartbeat {
    bus: MessageBus,
    interval: Duration,
    gate: ConsolidationGate,
}

impl Heartbeat {
    pub fn new(bus: MessageBus, interval: Duration, gate: ConsolidationGate) -> Self {
        Self {
            bus,
            interval,
            gate,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Heartbeat started (every {}s)", self.interval.as_secs());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.beat().await;
                }
            }
        }
        info!("Heartbeat stopped");
    }

    /// Returns false when the tick was skipped.
    pub async fn beat(&self) -> bool {
        if !self.gate.try_begin() {
            debug!("Heartbeat skipped: previous consolidation still running");
            return false;
        }
        info!("💓 Heartbeat: requesting memory consolidation");
        let msg = InboundMessage::new(
            INTERNAL_CHANNEL,
            "system",
            CONSOLIDATION_CHAT,
            CONSOLIDATION_REQUEST,
        );
        self.bus.send_inbound(msg).await;
        true
    }
}
