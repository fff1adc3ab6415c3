//! Upstream Sink
//!
//! Fire-and-forget delivery of usage reports and session releases to the
//! session orchestration layer. Implementations own their delivery retries.

use mob5g_pfcp::types::{NodeId, UsageReport};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::assoc::ReleaseReason;

/// Usage report forwarded upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub session_id: u64,
    pub node_id: NodeId,
    pub volume: u64,
    pub duration_ms: u64,
}

impl UsageRecord {
    pub fn new(session_id: u64, node_id: NodeId, report: UsageReport) -> Self {
        Self {
            session_id,
            node_id,
            volume: report.volume,
            duration_ms: report.duration_ms,
        }
    }
}

/// Event emitted towards the upstream collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpstreamEvent {
    UsageReport(UsageRecord),
    SessionReleased { seid: u64, reason: ReleaseReason },
}

/// Upstream collaborator; calls must return without waiting on delivery
pub trait UpstreamSink: Send + Sync {
    fn usage_report(&self, record: UsageRecord);

    fn session_released(&self, seid: u64, reason: ReleaseReason);
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl UpstreamSink for LogSink {
    fn usage_report(&self, record: UsageRecord) {
        log::info!(
            "[{:#x}] Usage report from {}: volume={} duration={}ms",
            record.session_id,
            record.node_id,
            record.volume,
            record.duration_ms
        );
    }

    fn session_released(&self, seid: u64, reason: ReleaseReason) {
        log::info!("[{seid:#x}] Session released ({reason:?})");
    }
}

/// Sink forwarding every event into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UpstreamEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UpstreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: UpstreamEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("Upstream channel closed, event dropped");
        }
    }
}

impl UpstreamSink for ChannelSink {
    fn usage_report(&self, record: UsageRecord) {
        self.forward(UpstreamEvent::UsageReport(record));
    }

    fn session_released(&self, seid: u64, reason: ReleaseReason) {
        self.forward(UpstreamEvent::SessionReleased { seid, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = UpstreamEvent::UsageReport(UsageRecord::new(
            7,
            NodeId::new("upf-1"),
            UsageReport::new(1500, 2000),
        ));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "usage_report");
        assert_eq!(json["session_id"], 7);
        assert_eq!(json["node_id"], "upf-1");
        assert_eq!(json["volume"], 1500);

        let released = UpstreamEvent::SessionReleased {
            seid: 7,
            reason: ReleaseReason::HeartbeatFailure,
        };
        let json = serde_json::to_value(&released).unwrap();
        assert_eq!(json["event"], "session_released");
        assert_eq!(json["reason"], "heartbeat_failure");
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelSink::new();
        sink.session_released(3, ReleaseReason::Local);
        assert_eq!(
            rx.recv().await,
            Some(UpstreamEvent::SessionReleased {
                seid: 3,
                reason: ReleaseReason::Local
            })
        );

        drop(rx);
        // Closed channel is not an error for the caller
        sink.usage_report(UsageRecord::new(3, NodeId::new("upf-1"), UsageReport::default()));
    }
}
