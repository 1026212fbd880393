use chrono::{DateTime, Utc};
use ipcookie_common::Cookie;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Security-relevant detections raised by the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityEventKind {
    /// A verified SETCOOKIE-NOT-EXPECTED: the datagram that made us send
    /// SET-COOKIE to `peer` did not come from `peer`
    SpoofDetected {
        peer: Ipv6Addr,
        /// Hex form of the echoed cookie
        echoed_cookie: String,
    },
}

/// Security event as published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Node that raised the event
    pub node_id: Uuid,
    /// Event timestamp (ISO 8601)
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SecurityEventKind,
}

impl SecurityEvent {
    pub fn spoof_detected(node_id: Uuid, peer: Ipv6Addr, echoed: &Cookie) -> Self {
        Self {
            node_id,
            timestamp: Utc::now(),
            kind: SecurityEventKind::SpoofDetected {
                peer,
                echoed_cookie: echoed.to_string(),
            },
        }
    }
}

/// Fan-out of security events to any number of local subscribers
#[derive(Debug, Clone)]
pub struct EventSink {
    node_id: Uuid,
    sender: broadcast::Sender<SecurityEvent>,
}

impl EventSink {
    pub fn new(node_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { node_id, sender }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscriber is not an error
    pub fn publish(&self, event: SecurityEvent) {
        counter!("ipcookie_security_events", 1);
        match self.sender.send(event) {
            Ok(receivers) => debug!(receivers, "Published security event"),
            Err(_) => debug!("Security event dropped, no subscribers"),
        }
    }

    /// Raise a spoofing detection for `peer`
    pub fn spoof_detected(&self, peer: Ipv6Addr, echoed: &Cookie) {
        warn!(
            peer = %peer,
            echoed_cookie = %echoed,
            "Spoofed datagram detected: peer disowned the traffic we answered with SET-COOKIE"
        );
        counter!("ipcookie_spoof_detected", 1);
        self.publish(SecurityEvent::spoof_detected(self.node_id, peer, echoed));
    }
}
