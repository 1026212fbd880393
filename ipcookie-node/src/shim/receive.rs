//! Receive-path verifier
//!
//! Checks the cookie carried by an inbound datagram against the stateless
//! engine. A failed check drops the datagram and answers its claimed source
//! with SET-COOKIE, so a legitimate peer learns the right cookie and a peer
//! whose address was spoofed can disown the traffic.

use crate::config::{CookieConfig, UnmarkedPolicy};
use crate::engine::Verification;
use crate::shared::SharedHandle;
use crate::transport::{send_best_effort, ControlTransport};
use ipcookie_common::{ControlMessage, Cookie};
use metrics::counter;
use std::net::Ipv6Addr;
use std::sync::Arc;
use tracing::debug;

/// Verdict for an inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Accept,
    Reject,
}

pub struct ReceivePath {
    shared: SharedHandle,
    transport: Arc<dyn ControlTransport>,
    setcookie_lifetime_log2: u8,
    unmarked: UnmarkedPolicy,
}

impl ReceivePath {
    pub fn new(shared: SharedHandle, config: &CookieConfig, transport: Arc<dyn ControlTransport>) -> Self {
        Self {
            shared,
            transport,
            setcookie_lifetime_log2: config.protocol.setcookie_lifetime_log2,
            unmarked: config.policy.unmarked_traffic,
        }
    }

    /// Verify an inbound datagram from `source` carrying `cookie`, if any
    pub fn inspect(&self, source: Ipv6Addr, cookie: Option<Cookie>) -> Inbound {
        let Some(cookie) = cookie else {
            counter!("ipcookie_unmarked_received", 1);
            return match self.unmarked {
                UnmarkedPolicy::Pass => Inbound::Accept,
                UnmarkedPolicy::Drop => Inbound::Reject,
            };
        };

        let (verification, current) = {
            let engine = self.shared.engine();
            let verification = engine.check(&cookie, &source);
            let current = match verification {
                Verification::Current => None,
                Verification::Previous | Verification::Invalid => Some(engine.current_cookie(&source)),
            };
            (verification, current)
        };

        // Engine guard released; sending happens lock-free
        let reply = current.map(|requested| ControlMessage::set_cookie(self.setcookie_lifetime_log2, cookie, requested));

        match verification {
            Verification::Current => {
                counter!("ipcookie_cookies_accepted", 1);
                Inbound::Accept
            }
            Verification::Previous => {
                counter!("ipcookie_cookies_accepted", 1);
                counter!("ipcookie_cookies_renewed", 1);
                debug!(source = %source, "Cookie from previous secret, offering renewal");
                self.reply(source, reply);
                Inbound::Accept
            }
            Verification::Invalid => {
                counter!("ipcookie_cookies_rejected", 1);
                debug!(source = %source, cookie = %cookie, "Invalid cookie, answering with SET-COOKIE");
                self.reply(source, reply);
                Inbound::Reject
            }
        }
    }

    fn reply(&self, source: Ipv6Addr, reply: Option<ControlMessage>) {
        if let Some(msg) = reply {
            if send_best_effort(self.transport.as_ref(), source, &msg) {
                counter!("ipcookie_setcookie_sent", 1);
            }
        }
    }
}
