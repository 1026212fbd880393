//! Control-message daemon
//!
//! Consumes inbound SET-COOKIE and SETCOOKIE-NOT-EXPECTED messages, updates
//! the shared cache and raises spoofing detections.

use crate::clock::Clock;
use crate::config::CookieConfig;
use crate::events::EventSink;
use crate::shared::SharedHandle;
use crate::shutdown::ShutdownSignal;
use crate::transport::{send_best_effort, ControlSource, ControlTransport};
use governor::{clock::DefaultClock, state::direct::NotKeyed, state::InMemoryState, Quota, RateLimiter};
use ipcookie_common::{ControlCode, ControlMessage, Cookie, LIFETIME_LOG2_INFINITE};
use metrics::counter;
use std::net::Ipv6Addr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type LogLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// What the daemon did with one control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// SET-COOKIE from a peer we have no entry for
    RepliedNotExpected,
    /// SET-COOKIE whose echo does not match what we send to that peer
    DiscardedStaleEcho,
    /// Entry took the requested cookie and lifetime
    CookieUpdated,
    /// Verified disowning of traffic sent in the peer's name
    SpoofDetected,
    /// SETCOOKIE-NOT-EXPECTED whose echo is not one of our cookies
    DiscardedForged,
    /// Bytes did not decode as a control message
    DiscardedMalformed,
}

pub struct ControlHandler {
    shared: SharedHandle,
    transport: Arc<dyn ControlTransport>,
    events: EventSink,
    clock: Arc<dyn Clock>,
    forged_log_limiter: LogLimiter,
}

impl ControlHandler {
    pub fn new(
        shared: SharedHandle,
        config: &CookieConfig,
        transport: Arc<dyn ControlTransport>,
        events: EventSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let per_minute = NonZeroU32::new(config.daemon.forged_log_per_minute).unwrap_or(NonZeroU32::MIN);

        Self {
            shared,
            transport,
            events,
            clock,
            forged_log_limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
        }
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Decode and handle a raw ICMPv6 control message from `from`
    pub fn handle_datagram(&self, from: Ipv6Addr, bytes: &[u8]) -> HandleOutcome {
        match ControlMessage::decode(bytes) {
            Ok(msg) => self.handle(from, &msg),
            Err(e) => {
                counter!("ipcookie_control_malformed", 1);
                debug!(from = %from, error = %e, len = bytes.len(), "Discarding malformed control message");
                HandleOutcome::DiscardedMalformed
            }
        }
    }

    pub fn handle(&self, from: Ipv6Addr, msg: &ControlMessage) -> HandleOutcome {
        counter!("ipcookie_control_received", 1);
        match msg.code {
            ControlCode::SetCookie => self.handle_set_cookie(from, msg),
            ControlCode::SetCookieNotExpected => self.handle_not_expected(from, &msg.echoed_cookie),
        }
    }

    fn handle_set_cookie(&self, from: Ipv6Addr, msg: &ControlMessage) -> HandleOutcome {
        let now = self.clock.now();

        let outcome = {
            let mut cache = self.shared.cache();
            match cache.lookup_mut(&from) {
                None => HandleOutcome::RepliedNotExpected,
                Some(entry) if !entry.cookie().ct_eq(&msg.echoed_cookie) => HandleOutcome::DiscardedStaleEcho,
                Some(entry) => {
                    entry.set_cookie(msg.requested_cookie);
                    entry.set_lifetime_log2(granted_lifetime_log2(entry.is_disable_cookies(), msg.lifetime_log2));
                    entry.update_mtime(now);
                    entry.clear_expecting_setcookie();
                    HandleOutcome::CookieUpdated
                }
            }
        };

        match outcome {
            HandleOutcome::RepliedNotExpected => {
                debug!(from = %from, "SET-COOKIE for traffic we never sent, disowning it");
                let reply = ControlMessage::not_expected(msg.echoed_cookie);
                send_best_effort(self.transport.as_ref(), from, &reply);
            }
            HandleOutcome::DiscardedStaleEcho => {
                counter!("ipcookie_setcookie_stale", 1);
                debug!(from = %from, "SET-COOKIE echo does not match our cookie, discarding");
            }
            HandleOutcome::CookieUpdated => {
                counter!("ipcookie_setcookie_applied", 1);
                debug!(from = %from, lifetime_log2 = msg.lifetime_log2, "Cookie updated from SET-COOKIE");
            }
            _ => {}
        }

        outcome
    }

    fn handle_not_expected(&self, from: Ipv6Addr, echoed: &Cookie) -> HandleOutcome {
        let genuine = self.shared.engine().verify(echoed, &from);

        if genuine {
            self.events.spoof_detected(from, echoed);
            return HandleOutcome::SpoofDetected;
        }

        counter!("ipcookie_not_expected_forged", 1);
        if self.forged_log_limiter.check().is_ok() {
            warn!(from = %from, "Discarding SETCOOKIE-NOT-EXPECTED with a cookie we never issued");
        }
        HandleOutcome::DiscardedForged
    }
}

/// Lifetime exponent to store for a peer's SET-COOKIE
///
/// The 0xF sentinel is reserved for entries that send without cookies. An
/// entry that attaches cookies keeps a timed lifetime so it still renews and
/// can still detect blackholing.
fn granted_lifetime_log2(disable_cookies: bool, requested: u8) -> u8 {
    if !disable_cookies && requested >= LIFETIME_LOG2_INFINITE {
        LIFETIME_LOG2_INFINITE - 1
    } else {
        requested
    }
}

/// Run the receive loop on a blocking thread until shutdown
///
/// `timeout` bounds how long a shutdown request can go unnoticed.
pub fn spawn_receive_loop<S>(
    handler: Arc<ControlHandler>,
    mut source: S,
    timeout: Duration,
    shutdown: ShutdownSignal,
) -> JoinHandle<()>
where
    S: ControlSource + 'static,
{
    tokio::task::spawn_blocking(move || {
        info!("Control message receive loop started");
        while !shutdown.is_shutdown_requested() {
            match source.recv(timeout) {
                Ok(Some((from, bytes))) => {
                    let outcome = handler.handle_datagram(from, &bytes);
                    debug!(from = %from, outcome = ?outcome, "Handled control message");
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Error receiving control message");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        info!("Control message receive loop stopped");
    })
}
