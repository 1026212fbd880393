//! Send-path controller
//!
//! Before each outbound datagram the shim classifies how long ago the peer's
//! entry was last refreshed, relative to `2^lifetime_log2` and T_RECOVER:
//!
//! ```text
//!   mtime            mtime + 2^lt         mtime + 2^lt + T_RECOVER
//!     |---StillValid----|----RenewTime--------|----PastRenewTime---->
//! ```
//!
//! and then drives the renewal/fallback transitions. Whether the datagram
//! carries a cookie is a pure read of DISABLE_COOKIES afterwards.

use crate::cache::{CacheEntry, PeerCookieCache};
use crate::clock::{Clock, Timestamp};
use crate::config::{CookieConfig, ProtocolConfig};
use crate::shared::SharedHandle;
use ipcookie_common::Cookie;
use ipnet::IpNet;
use metrics::counter;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info};

/// Position of `now` relative to an entry's renewal window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampBand {
    StillValid,
    RenewTime,
    PastRenewTime,
}

/// Timing parameters of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPathParams {
    pub t_recover: u64,
    pub fallback_lt2: u8,
    pub try_lt2: u8,
}

impl From<&ProtocolConfig> for SendPathParams {
    fn from(protocol: &ProtocolConfig) -> Self {
        Self {
            t_recover: protocol.t_recover_seconds,
            fallback_lt2: protocol.fallback_lt2,
            try_lt2: protocol.try_lt2,
        }
    }
}

impl Default for SendPathParams {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

/// What the state machine did to the entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No entry existed; one was created under local policy
    Created { cookies_disabled: bool },
    /// Entry left as is
    Unchanged,
    /// Fallback period over: cookies re-enabled with TRY_LT2
    RetryCookies,
    /// Renewal now awaited; mtime rewound to the start of the renewal window
    RenewalArmed,
    /// Renewal never arrived: cookies disabled for FALLBACK_LT2
    FallbackEntered,
}

/// How the outbound datagram should be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    WithCookie(Cookie),
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendDecision {
    pub transition: Transition,
    pub outbound: Outbound,
}

/// Classify `now` against the entry's lifetime; an infinite lifetime never expires
pub fn classify(entry: &CacheEntry, now: Timestamp, t_recover: u64) -> TimestampBand {
    let Some(lifetime) = entry.lifetime_secs() else {
        return TimestampBand::StillValid;
    };

    let renew_at = entry.mtime().saturating_add(lifetime);
    if now < renew_at {
        TimestampBand::StillValid
    } else if now < renew_at.saturating_add(t_recover) {
        TimestampBand::RenewTime
    } else {
        TimestampBand::PastRenewTime
    }
}

/// Run one evaluation of the renewal/fallback state machine on `entry`
pub fn run_state_machine(entry: &mut CacheEntry, now: Timestamp, params: &SendPathParams) -> Transition {
    let band = classify(entry, now, params.t_recover);

    if entry.is_disable_cookies() {
        return match band {
            TimestampBand::StillValid => Transition::Unchanged,
            TimestampBand::RenewTime | TimestampBand::PastRenewTime => {
                entry.clear_disable_cookies();
                entry.update_mtime(now);
                entry.set_lifetime_log2(params.try_lt2);
                Transition::RetryCookies
            }
        };
    }

    match (band, entry.is_expecting_setcookie()) {
        (TimestampBand::StillValid, _) => Transition::Unchanged,
        (TimestampBand::RenewTime, true) => Transition::Unchanged,
        (TimestampBand::PastRenewTime, true) => {
            entry.set_disable_cookies();
            entry.update_mtime(now);
            entry.set_lifetime_log2(params.fallback_lt2);
            Transition::FallbackEntered
        }
        (TimestampBand::RenewTime, false) | (TimestampBand::PastRenewTime, false) => {
            entry.set_expecting_setcookie();
            entry.backdate_mtime_by_lifetime(now);
            Transition::RenewalArmed
        }
    }
}

/// Attachment decision; reads the entry only
pub fn outbound_for(entry: &CacheEntry) -> Outbound {
    if entry.is_disable_cookies() {
        Outbound::Plain
    } else {
        Outbound::WithCookie(entry.cookie())
    }
}

/// Send-path controller bound to the shared state
pub struct SendPath {
    shared: SharedHandle,
    params: SendPathParams,
    disabled_prefixes: Vec<IpNet>,
    clock: Arc<dyn Clock>,
}

impl SendPath {
    pub fn new(shared: SharedHandle, config: &CookieConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared,
            params: SendPathParams::from(&config.protocol),
            disabled_prefixes: config.policy.parsed_disabled_prefixes(),
            clock,
        }
    }

    /// Local policy: does this host skip cookies for `peer`?
    pub fn policy_disables(&self, peer: &Ipv6Addr) -> bool {
        let addr = IpAddr::V6(*peer);
        self.disabled_prefixes.iter().any(|net| net.contains(&addr))
    }

    /// Decide how to send the next datagram to `peer`
    pub fn prepare(&self, peer: Ipv6Addr) -> SendDecision {
        self.prepare_at(peer, self.clock.now())
    }

    pub fn prepare_at(&self, peer: Ipv6Addr, now: Timestamp) -> SendDecision {
        let existing = evaluate_existing(&mut self.shared.cache(), &peer, now, &self.params);
        if let Some((decision, lifetime_log2)) = existing {
            log_transition(&peer, decision.transition, lifetime_log2);
            return decision;
        }

        // Seed outside the cache lock; the engine and cache locks never nest
        let seed = self.shared.engine().current_cookie(&peer);
        let cookies_disabled = self.policy_disables(&peer);

        let mut cache = self.shared.cache();
        // Another shim may have created it meanwhile; evaluate it under this same guard
        if let Some((decision, lifetime_log2)) = evaluate_existing(&mut cache, &peer, now, &self.params) {
            drop(cache);
            log_transition(&peer, decision.transition, lifetime_log2);
            return decision;
        }

        let entry = cache.insert_new(peer, cookies_disabled, seed, now);
        let outbound = outbound_for(entry);
        drop(cache);

        counter!("ipcookie_entries_created", 1);
        debug!(peer = %peer, cookies_disabled, "New peer on the send path");

        SendDecision {
            transition: Transition::Created { cookies_disabled },
            outbound,
        }
    }
}

/// Run the state machine on `peer`'s entry, if any; returns the decision and
/// the resulting lifetime exponent
fn evaluate_existing(
    cache: &mut PeerCookieCache,
    peer: &Ipv6Addr,
    now: Timestamp,
    params: &SendPathParams,
) -> Option<(SendDecision, u8)> {
    let entry = cache.lookup_mut(peer)?;
    let transition = run_state_machine(entry, now, params);
    let decision = SendDecision {
        transition,
        outbound: outbound_for(entry),
    };
    Some((decision, entry.lifetime_log2()))
}

fn log_transition(peer: &Ipv6Addr, transition: Transition, lifetime_log2: u8) {
    match transition {
        Transition::FallbackEntered => {
            counter!("ipcookie_fallback_entered", 1);
            info!(
                peer = %peer,
                lifetime_log2,
                "No SET-COOKIE within recovery window, sending without cookies"
            );
        }
        Transition::RetryCookies => {
            counter!("ipcookie_fallback_expired", 1);
            info!(peer = %peer, lifetime_log2, "Fallback period over, retrying cookies");
        }
        Transition::RenewalArmed => {
            debug!(peer = %peer, "Cookie renewal due, awaiting SET-COOKIE");
        }
        _ => {}
    }
}
