use crate::error::{CookieError, Result};
use ipcookie_common::{ControlMessage, ICMP6_IPCOOKIES, IPCOOKIES_PACKET_BUF_SIZE};
use metrics::counter;
use pnet::packet::icmpv6::Icmpv6Packet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::Packet;
use pnet::transport::{
    icmpv6_packet_iter, transport_channel, TransportChannelType, TransportProtocol, TransportReceiver,
    TransportSender,
};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outbound side of the ICMPv6 plumbing
///
/// Implementations own framing and checksums; callers hand over a decoded
/// message and the peer it goes to.
pub trait ControlTransport: Send + Sync {
    fn send(&self, dst: Ipv6Addr, msg: &ControlMessage) -> Result<()>;
}

/// Send a control message, logging instead of propagating failures
///
/// Lost control messages are recovered by the renewal/fallback timers, so a
/// failed send never changes protocol state.
pub fn send_best_effort(transport: &dyn ControlTransport, dst: Ipv6Addr, msg: &ControlMessage) -> bool {
    match transport.send(dst, msg) {
        Ok(()) => {
            counter!("ipcookie_control_sent", 1, "code" => code_label(msg));
            debug!(dst = %dst, code = ?msg.code, "Sent control message");
            true
        }
        Err(e) => {
            counter!("ipcookie_control_send_errors", 1);
            warn!(dst = %dst, code = ?msg.code, error = %e, "Failed to send control message");
            false
        }
    }
}

fn code_label(msg: &ControlMessage) -> &'static str {
    match msg.code {
        ipcookie_common::ControlCode::SetCookie => "set_cookie",
        ipcookie_common::ControlCode::SetCookieNotExpected => "setcookie_not_expected",
    }
}

/// Inbound side of the ICMPv6 plumbing
pub trait ControlSource: Send {
    /// Wait up to `timeout` for an IP cookie control message
    ///
    /// Returns the sender and the raw ICMPv6 bytes, or `None` when nothing
    /// relevant arrived in time.
    fn recv(&mut self, timeout: Duration) -> Result<Option<(Ipv6Addr, Vec<u8>)>>;
}

/// Raw ICMPv6 transport sender backed by pnet
///
/// Needs CAP_NET_RAW. The kernel fills in the ICMPv6 checksum for raw
/// ICMPv6 sockets, so messages go out with a zero checksum field.
pub struct Icmp6Transport {
    tx: Mutex<TransportSender>,
}

/// Raw ICMPv6 receiver backed by pnet
pub struct Icmp6Receiver {
    rx: TransportReceiver,
}

/// Open the raw ICMPv6 channel, split into sender and receiver
pub fn open_icmp6_channel() -> Result<(Icmp6Transport, Icmp6Receiver)> {
    let protocol = TransportChannelType::Layer4(TransportProtocol::Ipv6(IpNextHeaderProtocols::Icmpv6));

    let (tx, rx) = transport_channel(IPCOOKIES_PACKET_BUF_SIZE * 4, protocol)
        .map_err(|e| CookieError::Transport(format!("Failed to create ICMPv6 transport channel: {}", e)))?;

    info!("ICMPv6 control transport initialized");
    Ok((Icmp6Transport { tx: Mutex::new(tx) }, Icmp6Receiver { rx }))
}

impl ControlTransport for Icmp6Transport {
    fn send(&self, dst: Ipv6Addr, msg: &ControlMessage) -> Result<()> {
        let wire = msg.encode();
        let packet = Icmpv6Packet::new(&wire)
            .ok_or_else(|| CookieError::Transport("Failed to frame ICMPv6 packet".to_string()))?;

        let mut tx = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tx.send_to(packet, IpAddr::V6(dst))
            .map_err(|e| CookieError::Transport(format!("Failed to send to {}: {}", dst, e)))?;
        Ok(())
    }
}

impl ControlSource for Icmp6Receiver {
    /// Other ICMPv6 types and IPv4 sources are skipped and reported as `None`
    fn recv(&mut self, timeout: Duration) -> Result<Option<(Ipv6Addr, Vec<u8>)>> {
        let mut iter = icmpv6_packet_iter(&mut self.rx);
        let Some((packet, addr)) = iter.next_with_timeout(timeout)? else {
            return Ok(None);
        };

        let IpAddr::V6(source) = addr else {
            return Ok(None);
        };
        let bytes = packet.packet();
        if bytes.first() != Some(&ICMP6_IPCOOKIES) {
            return Ok(None);
        }
        Ok(Some((source, bytes.to_vec())))
    }
}

/// In-memory transport that records every message it is asked to send
///
/// Used to wire daemons and shims together without raw sockets.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(Ipv6Addr, ControlMessage)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every message sent so far
    pub fn drain(&self) -> Vec<(Ipv6Addr, ControlMessage)> {
        let mut sent = match self.sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *sent)
    }
}

impl ControlTransport for MemoryTransport {
    fn send(&self, dst: Ipv6Addr, msg: &ControlMessage) -> Result<()> {
        let mut sent = match self.sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        sent.push((dst, *msg));
        Ok(())
    }
}
