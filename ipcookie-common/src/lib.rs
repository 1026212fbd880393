// IP Cookies Common - Shared types between the cookie daemon and the shim
// This crate is no_std compatible so it can sit on any packet path

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::fmt;
use subtle::ConstantTimeEq;

/// ICMPv6 type carrying the IP cookie control messages
pub const ICMP6_IPCOOKIES: u8 = 0x42;

/// Control message codes
pub const ICMP6_IC_SET_COOKIE: u8 = 0x01;
pub const ICMP6_IC_SETCOOKIE_NOT_EXPECTED: u8 = 0x02;

/// Size of the cookie in bytes (96 bits)
pub const COOKIE_LEN: usize = 12;

/// Size of the control message on the wire: 8 byte ICMPv6 header plus two cookies
pub const IPCOOKIES_ICMP_SIZE: usize = 8 + 2 * COOKIE_LEN;

/// Mask for the lt_log2 nibble in the first data byte
pub const LT_LOG2_MASK: u8 = 0x0F;

/// lifetime_log2 sentinel meaning "no renewal expected"
pub const LIFETIME_LOG2_INFINITE: u8 = 0xF;

/// Receive buffer size used by the packet plumbing
pub const IPCOOKIES_PACKET_BUF_SIZE: usize = 1500;

const OFFSET_TYPE: usize = 0;
const OFFSET_CODE: usize = 1;
const OFFSET_LT_LOG2: usize = 4;
const OFFSET_ECHOED: usize = 8;
const OFFSET_REQUESTED: usize = OFFSET_ECHOED + COOKIE_LEN;

/// Opaque 96-bit cookie
///
/// Only ever compared for byte equality. Comparison runs in constant time so a
/// forged echo cannot be refined byte by byte.
#[repr(C)]
#[derive(Clone, Copy, Default, Eq)]
pub struct Cookie([u8; COOKIE_LEN]);

impl Cookie {
    pub const ZERO: Cookie = Cookie([0u8; COOKIE_LEN]);

    pub const fn new(bytes: [u8; COOKIE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LEN] {
        &self.0
    }

    /// Build a cookie from the first 12 bytes of a slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; COOKIE_LEN] = bytes.get(..COOKIE_LEN)?.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn ct_eq(&self, other: &Cookie) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl PartialEq for Cookie {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(other)
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Control message code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    SetCookie,
    SetCookieNotExpected,
}

impl ControlCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            ICMP6_IC_SET_COOKIE => Some(Self::SetCookie),
            ICMP6_IC_SETCOOKIE_NOT_EXPECTED => Some(Self::SetCookieNotExpected),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::SetCookie => ICMP6_IC_SET_COOKIE,
            Self::SetCookieNotExpected => ICMP6_IC_SETCOOKIE_NOT_EXPECTED,
        }
    }
}

/// Reasons a received control message is rejected by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Fewer than 32 bytes
    Truncated(usize),
    /// ICMPv6 type is not ICMP6_IPCOOKIES
    WrongType(u8),
    /// Code is neither SET_COOKIE nor SETCOOKIE_NOT_EXPECTED
    UnknownCode(u8),
    /// One of the 28 reserved bits is non-zero
    ReservedBitsSet,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Truncated(len) => write!(
                f,
                "control message truncated: {} bytes, need {}",
                len, IPCOOKIES_ICMP_SIZE
            ),
            WireError::WrongType(t) => write!(f, "unexpected ICMPv6 type {:#04x}", t),
            WireError::UnknownCode(c) => write!(f, "unknown control message code {:#04x}", c),
            WireError::ReservedBitsSet => write!(f, "reserved bits set in control message"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for WireError {}

/// SET-COOKIE / SETCOOKIE-NOT-EXPECTED message body
///
/// Layout (network byte order):
///
/// ```text
/// 0: type   1: code   2..4: checksum
/// 4: rsvd(4) | lt_log2(4), then 24 reserved bits
/// 8..20:  echoed cookie
/// 20..32: requested cookie
/// ```
///
/// The checksum is owned by the ICMPv6 layer: it is written as zero and
/// ignored on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub code: ControlCode,
    pub lifetime_log2: u8,
    pub echoed_cookie: Cookie,
    pub requested_cookie: Cookie,
}

impl ControlMessage {
    pub fn set_cookie(lifetime_log2: u8, echoed_cookie: Cookie, requested_cookie: Cookie) -> Self {
        Self {
            code: ControlCode::SetCookie,
            lifetime_log2: lifetime_log2 & LT_LOG2_MASK,
            echoed_cookie,
            requested_cookie,
        }
    }

    pub fn not_expected(echoed_cookie: Cookie) -> Self {
        Self {
            code: ControlCode::SetCookieNotExpected,
            lifetime_log2: 0,
            echoed_cookie,
            requested_cookie: Cookie::ZERO,
        }
    }

    pub fn encode(&self) -> [u8; IPCOOKIES_ICMP_SIZE] {
        let mut buf = [0u8; IPCOOKIES_ICMP_SIZE];
        buf[OFFSET_TYPE] = ICMP6_IPCOOKIES;
        buf[OFFSET_CODE] = self.code.as_u8();
        // checksum (bytes 2..4) stays zero
        buf[OFFSET_LT_LOG2] = self.lifetime_log2 & LT_LOG2_MASK;
        buf[OFFSET_ECHOED..OFFSET_REQUESTED].copy_from_slice(self.echoed_cookie.as_bytes());
        buf[OFFSET_REQUESTED..].copy_from_slice(self.requested_cookie.as_bytes());
        buf
    }

    /// Decode a control message, ignoring anything past byte 32
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < IPCOOKIES_ICMP_SIZE {
            return Err(WireError::Truncated(buf.len()));
        }
        if buf[OFFSET_TYPE] != ICMP6_IPCOOKIES {
            return Err(WireError::WrongType(buf[OFFSET_TYPE]));
        }
        let code = ControlCode::from_u8(buf[OFFSET_CODE])
            .ok_or(WireError::UnknownCode(buf[OFFSET_CODE]))?;

        let lt_byte = buf[OFFSET_LT_LOG2];
        if lt_byte & !LT_LOG2_MASK != 0 || buf[OFFSET_LT_LOG2 + 1..OFFSET_ECHOED].iter().any(|b| *b != 0) {
            return Err(WireError::ReservedBitsSet);
        }

        let echoed_cookie =
            Cookie::from_slice(&buf[OFFSET_ECHOED..OFFSET_REQUESTED]).ok_or(WireError::Truncated(buf.len()))?;
        let requested_cookie = Cookie::from_slice(&buf[OFFSET_REQUESTED..IPCOOKIES_ICMP_SIZE])
            .ok_or(WireError::Truncated(buf.len()))?;

        Ok(Self {
            code,
            lifetime_log2: lt_byte & LT_LOG2_MASK,
            echoed_cookie,
            requested_cookie,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(fill: u8) -> Cookie {
        Cookie::new([fill; COOKIE_LEN])
    }

    #[test]
    fn test_set_cookie_layout() {
        let msg = ControlMessage::set_cookie(6, cookie(0xAA), cookie(0xBB));
        let wire = msg.encode();

        assert_eq!(wire.len(), 32);
        assert_eq!(wire[0], 0x42);
        assert_eq!(wire[1], 0x01);
        assert_eq!(&wire[2..4], &[0, 0]);
        assert_eq!(wire[4], 6);
        assert_eq!(&wire[5..8], &[0, 0, 0]);
        assert_eq!(&wire[8..20], &[0xAA; 12]);
        assert_eq!(&wire[20..32], &[0xBB; 12]);

        assert_eq!(ControlMessage::decode(&wire), Ok(msg));
    }

    #[test]
    fn test_lifetime_is_masked_to_a_nibble() {
        let msg = ControlMessage::set_cookie(0x3F, Cookie::ZERO, Cookie::ZERO);
        assert_eq!(msg.lifetime_log2, 0x0F);
        assert_eq!(msg.encode()[4], 0x0F);
    }

    #[test]
    fn test_not_expected_zeroes_requested() {
        let msg = ControlMessage::not_expected(cookie(7));
        let wire = msg.encode();
        assert_eq!(wire[1], 0x02);
        assert_eq!(&wire[20..32], &[0u8; 12]);
        let decoded = ControlMessage::decode(&wire).unwrap();
        assert_eq!(decoded.code, ControlCode::SetCookieNotExpected);
        assert_eq!(decoded.echoed_cookie, cookie(7));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        let wire = ControlMessage::set_cookie(3, cookie(1), cookie(2)).encode();

        assert_eq!(ControlMessage::decode(&wire[..31]), Err(WireError::Truncated(31)));
        assert_eq!(ControlMessage::decode(&[]), Err(WireError::Truncated(0)));

        let mut bad_type = wire;
        bad_type[0] = 0x80;
        assert_eq!(ControlMessage::decode(&bad_type), Err(WireError::WrongType(0x80)));

        let mut bad_code = wire;
        bad_code[1] = 0x09;
        assert_eq!(ControlMessage::decode(&bad_code), Err(WireError::UnknownCode(0x09)));

        let mut high_nibble = wire;
        high_nibble[4] = 0x13;
        assert_eq!(ControlMessage::decode(&high_nibble), Err(WireError::ReservedBitsSet));

        let mut reserved = wire;
        reserved[7] = 1;
        assert_eq!(ControlMessage::decode(&reserved), Err(WireError::ReservedBitsSet));
    }

    #[test]
    fn test_decode_ignores_checksum_and_trailing_bytes() {
        let msg = ControlMessage::set_cookie(8, cookie(3), cookie(4));
        let mut long = [0u8; 40];
        long[..32].copy_from_slice(&msg.encode());
        long[2] = 0xDE;
        long[3] = 0xAD;
        long[35] = 0xFF;
        assert_eq!(ControlMessage::decode(&long), Ok(msg));
    }

    #[test]
    fn test_cookie_equality_is_bytewise() {
        let mut bytes = [0x11; COOKIE_LEN];
        let a = Cookie::new(bytes);
        bytes[11] = 0x12;
        let b = Cookie::new(bytes);
        assert_eq!(a, a);
        assert_ne!(a, b);
        assert!(Cookie::from_slice(&[0u8; 11]).is_none());
    }
}
