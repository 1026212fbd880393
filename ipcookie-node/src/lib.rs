//! IP cookie node library
//!
//! Anti-spoofing with IPv6 cookies: the shim attaches per-peer cookies to
//! outbound datagrams and verifies inbound ones, while the daemon handles the
//! ICMPv6 control messages that distribute cookies and disown spoofed traffic.

pub mod cache;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod events;
pub mod secret;
pub mod shared;
pub mod shim;
pub mod shutdown;
pub mod transport;

// Re-export commonly used types
pub use cache::{CacheEntry, PeerCookieCache};
pub use clock::{Clock, ManualClock, MonotonicClock, Timestamp};
pub use config::{CookieConfig, UnmarkedPolicy};
pub use daemon::{ControlHandler, HandleOutcome};
pub use engine::{StatelessEngine, Verification};
pub use error::{CookieError, Result};
pub use events::{EventSink, SecurityEvent, SecurityEventKind};
pub use shared::{SharedHandle, SharedState};
pub use shim::{Inbound, Outbound, SendDecision, Shim, Transition};
pub use shutdown::ShutdownSignal;
pub use transport::{ControlSource, ControlTransport, MemoryTransport};

