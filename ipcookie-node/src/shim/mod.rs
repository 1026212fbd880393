//! Per-application shim: the send-path controller and receive-path verifier
//! bound to one attached shared state.

pub mod receive;
pub mod send;

pub use receive::{Inbound, ReceivePath};
pub use send::{Outbound, SendDecision, SendPath, Transition};

use crate::clock::Clock;
use crate::config::CookieConfig;
use crate::shared::SharedHandle;
use crate::transport::ControlTransport;
use std::sync::Arc;

pub struct Shim {
    pub send: SendPath,
    pub receive: ReceivePath,
}

impl Shim {
    /// Attach a shim to existing shared state
    pub fn attach(
        shared: SharedHandle,
        config: &CookieConfig,
        transport: Arc<dyn ControlTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            send: SendPath::new(Arc::clone(&shared), config, clock),
            receive: ReceivePath::new(shared, config, transport),
        }
    }
}
