//! # Portcullis
//!
//! A multi-protocol forwarding proxy: SOCKS5 in front, rule-based dispatch
//! in the middle, composable transports underneath.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Downstream servers (SOCKS5, plain or simplified)       │
//! ├─────────────────────────────────────────────────────────┤
//! │  Dispatcher (rule matcher → upstream selection)         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Upstream clients (SOCKS5 / HTTP CONNECT / direct TCP)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Transport stack (compression ∘ TLS ∘ TCP|KCP|proxied)  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Each accepted proxy request is matched against the rule set by target
//! address (longest-prefix for IPs, anchored regular expressions for domain
//! names), dispatched to one of the rule's upstreams, and relayed until
//! either side closes.
//!
//! ## Design Goals
//!
//! 1. **Composability**: transports stack inside-out from a reliable inner
//!    layer (TCP, KCP-style UDP, or another proxy hop), through optional
//!    TLS, to optional streaming compression on the outside
//! 2. **Identity**: TLS peer certificates and SOCKS5 credentials surface as
//!    uniform peer identifiers on every hop
//! 3. **Predictability**: immutable routing state after startup, bounded
//!    connect/handshake timeouts, prompt teardown on cancellation

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod addr;
pub mod app;
pub mod bufpool;
pub mod config;
pub mod error;
pub mod matcher;
pub mod proxy;
pub mod relay;
pub mod transport;

pub use addr::{Address, PeerIdentifier};
pub use app::App;
pub use config::Config;
pub use error::{Error, ProxyError, ProxyErrorKind, Result};

/// Version string reported by the HTTP CONNECT client and the binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Product identifier used as the HTTP `User-Agent`.
pub fn user_agent() -> String {
    format!(
        "portcullis/{} ({}; {})",
        VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Default timeout for establishing an upstream connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;

/// Buffer size used by each relay direction.
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_format() {
        let ua = user_agent();
        assert!(ua.starts_with("portcullis/"));
        assert!(ua.contains(std::env::consts::OS));
    }
}
