//! Error types for the proxy engine.

use thiserror::Error;

use crate::addr::Address;

/// Result type alias for portcullis operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the proxy engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error detected during construction
    #[error("configuration error: {0}")]
    Config(String),

    /// Protocol violation on a proxy or transport wire
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer sent an address we cannot represent or forward
    #[error("unsupported address: {0}")]
    Addr(String),

    /// Authentication failed or was refused
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Operation did not complete within its deadline
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// The connection was closed by the peer or the keepalive manager
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new unsupported-address error
    pub fn addr(msg: impl Into<String>) -> Self {
        Error::Addr(msg.into())
    }

    /// Create a new TLS error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Check whether this error marks an address-shape problem.
    ///
    /// Address-shape problems map to [`ProxyErrorKind::AddrUnsupported`]
    /// when they cross the proxy boundary.
    pub fn is_addr_error(&self) -> bool {
        matches!(self, Error::Addr(_))
    }
}

/// Proxy error codes. The numeric values are bit-exact SOCKS5 reply codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorKind {
    /// Handshake protocol failure, auth failure, framing violation
    GeneralErr = 0x01,
    /// Target rejected by matched rule
    NotAllowed = 0x02,
    /// Upstream dial or TLS handshake failed
    ConnectFailed = 0x05,
    /// Command other than CONNECT
    CmdUnsupported = 0x07,
    /// Address type not handled, or domain-name length overflow
    AddrUnsupported = 0x08,
}

impl ProxyErrorKind {
    /// Map a SOCKS5 reply byte back to a kind. Unknown codes collapse to
    /// `GeneralErr`.
    pub fn from_reply(code: u8) -> Self {
        match code {
            0x02 => ProxyErrorKind::NotAllowed,
            0x05 => ProxyErrorKind::ConnectFailed,
            0x07 => ProxyErrorKind::CmdUnsupported,
            0x08 => ProxyErrorKind::AddrUnsupported,
            _ => ProxyErrorKind::GeneralErr,
        }
    }
}

impl std::fmt::Display for ProxyErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProxyErrorKind::GeneralErr => "general error",
            ProxyErrorKind::NotAllowed => "not allowed by rule",
            ProxyErrorKind::ConnectFailed => "connect failed",
            ProxyErrorKind::CmdUnsupported => "command unsupported",
            ProxyErrorKind::AddrUnsupported => "address unsupported",
        };
        f.write_str(s)
    }
}

/// An engine error paired with the code it carries across the proxy wire.
#[derive(Error, Debug)]
#[error("{kind}: {cause}")]
pub struct ProxyError {
    /// The SOCKS5-compatible reply code
    pub kind: ProxyErrorKind,
    /// The underlying cause
    pub cause: Error,
}

impl ProxyError {
    /// Pair an error with a proxy error kind.
    pub fn new(kind: ProxyErrorKind, cause: Error) -> Self {
        ProxyError { kind, cause }
    }

    /// Wrap an error as a general proxy failure.
    pub fn general(cause: Error) -> Self {
        ProxyError::new(ProxyErrorKind::GeneralErr, cause)
    }

    /// Report a target rejected by rule.
    pub fn not_allowed(addr: &Address) -> Self {
        ProxyError::new(
            ProxyErrorKind::NotAllowed,
            Error::protocol(format!("target rejected by rule: {addr}")),
        )
    }

    /// Wrap a dial failure.
    pub fn connect_failed(cause: Error) -> Self {
        ProxyError::new(ProxyErrorKind::ConnectFailed, cause)
    }
}

/// The result of a proxy request: an open stream and its bound address.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;
