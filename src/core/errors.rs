//! Error taxonomy shared across every component of the daemon.

use std::fmt;
use std::sync::Arc;

/// The single error type returned by every fallible operation in this crate.
///
/// Variants map directly onto the six-way taxonomy the command protocol
/// exposes to callers: a handler never leaks a raw `std::io::Error` or
/// `reqwest::Error` to a `CommandResponse`, it converts into one of these
/// first.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// The daemon's own configuration is missing, malformed, or internally
    /// inconsistent (e.g. an operation that needs `erddap_base_url` was
    /// called without one configured).
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller-supplied input failed validation (a malformed email, an IP
    /// address outside the accepted wildcard grammar, an unknown dataset
    /// id).
    #[error("validation error: {0}")]
    Validation(String),

    /// A signed envelope failed HMAC verification, or a structural hash
    /// mismatch was detected where one should not be possible.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A network operation (local socket, broker publish/consume, metric
    /// push, data-server HTTP call) failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A document (XML fragment, master document, TOML config, signed
    /// envelope payload) could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A filesystem operation (read, write, rename, chown) failed.
    #[error("filesystem error: {0}")]
    Filesystem {
        message: String,
        #[source]
        source: Option<IoErrorWrapper>,
    },
}

/// `std::io::Error` is not `Clone`, but `CoreError` must be (it flows through
/// `CommandResponse` values that get cloned for broadcast fan-out). Wrap it
/// in an `Arc` so the wrapper stays cheaply `Clone`.
#[derive(Debug, Clone)]
pub struct IoErrorWrapper(pub Arc<std::io::Error>);

impl fmt::Display for IoErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for IoErrorWrapper {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl CoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::Filesystem {
            message: msg.into(),
            source: None,
        }
    }

    /// The taxonomy name as carried over the wire in a `CommandResponse`
    /// error payload (`spec.md` §7's `{kind, message}` shape).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Validation(_) => "validation_error",
            Self::Integrity(_) => "integrity_error",
            Self::Transport(_) => "transport_error",
            Self::Parse(_) => "parse_error",
            Self::Filesystem { .. } => "filesystem_error",
        }
    }
}

impl PartialEq for CoreError {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.to_string() == other.to_string()
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        let message = e.to_string();
        Self::Filesystem {
            message,
            source: Some(IoErrorWrapper(Arc::new(e))),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<quick_xml::Error> for CoreError {
    fn from(e: quick_xml::Error) -> Self {
        Self::Parse(format!("xml: {e}"))
    }
}

impl From<std::str::Utf8Error> for CoreError {
    fn from(e: std::str::Utf8Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<uuid::Error> for CoreError {
    fn from(e: uuid::Error) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<base64::DecodeError> for CoreError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Integrity(format!("malformed envelope: {e}"))
    }
}
