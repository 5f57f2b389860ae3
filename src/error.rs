//! Error taxonomy for the daemon core.
//!
//! Mirrors the error kinds named in the design: config/address parsing
//! errors are diagnostic (carry file/line or text), admission-control
//! denials and spawn failures are local (the offending connection is
//! dropped, the service keeps running), and `Fatal`/`BindFailed` escalate
//! to service- or process-level action.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Cpm,
    MaxChild,
    PerSource,
    StartLoop,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cpm => "cpm",
            Self::MaxChild => "max_child",
            Self::PerSource => "per_source",
            Self::StartLoop => "start_loop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyBy {
    Acl,
    GeoIp,
    Time,
    Loop,
}

impl fmt::Display for DenyBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Acl => "acl",
            Self::GeoIp => "geoip",
            Self::Time => "time",
            Self::Loop => "loop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InetdError {
    #[error("{file}:{line}: {reason}")]
    BadConfig {
        file: String,
        line: u32,
        reason: String,
    },

    #[error("bad address {text:?}: {reason}")]
    BadAddress { text: String, reason: String },

    #[error("service {service}: bind failed: {os_err}")]
    BindFailed { service: String, os_err: std::io::Error },

    #[error("service {service}: accept failed: {os_err}")]
    AcceptFailed { service: String, os_err: std::io::Error },

    #[error("service {service}: over limit ({kind})")]
    OverLimit { service: String, kind: LimitKind },

    #[error("service {service}: denied by {by}")]
    Denied { service: String, by: DenyBy },

    #[error("service {service}: spawn failed: {os_err}")]
    SpawnFailed { service: String, os_err: std::io::Error },

    #[error("fatal: {reason}")]
    Fatal { reason: String },
}

pub type Result<T> = std::result::Result<T, InetdError>;

impl InetdError {
    /// Whether this error class escalates beyond a single connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InetdError::Fatal { .. })
    }
}
