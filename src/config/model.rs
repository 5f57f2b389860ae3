//! Service configuration model (design component C6).
//!
//! A strong-typed record per the design's data model. `ServiceConfig` is
//! immutable once published into a `Snapshot` (see `registry.rs`); the
//! parser builds it field by field via `ServiceBuilder`, which plays the
//! role of the original's `freeconfig`-then-refill loop (`libinetd`'s
//! per-service parse loop resets one working record per `service {...}`
//! block; here each block simply builds a fresh `ServiceBuilder`).

use std::path::PathBuf;

use crate::addr::{DefaultVerdict, Family, NetAddr};
use crate::geoip::GeoRule;
use crate::timewin::TimeAcl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Dgram,
    Raw,
    Rdm,
    SeqPacket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockFamily {
    V4,
    V6,
    Unix,
}

impl SockFamily {
    pub fn as_acl_family(self) -> Option<Family> {
        match self {
            SockFamily::V4 => Some(Family::V4),
            SockFamily::V6 => Some(Family::V6),
            SockFamily::Unix => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// `wait = yes`: single-threaded, the listening socket itself is
    /// handed to the server/builtin and re-armed only after it returns.
    Single,
    /// `wait = no`: multi-threaded/accept-mode, one worker per connection.
    Multi,
}

#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user: String,
    pub group: Option<String>,
    pub login_class: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EnvPolicy {
    /// Names of ambient environment variables passed through to the child.
    pub passenv: Vec<String>,
    /// Explicit `NAME=VALUE` entries, always set.
    pub set: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct Banners {
    pub generic: Option<PathBuf>,
    pub success: Option<PathBuf>,
    pub failure: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct IpAclConfig {
    pub rules: Vec<(bool, NetAddr)>,
    pub default: DefaultVerdict,
}

#[derive(Debug, Clone, Default)]
pub struct GeoIpConfig {
    pub rules: Vec<GeoRule>,
    pub database: Option<PathBuf>,
    pub default: DefaultVerdict,
}

/// Exactly one of these is present on a service (spec invariant).
#[derive(Debug, Clone)]
pub enum Handler {
    /// An internal built-in. `bi_fork` forces the fork path even though
    /// the handler is in-process (matches wrapping/tcpmux semantics).
    Builtin { name: String, bi_fork: bool },
    External { path: PathBuf, args: Vec<String>, workdir: Option<PathBuf> },
    /// Recovered from `original_source`: proxies the connection to a
    /// fixed remote endpoint instead of spawning a local process.
    Redirect { host: String, port: u16 },
}

/// The identity tuple used to match a service across snapshots on
/// reconfiguration (design component C8).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub name: String,
    pub protocol: String,
    pub socket_kind_tag: u8,
    pub family_tag: u8,
    pub rpc: bool,
}

fn socket_kind_tag(k: SocketKind) -> u8 {
    match k {
        SocketKind::Stream => 0,
        SocketKind::Dgram => 1,
        SocketKind::Raw => 2,
        SocketKind::Rdm => 3,
        SocketKind::SeqPacket => 4,
    }
}

fn family_tag(f: SockFamily) -> u8 {
    match f {
        SockFamily::V4 => 0,
        SockFamily::V6 => 1,
        SockFamily::Unix => 2,
    }
}

/// An immutable, fully validated service definition. Built by the parser,
/// published into a `Snapshot`; never mutated after construction — a
/// reconfiguration that changes a service's fields builds a brand new
/// `ServiceConfig` and the registry decides what runtime state, if any,
/// carries over (see `registry::reconcile`).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub socket_kind: SocketKind,
    pub family: SockFamily,
    pub protocol: String,
    pub rpc: bool,
    pub port: Option<u16>,
    pub unix_path: Option<PathBuf>,
    pub wait: WaitMode,
    pub identity: Identity,
    pub handler: Handler,
    pub env: EnvPolicy,
    pub rcvbuf: Option<usize>,
    pub sndbuf: Option<usize>,
    pub max_child: u32,
    pub cpm_max: u32,
    pub cpm_wait_secs: u32,
    pub per_source: u32,
    pub access_times: TimeAcl,
    pub ip_acl: IpAclConfig,
    pub geoip: GeoIpConfig,
    pub banners: Banners,
    pub ipsec_policy: Option<String>,
    pub disabled: bool,
}

impl ServiceConfig {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            name: self.name.clone(),
            protocol: self.protocol.clone(),
            socket_kind_tag: socket_kind_tag(self.socket_kind),
            family_tag: family_tag(self.family),
            rpc: self.rpc,
        }
    }

    /// Validate the invariants named in the design's data model section.
    pub fn validate(&self) -> Result<(), String> {
        if self.family != SockFamily::Unix && self.port.is_none() {
            if !matches!(self.handler, Handler::Redirect { .. }) {
                return Err(format!("service {:?}: missing port", self.name));
            }
        }
        if self.family == SockFamily::Unix && self.unix_path.is_none() {
            return Err(format!("service {:?}: unix family requires a bind path", self.name));
        }
        if let Handler::External { args, .. } = &self.handler {
            if args.len() > 20 {
                return Err(format!("service {:?}: argv exceeds 20 entries", self.name));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for (_, net) in &self.ip_acl.rules {
            if !seen.insert(*net) {
                return Err(format!("service {:?}: duplicate ACL rule for {net}", self.name));
            }
        }
        Ok(())
    }
}
