//! A config-driven TCP/UDP/UNIX super-server: one process that owns a set
//! of listening sockets described by a service configuration file, and
//! for each arrival runs admission control (IP/GeoIP/time-window ACLs,
//! a connections-per-minute limiter, per-source and max-child caps) before
//! handing the connection to a built-in, an external program, or a
//! redirect proxy.

pub mod acceptor;
pub mod addr;
pub mod builtins;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod geoip;
pub mod limiter;
pub mod logging;
pub mod pidfile;
pub mod reaper;
pub mod registry;
pub mod tables;
pub mod timewin;
