//! Command-line surface, grounded on `socket-activate`'s `clap::Parser`
//! derive usage.

use std::path::PathBuf;

use clap::Parser;

pub const EX_USAGE: i32 = 64;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_OSERR: i32 = 71;
pub const EX_NOUSER: i32 = 67;

#[derive(Parser, Debug)]
#[command(name = "inetd", about = "Config-driven TCP/UDP/UNIX super-server", version)]
pub struct Cli {
    /// Path to the service configuration file (or directory root).
    pub config: PathBuf,

    /// Run in the foreground with debug logging, skip the pidfile.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Log every successful connection in addition to denials/limits.
    #[arg(short = 'l', long = "log-all")]
    pub log_all: bool,

    /// Starts-window threshold (classic `toomany`/`TOOMANY`): a service
    /// tripping more than this many starts within a 60s window has its
    /// listener closed and retried 600s later. Defaults to the classic
    /// `256`; `0` disables the loop guard entirely.
    #[arg(short = 'R', value_name = "RATE")]
    pub toomany_rate: Option<u32>,

    /// Bind only to the given local interface address.
    #[arg(short = 'a', value_name = "ADDR")]
    pub bind_address: Option<String>,

    /// Write the daemon pid to this file (default `/var/run/inetd.pid`).
    #[arg(short = 'p', value_name = "PATH", default_value = "/var/run/inetd.pid")]
    pub pidfile: PathBuf,

    /// Worker-pool size for `wait = no` services.
    #[arg(short = 't', value_name = "N", default_value_t = 16)]
    pub worker_threads: usize,

    /// Enable libwrap (tcp_wrappers) hosts.allow/hosts.deny checks.
    #[arg(short = 'w', long)]
    pub libwrap: bool,

    /// Verbose libwrap logging.
    #[arg(short = 'W', long)]
    pub libwrap_verbose: bool,

    /// Global defaults-block overrides, in `key=value` form, applied
    /// before the config file's own `defaults` block.
    #[arg(short = 'c', value_name = "KEY=VALUE")]
    pub global_default: Vec<String>,

    /// Path to a secondary defaults file, merged ahead of the main config.
    #[arg(short = 'C', value_name = "PATH")]
    pub defaults_file: Option<PathBuf>,

    /// Syslog facility name for daemon logging.
    #[arg(short = 's', value_name = "FACILITY")]
    pub syslog_facility: Option<String>,
}
