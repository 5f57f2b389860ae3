//! Logging setup.
//!
//! `log` + `fern`, formatted with `chrono` local timestamps — the same
//! stack and format `systemd-networkd` uses, generalized with a
//! `facility`/`severity` prefix so log lines read the way a syslog
//! consumer expects (actual syslog transport is an external collaborator;
//! see the top-level design notes).

use log::LevelFilter;

/// Coarse event classes used to pick a log severity, per the design's
/// "severity mapped from event class" rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    ConnectionAccepted,
    AclDeny,
    LimitHit,
    StartLoopDisable,
    ChildReap,
    ConfigReload,
    BindRetry,
}

impl EventClass {
    pub fn level(self) -> log::Level {
        match self {
            EventClass::ConnectionAccepted => log::Level::Info,
            EventClass::AclDeny => log::Level::Warn,
            EventClass::LimitHit => log::Level::Warn,
            EventClass::StartLoopDisable => log::Level::Error,
            EventClass::ChildReap => log::Level::Info,
            EventClass::ConfigReload => log::Level::Info,
            EventClass::BindRetry => log::Level::Error,
        }
    }
}

pub fn level_from_env() -> LevelFilter {
    std::env::var("INETD_LOG_LEVEL")
        .ok()
        .and_then(|l| match l.to_lowercase().as_str() {
            "debug" | "7" => Some(LevelFilter::Debug),
            "info" | "6" => Some(LevelFilter::Info),
            "notice" | "5" | "warning" | "4" => Some(LevelFilter::Warn),
            "err" | "3" | "crit" | "2" | "alert" | "1" | "emerg" | "0" => {
                Some(LevelFilter::Error)
            }
            _ => None,
        })
        .unwrap_or(LevelFilter::Info)
}

/// Install the global logger. `debug` forces maximum verbosity and routes
/// to stderr instead of any configured log file (the CLI's `-d` flag).
pub fn setup(debug: bool) {
    let level = if debug { LevelFilter::Debug } else { level_from_env() };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][inetd][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .ok();
}
