use clap::Parser;

use inetd::acceptor::AcceptorCore;
use inetd::cli::{Cli, EX_OSERR, EX_SOFTWARE, EX_USAGE};
use inetd::logging;
use inetd::pidfile::PidFile;

fn main() {
    let cli = Cli::parse();
    logging::setup(cli.debug);

    if !cli.config.exists() {
        log::error!("config path {} does not exist", cli.config.display());
        std::process::exit(EX_USAGE);
    }

    let _pidfile = if cli.debug {
        None
    } else {
        match PidFile::create(&cli.pidfile) {
            Ok(pf) => Some(pf),
            Err(e) => {
                log::error!("{e}");
                std::process::exit(EX_OSERR);
            }
        }
    };

    let toomany = cli.toomany_rate.unwrap_or(256);
    let mut core = match AcceptorCore::new(cli.config.clone(), cli.worker_threads, toomany) {
        Ok(c) => c,
        Err(e) => {
            log::error!("startup failed: {e}");
            std::process::exit(EX_SOFTWARE);
        }
    };

    log::info!("inetd started, watching {}", cli.config.display());
    core.run();
    log::info!("inetd exiting");
}
