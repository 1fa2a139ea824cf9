//! CSPTP service program.
//!
//! Binds the PTP event port and answers timestamped Sync requests with
//! CSPTP TLV responses. Run `csptp-service --help` for usage.

use anyhow::Result;
use clap::Parser;

use csptp::cli::ServiceCli;
use csptp::config::{ConfigFile, ServiceConfig};
use csptp::service::ServiceEngine;
use csptp::{logging, shutdown};

fn main() -> Result<()> {
    let cli = ServiceCli::parse();
    logging::init(cli.common.log_level, cli.common.syslog, cli.common.echo)?;

    let file = cli.common.config.as_deref().map(ConfigFile::load).transpose()?;
    let cfg = ServiceConfig::resolve(&cli, file.as_ref())?;

    shutdown::install()?;
    let mut engine = ServiceEngine::new(&cfg)?;
    engine.run()?;

    eprintln!(" ...");
    Ok(())
}
