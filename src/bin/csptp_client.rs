//! CSPTP client program.
//!
//! Sends timestamped Sync requests to a CSPTP service and reports the
//! offset from master. Run `csptp-client --help` for usage.

use anyhow::Result;
use clap::Parser;

use csptp::cli::ClientCli;
use csptp::client::ClientEngine;
use csptp::config::{ClientConfig, ConfigFile};
use csptp::report::Reporter;
use csptp::{logging, shutdown};

fn main() -> Result<()> {
    let cli = ClientCli::parse();
    logging::init(cli.common.log_level, cli.common.syslog, cli.common.echo)?;

    let file = cli.common.config.as_deref().map(ConfigFile::load).transpose()?;
    let cfg = ClientConfig::resolve(&cli, file.as_ref())?;
    let reporter = cli.output.as_deref().map(Reporter::create).transpose()?;

    shutdown::install()?;
    let mut engine = ClientEngine::new(&cfg)?;
    engine.run(reporter)?;

    eprintln!(" ...");
    Ok(())
}
