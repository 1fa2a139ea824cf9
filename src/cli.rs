//! CLI definitions for the CSPTP client and service programs.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Flags shared by both programs.
#[derive(Debug, Parser)]
pub struct CommonArgs {
    /// Network interface name (advisory)
    #[clap(short = 'i', long = "interface")]
    pub interface: Option<String>,

    /// Path to a configuration file (command line overrides it)
    #[clap(short = 'f', long = "config")]
    pub config: Option<PathBuf>,

    /// Log severity threshold
    #[clap(short = 'l', long = "logLevel", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Send log output to syslog
    #[clap(long = "syslog")]
    pub syslog: bool,

    /// Echo log output to the terminal even with --syslog
    #[clap(long = "echo")]
    pub echo: bool,

    /// UDP port (default: the PTP event port, 320)
    #[clap(short = 'p', long = "port")]
    pub port: Option<u16>,
}

#[derive(Debug, Parser)]
#[clap(
    name = "csptp-client",
    version,
    about = "CSPTP client — measures offset from a CSPTP service via timestamped Sync exchanges"
)]
pub struct ClientCli {
    /// IP address or host name of the service
    #[clap(short = 'd', long = "serviceAddress")]
    pub service_address: Option<String>,

    /// Use one-step PTP messages (default is two-step)
    #[clap(short = 't', long = "oneStep")]
    pub one_step: bool,

    /// Request the CSPTP status TLV in the Sync response
    #[clap(short = 's', long = "reqStatTLV")]
    pub req_status: bool,

    /// Request the alternate timescale TLV in the Sync response
    #[clap(short = 'a', long = "reqAltTLV")]
    pub req_alt: bool,

    /// Force IPv4 service
    #[clap(short = '4', long = "ipv4", conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Force IPv6 service
    #[clap(short = '6', long = "ipv6")]
    pub ipv6: bool,

    /// PTP domainNumber
    #[clap(
        short = 'n',
        long = "domainNumber",
        value_parser = clap::value_parser!(u8).range(128..=239)
    )]
    pub domain_number: Option<u8>,

    /// Append one JSON line per completed cycle to this file
    #[clap(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    #[clap(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Parser)]
#[clap(
    name = "csptp-service",
    version,
    about = "CSPTP service — answers timestamped Sync requests with CSPTP TLV responses"
)]
pub struct ServiceCli {
    /// 1: receive one-step PTP messages only, 2: receive two-step only
    #[clap(short = 'r', long = "oneStepRx", value_parser = clap::value_parser!(u8).range(1..=2))]
    pub rx_mode: Option<u8>,

    /// 1: transmit one-step PTP messages only, 2: transmit two-step only
    #[clap(short = 't', long = "oneStepTx", value_parser = clap::value_parser!(u8).range(1..=2))]
    pub tx_mode: Option<u8>,

    /// Grandmaster priority1
    #[clap(long)]
    pub priority1: Option<u8>,

    /// Grandmaster priority2
    #[clap(long)]
    pub priority2: Option<u8>,

    /// Grandmaster clockClass
    #[clap(long = "clockClass")]
    pub clock_class: Option<u8>,

    /// Grandmaster clockAccuracy
    #[clap(long = "clockAccuracy", value_parser = clap::value_parser!(u8).range(0..=0xfe))]
    pub clock_accuracy: Option<u8>,

    /// Grandmaster offsetScaledLogVariance
    #[clap(long = "offsetScaledLogVariance")]
    pub offset_scaled_log_variance: Option<u16>,

    /// Use IPv6 (default IPv4)
    #[clap(short = '6', long = "ipv6")]
    pub ipv6: bool,

    #[clap(flatten)]
    pub common: CommonArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn client_cli_parses() {
        ClientCli::command().debug_assert();
        let cli = ClientCli::try_parse_from([
            "csptp-client",
            "-d",
            "10.0.0.1",
            "-s",
            "-a",
            "-n",
            "200",
            "-4",
        ])
        .unwrap();
        assert_eq!(cli.service_address.as_deref(), Some("10.0.0.1"));
        assert!(cli.req_status && cli.req_alt && cli.ipv4);
        assert_eq!(cli.domain_number, Some(200));
        assert!(!cli.one_step);
    }

    #[test]
    fn client_rejects_bad_domain_and_mixed_families() {
        assert!(ClientCli::try_parse_from(["csptp-client", "-n", "100"]).is_err());
        assert!(ClientCli::try_parse_from(["csptp-client", "-n", "240"]).is_err());
        assert!(ClientCli::try_parse_from(["csptp-client", "-4", "-6"]).is_err());
        assert!(ClientCli::try_parse_from(["csptp-client", "--no-such-option"]).is_err());
    }

    #[test]
    fn service_cli_parses() {
        ServiceCli::command().debug_assert();
        let cli = ServiceCli::try_parse_from([
            "csptp-service",
            "-r",
            "2",
            "-t",
            "1",
            "--clockClass",
            "12",
            "--offsetScaledLogVariance",
            "7",
        ])
        .unwrap();
        assert_eq!(cli.rx_mode, Some(2));
        assert_eq!(cli.tx_mode, Some(1));
        assert_eq!(cli.clock_class, Some(12));
        assert_eq!(cli.offset_scaled_log_variance, Some(7));
        assert!(ServiceCli::try_parse_from(["csptp-service", "-r", "3"]).is_err());
    }
}
