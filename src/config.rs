//! Configuration file and resolved program options.
//!
//! The file dialect is INI-like: optional `[section]` lines, `key = value`
//! pairs, `#` comments, CR/LF line ends. Leading and trailing whitespace is
//! trimmed; section names and keys may be wrapped in matching single or
//! double quotes; values keep their quotes (strip them with [`unquote`]).
//! The command line always overrides file values.

use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::path::Path;

use csptp_core::addr::{Protocol, PTP_EVENT_PORT};
use csptp_core::wire::UINT48_MAX;

use crate::cli::{ClientCli, ServiceCli};

const SEC_KEY_MAX: usize = 63;
const VAL_MAX: usize = 1023;

#[derive(Debug, Clone)]
struct Entry {
    section: Option<String>,
    key: String,
    value: String,
}

/// Parsed configuration file: an ordered list of entries.
#[derive(Debug, Default, Clone)]
pub struct ConfigFile {
    entries: Vec<Entry>,
}

/// Strip one matching pair of surrounding quotes, if present.
pub fn unquote(v: &str) -> &str {
    let b = v.as_bytes();
    if b.len() >= 2 && (b[0] == b'"' || b[0] == b'\'') && b[b.len() - 1] == b[0] {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

fn strip_quoted_name(s: &str) -> &str {
    unquote(s.trim())
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut cfg = ConfigFile::default();
        let mut section: Option<String> = None;
        for (lineno, raw) in text.split(['\r', '\n']).enumerate() {
            let line = raw.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let rest = rest.trim_end();
                let Some(name) = rest.strip_suffix(']') else {
                    bail!("line {}: section is not closed", lineno + 1);
                };
                let name = strip_quoted_name(name);
                if name.is_empty() {
                    bail!("line {}: empty section name", lineno + 1);
                }
                if name.len() > SEC_KEY_MAX {
                    bail!("line {}: section name exceeds limit", lineno + 1);
                }
                section = Some(name.to_string());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("line {}: expected 'key = value'", lineno + 1);
            };
            let key = strip_quoted_name(key);
            let value = value.trim();
            if key.is_empty() || key.len() > SEC_KEY_MAX {
                bail!("line {}: bad key", lineno + 1);
            }
            if value.is_empty() {
                bail!("line {}: empty value", lineno + 1);
            }
            if value.len() > VAL_MAX {
                bail!("line {}: value exceeds limit", lineno + 1);
            }
            cfg.entries.push(Entry {
                section: section.clone(),
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Ok(cfg)
    }

    /// Last value for `key` in any section. Values keep their quotes.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Last value for `key` within `section`.
    pub fn get_in(&self, section: &str, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.section.as_deref() == Some(section) && e.key == key)
            .map(|e| e.value.as_str())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => match unquote(raw).to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => bail!("key '{}': not a boolean: {}", key, raw),
            },
        }
    }

    fn get_int(&self, key: &str, min: i64, max: i64) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => {
                let v: i64 = unquote(raw)
                    .parse()
                    .with_context(|| format!("key '{}': not an integer: {}", key, raw))?;
                if v < min || v > max {
                    bail!("key '{}': {} out of range [{}, {}]", key, v, min, max);
                }
                Ok(Some(v))
            }
        }
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).map(unquote)
    }

    /// Fixed-length octet string like `01:02:03` (colon- or dash-separated
    /// hex pairs).
    fn get_hex_bytes<const N: usize>(&self, key: &str) -> Result<Option<[u8; N]>> {
        match self.get_str(key) {
            None => Ok(None),
            Some(raw) => {
                let mut out = [0u8; N];
                let mut count = 0;
                for part in raw.split([':', '-']) {
                    if count == N {
                        bail!("key '{}': expected {} octets: {}", key, N, raw);
                    }
                    out[count] = u8::from_str_radix(part, 16)
                        .with_context(|| format!("key '{}': bad octet '{}': {}", key, part, raw))?;
                    count += 1;
                }
                if count != N {
                    bail!("key '{}': expected {} octets: {}", key, N, raw);
                }
                Ok(Some(out))
            }
        }
    }

    /// IP literal of the given family.
    fn get_ip(&self, key: &str, proto: Protocol) -> Result<Option<IpAddr>> {
        match self.get_str(key) {
            None => Ok(None),
            Some(raw) => {
                let ip: IpAddr = raw
                    .parse()
                    .with_context(|| format!("key '{}': not an IP address: {}", key, raw))?;
                let matches = matches!(
                    (proto, ip),
                    (Protocol::Udp4, IpAddr::V4(_)) | (Protocol::Udp6, IpAddr::V6(_))
                );
                if !matches {
                    bail!("key '{}': address family does not match the service: {}", key, raw);
                }
                Ok(Some(ip))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved options: defaults < config file < command line
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub service_address: String,
    pub forced: Option<Protocol>,
    pub domain_number: u8,
    pub two_step: bool,
    pub req_status: bool,
    pub req_alt_time: bool,
    pub interface: Option<String>,
    pub port: u16,
    pub cycle_ms: i64,
    pub wait_loops: u32,
    pub poll_ms: i32,
}

impl ClientConfig {
    pub fn resolve(cli: &ClientCli, file: Option<&ConfigFile>) -> Result<Self> {
        let empty = ConfigFile::default();
        let file = file.unwrap_or(&empty);

        let service_address = cli
            .service_address
            .clone()
            .or_else(|| file.get_str("serviceAddress").map(str::to_string))
            .context("client misses the service IP address (-d/serviceAddress)")?;

        let file_v4 = file.get_bool("ipv4")?.unwrap_or(false);
        let file_v6 = file.get_bool("ipv6")?.unwrap_or(false);
        let (v4, v6) = if cli.ipv4 || cli.ipv6 {
            (cli.ipv4, cli.ipv6)
        } else {
            (file_v4, file_v6)
        };
        if v4 && v6 {
            bail!("'ipv4' and 'ipv6' cannot be used together");
        }
        let forced = if v4 {
            Some(Protocol::Udp4)
        } else if v6 {
            Some(Protocol::Udp6)
        } else {
            None
        };

        let domain_number = match cli.domain_number {
            Some(d) => d,
            None => file.get_int("domainNumber", 128, 239)?.unwrap_or(128) as u8,
        };
        let one_step = cli.one_step || file.get_bool("oneStep")?.unwrap_or(false);

        Ok(Self {
            service_address,
            forced,
            domain_number,
            two_step: !one_step,
            req_status: cli.req_status || file.get_bool("reqStatTLV")?.unwrap_or(false),
            req_alt_time: cli.req_alt || file.get_bool("reqAltTLV")?.unwrap_or(false),
            interface: cli
                .common
                .interface
                .clone()
                .or_else(|| file.get_str("interface").map(str::to_string)),
            port: match cli.common.port {
                Some(p) => p,
                None => file.get_int("port", 1, u16::MAX as i64)?.unwrap_or(PTP_EVENT_PORT as i64)
                    as u16,
            },
            cycle_ms: file.get_int("cycleMs", 1, 3_600_000)?.unwrap_or(1000),
            wait_loops: file.get_int("waitLoops", 1, 10_000)?.unwrap_or(50) as u32,
            poll_ms: file.get_int("pollMs", 1, 60_000)?.unwrap_or(50) as i32,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub rx_two_step: bool,
    pub tx_two_step: bool,
    pub proto: Protocol,
    pub port: u16,
    pub interface: Option<String>,
    pub poll_ms: i32,
    pub priority1: u8,
    pub priority2: u8,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
    pub current_utc_offset: i16,
    pub organization_id: [u8; 3],
    pub organization_sub_type: [u8; 3],
    pub clock_identity: [u8; 8],
    /// Parent port address advertised in CSPTP_STATUS; family matches
    /// `proto`. The zero address stands in when unset.
    pub parent_address: Option<IpAddr>,
    pub key_field: u8,
    pub jump_seconds: i32,
    pub time_of_next_jump: u64,
    pub time_zone: Option<String>,
    pub store_hash_bits: u32,
    pub store_age_secs: u32,
}

impl ServiceConfig {
    pub fn resolve(cli: &ServiceCli, file: Option<&ConfigFile>) -> Result<Self> {
        let empty = ConfigFile::default();
        let file = file.unwrap_or(&empty);

        let rx_mode = match cli.rx_mode {
            Some(m) => m as i64,
            None => file.get_int("oneStepRx", 1, 2)?.unwrap_or(2),
        };
        let tx_mode = match cli.tx_mode {
            Some(m) => m as i64,
            None => file.get_int("oneStepTx", 1, 2)?.unwrap_or(2),
        };
        let ipv6 = cli.ipv6 || file.get_bool("ipv6")?.unwrap_or(false);
        let proto = if ipv6 { Protocol::Udp6 } else { Protocol::Udp4 };

        let pick_u8 = |cli_val: Option<u8>, key: &str, def: i64, max: i64| -> Result<u8> {
            Ok(match cli_val {
                Some(v) => v,
                None => file.get_int(key, 0, max)?.unwrap_or(def) as u8,
            })
        };

        Ok(Self {
            rx_two_step: rx_mode == 2,
            tx_two_step: tx_mode == 2,
            proto,
            port: match cli.common.port {
                Some(p) => p,
                None => file.get_int("port", 1, u16::MAX as i64)?.unwrap_or(PTP_EVENT_PORT as i64)
                    as u16,
            },
            interface: cli
                .common
                .interface
                .clone()
                .or_else(|| file.get_str("interface").map(str::to_string)),
            poll_ms: file.get_int("pollMs", 1, 60_000)?.unwrap_or(3000) as i32,
            priority1: pick_u8(cli.priority1, "priority1", 128, 255)?,
            priority2: pick_u8(cli.priority2, "priority2", 128, 255)?,
            clock_class: pick_u8(cli.clock_class, "clockClass", 248, 255)?,
            clock_accuracy: pick_u8(cli.clock_accuracy, "clockAccuracy", 0xfe, 0xfe)?,
            offset_scaled_log_variance: match cli.offset_scaled_log_variance {
                Some(v) => v,
                None => file
                    .get_int("offsetScaledLogVariance", 0, u16::MAX as i64)?
                    .unwrap_or(u16::MAX as i64) as u16,
            },
            current_utc_offset: file.get_int("utcOffset", i16::MIN as i64, i16::MAX as i64)?
                .unwrap_or(37) as i16,
            organization_id: file
                .get_hex_bytes("organizationId")?
                .unwrap_or([0x01, 0x02, 0x03]),
            organization_sub_type: file
                .get_hex_bytes("organizationSubType")?
                .unwrap_or([0x04, 0x05, 0x06]),
            clock_identity: file
                .get_hex_bytes("clockIdentity")?
                .unwrap_or([0x01, 0x02, 0x03, 0xfe, 0xff, 0x04, 0x05, 0x06]),
            parent_address: file.get_ip("parentAddress", proto)?,
            key_field: file.get_int("keyField", 0, u8::MAX as i64)?.unwrap_or(1) as u8,
            jump_seconds: file
                .get_int("jumpSeconds", i32::MIN as i64, i32::MAX as i64)?
                .unwrap_or(0) as i32,
            time_of_next_jump: file
                .get_int("timeOfNextJump", 0, UINT48_MAX as i64)?
                .unwrap_or(0) as u64,
            time_zone: file.get_str("timeZone").map(str::to_string),
            store_hash_bits: file.get_int("storeHashBits", 0, 32)?.unwrap_or(8) as u32,
            store_age_secs: file.get_int("storeAgeSeconds", 1, 86_400)?.unwrap_or(60) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_sections_keys_comments() {
        let text = "\
# leading comment\r\n\
serviceAddress = 10.1.2.3\r\n\
\r\n\
[ \"clock\" ]\r\n\
  'priority1' = 100\n\
  timeZone = \"CEST\"\n\
# trailing comment\n";
        let cfg = ConfigFile::parse(text).unwrap();
        assert_eq!(cfg.get("serviceAddress"), Some("10.1.2.3"));
        assert_eq!(cfg.get_in("clock", "priority1"), Some("100"));
        assert_eq!(cfg.get("priority1"), Some("100"));
        // Values keep their quotes until explicitly unquoted.
        assert_eq!(cfg.get("timeZone"), Some("\"CEST\""));
        assert_eq!(cfg.get_str("timeZone"), Some("CEST"));
        assert_eq!(cfg.get("missing"), None);
    }

    #[test]
    fn later_entries_win() {
        let cfg = ConfigFile::parse("port = 320\nport = 10320\n").unwrap();
        assert_eq!(cfg.get("port"), Some("10320"));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(ConfigFile::parse("[open\n").is_err());
        assert!(ConfigFile::parse("[]\n").is_err());
        assert!(ConfigFile::parse("no equal sign\n").is_err());
        assert!(ConfigFile::parse("key =\n").is_err());
        assert!(ConfigFile::parse(&format!("{} = 1\n", "k".repeat(64))).is_err());
    }

    #[test]
    fn unquote_strips_one_matching_pair() {
        assert_eq!(unquote("\"x y\""), "x y");
        assert_eq!(unquote("'x'"), "x");
        assert_eq!(unquote("''"), "");
        assert_eq!(unquote("\"mismatch'"), "\"mismatch'");
        assert_eq!(unquote("plain"), "plain");
        assert_eq!(unquote("\"\"x\"\""), "\"x\"");
    }

    fn client_cli(args: &[&str]) -> ClientCli {
        let mut full = vec!["csptp-client"];
        full.extend_from_slice(args);
        ClientCli::parse_from(full)
    }

    #[test]
    fn client_defaults() {
        let cfg = ClientConfig::resolve(&client_cli(&["-d", "1.2.3.4"]), None).unwrap();
        assert_eq!(cfg.service_address, "1.2.3.4");
        assert_eq!(cfg.domain_number, 128);
        assert!(cfg.two_step);
        assert!(!cfg.req_status && !cfg.req_alt_time);
        assert_eq!(cfg.forced, None);
        assert_eq!(cfg.port, 320);
        assert_eq!((cfg.cycle_ms, cfg.wait_loops, cfg.poll_ms), (1000, 50, 50));
    }

    #[test]
    fn client_requires_address() {
        assert!(ClientConfig::resolve(&client_cli(&[]), None).is_err());
    }

    #[test]
    fn command_line_overrides_file() {
        let file = ConfigFile::parse(
            "serviceAddress = 9.9.9.9\ndomainNumber = 130\noneStep = true\nport = 11111\n",
        )
        .unwrap();
        let cfg =
            ClientConfig::resolve(&client_cli(&["-d", "1.1.1.1", "-n", "200"]), Some(&file))
                .unwrap();
        assert_eq!(cfg.service_address, "1.1.1.1");
        assert_eq!(cfg.domain_number, 200);
        assert!(!cfg.two_step); // file's oneStep still applies
        assert_eq!(cfg.port, 11111);
    }

    #[test]
    fn file_domain_out_of_range_rejected() {
        let file = ConfigFile::parse("serviceAddress = 1.1.1.1\ndomainNumber = 100\n").unwrap();
        assert!(ClientConfig::resolve(&client_cli(&[]), Some(&file)).is_err());
    }

    #[test]
    fn service_defaults_match_clock_defaults() {
        let cli = ServiceCli::parse_from(["csptp-service"]);
        let cfg = ServiceConfig::resolve(&cli, None).unwrap();
        assert!(cfg.rx_two_step && cfg.tx_two_step);
        assert_eq!(cfg.proto, Protocol::Udp4);
        assert_eq!(cfg.priority1, 128);
        assert_eq!(cfg.priority2, 128);
        assert_eq!(cfg.clock_class, 248);
        assert_eq!(cfg.clock_accuracy, 0xfe);
        assert_eq!(cfg.offset_scaled_log_variance, 0xffff);
        assert_eq!(cfg.poll_ms, 3000);
        assert_eq!(cfg.current_utc_offset, 37);
    }

    #[test]
    fn service_mode_mapping() {
        let cli = ServiceCli::parse_from(["csptp-service", "-r", "1", "-t", "2", "-6"]);
        let cfg = ServiceConfig::resolve(&cli, None).unwrap();
        assert!(!cfg.rx_two_step);
        assert!(cfg.tx_two_step);
        assert_eq!(cfg.proto, Protocol::Udp6);
    }

    #[test]
    fn service_clock_description_defaults() {
        let cli = ServiceCli::parse_from(["csptp-service"]);
        let cfg = ServiceConfig::resolve(&cli, None).unwrap();
        assert_eq!(cfg.organization_id, [0x01, 0x02, 0x03]);
        assert_eq!(cfg.organization_sub_type, [0x04, 0x05, 0x06]);
        assert_eq!(cfg.clock_identity, [0x01, 0x02, 0x03, 0xfe, 0xff, 0x04, 0x05, 0x06]);
        assert_eq!(cfg.parent_address, None);
        assert_eq!(cfg.key_field, 1);
        assert_eq!(cfg.jump_seconds, 0);
        assert_eq!(cfg.time_of_next_jump, 0);
    }

    #[test]
    fn service_clock_description_from_file() {
        let file = ConfigFile::parse(
            "organizationId = 0a:0b:0c\n\
             organizationSubType = 1a-1b-1c\n\
             clockIdentity = 01:02:03:fe:ff:04:05:06\n\
             parentAddress = 1.4.7.0\n\
             keyField = 2\n\
             jumpSeconds = 1\n\
             timeOfNextJump = 175863\n\
             timeZone = CEST\n",
        )
        .unwrap();
        let cli = ServiceCli::parse_from(["csptp-service"]);
        let cfg = ServiceConfig::resolve(&cli, Some(&file)).unwrap();
        assert_eq!(cfg.organization_id, [0x0a, 0x0b, 0x0c]);
        assert_eq!(cfg.organization_sub_type, [0x1a, 0x1b, 0x1c]);
        assert_eq!(cfg.clock_identity, [0x01, 0x02, 0x03, 0xfe, 0xff, 0x04, 0x05, 0x06]);
        assert_eq!(cfg.parent_address, Some("1.4.7.0".parse().unwrap()));
        assert_eq!(cfg.key_field, 2);
        assert_eq!(cfg.jump_seconds, 1);
        assert_eq!(cfg.time_of_next_jump, 175_863);
        assert_eq!(cfg.time_zone.as_deref(), Some("CEST"));
    }

    #[test]
    fn service_rejects_bad_clock_description() {
        let cli = ServiceCli::parse_from(["csptp-service"]);

        // Wrong octet count.
        let file = ConfigFile::parse("organizationId = 0a:0b\n").unwrap();
        assert!(ServiceConfig::resolve(&cli, Some(&file)).is_err());
        let file = ConfigFile::parse("clockIdentity = 01:02:03:04:05:06:07:08:09\n").unwrap();
        assert!(ServiceConfig::resolve(&cli, Some(&file)).is_err());

        // Not hex.
        let file = ConfigFile::parse("organizationId = 0a:0b:xy\n").unwrap();
        assert!(ServiceConfig::resolve(&cli, Some(&file)).is_err());

        // Parent address family must match the service protocol.
        let file = ConfigFile::parse("parentAddress = 102:304::1\n").unwrap();
        assert!(ServiceConfig::resolve(&cli, Some(&file)).is_err());
        let cli6 = ServiceCli::parse_from(["csptp-service", "-6"]);
        assert!(ServiceConfig::resolve(&cli6, Some(&file)).is_ok());

        // timeOfNextJump is a 48-bit value.
        let file = ConfigFile::parse("timeOfNextJump = 281474976710656\n").unwrap();
        assert!(ServiceConfig::resolve(&cli, Some(&file)).is_err());
    }
}
