//! Service engine: answers timestamped Sync requests.
//!
//! Per datagram: capture the receive time (R1), parse, pick the client's
//! TLV requests out of the CSPTP_REQUEST, and answer with a RespSync that
//! carries R1 in the CSPTP_RESPONSE plus the requested STATUS and
//! alternate-time TLVs, padded to the request's frame size. In two-step
//! mode the transmit time T2 is retained in the per-client store and sent
//! again in a Follow_Up as the precise origin timestamp.

use anyhow::{bail, Context, Result};
use std::ffi::CStr;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use csptp_core::addr::Address;
use csptp_core::time::Timestamp;
use csptp_core::tlv::{
    self, AltTimeOffset, ClockQuality, CsptpRequest, CsptpResponse, CsptpStatus, PortAddress,
    TlvId, MAX_TZ_LEN,
};
use csptp_core::{Buffer, Message, MsgType, Protocol, PtpParams, RxParams, Sock, TimestampStore};

use crate::config::ServiceConfig;
use crate::shutdown;

/// Request buffer: three TLVs plus header need at most 160 octets, 256
/// covers any padded request we answer.
const SERVICE_BUF_SIZE: usize = 256;

/// Seconds between eviction sweeps of the per-client store.
const EVICT_PERIOD_SECS: u64 = 5;

/// Read-only clock description the service advertises, assembled from the
/// configuration: clock-quality knobs via CLI or file, identity,
/// organization ids, parent address, and the alternate-timescale fields via
/// file keys. The time-zone name falls back to the host's local zone.
#[derive(Debug, Clone)]
pub struct ClockInfo {
    pub clock_identity: [u8; 8],
    pub organization_id: [u8; 3],
    pub organization_sub_type: [u8; 3],
    pub parent_address: PortAddress,
    pub priority1: u8,
    pub priority2: u8,
    pub clock_quality: ClockQuality,
    pub current_utc_offset: i16,
    pub key_field: u8,
    pub current_offset: i32,
    pub jump_seconds: i32,
    pub time_of_next_jump: u64,
    pub tz_name: String,
}

/// Local time-zone acronym and UTC offset in seconds, from the C library.
fn local_time_zone() -> Option<(String, i32)> {
    unsafe {
        let now = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        if libc::localtime_r(&now, &mut tm).is_null() || tm.tm_zone.is_null() {
            return None;
        }
        let name = CStr::from_ptr(tm.tm_zone).to_str().ok()?.to_string();
        Some((name, tm.tm_gmtoff as i32))
    }
}

impl ClockInfo {
    pub fn from_config(cfg: &ServiceConfig) -> Self {
        let (mut tz_name, tz_offset) = local_time_zone().unwrap_or_default();
        if let Some(name) = &cfg.time_zone {
            tz_name = name.clone();
        }
        // Byte-length cap, popped char-wise so multi-byte names stay valid.
        while tz_name.len() > MAX_TZ_LEN {
            tz_name.pop();
        }
        // Config validation already matched the family; the zero address
        // stands in when no parent is configured.
        let parent_address = match (cfg.proto, cfg.parent_address) {
            (_, Some(IpAddr::V4(ip))) => PortAddress::V4(ip.octets()),
            (_, Some(IpAddr::V6(ip))) => PortAddress::V6(ip.octets()),
            (Protocol::Udp4, None) => PortAddress::V4([0; 4]),
            (Protocol::Udp6, None) => PortAddress::V6([0; 16]),
        };
        Self {
            clock_identity: cfg.clock_identity,
            organization_id: cfg.organization_id,
            organization_sub_type: cfg.organization_sub_type,
            parent_address,
            priority1: cfg.priority1,
            priority2: cfg.priority2,
            clock_quality: ClockQuality {
                clock_class: cfg.clock_class,
                clock_accuracy: cfg.clock_accuracy,
                offset_scaled_log_variance: cfg.offset_scaled_log_variance,
            },
            current_utc_offset: cfg.current_utc_offset,
            key_field: cfg.key_field,
            current_offset: tz_offset,
            jump_seconds: cfg.jump_seconds,
            time_of_next_jump: cfg.time_of_next_jump,
            tz_name,
        }
    }
}

pub struct ServiceEngine {
    socket: Sock,
    msg: Message,
    buf: Buffer,
    clock: ClockInfo,
    tx_two_step: bool,
    poll_ms: i32,
    store: Option<Arc<TimestampStore>>,
    store_age_secs: u32,
}

impl ServiceEngine {
    pub fn new(cfg: &ServiceConfig) -> Result<Self> {
        // The original guarded this with a condition that could never fire
        // (it compared the rx flag against itself); the error message shows
        // the intended combination check, implemented here.
        if cfg.rx_two_step && !cfg.tx_two_step {
            bail!("receiving two-step with one-step transmit is not supported");
        }
        let mut bind = Address::any(cfg.proto);
        bind.set_port(cfg.port);
        let socket = Sock::service(&bind)
            .with_context(|| format!("bind service socket on {}", bind))?;
        let store = if cfg.tx_two_step {
            Some(Arc::new(TimestampStore::new(cfg.proto, cfg.store_hash_bits)?))
        } else {
            None
        };
        Ok(Self {
            socket,
            msg: Message::new(),
            buf: Buffer::alloc(SERVICE_BUF_SIZE)?,
            clock: ClockInfo::from_config(cfg),
            tx_two_step: cfg.tx_two_step,
            poll_ms: cfg.poll_ms,
            store,
            store_age_secs: cfg.store_age_secs,
        })
    }

    /// The bound endpoint (useful with port 0).
    pub fn local_addr(&self) -> Result<Address> {
        Ok(self.socket.local_addr()?)
    }

    pub fn store(&self) -> Option<&Arc<TimestampStore>> {
        self.store.as_ref()
    }

    fn send_resp_sync(
        &mut self,
        client: &Address,
        rx: &RxParams,
        rx_ts: Timestamp,
        t2: Timestamp,
        req: CsptpRequest,
        size: usize,
    ) -> Result<()> {
        let params = PtpParams {
            msg_type: MsgType::Sync,
            domain_number: rx.domain_number,
            correction_field: rx.correction_field,
            sequence_id: rx.sequence_id,
            flag_field2: rx.flag_field2,
            two_step: self.tx_two_step,
            timestamp: t2,
        };
        self.msg.init(&params, &mut self.buf)?;

        let resp = CsptpResponse {
            organization_id: self.clock.organization_id,
            organization_sub_type: self.clock.organization_sub_type,
            req_ingress: rx_ts,
            req_correction: 0,
        };
        let region = self.msg.next_tlv(&mut self.buf, tlv::CSPTP_RESPONSE_LEN)?;
        resp.encode(region)?;
        self.msg.add_tlv(&mut self.buf, TlvId::CsptpResponse)?;

        if req.wants_status() {
            let status = CsptpStatus {
                organization_id: self.clock.organization_id,
                organization_sub_type: self.clock.organization_sub_type,
                grandmaster_priority1: self.clock.priority1,
                grandmaster_clock_quality: self.clock.clock_quality,
                grandmaster_priority2: self.clock.priority2,
                steps_removed: 0,
                current_utc_offset: self.clock.current_utc_offset,
                grandmaster_identity: self.clock.clock_identity,
                parent_address: self.clock.parent_address.clone(),
            };
            let region = self.msg.next_tlv(&mut self.buf, status.encoded_len())?;
            status.encode(region);
            self.msg.add_tlv(&mut self.buf, TlvId::CsptpStatus)?;
        }

        if req.wants_alt_time() {
            let alt = AltTimeOffset {
                key_field: self.clock.key_field,
                current_offset: self.clock.current_offset,
                jump_seconds: self.clock.jump_seconds,
                time_of_next_jump: self.clock.time_of_next_jump,
                display_name: self.clock.tz_name.clone(),
            };
            let region = self.msg.next_tlv(&mut self.buf, tlv::ALT_TIME_FULL)?;
            alt.encode(region)?;
            self.msg.add_tlv(&mut self.buf, TlvId::AlternateTimeOffsetIndicator)?;
        }

        self.msg.build_done(&mut self.buf, size)?;
        self.socket.send(&self.buf, client)?;
        Ok(())
    }

    fn send_follow_up(
        &mut self,
        client: &Address,
        rx: &RxParams,
        precise: Timestamp,
        size: usize,
    ) -> Result<()> {
        let params = PtpParams {
            msg_type: MsgType::FollowUp,
            domain_number: rx.domain_number,
            correction_field: rx.correction_field,
            sequence_id: rx.sequence_id,
            flag_field2: rx.flag_field2,
            two_step: self.tx_two_step,
            timestamp: precise,
        };
        self.msg.init(&params, &mut self.buf)?;
        self.msg.build_done(&mut self.buf, size)?;
        self.socket.send(&self.buf, client)?;
        Ok(())
    }

    /// One poll/receive/answer round. Returns whether a request was
    /// answered. Malformed datagrams are dropped with a warning; poll
    /// timeouts are idle.
    pub fn iterate(&mut self) -> Result<bool> {
        match self.socket.poll(self.poll_ms) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("idle");
                return Ok(false);
            }
            Err(err) => {
                tracing::debug!(%err, "poll");
                return Ok(false);
            }
        }
        let (client, rx_ts) = match self.socket.recv(&mut self.buf) {
            Ok(x) => x,
            Err(err) => {
                tracing::warn!(%err, "recv");
                return Ok(false);
            }
        };
        let rx = match self.msg.parse(&self.buf) {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(%err, peer = %client, "parse");
                return Ok(false);
            }
        };
        match rx.msg_type {
            MsgType::Sync => {}
            MsgType::FollowUp => return Ok(false),
        }
        let size = self.buf.len();
        let req = match self.msg.find_tlv(&self.buf, TlvId::CsptpRequest) {
            Some(bytes) => CsptpRequest::decode(bytes)?,
            None => {
                tracing::debug!(peer = %client, "Sync without a CSPTP_REQUEST TLV");
                return Ok(false);
            }
        };

        let t2 = Timestamp::now();
        self.send_resp_sync(&client, &rx, rx_ts, t2, req, size)?;
        if self.tx_two_step {
            // Retain T2 keyed by client IP, then hand it to the Follow_Up as
            // the precise origin timestamp. With hardware TX timestamping the
            // stored value would be refined between these two steps.
            let precise = match &self.store {
                Some(store) => {
                    store.update(&client, t2, rx.sequence_id)?;
                    store.fetch(&client, rx.sequence_id, true).unwrap_or(t2)
                }
                None => t2,
            };
            self.send_follow_up(&client, &rx, precise, size)?;
        }
        Ok(true)
    }

    /// Evict stale store records from a separate thread until shutdown.
    pub fn spawn_evictor(&self) -> Option<JoinHandle<()>> {
        let store = Arc::clone(self.store.as_ref()?);
        let age = self.store_age_secs;
        let handle = std::thread::Builder::new()
            .name("store-evict".into())
            .spawn(move || {
                let mut elapsed = 0u64;
                while !shutdown::requested() {
                    std::thread::sleep(Duration::from_secs(1));
                    elapsed += 1;
                    if elapsed % EVICT_PERIOD_SECS == 0 {
                        let removed = store.cleanup(age);
                        if removed > 0 {
                            tracing::debug!(removed, "evicted stale client records");
                        }
                    }
                }
            })
            .ok()?;
        Some(handle)
    }

    /// Serve until shutdown. Per-datagram failures are logged and the loop
    /// continues.
    pub fn run(&mut self) -> Result<()> {
        let evictor = self.spawn_evictor();
        while !shutdown::requested() {
            if let Err(err) = self.iterate() {
                tracing::warn!(%err, "request dropped");
            }
        }
        if let Some(handle) = evictor {
            let _ = handle.join();
        }
        tracing::debug!("exit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ServiceCli;
    use crate::config::ServiceConfig;
    use clap::Parser;

    fn test_config(args: &[&str]) -> ServiceConfig {
        let mut full = vec!["csptp-service", "-p", "0"];
        full.extend_from_slice(args);
        ServiceConfig::resolve(&ServiceCli::parse_from(full), None).unwrap()
    }

    #[test]
    fn clock_info_reflects_config() {
        let cfg = test_config(&["--priority1", "127", "--clockClass", "12"]);
        let clock = ClockInfo::from_config(&cfg);
        assert_eq!(clock.priority1, 127);
        assert_eq!(clock.clock_quality.clock_class, 12);
        assert_eq!(clock.clock_quality.clock_accuracy, 0xfe);
        assert_eq!(clock.current_utc_offset, 37);
        assert!(clock.tz_name.len() <= MAX_TZ_LEN);
        // Unconfigured parent falls back to the zero address of the family.
        assert_eq!(clock.parent_address, PortAddress::V4([0; 4]));
    }

    #[test]
    fn clock_info_takes_description_from_file() {
        let file = crate::config::ConfigFile::parse(
            "organizationId = 0a:0b:0c\n\
             organizationSubType = 0d:0e:0f\n\
             clockIdentity = 11:22:33:44:55:66:77:88\n\
             parentAddress = 1.4.7.0\n\
             keyField = 3\n\
             jumpSeconds = 1\n\
             timeOfNextJump = 175863\n\
             timeZone = CEST\n",
        )
        .unwrap();
        let cli = ServiceCli::parse_from(["csptp-service", "-p", "0"]);
        let cfg = ServiceConfig::resolve(&cli, Some(&file)).unwrap();
        let clock = ClockInfo::from_config(&cfg);
        assert_eq!(clock.organization_id, [0x0a, 0x0b, 0x0c]);
        assert_eq!(clock.organization_sub_type, [0x0d, 0x0e, 0x0f]);
        assert_eq!(clock.clock_identity, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(clock.parent_address, PortAddress::V4([1, 4, 7, 0]));
        assert_eq!(clock.key_field, 3);
        assert_eq!(clock.jump_seconds, 1);
        assert_eq!(clock.time_of_next_jump, 175_863);
        assert_eq!(clock.tz_name, "CEST");
    }

    #[test]
    fn rejects_rx_two_step_with_tx_one_step() {
        let cfg = test_config(&["-r", "2", "-t", "1"]);
        assert!(ServiceEngine::new(&cfg).is_err());
    }

    #[test]
    fn one_step_service_has_no_store() {
        let cfg = test_config(&["-r", "1", "-t", "1"]);
        let engine = ServiceEngine::new(&cfg).unwrap();
        assert!(engine.store().is_none());
        assert!(engine.spawn_evictor().is_none());
    }

    #[test]
    fn two_step_service_binds_and_keeps_store() {
        let cfg = test_config(&[]);
        let engine = ServiceEngine::new(&cfg).unwrap();
        assert!(engine.store().is_some());
        assert_eq!(engine.store().unwrap().hash_size(), 256);
        let bound = engine.local_addr().unwrap();
        assert_ne!(bound.port(), 0);
    }
}
