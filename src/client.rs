//! Client engine: timestamped Sync request cycles.
//!
//! Each cycle transmits a `ReqSync` (Sync + CSPTP_REQUEST, padded to a fixed
//! frame size) and, in two-step mode, an empty Follow_Up. It then polls for
//! the service's RespSync (and Follow_Up when the service is two-step),
//! records the four exchange timestamps, and reports `T2 - T1` as the
//! offset from master. Cycles are paced by a fixed period, compensated for
//! the poll time already spent.

use anyhow::{Context, Result};

use csptp_core::addr::{self, Address};
use csptp_core::time::{Timestamp, NSEC_PER_MSEC};
use csptp_core::tlv::{self, CsptpResponse, TlvId};
use csptp_core::{Buffer, Message, MsgType, Protocol, PtpParams, Sock, PTP_MSG_SIZE};

use crate::config::ClientConfig;
use crate::report::CycleRecord;
use crate::shutdown;

/// Waiting for the RespSync.
const WAIT_RESP_SYNC: u8 = 1 << 0;
/// Waiting for the service's Follow_Up.
const WAIT_FOLLOW_UP: u8 = 1 << 1;

/// Pre-pad frame size: header, the RESPONSE the service will return, and the
/// optional TLVs the client requests.
pub fn frame_payload_size(req_status: bool, req_alt_time: bool, proto: Protocol) -> usize {
    let mut sz = PTP_MSG_SIZE + tlv::CSPTP_RESPONSE_LEN;
    if req_status {
        sz += tlv::status_size(proto);
    }
    if req_alt_time {
        sz += tlv::ALT_TIME_FULL;
    }
    sz
}

/// Frame-size policy: 10 spare octets guarantee room for a PAD header, then
/// round up to the next multiple of 16.
pub fn smooth_size(sz: usize) -> usize {
    (sz + 10 + 15) & !15
}

/// One completed exchange, scalar nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct Exchange {
    pub sequence_id: u16,
    pub t1: i64,
    pub r1: i64,
    pub t2: i64,
    pub r2: i64,
    pub offset: i64,
}

impl From<Exchange> for CycleRecord {
    fn from(ex: Exchange) -> Self {
        CycleRecord {
            ts: 0,
            sequence_id: ex.sequence_id,
            t1: ex.t1,
            r1: ex.r1,
            t2: ex.t2,
            r2: ex.r2,
            offset: ex.offset,
        }
    }
}

pub struct ClientEngine {
    address: Address,
    socket: Sock,
    msg: Message,
    buf: Buffer,
    params: PtpParams,
    req_flags0: u8,
    frame_size: usize,
    domain_number: u8,
    two_step: bool,
    wait_loops: u32,
    poll_ms: i32,
    cycle_ms: i64,
    sequence_id: u16,
    t1: Timestamp,
    r1: Timestamp,
    t2: Timestamp,
    r2: Timestamp,
}

impl ClientEngine {
    pub fn new(cfg: &ClientConfig) -> Result<Self> {
        let ip = addr::resolve(&cfg.service_address, cfg.forced)
            .with_context(|| format!("cannot reach service '{}'", cfg.service_address))?;
        let address = Address::new(ip, cfg.port);
        tracing::debug!(host = %cfg.service_address, endpoint = %address, "service endpoint");
        let socket = Sock::client(address.proto()).context("client socket")?;
        let frame_size = smooth_size(frame_payload_size(
            cfg.req_status,
            cfg.req_alt_time,
            address.proto(),
        ));
        let buf = Buffer::alloc(frame_size)?;
        let req_flags0 = if cfg.req_status { tlv::REQ_FLAG_STATUS } else { 0 }
            | if cfg.req_alt_time { tlv::REQ_FLAG_ALT_TIME } else { 0 };
        Ok(Self {
            address,
            socket,
            msg: Message::new(),
            buf,
            params: PtpParams {
                domain_number: cfg.domain_number,
                two_step: cfg.two_step,
                ..Default::default()
            },
            req_flags0,
            frame_size,
            domain_number: cfg.domain_number,
            two_step: cfg.two_step,
            wait_loops: cfg.wait_loops,
            poll_ms: cfg.poll_ms,
            cycle_ms: cfg.cycle_ms,
            sequence_id: 1,
            t1: Timestamp::default(),
            r1: Timestamp::default(),
            t2: Timestamp::default(),
            r2: Timestamp::default(),
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sequence_id(&self) -> u16 {
        self.sequence_id
    }

    fn send_req_sync(&mut self) -> Result<()> {
        self.params.msg_type = MsgType::Sync;
        self.params.sequence_id = self.sequence_id;
        self.t1 = Timestamp::now();
        self.params.timestamp = self.t1;
        self.msg.init(&self.params, &mut self.buf)?;
        self.msg.add_req_tlv(&mut self.buf, self.req_flags0)?;
        self.msg.build_done(&mut self.buf, self.frame_size)?;
        self.socket.send(&self.buf, &self.address)?;
        Ok(())
    }

    fn send_follow_up(&mut self) -> Result<()> {
        self.params.msg_type = MsgType::FollowUp;
        self.params.sequence_id = self.sequence_id;
        self.params.timestamp = Timestamp::default();
        self.msg.init(&self.params, &mut self.buf)?;
        self.msg.build_done(&mut self.buf, self.frame_size)?;
        self.socket.send(&self.buf, &self.address)?;
        Ok(())
    }

    /// Receive one datagram and fold it into the exchange. Returns whether
    /// the datagram belonged to this cycle.
    fn handle_datagram(&mut self, wait: &mut u8) -> Result<bool> {
        let (peer, rx_ts) = match self.socket.recv(&mut self.buf) {
            Ok(x) => x,
            Err(err) => {
                tracing::debug!(%err, "recv");
                return Ok(false);
            }
        };
        let rx = match self.msg.parse(&self.buf) {
            Ok(p) => p,
            Err(err) => {
                tracing::debug!(%err, "parse");
                return Ok(false);
            }
        };
        if rx.sequence_id != self.sequence_id
            || rx.domain_number != self.domain_number
            || peer != self.address
        {
            return Ok(false);
        }
        match rx.msg_type {
            MsgType::Sync => {
                *wait &= !WAIT_RESP_SYNC;
                if !rx.two_step {
                    // One-step: T2 arrives in the originTimestamp directly.
                    *wait &= !WAIT_FOLLOW_UP;
                    if let Some(ts) = rx.timestamp {
                        self.t2 = ts;
                    }
                }
                self.r2 = rx_ts;
                let Some(bytes) = self.msg.find_tlv(&self.buf, TlvId::CsptpResponse) else {
                    anyhow::bail!("RespSync without a CSPTP_RESPONSE TLV");
                };
                match CsptpResponse::decode(bytes) {
                    Ok(resp) => self.r1 = resp.req_ingress,
                    Err(err) => tracing::info!(%err, "CSPTP_RESPONSE ingress timestamp"),
                }
            }
            MsgType::FollowUp => {
                *wait &= !WAIT_FOLLOW_UP;
                if let Some(ts) = rx.timestamp {
                    self.t2 = ts;
                }
            }
        }
        Ok(true)
    }

    /// One full request/response cycle, including the pacing sleep. Returns
    /// the exchange when both expected messages arrived in time.
    pub fn run_cycle(&mut self) -> Result<Option<Exchange>> {
        let seq = self.sequence_id;
        self.send_req_sync()?;
        if self.two_step {
            self.send_follow_up()?;
        }

        let mut wait = WAIT_RESP_SYNC | WAIT_FOLLOW_UP;
        let mut loops = self.wait_loops;
        let mut timeouts: i64 = 0;
        while loops > 0 && wait != 0 {
            let readable = match self.socket.poll(self.poll_ms) {
                Ok(r) => r,
                Err(err) => {
                    tracing::debug!(%err, "poll");
                    false
                }
            };
            if readable {
                if !self.handle_datagram(&mut wait)? {
                    loops -= 1;
                }
            } else {
                loops -= 1;
                timeouts += 1;
            }
        }

        let exchange = if wait == 0 {
            let t1 = self.t1.as_nanos();
            let t2 = self.t2.as_nanos();
            let offset = t2.wrapping_sub(t1);
            tracing::info!(offset, "offset from master");
            let ex = Exchange {
                sequence_id: seq,
                t1,
                r1: self.r1.as_nanos(),
                t2,
                r2: self.r2.as_nanos(),
                offset,
            };
            tracing::debug!(t1 = ex.t1, r1 = ex.r1, t2 = ex.t2, r2 = ex.r2, "exchange times");
            Some(ex)
        } else {
            tracing::debug!(sequence_id = seq, "timed out waiting for response");
            None
        };

        self.sequence_id = if seq == 0xffff { 1 } else { seq + 1 };

        // Pace the next cycle, minus the poll time already burned. The
        // sleep ignores non-positive remainders.
        let mut pause = Timestamp::from_nanos(self.cycle_ms * NSEC_PER_MSEC);
        pause.add_milliseconds(-timeouts * self.poll_ms as i64);
        pause.sleep();
        Ok(exchange)
    }

    /// Cycle until shutdown. Per-cycle failures are logged and the next
    /// cycle proceeds.
    pub fn run(&mut self, mut reporter: Option<crate::report::Reporter>) -> Result<()> {
        while !shutdown::requested() {
            match self.run_cycle() {
                Ok(Some(ex)) => {
                    if let Some(rep) = reporter.as_mut() {
                        if let Err(err) = rep.append(ex.into()) {
                            tracing::warn!(%err, "measurement log");
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, "cycle failed"),
            }
        }
        tracing::debug!("exit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smooth_size_table() {
        assert_eq!(smooth_size(138), 0xa0);
        assert_eq!(smooth_size(108), 0x80);
        assert_eq!(smooth_size(102), 0x70);
        assert_eq!(smooth_size(72), 0x60);
        assert_eq!(smooth_size(150), 0xa0);
        assert_eq!(smooth_size(120), 0x90);
    }

    #[test]
    fn frame_payload_size_table() {
        assert_eq!(frame_payload_size(true, true, Protocol::Udp4), 138);
        assert_eq!(frame_payload_size(true, false, Protocol::Udp4), 108);
        assert_eq!(frame_payload_size(false, true, Protocol::Udp4), 102);
        assert_eq!(frame_payload_size(false, false, Protocol::Udp4), 72);
        assert_eq!(frame_payload_size(true, true, Protocol::Udp6), 150);
        assert_eq!(frame_payload_size(true, false, Protocol::Udp6), 120);
        assert_eq!(frame_payload_size(false, true, Protocol::Udp6), 102);
        assert_eq!(frame_payload_size(false, false, Protocol::Udp6), 72);
    }
}
