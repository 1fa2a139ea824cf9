//! PTP message codec for CSPTP unicast.
//!
//! A message is the fixed 44-octet header (34 octets of fields plus the
//! 10-octet origin / precise-origin timestamp) followed by up to four TLVs
//! and an optional terminating PAD. All fields are network order.
//!
//! Header layout:
//!
//!   Byte    0       = messageType (low nibble) | majorSdoId << 4
//!   Byte    1       = versionPTP (minor << 4 | major)
//!   Bytes   2 ..  3 = messageLength (header + TLVs + PAD)
//!   Byte    4       = domainNumber
//!   Byte    5       = minorSdoId
//!   Bytes   6 ..  7 = flagField[0], flagField[1]
//!   Bytes   8 .. 15 = correctionField (i64, ns * 2^16)
//!   Bytes  16 .. 19 = messageTypeSpecific (always zero)
//!   Bytes  20 .. 29 = sourcePortIdentity (always zero under CSPTP)
//!   Bytes  30 .. 31 = sequenceId
//!   Byte   32       = controlField (0 = Sync, 2 = Follow_Up)
//!   Byte   33       = logMessageInterval (0x7f for unicast)
//!   Bytes  34 .. 43 = originTimestamp / preciseOriginTimestamp
//!
//! The `Message` container tracks TLV descriptors by offset, never holding a
//! borrow of the buffer; every operation takes the buffer explicitly and
//! `detach` drops the association.
//!
//! Build protocol: `init`, then per TLV `next_tlv` (reserve) + typed
//! `encode` into the reservation + `add_tlv` (measure and record), or
//! `add_req_tlv` for CSPTP_REQUEST, then `build_done` which appends the PAD
//! and stamps `messageLength`. Bodies are written big-endian at fill time.

use crate::buf::Buffer;
use crate::error::{Error, Result};
use crate::time::Timestamp;
use crate::tlv::{self, TlvId, TLV_HDR};
use crate::wire;

/// Fixed PTP message size: 34-octet header + 10-octet timestamp.
pub const PTP_MSG_SIZE: usize = 44;

/// Maximum number of TLVs in one message.
pub const MAX_TLVS: usize = 4;

const VERSION_PTP: u8 = 2;
const MINOR_VERSION_PTP: u8 = 1;
const VERSION_FIELD: u8 = (MINOR_VERSION_PTP << 4) | VERSION_PTP;
const MAJOR_SDO_ID: u8 = 0x3;
const MINOR_SDO_ID: u8 = 0x00;
const TWO_STEP_FLAG: u8 = 1 << 1;
const UNICAST_FLAG: u8 = 1 << 2;
const LOG_MSG_INTERVAL_UNICAST: u8 = 0x7f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Sync = 0,
    FollowUp = 8,
}

impl MsgType {
    fn control_field(&self) -> u8 {
        match self {
            MsgType::Sync => 0,
            MsgType::FollowUp => 2,
        }
    }

    fn from_nibble(v: u8) -> Option<Self> {
        match v {
            0 => Some(MsgType::Sync),
            8 => Some(MsgType::FollowUp),
            _ => None,
        }
    }
}

/// Transmit parameters for `init`.
#[derive(Debug, Clone, Copy)]
pub struct PtpParams {
    pub msg_type: MsgType,
    pub domain_number: u8,
    pub correction_field: i64,
    pub sequence_id: u16,
    pub flag_field2: u8,
    pub two_step: bool,
    pub timestamp: Timestamp,
}

impl Default for PtpParams {
    fn default() -> Self {
        Self {
            msg_type: MsgType::Sync,
            domain_number: 0,
            correction_field: 0,
            sequence_id: 0,
            flag_field2: 0,
            two_step: false,
            timestamp: Timestamp::default(),
        }
    }
}

/// Header fields extracted by `parse`. The timestamp is `None` when the wire
/// nanoseconds field was out of range (the rest of the message still parses).
#[derive(Debug, Clone, Copy)]
pub struct RxParams {
    pub msg_type: MsgType,
    pub domain_number: u8,
    pub correction_field: i64,
    pub sequence_id: u16,
    pub flag_field2: u8,
    pub two_step: bool,
    pub timestamp: Option<Timestamp>,
}

/// One recorded TLV: where it lies in the buffer, its total size (header
/// included), and its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvDesc {
    pub offset: usize,
    pub len: usize,
    pub id: TlvId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Detached,
    Building,
    Frozen,
    Parsed,
}

#[derive(Debug)]
pub struct Message {
    state: State,
    msg_type: Option<MsgType>,
    /// Message length without any PAD appended by `build_done`.
    len: usize,
    /// Offset of the first unused octet.
    end: usize,
    /// Octets still available for TLVs.
    left: usize,
    tlvs: Vec<TlvDesc>,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    pub fn new() -> Self {
        Self {
            state: State::Detached,
            msg_type: None,
            len: 0,
            end: 0,
            left: 0,
            tlvs: Vec::with_capacity(MAX_TLVS),
        }
    }

    /// Start building: write the 44-octet header and enter the building
    /// state with zero TLVs. `messageLength` stays zero until `build_done`.
    pub fn init(&mut self, params: &PtpParams, buf: &mut Buffer) -> Result<()> {
        let size = buf.size();
        if size < PTP_MSG_SIZE {
            tracing::error!(size, "buffer is too small for a PTP message");
            return Err(Error::Contract("buffer too small for PTP message"));
        }
        let b = buf.as_mut_slice();
        b[..PTP_MSG_SIZE].fill(0);
        b[0] = params.msg_type as u8 | (MAJOR_SDO_ID << 4);
        b[1] = VERSION_FIELD;
        b[4] = params.domain_number;
        b[5] = MINOR_SDO_ID;
        b[6] = UNICAST_FLAG | if params.two_step { TWO_STEP_FLAG } else { 0 };
        b[7] = params.flag_field2;
        wire::put_u64(b, 8, params.correction_field as u64);
        // messageTypeSpecific and sourcePortIdentity stay zero.
        wire::put_u16(b, 30, params.sequence_id);
        b[32] = params.msg_type.control_field();
        b[33] = LOG_MSG_INTERVAL_UNICAST;
        params.timestamp.to_wire(&mut b[34..44])?;

        buf.set_len(PTP_MSG_SIZE)?;
        self.state = State::Building;
        self.msg_type = Some(params.msg_type);
        self.len = PTP_MSG_SIZE;
        self.end = PTP_MSG_SIZE;
        self.left = size - PTP_MSG_SIZE;
        self.tlvs.clear();
        Ok(())
    }

    /// Reserve room for the next TLV and return the zeroed region. The
    /// caller fills it (header included) with a typed `encode` before
    /// calling [`add_tlv`](Self::add_tlv). Odd sizes reserve one extra octet
    /// for the even-padding rule.
    pub fn next_tlv<'b>(&mut self, buf: &'b mut Buffer, need: usize) -> Result<&'b mut [u8]> {
        if self.state != State::Building {
            tracing::error!("message is not in building state");
            return Err(Error::Contract("message was not initialized"));
        }
        let need = tlv::even(need);
        if self.tlvs.len() == MAX_TLVS {
            tracing::warn!("message is full with TLVs");
            return Err(Error::Exhausted("TLV count at maximum"));
        }
        if need > self.left {
            return Err(Error::Exhausted("no room for TLV"));
        }
        let region = &mut buf.as_mut_slice()[self.end..self.end + need];
        region.fill(0);
        Ok(region)
    }

    /// Record the TLV the caller just encoded at the reservation. The size
    /// is measured from the type-specific fields in the region (display-name
    /// length for the alternate-time TLV, parent address family for the
    /// status TLV). CSPTP_REQUEST must go through
    /// [`add_req_tlv`](Self::add_req_tlv) and PAD is appended by
    /// [`build_done`](Self::build_done) only.
    pub fn add_tlv(&mut self, buf: &mut Buffer, id: TlvId) -> Result<()> {
        if self.state != State::Building {
            tracing::error!("message is not in building state");
            return Err(Error::Contract("message was not initialized"));
        }
        if self.tlvs.len() == MAX_TLVS {
            tracing::warn!("message is full with TLVs");
            return Err(Error::Exhausted("TLV count at maximum"));
        }
        if self.left < TLV_HDR {
            tracing::error!("message buffer is too small");
            return Err(Error::Exhausted("no room for TLV header"));
        }
        let mut sz = id.min_size();
        if sz > self.left {
            tracing::error!("message buffer is too small");
            return Err(Error::Exhausted("no room for TLV"));
        }
        let b = buf.as_slice();
        match id {
            TlvId::AlternateTimeOffsetIndicator => {
                let name_len = tlv::even(b[self.end + 19] as usize);
                if name_len > tlv::MAX_TZ_LEN {
                    tracing::error!(name_len, "time-zone acronym exceeds allowed maximum");
                    return Err(Error::Contract("display name too long"));
                }
                sz += name_len;
            }
            TlvId::CsptpStatus => {
                let proto = parent_protocol(wire::get_u16(b, self.end + 28))?;
                sz += proto.addr_len();
            }
            TlvId::CsptpResponse => {}
            TlvId::CsptpRequest => return Err(Error::Contract("use add_req_tlv for CSPTP_REQUEST")),
            TlvId::Pad => return Err(Error::Contract("PAD is appended by build_done")),
        }
        if sz > self.left {
            tracing::error!("message buffer is too small");
            return Err(Error::Exhausted("no room for TLV"));
        }
        // The encoded header must agree with what we measured.
        if wire::get_u16(b, self.end) != id.wire()
            || wire::get_u16(b, self.end + 2) as usize + TLV_HDR != sz
        {
            tracing::error!(id = id.wire(), "TLV region was not encoded before add");
            return Err(Error::Contract("TLV header does not match reservation"));
        }
        self.record(buf, sz, id)
    }

    /// Reserve, encode, and record a CSPTP_REQUEST TLV in one step.
    pub fn add_req_tlv(&mut self, buf: &mut Buffer, flags0: u8) -> Result<()> {
        if self.state != State::Building {
            tracing::error!("message is not in building state");
            return Err(Error::Contract("message was not initialized"));
        }
        if self.tlvs.len() == MAX_TLVS {
            tracing::warn!("message is full with TLVs");
            return Err(Error::Exhausted("TLV count at maximum"));
        }
        if self.left < tlv::CSPTP_REQUEST_LEN {
            tracing::error!("message buffer is too small");
            return Err(Error::Exhausted("no room for CSPTP_REQUEST"));
        }
        let end = self.end;
        tlv::CsptpRequest { flags0 }
            .encode(&mut buf.as_mut_slice()[end..end + tlv::CSPTP_REQUEST_LEN]);
        self.record(buf, tlv::CSPTP_REQUEST_LEN, TlvId::CsptpRequest)
    }

    fn record(&mut self, buf: &mut Buffer, sz: usize, id: TlvId) -> Result<()> {
        self.tlvs.push(TlvDesc { offset: self.end, len: sz, id });
        self.end += sz;
        self.left -= sz;
        self.len += sz;
        buf.set_len(self.len)
    }

    /// Finish building: pad the message out to `size` octets (zero keeps the
    /// current length), stamp `messageLength`, and freeze. `size` must be
    /// even, no smaller than the current length, and fit the buffer; a
    /// non-zero pad must have room for the 4-octet PAD header.
    pub fn build_done(&mut self, buf: &mut Buffer, size: usize) -> Result<()> {
        if self.state != State::Building {
            tracing::error!("message is not in building state");
            return Err(Error::Contract("message was not initialized"));
        }
        let size = if size == 0 {
            self.len
        } else {
            if size & 1 == 1 {
                tracing::error!(size, "message size is odd");
                return Err(Error::Contract("size is odd"));
            }
            if size < self.len {
                tracing::error!(size, len = self.len, "message will not shrink");
                return Err(Error::Contract("message will not shrink"));
            }
            if size > buf.size() {
                tracing::error!(size, "message buffer is too small");
                return Err(Error::Contract("size exceeds buffer"));
            }
            size
        };
        let pad = size - self.len;
        if pad > 0 && (pad < TLV_HDR || self.left < pad) {
            return Err(Error::Exhausted("no room for PAD header"));
        }
        let b = buf.as_mut_slice();
        wire::put_u16(b, 2, size as u16);
        if pad >= TLV_HDR {
            wire::put_u16(b, self.end, TlvId::Pad.wire());
            wire::put_u16(b, self.end + 2, (pad - TLV_HDR) as u16);
            b[self.end + TLV_HDR..self.end + pad].fill(0);
            if self.tlvs.len() < MAX_TLVS {
                self.tlvs.push(TlvDesc { offset: self.end, len: pad, id: TlvId::Pad });
            }
            self.end += pad;
            self.len += pad;
            self.left -= pad;
        }
        buf.set_len(size)?;
        self.state = State::Frozen;
        Ok(())
    }

    /// Parse a received message. The header is validated against the CSPTP
    /// unicast profile; TLVs are recorded up to the first invalid or unknown
    /// one (what precedes it is kept and the parse still succeeds). On
    /// failure the container keeps its previous state.
    pub fn parse(&mut self, buf: &Buffer) -> Result<RxParams> {
        let len = buf.len();
        if len < PTP_MSG_SIZE {
            tracing::info!(len, "message is too short");
            return Err(Error::Malformed("message too short"));
        }
        let b = buf.as_slice();
        let msg_len = wire::get_u16(b, 2) as usize;
        if msg_len > len {
            tracing::warn!(msg_len, len, "received fewer octets than the message length");
            return Err(Error::Malformed("message length exceeds received data"));
        }
        if msg_len < PTP_MSG_SIZE {
            tracing::warn!(msg_len, "message length below the PTP header size");
            return Err(Error::Malformed("message length too small"));
        }
        let msg_type = match MsgType::from_nibble(b[0] & 0xf) {
            Some(t) => t,
            None => {
                tracing::info!(nibble = b[0] & 0xf, "unsupported message type");
                return Err(Error::Malformed("unsupported message type"));
            }
        };
        if b[32] != msg_type.control_field() {
            tracing::warn!(control = b[32], "wrong controlField value");
            return Err(Error::Malformed("wrong controlField"));
        }
        if b[33] != LOG_MSG_INTERVAL_UNICAST {
            tracing::warn!(interval = b[33], "wrong logMessageInterval value");
            return Err(Error::Malformed("wrong logMessageInterval"));
        }
        if b[1] != VERSION_FIELD {
            tracing::warn!(version = b[1], "wrong versionPTP value");
            return Err(Error::Malformed("wrong versionPTP"));
        }
        if b[0] >> 4 != MAJOR_SDO_ID {
            tracing::warn!(sdo = b[0] >> 4, "wrong majorSdoId value");
            return Err(Error::Malformed("wrong majorSdoId"));
        }
        if b[20..30].iter().any(|&o| o != 0) {
            tracing::warn!("sourcePortIdentity is not zero");
            return Err(Error::Malformed("sourcePortIdentity not zero"));
        }
        if b[5] != MINOR_SDO_ID {
            tracing::warn!(sdo = b[5], "wrong minorSdoId value");
            return Err(Error::Malformed("wrong minorSdoId"));
        }
        if b[6] & !TWO_STEP_FLAG != UNICAST_FLAG {
            tracing::warn!(flags = b[6], "wrong flagField[0] value");
            return Err(Error::Malformed("wrong flagField[0]"));
        }
        if b[7] & 0xc0 != 0 {
            tracing::warn!(flags = b[7], "wrong flagField[1] value");
            return Err(Error::Malformed("wrong flagField[1]"));
        }

        let mut tlvs = Vec::with_capacity(MAX_TLVS);
        let mut off = PTP_MSG_SIZE;
        let mut span = msg_len - PTP_MSG_SIZE;
        while span > TLV_HDR && tlvs.len() < MAX_TLVS {
            let id = match TlvId::from_wire(wire::get_u16(b, off)) {
                Some(id) => id,
                None => {
                    tracing::info!(id = wire::get_u16(b, off), index = tlvs.len(), "unknown TLV");
                    break;
                }
            };
            let tlv_len = wire::get_u16(b, off + 2) as usize + TLV_HDR;
            if tlv_len < id.min_size() {
                tracing::info!(id = id.wire(), "TLV too short");
                break;
            }
            if tlv_len > span {
                tracing::warn!(id = id.wire(), "TLV overflows message");
                break;
            }
            if !tlv::check_wire_size(id, &b[off..off + tlv_len]) {
                tracing::warn!(id = id.wire(), "TLV with wrong size");
                break;
            }
            tlvs.push(TlvDesc { offset: off, len: tlv_len, id });
            off += tlv_len;
            span -= tlv_len;
        }

        self.state = State::Parsed;
        self.msg_type = Some(msg_type);
        self.len = msg_len;
        self.end = off;
        self.left = span + buf.size() - msg_len;
        self.tlvs = tlvs;
        Ok(RxParams {
            msg_type,
            domain_number: b[4],
            correction_field: wire::get_u64(b, 8) as i64,
            sequence_id: wire::get_u16(b, 30),
            flag_field2: b[7],
            two_step: b[6] & TWO_STEP_FLAG != 0,
            timestamp: Timestamp::from_wire(&b[34..44]).ok(),
        })
    }

    /// Copy the message's declared length (PAD included) into another
    /// buffer.
    pub fn copy(&self, src: &Buffer, dst: &mut Buffer) -> Result<()> {
        if self.state == State::Detached {
            tracing::warn!("message has no buffer");
            return Err(Error::Contract("message is detached"));
        }
        if self.len < PTP_MSG_SIZE || self.len > src.size() {
            return Err(Error::Contract("message length inconsistent"));
        }
        if dst.size() < self.len {
            tracing::error!(need = self.len, size = dst.size(), "buffer is too small");
            return Err(Error::Contract("destination buffer too small"));
        }
        dst.set_len(self.len)?;
        dst.as_mut_slice()[..self.len].copy_from_slice(&src.as_slice()[..self.len]);
        Ok(())
    }

    /// Drop the buffer association; operations other than `init`/`parse`
    /// refuse until re-initialized.
    pub fn detach(&mut self) {
        self.state = State::Detached;
        self.msg_type = None;
        self.len = 0;
        self.end = 0;
        self.left = 0;
        self.tlvs.clear();
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        self.msg_type
    }

    /// Message length; excludes the PAD until `build_done` appends it.
    pub fn msg_len(&self) -> usize {
        self.len
    }

    pub fn num_tlvs(&self) -> usize {
        self.tlvs.len()
    }

    pub fn tlv_desc(&self, index: usize) -> Option<&TlvDesc> {
        self.tlvs.get(index)
    }

    /// The recorded TLV's octets (header included) within `buf`.
    pub fn tlv_bytes<'b>(&self, buf: &'b Buffer, index: usize) -> Option<&'b [u8]> {
        let d = self.tlvs.get(index)?;
        buf.as_slice().get(d.offset..d.offset + d.len)
    }

    /// First recorded TLV of the given id.
    pub fn find_tlv<'b>(&self, buf: &'b Buffer, id: TlvId) -> Option<&'b [u8]> {
        (0..self.tlvs.len())
            .find(|&i| self.tlvs[i].id == id)
            .and_then(|i| self.tlv_bytes(buf, i))
    }
}

fn parent_protocol(v: u16) -> Result<crate::addr::Protocol> {
    crate::addr::Protocol::from_wire(v).ok_or_else(|| {
        tracing::error!(proto = v, "unsupported network protocol");
        Error::Contract("unsupported network protocol")
    })
}
