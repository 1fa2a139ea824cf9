//! TLV identifiers, layouts, and typed bodies.
//!
//! Every TLV is a 4-octet header (`tlvType`, `lengthField`, both u16, length
//! excluding the header) followed by a typed body. Offsets below are from
//! the start of the TLV, header included.
//!
//! TLV layout summary (fixed bytes include the header):
//!
//!   ALTERNATE_TIME_OFFSET_INDICATOR (9)   20 + even(displayName len), name <= 10
//!   CSPTP_REQUEST  (0xff00)                8
//!   CSPTP_RESPONSE (0xff01)               28
//!   CSPTP_STATUS   (0xf002)               32 + address len (4 or 16)
//!   PAD            (0x8008)                4 + any zero payload

use crate::addr::Protocol;
use crate::error::{Error, Result};
use crate::time::Timestamp;
use crate::wire;

/// TLV header size.
pub const TLV_HDR: usize = 4;

/// ALTERNATE_TIME_OFFSET_INDICATOR display-name ceiling.
pub const MAX_TZ_LEN: usize = 10;

/// CSPTP_REQUEST flags0: client requests the CSPTP_STATUS TLV.
pub const REQ_FLAG_STATUS: u8 = 1 << 0;
/// CSPTP_REQUEST flags0: client requests ALTERNATE_TIME_OFFSET_INDICATOR.
pub const REQ_FLAG_ALT_TIME: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvId {
    AlternateTimeOffsetIndicator = 9,
    CsptpRequest = 0xff00,
    CsptpResponse = 0xff01,
    CsptpStatus = 0xf002,
    Pad = 0x8008,
}

impl TlvId {
    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            9 => Some(TlvId::AlternateTimeOffsetIndicator),
            0xff00 => Some(TlvId::CsptpRequest),
            0xff01 => Some(TlvId::CsptpResponse),
            0xf002 => Some(TlvId::CsptpStatus),
            0x8008 => Some(TlvId::Pad),
            _ => None,
        }
    }

    pub fn wire(&self) -> u16 {
        *self as u16
    }

    /// Minimum total TLV size (header included).
    pub fn min_size(&self) -> usize {
        match self {
            TlvId::AlternateTimeOffsetIndicator => ALT_TIME_MIN,
            TlvId::CsptpRequest => CSPTP_REQUEST_LEN,
            TlvId::CsptpResponse => CSPTP_RESPONSE_LEN,
            TlvId::CsptpStatus => CSPTP_STATUS_MIN,
            TlvId::Pad => TLV_HDR,
        }
    }
}

pub const CSPTP_REQUEST_LEN: usize = 8;
pub const CSPTP_RESPONSE_LEN: usize = 28;
pub const CSPTP_STATUS_MIN: usize = 32;
pub const ALT_TIME_MIN: usize = 20;

/// Reservation size for ALTERNATE_TIME_OFFSET_INDICATOR with the longest
/// display name.
pub const ALT_TIME_FULL: usize = ALT_TIME_MIN + MAX_TZ_LEN;

/// CSPTP_STATUS size for a parent address of the given family.
pub fn status_size(proto: Protocol) -> usize {
    CSPTP_STATUS_MIN + proto.addr_len()
}

#[inline]
pub fn even(n: usize) -> usize {
    n + (n & 1)
}

/// Check a received TLV's declared total length against its type-specific
/// size rule. `tlv` covers the whole TLV (header included) at its declared
/// length; the caller has already bounded it within the message.
pub fn check_wire_size(id: TlvId, tlv: &[u8]) -> bool {
    let len = tlv.len();
    match id {
        TlvId::CsptpRequest => len == CSPTP_REQUEST_LEN,
        TlvId::CsptpResponse => len == CSPTP_RESPONSE_LEN,
        TlvId::CsptpStatus => {
            if len < CSPTP_STATUS_MIN {
                return false;
            }
            let proto = match Protocol::from_wire(wire::get_u16(tlv, 28)) {
                Some(p) => p,
                None => {
                    tracing::info!(proto = wire::get_u16(tlv, 28), "unsupported parent protocol");
                    return false;
                }
            };
            let addr_len = wire::get_u16(tlv, 30) as usize;
            addr_len == proto.addr_len() && len == CSPTP_STATUS_MIN + addr_len
        }
        TlvId::AlternateTimeOffsetIndicator => {
            if len < ALT_TIME_MIN {
                return false;
            }
            len == ALT_TIME_MIN + even(tlv[19] as usize)
        }
        TlvId::Pad => true,
    }
}

fn write_hdr(tlv: &mut [u8], id: TlvId, total: usize) {
    wire::put_u16(tlv, 0, id.wire());
    wire::put_u16(tlv, 2, (total - TLV_HDR) as u16);
}

// ---------------------------------------------------------------------------
// CSPTP_REQUEST
// ---------------------------------------------------------------------------

/// CSPTP_REQUEST body: four flag octets, of which only `flags[0]` bits 0
/// (status request) and 1 (alternate-time request) are defined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsptpRequest {
    pub flags0: u8,
}

impl CsptpRequest {
    pub fn wants_status(&self) -> bool {
        self.flags0 & REQ_FLAG_STATUS != 0
    }

    pub fn wants_alt_time(&self) -> bool {
        self.flags0 & REQ_FLAG_ALT_TIME != 0
    }

    /// Write the complete TLV (header included). Undefined flag bits are
    /// masked off, the remaining flag octets stay zero.
    pub fn encode(&self, tlv: &mut [u8]) {
        write_hdr(tlv, TlvId::CsptpRequest, CSPTP_REQUEST_LEN);
        tlv[4] = self.flags0 & (REQ_FLAG_STATUS | REQ_FLAG_ALT_TIME);
        tlv[5] = 0;
        tlv[6] = 0;
        tlv[7] = 0;
    }

    pub fn decode(tlv: &[u8]) -> Result<Self> {
        if tlv.len() < CSPTP_REQUEST_LEN {
            return Err(Error::Malformed("CSPTP_REQUEST too short"));
        }
        Ok(Self { flags0: tlv[4] })
    }
}

// ---------------------------------------------------------------------------
// CSPTP_RESPONSE
// ---------------------------------------------------------------------------

/// CSPTP_RESPONSE body: organization ids, the service's receive timestamp of
/// the request (R1), and the request correction field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsptpResponse {
    pub organization_id: [u8; 3],
    pub organization_sub_type: [u8; 3],
    pub req_ingress: Timestamp,
    pub req_correction: i64,
}

impl CsptpResponse {
    pub fn encode(&self, tlv: &mut [u8]) -> Result<()> {
        write_hdr(tlv, TlvId::CsptpResponse, CSPTP_RESPONSE_LEN);
        tlv[4..7].copy_from_slice(&self.organization_id);
        tlv[7..10].copy_from_slice(&self.organization_sub_type);
        self.req_ingress.to_wire(&mut tlv[10..20])?;
        wire::put_u64(tlv, 20, self.req_correction as u64);
        Ok(())
    }

    pub fn decode(tlv: &[u8]) -> Result<Self> {
        if tlv.len() < CSPTP_RESPONSE_LEN {
            return Err(Error::Malformed("CSPTP_RESPONSE too short"));
        }
        Ok(Self {
            organization_id: tlv[4..7].try_into().unwrap(),
            organization_sub_type: tlv[7..10].try_into().unwrap(),
            req_ingress: Timestamp::from_wire(&tlv[10..20])?,
            req_correction: wire::get_u64(tlv, 20) as i64,
        })
    }
}

// ---------------------------------------------------------------------------
// CSPTP_STATUS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
}

/// Parent port address: protocol tag plus matching raw IP octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl PortAddress {
    pub fn proto(&self) -> Protocol {
        match self {
            PortAddress::V4(_) => Protocol::Udp4,
            PortAddress::V6(_) => Protocol::Udp6,
        }
    }

    pub fn octets(&self) -> &[u8] {
        match self {
            PortAddress::V4(o) => o,
            PortAddress::V6(o) => o,
        }
    }
}

/// CSPTP_STATUS body: grandmaster description plus the parent port address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsptpStatus {
    pub organization_id: [u8; 3],
    pub organization_sub_type: [u8; 3],
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub steps_removed: u16,
    pub current_utc_offset: i16,
    pub grandmaster_identity: [u8; 8],
    pub parent_address: PortAddress,
}

impl CsptpStatus {
    pub fn encoded_len(&self) -> usize {
        status_size(self.parent_address.proto())
    }

    pub fn encode(&self, tlv: &mut [u8]) {
        let total = self.encoded_len();
        write_hdr(tlv, TlvId::CsptpStatus, total);
        tlv[4..7].copy_from_slice(&self.organization_id);
        tlv[7..10].copy_from_slice(&self.organization_sub_type);
        tlv[10] = self.grandmaster_priority1;
        tlv[11] = self.grandmaster_clock_quality.clock_class;
        tlv[12] = self.grandmaster_clock_quality.clock_accuracy;
        wire::put_u16(tlv, 13, self.grandmaster_clock_quality.offset_scaled_log_variance);
        tlv[15] = self.grandmaster_priority2;
        wire::put_u16(tlv, 16, self.steps_removed);
        wire::put_u16(tlv, 18, self.current_utc_offset as u16);
        tlv[20..28].copy_from_slice(&self.grandmaster_identity);
        wire::put_u16(tlv, 28, self.parent_address.proto() as u16);
        let octets = self.parent_address.octets();
        wire::put_u16(tlv, 30, octets.len() as u16);
        tlv[32..32 + octets.len()].copy_from_slice(octets);
    }

    pub fn decode(tlv: &[u8]) -> Result<Self> {
        if tlv.len() < CSPTP_STATUS_MIN + 4 {
            return Err(Error::Malformed("CSPTP_STATUS too short"));
        }
        let proto = Protocol::from_wire(wire::get_u16(tlv, 28))
            .ok_or(Error::Malformed("CSPTP_STATUS parent protocol unknown"))?;
        let addr_len = wire::get_u16(tlv, 30) as usize;
        if addr_len != proto.addr_len() || tlv.len() < CSPTP_STATUS_MIN + addr_len {
            return Err(Error::Malformed("CSPTP_STATUS address length mismatch"));
        }
        let parent_address = match proto {
            Protocol::Udp4 => PortAddress::V4(tlv[32..36].try_into().unwrap()),
            Protocol::Udp6 => PortAddress::V6(tlv[32..48].try_into().unwrap()),
        };
        Ok(Self {
            organization_id: tlv[4..7].try_into().unwrap(),
            organization_sub_type: tlv[7..10].try_into().unwrap(),
            grandmaster_priority1: tlv[10],
            grandmaster_clock_quality: ClockQuality {
                clock_class: tlv[11],
                clock_accuracy: tlv[12],
                offset_scaled_log_variance: wire::get_u16(tlv, 13),
            },
            grandmaster_priority2: tlv[15],
            steps_removed: wire::get_u16(tlv, 16),
            current_utc_offset: wire::get_u16(tlv, 18) as i16,
            grandmaster_identity: tlv[20..28].try_into().unwrap(),
            parent_address,
        })
    }
}

// ---------------------------------------------------------------------------
// ALTERNATE_TIME_OFFSET_INDICATOR
// ---------------------------------------------------------------------------

/// ALTERNATE_TIME_OFFSET_INDICATOR body: alternate-timescale description
/// with a short display name (time-zone acronym, at most 10 octets; odd
/// lengths are padded on the wire with one zero octet).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AltTimeOffset {
    pub key_field: u8,
    pub current_offset: i32,
    pub jump_seconds: i32,
    pub time_of_next_jump: u64,
    pub display_name: String,
}

impl AltTimeOffset {
    pub fn encoded_len(&self) -> usize {
        ALT_TIME_MIN + even(self.display_name.len())
    }

    pub fn encode(&self, tlv: &mut [u8]) -> Result<()> {
        let name = self.display_name.as_bytes();
        if name.len() > MAX_TZ_LEN {
            tracing::warn!(
                name = %self.display_name,
                "time-zone name exceeds {} octets",
                MAX_TZ_LEN
            );
            return Err(Error::Contract("display name too long"));
        }
        write_hdr(tlv, TlvId::AlternateTimeOffsetIndicator, self.encoded_len());
        tlv[4] = self.key_field;
        wire::put_u32(tlv, 5, self.current_offset as u32);
        wire::put_u32(tlv, 9, self.jump_seconds as u32);
        wire::put_u48(tlv, 13, self.time_of_next_jump)?;
        tlv[19] = name.len() as u8;
        tlv[20..20 + name.len()].copy_from_slice(name);
        if name.len() & 1 == 1 {
            tlv[20 + name.len()] = 0;
        }
        Ok(())
    }

    pub fn decode(tlv: &[u8]) -> Result<Self> {
        if tlv.len() < ALT_TIME_MIN {
            return Err(Error::Malformed("ALTERNATE_TIME_OFFSET_INDICATOR too short"));
        }
        let name_len = tlv[19] as usize;
        if name_len > MAX_TZ_LEN || tlv.len() < ALT_TIME_MIN + name_len {
            return Err(Error::Malformed("display name length inconsistent"));
        }
        let display_name = String::from_utf8_lossy(&tlv[20..20 + name_len]).into_owned();
        Ok(Self {
            key_field: tlv[4],
            current_offset: wire::get_u32(tlv, 5) as i32,
            jump_seconds: wire::get_u32(tlv, 9) as i32,
            time_of_next_jump: wire::get_u48(tlv, 13),
            display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Wire image from the 160-octet service response vector.
    const STATUS_V4: [u8; 36] = [
        0xf0, 2, 0, 32, 1, 2, 3, 4, 5, 6, 127, 12, 73, 0, 7, 127, 0, 0, 0, 37, 1, 2, 3, 254, 255,
        4, 5, 6, 0, 1, 0, 4, 1, 4, 7, 0,
    ];
    const ALT_CEST: [u8; 24] = [
        0, 9, 0, 20, 1, 0, 0, 42, 48, 0, 0, 0, 1, 0, 0, 0, 2, 174, 247, 4, b'C', b'E', b'S', b'T',
    ];

    #[test]
    fn min_sizes() {
        assert_eq!(TlvId::AlternateTimeOffsetIndicator.min_size(), 20);
        assert_eq!(ALT_TIME_FULL, 30);
        assert_eq!(TlvId::CsptpRequest.min_size(), 8);
        assert_eq!(TlvId::CsptpResponse.min_size(), 28);
        assert_eq!(status_size(Protocol::Udp4), 36);
        assert_eq!(status_size(Protocol::Udp6), 48);
        assert_eq!(TlvId::Pad.min_size(), 4);
    }

    #[test]
    fn request_masks_undefined_bits() {
        let mut b = [0xAAu8; CSPTP_REQUEST_LEN];
        CsptpRequest { flags0: 0xff }.encode(&mut b);
        assert_eq!(b, [0xff, 0x00, 0, 4, 3, 0, 0, 0]);
        let r = CsptpRequest::decode(&b).unwrap();
        assert!(r.wants_status());
        assert!(r.wants_alt_time());
    }

    #[test]
    fn response_round_trip() {
        let resp = CsptpResponse {
            organization_id: [1, 2, 3],
            organization_sub_type: [4, 5, 6],
            req_ingress: Timestamp::new(0x0400_0300, 0x0004_0003),
            req_correction: 0x0102_0304_0506_0708,
        };
        let mut b = [0u8; CSPTP_RESPONSE_LEN];
        resp.encode(&mut b).unwrap();
        assert_eq!(&b[0..4], &[0xff, 1, 0, 24]);
        assert_eq!(CsptpResponse::decode(&b).unwrap(), resp);
    }

    #[test]
    fn status_wire_image() {
        let st = CsptpStatus {
            organization_id: [1, 2, 3],
            organization_sub_type: [4, 5, 6],
            grandmaster_priority1: 127,
            grandmaster_clock_quality: ClockQuality {
                clock_class: 12,
                clock_accuracy: 73,
                offset_scaled_log_variance: 7,
            },
            grandmaster_priority2: 127,
            steps_removed: 0,
            current_utc_offset: 37,
            grandmaster_identity: [1, 2, 3, 254, 255, 4, 5, 6],
            parent_address: PortAddress::V4([1, 4, 7, 0]),
        };
        let mut b = [0u8; 36];
        st.encode(&mut b);
        assert_eq!(b, STATUS_V4);
        assert_eq!(CsptpStatus::decode(&b).unwrap(), st);
        assert!(check_wire_size(TlvId::CsptpStatus, &b));
    }

    #[test]
    fn status_v6_round_trip() {
        let mut ip = [0u8; 16];
        ip[0] = 0xfd;
        ip[15] = 1;
        let st = CsptpStatus {
            organization_id: [9, 9, 9],
            organization_sub_type: [8, 8, 8],
            grandmaster_priority1: 1,
            grandmaster_clock_quality: ClockQuality {
                clock_class: 37,
                clock_accuracy: 0xfe,
                offset_scaled_log_variance: 0x101,
            },
            grandmaster_priority2: 201,
            steps_removed: 0x202,
            current_utc_offset: 0xe78,
            grandmaster_identity: [7; 8],
            parent_address: PortAddress::V6(ip),
        };
        let mut b = [0u8; 48];
        st.encode(&mut b);
        assert_eq!(CsptpStatus::decode(&b).unwrap(), st);
        // Family/length mismatch is rejected.
        let mut bad = b;
        wire::put_u16(&mut bad, 30, 4);
        assert!(!check_wire_size(TlvId::CsptpStatus, &bad));
    }

    #[test]
    fn alt_time_wire_image() {
        let alt = AltTimeOffset {
            key_field: 1,
            current_offset: 10_800,
            jump_seconds: 1,
            time_of_next_jump: 175_863,
            display_name: "CEST".into(),
        };
        let mut b = [0u8; 24];
        alt.encode(&mut b).unwrap();
        assert_eq!(b, ALT_CEST);
        assert_eq!(AltTimeOffset::decode(&b).unwrap(), alt);
    }

    #[test]
    fn alt_time_odd_name_pads_with_zero() {
        for name in ["", "C", "CET", "AEST", "LORDHOWE10"] {
            let alt = AltTimeOffset { display_name: name.into(), ..Default::default() };
            let total = alt.encoded_len();
            assert_eq!(total, ALT_TIME_MIN + even(name.len()));
            let mut b = vec![0xAAu8; total];
            alt.encode(&mut b).unwrap();
            if name.len() & 1 == 1 {
                assert_eq!(b[total - 1], 0);
            }
            assert_eq!(AltTimeOffset::decode(&b).unwrap().display_name, name);
            assert!(check_wire_size(TlvId::AlternateTimeOffsetIndicator, &b));
        }
    }

    #[test]
    fn alt_time_rejects_long_name() {
        let alt = AltTimeOffset { display_name: "ELEVENCHARS".into(), ..Default::default() };
        let mut b = [0u8; 32];
        assert!(alt.encode(&mut b).is_err());
    }

    #[test]
    fn wire_size_checks() {
        let mut req = [0u8; CSPTP_REQUEST_LEN];
        CsptpRequest { flags0: 1 }.encode(&mut req);
        assert!(check_wire_size(TlvId::CsptpRequest, &req));
        assert!(!check_wire_size(TlvId::CsptpRequest, &req[..6]));

        // ALT with a declared name longer than the TLV.
        let mut alt = ALT_CEST;
        alt[19] = 6;
        assert!(!check_wire_size(TlvId::AlternateTimeOffsetIndicator, &alt));

        assert!(check_wire_size(TlvId::Pad, &[0x80, 0x08, 0, 0]));
    }
}
