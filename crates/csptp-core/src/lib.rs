//! CSPTP core: bit-exact PTPv2 Sync/Follow_Up codec with CSPTP TLVs, the
//! timestamp value type, the per-client timestamp store, and the UDP socket
//! surface with kernel receive timestamps.
//!
//! The client and service engines live in the `csptp` binary crate; this
//! crate is the protocol machinery they drive.

pub mod addr;
pub mod buf;
pub mod error;
pub mod msg;
pub mod sock;
pub mod store;
pub mod time;
pub mod tlv;
pub mod wire;

pub use addr::{Address, Protocol, PTP_EVENT_PORT};
pub use buf::Buffer;
pub use error::{Error, Result};
pub use msg::{Message, MsgType, PtpParams, RxParams, MAX_TLVS, PTP_MSG_SIZE};
pub use sock::Sock;
pub use store::TimestampStore;
pub use time::Timestamp;
pub use tlv::TlvId;
