//! Timestamp value type.
//!
//! A point in time (or signed duration) as seconds + nanoseconds, with the
//! conversions the protocol needs: the 10-octet wire Timestamp (48-bit
//! unsigned seconds), the OS `timespec`, and a signed whole-nanoseconds
//! scalar. When the value represents a point in time the invariant
//! `0 <= nsec < NSEC_PER_SEC` holds; the scalar setter normalizes to a
//! non-negative remainder.

use crate::error::{Error, Result};
use crate::wire::{self, UINT48_MAX, WIRE_TIMESTAMP_LEN};

pub const NSEC_PER_SEC: i64 = 1_000_000_000;
pub const NSEC_PER_MSEC: i64 = 1_000_000;
pub const MSEC_PER_SEC: i64 = 1_000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    // Field order gives the derived Ord the lexicographic (secs, nsec)
    // comparison the protocol specifies.
    secs: i64,
    nsec: i64,
}

impl Timestamp {
    pub const fn new(secs: i64, nsec: i64) -> Self {
        Self { secs, nsec }
    }

    pub fn secs(&self) -> i64 {
        self.secs
    }

    pub fn nsec(&self) -> i64 {
        self.nsec
    }

    /// Current UTC time from `CLOCK_REALTIME`.
    pub fn now() -> Self {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        Self { secs: ts.tv_sec as i64, nsec: ts.tv_nsec as i64 }
    }

    /// From an OS timespec; refused when the nanoseconds are out of range.
    pub fn from_timespec(ts: &libc::timespec) -> Result<Self> {
        let nsec = ts.tv_nsec as i64;
        if !(0..NSEC_PER_SEC).contains(&nsec) {
            return Err(Error::Contract("timespec nanoseconds out of range"));
        }
        Ok(Self { secs: ts.tv_sec as i64, nsec })
    }

    pub fn to_timespec(&self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.secs as libc::time_t,
            tv_nsec: self.nsec as _,
        }
    }

    /// Decode the 10-octet wire Timestamp. Fails when the nanoseconds field
    /// is not a valid sub-second count.
    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < WIRE_TIMESTAMP_LEN {
            return Err(Error::Malformed("wire timestamp truncated"));
        }
        let nsec = wire::get_u32(buf, 6) as i64;
        if nsec >= NSEC_PER_SEC {
            tracing::warn!(nsec, "wire timestamp nanoseconds out of range");
            return Err(Error::Malformed("wire timestamp nanoseconds out of range"));
        }
        Ok(Self { secs: wire::get_u48(buf, 0) as i64, nsec })
    }

    /// Encode into the 10-octet wire Timestamp. Fails for negative seconds,
    /// seconds above the 48-bit ceiling, or nanoseconds out of range.
    pub fn to_wire(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < WIRE_TIMESTAMP_LEN {
            return Err(Error::Contract("wire timestamp buffer too small"));
        }
        if self.secs < 0 {
            tracing::warn!(secs = self.secs, "wire timestamp cannot hold negative time");
            return Err(Error::Contract("negative seconds"));
        }
        if !(0..NSEC_PER_SEC).contains(&self.nsec) {
            return Err(Error::Contract("nanoseconds out of range"));
        }
        if self.secs as u64 > UINT48_MAX {
            tracing::warn!(secs = self.secs, "seconds above 48-bit wire range");
            return Err(Error::Contract("seconds above 48-bit wire range"));
        }
        wire::put_u48(buf, 0, self.secs as u64)?;
        wire::put_u32(buf, 6, self.nsec as u32);
        Ok(())
    }

    /// Set from a signed whole-nanoseconds scalar; the remainder is kept
    /// non-negative so the sub-second invariant holds for negative inputs.
    pub fn set_nanos(&mut self, ns: i64) {
        self.secs = ns.div_euclid(NSEC_PER_SEC);
        self.nsec = ns.rem_euclid(NSEC_PER_SEC);
    }

    pub fn from_nanos(ns: i64) -> Self {
        let mut t = Self::default();
        t.set_nanos(ns);
        t
    }

    /// Whole-nanoseconds scalar `secs * 10^9 + nsec`.
    ///
    /// Wraps on i64 overflow: wire timestamps near the 48-bit seconds
    /// ceiling exceed i64 nanoseconds, and the recorded exchange vectors
    /// depend on the wrapped value.
    pub fn as_nanos(&self) -> i64 {
        self.secs.wrapping_mul(NSEC_PER_SEC).wrapping_add(self.nsec)
    }

    /// Add (or subtract) milliseconds, keeping the remainder non-negative.
    pub fn add_milliseconds(&mut self, ms: i64) {
        self.secs += ms.div_euclid(MSEC_PER_SEC);
        self.nsec += ms.rem_euclid(MSEC_PER_SEC) * NSEC_PER_MSEC;
        if self.nsec >= NSEC_PER_SEC {
            self.nsec -= NSEC_PER_SEC;
            self.secs += 1;
        }
    }

    /// Sleep for this duration. Non-positive whole seconds are a no-op;
    /// interruption by a signal returns normally.
    pub fn sleep(&self) {
        if self.secs <= 0 {
            return;
        }
        let req = self.to_timespec();
        let rc = unsafe { libc::nanosleep(&req, std::ptr::null_mut()) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                tracing::info!("sleep interrupted by signal");
            } else {
                tracing::error!(%err, "nanosleep");
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.secs == 0 && self.nsec == 0
    }
}

/// Monotonic seconds for age stamping (immune to wall-clock steps).
pub fn monotonic_secs() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64
}
