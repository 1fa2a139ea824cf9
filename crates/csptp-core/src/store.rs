//! Per-client timestamp retention for two-step follow-up.
//!
//! The service records the T2 it captured when transmitting a RespSync,
//! keyed by the client's IP, and fetches it when emitting the Follow_Up.
//! The sequence id is carried for validation but is not part of the key.
//!
//! Records live in `2^h` buckets (`h` in 0..=32, 0 means a single bucket);
//! the bucket is selected from the IPv4 integer value or the low 32 bits of
//! the IPv6 address, masked. Within a bucket, keys order like `memcmp` of
//! the raw IP. One mutex guards the whole store; `cleanup` relocks around
//! every removal so `update` makes progress while eviction runs from
//! another thread.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::addr::{Address, Protocol};
use crate::error::{Error, Result};
use crate::time::{monotonic_secs, Timestamp};

/// Raw-IP key; derived ordering is lexicographic on the octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ClientKey {
    V4([u8; 4]),
    V6([u8; 16]),
}

#[derive(Debug, Clone, Copy)]
struct Record {
    ts: Timestamp,
    sequence_id: u16,
    /// Monotonic seconds of the last update.
    last_update: i64,
}

#[derive(Debug)]
pub struct TimestampStore {
    proto: Protocol,
    mask: u32,
    buckets: Mutex<Vec<BTreeMap<ClientKey, Record>>>,
}

impl TimestampStore {
    /// `hash_bits` selects the bucket count (`2^hash_bits`); zero uses a
    /// single list, more than 32 is refused.
    pub fn new(proto: Protocol, hash_bits: u32) -> Result<Self> {
        if hash_bits > 32 {
            tracing::warn!(hash_bits, "hash exceeds 32 bits");
            return Err(Error::Contract("hash exceeds 32 bits"));
        }
        let size = 1usize << hash_bits;
        let mask = (size as u64 - 1) as u32;
        Ok(Self {
            proto,
            mask,
            buckets: Mutex::new(vec![BTreeMap::new(); size]),
        })
    }

    pub fn hash_size(&self) -> usize {
        self.mask as usize + 1
    }

    fn key_of(&self, addr: &Address) -> Result<ClientKey> {
        match (self.proto, addr.ip()) {
            (Protocol::Udp4, IpAddr::V4(ip)) => Ok(ClientKey::V4(ip.octets())),
            (Protocol::Udp6, IpAddr::V6(ip)) => Ok(ClientKey::V6(ip.octets())),
            _ => Err(Error::Contract("address family does not match store")),
        }
    }

    fn bucket_of(&self, addr: &Address) -> usize {
        let v = addr.v4_value().or_else(|| addr.v6_low32()).unwrap_or(0);
        (v & self.mask) as usize
    }

    /// Insert or replace the record for this client.
    pub fn update(&self, addr: &Address, ts: Timestamp, sequence_id: u16) -> Result<()> {
        self.update_at(addr, ts, sequence_id, monotonic_secs())
    }

    fn update_at(&self, addr: &Address, ts: Timestamp, sequence_id: u16, now: i64) -> Result<()> {
        let key = self.key_of(addr)?;
        let bucket = self.bucket_of(addr);
        let mut buckets = self.buckets.lock().unwrap();
        buckets[bucket].insert(key, Record { ts, sequence_id, last_update: now });
        Ok(())
    }

    /// Look up the client's record; `None` when missing or when the stored
    /// sequence id differs. `clear` zeroes the stored timestamp after a hit
    /// (the record itself stays until cleanup).
    pub fn fetch(&self, addr: &Address, sequence_id: u16, clear: bool) -> Option<Timestamp> {
        let key = self.key_of(addr).ok()?;
        let bucket = self.bucket_of(addr);
        let mut buckets = self.buckets.lock().unwrap();
        let rec = buckets[bucket].get_mut(&key)?;
        if rec.sequence_id != sequence_id {
            return None;
        }
        let ts = rec.ts;
        if clear {
            rec.ts = Timestamp::default();
        }
        Some(ts)
    }

    /// Remove every record whose last update is older than `age_secs`.
    /// Returns the number removed. The lock is dropped and retaken around
    /// each removal so concurrent updates are not starved.
    pub fn cleanup(&self, age_secs: u32) -> usize {
        self.cleanup_before(monotonic_secs() - age_secs as i64)
    }

    fn cleanup_before(&self, cutoff: i64) -> usize {
        let num_buckets = self.hash_size();
        let mut removed = 0;
        for bucket in 0..num_buckets {
            loop {
                let mut buckets = self.buckets.lock().unwrap();
                let expired = buckets[bucket]
                    .iter()
                    .find(|(_, r)| r.last_update < cutoff)
                    .map(|(k, _)| *k);
                match expired {
                    Some(key) => {
                        buckets[bucket].remove(&key);
                        removed += 1;
                    }
                    None => break,
                }
            }
        }
        removed
    }

    /// Number of records currently stored.
    pub fn records(&self) -> usize {
        self.buckets.lock().unwrap().iter().map(|b| b.len()).sum()
    }
}
