//! Replay protection for signed ingest requests.
//!
//! A nonce is held until its request timestamp leaves the acceptance window,
//! i.e. until `request_ts + window`. The timestamp check admits a request
//! anywhere in `[ts - window, ts + window]`, so retention has to follow the
//! signed timestamp rather than the server time of first use. Expired entries
//! are swept once the cache grows past `prune_threshold`.

use parking_lot::Mutex;
use std::collections::HashMap;

pub const DEFAULT_PRUNE_THRESHOLD: usize = 10_000;

pub struct NonceCache {
    /// nonce -> unix second after which it may be forgotten
    expires: Mutex<HashMap<String, i64>>,
    window_secs: i64,
    prune_threshold: usize,
}

impl NonceCache {
    pub fn new(window_secs: i64, prune_threshold: usize) -> Self {
        Self {
            expires: Mutex::new(HashMap::new()),
            window_secs,
            prune_threshold: prune_threshold.max(1),
        }
    }

    /// Record `nonce` for a request signed at `request_ts` (unix seconds).
    /// Returns `false` when the nonce is still held (a replay).
    pub fn check_and_record(&self, nonce: &str, request_ts: i64, now: i64) -> bool {
        let mut expires = self.expires.lock();

        if let Some(&until) = expires.get(nonce) {
            if now <= until {
                return false;
            }
        }
        let until = request_ts.max(now) + self.window_secs;
        expires.insert(nonce.to_string(), until);

        if expires.len() > self.prune_threshold {
            expires.retain(|_, until| *until >= now);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.expires.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
