//! Admission control ahead of slot contention.
//!
//! Requests are admitted against an optional process-wide token bucket and
//! optional per-client buckets before they ever wait for a slot.

mod client_buckets;
mod token_bucket;

use std::net::IpAddr;

use thiserror::Error;

pub use client_buckets::ClientBuckets;
pub use token_bucket::TokenBucket;

/// Capacity and refill rate of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Burst size.
    pub capacity: u32,
    /// Sustained requests per second.
    pub refill_per_second: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AdmissionConfig {
    pub global: Option<RateLimit>,
    pub per_client: Option<RateLimit>,
    /// Upper bound on tracked clients before idle buckets are pruned.
    pub max_clients: usize,
}

/// The request was rejected before any work started.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionRejected {
    #[error("server request budget exhausted, retry later")]
    Global,
    #[error("too many requests from {0}, retry later")]
    Client(IpAddr),
}

/// Global and per-client admission.
#[derive(Debug)]
pub struct Admission {
    global: Option<TokenBucket>,
    per_client: Option<ClientBuckets<IpAddr>>,
}

impl Admission {
    pub fn new(config: &AdmissionConfig) -> Self {
        let max_clients = if config.max_clients == 0 {
            1024
        } else {
            config.max_clients
        };
        Self {
            global: config
                .global
                .map(|l| TokenBucket::new(l.capacity, l.refill_per_second)),
            per_client: config
                .per_client
                .map(|l| ClientBuckets::new(l.capacity, l.refill_per_second, max_clients)),
        }
    }

    /// Admission that accepts everything.
    pub fn unlimited() -> Self {
        Self {
            global: None,
            per_client: None,
        }
    }

    /// Admit one request.
    ///
    /// The client's own budget is charged before the global one. A rejected
    /// request leaves both budgets as they were.
    pub fn check(&self, client: Option<IpAddr>) -> Result<(), AdmissionRejected> {
        let charged = match (&self.per_client, client) {
            (Some(buckets), Some(ip)) => {
                if !buckets.try_acquire(&ip, 1) {
                    return Err(AdmissionRejected::Client(ip));
                }
                Some((buckets, ip))
            }
            _ => None,
        };
        if let Some(bucket) = &self.global {
            if !bucket.try_acquire(1) {
                if let Some((buckets, ip)) = charged {
                    buckets.refund(&ip, 1);
                }
                return Err(AdmissionRejected::Global);
            }
        }
        Ok(())
    }
}
