//! Per-client token buckets.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::token_bucket::TokenBucket;

/// Lazily created token buckets keyed by client identity.
///
/// The table never holds more than `max_clients` buckets. When a new client
/// arrives at a full table, buckets that have refilled to capacity are
/// dropped first, then the ones with the most tokens left, until a quarter
/// of the table is free. Dropping a bucket that still owes tokens forgives
/// that debt, so the fullest go first.
#[derive(Debug)]
pub struct ClientBuckets<K> {
    capacity: u32,
    refill_rate: f64,
    max_clients: usize,
    buckets: Mutex<HashMap<K, Arc<TokenBucket>>>,
}

impl<K: Eq + Hash + Clone> ClientBuckets<K> {
    pub fn new(capacity: u32, refill_rate: f64, max_clients: usize) -> Self {
        Self {
            capacity,
            refill_rate,
            max_clients: max_clients.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, client: &K, n: u32) -> bool {
        self.try_acquire_at(client, n, Instant::now())
    }

    pub fn try_acquire_at(&self, client: &K, n: u32, now: Instant) -> bool {
        self.bucket_for(client, now).try_acquire_at(n, now)
    }

    /// Give back tokens taken from `client`'s bucket.
    pub fn refund(&self, client: &K, n: u32) {
        let bucket = self
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client)
            .cloned();
        if let Some(bucket) = bucket {
            bucket.refund(n);
        }
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bucket_for(&self, client: &K, now: Instant) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = buckets.get(client) {
            return Arc::clone(bucket);
        }

        if buckets.len() >= self.max_clients {
            self.make_room(&mut buckets, now);
        }

        let bucket = Arc::new(TokenBucket::starting_at(
            self.capacity,
            self.refill_rate,
            now,
        ));
        buckets.insert(client.clone(), Arc::clone(&bucket));
        bucket
    }

    fn make_room(&self, buckets: &mut HashMap<K, Arc<TokenBucket>>, now: Instant) {
        let target = self.max_clients - (self.max_clients / 4).max(1);
        let capacity = f64::from(self.capacity);
        let mut by_balance: Vec<(K, f64)> = buckets
            .iter()
            .map(|(client, bucket)| (client.clone(), bucket.available_at(now)))
            .collect();
        by_balance.sort_by(|a, b| b.1.total_cmp(&a.1));

        let before = buckets.len();
        let mut evicted = 0usize;
        for (client, available) in by_balance {
            let full = available >= capacity;
            if buckets.len() <= target && !full {
                break;
            }
            if !full {
                evicted += 1;
            }
            buckets.remove(&client);
        }
        tracing::debug!(
            pruned = before - buckets.len(),
            evicted,
            remaining = buckets.len(),
            "pruned client buckets"
        );
    }
}
