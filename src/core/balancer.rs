//! Instance selection strategies for outbound traffic.
//!
//! The balancer is a pure chooser: given a candidate list it picks one
//! instance, it never filters or health-checks. Round-robin position is kept
//! per candidate-list identity so interleaved requests for different services
//! (or different snapshots of the same service) rotate independently.
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use scc::HashMap;
use serde::{Deserialize, Serialize};

use crate::core::instance::ServiceInstance;

/// Selection strategy for picking one instance out of the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Rotate through candidates in order
    #[default]
    RoundRobin,
    /// Uniformly random pick
    Random,
    /// Weighted pick; instances carry no weights yet, so this currently
    /// behaves as round-robin
    Weighted,
    /// Candidate with the fewest in-flight connections
    LeastConnections,
    /// Stable pick per client key, falling back to round-robin without one
    IpHash,
}

/// Stateful load balancer shared by all routes.
///
/// Connection accounting is keyed by `host:port`, so replicas sharing an
/// address share a count.
pub struct LoadBalancer {
    rr_counters: HashMap<u64, AtomicUsize>,
    connections: HashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            rr_counters: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    /// Pick one instance from `candidates`, or `None` when the list is empty.
    ///
    /// `client_key` feeds [`Strategy::IpHash`]; other strategies ignore it.
    pub fn select(
        &self,
        candidates: &[ServiceInstance],
        strategy: &Strategy,
        client_key: Option<&str>,
    ) -> Option<ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let index = match strategy {
            Strategy::RoundRobin | Strategy::Weighted => self.round_robin_index(candidates),
            Strategy::Random => rand::random_range(0..candidates.len()),
            Strategy::LeastConnections => self.least_connections_index(candidates),
            Strategy::IpHash => match client_key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() as usize) % candidates.len()
                }
                None => self.round_robin_index(candidates),
            },
        };

        candidates.get(index).cloned()
    }

    fn round_robin_index(&self, candidates: &[ServiceInstance]) -> usize {
        let key = candidate_list_key(candidates);
        let entry = self
            .rr_counters
            .entry_sync(key)
            .or_insert_with(|| AtomicUsize::new(0));
        entry.get().fetch_add(1, Ordering::Relaxed) % candidates.len()
    }

    fn least_connections_index(&self, candidates: &[ServiceInstance]) -> usize {
        let mut best = 0;
        let mut best_count = usize::MAX;
        for (i, instance) in candidates.iter().enumerate() {
            let count = self.active_connections(&instance.endpoint.authority());
            // Strict comparison keeps ties on the first-seen candidate.
            if count < best_count {
                best = i;
                best_count = count;
            }
        }
        best
    }

    /// In-flight connection count for an address.
    pub fn active_connections(&self, authority: &str) -> usize {
        self.connections
            .read_sync(authority, |_, count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a connection start. Prefer [`track`](Self::track), which pairs
    /// the decrement automatically.
    pub fn increment_connections(&self, authority: &str) {
        let entry = self
            .connections
            .entry_sync(authority.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        entry.get().fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection end. Saturates at zero.
    pub fn decrement_connections(&self, authority: &str) {
        self.connections.update_sync(authority, |_, count| {
            let mut current = count.load(Ordering::Relaxed);
            while current > 0 {
                match count.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        });
    }

    /// Count a connection for the duration of the returned guard.
    pub fn track(self: &Arc<Self>, authority: &str) -> ConnectionGuard {
        self.increment_connections(authority);
        ConnectionGuard {
            balancer: Arc::clone(self),
            authority: authority.to_string(),
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard pairing one increment with exactly one decrement.
pub struct ConnectionGuard {
    balancer: Arc<LoadBalancer>,
    authority: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.balancer.decrement_connections(&self.authority);
    }
}

/// Identity of a candidate list: instance ids hashed in order.
fn candidate_list_key(candidates: &[ServiceInstance]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for instance in candidates {
        instance.id.hash(&mut hasher);
    }
    hasher.finish()
}
