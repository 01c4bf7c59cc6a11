//! Request counters for the proxy
//!
//! Created once by the binary and passed to the server; there is no global
//! registry, so every server (and every test) gets its own set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Requests received
    pub total_requests: AtomicU64,
    /// Requests rejected with 401
    pub unauthenticated: AtomicU64,
    /// Requests rejected with 403
    pub forbidden: AtomicU64,
    /// Access reviews that failed to produce a decision
    pub authorization_errors: AtomicU64,
    /// Upstream connection or exchange failures
    pub upstream_failures: AtomicU64,
    /// Stream tunnels opened
    pub tunnels: AtomicU64,
    /// Stream tunnel negotiations observed
    pub negotiations: AtomicU64,
    /// Cumulative stream tunnel negotiation latency
    pub negotiation_micros: AtomicU64,
}

impl ProxyStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unauthenticated(&self) {
        self.unauthenticated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forbidden(&self) {
        self.forbidden.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authorization_error(&self) {
        self.authorization_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel(&self) {
        self.tunnels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negotiation(&self, latency: Duration) {
        self.negotiations.fetch_add(1, Ordering::Relaxed);
        self.negotiation_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_unauthenticated(&self) -> u64 {
        self.unauthenticated.load(Ordering::Relaxed)
    }

    pub fn get_forbidden(&self) -> u64 {
        self.forbidden.load(Ordering::Relaxed)
    }

    pub fn get_authorization_errors(&self) -> u64 {
        self.authorization_errors.load(Ordering::Relaxed)
    }

    pub fn get_upstream_failures(&self) -> u64 {
        self.upstream_failures.load(Ordering::Relaxed)
    }

    pub fn get_tunnels(&self) -> u64 {
        self.tunnels.load(Ordering::Relaxed)
    }

    pub fn get_negotiations(&self) -> u64 {
        self.negotiations.load(Ordering::Relaxed)
    }

    /// Mean negotiation latency, if any negotiation was recorded
    pub fn mean_negotiation_latency(&self) -> Option<Duration> {
        let count = self.get_negotiations();
        if count == 0 {
            return None;
        }
        let total = self.negotiation_micros.load(Ordering::Relaxed);
        Some(Duration::from_micros(total / count))
    }
}
