//! Server pool health tracking and candidate ordering.
//!
//! Servers are never removed. A server that reaches the failure threshold is
//! put in cooldown, with an exponential backoff between `cooldown_initial` and
//! `cooldown_max`; once the cooldown lapses it is tried again, after every
//! healthy server.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::{ServerEndpoint, ServiceConfig};
use crate::error::NtpError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    /// Stick with the last server that answered; move on only when it fails.
    #[default]
    Failover,
    /// Start each cycle one position further along the pool.
    RoundRobin,
    /// Always start from the first configured server.
    Priority,
}

#[derive(Debug, Clone)]
pub struct ServerPoolEntry {
    pub endpoint: ServerEndpoint,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    /// Cooldown applied the next time this server trips the threshold.
    pub backoff: Duration,
    pub cooldown_until: Option<Instant>,
    pub last_error: Option<NtpError>,
    /// Replies with a longer round trip count as failures.
    pub max_delay: Option<Duration>,
}

impl ServerPoolEntry {
    fn new(endpoint: ServerEndpoint, backoff: Duration, max_delay: Option<Duration>) -> Self {
        ServerPoolEntry {
            endpoint,
            consecutive_failures: 0,
            total_successes: 0,
            total_failures: 0,
            last_success: None,
            last_failure: None,
            backoff,
            cooldown_until: None,
            last_error: None,
            max_delay,
        }
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// Serializable per-server health, as published in the service snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHealth {
    pub server: String,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub cooling_down: bool,
    pub cooldown_remaining_ms: u64,
    pub last_error_code: i32,
}

pub struct ServerPool {
    entries: Vec<ServerPoolEntry>,
    policy: SelectionPolicy,
    failure_threshold: u32,
    cooldown_initial: Duration,
    cooldown_max: Duration,
    /// Position the next scan starts from (Failover / RoundRobin).
    cursor: usize,
}

impl ServerPool {
    pub fn new(config: &ServiceConfig) -> Self {
        let entries = config
            .servers
            .iter()
            .cloned()
            .map(|ep| {
                let max_delay = config.max_delay_for(&ep);
                ServerPoolEntry::new(ep, config.cooldown_initial(), max_delay)
            })
            .collect();
        ServerPool {
            entries,
            policy: config.selection,
            failure_threshold: config.failure_threshold.max(1),
            cooldown_initial: config.cooldown_initial(),
            cooldown_max: config.cooldown_max(),
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, idx: usize) -> &ServerPoolEntry {
        &self.entries[idx]
    }

    pub fn entries(&self) -> &[ServerPoolEntry] {
        &self.entries
    }

    /// Indices worth querying this cycle, each at most once, best first.
    ///
    /// Healthy servers come in policy order. Servers that tripped the
    /// threshold but whose cooldown has lapsed follow, fewest consecutive
    /// failures first. Servers still cooling down are left out.
    pub fn candidates(&mut self, now: Instant) -> Vec<usize> {
        let n = self.entries.len();
        if n == 0 {
            return Vec::new();
        }
        let start = match self.policy {
            SelectionPolicy::Priority => 0,
            SelectionPolicy::Failover => self.cursor % n,
            SelectionPolicy::RoundRobin => {
                let start = self.cursor % n;
                self.cursor = (start + 1) % n;
                start
            }
        };

        let mut healthy = Vec::with_capacity(n);
        let mut recovered = Vec::new();
        for idx in (0..n).map(|i| (start + i) % n) {
            let entry = &self.entries[idx];
            if entry.in_cooldown(now) {
                continue;
            }
            if entry.consecutive_failures < self.failure_threshold {
                healthy.push(idx);
            } else {
                recovered.push(idx);
            }
        }
        // Stable sort keeps rotation order among equals.
        recovered.sort_by_key(|&idx| self.entries[idx].consecutive_failures);
        healthy.extend(recovered);
        healthy
    }

    pub fn record_success(&mut self, idx: usize, now: Instant) {
        let initial = self.cooldown_initial;
        let entry = &mut self.entries[idx];
        if entry.consecutive_failures >= self.failure_threshold {
            info!(
                "[Pool] {} recovered after {} failures",
                entry.endpoint, entry.consecutive_failures
            );
        }
        entry.consecutive_failures = 0;
        entry.total_successes += 1;
        entry.last_success = Some(now);
        entry.backoff = initial;
        entry.cooldown_until = None;
        entry.last_error = None;
        if self.policy == SelectionPolicy::Failover {
            self.cursor = idx;
        }
    }

    pub fn record_failure(&mut self, idx: usize, error: &NtpError, now: Instant) {
        let threshold = self.failure_threshold;
        let max = self.cooldown_max;
        let entry = &mut self.entries[idx];
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.total_failures += 1;
        entry.last_failure = Some(now);
        entry.last_error = Some(error.clone());

        if entry.consecutive_failures >= threshold {
            let cooldown = entry.backoff;
            entry.cooldown_until = now.checked_add(cooldown);
            entry.backoff = cooldown.saturating_mul(2).min(max);
            warn!(
                "[Pool] {} failed {} times in a row ({}), cooling down for {:?}",
                entry.endpoint, entry.consecutive_failures, error, cooldown
            );
        } else {
            debug!(
                "[Pool] {} failure {}/{}: {}",
                entry.endpoint, entry.consecutive_failures, threshold, error
            );
        }
        let n = self.entries.len();
        if self.policy == SelectionPolicy::Failover && self.cursor == idx && n > 0 {
            self.cursor = (idx + 1) % n;
        }
    }

    /// Earliest instant at which some cooling server becomes eligible again.
    pub fn next_recovery(&self, now: Instant) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|e| e.cooldown_until)
            .filter(|until| *until > now)
            .min()
    }

    pub fn health(&self, now: Instant) -> Vec<ServerHealth> {
        self.entries
            .iter()
            .map(|e| ServerHealth {
                server: e.endpoint.to_string(),
                consecutive_failures: e.consecutive_failures,
                total_successes: e.total_successes,
                total_failures: e.total_failures,
                cooling_down: e.in_cooldown(now),
                cooldown_remaining_ms: e
                    .cooldown_until
                    .map_or(0, |until| until.saturating_duration_since(now).as_millis() as u64),
                last_error_code: crate::error::error_code(e.last_error.as_ref()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize, policy: SelectionPolicy, threshold: u32) -> ServerPool {
        let mut config = ServiceConfig::with_servers(
            (0..n).map(|i| ServerEndpoint::new(format!("s{}", i), 123)).collect(),
        );
        config.selection = policy;
        config.failure_threshold = threshold;
        config.cooldown_initial_ms = 1_000;
        config.cooldown_max_ms = 5_000;
        ServerPool::new(&config)
    }

    #[test]
    fn test_failover_sticks_to_last_good_server() {
        let mut pool = pool(3, SelectionPolicy::Failover, 3);
        let now = Instant::now();
        assert_eq!(pool.candidates(now), vec![0, 1, 2]);

        pool.record_failure(0, &NtpError::Timeout, now);
        pool.record_success(1, now);
        assert_eq!(pool.candidates(now), vec![1, 2, 0]);
        assert_eq!(pool.candidates(now), vec![1, 2, 0]);
    }

    #[test]
    fn test_round_robin_rotates_each_cycle() {
        let mut pool = pool(3, SelectionPolicy::RoundRobin, 3);
        let now = Instant::now();
        assert_eq!(pool.candidates(now), vec![0, 1, 2]);
        assert_eq!(pool.candidates(now), vec![1, 2, 0]);
        assert_eq!(pool.candidates(now), vec![2, 0, 1]);
        assert_eq!(pool.candidates(now), vec![0, 1, 2]);
    }

    #[test]
    fn test_priority_always_starts_at_head() {
        let mut pool = pool(3, SelectionPolicy::Priority, 3);
        let now = Instant::now();
        pool.record_success(2, now);
        assert_eq!(pool.candidates(now), vec![0, 1, 2]);
    }

    #[test]
    fn test_threshold_triggers_cooldown_and_recovery() {
        let mut pool = pool(2, SelectionPolicy::Priority, 2);
        let now = Instant::now();

        pool.record_failure(0, &NtpError::Timeout, now);
        assert!(!pool.entry(0).in_cooldown(now));
        assert_eq!(pool.candidates(now), vec![0, 1]);

        pool.record_failure(0, &NtpError::Timeout, now);
        assert!(pool.entry(0).in_cooldown(now));
        assert_eq!(pool.candidates(now), vec![1]);
        assert_eq!(pool.next_recovery(now), Some(now + Duration::from_secs(1)));

        // After cooldown it returns, but behind healthy servers.
        let later = now + Duration::from_millis(1_001);
        assert_eq!(pool.candidates(later), vec![1, 0]);

        pool.record_success(0, later);
        assert_eq!(pool.entry(0).consecutive_failures, 0);
        assert_eq!(pool.entry(0).backoff, Duration::from_secs(1));
        assert_eq!(pool.candidates(later), vec![0, 1]);
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut pool = pool(1, SelectionPolicy::Failover, 1);
        let mut now = Instant::now();
        let mut cooldowns = Vec::new();
        for _ in 0..5 {
            pool.record_failure(0, &NtpError::Timeout, now);
            let until = pool.entry(0).cooldown_until.unwrap();
            cooldowns.push(until - now);
            now = until;
        }
        let secs: Vec<u64> = cooldowns.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_all_cooling_yields_no_candidates() {
        let mut pool = pool(2, SelectionPolicy::Failover, 1);
        let now = Instant::now();
        pool.record_failure(0, &NtpError::Timeout, now);
        pool.record_failure(1, &NtpError::KissOfDeath("RATE".into()), now);
        assert!(pool.candidates(now).is_empty());

        let health = pool.health(now);
        assert!(health.iter().all(|h| h.cooling_down));
        assert_eq!(health[1].last_error_code, 9);
        assert_eq!(health[0].server, "s0:123");
    }

    #[test]
    fn test_recovered_ordered_by_fewest_failures() {
        let mut pool = pool(3, SelectionPolicy::Priority, 1);
        let now = Instant::now();
        for _ in 0..3 {
            pool.record_failure(0, &NtpError::Timeout, now);
        }
        pool.record_failure(1, &NtpError::Timeout, now);
        let later = now + Duration::from_secs(60);
        assert_eq!(pool.candidates(later), vec![2, 1, 0]);
    }

    #[test]
    fn test_entries_carry_delay_limits() {
        let mut config = ServiceConfig::with_servers(vec![
            ServerEndpoint::new("near", 123),
            ServerEndpoint::new("far", 123).with_max_delay_ms(1_000),
        ]);
        config.max_delay_ms = 100;
        let pool = ServerPool::new(&config);
        assert_eq!(pool.entry(0).max_delay, Some(Duration::from_millis(100)));
        assert_eq!(pool.entry(1).max_delay, Some(Duration::from_secs(1)));
    }
}
