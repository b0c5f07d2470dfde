//! Background time sync over a pool of NTP servers.
//!
//! The polling task owns the pool and is the only writer of `SyncState`. Each
//! cycle it publishes a fresh immutable snapshot through `ArcSwap`; readers on
//! any thread load the current snapshot without locking and never wait on the
//! writer.
//!
//! The task sits behind a mutex shared by the periodic timer and on-demand
//! measurements, so cycles never overlap.

use arc_swap::ArcSwap;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::clock::{LocalClock, SystemClock};
use crate::config::{ConfigError, ServerEndpoint, ServiceConfig};
use crate::error::{error_code, NtpError};
use crate::ntp::{ExchangeResult, ExchangeSample};
use crate::pool::{ServerHealth, ServerPool};
use crate::scheduler::{FireAt, TimerHandle, TimerScheduler};
use crate::status::SyncStatus;
use crate::traits::NtpSource;

/// One published view of the sync state.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// Published offset, smoothed when `smoothing_alpha` < 1.
    pub offset_us: i64,
    /// Offset measured by the last successful exchange.
    pub sample_offset_us: i64,
    pub delay_us: i64,
    pub stratum: Option<u8>,
    pub server: Option<ServerEndpoint>,
    pub last_sync: Option<Instant>,
    pub last_sync_unix_us: Option<i64>,
    pub last_error: Option<NtpError>,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub servers: Vec<ServerHealth>,
}

/// Exponential smoothing of the published offset; `alpha` is the weight of
/// the new sample.
pub fn smooth_offset(previous_us: i64, sample_us: i64, alpha: f64) -> i64 {
    if alpha >= 1.0 {
        return sample_us;
    }
    let alpha = alpha.max(0.0);
    let step = alpha * (sample_us - previous_us) as f64;
    previous_us + step.round() as i64
}

fn check_delay(sample: ExchangeSample, limit: Option<Duration>) -> ExchangeResult {
    let Some(limit) = limit else {
        return Ok(sample);
    };
    let limit_us = i64::try_from(limit.as_micros()).unwrap_or(i64::MAX);
    if sample.delay_us > limit_us {
        return Err(NtpError::DelayTooHigh {
            delay_us: sample.delay_us,
            limit_us,
        });
    }
    Ok(sample)
}

/// State carried by the periodic timer: the pool and the query seam.
pub struct PollTask<S> {
    pool: ServerPool,
    source: S,
    config: ServiceConfig,
    state: Arc<ArcSwap<SyncState>>,
}

impl<S> PollTask<S>
where
    S: NtpSource,
{
    pub fn new(config: &ServiceConfig, source: S, state: Arc<ArcSwap<SyncState>>) -> Self {
        PollTask {
            pool: ServerPool::new(config),
            source,
            config: config.clone(),
            state,
        }
    }

    /// Swaps in a new server list. Health counters start over.
    pub fn replace_servers(&mut self, servers: Vec<ServerEndpoint>) -> Result<(), ConfigError> {
        let config = ServiceConfig {
            servers,
            ..self.config.clone()
        };
        config.validate()?;
        info!("[Sync] server pool replaced ({} server(s))", config.servers.len());
        self.pool = ServerPool::new(&config);
        self.config = config;

        let prev = self.state.load();
        let next = SyncState {
            servers: self.pool.health(Instant::now()),
            ..SyncState::clone(&prev)
        };
        self.state.store(Arc::new(next));
        Ok(())
    }

    /// Tries candidates in order until one answers, then publishes.
    pub fn run_cycle(&mut self) -> ExchangeResult {
        let candidates = self.pool.candidates(Instant::now());
        if candidates.is_empty() {
            match self.pool.next_recovery(Instant::now()) {
                Some(at) => warn!(
                    "[Sync] every server is cooling down, next retry in {:?}",
                    at.saturating_duration_since(Instant::now())
                ),
                None => warn!("[Sync] no servers available"),
            }
        }

        let mut result = Err(NtpError::NoServersAvailable);
        let timeout = self.config.query_timeout();
        for idx in candidates {
            let entry = self.pool.entry(idx);
            let (endpoint, limit) = (entry.endpoint.clone(), entry.max_delay);
            let outcome = self
                .source
                .query(&endpoint, timeout)
                .and_then(|sample| check_delay(sample, limit));
            match outcome {
                Ok(sample) => {
                    self.pool.record_success(idx, Instant::now());
                    result = Ok((endpoint, sample));
                    break;
                }
                Err(e) => {
                    self.pool.record_failure(idx, &e, Instant::now());
                    result = Err(e);
                }
            }
        }

        match result {
            Ok((endpoint, sample)) => {
                self.publish_success(endpoint, sample);
                Ok(sample)
            }
            Err(e) => {
                self.publish_failure(&e);
                Err(e)
            }
        }
    }

    fn publish_success(&self, endpoint: ServerEndpoint, sample: ExchangeSample) {
        let prev = self.state.load();
        let was_synced = prev.last_sync.is_some();
        let offset_us = if was_synced {
            smooth_offset(prev.offset_us, sample.offset_us, self.config.smoothing_alpha)
        } else {
            sample.offset_us
        };
        let next = SyncState {
            offset_us,
            sample_offset_us: sample.offset_us,
            delay_us: sample.delay_us,
            stratum: Some(sample.stratum),
            server: Some(endpoint),
            last_sync: Some(Instant::now()),
            last_sync_unix_us: Some(sample.local_time_us),
            last_error: None,
            cycles: prev.cycles + 1,
            failed_cycles: prev.failed_cycles,
            servers: self.pool.health(Instant::now()),
        };
        if was_synced {
            debug!(
                "[Sync] offset {}us (delay {}us) from {}",
                next.offset_us,
                next.delay_us,
                next.server.as_ref().map_or_else(String::new, |s| s.to_string())
            );
        } else {
            info!(
                "[Sync] first sync: offset {}us (delay {}us, stratum {})",
                sample.offset_us, sample.delay_us, sample.stratum
            );
        }
        self.state.store(Arc::new(next));
    }

    fn publish_failure(&self, error: &NtpError) {
        let prev = self.state.load();
        let next = SyncState {
            last_error: Some(error.clone()),
            cycles: prev.cycles + 1,
            failed_cycles: prev.failed_cycles + 1,
            servers: self.pool.health(Instant::now()),
            ..SyncState::clone(&prev)
        };
        warn!(
            "[Sync] cycle {} failed: {} (keeping offset {}us)",
            next.cycles, error, next.offset_us
        );
        self.state.store(Arc::new(next));
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }
}

type SharedTask = Arc<Mutex<PollTask<Box<dyn NtpSource>>>>;

fn lock_task(task: &SharedTask) -> MutexGuard<'_, PollTask<Box<dyn NtpSource>>> {
    task.lock().unwrap_or_else(|e| e.into_inner())
}

/// Periodically synchronized UTC clock.
///
/// Time reads never touch the network: they add the last published offset
/// to the local clock. After failures the previous offset stays in effect and
/// `get_last_error_code`/`is_stale` report the problem.
pub struct NtpTimeService<C = SystemClock>
where
    C: LocalClock + Clone + 'static,
{
    state: Arc<ArcSwap<SyncState>>,
    task: SharedTask,
    clock: C,
    timer: TimerHandle,
    poll_interval: Duration,
}

impl NtpTimeService<SystemClock> {
    pub fn start<S>(
        config: ServiceConfig,
        scheduler: &TimerScheduler,
        source: S,
    ) -> Result<Self, ConfigError>
    where
        S: NtpSource + 'static,
    {
        NtpTimeService::start_with_clock(config, scheduler, source, SystemClock)
    }
}

impl<C> NtpTimeService<C>
where
    C: LocalClock + Clone + 'static,
{
    /// Validates the config and registers the polling task with `scheduler`.
    pub fn start_with_clock<S>(
        config: ServiceConfig,
        scheduler: &TimerScheduler,
        source: S,
        clock: C,
    ) -> Result<Self, ConfigError>
    where
        S: NtpSource + 'static,
    {
        config.validate()?;
        let state = Arc::new(ArcSwap::from_pointee(SyncState::default()));
        let source: Box<dyn NtpSource> = Box::new(source);
        let task: SharedTask = Arc::new(Mutex::new(PollTask::new(&config, source, state.clone())));

        let interval = config.poll_interval();
        let first = if config.measure_immediately {
            Duration::ZERO
        } else {
            interval
        };
        let polled = task.clone();
        let timer = scheduler.schedule_periodic(FireAt::After(first), interval, move || {
            // Failures are already recorded in the published state.
            let _ = lock_task(&polled).run_cycle();
            Ok(())
        });

        info!(
            "[Sync] polling {} server(s) every {:?} ({:?} selection)",
            config.servers.len(),
            interval,
            config.selection
        );
        Ok(NtpTimeService {
            state,
            task,
            clock,
            timer,
            poll_interval: interval,
        })
    }

    pub fn get_utc_time_us(&self) -> i64 {
        self.clock.now_us() + self.state.load().offset_us
    }

    pub fn get_utc_time_ms(&self) -> i64 {
        self.get_utc_time_us().div_euclid(1_000)
    }

    pub fn get_utc_time(&self) -> i64 {
        self.get_utc_time_us().div_euclid(1_000_000)
    }

    pub fn get_offset_us(&self) -> i64 {
        self.state.load().offset_us
    }

    pub fn get_last_error_code(&self) -> i32 {
        error_code(self.state.load().last_error.as_ref())
    }

    pub fn last_error(&self) -> Option<NtpError> {
        self.state.load().last_error.clone()
    }

    pub fn snapshot(&self) -> Arc<SyncState> {
        self.state.load_full()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus::from_state(&self.state.load())
    }

    pub fn is_synchronized(&self) -> bool {
        self.state.load().last_sync.is_some()
    }

    /// True when no exchange has succeeded within `max_age` (or ever).
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.state
            .load()
            .last_sync
            .map_or(true, |at| at.elapsed() > max_age)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Queues one extra sync cycle to run as soon as `scheduler` gets to it.
    /// The periodic schedule is unaffected.
    pub fn measure_now(&self, scheduler: &TimerScheduler) -> TimerHandle {
        let task = self.task.clone();
        scheduler.schedule_once(Duration::ZERO, move || {
            let _ = lock_task(&task).run_cycle();
            Ok(())
        })
    }

    /// Runs one sync cycle on the calling thread. Waits for a cycle already
    /// in progress to finish first.
    pub fn force_measure(&self) -> ExchangeResult {
        lock_task(&self.task).run_cycle()
    }

    /// Replaces the server pool. Takes effect from the next cycle; per-server
    /// health starts over while the current offset stays published.
    pub fn set_servers(&self, servers: Vec<ServerEndpoint>) -> Result<(), ConfigError> {
        lock_task(&self.task).replace_servers(servers)
    }

    /// Stops polling. The last offset stays readable.
    pub fn shutdown(&self) -> bool {
        self.timer.cancel()
    }
}

impl<C> Drop for NtpTimeService<C>
where
    C: LocalClock + Clone + 'static,
{
    fn drop(&mut self) {
        self.timer.cancel();
    }
}
