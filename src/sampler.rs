//! Per-process sliding-window sampler of requests per second.
//!
//! The sampler keys an atomic counter by 1-second epoch bucket. Each inbound
//! request increments the current bucket before any business handling; when
//! the post-increment count exceeds the configured limit, a [`RateEvent`] is
//! emitted. Limiting is advisory: the request always proceeds, and nothing
//! the sampler does can fail it.
//!
//! Bucket counters are process-local and never persisted; a restart resets
//! them.

use crate::{
    concurrent_map::ConcurrentMap,
    model::RateEvent,
};
use chrono::{DateTime, Utc};
use conf::Conf;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// Buckets older than this many seconds are garbage collected.
const BUCKET_RETENTION_SECS: i64 = 10;

/// Config options for the request-rate sampler.
#[derive(Clone, Conf, Debug)]
#[conf(serde)]
pub struct SamplerConfig {
    /// Requests per second above which rate events are emitted.
    #[conf(long, env, default_value = "100")]
    pub rate_limit_per_sec: u32,
    /// Disable rate sampling entirely (observe becomes a no-op).
    #[conf(long, env)]
    pub rate_sampling_disabled: bool,
}

/// Sliding-window counter of requests per second.
///
/// Shared across all request-handling tasks. The hot path is a read lock on
/// the bucket map plus one atomic increment; the write lock is taken only
/// when a new second starts, and bucket GC is amortized to once per second.
#[derive(Debug)]
pub struct RateSampler {
    config: SamplerConfig,
    buckets: ConcurrentMap<i64, AtomicU32>,
    last_gc_sec: AtomicI64,
}

impl RateSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            buckets: ConcurrentMap::new(),
            last_gc_sec: AtomicI64::new(0),
        }
    }

    /// Record one inbound request for `service_name` at the current time.
    ///
    /// Returns a [`RateEvent`] when this request pushed the current second's
    /// count above the configured limit. Never blocks and never fails the
    /// request.
    pub fn observe(&self, service_name: &str) -> Option<RateEvent> {
        self.observe_at(service_name, Utc::now())
    }

    /// [`Self::observe`] with an explicit timestamp.
    pub fn observe_at(&self, service_name: &str, now: DateTime<Utc>) -> Option<RateEvent> {
        if self.config.rate_sampling_disabled {
            return None;
        }

        let sec = now.timestamp();
        let count = self.buckets.with(
            &sec,
            || AtomicU32::new(0),
            |counter| counter.fetch_add(1, Ordering::SeqCst) + 1,
        );

        self.maybe_gc(sec);

        if count > self.config.rate_limit_per_sec {
            Some(RateEvent {
                service_name: service_name.to_owned(),
                timestamp: now,
                current_rate: count,
                limit: self.config.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    /// Drop buckets older than the retention window, at most once per
    /// observed second. The compare-exchange makes sure only one caller per
    /// second pays for the sweep.
    fn maybe_gc(&self, sec: i64) {
        let last = self.last_gc_sec.load(Ordering::SeqCst);
        if sec > last
            && self
                .last_gc_sec
                .compare_exchange(last, sec, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let cutoff = sec - BUCKET_RETENTION_SECS;
            self.buckets.retain(|bucket_sec, _| *bucket_sec >= cutoff);
        }
    }

    /// Number of live buckets. Mostly interesting for tests.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
