//! Server clock estimation.
//!
//! Each server-originated timestamp (REST response or push message) is paired with the local
//! receive time and folded into an exponentially smoothed offset. Readers get corrected time
//! plus a flag telling them whether any sample has been seen yet.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::{Duration, SystemTime},
};

/// Source of local wall-clock time in epoch milliseconds.
pub trait LocalClock: Send + Sync {
    /// Current local time.
    fn now_millis(&self) -> i64;
}

/// [`LocalClock`] backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now_millis(&self) -> i64 {
        match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
            Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            Err(before_epoch) => {
                -i64::try_from(before_epoch.duration().as_millis()).unwrap_or(i64::MAX)
            }
        }
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock frozen at `millis`.
    pub fn new(millis: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(millis)),
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Move forward by `delta` milliseconds.
    pub fn advance(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl LocalClock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A server timestamp together with the local instant it was received at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimeSample {
    /// Server time carried by the response or message, epoch milliseconds.
    pub server_timestamp: i64,
    /// Local clock reading when it arrived.
    pub received_at_local: i64,
}

/// Corrected time as returned by [`ClockSynchronizer::now`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectedTime {
    /// Best estimate of the server's current time.
    pub millis: i64,
    /// False until at least one sample was ingested; `millis` is then the raw local clock.
    pub synchronized: bool,
}

/// How far the current offset can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockConfidence {
    /// No sample has been ingested yet.
    Unsynchronized,
    /// The latest sample is within the staleness window.
    Synchronized,
    /// No sample arrived within the staleness window; displayed times may be inaccurate.
    Stale,
}

/// Single owner of the local-to-server clock offset.
pub struct ClockSynchronizer {
    clock: Arc<dyn LocalClock>,
    smoothing: f64,
    offset: Option<f64>,
    last_sample_at: Option<i64>,
}

impl ClockSynchronizer {
    /// `smoothing` is the weight of a fresh candidate in `(0, 1]`.
    pub fn new(clock: Arc<dyn LocalClock>, smoothing: f64) -> Self {
        Self {
            clock,
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            offset: None,
            last_sample_at: None,
        }
    }

    /// Pair a server timestamp with the current local time.
    pub fn sample(&self, server_timestamp: i64) -> ServerTimeSample {
        ServerTimeSample {
            server_timestamp,
            received_at_local: self.clock.now_millis(),
        }
    }

    /// Fold a sample into the offset. The first sample is taken verbatim.
    ///
    /// Samples without a positive server timestamp are refused; returns whether it was used.
    pub fn ingest(&mut self, sample: ServerTimeSample) -> bool {
        if sample.server_timestamp <= 0 {
            return false;
        }
        let candidate = sample
            .server_timestamp
            .saturating_sub(sample.received_at_local) as f64;
        let next = match self.offset {
            None => candidate,
            Some(previous) => previous * (1.0 - self.smoothing) + candidate * self.smoothing,
        };
        self.offset = Some(next);
        self.last_sample_at = Some(
            self.last_sample_at
                .map_or(sample.received_at_local, |last| {
                    last.max(sample.received_at_local)
                }),
        );
        true
    }

    /// Local clock plus the smoothed offset.
    pub fn now(&self) -> CorrectedTime {
        let local = self.clock.now_millis();
        match self.offset {
            Some(offset) => CorrectedTime {
                millis: local.saturating_add(offset.round() as i64),
                synchronized: true,
            },
            None => CorrectedTime {
                millis: local,
                synchronized: false,
            },
        }
    }

    /// Current offset rounded to whole milliseconds (zero before the first sample).
    pub fn offset_millis(&self) -> i64 {
        self.offset.map_or(0, |offset| offset.round() as i64)
    }

    /// Whether any sample has been ingested.
    pub fn is_synchronized(&self) -> bool {
        self.offset.is_some()
    }

    /// Classify the offset against the staleness window.
    pub fn confidence(&self, stale_after: Duration) -> ClockConfidence {
        let Some(last) = self.last_sample_at else {
            return ClockConfidence::Unsynchronized;
        };
        let window = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        if self.clock.now_millis().saturating_sub(last) > window {
            ClockConfidence::Stale
        } else {
            ClockConfidence::Synchronized
        }
    }
}
