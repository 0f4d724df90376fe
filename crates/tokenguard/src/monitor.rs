//! Rolling-window latency monitor for pipeline stages
//!
//! Each [`MeasurementType`] owns a fixed-capacity window of the most recent
//! samples. Windows are striped: a recording thread writes to the ring buffer
//! selected by its stable per-thread index, so concurrent validators rarely
//! touch the same cache line. Readers sum over all stripes with plain atomic
//! loads and never wait on a writer.
//!
//! Disabled measurement types own no window at all; recording into them is a
//! single `Option` check.
//!
//! ```rust
//! use std::time::Duration;
//! use tokenguard::monitor::{MeasurementType, PerformanceMonitor};
//!
//! let monitor = PerformanceMonitor::builder()
//!     .window_size(64)
//!     .enable(MeasurementType::TokenParsing)
//!     .build();
//!
//! monitor.record(MeasurementType::TokenParsing, Duration::from_micros(12));
//! assert_eq!(monitor.sample_count(MeasurementType::TokenParsing), 1);
//! assert_eq!(monitor.sample_count(MeasurementType::CacheLookup), 0);
//! ```

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

/// Default number of samples kept per measurement type.
pub const DEFAULT_WINDOW_SIZE: usize = 100;

/// Upper bound for the number of stripes per window.
const MAX_STRIPES: usize = 16;

/// Pipeline stages that can be measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementType {
    /// Splitting and decoding the compact token
    TokenParsing,
    /// Reading `iss` from the decoded claims
    IssuerExtraction,
    /// Algorithm allow-list and `kid` checks
    HeaderValidation,
    /// Cryptographic signature verification
    SignatureValidation,
    /// Time, audience and authorized-party checks
    ClaimsValidation,
    /// Key set fetch, parse and rotation
    JwksOperations,
    /// Access token cache read, not counting a wait on an in-flight validation
    CacheLookup,
    /// Access token cache insertion
    CacheStore,
    /// Mapping decoded claims into typed token content
    TokenBuilding,
    /// A single retry attempt
    RetryAttempt,
    /// A whole retried operation, delays included
    RetryComplete,
    /// Difference between planned and observed retry delay
    RetryDelay,
    /// One validation call end to end
    CompleteValidation,
}

impl MeasurementType {
    /// All measurement types in slot order.
    pub const ALL: [MeasurementType; 13] = [
        MeasurementType::TokenParsing,
        MeasurementType::IssuerExtraction,
        MeasurementType::HeaderValidation,
        MeasurementType::SignatureValidation,
        MeasurementType::ClaimsValidation,
        MeasurementType::JwksOperations,
        MeasurementType::CacheLookup,
        MeasurementType::CacheStore,
        MeasurementType::TokenBuilding,
        MeasurementType::RetryAttempt,
        MeasurementType::RetryComplete,
        MeasurementType::RetryDelay,
        MeasurementType::CompleteValidation,
    ];

    /// Human-readable stage name
    pub fn description(self) -> &'static str {
        match self {
            MeasurementType::TokenParsing => "token parsing",
            MeasurementType::IssuerExtraction => "issuer extraction",
            MeasurementType::HeaderValidation => "header validation",
            MeasurementType::SignatureValidation => "signature validation",
            MeasurementType::ClaimsValidation => "claims validation",
            MeasurementType::JwksOperations => "key material operations",
            MeasurementType::CacheLookup => "cache lookup",
            MeasurementType::CacheStore => "cache store",
            MeasurementType::TokenBuilding => "token building",
            MeasurementType::RetryAttempt => "retry attempt",
            MeasurementType::RetryComplete => "retry complete",
            MeasurementType::RetryDelay => "retry delay drift",
            MeasurementType::CompleteValidation => "complete validation",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

thread_local! {
    static STRIPE_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

static NEXT_STRIPE_HINT: AtomicUsize = AtomicUsize::new(0);

/// Stable per-thread stripe index, assigned round-robin on first use.
fn stripe_hint() -> usize {
    STRIPE_HINT.with(|hint| match hint.get() {
        Some(h) => h,
        None => {
            let h = NEXT_STRIPE_HINT.fetch_add(1, Ordering::Relaxed);
            hint.set(Some(h));
            h
        }
    })
}

/// One ring buffer of microsecond samples.
#[derive(Debug)]
struct Stripe {
    samples: Box<[AtomicU64]>,
    /// Total writes ever; the next slot is `cursor % capacity`
    cursor: AtomicUsize,
}

impl Stripe {
    fn new(capacity: usize) -> Self {
        Self {
            samples: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn push(&self, micros: u64) {
        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % self.samples.len();
        self.samples[position].store(micros, Ordering::Relaxed);
    }

    fn len(&self) -> usize {
        self.cursor.load(Ordering::Relaxed).min(self.samples.len())
    }

    fn sum(&self) -> (u64, usize) {
        let len = self.len();
        let sum = self.samples[..len]
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .fold(0u64, u64::saturating_add);
        (sum, len)
    }

    fn clear(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }
}

/// Fixed-capacity striped rolling window.
///
/// Total capacity is split evenly over the stripes; each stripe overwrites
/// its own oldest sample once full.
#[derive(Debug)]
pub struct RollingWindow {
    stripes: Box<[CachePadded<Stripe>]>,
    mask: usize,
}

impl RollingWindow {
    /// Create a window holding roughly `capacity` samples over `stripes` buffers.
    ///
    /// `stripes` is rounded up to a power of two and clamped to `1..=16`.
    pub fn new(capacity: usize, stripes: usize) -> Self {
        let stripes = stripes.clamp(1, MAX_STRIPES).next_power_of_two();
        let per_stripe = capacity.max(1).div_ceil(stripes);
        Self {
            stripes: (0..stripes)
                .map(|_| CachePadded::new(Stripe::new(per_stripe)))
                .collect(),
            mask: stripes - 1,
        }
    }

    /// Record a sample on the calling thread's stripe
    pub fn record(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_nanos() / 1_000).unwrap_or(u64::MAX);
        self.stripes[stripe_hint() & self.mask].push(micros);
    }

    /// Number of samples currently held
    pub fn sample_count(&self) -> usize {
        self.stripes.iter().map(|s| s.len()).sum()
    }

    /// Mean of the held samples, `None` when empty
    pub fn average(&self) -> Option<Duration> {
        let (sum, count) = self.stripes.iter().fold((0u64, 0usize), |(sum, count), s| {
            let (s_sum, s_len) = s.sum();
            (sum.saturating_add(s_sum), count + s_len)
        });
        (count > 0).then(|| Duration::from_micros(sum / count as u64))
    }

    /// Drop all samples
    pub fn reset(&self) {
        for stripe in self.stripes.iter() {
            stripe.clear();
        }
    }
}

/// Per-stage latency monitor shared by the validation pipelines and the
/// retry subsystem.
#[derive(Debug)]
pub struct PerformanceMonitor {
    windows: [Option<RollingWindow>; MeasurementType::ALL.len()],
}

impl Default for PerformanceMonitor {
    /// All measurement types enabled with default window size
    fn default() -> Self {
        Self::builder().enable_all().build()
    }
}

impl PerformanceMonitor {
    /// Start configuring a monitor; nothing is enabled by default
    pub fn builder() -> PerformanceMonitorBuilder {
        PerformanceMonitorBuilder::new()
    }

    /// A monitor that records nothing
    pub fn disabled() -> Self {
        Self::builder().build()
    }

    /// Whether `measurement` has a window
    pub fn is_enabled(&self, measurement: MeasurementType) -> bool {
        self.windows[measurement.slot()].is_some()
    }

    /// Record a duration; no-op when the type is disabled
    #[inline]
    pub fn record(&self, measurement: MeasurementType, duration: Duration) {
        if let Some(window) = &self.windows[measurement.slot()] {
            window.record(duration);
        }
    }

    /// Record the time elapsed since `started`
    #[inline]
    pub fn record_since(&self, measurement: MeasurementType, started: Instant) {
        if let Some(window) = &self.windows[measurement.slot()] {
            window.record(started.elapsed());
        }
    }

    /// Run `f` and record how long it took
    #[inline]
    pub fn measure<T>(&self, measurement: MeasurementType, f: impl FnOnce() -> T) -> T {
        if self.is_enabled(measurement) {
            let started = Instant::now();
            let result = f();
            self.record_since(measurement, started);
            result
        } else {
            f()
        }
    }

    /// Mean latency, `None` when disabled or empty
    pub fn average(&self, measurement: MeasurementType) -> Option<Duration> {
        self.windows[measurement.slot()]
            .as_ref()
            .and_then(RollingWindow::average)
    }

    /// Samples currently held; 0 when disabled
    pub fn sample_count(&self, measurement: MeasurementType) -> usize {
        self.windows[measurement.slot()]
            .as_ref()
            .map_or(0, RollingWindow::sample_count)
    }

    /// Drop all samples of every enabled type
    pub fn reset(&self) {
        for window in self.windows.iter().flatten() {
            window.reset();
        }
    }
}

/// Builder for [`PerformanceMonitor`]
#[derive(Debug, Clone)]
pub struct PerformanceMonitorBuilder {
    window_size: usize,
    stripes: usize,
    enabled: [bool; MeasurementType::ALL.len()],
}

impl PerformanceMonitorBuilder {
    fn new() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(4, |n| n.get());
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            stripes: parallelism,
            enabled: [false; MeasurementType::ALL.len()],
        }
    }

    /// Samples kept per measurement type
    pub fn window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    /// Ring buffers per window (rounded to a power of two, at most 16)
    pub fn stripes(mut self, stripes: usize) -> Self {
        self.stripes = stripes;
        self
    }

    /// Enable one measurement type
    pub fn enable(mut self, measurement: MeasurementType) -> Self {
        self.enabled[measurement.slot()] = true;
        self
    }

    /// Enable every measurement type
    pub fn enable_all(mut self) -> Self {
        self.enabled = [true; MeasurementType::ALL.len()];
        self
    }

    /// Allocate windows for the enabled types
    pub fn build(self) -> PerformanceMonitor {
        PerformanceMonitor {
            windows: std::array::from_fn(|slot| {
                self.enabled[slot].then(|| RollingWindow::new(self.window_size, self.stripes))
            }),
        }
    }
}
