//! Rate limiting for external Homebrew calls.
//!
//! Limiters hand out call slots through [`RateLimiter::reserve`]: the shared
//! last-call timestamp is advanced under a mutex and the caller is told how
//! long to sleep. Blocking callers use [`RateLimiter::wait`], tasks on the
//! async path use [`wait_async`]; both observe the same spacing.

use crate::config::RateLimitConfig;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Floor applied to the fixed limiter so that back-pressure is never disabled.
pub const MIN_FIXED_INTERVAL: Duration = Duration::from_millis(100);

const SUCCESS_STREAK: u32 = 10;
const FAILURE_STREAK: u32 = 5;
const HIGH_LOAD: f64 = 0.8;
const LOAD_SAMPLE_TTL: Duration = Duration::from_secs(5);

pub trait RateLimiter: Send + Sync {
    /// Claim the next call slot and return how long to wait before using it.
    /// The first reservation after construction never waits.
    fn reserve(&self) -> Duration;

    /// Report the outcome of a call. The fixed limiter ignores this.
    fn feedback(&self, _success: bool) {}

    fn current_interval(&self) -> Duration;

    /// Block the current thread until the next call is permitted.
    fn wait(&self) {
        let delay = self.reserve();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Async counterpart of [`RateLimiter::wait`].
pub async fn wait_async(limiter: &dyn RateLimiter) {
    let delay = limiter.reserve();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Schedule the next slot after `last`, at least `interval` apart.
fn next_slot(last: &mut Option<Instant>, interval: Duration) -> Duration {
    let now = Instant::now();
    match *last {
        None => {
            *last = Some(now);
            Duration::ZERO
        }
        Some(prev) => {
            let slot = prev + interval;
            if slot <= now {
                *last = Some(now);
                Duration::ZERO
            } else {
                *last = Some(slot);
                slot - now
            }
        }
    }
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// Constant spacing between calls.
#[derive(Debug)]
pub struct FixedRateLimiter {
    interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl FixedRateLimiter {
    /// `interval_secs` below [`MIN_FIXED_INTERVAL`] (including zero or
    /// negative values) is raised to the floor.
    pub fn new(interval_secs: f64) -> Self {
        Self {
            interval: secs(interval_secs).max(MIN_FIXED_INTERVAL),
            last_call: Mutex::new(None),
        }
    }
}

impl RateLimiter for FixedRateLimiter {
    fn reserve(&self) -> Duration {
        next_slot(&mut lock(&self.last_call), self.interval)
    }

    fn current_interval(&self) -> Duration {
        self.interval
    }
}

/// Source of a system load reading in `0.0..=1.0`.
pub trait LoadSource: Send + Sync {
    fn load(&self) -> Option<f64>;
}

/// Source that never reports load; the adaptive limiter then reacts to feedback only.
#[derive(Debug, Default)]
pub struct NoLoadSource;

impl LoadSource for NoLoadSource {
    fn load(&self) -> Option<f64> {
        None
    }
}

/// One-minute load average divided by CPU count.
///
/// Readings are cached for a few seconds since on macOS each one costs a
/// `sysctl` invocation.
#[derive(Debug, Default)]
pub struct SystemLoadSource {
    sample: Mutex<Option<(Instant, Option<f64>)>>,
}

impl SystemLoadSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_load_average() -> Option<f64> {
        #[cfg(target_os = "linux")]
        {
            let content = std::fs::read_to_string("/proc/loadavg").ok()?;
            content.split_whitespace().next()?.parse().ok()
        }
        #[cfg(not(target_os = "linux"))]
        {
            // Output looks like "{ 1.52 1.61 1.75 }"
            let output = std::process::Command::new("sysctl")
                .args(["-n", "vm.loadavg"])
                .output()
                .ok()?;
            if !output.status.success() {
                return None;
            }
            String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .find_map(|part| part.parse().ok())
        }
    }
}

impl LoadSource for SystemLoadSource {
    fn load(&self) -> Option<f64> {
        let mut sample = lock(&self.sample);
        if let Some((taken, value)) = *sample
            && taken.elapsed() < LOAD_SAMPLE_TTL
        {
            return value;
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);
        let value = Self::read_load_average().map(|avg| (avg / cpus).clamp(0.0, 1.0));
        *sample = Some((Instant::now(), value));
        value
    }
}

#[derive(Debug)]
struct AdaptiveState {
    current: f64,
    last_call: Option<Instant>,
    successes: u32,
    failures: u32,
}

/// Interval that narrows after sustained success and widens after
/// sustained failure or under high system load, always within `[min, max]`.
pub struct AdaptiveRateLimiter {
    min: f64,
    max: f64,
    state: Mutex<AdaptiveState>,
    load_source: Box<dyn LoadSource>,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl AdaptiveRateLimiter {
    pub fn new(base: f64, min: f64, max: f64, load_source: Box<dyn LoadSource>) -> Self {
        let min = if min.is_finite() { min.max(0.0) } else { 0.0 };
        let max = if max.is_finite() { max.max(min) } else { min };
        let base = if base.is_finite() { base } else { min };
        Self {
            min,
            max,
            state: Mutex::new(AdaptiveState {
                current: base.clamp(min, max),
                last_call: None,
                successes: 0,
                failures: 0,
            }),
            load_source,
        }
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (secs(self.min), secs(self.max))
    }

    /// Factor applied after a success streak. Under high load the interval
    /// grows instead of shrinking.
    fn success_factor(load: Option<f64>) -> f64 {
        match load {
            Some(l) if l >= HIGH_LOAD => 1.0 + 0.25 * l,
            Some(l) => 0.9 + 0.1 * l,
            None => 0.9,
        }
    }

    fn failure_factor(load: Option<f64>) -> f64 {
        1.5 + 0.5 * load.unwrap_or(0.0)
    }
}

impl RateLimiter for AdaptiveRateLimiter {
    fn reserve(&self) -> Duration {
        let mut state = lock(&self.state);
        let interval = secs(state.current);
        next_slot(&mut state.last_call, interval)
    }

    fn feedback(&self, success: bool) {
        let load = self.load_source.load();
        let mut state = lock(&self.state);
        if success {
            state.failures = 0;
            state.successes += 1;
            if state.successes >= SUCCESS_STREAK {
                state.successes = 0;
                state.current = (state.current * Self::success_factor(load)).clamp(self.min, self.max);
                tracing::debug!(interval = state.current, ?load, "success streak, adjusted interval");
            }
        } else {
            state.successes = 0;
            state.failures += 1;
            if state.failures >= FAILURE_STREAK {
                state.failures = 0;
                // A zero interval would never grow multiplicatively.
                let base = state.current.max(self.min).max(0.05);
                state.current = (base * Self::failure_factor(load)).clamp(self.min, self.max);
                tracing::debug!(interval = state.current, ?load, "failure streak, widened interval");
            }
        }
    }

    fn current_interval(&self) -> Duration {
        secs(lock(&self.state).current)
    }
}

/// Build the limiter described by `config`. `override_secs` replaces the
/// configured base interval (e.g. from a command-line flag).
pub fn from_config(config: &RateLimitConfig, override_secs: Option<f64>) -> Arc<dyn RateLimiter> {
    let base = override_secs.unwrap_or(config.base_interval);
    if config.adaptive {
        Arc::new(AdaptiveRateLimiter::new(
            base,
            config.min_interval,
            config.max_interval,
            Box::new(SystemLoadSource::new()),
        ))
    } else {
        Arc::new(FixedRateLimiter::new(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLoad(f64);

    impl LoadSource for FixedLoad {
        fn load(&self) -> Option<f64> {
            Some(self.0)
        }
    }

    #[test]
    fn test_first_wait_does_not_block() {
        let limiter = FixedRateLimiter::new(10.0);
        assert_eq!(limiter.reserve(), Duration::ZERO);
        assert!(limiter.reserve() > Duration::from_secs(9));
    }

    #[test]
    fn test_fixed_floor() {
        assert_eq!(FixedRateLimiter::new(0.0).current_interval(), MIN_FIXED_INTERVAL);
        assert_eq!(FixedRateLimiter::new(-3.0).current_interval(), MIN_FIXED_INTERVAL);
        assert_eq!(FixedRateLimiter::new(f64::NAN).current_interval(), MIN_FIXED_INTERVAL);
        assert_eq!(FixedRateLimiter::new(2.0).current_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_sequential_waits_are_spaced() {
        let limiter = FixedRateLimiter::new(0.1);
        let mut stamps = Vec::new();
        for _ in 0..4 {
            limiter.wait();
            stamps.push(Instant::now());
        }
        for pair in stamps.windows(2) {
            // Allow for timer granularity.
            assert!(pair[1] - pair[0] >= Duration::from_millis(95));
        }
    }

    #[test]
    fn test_concurrent_reservations_are_spaced() {
        let limiter = Arc::new(FixedRateLimiter::new(1.0));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.reserve())
            })
            .collect();
        let mut delays: Vec<Duration> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        delays.sort();
        assert_eq!(delays[0], Duration::ZERO);
        for pair in delays.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(900), "gap too small: {gap:?}");
        }
    }

    #[test]
    fn test_adaptive_narrows_after_successes() {
        let limiter = AdaptiveRateLimiter::new(1.0, 0.1, 5.0, Box::new(NoLoadSource));
        for _ in 0..9 {
            limiter.feedback(true);
        }
        assert_eq!(limiter.current_interval(), Duration::from_secs(1));
        limiter.feedback(true);
        assert!(limiter.current_interval() < Duration::from_secs(1));
    }

    #[test]
    fn test_adaptive_widens_after_failures() {
        let limiter = AdaptiveRateLimiter::new(1.0, 0.1, 5.0, Box::new(NoLoadSource));
        for _ in 0..4 {
            limiter.feedback(false);
        }
        assert_eq!(limiter.current_interval(), Duration::from_secs(1));
        limiter.feedback(false);
        assert!(limiter.current_interval() > Duration::from_secs(1));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let limiter = AdaptiveRateLimiter::new(1.0, 0.1, 5.0, Box::new(NoLoadSource));
        for _ in 0..4 {
            limiter.feedback(false);
        }
        limiter.feedback(true);
        limiter.feedback(false);
        assert_eq!(limiter.current_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_high_load_widens_on_success() {
        let limiter = AdaptiveRateLimiter::new(1.0, 0.1, 5.0, Box::new(FixedLoad(0.95)));
        for _ in 0..10 {
            limiter.feedback(true);
        }
        assert!(limiter.current_interval() > Duration::from_secs(1));
    }

    #[test]
    fn test_adaptive_clamps_base() {
        let limiter = AdaptiveRateLimiter::new(50.0, 0.1, 5.0, Box::new(NoLoadSource));
        assert_eq!(limiter.current_interval(), Duration::from_secs(5));
        let (min, max) = limiter.bounds();
        assert_eq!(min, Duration::from_millis(100));
        assert_eq!(max, Duration::from_secs(5));
    }

    #[test]
    fn test_from_config_picks_variant() {
        let mut config = RateLimitConfig::default();
        let fixed = from_config(&config, Some(0.5));
        assert_eq!(fixed.current_interval(), Duration::from_millis(500));

        config.adaptive = true;
        let adaptive = from_config(&config, None);
        assert_eq!(adaptive.current_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_wait_async_first_call_immediate() {
        let limiter = FixedRateLimiter::new(5.0);
        let start = Instant::now();
        wait_async(&limiter).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn adaptive_interval_stays_in_bounds(
                base in 0.0f64..20.0,
                min in 0.0f64..2.0,
                span in 0.0f64..10.0,
                load in proptest::option::of(0.0f64..1.0),
                outcomes in proptest::collection::vec(any::<bool>(), 0..200),
            ) {
                struct StubLoad(Option<f64>);
                impl LoadSource for StubLoad {
                    fn load(&self) -> Option<f64> { self.0 }
                }

                let max = min + span;
                let limiter = AdaptiveRateLimiter::new(base, min, max, Box::new(StubLoad(load)));
                for success in outcomes {
                    limiter.feedback(success);
                    let current = limiter.current_interval().as_secs_f64();
                    prop_assert!(current >= min - 1e-9);
                    prop_assert!(current <= max + 1e-9);
                }
            }
        }
    }
}
