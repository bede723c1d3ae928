//! # Retry backoff policies.
//!
//! A [`BackOff`] supplies successive retry delays; `None` from
//! [`next_backoff`](BackOff::next_backoff) means "give up". The supervisors
//! in this crate drive one independent backoff per routine and reset it on
//! success.
//!
//! [`BackoffConfig`] carries the declarative form: a kind plus per-kind
//! fields, where zero fields fall back to the documented defaults.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use coopsync::backoff::{BackOff, ConstantBackOff};
//!
//! let mut bo = ConstantBackOff::new(Duration::from_millis(250));
//! assert_eq!(bo.next_backoff(), Some(Duration::from_millis(250)));
//! assert_eq!(bo.next_backoff(), Some(Duration::from_millis(250)));
//! ```

use std::time::{Duration, Instant};

use crate::error::ConfigError;

/// # Supplier of successive retry delays.
///
/// `None` means no more retries should be attempted.
pub trait BackOff: Send {
    /// Returns the next delay, or `None` to give up.
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Resets the policy to its initial state.
    fn reset(&mut self);
}

/// # Exponential backoff.
///
/// Each delay is the current interval randomized by
/// `randomization_factor`, after which the interval is multiplied by
/// `multiplier` and capped at `max_interval`. Once `max_elapsed_time` (if
/// set) has passed since the first delay, gives up.
#[derive(Debug, Clone)]
pub struct ExponentialBackOff {
    /// First retry interval.
    pub initial_interval: Duration,
    /// Randomization factor in `[0, 1]`; 0 disables randomization.
    pub randomization_factor: f64,
    /// Growth factor applied after each interval.
    pub multiplier: f64,
    /// Cap for the growing interval.
    pub max_interval: Duration,
    /// Total budget since the first delay; `None` is unbounded.
    pub max_elapsed_time: Option<Duration>,

    current_interval: Duration,
    start: Option<Instant>,
}

impl Default for ExponentialBackOff {
    /// Returns the stock policy: initial 800 ms, multiplier 1.8, max
    /// interval 20 s, no randomization, unbounded elapsed time.
    fn default() -> Self {
        let initial = Duration::from_millis(800);
        ExponentialBackOff {
            initial_interval: initial,
            randomization_factor: 0.0,
            multiplier: 1.8,
            max_interval: Duration::from_millis(20_000),
            max_elapsed_time: None,
            current_interval: initial,
            start: None,
        }
    }
}

impl ExponentialBackOff {
    /// Builds the stock policy.
    pub fn new() -> Self {
        ExponentialBackOff::default()
    }
}

impl BackOff for ExponentialBackOff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let start = *self.start.get_or_insert_with(Instant::now);
        if let Some(budget) = self.max_elapsed_time {
            if start.elapsed() > budget {
                return None;
            }
        }

        let next = randomize(self.current_interval, self.randomization_factor);
        let grown = self.current_interval.mul_f64(self.multiplier.max(0.0));
        self.current_interval = grown.min(self.max_interval);
        Some(next)
    }

    fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.start = None;
    }
}

/// Spreads `interval` uniformly across `[interval * (1 - factor),
/// interval * (1 + factor)]`. A zero factor returns the interval untouched,
/// keeping tests deterministic.
fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let delta = factor.min(1.0) * interval.as_secs_f64();
    let min = interval.as_secs_f64() - delta;
    let span = 2.0 * delta;
    let rnd: f64 = rand::random();
    Duration::from_secs_f64(min + rnd * span)
}

/// # Constant backoff: the same interval every time.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackOff {
    /// The fixed retry interval.
    pub interval: Duration,
}

impl ConstantBackOff {
    /// Builds a constant backoff with the given interval.
    pub fn new(interval: Duration) -> Self {
        ConstantBackOff { interval }
    }
}

impl Default for ConstantBackOff {
    /// Returns the stock constant policy: 5 s.
    fn default() -> Self {
        ConstantBackOff::new(Duration::from_millis(5_000))
    }
}

impl BackOff for ConstantBackOff {
    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.interval)
    }

    fn reset(&mut self) {}
}

/// # Zero backoff: retry immediately, forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroBackOff;

impl BackOff for ZeroBackOff {
    fn next_backoff(&mut self) -> Option<Duration> {
        Some(Duration::ZERO)
    }

    fn reset(&mut self) {}
}

/// # Stop backoff: never retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopBackOff;

impl BackOff for StopBackOff {
    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }

    fn reset(&mut self) {}
}

/// # Caps an inner backoff at a maximum number of retries.
#[derive(Debug, Clone)]
pub struct MaxRetriesBackOff<B> {
    inner: B,
    max_retries: u64,
    tries: u64,
}

impl<B: BackOff> MaxRetriesBackOff<B> {
    /// Wraps `inner`, giving up after `max_retries` delays.
    pub fn new(inner: B, max_retries: u64) -> Self {
        MaxRetriesBackOff {
            inner,
            max_retries,
            tries: 0,
        }
    }
}

impl<B: BackOff> BackOff for MaxRetriesBackOff<B> {
    fn next_backoff(&mut self) -> Option<Duration> {
        if self.tries >= self.max_retries {
            return None;
        }
        self.tries += 1;
        self.inner.next_backoff()
    }

    fn reset(&mut self) {
        self.tries = 0;
        self.inner.reset();
    }
}

/// Kind selector for [`BackoffConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffKind {
    /// No kind configured; construction falls back to exponential.
    #[default]
    Unset,
    /// Exponential backoff.
    Exponential,
    /// Constant backoff.
    Constant,
}

/// Declarative exponential parameters; zero fields use the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExponentialConfig {
    /// Initial interval (default 800 ms).
    pub initial_interval: Duration,
    /// Growth factor (default 1.8).
    pub multiplier: f64,
    /// Interval cap (default 20 s).
    pub max_interval: Duration,
    /// Randomization factor (default 0).
    pub randomization_factor: f64,
    /// Total retry budget; zero is unbounded.
    pub max_elapsed_time: Duration,
}

/// Declarative constant parameters; a zero interval uses the default.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConstantConfig {
    /// Fixed interval (default 5 s).
    pub interval: Duration,
}

/// # Declarative backoff configuration.
///
/// Carries the semantics of a retry policy independent of any wire format:
/// a kind plus per-kind parameters where zero fields mean "use the
/// default".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BackoffConfig {
    /// Which policy to construct.
    pub kind: BackoffKind,
    /// Parameters for [`BackoffKind::Exponential`].
    pub exponential: ExponentialConfig,
    /// Parameters for [`BackoffKind::Constant`].
    pub constant: ConstantConfig,
}

impl BackoffConfig {
    /// Shorthand for an exponential config.
    pub fn exponential(cfg: ExponentialConfig) -> Self {
        BackoffConfig {
            kind: BackoffKind::Exponential,
            exponential: cfg,
            ..Default::default()
        }
    }

    /// Shorthand for a constant config.
    pub fn constant(interval: Duration) -> Self {
        BackoffConfig {
            kind: BackoffKind::Constant,
            constant: ConstantConfig { interval },
            ..Default::default()
        }
    }

    /// Returns whether no kind has been configured.
    pub fn is_empty(&self) -> bool {
        self.kind == BackoffKind::Unset
    }

    /// Validates the configuration.
    pub fn validate(&self, allow_empty: bool) -> Result<(), ConfigError> {
        if !allow_empty && self.is_empty() {
            return Err(ConfigError::BackoffRequired);
        }
        let factor = self.exponential.randomization_factor;
        if !(0.0..=1.0).contains(&factor) {
            return Err(ConfigError::RandomizationFactor { factor });
        }
        Ok(())
    }

    /// Constructs the configured backoff, applying defaults to zero fields.
    pub fn construct(&self) -> Box<dyn BackOff + Send> {
        match self.kind {
            BackoffKind::Unset | BackoffKind::Exponential => {
                let opts = &self.exponential;
                let mut expo = ExponentialBackOff::new();
                if opts.initial_interval > Duration::ZERO {
                    expo.initial_interval = opts.initial_interval;
                }
                if opts.multiplier > 0.0 {
                    expo.multiplier = opts.multiplier;
                }
                if opts.max_interval > Duration::ZERO {
                    expo.max_interval = opts.max_interval;
                }
                expo.randomization_factor = opts.randomization_factor;
                if opts.max_elapsed_time > Duration::ZERO {
                    expo.max_elapsed_time = Some(opts.max_elapsed_time);
                }
                expo.reset();
                Box::new(expo)
            }
            BackoffKind::Constant => {
                let mut interval = self.constant.interval;
                if interval == Duration::ZERO {
                    interval = ConstantBackOff::default().interval;
                }
                Box::new(ConstantBackOff::new(interval))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_stop() {
        let mut zero = ZeroBackOff;
        let mut stop = StopBackOff;
        for _ in 0..10 {
            assert_eq!(zero.next_backoff(), Some(Duration::ZERO));
            assert_eq!(stop.next_backoff(), None);
        }
    }

    #[test]
    fn constant_interval() {
        let mut bo = ConstantBackOff::new(Duration::from_secs(1));
        assert_eq!(bo.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn exponential_growth_and_cap() {
        let mut bo = ExponentialBackOff {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(350),
            randomization_factor: 0.0,
            ..ExponentialBackOff::default()
        };
        bo.reset();
        assert_eq!(bo.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(bo.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(bo.next_backoff(), Some(Duration::from_millis(350)));
        assert_eq!(bo.next_backoff(), Some(Duration::from_millis(350)));

        bo.reset();
        assert_eq!(bo.next_backoff(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn max_retries() {
        let max = 17;
        let mut bo = MaxRetriesBackOff::new(ZeroBackOff, max);

        // Load up the tries count; reset should clear the record.
        for _ in 0..max / 2 {
            bo.next_backoff();
        }
        bo.reset();

        for i in 0..max {
            assert_ne!(bo.next_backoff(), None, "returned Stop on try {i}");
        }
        for _ in 0..7 {
            assert_eq!(bo.next_backoff(), None);
        }

        bo.reset();
        assert_ne!(bo.next_backoff(), None);
    }

    #[test]
    fn config_defaults_and_validation() {
        let cfg = BackoffConfig::default();
        assert!(cfg.is_empty());
        assert!(cfg.validate(true).is_ok());
        assert!(matches!(
            cfg.validate(false),
            Err(ConfigError::BackoffRequired)
        ));

        let mut bad = BackoffConfig::exponential(ExponentialConfig {
            randomization_factor: 1.5,
            ..Default::default()
        });
        assert!(matches!(
            bad.validate(false),
            Err(ConfigError::RandomizationFactor { .. })
        ));
        bad.exponential.randomization_factor = 0.5;
        assert!(bad.validate(false).is_ok());

        // Zero fields fall back to the stock exponential policy.
        let mut bo = BackoffConfig::exponential(ExponentialConfig::default()).construct();
        assert_eq!(bo.next_backoff(), Some(Duration::from_millis(800)));
        assert_eq!(bo.next_backoff(), Some(Duration::from_millis(1440)));

        let mut constant = BackoffConfig::constant(Duration::ZERO).construct();
        assert_eq!(constant.next_backoff(), Some(Duration::from_millis(5_000)));
    }
}
