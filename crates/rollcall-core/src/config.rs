//! Environment-driven pipeline configuration.
//!
//! Every value falls back to its constant in [`crate::defaults`]. Unparseable
//! values are ignored rather than rejected; similarity thresholds are clamped
//! to `[0, 1]`.

use std::time::Duration;

use crate::defaults;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_unit(name: &str, default: f64) -> f64 {
    env_parse::<f64>(name)
        .filter(|v| v.is_finite())
        .unwrap_or(default)
        .clamp(0.0, 1.0)
}

/// Exponential backoff with a hard attempt cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Transient failures tolerated before the Upload is externalized as FAILED.
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::PIPELINE_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(defaults::RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let base_ms =
            env_parse::<u64>("RETRY_BASE_DELAY_MS").unwrap_or(defaults::RETRY_BASE_DELAY_MS);
        let max_ms = env_parse::<u64>("RETRY_MAX_DELAY_MS")
            .unwrap_or(defaults::RETRY_MAX_DELAY_MS)
            .max(base_ms);
        Self {
            max_attempts: env_parse::<i32>("PIPELINE_MAX_ATTEMPTS")
                .unwrap_or(defaults::PIPELINE_MAX_ATTEMPTS)
                .max(1),
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    /// Delay before the attempt following the `failures`-th transient failure.
    ///
    /// `min(base * 2^(failures-1), max)`.
    pub fn backoff(&self, failures: i32) -> Duration {
        let exp = failures.saturating_sub(1).clamp(0, 30) as u32;
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether `failures` transient failures exhaust the budget.
    pub fn is_exhausted(&self, failures: i32) -> bool {
        failures >= self.max_attempts
    }
}

/// Matcher thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchConfig {
    pub fuzzy_threshold: f64,
    pub fuzzy_margin: f64,
    pub reasoning_min_confidence: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: defaults::MATCH_FUZZY_THRESHOLD,
            fuzzy_margin: defaults::MATCH_FUZZY_MARGIN,
            reasoning_min_confidence: defaults::MATCH_REASONING_MIN_CONFIDENCE,
        }
    }
}

impl MatchConfig {
    pub fn from_env() -> Self {
        Self {
            fuzzy_threshold: env_unit("MATCH_FUZZY_THRESHOLD", defaults::MATCH_FUZZY_THRESHOLD),
            fuzzy_margin: env_unit("MATCH_FUZZY_MARGIN", defaults::MATCH_FUZZY_MARGIN),
            reasoning_min_confidence: env_unit(
                "MATCH_REASONING_MIN_CONFIDENCE",
                defaults::MATCH_REASONING_MIN_CONFIDENCE,
            ),
        }
    }
}

/// Configuration for one recognition attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub matching: MatchConfig,
    pub retry: RetryPolicy,
    pub ocr_timeout: Duration,
    pub reasoning_timeout: Duration,
    pub likely_correct_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            matching: MatchConfig::default(),
            retry: RetryPolicy::default(),
            ocr_timeout: Duration::from_secs(defaults::OCR_TIMEOUT_SECS),
            reasoning_timeout: Duration::from_secs(defaults::REASONING_TIMEOUT_SECS),
            likely_correct_threshold: defaults::REVIEW_LIKELY_CORRECT_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            matching: MatchConfig::from_env(),
            retry: RetryPolicy::from_env(),
            ocr_timeout: Duration::from_secs(
                env_parse::<u64>("OCR_TIMEOUT_SECS").unwrap_or(defaults::OCR_TIMEOUT_SECS),
            ),
            reasoning_timeout: Duration::from_secs(
                env_parse::<u64>("REASONING_TIMEOUT_SECS")
                    .unwrap_or(defaults::REASONING_TIMEOUT_SECS),
            ),
            likely_correct_threshold: env_unit(
                "REVIEW_LIKELY_CORRECT_THRESHOLD",
                defaults::REVIEW_LIKELY_CORRECT_THRESHOLD,
            ),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_matching(mut self, matching: MatchConfig) -> Self {
        self.matching = matching;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_zero_failures_uses_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), policy.base_delay);
    }

    #[test]
    fn test_exhaustion_at_cap() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(policy.max_attempts - 1));
        assert!(policy.is_exhausted(policy.max_attempts));
    }

    #[test]
    fn test_pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.matching.fuzzy_threshold, defaults::MATCH_FUZZY_THRESHOLD);
        assert_eq!(config.retry.max_attempts, defaults::PIPELINE_MAX_ATTEMPTS);
        assert_eq!(config.ocr_timeout, Duration::from_secs(defaults::OCR_TIMEOUT_SECS));
    }

    #[test]
    fn test_env_unit_clamps_and_ignores_garbage() {
        std::env::set_var("ROLLCALL_TEST_UNIT_HIGH", "4.5");
        std::env::set_var("ROLLCALL_TEST_UNIT_BAD", "abc");
        assert_eq!(env_unit("ROLLCALL_TEST_UNIT_HIGH", 0.3), 1.0);
        assert_eq!(env_unit("ROLLCALL_TEST_UNIT_BAD", 0.3), 0.3);
        std::env::remove_var("ROLLCALL_TEST_UNIT_HIGH");
        std::env::remove_var("ROLLCALL_TEST_UNIT_BAD");
    }
}
