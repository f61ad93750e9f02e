//! Rate declarations attached to guarded calls.
//!
//! A [`RateSpec`] is the per-call-site configuration: how many permits a
//! budget refills per interval, how many permits one call takes, whether the
//! caller waits for a permit and what to run when it does not get one.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FlowguardError, Result};

/// Time unit for rate intervals and acquisition timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Get the duration of `amount` units.
    pub fn duration(&self, amount: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(amount.saturating_mul(3600)),
            TimeUnit::Days => Duration::from_secs(amount.saturating_mul(86400)),
        }
    }

    /// Lowercase name used in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Milliseconds => "milliseconds",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
        }
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who shares a budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One budget across every process using the resource name.
    #[default]
    Shared,
    /// Every store client gets its own budget under the same name.
    PerInstance,
}

/// Rate parameters as the store sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateConfig {
    pub scope: Scope,
    /// Permits produced per interval
    pub rate: u64,
    pub interval: Duration,
}

/// Configuration attached to one guarded call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSpec {
    /// Declared resource name; blank means "derive from the call signature"
    #[serde(default)]
    pub name: String,
    /// Argument references (`#p0`, `#p1.user_id`) appended to the name
    #[serde(default)]
    pub args: Vec<String>,
    /// Permits produced per interval
    pub rate: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_interval_unit")]
    pub interval_unit: TimeUnit,
    /// Permits taken by one call
    #[serde(default = "default_permits")]
    pub permits: u64,
    #[serde(default)]
    pub scope: Scope,
    /// Wait for a permit instead of giving up after `timeout`
    #[serde(default)]
    pub blocking: bool,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_timeout_unit")]
    pub timeout_unit: TimeUnit,
    /// Name of the handler to run when a call is rejected
    #[serde(default)]
    pub fallback: String,
    /// Type owning the fallback; defaults to the call target's type
    #[serde(default)]
    pub fallback_owner: Option<String>,
}

fn default_interval() -> u64 {
    1
}

fn default_interval_unit() -> TimeUnit {
    TimeUnit::Seconds
}

fn default_permits() -> u64 {
    1
}

fn default_timeout() -> u64 {
    10
}

fn default_timeout_unit() -> TimeUnit {
    TimeUnit::Seconds
}

impl RateSpec {
    /// Create a spec producing `rate` permits per second with all other
    /// settings at their defaults.
    pub fn new(rate: u64) -> Self {
        Self {
            name: String::new(),
            args: Vec::new(),
            rate,
            interval: default_interval(),
            interval_unit: default_interval_unit(),
            permits: default_permits(),
            scope: Scope::default(),
            blocking: false,
            timeout: default_timeout(),
            timeout_unit: default_timeout_unit(),
            fallback: String::new(),
            fallback_owner: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append an argument reference expression.
    pub fn arg(mut self, expression: impl Into<String>) -> Self {
        self.args.push(expression.into());
        self
    }

    pub fn per(mut self, interval: u64, unit: TimeUnit) -> Self {
        self.interval = interval;
        self.interval_unit = unit;
        self
    }

    pub fn permits(mut self, permits: u64) -> Self {
        self.permits = permits;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Bound the wait of a non-blocking acquisition.
    pub fn timeout(mut self, timeout: u64, unit: TimeUnit) -> Self {
        self.blocking = false;
        self.timeout = timeout;
        self.timeout_unit = unit;
        self
    }

    pub fn fallback(mut self, name: impl Into<String>) -> Self {
        self.fallback = name.into();
        self
    }

    pub fn fallback_owner(mut self, owner: impl Into<String>) -> Self {
        self.fallback_owner = Some(owner.into());
        self
    }

    /// Length of one refill interval.
    pub fn interval_duration(&self) -> Duration {
        self.interval_unit.duration(self.interval)
    }

    /// Bounded wait used by non-blocking acquisition.
    pub fn timeout_duration(&self) -> Duration {
        self.timeout_unit.duration(self.timeout)
    }

    /// Whether a fallback handler is configured.
    pub fn has_fallback(&self) -> bool {
        !self.fallback.trim().is_empty()
    }

    /// Project the parameters the store needs to configure a budget.
    pub fn rate_config(&self) -> RateConfig {
        RateConfig {
            scope: self.scope,
            rate: self.rate,
            interval: self.interval_duration(),
        }
    }

    /// Reject declarations no budget can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(FlowguardError::InvalidSpec("rate must be at least 1".to_string()));
        }
        if self.permits == 0 {
            return Err(FlowguardError::InvalidSpec("permits must be at least 1".to_string()));
        }
        if self.interval == 0 {
            return Err(FlowguardError::InvalidSpec("interval must be at least 1".to_string()));
        }
        if self.permits > self.rate {
            return Err(FlowguardError::InvalidSpec(format!(
                "permits ({}) cannot exceed rate ({})",
                self.permits, self.rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Milliseconds.duration(250), Duration::from_millis(250));
        assert_eq!(TimeUnit::Seconds.duration(2), Duration::from_secs(2));
        assert_eq!(TimeUnit::Minutes.duration(1), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hours.duration(1), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Days.duration(1), Duration::from_secs(86400));
    }

    #[test]
    fn test_spec_defaults_from_yaml() {
        let spec: RateSpec = serde_yaml::from_str("rate: 5").unwrap();

        assert_eq!(spec, RateSpec::new(5));
        assert_eq!(spec.interval_duration(), Duration::from_secs(1));
        assert_eq!(spec.timeout_duration(), Duration::from_secs(10));
        assert_eq!(spec.scope, Scope::Shared);
        assert!(!spec.blocking);
        assert!(!spec.has_fallback());
    }

    #[test]
    fn test_spec_from_full_yaml() {
        let yaml = r##"
name: orders
args: ["#p0.user_id"]
rate: 2
interval: 30
interval_unit: minutes
permits: 2
scope: per_instance
blocking: true
fallback: on_limited
fallback_owner: OrderFallbacks
"##;
        let spec: RateSpec = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(spec.name, "orders");
        assert_eq!(spec.args, vec!["#p0.user_id".to_string()]);
        assert_eq!(spec.interval_duration(), Duration::from_secs(1800));
        assert_eq!(spec.scope, Scope::PerInstance);
        assert!(spec.blocking);
        assert!(spec.has_fallback());
        assert_eq!(spec.fallback_owner.as_deref(), Some("OrderFallbacks"));
    }

    #[test]
    fn test_rate_config_projection() {
        let spec = RateSpec::new(3)
            .per(500, TimeUnit::Milliseconds)
            .scope(Scope::PerInstance);

        assert_eq!(
            spec.rate_config(),
            RateConfig {
                scope: Scope::PerInstance,
                rate: 3,
                interval: Duration::from_millis(500),
            }
        );
    }

    #[test]
    fn test_validate() {
        assert!(RateSpec::new(1).validate().is_ok());
        assert!(RateSpec::new(0).validate().is_err());
        assert!(RateSpec::new(1).permits(0).validate().is_err());
        assert!(RateSpec::new(1).per(0, TimeUnit::Seconds).validate().is_err());
        assert!(RateSpec::new(2).permits(3).validate().is_err());
    }

    #[test]
    fn test_blank_fallback_is_not_configured() {
        assert!(!RateSpec::new(1).fallback("  ").has_fallback());
    }
}
