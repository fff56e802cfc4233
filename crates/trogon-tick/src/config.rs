use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use trogon_std::{ReadEnv, SystemEnv};

use crate::{
    claim::ClaimLayout,
    error::{ConfigError, StoreError},
    job::JobIdentity,
};

const ENV_KEY_PREFIX: &str = "TICK_KEY_PREFIX";
const ENV_CLAIM_LAYOUT: &str = "TICK_CLAIM_LAYOUT";
const ENV_LEASE_TTL_SEC: &str = "TICK_LEASE_TTL_SEC";
const ENV_RENEW_INTERVAL_MS: &str = "TICK_RENEW_INTERVAL_MS";
const ENV_OP_TIMEOUT_MS: &str = "TICK_OP_TIMEOUT_MS";
const ENV_SAMPLE_BASE_MS: &str = "TICK_SAMPLE_BASE_MS";
const ENV_SAMPLE_JITTER_MS: &str = "TICK_SAMPLE_JITTER_MS";

const DEFAULT_KEY_PREFIX: &str = "cron.";
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SAMPLE_BASE: Duration = Duration::from_micros(31_250);
const DEFAULT_SAMPLE_JITTER: Duration = Duration::from_millis(250);

/// One failed store call, as delivered to the error sink.
#[derive(Debug)]
pub struct StoreFailure {
    pub job: JobIdentity,
    pub error: StoreError,
}

/// Callback receiving every [`StoreFailure`]. Never sees job-body errors.
#[derive(Clone)]
pub struct ErrorSink(Arc<dyn Fn(&StoreFailure) + Send + Sync>);

impl ErrorSink {
    pub fn new(f: impl Fn(&StoreFailure) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn report(&self, failure: &StoreFailure) {
        (self.0)(failure)
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorSink(..)")
    }
}

/// Timings and key layout shared by every job of one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prepended to every store key.
    pub key_prefix: String,
    pub layout: ClaimLayout,
    /// TTL of the owner record between renewals. Under
    /// [`ClaimLayout::SingleOwner`] the job period is added on top.
    pub lease_ttl: Duration,
    pub renew_interval: Duration,
    /// Upper bound on every individual store call.
    pub op_timeout: Duration,
    pub sample_base: Duration,
    pub sample_jitter: Duration,
    pub error_sink: Option<ErrorSink>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            layout: ClaimLayout::default(),
            lease_ttl: DEFAULT_LEASE_TTL,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            op_timeout: DEFAULT_OP_TIMEOUT,
            sample_base: DEFAULT_SAMPLE_BASE,
            sample_jitter: DEFAULT_SAMPLE_JITTER,
            error_sink: None,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults.
    ///
    /// - `TICK_KEY_PREFIX` (default `cron.`)
    /// - `TICK_CLAIM_LAYOUT`: `per_tick` | `single_owner` (default `per_tick`)
    /// - `TICK_LEASE_TTL_SEC` (default 60)
    /// - `TICK_RENEW_INTERVAL_MS` (default 1000)
    /// - `TICK_OP_TIMEOUT_MS` (default 5000)
    /// - `TICK_SAMPLE_BASE_MS` / `TICK_SAMPLE_JITTER_MS` (default 31.25 / 250)
    pub fn from_env<E: ReadEnv>(env: &E) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            key_prefix: env.var(ENV_KEY_PREFIX).unwrap_or(defaults.key_prefix),
            layout: match env.var(ENV_CLAIM_LAYOUT) {
                Ok(raw) => raw.parse().map_err(|reason| ConfigError::InvalidEnv {
                    var: ENV_CLAIM_LAYOUT,
                    reason,
                })?,
                Err(_) => defaults.layout,
            },
            lease_ttl: duration_from_env(env, ENV_LEASE_TTL_SEC, Duration::from_secs)?
                .unwrap_or(defaults.lease_ttl),
            renew_interval: duration_from_env(env, ENV_RENEW_INTERVAL_MS, Duration::from_millis)?
                .unwrap_or(defaults.renew_interval),
            op_timeout: duration_from_env(env, ENV_OP_TIMEOUT_MS, Duration::from_millis)?
                .unwrap_or(defaults.op_timeout),
            sample_base: duration_from_env(env, ENV_SAMPLE_BASE_MS, Duration::from_millis)?
                .unwrap_or(defaults.sample_base),
            sample_jitter: duration_from_env(env, ENV_SAMPLE_JITTER_MS, Duration::from_millis)?
                .unwrap_or(defaults.sample_jitter),
            error_sink: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_layout(mut self, layout: ClaimLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_sampling(mut self, base: Duration, jitter: Duration) -> Self {
        self.sample_base = base;
        self.sample_jitter = jitter;
        self
    }

    pub fn on_error(mut self, f: impl Fn(&StoreFailure) + Send + Sync + 'static) -> Self {
        self.error_sink = Some(ErrorSink::new(f));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("lease_ttl", self.lease_ttl),
            ("renew_interval", self.renew_interval),
            ("op_timeout", self.op_timeout),
            ("sample_base", self.sample_base),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.renew_interval >= self.lease_ttl {
            return Err(ConfigError::Invalid(format!(
                "renew_interval ({:?}) must be shorter than lease_ttl ({:?})",
                self.renew_interval, self.lease_ttl
            )));
        }
        if self.op_timeout >= self.lease_ttl {
            return Err(ConfigError::Invalid(format!(
                "op_timeout ({:?}) must be shorter than lease_ttl ({:?})",
                self.op_timeout, self.lease_ttl
            )));
        }
        // A longer cadence can step over a whole second and miss its tick.
        if self.sample_base + self.sample_jitter >= Duration::from_secs(1) {
            return Err(ConfigError::Invalid(format!(
                "sample_base + sample_jitter ({:?}) must stay below one second",
                self.sample_base + self.sample_jitter
            )));
        }
        Ok(())
    }

    pub(crate) fn report(&self, failure: &StoreFailure) {
        if let Some(sink) = &self.error_sink {
            sink.report(failure);
        }
    }
}

fn duration_from_env<E: ReadEnv>(
    env: &E,
    var: &'static str,
    unit: fn(u64) -> Duration,
) -> Result<Option<Duration>, ConfigError> {
    match env.var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|n| Some(unit(n)))
            .map_err(|e| ConfigError::InvalidEnv {
                var,
                reason: format!("{raw:?}: {e}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use trogon_std::InMemoryEnv;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.key_prefix, "cron.");
        assert_eq!(config.layout, ClaimLayout::PerTick);
        assert_eq!(config.lease_ttl, Duration::from_secs(60));
        assert_eq!(config.op_timeout, Duration::from_secs(5));
    }

    #[test]
    fn from_env_with_nothing_set_uses_defaults() {
        let config = EngineConfig::from_env(&InMemoryEnv::new()).unwrap();
        assert_eq!(config.renew_interval, Duration::from_secs(1));
        assert_eq!(config.sample_base, Duration::from_micros(31_250));
    }

    #[test]
    fn from_env_reads_overrides() {
        let env = InMemoryEnv::new();
        env.set("TICK_KEY_PREFIX", "prod.cron.");
        env.set("TICK_CLAIM_LAYOUT", "single_owner");
        env.set("TICK_LEASE_TTL_SEC", "30");
        env.set("TICK_RENEW_INTERVAL_MS", "500");
        env.set("TICK_OP_TIMEOUT_MS", "2000");
        env.set("TICK_SAMPLE_BASE_MS", "50");
        env.set("TICK_SAMPLE_JITTER_MS", "100");

        let config = EngineConfig::from_env(&env).unwrap();

        assert_eq!(config.key_prefix, "prod.cron.");
        assert_eq!(config.layout, ClaimLayout::SingleOwner);
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.renew_interval, Duration::from_millis(500));
        assert_eq!(config.op_timeout, Duration::from_secs(2));
        assert_eq!(config.sample_base, Duration::from_millis(50));
        assert_eq!(config.sample_jitter, Duration::from_millis(100));
    }

    #[test]
    fn from_env_rejects_garbage() {
        let env = InMemoryEnv::new();
        env.set("TICK_OP_TIMEOUT_MS", "soon");
        let err = EngineConfig::from_env(&env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "TICK_OP_TIMEOUT_MS", .. }));

        let env = InMemoryEnv::new();
        env.set("TICK_CLAIM_LAYOUT", "both");
        let err = EngineConfig::from_env(&env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "TICK_CLAIM_LAYOUT", .. }));
    }

    #[test]
    fn validate_rejects_renew_slower_than_lease() {
        let config = EngineConfig::default()
            .with_lease_ttl(Duration::from_secs(2))
            .with_renew_interval(Duration::from_secs(2));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_timeout_longer_than_lease() {
        let config = EngineConfig::default()
            .with_lease_ttl(Duration::from_secs(3))
            .with_op_timeout(Duration::from_secs(5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_sampling_that_skips_seconds() {
        let config = EngineConfig::default().with_sampling(Duration::from_millis(800), Duration::from_millis(300));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_durations() {
        let config = EngineConfig::default().with_op_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn on_error_installs_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let config = EngineConfig::default().on_error(move |f| {
            sink_seen.lock().unwrap().push(f.job.name.clone());
        });

        config.report(&StoreFailure {
            job: crate::job::JobSpec::new("heartbeat", 60, 0).identity(),
            error: StoreError::ClaimMissing {
                operation: crate::error::StoreOp::Renew,
                key: "cron.owner.heartbeat".to_string(),
            },
        });

        assert_eq!(*seen.lock().unwrap(), vec!["heartbeat".to_string()]);
    }
}
