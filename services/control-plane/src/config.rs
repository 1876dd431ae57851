use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kiln_reconcile::{BackoffPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub registry: RegistryConfig,
    pub resources: ResourceManagerConfig,
    pub scheduler: SchedulerConfig,
    pub reconciler: ReconcilerConfig,
    pub workers: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            registry: RegistryConfig::default(),
            resources: ResourceManagerConfig::default(),
            scheduler: SchedulerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("KILN_LOG_LEVEL") {
            config.log_level = level;
        }

        let call_timeout = env_millis("KILN_COLLABORATOR_TIMEOUT_MS")?;
        if let Some(timeout) = call_timeout {
            config.registry.call_timeout = timeout;
            config.resources.call_timeout = timeout;
            config.reconciler.call_timeout = timeout;
        }

        config.registry.benchmark_on_register =
            env_bool("KILN_BENCHMARK_ON_REGISTER", config.registry.benchmark_on_register);

        if let Some(interval) = env_secs("KILN_SNAPSHOT_INTERVAL_SECS")? {
            config.resources.refresh_interval = interval;
        }
        if let Some(n) = env_parse::<u32>("KILN_STALE_INTERVALS")? {
            config.resources.stale_after_intervals = n;
        }
        if let Some(interval) = env_secs("KILN_REBALANCE_INTERVAL_SECS")? {
            config.resources.rebalance_interval = interval;
        }
        if let Some(n) = env_parse::<u32>("KILN_SCALE_DOWN_COOLDOWN")? {
            config.resources.scale_down_cooldown = n;
        }
        if let Some(ratio) = env_parse::<f64>("KILN_OVERCOMMIT_RATIO")? {
            config.resources.overcommit_ratio = ratio;
        }
        if let Ok(mode) = std::env::var("KILN_PREEMPTION") {
            config.scheduler.preemption = mode.parse()?;
        }

        if let Some(n) = env_parse::<u32>("KILN_MAX_INFEASIBLE_ATTEMPTS")? {
            config.reconciler.max_infeasible_attempts = n;
        }
        config.reconciler.execute_migrations =
            env_bool("KILN_EXECUTE_MIGRATIONS", config.reconciler.execute_migrations);
        if let Some(hold) = env_secs("KILN_PREEMPTION_HOLD_SECS")? {
            config.reconciler.preemption_hold = hold;
        }

        if let Some(n) = env_parse::<usize>("KILN_RECONCILE_WORKERS")? {
            config.workers.reconcile_workers = n;
        }
        if let Some(interval) = env_secs("KILN_RECONCILE_INTERVAL_SECS")? {
            config.workers.reconcile_interval = interval;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ratio = self.resources.overcommit_ratio;
        if ratio.is_nan() || ratio < 1.0 {
            bail!("overcommit ratio must be >= 1.0, got {ratio}");
        }
        if self.resources.stale_after_intervals == 0 {
            bail!("stale interval count must be at least 1");
        }
        if self.resources.scale_down_cooldown == 0 {
            bail!("scale-down cooldown must be at least 1 evaluation");
        }
        if self.workers.reconcile_workers == 0 {
            bail!("reconcile worker pool must have at least 1 worker");
        }
        if self.reconciler.max_infeasible_attempts == 0 {
            bail!("infeasible attempt limit must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// Component configs
// =============================================================================

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Attempts per storage call before giving up.
    pub storage_attempts: u32,
    pub storage_backoff: BackoffPolicy,
    pub call_timeout: Duration,
    pub benchmark_timeout: Duration,
    pub benchmark_on_register: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            storage_attempts: 3,
            storage_backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(5)),
            call_timeout: Duration::from_secs(5),
            benchmark_timeout: Duration::from_secs(300),
            benchmark_on_register: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    pub refresh_interval: Duration,
    /// Factor by which CPU and memory allocation may exceed capacity.
    /// GPUs are never overcommitted.
    pub overcommit_ratio: f64,
    /// A node not reported for this many intervals is marked unhealthy.
    pub stale_after_intervals: u32,
    pub rebalance_interval: Duration,
    /// Consecutive all-low evaluations required before scaling down.
    pub scale_down_cooldown: u32,
    /// Fraction of capacity the ledger may differ from the reported
    /// allocation before the difference counts as divergence.
    pub divergence_threshold: f64,
    /// Consecutive divergent polls before the ledger is resynced.
    pub divergence_polls: u32,
    /// Node fragmentation above which rebalancing proposes migrations.
    pub fragmentation_threshold: f64,
    /// Allocation fraction above which a node is over-utilized.
    pub high_watermark: f64,
    /// Allocation fraction below which a node is under-utilized.
    pub low_watermark: f64,
    /// Smoothing factor for the per-node demand forecast.
    pub forecast_alpha: f64,
    pub call_timeout: Duration,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            overcommit_ratio: 1.0,
            stale_after_intervals: 3,
            rebalance_interval: Duration::from_secs(5 * 60),
            scale_down_cooldown: 5,
            divergence_threshold: 0.1,
            divergence_polls: 3,
            fragmentation_threshold: 0.5,
            high_watermark: 0.8,
            low_watermark: 0.3,
            forecast_alpha: 0.3,
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Weights of the placement score terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub model_affinity: f64,
    pub resource_fit: f64,
    pub qos_isolation: f64,
    pub fragmentation: f64,
    /// How strongly a forecast of rising demand discounts resource fit.
    pub forecast_bias: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            model_affinity: 10.0,
            resource_fit: 3.0,
            qos_isolation: 2.0,
            fragmentation: 2.0,
            forecast_bias: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreemptionMode {
    #[default]
    Disabled,
    LowestQosFirst,
    CostAware,
}

impl FromStr for PreemptionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" | "" => Ok(Self::Disabled),
            "lowest_qos_first" => Ok(Self::LowestQosFirst),
            "cost_aware" => Ok(Self::CostAware),
            other => bail!("unknown preemption mode '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub weights: ScoringWeights,
    pub preemption: PreemptionMode,
    /// Re-filter attempts after losing a commit race.
    pub max_commit_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            preemption: PreemptionMode::Disabled,
            max_commit_attempts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Restarts allowed per instance within `restart_window`.
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub max_infeasible_attempts: u32,
    pub infeasible_backoff: BackoffPolicy,
    pub runtime_backoff: BackoffPolicy,
    pub call_timeout: Duration,
    pub execute_migrations: bool,
    /// How long capacity freed by a preemption stays reserved for the
    /// preempting workload.
    pub preemption_hold: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RETRIES,
            restart_window: DEFAULT_RETRY_WINDOW,
            max_infeasible_attempts: 10,
            infeasible_backoff: BackoffPolicy::default(),
            runtime_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            call_timeout: Duration::from_secs(5),
            execute_migrations: false,
            preemption_hold: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub reconcile_workers: usize,
    pub reconcile_interval: Duration,
    /// Upper bound on a single reconcile pass.
    pub reconcile_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reconcile_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            reconcile_interval: kiln_reconcile::DEFAULT_RECONCILE_INTERVAL,
            reconcile_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Env helpers
// =============================================================================

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        Err(_) => Ok(None),
    }
}

fn env_secs(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

fn env_millis(key: &str) -> Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.resources.refresh_interval, Duration::from_secs(10));
        assert_eq!(config.resources.scale_down_cooldown, 5);
        assert_eq!(config.reconciler.max_infeasible_attempts, 10);
        assert_eq!(config.reconciler.max_restarts, 3);
        assert_eq!(config.scheduler.preemption, PreemptionMode::Disabled);
    }

    #[rstest]
    #[case(0.5)]
    #[case(f64::NAN)]
    fn test_overcommit_below_one_rejected(#[case] ratio: f64) {
        let mut config = Config::default();
        config.resources.overcommit_ratio = ratio;
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case("disabled", PreemptionMode::Disabled)]
    #[case("LOWEST_QOS_FIRST", PreemptionMode::LowestQosFirst)]
    #[case("cost_aware", PreemptionMode::CostAware)]
    fn test_preemption_mode_parse(#[case] raw: &str, #[case] expected: PreemptionMode) {
        assert_eq!(raw.parse::<PreemptionMode>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_preemption_mode_rejected() {
        assert!("always".parse::<PreemptionMode>().is_err());
    }
}
