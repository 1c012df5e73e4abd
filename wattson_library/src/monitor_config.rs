use crate::logging::LoggingConfig;
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub const MONITOR_ENV_PREFIX: &str = "WATTSON";

pub type WattsonConfig = Arc<MonitorConfig>;

#[derive(Debug, Deserialize, Clone)]
/// Everything a measurement consumes.
/// Loaded from the compiled-in `monitor.json`, an optional file, `WATTSON__*` environment variables, then overrides.
pub struct MonitorConfig {
    pub monitor: SamplingConfig,
    pub coordination: CoordinationConfig,
    pub benchmarking: BenchmarkingConfig,
    pub post_processing: PostProcessingConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub paths: PathConfig,
    pub logging: Arc<LoggingConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SamplingConfig {
    /// seconds between samples
    pub sampling_period: f64,
    /// Glob patterns; a sensor is kept only if one matches.
    #[serde(default)]
    pub include_sensors: Vec<String>,
    /// Glob patterns; a matching sensor is dropped.
    #[serde(default)]
    pub exclude_sensors: Vec<String>,
    #[serde(default)]
    pub include_backends: Vec<String>,
    #[serde(default)]
    pub exclude_backends: Vec<String>,
    /// Consecutive ticks where every sensor of a backend fails before it is disabled.
    pub max_consecutive_failures: u32,
    /// Fraction of the sampling period a single backend read may take.
    pub overrun_fraction: f64,
    /// Consecutive over-budget reads before a backend is disabled.
    pub overrun_ticks: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CoordinationConfig {
    pub barrier_timeout_ms: u64,
    pub gather_timeout_ms: u64,
    /// Explicit visibility override for this rank: GPU indices or UUIDs.
    /// Takes precedence over [Self::visibility_env].
    #[serde(default)]
    pub device_visibility: Option<Vec<String>>,
    /// Environment variables holding a comma separated GPU visibility list.
    #[serde(default)]
    pub visibility_env: Vec<String>,
    /// Rank of this process, if not discovered from the launcher's environment.
    #[serde(default)]
    pub rank: Option<usize>,
    #[serde(default)]
    pub world_size: Option<usize>,
    /// `host:port` of rank 0 when running distributed.
    #[serde(default)]
    pub coordinator: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BenchmarkingConfig {
    pub rounds: u32,
    pub warmup_rounds: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostProcessingConfig {
    /// Watts added to every host for components no sensor covers.
    pub power_overhead: f64,
    /// Power usage effectiveness of the facility.
    pub pue: f64,
    /// gCO2e per kWh
    pub emissions_factor: f64,
    /// currency per kWh
    pub price_factor: f64,
    pub price_unit: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Key of the persisted history; defaults to the monitored program's name.
    #[serde(default)]
    pub app_name: Option<String>,
    /// Empty for the start time, `SLURM` for the job id, anything else is used verbatim.
    #[serde(default)]
    pub run_id: Option<String>,
    pub data_out: String,
    #[serde(default)]
    pub formats: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
/// Filesystem roots read by the file-based backends.
pub struct PathConfig {
    pub powercap: String,
    pub procfs: String,
    pub cpu: String,
    /// `card*` entries of AMD GPUs
    #[serde(default = "default_drm")]
    pub drm: String,
    #[serde(default = "default_hwmon")]
    pub hwmon: String,
}
fn default_drm() -> String {
    "/sys/class/drm".to_string()
}
fn default_hwmon() -> String {
    "/sys/class/hwmon".to_string()
}
impl Default for PathConfig {
    fn default() -> Self {
        PathConfig {
            powercap: "/sys/class/powercap".to_string(),
            procfs: "/proc".to_string(),
            cpu: "/sys/devices/system/cpu".to_string(),
            drm: default_drm(),
            hwmon: default_hwmon(),
        }
    }
}

impl MonitorConfig {
    pub fn new(config_fpath: Option<&str>, overrides: Option<Vec<(String, String)>>) -> Result<Self> {
        let cfg: MonitorConfig = crate::load_config_default!(
            "wattson_library/src/monitor.json",
            config_fpath,
            overrides,
            MONITOR_ENV_PREFIX
        )?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn boxed(config_fpath: Option<&str>, overrides: Option<Vec<(String, String)>>) -> Result<WattsonConfig> {
        Ok(Arc::new(Self::new(config_fpath, overrides)?))
    }

    /// Reject settings that cannot produce a meaningful measurement.
    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;
        if !m.sampling_period.is_finite() || m.sampling_period <= 0.0 {
            anyhow::bail!("sampling_period must be a positive number of seconds, got {}", m.sampling_period);
        }
        if !m.include_sensors.is_empty() && !m.exclude_sensors.is_empty() {
            anyhow::bail!("include_sensors and exclude_sensors are mutually exclusive");
        }
        if !m.include_backends.is_empty() && !m.exclude_backends.is_empty() {
            anyhow::bail!("include_backends and exclude_backends are mutually exclusive");
        }
        if !(0.0..=1.0).contains(&m.overrun_fraction) || m.overrun_fraction == 0.0 {
            anyhow::bail!("overrun_fraction must be in (0, 1], got {}", m.overrun_fraction);
        }
        if self.benchmarking.rounds == 0 {
            anyhow::bail!("rounds must be at least 1");
        }
        if self.post_processing.pue < 1.0 {
            anyhow::bail!("pue must be >= 1.0, got {}", self.post_processing.pue);
        }
        if self.post_processing.power_overhead < 0.0 {
            anyhow::bail!("power_overhead must not be negative");
        }
        for f in &self.output.formats {
            crate::storage::IoFormat::from_name(f)?;
        }
        Ok(())
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.barrier_timeout_ms)
    }
    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.gather_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pair(k: &str, v: &str) -> (String, String) {
        (k.to_string(), v.to_string())
    }

    #[test]
    fn defaults_load() {
        let cfg = MonitorConfig::new(None, None).unwrap();
        assert_eq!(cfg.monitor.sampling_period, 1.0);
        assert_eq!(cfg.benchmarking.rounds, 1);
        assert_eq!(cfg.benchmarking.warmup_rounds, 0);
        assert_eq!(cfg.post_processing.pue, 1.0);
        assert_eq!(cfg.paths.procfs, "/proc");
    }

    #[rstest]
    #[case(vec![pair("monitor.sampling_period", "0")], "sampling_period must be a positive number of seconds, got 0")]
    #[case(vec![pair("monitor.sampling_period", "-1.5")], "sampling_period must be a positive number of seconds, got -1.5")]
    #[case(vec![pair("benchmarking.rounds", "0")], "rounds must be at least 1")]
    #[case(vec![pair("post_processing.pue", "0.5")], "pue must be >= 1.0, got 0.5")]
    fn invalid_values_rejected(#[case] overrides: Vec<(String, String)>, #[case] msg: &str) {
        let err = MonitorConfig::new(None, Some(overrides)).unwrap_err();
        assert_eq!(err.to_string(), msg);
    }

    #[test]
    fn filters_mutually_exclusive() {
        let mut cfg = MonitorConfig::new(None, None).unwrap();
        cfg.monitor.include_sensors = vec!["CUDA:*".to_string()];
        cfg.validate().unwrap();
        cfg.monitor.exclude_sensors = vec!["RAM*".to_string()];
        assert_eq!(
            cfg.validate().unwrap_err().to_string(),
            "include_sensors and exclude_sensors are mutually exclusive"
        );
        cfg.monitor.exclude_sensors.clear();
        cfg.monitor.include_backends = vec!["nvml".to_string()];
        cfg.monitor.exclude_backends = vec!["host".to_string()];
        assert!(cfg.validate().is_err());
    }
}
