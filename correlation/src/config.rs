//! Configuration for the correlation engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// GPU vendor back-end whose correlation contract is being served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cuda,
    Rocm,
    Level0,
    OpenCl,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Cuda => "cuda",
            Backend::Rocm => "rocm",
            Backend::Level0 => "level0",
            Backend::OpenCl => "opencl",
        }
    }

    /// Host-correlation map regime used by this back-end
    pub fn map_regime(self) -> MapRegime {
        match self {
            Backend::Cuda => MapRegime::PerThread,
            Backend::Rocm | Backend::Level0 | Backend::OpenCl => MapRegime::Shared,
        }
    }

    pub fn default_id_scheme(self) -> IdScheme {
        match self {
            Backend::Cuda | Backend::Rocm => IdScheme::ThreadEmbedded,
            Backend::Level0 | Backend::OpenCl => IdScheme::GlobalCounter,
        }
    }

    /// Whether completion records carry vendor-native ids that must be
    /// translated through external-correlation records
    pub fn translates_vendor_ids(self) -> bool {
        matches!(self, Backend::Cuda)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cuda" | "cupti" => Ok(Backend::Cuda),
            "rocm" | "roctracer" => Ok(Backend::Rocm),
            "level0" | "l0" => Ok(Backend::Level0),
            "opencl" => Ok(Backend::OpenCl),
            _ => anyhow::bail!("Invalid backend: {}", s),
        }
    }
}

/// How correlation ids are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdScheme {
    /// Submitting thread id in the high bits, per-thread sequence below
    ThreadEmbedded,
    /// One process-wide atomic counter
    GlobalCounter,
}

impl std::str::FromStr for IdScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "thread_embedded" => Ok(IdScheme::ThreadEmbedded),
            "global_counter" => Ok(IdScheme::GlobalCounter),
            _ => anyhow::bail!("Invalid id scheme: {}", s),
        }
    }
}

/// Locking regime of the host-correlation map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapRegime {
    /// Striped by submitting thread; inserts from different threads never contend
    PerThread,
    /// One lock for the whole map
    Shared,
}

/// Thread that applies metrics once a record has been resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionSite {
    Monitor,
    ApplicationThread,
}

impl std::str::FromStr for AttributionSite {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "monitor" => Ok(AttributionSite::Monitor),
            "application_thread" | "app" => Ok(AttributionSite::ApplicationThread),
            _ => anyhow::bail!("Invalid attribution site: {}", s),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Vendor back-end
    pub backend: Backend,

    /// Id scheme override (None = back-end default)
    pub id_scheme: Option<IdScheme>,

    /// Stripes of the per-thread host map, power of two
    pub map_shards: usize,

    /// Let a live correlation id be re-inserted instead of failing
    pub allow_replace: bool,

    /// Monitor idle sleep in microseconds
    pub monitor_idle_wait_us: u64,

    /// Which thread applies metrics
    pub attribution_site: AttributionSite,

    /// Kernels submitted while this is on wait for PC samples before their
    /// host entry is released
    pub pc_sampling: bool,

    /// Multiplier applied to PC sample counts
    pub pc_sample_period: u32,

    /// Upper bound on a flush barrier, in milliseconds
    pub flush_timeout_ms: u64,

    /// Upper bound on waiting for in-flight operations, in milliseconds
    pub pending_timeout_ms: u64,
}

impl Config {
    /// Built-in defaults for a back-end, ignoring the environment
    pub fn for_backend(backend: Backend) -> Self {
        Self {
            backend,
            id_scheme: None,
            map_shards: 64,
            allow_replace: false,
            monitor_idle_wait_us: 200,
            attribution_site: AttributionSite::Monitor,
            pc_sampling: false,
            pc_sample_period: 1,
            flush_timeout_ms: 10_000,
            pending_timeout_ms: 10_000,
        }
    }

    pub fn id_scheme(&self) -> IdScheme {
        self.id_scheme
            .unwrap_or_else(|| self.backend.default_id_scheme())
    }

    pub fn map_regime(&self) -> MapRegime {
        self.backend.map_regime()
    }

    pub fn monitor_idle_wait(&self) -> Duration {
        Duration::from_micros(self.monitor_idle_wait_us)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.map_shards == 0 || !self.map_shards.is_power_of_two() {
            anyhow::bail!("map_shards must be a power of two (got {})", self.map_shards);
        }

        if self.map_shards > 4096 {
            anyhow::bail!("map_shards too large (max 4096)");
        }

        // Per-thread stripes are located from the thread id carried in the id
        if self.map_regime() == MapRegime::PerThread && self.id_scheme() != IdScheme::ThreadEmbedded {
            anyhow::bail!(
                "backend {} keeps per-thread host maps and requires thread-embedded correlation ids",
                self.backend
            );
        }

        if self.pc_sample_period == 0 {
            anyhow::bail!("pc_sample_period must be greater than 0");
        }

        if self.monitor_idle_wait_us > 1_000_000 {
            anyhow::bail!("monitor_idle_wait_us too large (max 1s)");
        }

        if self.flush_timeout_ms == 0 || self.pending_timeout_ms == 0 {
            anyhow::bail!("Barrier timeouts must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let backend = std::env::var("GPUCORR_BACKEND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Backend::Cuda);
        let base = Self::for_backend(backend);

        Self {
            id_scheme: std::env::var("GPUCORR_ID_SCHEME")
                .ok()
                .and_then(|s| s.parse().ok()),
            map_shards: std::env::var("GPUCORR_MAP_SHARDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(base.map_shards),
            allow_replace: std::env::var("GPUCORR_ALLOW_REPLACE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(base.allow_replace),
            monitor_idle_wait_us: std::env::var("GPUCORR_MONITOR_IDLE_US")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(base.monitor_idle_wait_us),
            attribution_site: std::env::var("GPUCORR_ATTRIBUTION_SITE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(base.attribution_site),
            pc_sampling: std::env::var("GPUCORR_PC_SAMPLING")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(base.pc_sampling),
            pc_sample_period: std::env::var("GPUCORR_PC_SAMPLE_PERIOD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(base.pc_sample_period),
            flush_timeout_ms: std::env::var("GPUCORR_FLUSH_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(base.flush_timeout_ms),
            pending_timeout_ms: std::env::var("GPUCORR_PENDING_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(base.pending_timeout_ms),
            ..base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_policy_table() {
        assert_eq!(Backend::Cuda.map_regime(), MapRegime::PerThread);
        assert_eq!(Backend::Rocm.map_regime(), MapRegime::Shared);
        assert_eq!(Backend::Level0.map_regime(), MapRegime::Shared);
        assert_eq!(Backend::OpenCl.map_regime(), MapRegime::Shared);

        assert_eq!(Backend::Cuda.default_id_scheme(), IdScheme::ThreadEmbedded);
        assert_eq!(Backend::Rocm.default_id_scheme(), IdScheme::ThreadEmbedded);
        assert_eq!(Backend::Level0.default_id_scheme(), IdScheme::GlobalCounter);
        assert_eq!(Backend::OpenCl.default_id_scheme(), IdScheme::GlobalCounter);

        assert!(Backend::Cuda.translates_vendor_ids());
        assert!(!Backend::Rocm.translates_vendor_ids());
    }

    #[test]
    fn test_parse_backend() {
        assert_eq!("CUDA".parse::<Backend>().unwrap(), Backend::Cuda);
        assert_eq!("l0".parse::<Backend>().unwrap(), Backend::Level0);
        assert!("metal".parse::<Backend>().is_err());
        assert_eq!(
            "application-thread".parse::<AttributionSite>().unwrap(),
            AttributionSite::ApplicationThread
        );
        assert_eq!(
            "global_counter".parse::<IdScheme>().unwrap(),
            IdScheme::GlobalCounter
        );
    }

    #[test]
    fn test_config_validation() {
        let valid = Config::for_backend(Backend::Cuda);
        assert!(valid.validate().is_ok());
        assert_eq!(valid.id_scheme(), IdScheme::ThreadEmbedded);
        assert_eq!(valid.monitor_idle_wait(), Duration::from_micros(200));

        let invalid = Config {
            map_shards: 48,
            ..Config::for_backend(Backend::Cuda)
        };
        assert!(invalid.validate().is_err());

        let invalid = Config {
            map_shards: 0,
            ..Config::for_backend(Backend::Rocm)
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_per_thread_regime_needs_embedded_ids() {
        let config = Config {
            id_scheme: Some(IdScheme::GlobalCounter),
            ..Config::for_backend(Backend::Cuda)
        };
        assert!(config.validate().is_err());

        let config = Config {
            id_scheme: Some(IdScheme::ThreadEmbedded),
            ..Config::for_backend(Backend::OpenCl)
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_period_and_timeouts() {
        let config = Config {
            pc_sample_period: 0,
            ..Config::for_backend(Backend::Rocm)
        };
        assert!(config.validate().is_err());

        let config = Config {
            flush_timeout_ms: 0,
            ..Config::for_backend(Backend::Rocm)
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"backend":"level0","map_shards":8}"#).unwrap();
        assert_eq!(config.backend, Backend::Level0);
        assert_eq!(config.map_shards, 8);
        assert_eq!(config.id_scheme(), IdScheme::GlobalCounter);
    }
}
