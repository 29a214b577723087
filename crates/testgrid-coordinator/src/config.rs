//! testgrid.toml configuration.

use std::path::Path;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use testgrid_autoscale::AutoscaleConfig;
use testgrid_balancer::BalancerConfig;
use testgrid_registry::RegistryConfig;
use testgrid_scheduler::SchedulerConfig;

/// Complete grid configuration. Every section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub registry: RegistryConfig,
    pub balancer: BalancerConfig,
    pub scheduler: SchedulerConfig,
    pub autoscale: AutoscaleConfig,
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: GridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings no component can work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let a = &self.autoscale;
        if a.min_workers > a.max_workers {
            bail!(
                "autoscale.min_workers ({}) exceeds max_workers ({})",
                a.min_workers,
                a.max_workers
            );
        }
        if a.scale_down_threshold >= a.scale_up_threshold {
            bail!(
                "autoscale.scale_down_threshold ({}) must be below scale_up_threshold ({})",
                a.scale_down_threshold,
                a.scale_up_threshold
            );
        }
        if self.balancer.load_epsilon <= 0.0 {
            bail!("balancer.load_epsilon must be positive");
        }
        if self.scheduler.load_increment < 0.0 {
            bail!("scheduler.load_increment must not be negative");
        }
        if self.registry.heartbeat_timeout.is_zero() {
            bail!("registry.heartbeat_timeout must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = GridConfig::from_toml("").unwrap();
        assert_eq!(config, GridConfig::default());
    }

    #[test]
    fn shipped_example_matches_defaults() {
        let config = GridConfig::from_toml(include_str!("../../../testgrid.toml")).unwrap();
        assert_eq!(config, GridConfig::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = GridConfig::from_toml(
            r#"
            [registry]
            heartbeat_interval = "10s"

            [balancer]
            strategy = "least_connections"
            rng_seed = 7

            [scheduler]
            default_max_retries = 1

            [autoscale]
            max_workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.registry.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.balancer.rng_seed, Some(7));
        assert_eq!(config.scheduler.default_max_retries, 1);
        assert_eq!(config.autoscale.max_workers, 4);
        assert_eq!(config.autoscale.min_workers, 1);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let err = GridConfig::from_toml(
            r#"
            [autoscale]
            scale_up_threshold = 0.3
            scale_down_threshold = 0.5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("scale_down_threshold"));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = GridConfig::from_file(Path::new("/nonexistent/testgrid.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/testgrid.toml"));
    }
}
