//! Controller configuration.

use anyhow::{bail, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Namespace filter. "all" disables namespace scoping.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_priority_label_key")]
    pub priority_label_key: String,
    #[serde(default = "default_priority_hp_value")]
    pub priority_hp_value: String,
    #[serde(default = "default_priority_lp_value")]
    pub priority_lp_value: String,

    /// In-cluster discovery is used when unset; an explicit URL overrides it.
    pub cluster_api_url: Option<String>,

    #[serde(default = "default_timeseries_url")]
    pub timeseries_url: String,

    #[serde(default = "default_sla_threshold_ms")]
    pub sla_threshold_ms: f64,
    /// Seconds between control loop ticks (env `CONTROL_LOOP_INTERVAL`).
    #[serde(default = "default_control_loop_interval")]
    pub control_loop_interval: u64,
    /// Minimum seconds between applied adjustments (env `ADJUSTMENT_COOLDOWN`).
    #[serde(default = "default_adjustment_cooldown")]
    pub adjustment_cooldown: u64,

    #[serde(default = "default_min_io_weight")]
    pub min_io_weight: u32,
    #[serde(default = "default_max_io_weight")]
    pub max_io_weight: u32,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: String,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    #[serde(default = "default_mode")]
    pub mode: String,
    pub shared_mount_path: Option<String>,
    pub read_bandwidth_limit: Option<String>,
    pub write_bandwidth_limit: Option<String>,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_namespace() -> String {
    "all".to_string()
}

fn default_priority_label_key() -> String {
    "group-id".to_string()
}

fn default_priority_hp_value() -> String {
    "hp".to_string()
}

fn default_priority_lp_value() -> String {
    "lp".to_string()
}

fn default_timeseries_url() -> String {
    "http://prometheus.monitoring.svc:9090".to_string()
}

fn default_sla_threshold_ms() -> f64 {
    500.0
}

fn default_control_loop_interval() -> u64 {
    5
}

fn default_adjustment_cooldown() -> u64 {
    10
}

fn default_min_io_weight() -> u32 {
    100
}

fn default_max_io_weight() -> u32 {
    1000
}

fn default_cgroup_root() -> String {
    "/sys/fs/cgroup".to_string()
}

fn default_metrics_port() -> u16 {
    8080
}

fn default_mode() -> String {
    "weight".to_string()
}

impl ControllerConfig {
    /// Load configuration from environment, falling back to defaults on
    /// deserialize failure, same two-step shape as the teacher's
    /// `AgentConfig::load`.
    pub fn load() -> Result<Self> {
        let built = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        let config: ControllerConfig = built.try_deserialize().unwrap_or_else(|_| ControllerConfig {
            node_name: default_node_name(),
            namespace: default_namespace(),
            priority_label_key: default_priority_label_key(),
            priority_hp_value: default_priority_hp_value(),
            priority_lp_value: default_priority_lp_value(),
            cluster_api_url: None,
            timeseries_url: default_timeseries_url(),
            sla_threshold_ms: default_sla_threshold_ms(),
            control_loop_interval: default_control_loop_interval(),
            adjustment_cooldown: default_adjustment_cooldown(),
            min_io_weight: default_min_io_weight(),
            max_io_weight: default_max_io_weight(),
            cgroup_root: default_cgroup_root(),
            metrics_port: default_metrics_port(),
            mode: default_mode(),
            shared_mount_path: None,
            read_bandwidth_limit: None,
            write_bandwidth_limit: None,
        });

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.min_io_weight < 1 || self.max_io_weight > 1000 {
            bail!(
                "MIN_IO_WEIGHT/MAX_IO_WEIGHT must fall within [1, 1000], got [{}, {}]",
                self.min_io_weight,
                self.max_io_weight
            );
        }
        if self.min_io_weight > self.max_io_weight {
            bail!(
                "MIN_IO_WEIGHT ({}) must not exceed MAX_IO_WEIGHT ({})",
                self.min_io_weight,
                self.max_io_weight
            );
        }
        if self.mode != "weight" && self.mode != "bandwidth" {
            bail!("MODE must be 'weight' or 'bandwidth', got '{}'", self.mode);
        }
        if self.mode == "bandwidth" && self.shared_mount_path.is_none() {
            bail!("MODE=bandwidth requires SHARED_MOUNT_PATH to be set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ControllerConfig {
        ControllerConfig {
            node_name: "node-1".to_string(),
            namespace: default_namespace(),
            priority_label_key: default_priority_label_key(),
            priority_hp_value: default_priority_hp_value(),
            priority_lp_value: default_priority_lp_value(),
            cluster_api_url: None,
            timeseries_url: default_timeseries_url(),
            sla_threshold_ms: default_sla_threshold_ms(),
            control_loop_interval: default_control_loop_interval(),
            adjustment_cooldown: default_adjustment_cooldown(),
            min_io_weight: default_min_io_weight(),
            max_io_weight: default_max_io_weight(),
            cgroup_root: default_cgroup_root(),
            metrics_port: default_metrics_port(),
            mode: default_mode(),
            shared_mount_path: None,
            read_bandwidth_limit: None,
            write_bandwidth_limit: None,
        }
    }

    #[test]
    fn default_config_validates() {
        base().validate().unwrap();
    }

    #[test]
    fn min_weight_above_max_is_rejected() {
        let mut config = base();
        config.min_io_weight = 900;
        config.max_io_weight = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn weight_out_of_bounds_is_rejected() {
        let mut config = base();
        config.max_io_weight = 1500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bandwidth_mode_without_mount_path_is_rejected() {
        let mut config = base();
        config.mode = "bandwidth".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bandwidth_mode_with_mount_path_validates() {
        let mut config = base();
        config.mode = "bandwidth".to_string();
        config.shared_mount_path = Some("/mnt/shared".to_string());
        config.validate().unwrap();
    }
}
