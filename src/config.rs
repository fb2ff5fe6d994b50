use anyhow::Result;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::controller::alerts::AlertThresholds;
use crate::domain::BatteryConfig;
use crate::simulation::ProfileTable;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
pub const ENV_PREFIX: &str = "BTSIM__";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub simulation: SimulationSettings,
    pub profiles: ProfileTable,
    pub alerts: AlertThresholds,
    pub persistence: PersistenceConfig,
    /// Batteries created at daemon startup.
    pub fleet: Vec<BatteryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            request_timeout_secs: 30,
            enable_cors: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

/// Engine-wide knobs shared by every simulation loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Bounded queue length per subscriber; oldest events are dropped past it.
    pub subscriber_queue_capacity: usize,
    /// Consecutive failed ticks before a loop is stopped with a fault.
    pub max_consecutive_failures: u32,
    /// Upper bound on one integration sub-step, in simulated milliseconds.
    pub max_substep_ms: u64,
    /// Queue length between the loops and the persistence sink.
    pub sink_queue_capacity: usize,
    /// Start the configured fleet right after creating it.
    pub autostart: bool,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 256,
            max_consecutive_failures: 3,
            max_substep_ms: 5_000,
            sink_queue_capacity: 1_024,
            autostart: true,
        }
    }
}

impl SimulationSettings {
    pub fn max_substep(&self) -> Duration {
        Duration::from_millis(self.max_substep_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Append every event as a JSON line to this file when set.
    pub jsonl_path: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Ok(figment.extract()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{DegradationProfile, EnvironmentalScenario};

    #[test]
    fn test_defaults_without_files() {
        figment::Jail::expect_with(|_jail| {
            let cfg = Config::load_from("does-not-exist.toml").expect("defaults");
            assert_eq!(cfg.simulation.max_consecutive_failures, 3);
            assert_eq!(cfg.simulation.subscriber_queue_capacity, 256);
            assert_eq!(cfg.server.port, 8090);
            assert!(cfg.fleet.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_toml_and_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "sim.toml",
                r#"
                [server]
                port = 9100

                [simulation]
                max_consecutive_failures = 5

                [profiles.failing]
                activation_energy_j_per_mol = 50000.0
                pre_exponential_per_s = 12.5
                stress_sensitivity = 3.0
                resistance_growth_factor = 1.6
                end_of_life_soh = 0.8

                [[fleet]]
                id = "B1"
                profile = "healthy"
                scenario = "mild_climate"
                tick_interval_ms = 1000
                "#,
            )?;
            jail.set_env("BTSIM__SERVER__PORT", "9200");

            let cfg = Config::load_from("sim.toml").expect("layered config");
            assert_eq!(cfg.server.port, 9200);
            assert_eq!(cfg.simulation.max_consecutive_failures, 5);
            assert_eq!(cfg.profiles.failing.pre_exponential_per_s, 12.5);
            // untouched profiles keep their defaults
            assert!(cfg.profiles.healthy.pre_exponential_per_s > 0.0);
            assert_eq!(cfg.fleet.len(), 1);
            assert_eq!(cfg.fleet[0].profile, DegradationProfile::Healthy);
            assert_eq!(cfg.fleet[0].scenario, EnvironmentalScenario::MildClimate);
            assert_eq!(cfg.fleet[0].initial_soh, 1.0);
            Ok(())
        });
    }
}
