//! # Simulated Battery
//!
//! Configuration, lifecycle and mutable physical state of one simulated
//! battery. The state is only ever replaced by a successful
//! [`DegradationModel::advance`] call, so a rejected tick leaves it untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use validator::Validate;

use crate::simulation::{
    estimate_rul_days, BatteryThermalConfig, DegradationModel, DegradationProfile, Environment,
    EnvironmentalScenario, ModelInputError, PhysicalState, ProfileParams,
};

use super::{OperatingMode, TelemetrySample};

/// Battery chemistry; selects the open-circuit voltage curve and thermal defaults.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Chemistry {
    /// Valve-regulated lead-acid
    #[default]
    Vrla,
    LiFePo4,
    Nmc,
}

impl Chemistry {
    /// Open-circuit voltage as a fraction of nominal voltage.
    ///
    /// Cubic fit a + b*soc + c*soc³; for VRLA this is the 12 V block curve
    /// 11.8 + 0.9*soc + 0.05*soc³ normalised to 12 V.
    pub fn ocv_ratio(&self, soc: f64) -> f64 {
        let soc = soc.clamp(0.0, 1.0);
        let (a, b, c) = match self {
            Chemistry::Vrla => (0.9833, 0.075, 0.0042),
            Chemistry::LiFePo4 => (0.9375, 0.08, 0.045),
            Chemistry::Nmc => (0.81, 0.25, 0.075),
        };
        a + b * soc + c * soc.powi(3)
    }
}

/// Per-battery configuration, validated on create and reconfigure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BatteryConfig {
    #[validate(length(min = 1, max = 64))]
    pub id: String,

    #[serde(default)]
    pub chemistry: Chemistry,

    #[serde(default = "default_capacity_ah")]
    #[validate(range(exclusive_min = 0.0, max = 100_000.0))]
    pub capacity_ah: f64,

    #[serde(default = "default_nominal_voltage_v")]
    #[validate(range(exclusive_min = 0.0, max = 2_000.0))]
    pub nominal_voltage_v: f64,

    #[serde(default = "default_initial_resistance_mohm")]
    #[validate(range(exclusive_min = 0.0, max = 10_000.0))]
    pub initial_resistance_mohm: f64,

    #[serde(default = "default_unit")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub initial_soh: f64,

    #[serde(default = "default_unit")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub initial_soc: f64,

    #[serde(default = "default_profile")]
    pub profile: DegradationProfile,

    #[serde(default = "default_scenario")]
    pub scenario: EnvironmentalScenario,

    #[serde(default = "default_tick_interval_ms")]
    #[validate(range(min = 1, max = 3_600_000))]
    pub tick_interval_ms: u64,

    /// Simulated seconds per wall-clock second
    #[serde(default = "default_time_acceleration")]
    #[validate(range(min = 0.01, max = 1_000_000.0))]
    pub time_acceleration: f64,

    /// Noise seed; derived from the id when absent
    #[serde(default)]
    pub seed: Option<u64>,

    /// Starting temperature; the scenario's ambient at t = 0 when absent
    #[serde(default)]
    #[validate(range(min = -60.0, max = 120.0))]
    pub initial_temperature_c: Option<f64>,

    /// Overrides the chemistry's thermal defaults
    #[serde(default)]
    pub thermal: Option<BatteryThermalConfig>,
}

fn default_capacity_ah() -> f64 {
    100.0
}

fn default_nominal_voltage_v() -> f64 {
    12.0
}

fn default_initial_resistance_mohm() -> f64 {
    5.0
}

fn default_unit() -> f64 {
    1.0
}

fn default_profile() -> DegradationProfile {
    DegradationProfile::Healthy
}

fn default_scenario() -> EnvironmentalScenario {
    EnvironmentalScenario::NormalOperation
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_time_acceleration() -> f64 {
    1.0
}

impl BatteryConfig {
    /// 12 V / 100 Ah VRLA block, fully charged, 1 s ticks in real time.
    pub fn new(
        id: impl Into<String>,
        profile: DegradationProfile,
        scenario: EnvironmentalScenario,
    ) -> Self {
        Self {
            id: id.into(),
            chemistry: Chemistry::default(),
            capacity_ah: default_capacity_ah(),
            nominal_voltage_v: default_nominal_voltage_v(),
            initial_resistance_mohm: default_initial_resistance_mohm(),
            initial_soh: 1.0,
            initial_soc: 1.0,
            profile,
            scenario,
            tick_interval_ms: default_tick_interval_ms(),
            time_acceleration: default_time_acceleration(),
            seed: None,
            initial_temperature_c: None,
            thermal: None,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_time_acceleration(mut self, factor: f64) -> Self {
        self.time_acceleration = factor;
        self
    }

    pub fn with_chemistry(mut self, chemistry: Chemistry) -> Self {
        self.chemistry = chemistry;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Simulated time covered by one tick.
    pub fn sim_step(&self) -> Duration {
        self.tick_interval().mul_f64(self.time_acceleration)
    }

    pub fn thermal_config(&self) -> BatteryThermalConfig {
        self.thermal
            .unwrap_or_else(|| BatteryThermalConfig::for_chemistry(self.chemistry))
    }

    /// Seed for scenario noise. Stable across runs for a given id (FNV-1a).
    pub fn effective_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            self.id.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
                (hash ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
            })
        })
    }

    /// Field validation plus the cross-field checks derive macros cannot express.
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|e| e.to_string())?;
        if self.id.trim().is_empty() {
            return Err("id: must not be blank".to_string());
        }
        for (field, value) in [
            ("capacity_ah", self.capacity_ah),
            ("nominal_voltage_v", self.nominal_voltage_v),
            ("initial_resistance_mohm", self.initial_resistance_mohm),
            ("initial_soh", self.initial_soh),
            ("initial_soc", self.initial_soc),
            ("time_acceleration", self.time_acceleration),
            ("initial_temperature_c", self.initial_temperature_c.unwrap_or(0.0)),
        ] {
            if !value.is_finite() {
                return Err(format!("{field}: must be finite"));
            }
        }
        if let Some(thermal) = &self.thermal {
            if !thermal.is_valid() {
                return Err("thermal: coefficients must be positive and finite".to_string());
            }
        }
        Ok(())
    }
}

/// Partial update applied by `reconfigure`. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryReconfig {
    pub profile: Option<DegradationProfile>,
    pub scenario: Option<EnvironmentalScenario>,
    pub tick_interval_ms: Option<u64>,
    pub time_acceleration: Option<f64>,
}

impl BatteryReconfig {
    /// Returns the updated config without touching `config`.
    pub fn apply_to(&self, config: &BatteryConfig) -> BatteryConfig {
        let mut next = config.clone();
        if let Some(profile) = self.profile {
            next.profile = profile;
        }
        if let Some(scenario) = self.scenario {
            next.scenario = scenario;
        }
        if let Some(ms) = self.tick_interval_ms {
            next.tick_interval_ms = ms;
        }
        if let Some(factor) = self.time_acceleration {
            next.time_acceleration = factor;
        }
        next
    }
}

/// Simulation loop lifecycle. `Stopped` is terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Running,
    Paused,
    Stopped,
}

/// One battery's configuration and physical state.
#[derive(Debug, Clone)]
pub struct SimulatedBattery {
    config: BatteryConfig,
    model: DegradationModel,
    state: PhysicalState,
    /// Wall clock at creation; sample timestamps are offset from it
    epoch: DateTime<Utc>,
    sequence: u64,
}

impl SimulatedBattery {
    pub fn new(
        config: BatteryConfig,
        env: &dyn Environment,
        max_substep: Duration,
        epoch: DateTime<Utc>,
    ) -> Self {
        let model = DegradationModel::for_battery(&config, max_substep);
        let state = model.initial_state(&config, env);
        Self {
            config,
            model,
            state,
            epoch,
            sequence: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &BatteryConfig {
        &self.config
    }

    pub fn state(&self) -> &PhysicalState {
        &self.state
    }

    /// Swap in a new configuration. Physical state is kept; only the tick
    /// parameters, profile and scenario may differ.
    pub fn set_config(&mut self, config: BatteryConfig) {
        self.config = config;
    }

    /// State one tick of simulated time ahead, without applying it.
    pub fn step(
        &self,
        profile: &ProfileParams,
        env: &dyn Environment,
    ) -> Result<PhysicalState, ModelInputError> {
        self.model
            .advance(&self.state, profile, env, self.config.sim_step())
    }

    /// Apply a state produced by [`step`](Self::step).
    pub fn commit(&mut self, state: PhysicalState) {
        self.state = state;
    }

    /// Advance by one tick of simulated time. On error the state is unchanged.
    pub fn advance(
        &mut self,
        profile: &ProfileParams,
        env: &dyn Environment,
    ) -> Result<(), ModelInputError> {
        let next = self.step(profile, env)?;
        self.commit(next);
        Ok(())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        let micros = (self.state.elapsed_s * 1e6).round() as i64;
        self.epoch + chrono::Duration::microseconds(micros)
    }

    /// Build the next telemetry sample from the current state.
    pub fn next_sample(&mut self, profile: &ProfileParams) -> TelemetrySample {
        self.sequence += 1;
        let s = &self.state;
        let rated_ah = self.config.capacity_ah * s.soh;
        let c_rate = if rated_ah > 0.0 { s.current_a / rated_ah } else { 0.0 };
        TelemetrySample {
            battery_id: self.config.id.clone(),
            sequence: self.sequence,
            timestamp: self.timestamp(),
            temperature_c: s.temperature_c,
            voltage_v: s.voltage_v,
            current_a: s.current_a,
            soc: s.soc,
            soh: s.soh,
            cycle_count: s.cycle_count,
            elapsed_s: s.elapsed_s,
            internal_resistance_mohm: s.internal_resistance_mohm,
            ambient_temp_c: s.ambient_temp_c,
            humidity: s.humidity,
            fade_rate_per_s: s.fade_rate_per_s,
            rul_days: estimate_rul_days(s, profile),
            mode: OperatingMode::classify(c_rate, s.soc),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::ScenarioEnvironment;

    fn config() -> BatteryConfig {
        BatteryConfig::new("B1", DegradationProfile::Healthy, EnvironmentalScenario::MildClimate)
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(config().check().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut c = config();
        c.id = String::new();
        assert!(c.check().is_err());

        let mut c = config();
        c.initial_soc = 1.5;
        assert!(c.check().is_err());

        let mut c = config();
        c.tick_interval_ms = 0;
        assert!(c.check().is_err());

        let mut c = config();
        c.capacity_ah = 0.0;
        assert!(c.check().is_err());

        let mut c = config();
        c.thermal = Some(BatteryThermalConfig {
            heat_transfer_coeff_w_per_k: 0.0,
            ..Default::default()
        });
        assert!(c.check().is_err());
    }

    #[test]
    fn test_seed_is_stable_per_id() {
        assert_eq!(config().effective_seed(), config().effective_seed());
        let other = BatteryConfig::new("B2", DegradationProfile::Healthy, EnvironmentalScenario::MildClimate);
        assert_ne!(config().effective_seed(), other.effective_seed());
        assert_eq!(config().with_seed(7).effective_seed(), 7);
    }

    #[test]
    fn test_ocv_is_monotonic_in_soc() {
        for chem in [Chemistry::Vrla, Chemistry::LiFePo4, Chemistry::Nmc] {
            assert!(chem.ocv_ratio(1.0) > chem.ocv_ratio(0.5));
            assert!(chem.ocv_ratio(0.5) > chem.ocv_ratio(0.0));
        }
        // 12 V VRLA block: ~11.8 V empty, ~12.75 V full
        assert!((12.0 * Chemistry::Vrla.ocv_ratio(0.0) - 11.8).abs() < 0.01);
        assert!((12.0 * Chemistry::Vrla.ocv_ratio(1.0) - 12.75).abs() < 0.01);
    }

    #[test]
    fn test_reconfig_keeps_unset_fields() {
        let base = config();
        let patch = BatteryReconfig {
            profile: Some(DegradationProfile::Failing),
            tick_interval_ms: Some(250),
            ..Default::default()
        };
        let next = patch.apply_to(&base);
        assert_eq!(next.profile, DegradationProfile::Failing);
        assert_eq!(next.tick_interval(), Duration::from_millis(250));
        assert_eq!(next.scenario, base.scenario);
        assert_eq!(next.id, base.id);
    }

    #[test]
    fn test_samples_have_increasing_sequence_and_timestamp() {
        let cfg = config();
        let env = ScenarioEnvironment::new(cfg.scenario, cfg.effective_seed());
        let mut battery = SimulatedBattery::new(cfg, &env, Duration::from_secs(5), Utc::now());
        let profile = ProfileParams::healthy();

        battery.advance(&profile, &env).unwrap();
        let first = battery.next_sample(&profile);
        battery.advance(&profile, &env).unwrap();
        let second = battery.next_sample(&profile);

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert!(second.timestamp > first.timestamp);
        assert_eq!(second.elapsed_s, 2.0);
    }

    #[test]
    fn test_step_leaves_state_until_commit() {
        let cfg = config();
        let env = ScenarioEnvironment::new(cfg.scenario, cfg.effective_seed());
        let mut battery = SimulatedBattery::new(cfg, &env, Duration::from_secs(5), Utc::now());
        let profile = ProfileParams::healthy();

        let next = battery.step(&profile, &env).unwrap();
        assert_eq!(battery.state().elapsed_s, 0.0);
        battery.commit(next);
        assert_eq!(battery.state().elapsed_s, 1.0);
    }

    #[test]
    fn test_sample_reports_operating_mode() {
        let cfg = config();
        let env = ScenarioEnvironment::new(cfg.scenario, cfg.effective_seed());
        let mut battery = SimulatedBattery::new(cfg, &env, Duration::from_secs(5), Utc::now());
        let profile = ProfileParams::healthy();

        let idle = battery.state().clone();
        battery.commit(PhysicalState {
            current_a: -40.0,
            soc: 0.6,
            ..idle.clone()
        });
        assert_eq!(battery.next_sample(&profile).mode, OperatingMode::Discharge);

        battery.commit(PhysicalState {
            current_a: 20.0,
            soc: 0.4,
            ..idle.clone()
        });
        assert_eq!(battery.next_sample(&profile).mode, OperatingMode::Boost);

        battery.commit(PhysicalState {
            current_a: 0.0,
            ..idle
        });
        assert_eq!(battery.next_sample(&profile).mode, OperatingMode::Float);
    }

    #[test]
    fn test_parses_chemistry_names() {
        let c: Chemistry = serde_json::from_str("\"lifepo4\"").unwrap();
        assert_eq!(c, Chemistry::LiFePo4);
        assert_eq!(Chemistry::LiFePo4.to_string(), "lifepo4");
    }
}
