//! # Degradation Model
//!
//! Pure physics step for one battery: given the current physical state, a
//! degradation profile and an environment, compute the state after `dt`.
//!
//! ## Aging
//!
//! Capacity fade follows an Arrhenius-form rate
//!
//! rate = A * exp(-Ea / (R * T)) * stress,   stress = 1 + k_s * C²
//!
//! where `A`, `Ea` and `k_s` come from the [`ProfileParams`] of the assigned
//! profile, `T` is the battery temperature in kelvin and `C` the C-rate.
//! Internal resistance grows with accumulated fade.
//!
//! ## Integration
//!
//! `dt` is split into sub-steps no longer than `max_substep`. Inside each
//! sub-step the environment is sampled once and every quantity is integrated
//! in closed form (exponential thermal relaxation, linear fade and charge),
//! so results barely depend on tick length.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;

use super::battery_thermal::{resistance_temperature_factor, BatteryThermalConfig};
use super::environment::{Environment, EnvironmentSample};
use crate::domain::{BatteryConfig, Chemistry};

pub const GAS_CONSTANT_J_PER_MOL_K: f64 = 8.314_462_618;
pub const KELVIN_OFFSET: f64 = 273.15;
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// SoC at or below which a discharge half-cycle is armed.
pub const CYCLE_ARM_SOC: f64 = 0.25;
/// SoC at or above which an armed cycle is counted.
pub const CYCLE_COMPLETE_SOC: f64 = 0.75;
/// Larger C-rates are treated as corrupt input.
pub const MAX_ABS_C_RATE: f64 = 20.0;
/// Upper bound on integration sub-steps per tick. Very long ticks get
/// proportionally longer sub-steps instead of more of them.
pub const MAX_SUBSTEPS: u64 = 2_000;

/// Named aging parameter sets
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DegradationProfile {
    Healthy,
    Accelerated,
    Failing,
}

/// Rate coefficients for one degradation profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileParams {
    /// Activation energy Ea (J/mol)
    pub activation_energy_j_per_mol: f64,
    /// Pre-exponential factor A (fraction of capacity per second)
    pub pre_exponential_per_s: f64,
    /// Weight of the squared C-rate in the stress multiplier
    pub stress_sensitivity: f64,
    /// Relative resistance growth per unit of capacity fade
    pub resistance_growth_factor: f64,
    /// SoH at which the battery counts as end-of-life
    pub end_of_life_soh: f64,
}

impl ProfileParams {
    /// ~2 %/yr fade at rest and 25 °C
    pub fn healthy() -> Self {
        Self {
            activation_energy_j_per_mol: 67_500.0,
            pre_exponential_per_s: 424.0,
            stress_sensitivity: 1.0,
            resistance_growth_factor: 2.5,
            end_of_life_soh: 0.80,
        }
    }

    /// ~8 %/yr fade at rest and 25 °C
    pub fn accelerated() -> Self {
        Self {
            activation_energy_j_per_mol: 62_000.0,
            pre_exponential_per_s: 184.5,
            stress_sensitivity: 1.5,
            resistance_growth_factor: 1.875,
            end_of_life_soh: 0.80,
        }
    }

    /// ~25 %/yr fade at rest and 25 °C
    pub fn failing() -> Self {
        Self {
            activation_energy_j_per_mol: 55_000.0,
            pre_exponential_per_s: 34.2,
            stress_sensitivity: 2.0,
            resistance_growth_factor: 1.6,
            end_of_life_soh: 0.85,
        }
    }

    pub fn stress_multiplier(&self, c_rate: f64) -> f64 {
        1.0 + self.stress_sensitivity * c_rate * c_rate
    }

    /// Fade rate (fraction of rated capacity per second)
    pub fn fade_rate_per_s(&self, temp_kelvin: f64, c_rate: f64) -> f64 {
        let arrhenius =
            (-self.activation_energy_j_per_mol / (GAS_CONSTANT_J_PER_MOL_K * temp_kelvin)).exp();
        self.pre_exponential_per_s * arrhenius * self.stress_multiplier(c_rate)
    }
}

/// Parameters for every profile; overridable from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileTable {
    pub healthy: ProfileParams,
    pub accelerated: ProfileParams,
    pub failing: ProfileParams,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self {
            healthy: ProfileParams::healthy(),
            accelerated: ProfileParams::accelerated(),
            failing: ProfileParams::failing(),
        }
    }
}

impl ProfileTable {
    pub fn get(&self, profile: DegradationProfile) -> &ProfileParams {
        match profile {
            DegradationProfile::Healthy => &self.healthy,
            DegradationProfile::Accelerated => &self.accelerated,
            DegradationProfile::Failing => &self.failing,
        }
    }
}

/// Invalid physical input to a model step. The caller skips the tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelInputError {
    #[error("non-positive absolute temperature for {source_name}: {kelvin:.2} K")]
    NonPositiveTemperature { source_name: &'static str, kelvin: f64 },
    #[error("non-finite value for {field}: {value}")]
    NonFinite { field: &'static str, value: f64 },
    #[error("humidity out of range: {0}")]
    HumidityOutOfRange(f64),
    #[error("C-rate magnitude {0} exceeds {max}", max = MAX_ABS_C_RATE)]
    CRateOutOfRange(f64),
    #[error("time step must be positive and finite, got {0:?}s")]
    InvalidTimeStep(f64),
}

/// Complete physical state of one battery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalState {
    pub temperature_c: f64,
    pub voltage_v: f64,
    /// Positive = charging
    pub current_a: f64,
    pub soc: f64,
    pub soh: f64,
    pub cycle_count: u64,
    pub elapsed_s: f64,
    pub internal_resistance_mohm: f64,
    /// Mean fade rate over the last step (fraction per second)
    pub fade_rate_per_s: f64,
    /// Ambient conditions at the end of the last step
    pub ambient_temp_c: f64,
    pub humidity: f64,
    /// Set once SoC dips below the arm threshold; cleared when a cycle is counted
    pub cycle_armed: bool,
}

/// Battery-specific constants the model needs besides state and profile.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradationModel {
    pub chemistry: Chemistry,
    pub capacity_ah: f64,
    pub nominal_voltage_v: f64,
    pub thermal: BatteryThermalConfig,
    pub max_substep: Duration,
}

impl DegradationModel {
    pub fn for_battery(config: &BatteryConfig, max_substep: Duration) -> Self {
        Self {
            chemistry: config.chemistry,
            capacity_ah: config.capacity_ah,
            nominal_voltage_v: config.nominal_voltage_v,
            thermal: config.thermal_config(),
            max_substep,
        }
    }

    /// State at t = 0. Temperature defaults to the environment's ambient.
    pub fn initial_state(&self, config: &BatteryConfig, env: &dyn Environment) -> PhysicalState {
        let ambient = env.sample(0.0);
        let temperature_c = config.initial_temperature_c.unwrap_or(ambient.ambient_temp_c);
        let soc = config.initial_soc.clamp(0.0, 1.0);
        let soh = config.initial_soh.clamp(0.0, 1.0);
        PhysicalState {
            temperature_c,
            voltage_v: self.terminal_voltage(soc, soh, 0.0, temperature_c, config.initial_resistance_mohm),
            current_a: 0.0,
            soc,
            soh,
            cycle_count: 0,
            elapsed_s: 0.0,
            internal_resistance_mohm: config.initial_resistance_mohm,
            fade_rate_per_s: 0.0,
            ambient_temp_c: ambient.ambient_temp_c,
            humidity: ambient.humidity,
            cycle_armed: soc <= CYCLE_ARM_SOC,
        }
    }

    /// Advance `state` by `dt` of simulated time.
    pub fn advance(
        &self,
        state: &PhysicalState,
        profile: &ProfileParams,
        env: &dyn Environment,
        dt: Duration,
    ) -> Result<PhysicalState, ModelInputError> {
        let dt_s = dt.as_secs_f64();
        if !dt_s.is_finite() || dt_s <= 0.0 {
            return Err(ModelInputError::InvalidTimeStep(dt_s));
        }
        validate_state(state)?;

        let max_h = self.max_substep.as_secs_f64().max(1e-3);
        let steps = ((dt_s / max_h).ceil().max(1.0) as u64).min(MAX_SUBSTEPS);
        let h = dt_s / steps as f64;

        let mut next = state.clone();
        let mut total_fade = 0.0;

        for k in 0..steps {
            let t = state.elapsed_s + k as f64 * h;
            let sample = env.sample(t);
            validate_environment(&sample)?;

            let temp_k = next.temperature_c + KELVIN_OFFSET;
            if temp_k <= 0.0 {
                return Err(ModelInputError::NonPositiveTemperature {
                    source_name: "battery",
                    kelvin: temp_k,
                });
            }

            // A full battery cannot take charge and an empty one cannot deliver
            let c_rate = if (next.soc >= 1.0 && sample.c_rate > 0.0)
                || (next.soc <= 0.0 && sample.c_rate < 0.0)
            {
                0.0
            } else {
                sample.c_rate
            };
            let current_a = c_rate * self.capacity_ah * next.soh;
            let r_eff_ohm = next.internal_resistance_mohm
                * 1e-3
                * resistance_temperature_factor(next.temperature_c);
            let heat_w = current_a * current_a * r_eff_ohm;

            // Cannot lose more capacity than is left
            let fade = (profile.fade_rate_per_s(temp_k, c_rate) * h).min(next.soh);
            total_fade += fade;

            next.temperature_c =
                self.thermal
                    .step_temperature(next.temperature_c, sample.ambient_temp_c, heat_w, h);
            next.soh = (next.soh - fade).clamp(0.0, 1.0);
            next.internal_resistance_mohm *= (profile.resistance_growth_factor * fade).exp();
            next.soc = (next.soc + c_rate * h / 3_600.0).clamp(0.0, 1.0);
            next.current_a = current_a;
            next.ambient_temp_c = sample.ambient_temp_c;
            next.humidity = sample.humidity;

            if next.soc <= CYCLE_ARM_SOC {
                next.cycle_armed = true;
            } else if next.cycle_armed && next.soc >= CYCLE_COMPLETE_SOC {
                next.cycle_armed = false;
                next.cycle_count += 1;
            }
        }

        next.elapsed_s = state.elapsed_s + dt_s;
        next.fade_rate_per_s = total_fade / dt_s;
        next.voltage_v = self.terminal_voltage(
            next.soc,
            next.soh,
            next.current_a,
            next.temperature_c,
            next.internal_resistance_mohm,
        );
        Ok(next)
    }

    /// Terminal voltage: OCV(SoC) scaled by SoH, plus I * R (charging raises it).
    pub fn terminal_voltage(
        &self,
        soc: f64,
        soh: f64,
        current_a: f64,
        temp_c: f64,
        resistance_mohm: f64,
    ) -> f64 {
        let ocv = self.nominal_voltage_v * self.chemistry.ocv_ratio(soc) * (0.95 + 0.05 * soh);
        let r_eff_ohm = resistance_mohm * 1e-3 * resistance_temperature_factor(temp_c);
        ocv + current_a * r_eff_ohm
    }
}

/// Days until SoH reaches the profile's end-of-life threshold at the last
/// observed fade rate. `None` when the battery is not degrading.
pub fn estimate_rul_days(state: &PhysicalState, profile: &ProfileParams) -> Option<f64> {
    if state.soh <= profile.end_of_life_soh {
        return Some(0.0);
    }
    if state.fade_rate_per_s <= 0.0 || !state.fade_rate_per_s.is_finite() {
        return None;
    }
    Some((state.soh - profile.end_of_life_soh) / state.fade_rate_per_s / SECONDS_PER_DAY)
}

fn validate_state(state: &PhysicalState) -> Result<(), ModelInputError> {
    for (field, value) in [
        ("temperature_c", state.temperature_c),
        ("soc", state.soc),
        ("soh", state.soh),
        ("elapsed_s", state.elapsed_s),
        ("internal_resistance_mohm", state.internal_resistance_mohm),
    ] {
        if !value.is_finite() {
            return Err(ModelInputError::NonFinite { field, value });
        }
    }
    Ok(())
}

fn validate_environment(sample: &EnvironmentSample) -> Result<(), ModelInputError> {
    for (field, value) in [
        ("ambient_temp_c", sample.ambient_temp_c),
        ("c_rate", sample.c_rate),
        ("humidity", sample.humidity),
    ] {
        if !value.is_finite() {
            return Err(ModelInputError::NonFinite { field, value });
        }
    }
    let kelvin = sample.ambient_temp_c + KELVIN_OFFSET;
    if kelvin <= 0.0 {
        return Err(ModelInputError::NonPositiveTemperature {
            source_name: "ambient",
            kelvin,
        });
    }
    if !(0.0..=1.0).contains(&sample.humidity) {
        return Err(ModelInputError::HumidityOutOfRange(sample.humidity));
    }
    if sample.c_rate.abs() > MAX_ABS_C_RATE {
        return Err(ModelInputError::CRateOutOfRange(sample.c_rate));
    }
    Ok(())
}
