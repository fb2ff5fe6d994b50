//! # Environmental Scenarios
//!
//! Named, deterministic functions of elapsed simulated time that drive a
//! battery: ambient temperature, the charge/discharge current pattern (as a
//! signed C-rate, positive = charging) and relative humidity.
//!
//! Noise is seeded value noise: the same `(scenario, seed, elapsed)` always
//! yields the same sample, so a simulation can be replayed exactly.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

const DAY_S: f64 = 86_400.0;

/// Conditions seen by a battery at one instant of simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSample {
    /// Ambient temperature (°C)
    pub ambient_temp_c: f64,
    /// Requested current as a C-rate, positive = charge, negative = discharge
    pub c_rate: f64,
    /// Relative humidity (0.0-1.0)
    pub humidity: f64,
}

/// Anything that can supply ambient conditions as a function of simulated time.
pub trait Environment: Send + Sync + std::fmt::Debug {
    fn sample(&self, elapsed_s: f64) -> EnvironmentSample;

    /// Short human-readable name shown in status reports.
    fn label(&self) -> String;
}

/// Closed set of built-in scenarios.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EnvironmentalScenario {
    MildClimate,
    NormalOperation,
    HighTemperature,
    PowerOutage,
    HvacFailure,
    ThermalRunaway,
    HighStress,
    ColdClimate,
}

/// Catalogue entry describing a scenario to operators.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioInfo {
    pub scenario: EnvironmentalScenario,
    pub name: &'static str,
    pub description: &'static str,
    pub ambient_range_c: (f64, f64),
    pub current_pattern: &'static str,
}

impl EnvironmentalScenario {
    pub fn info(self) -> ScenarioInfo {
        use EnvironmentalScenario::*;
        let (name, description, ambient_range_c, current_pattern) = match self {
            MildClimate => (
                "Mild Climate",
                "Temperate site with gentle daily swing and light cycling",
                (19.0, 25.0),
                "±0.2C sinusoidal, 4 h period",
            ),
            NormalOperation => (
                "Normal Operation",
                "Standard float charging in a conditioned room",
                (24.0, 26.0),
                "+0.01C float trickle",
            ),
            HighTemperature => (
                "High Temperature",
                "Elevated ambient temperature, hot season or degraded HVAC",
                (43.0, 47.0),
                "+0.01C float trickle",
            ),
            PowerOutage => (
                "Power Outage",
                "Utility failure: 2 h discharge under load, then recharge",
                (25.0, 30.0),
                "-0.3C for 2 h, +0.15C for 4 h",
            ),
            HvacFailure => (
                "HVAC Failure",
                "Air conditioning fails and the room heats up over two hours",
                (25.0, 48.0),
                "+0.01C float trickle",
            ),
            ThermalRunaway => (
                "Thermal Runaway",
                "Local hotspot around a battery discharging hard",
                (50.0, 70.0),
                "-1.0C sustained discharge",
            ),
            HighStress => (
                "High Stress",
                "Hot, humid site with aggressive charge/discharge cycling",
                (35.0, 45.0),
                "-3.2C for 15 min, +1.92C for 25 min",
            ),
            ColdClimate => (
                "Cold Climate",
                "Unheated outdoor enclosure in winter",
                (-14.0, -6.0),
                "±0.3C sinusoidal, 4 h period",
            ),
        };
        ScenarioInfo {
            scenario: self,
            name,
            description,
            ambient_range_c,
            current_pattern,
        }
    }

    pub fn catalogue() -> Vec<ScenarioInfo> {
        Self::iter().map(Self::info).collect()
    }

    fn sample_with(self, seed: u64, t: f64) -> EnvironmentSample {
        use EnvironmentalScenario::*;
        let t = t.max(0.0);
        let n_temp = value_noise(seed, 1, t, 600.0);
        let n_hum = value_noise(seed, 2, t, 1_800.0);
        let daily = (TAU * t / DAY_S).sin();
        let ramp = |span_s: f64| (t / span_s).min(1.0);

        let (ambient_temp_c, c_rate, humidity) = match self {
            MildClimate => (
                22.0 + 3.0 * daily + 0.5 * n_temp,
                0.2 * (TAU * t / 14_400.0).sin(),
                0.50 + 0.05 * n_hum,
            ),
            NormalOperation => (25.0 + daily + 0.3 * n_temp, 0.01, 0.55 + 0.05 * n_hum),
            HighTemperature => (45.0 + 2.0 * daily + 0.5 * n_temp, 0.01, 0.40 + 0.05 * n_hum),
            PowerOutage => {
                let outage = t % 21_600.0 < 7_200.0;
                if outage {
                    (30.0 + 0.5 * n_temp, -0.3, 0.60 + 0.05 * n_hum)
                } else {
                    (25.0 + 0.3 * n_temp, 0.15, 0.55 + 0.05 * n_hum)
                }
            }
            HvacFailure => (
                25.0 + 23.0 * ramp(7_200.0) + 0.5 * n_temp,
                0.01,
                0.50 + 0.30 * ramp(7_200.0) + 0.03 * n_hum,
            ),
            ThermalRunaway => (50.0 + 20.0 * ramp(1_800.0) + n_temp, -1.0, 0.30 + 0.05 * n_hum),
            HighStress => {
                let c_rate = if t % 2_400.0 < 900.0 { -3.2 } else { 1.92 };
                (40.0 + 5.0 * daily + 0.5 * n_temp, c_rate, 0.85 + 0.05 * n_hum)
            }
            ColdClimate => (
                -10.0 + 4.0 * daily + 0.5 * n_temp,
                0.3 * (TAU * t / 14_400.0).sin(),
                0.70 + 0.05 * n_hum,
            ),
        };

        EnvironmentSample {
            ambient_temp_c,
            c_rate,
            humidity: humidity.clamp(0.0, 1.0),
        }
    }
}

/// A built-in scenario bound to a seed, optionally pinned to a fixed ambient temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenarioEnvironment {
    pub scenario: EnvironmentalScenario,
    pub seed: u64,
    pub ambient_override_c: Option<f64>,
}

impl ScenarioEnvironment {
    pub fn new(scenario: EnvironmentalScenario, seed: u64) -> Self {
        Self {
            scenario,
            seed,
            ambient_override_c: None,
        }
    }

    pub fn with_ambient_override(mut self, ambient_c: Option<f64>) -> Self {
        self.ambient_override_c = ambient_c;
        self
    }
}

impl Environment for ScenarioEnvironment {
    fn sample(&self, elapsed_s: f64) -> EnvironmentSample {
        let mut sample = self.scenario.sample_with(self.seed, elapsed_s);
        if let Some(ambient) = self.ambient_override_c {
            sample.ambient_temp_c = ambient;
        }
        sample
    }

    fn label(&self) -> String {
        match self.ambient_override_c {
            Some(ambient) => format!("{}@{ambient:.1}C", self.scenario),
            None => self.scenario.to_string(),
        }
    }
}

/// Smooth noise in [-1, 1]: seeded gaussian lattice values every `period_s`,
/// blended with a smoothstep.
fn value_noise(seed: u64, channel: u64, t: f64, period_s: f64) -> f64 {
    let x = t / period_s;
    let cell = x.floor();
    let frac = x - cell;
    let index = cell as u64;
    let a = lattice(seed, channel, index);
    let b = lattice(seed, channel, index.wrapping_add(1));
    let s = frac * frac * (3.0 - 2.0 * frac);
    a + (b - a) * s
}

fn lattice(seed: u64, channel: u64, index: u64) -> f64 {
    let key = seed
        ^ channel.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ index.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    let mut rng = StdRng::seed_from_u64(key);
    let n: f64 = rng.sample(StandardNormal);
    n.clamp(-3.0, 3.0) / 3.0
}
