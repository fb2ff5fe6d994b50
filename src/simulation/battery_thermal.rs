//! # Battery Thermal Model
//!
//! Lumped thermal-mass model for battery temperature dynamics.
//!
//! ## Physics Model
//!
//! dT/dt = (Q_gen - Q_loss) / (m * c_p)
//!
//! Where:
//! - T = battery temperature (°C)
//! - Q_gen = I² * R_internal (W)
//! - Q_loss = h * (T_battery - T_ambient) (W)
//! - m * c_p = thermal capacity (J/K)
//!
//! With heat generation and ambient held constant over a step the ODE has the
//! closed form
//!
//! T(t + Δt) = T_eq + (T(t) - T_eq) * exp(-Δt / τ),  τ = m * c_p / h
//!
//! which stays bounded for any Δt, so coarse ticks never overshoot the
//! equilibrium temperature the way a forward Euler step would.

use serde::{Deserialize, Serialize};

use crate::domain::Chemistry;

/// Battery thermal model configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryThermalConfig {
    /// Battery thermal mass (kg)
    pub thermal_mass_kg: f64,

    /// Specific heat capacity (J/kg·K)
    pub specific_heat_j_per_kg_k: f64,

    /// Heat transfer coefficient to ambient (W/K), enclosure and cooling lumped together
    pub heat_transfer_coeff_w_per_k: f64,
}

impl Default for BatteryThermalConfig {
    fn default() -> Self {
        Self::for_chemistry(Chemistry::Vrla)
    }
}

impl BatteryThermalConfig {
    /// Typical 12 V / 100 Ah block of the given chemistry in a ventilated rack
    pub fn for_chemistry(chemistry: Chemistry) -> Self {
        match chemistry {
            Chemistry::Vrla => Self {
                thermal_mass_kg: 30.0,
                specific_heat_j_per_kg_k: 900.0,
                heat_transfer_coeff_w_per_k: 10.0,
            },
            Chemistry::LiFePo4 => Self {
                thermal_mass_kg: 12.0,
                specific_heat_j_per_kg_k: 1100.0,
                heat_transfer_coeff_w_per_k: 8.0,
            },
            Chemistry::Nmc => Self {
                thermal_mass_kg: 9.0,
                specific_heat_j_per_kg_k: 1000.0,
                heat_transfer_coeff_w_per_k: 8.0,
            },
        }
    }

    /// Thermal time constant τ = m * c_p / h (seconds)
    pub fn time_constant_s(&self) -> f64 {
        self.thermal_mass_kg * self.specific_heat_j_per_kg_k / self.heat_transfer_coeff_w_per_k
    }

    /// Equilibrium temperature for a constant heat input
    pub fn equilibrium_temp_c(&self, ambient_c: f64, heat_w: f64) -> f64 {
        ambient_c + heat_w / self.heat_transfer_coeff_w_per_k
    }

    /// Advance battery temperature by `dt_s` seconds with constant ambient and heat input.
    pub fn step_temperature(&self, temp_c: f64, ambient_c: f64, heat_w: f64, dt_s: f64) -> f64 {
        if dt_s <= 0.0 {
            return temp_c;
        }
        let t_eq = self.equilibrium_temp_c(ambient_c, heat_w);
        let decay = (-dt_s / self.time_constant_s()).exp();
        t_eq + (temp_c - t_eq) * decay
    }

    /// Sanity check used by config validation: all coefficients strictly positive and finite.
    pub fn is_valid(&self) -> bool {
        [
            self.thermal_mass_kg,
            self.specific_heat_j_per_kg_k,
            self.heat_transfer_coeff_w_per_k,
        ]
        .iter()
        .all(|v| v.is_finite() && *v > 0.0)
    }
}

/// Internal resistance multiplier relative to 25 °C.
///
/// Resistance rises about 1 % per degree below 25 °C and falls the same rate
/// above it, bounded to [0.5, 2.0].
pub fn resistance_temperature_factor(temp_c: f64) -> f64 {
    (1.0 + (25.0 - temp_c) * 0.01).clamp(0.5, 2.0)
}
