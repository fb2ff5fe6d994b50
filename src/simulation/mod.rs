//! Physics for the simulated batteries: environment drivers, the lumped
//! thermal model and the Arrhenius degradation step.

pub mod battery_thermal;
pub mod degradation;
pub mod environment;

pub use battery_thermal::{resistance_temperature_factor, BatteryThermalConfig};
pub use degradation::{
    estimate_rul_days, DegradationModel, DegradationProfile, ModelInputError, PhysicalState,
    ProfileParams, ProfileTable,
};
pub use environment::{
    Environment, EnvironmentSample, EnvironmentalScenario, ScenarioEnvironment, ScenarioInfo,
};
