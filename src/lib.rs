//! Battery telemetry simulator.
//!
//! Runs one degradation simulation per battery, each on its own tokio task,
//! and fans the resulting telemetry and alert events out to live subscribers.
//! [`controller::SimulationManager`] is the entry point.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod controller;
pub mod domain;
pub mod persistence;
pub mod simulation;
pub mod telemetry;

pub use broadcast::{BroadcastHub, Subscription};
pub use controller::{ControlError, SimulationManager};
pub use domain::{AlertEvent, BatteryConfig, LifecycleState, SimEvent, TelemetrySample};
pub use simulation::{DegradationProfile, EnvironmentalScenario};
