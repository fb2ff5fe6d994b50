use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Immutable snapshot of one battery after a successful tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub battery_id: String,
    /// Per-battery counter, starts at 1
    pub sequence: u64,
    /// Battery epoch plus elapsed simulated time
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub soc: f64,
    pub soh: f64,
    pub cycle_count: u64,
    pub elapsed_s: f64,
    pub internal_resistance_mohm: f64,
    pub ambient_temp_c: f64,
    pub humidity: f64,
    /// Mean capacity fade over the last tick (fraction per second)
    pub fade_rate_per_s: f64,
    /// Remaining useful life; absent while the battery is not degrading
    pub rul_days: Option<f64>,
    pub mode: OperatingMode,
}

/// |C-rate| at or below which the battery is considered to be floating
pub const FLOAT_C_RATE: f64 = 0.01;
/// SoC from which sustained charging counts as equalization
pub const EQUALIZE_SOC: f64 = 0.95;

/// Charger/load regime the battery is in during a tick.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperatingMode {
    /// Idle or trickle charge
    Float,
    Discharge,
    /// Bulk charge of a partly empty battery
    Boost,
    /// Charging a battery that is already near full
    Equalize,
}

impl OperatingMode {
    /// Classify from the signed C-rate (positive = charging) and SoC.
    pub fn classify(c_rate: f64, soc: f64) -> Self {
        if c_rate < -FLOAT_C_RATE {
            OperatingMode::Discharge
        } else if c_rate <= FLOAT_C_RATE {
            OperatingMode::Float
        } else if soc >= EQUALIZE_SOC {
            OperatingMode::Equalize
        } else {
            OperatingMode::Boost
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// What an alert is about
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AlertMetric {
    StateOfHealth,
    Temperature,
    Current,
    StateOfCharge,
    Voltage,
    RemainingUsefulLife,
    /// A tick was skipped because the model rejected its inputs
    ModelInput,
    /// The loop gave up after repeated failures
    SimulationFault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: Uuid,
    pub battery_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub metric: AlertMetric,
    pub message: String,
    /// Observed value that triggered the alert
    pub value: f64,
    /// Threshold it was compared against
    pub threshold: f64,
}

impl AlertEvent {
    pub fn new(
        battery_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        severity: Severity,
        metric: AlertMetric,
        value: f64,
        threshold: f64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_id: Uuid::new_v4(),
            battery_id: battery_id.into(),
            timestamp,
            severity,
            metric,
            message: message.into(),
            value,
            threshold,
        }
    }
}

/// Everything the hub fans out.
///
/// Serialized as `{"type": "telemetry", "data": {...}}` or
/// `{"type": "alert", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SimEvent {
    Telemetry(TelemetrySample),
    Alert(AlertEvent),
}

impl SimEvent {
    pub fn battery_id(&self) -> &str {
        match self {
            SimEvent::Telemetry(s) => &s.battery_id,
            SimEvent::Alert(a) => &a.battery_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SimEvent::Telemetry(s) => s.timestamp,
            SimEvent::Alert(a) => a.timestamp,
        }
    }

    pub fn as_telemetry(&self) -> Option<&TelemetrySample> {
        match self {
            SimEvent::Telemetry(s) => Some(s),
            SimEvent::Alert(_) => None,
        }
    }

    pub fn as_alert(&self) -> Option<&AlertEvent> {
        match self {
            SimEvent::Alert(a) => Some(a),
            SimEvent::Telemetry(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let alert = AlertEvent::new(
            "B1",
            Utc::now(),
            Severity::Critical,
            AlertMetric::Temperature,
            61.0,
            55.0,
            "too hot",
        );
        let json = serde_json::to_value(SimEvent::Alert(alert)).unwrap();
        assert_eq!(json["type"], "alert");
        assert_eq!(json["data"]["severity"], "critical");
        assert_eq!(json["data"]["metric"], "temperature");
        assert_eq!(json["data"]["battery_id"], "B1");
    }

    #[test]
    fn test_operating_mode_classification() {
        assert_eq!(OperatingMode::classify(-0.5, 0.6), OperatingMode::Discharge);
        assert_eq!(OperatingMode::classify(0.0, 0.6), OperatingMode::Float);
        assert_eq!(OperatingMode::classify(0.005, 0.2), OperatingMode::Float);
        assert_eq!(OperatingMode::classify(-0.005, 0.2), OperatingMode::Float);
        assert_eq!(OperatingMode::classify(0.3, 0.5), OperatingMode::Boost);
        assert_eq!(OperatingMode::classify(0.05, 0.97), OperatingMode::Equalize);
        assert_eq!(serde_json::to_value(OperatingMode::Equalize).unwrap(), "equalize");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
