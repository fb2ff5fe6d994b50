//! # Alert Rules
//!
//! Threshold rules evaluated against every telemetry sample, plus a per-battery
//! tracker that turns level conditions into edge-triggered alerts:
//! - an alert fires when a metric's severity rises (none → warning → critical)
//! - an `info` alert fires once when an active metric returns to normal
//! - a condition that persists across ticks is not repeated

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::domain::{AlertEvent, AlertMetric, Severity, TelemetrySample};

/// Alert thresholds, loaded from `[alerts]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Battery temperature limits (°C)
    pub temperature_warning_c: f64,
    pub temperature_critical_c: f64,

    /// |current| / nameplate capacity
    pub c_rate_warning: f64,
    pub c_rate_critical: f64,

    /// Low state of charge (0.0-1.0)
    pub soc_low_info: f64,
    pub soc_low_warning: f64,

    /// Warn when SoH is within this margin above the profile's end-of-life SoH
    pub soh_warning_margin: f64,

    /// Remaining useful life (days)
    pub rul_warning_days: f64,
    pub rul_critical_days: f64,

    /// Terminal voltage as a fraction of nominal
    pub voltage_low_warning_ratio: f64,
    pub voltage_low_critical_ratio: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            temperature_warning_c: 45.0,
            temperature_critical_c: 55.0,
            c_rate_warning: 1.0,
            c_rate_critical: 2.0,
            soc_low_info: 0.15,
            soc_low_warning: 0.05,
            soh_warning_margin: 0.10,
            rul_warning_days: 365.0,
            rul_critical_days: 30.0,
            voltage_low_warning_ratio: 0.95,
            voltage_low_critical_ratio: 0.90,
        }
    }
}

/// Per-battery constants the rules need besides the sample itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertContext {
    pub capacity_ah: f64,
    pub nominal_voltage_v: f64,
    pub end_of_life_soh: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct Condition {
    severity: Severity,
    value: f64,
    threshold: f64,
    message: String,
}

/// Level above (or below, when `rising` is false) which a value is abnormal.
fn classify(value: f64, rising: bool, levels: &[(Severity, f64)]) -> Option<(Severity, f64)> {
    levels
        .iter()
        .filter(|(_, limit)| if rising { value > *limit } else { value < *limit })
        .max_by_key(|(severity, _)| *severity)
        .copied()
}

/// Evaluate every rule against one sample. Only abnormal metrics are returned.
fn conditions(
    sample: &TelemetrySample,
    ctx: &AlertContext,
    t: &AlertThresholds,
) -> Vec<(AlertMetric, Condition)> {
    let mut out = Vec::new();

    if let Some((severity, threshold)) = classify(
        sample.temperature_c,
        true,
        &[
            (Severity::Warning, t.temperature_warning_c),
            (Severity::Critical, t.temperature_critical_c),
        ],
    ) {
        out.push((
            AlertMetric::Temperature,
            Condition {
                severity,
                value: sample.temperature_c,
                threshold,
                message: format!(
                    "Battery temperature {:.1}°C exceeds {} limit {:.1}°C",
                    sample.temperature_c, severity, threshold
                ),
            },
        ));
    }

    let c_rate = if ctx.capacity_ah > 0.0 {
        sample.current_a.abs() / ctx.capacity_ah
    } else {
        0.0
    };
    if let Some((severity, threshold)) = classify(
        c_rate,
        true,
        &[
            (Severity::Warning, t.c_rate_warning),
            (Severity::Critical, t.c_rate_critical),
        ],
    ) {
        out.push((
            AlertMetric::Current,
            Condition {
                severity,
                value: c_rate,
                threshold,
                message: format!(
                    "Current {:.1}A ({:.2}C) exceeds {} limit {:.2}C",
                    sample.current_a, c_rate, severity, threshold
                ),
            },
        ));
    }

    if let Some((severity, threshold)) = classify(
        sample.soc,
        false,
        &[
            (Severity::Info, t.soc_low_info),
            (Severity::Warning, t.soc_low_warning),
        ],
    ) {
        out.push((
            AlertMetric::StateOfCharge,
            Condition {
                severity,
                value: sample.soc,
                threshold,
                message: format!(
                    "State of charge {:.1}% below {:.1}%",
                    sample.soc * 100.0,
                    threshold * 100.0
                ),
            },
        ));
    }

    if let Some((severity, threshold)) = classify(
        sample.soh,
        false,
        &[
            (Severity::Warning, ctx.end_of_life_soh + t.soh_warning_margin),
            (Severity::Critical, ctx.end_of_life_soh),
        ],
    ) {
        out.push((
            AlertMetric::StateOfHealth,
            Condition {
                severity,
                value: sample.soh,
                threshold,
                message: format!(
                    "State of health {:.1}% below {:.1}%",
                    sample.soh * 100.0,
                    threshold * 100.0
                ),
            },
        ));
    }

    if let Some(rul) = sample.rul_days {
        if let Some((severity, threshold)) = classify(
            rul,
            false,
            &[
                (Severity::Warning, t.rul_warning_days),
                (Severity::Critical, t.rul_critical_days),
            ],
        ) {
            out.push((
                AlertMetric::RemainingUsefulLife,
                Condition {
                    severity,
                    value: rul,
                    threshold,
                    message: format!(
                        "Estimated remaining useful life {rul:.0} days below {threshold:.0} days"
                    ),
                },
            ));
        }
    }

    if ctx.nominal_voltage_v > 0.0 {
        let ratio = sample.voltage_v / ctx.nominal_voltage_v;
        if let Some((severity, threshold)) = classify(
            ratio,
            false,
            &[
                (Severity::Warning, t.voltage_low_warning_ratio),
                (Severity::Critical, t.voltage_low_critical_ratio),
            ],
        ) {
            out.push((
                AlertMetric::Voltage,
                Condition {
                    severity,
                    value: sample.voltage_v,
                    threshold: threshold * ctx.nominal_voltage_v,
                    message: format!(
                        "Terminal voltage {:.2}V below {:.2}V",
                        sample.voltage_v,
                        threshold * ctx.nominal_voltage_v
                    ),
                },
            ));
        }
    }

    out
}

/// Remembers the active severity of each metric for one battery.
/// Ordered by metric so recovery alerts come out in a stable order.
#[derive(Debug, Default, Clone)]
pub struct AlertTracker {
    active: BTreeMap<AlertMetric, Severity>,
}

impl AlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Severity currently active for `metric`, if any.
    pub fn active(&self, metric: AlertMetric) -> Option<Severity> {
        self.active.get(&metric).copied()
    }

    /// Compare one sample with the thresholds and return the alerts that
    /// changed state since the previous sample.
    pub fn evaluate(
        &mut self,
        sample: &TelemetrySample,
        ctx: &AlertContext,
        thresholds: &AlertThresholds,
    ) -> Vec<AlertEvent> {
        let current = conditions(sample, ctx, thresholds);
        let mut events = Vec::new();

        for (metric, cond) in &current {
            let previous = self.active.insert(*metric, cond.severity);
            if !matches!(previous, Some(p) if p >= cond.severity) {
                events.push(AlertEvent::new(
                    &sample.battery_id,
                    sample.timestamp,
                    cond.severity,
                    *metric,
                    cond.value,
                    cond.threshold,
                    cond.message.clone(),
                ));
            }
        }

        let recovered: Vec<AlertMetric> = self
            .active
            .keys()
            .filter(|m| !current.iter().any(|(c, _)| c == *m))
            .copied()
            .collect();
        for metric in recovered {
            self.active.remove(&metric);
            debug!(battery_id = %sample.battery_id, %metric, "alert condition cleared");
            events.push(AlertEvent::new(
                &sample.battery_id,
                sample.timestamp,
                Severity::Info,
                metric,
                recovered_value(sample, metric, ctx),
                0.0,
                format!("{metric} back to normal"),
            ));
        }

        events
    }
}

fn recovered_value(sample: &TelemetrySample, metric: AlertMetric, ctx: &AlertContext) -> f64 {
    match metric {
        AlertMetric::Temperature => sample.temperature_c,
        AlertMetric::Current if ctx.capacity_ah > 0.0 => sample.current_a.abs() / ctx.capacity_ah,
        AlertMetric::StateOfCharge => sample.soc,
        AlertMetric::StateOfHealth => sample.soh,
        AlertMetric::RemainingUsefulLife => sample.rul_days.unwrap_or(0.0),
        AlertMetric::Voltage => sample.voltage_v,
        _ => 0.0,
    }
}
