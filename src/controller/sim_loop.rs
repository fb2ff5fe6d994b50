//! # Simulation Loop
//!
//! One tokio task per battery. The task sleeps until the next tick deadline,
//! advances the battery through the degradation model and publishes the
//! resulting sample and alerts.
//!
//! Lifecycle: `Created → Running ⇄ Paused → Stopped` (terminal).
//!
//! The degradation model runs on a snapshot taken under the loop's mutex and
//! is committed under the mutex again. Every control operation bumps a
//! revision; a result computed against an older revision, or one that finds
//! the loop no longer running, is discarded. Once `pause` or `stop` has
//! returned no further sample is published.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::alerts::{AlertContext, AlertThresholds, AlertTracker};
use super::error::{ControlError, PersistentFault};
use crate::broadcast::BroadcastHub;
use crate::domain::{
    AlertEvent, AlertMetric, BatteryConfig, BatteryReconfig, LifecycleState, Severity, SimEvent,
    SimulatedBattery, TelemetrySample,
};
use crate::persistence::SinkHandle;
use crate::simulation::{
    DegradationProfile, Environment, EnvironmentalScenario, ModelInputError, PhysicalState,
    ProfileParams, ProfileTable, ScenarioEnvironment,
};

/// Engine-wide pieces every loop shares.
pub(crate) struct LoopContext {
    pub hub: BroadcastHub,
    pub sink: RwLock<Option<SinkHandle>>,
    pub profiles: ProfileTable,
    pub thresholds: AlertThresholds,
    pub max_consecutive_failures: u32,
    pub max_substep: Duration,
}

impl LoopContext {
    fn emit(&self, event: SimEvent) {
        if let Some(sink) = self.sink.read().as_ref() {
            sink.offer(&event);
        }
        self.hub.publish(event);
    }
}

/// Point-in-time view of one loop.
#[derive(Debug, Clone, Serialize)]
pub struct BatteryStatus {
    pub id: String,
    pub lifecycle: LifecycleState,
    pub profile: DegradationProfile,
    /// Scenario from the battery's configuration
    pub scenario: EnvironmentalScenario,
    /// Environment actually driving the battery, including overrides
    pub environment: String,
    pub tick_interval_ms: u64,
    pub time_acceleration: f64,
    pub ticks: u64,
    pub consecutive_failures: u32,
    pub fault: Option<PersistentFault>,
    pub last_sample: Option<TelemetrySample>,
}

struct LoopInner {
    battery: SimulatedBattery,
    environment: Arc<dyn Environment>,
    /// Set by `apply_scenario`/`apply_environment`, cleared by `clear_scenario`
    environment_overridden: bool,
    lifecycle: LifecycleState,
    last_sample: Option<TelemetrySample>,
    fault: Option<PersistentFault>,
    consecutive_failures: u32,
    ticks: u64,
    alerts: AlertTracker,
    /// Bumped by every control operation that changes lifecycle, config or environment
    revision: u64,
}

/// Inputs of one tick, detached from the loop's mutex.
struct TickSnapshot {
    battery: SimulatedBattery,
    environment: Arc<dyn Environment>,
    profile: ProfileParams,
    revision: u64,
}

pub(crate) struct LoopShared {
    id: String,
    inner: Mutex<LoopInner>,
    wake: Notify,
    ctx: Arc<LoopContext>,
}

fn scenario_environment(config: &BatteryConfig, scenario: EnvironmentalScenario) -> Arc<dyn Environment> {
    Arc::new(ScenarioEnvironment::new(scenario, config.effective_seed()))
}

impl LoopShared {
    pub fn new(config: BatteryConfig, ctx: Arc<LoopContext>) -> Self {
        let environment = scenario_environment(&config, config.scenario);
        let battery =
            SimulatedBattery::new(config, environment.as_ref(), ctx.max_substep, Utc::now());
        Self {
            id: battery.id().to_string(),
            inner: Mutex::new(LoopInner {
                battery,
                environment,
                environment_overridden: false,
                lifecycle: LifecycleState::Created,
                last_sample: None,
                fault: None,
                consecutive_failures: 0,
                ticks: 0,
                alerts: AlertTracker::new(),
                revision: 0,
            }),
            wake: Notify::new(),
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.inner.lock().lifecycle
    }

    fn invalid(&self, operation: &'static str, state: LifecycleState) -> ControlError {
        ControlError::InvalidState {
            id: self.id.clone(),
            operation,
            state,
        }
    }

    /// Returns whether the state changed.
    pub fn start(&self) -> Result<bool, ControlError> {
        let mut inner = self.inner.lock();
        match inner.lifecycle {
            LifecycleState::Running => Ok(false),
            LifecycleState::Created | LifecycleState::Paused => {
                inner.lifecycle = LifecycleState::Running;
                self.wake.notify_one();
                Ok(true)
            }
            state @ LifecycleState::Stopped => Err(self.invalid("start", state)),
        }
    }

    pub fn pause(&self) -> Result<bool, ControlError> {
        let mut inner = self.inner.lock();
        match inner.lifecycle {
            LifecycleState::Paused => Ok(false),
            LifecycleState::Running => {
                inner.lifecycle = LifecycleState::Paused;
                inner.revision += 1;
                self.wake.notify_one();
                Ok(true)
            }
            state => Err(self.invalid("pause", state)),
        }
    }

    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.lifecycle == LifecycleState::Stopped {
            return false;
        }
        inner.lifecycle = LifecycleState::Stopped;
        inner.revision += 1;
        self.wake.notify_one();
        true
    }

    pub fn set_environment(
        &self,
        environment: Arc<dyn Environment>,
        operation: &'static str,
    ) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        if inner.lifecycle == LifecycleState::Stopped {
            return Err(self.invalid(operation, inner.lifecycle));
        }
        debug!(battery_id = %self.id, environment = %environment.label(), "environment replaced");
        inner.environment = environment;
        inner.environment_overridden = true;
        inner.revision += 1;
        Ok(())
    }

    pub fn apply_scenario(
        &self,
        scenario: EnvironmentalScenario,
        ambient_override_c: Option<f64>,
    ) -> Result<(), ControlError> {
        if let Some(ambient) = ambient_override_c {
            if !ambient.is_finite() {
                return Err(ControlError::InvalidConfig(format!(
                    "ambient override must be finite, got {ambient}"
                )));
            }
        }
        let seed = self.inner.lock().battery.config().effective_seed();
        let env = ScenarioEnvironment::new(scenario, seed).with_ambient_override(ambient_override_c);
        self.set_environment(Arc::new(env), "apply scenario to")
    }

    pub fn clear_scenario(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        if inner.lifecycle == LifecycleState::Stopped {
            return Err(self.invalid("clear scenario of", inner.lifecycle));
        }
        let config = inner.battery.config();
        let environment = scenario_environment(config, config.scenario);
        inner.environment = environment;
        inner.environment_overridden = false;
        inner.revision += 1;
        Ok(())
    }

    pub fn reconfigure(&self, patch: &BatteryReconfig) -> Result<BatteryConfig, ControlError> {
        let mut inner = self.inner.lock();
        match inner.lifecycle {
            LifecycleState::Created | LifecycleState::Paused => {}
            state => return Err(self.invalid("reconfigure", state)),
        }
        let next = patch.apply_to(inner.battery.config());
        next.check().map_err(ControlError::InvalidConfig)?;
        if !inner.environment_overridden {
            inner.environment = scenario_environment(&next, next.scenario);
        }
        inner.battery.set_config(next.clone());
        inner.revision += 1;
        Ok(next)
    }

    pub fn status(&self) -> BatteryStatus {
        let inner = self.inner.lock();
        let config = inner.battery.config();
        BatteryStatus {
            id: self.id.clone(),
            lifecycle: inner.lifecycle,
            profile: config.profile,
            scenario: config.scenario,
            environment: inner.environment.label(),
            tick_interval_ms: config.tick_interval_ms,
            time_acceleration: config.time_acceleration,
            ticks: inner.ticks,
            consecutive_failures: inner.consecutive_failures,
            fault: inner.fault.clone(),
            last_sample: inner.last_sample.clone(),
        }
    }

    /// One simulation step. No-op unless the loop is running.
    fn tick(&self) {
        let Some(snapshot) = self.snapshot() else {
            return;
        };
        let result = snapshot
            .battery
            .step(&snapshot.profile, snapshot.environment.as_ref());
        self.commit(snapshot, result);
    }

    fn snapshot(&self) -> Option<TickSnapshot> {
        let inner = self.inner.lock();
        if inner.lifecycle != LifecycleState::Running {
            return None;
        }
        Some(TickSnapshot {
            battery: inner.battery.clone(),
            environment: inner.environment.clone(),
            profile: *self.ctx.profiles.get(inner.battery.config().profile),
            revision: inner.revision,
        })
    }

    fn commit(&self, snapshot: TickSnapshot, result: Result<PhysicalState, ModelInputError>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.lifecycle != LifecycleState::Running || inner.revision != snapshot.revision {
            debug!(battery_id = %self.id, "tick discarded after a control change");
            return;
        }
        inner.ticks += 1;

        let profile = snapshot.profile;
        let config = inner.battery.config();
        let alert_ctx = AlertContext {
            capacity_ah: config.capacity_ah,
            nominal_voltage_v: config.nominal_voltage_v,
            end_of_life_soh: profile.end_of_life_soh,
        };

        match result {
            Ok(next) => {
                inner.consecutive_failures = 0;
                inner.battery.commit(next);
                let sample = inner.battery.next_sample(&profile);
                let alerts = inner
                    .alerts
                    .evaluate(&sample, &alert_ctx, &self.ctx.thresholds);
                inner.last_sample = Some(sample.clone());
                self.ctx.emit(SimEvent::Telemetry(sample));
                for alert in alerts {
                    self.ctx.emit(SimEvent::Alert(alert));
                }
            }
            Err(e) => {
                inner.consecutive_failures += 1;
                let failures = inner.consecutive_failures;
                let limit = self.ctx.max_consecutive_failures;
                let timestamp = inner.battery.timestamp();
                warn!(battery_id = %self.id, error = %e, failures, "tick skipped: invalid model input");
                self.ctx.emit(SimEvent::Alert(AlertEvent::new(
                    &self.id,
                    timestamp,
                    Severity::Warning,
                    AlertMetric::ModelInput,
                    f64::from(failures),
                    f64::from(limit),
                    format!("Tick skipped: {e}"),
                )));

                if failures >= limit {
                    let fault = PersistentFault {
                        failures,
                        last_error: e.to_string(),
                    };
                    error!(battery_id = %self.id, %fault, "simulation stopped");
                    inner.lifecycle = LifecycleState::Stopped;
                    inner.revision += 1;
                    self.ctx.emit(SimEvent::Alert(AlertEvent::new(
                        &self.id,
                        timestamp,
                        Severity::Critical,
                        AlertMetric::SimulationFault,
                        f64::from(failures),
                        f64::from(limit),
                        fault.to_string(),
                    )));
                    inner.fault = Some(fault);
                }
            }
        }
    }
}

/// Task body for one loop. Returns once the loop is stopped or cancelled.
pub(crate) async fn run(shared: Arc<LoopShared>, cancel: CancellationToken) {
    let mut deadline: Option<Instant> = None;
    debug!(battery_id = %shared.id, "simulation loop task started");

    loop {
        let (lifecycle, interval) = {
            let inner = shared.inner.lock();
            (inner.lifecycle, inner.battery.config().tick_interval())
        };

        match lifecycle {
            LifecycleState::Stopped => break,
            LifecycleState::Created | LifecycleState::Paused => {
                deadline = None;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shared.wake.notified() => {}
                }
            }
            LifecycleState::Running => {
                let at = *deadline.get_or_insert_with(|| Instant::now() + interval);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = shared.wake.notified() => {}
                    _ = sleep_until(at) => {
                        shared.tick();
                        // Skip missed deadlines instead of bursting to catch up
                        deadline = Some((at + interval).max(Instant::now()));
                    }
                }
            }
        }
    }

    debug!(battery_id = %shared.id, "simulation loop task finished");
}
