//! # Simulation Manager
//!
//! Owns every simulation loop and exposes the control surface. All methods
//! take `&self` and are safe to call from many tasks at once; the id → loop
//! map lives behind a `parking_lot::RwLock` that is never held across an
//! `.await`.

pub mod alerts;
pub mod error;
pub mod sim_loop;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use error::{ControlError, PersistentFault};
pub use sim_loop::BatteryStatus;

use crate::broadcast::{BroadcastHub, Subscription};
use crate::config::{Config, SimulationSettings};
use crate::domain::{BatteryConfig, BatteryReconfig, LifecycleState};
use crate::persistence::{SinkHandle, TelemetrySink};
use crate::simulation::{Environment, EnvironmentalScenario, ProfileTable};
use alerts::AlertThresholds;
use sim_loop::{LoopContext, LoopShared};

struct LoopEntry {
    shared: Arc<LoopShared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Removal in flight; the id stays reserved until the task has ended
    removing: bool,
}

struct ManagerInner {
    loops: RwLock<HashMap<String, LoopEntry>>,
    ctx: Arc<LoopContext>,
    root: CancellationToken,
    shutting_down: AtomicBool,
    sink_task: Mutex<Option<JoinHandle<()>>>,
    sink_queue_capacity: usize,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Cheap to clone; clones control the same set of loops.
#[derive(Clone)]
pub struct SimulationManager {
    inner: Arc<ManagerInner>,
}

impl SimulationManager {
    pub fn new(
        settings: SimulationSettings,
        profiles: ProfileTable,
        thresholds: AlertThresholds,
    ) -> Self {
        let ctx = LoopContext {
            hub: BroadcastHub::new(settings.subscriber_queue_capacity),
            sink: RwLock::new(None),
            profiles,
            thresholds,
            max_consecutive_failures: settings.max_consecutive_failures.max(1),
            max_substep: settings.max_substep(),
        };
        Self {
            inner: Arc::new(ManagerInner {
                loops: RwLock::new(HashMap::new()),
                ctx: Arc::new(ctx),
                root: CancellationToken::new(),
                shutting_down: AtomicBool::new(false),
                sink_task: Mutex::new(None),
                sink_queue_capacity: settings.sink_queue_capacity,
            }),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.simulation.clone(),
            cfg.profiles.clone(),
            cfg.alerts.clone(),
        )
    }

    /// Forward a copy of every event to `sink` from now on. Replaces any
    /// previous sink. Must be called inside a tokio runtime.
    pub fn attach_sink(&self, sink: Arc<dyn TelemetrySink>) {
        let (handle, task) = SinkHandle::spawn(sink, self.inner.sink_queue_capacity);
        *self.inner.ctx.sink.write() = Some(handle);
        // A replaced forwarder drains and exits on its own once its handle is gone
        self.inner.sink_task.lock().replace(task);
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.ctx.hub
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.ctx.hub.subscribe()
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.inner.ctx.hub.unsubscribe(subscription);
    }

    fn ensure_open(&self) -> Result<(), ControlError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(ControlError::ShuttingDown);
        }
        Ok(())
    }

    /// Run `op` against a live loop.
    fn with_loop<T>(
        &self,
        id: &str,
        op: impl FnOnce(&LoopShared) -> Result<T, ControlError>,
    ) -> Result<T, ControlError> {
        let loops = self.inner.loops.read();
        match loops.get(id) {
            Some(entry) if !entry.removing => op(&entry.shared),
            _ => Err(ControlError::NotFound(id.to_string())),
        }
    }

    /// Register a new battery in `Created`. Its task is spawned immediately
    /// and waits for `start`.
    pub fn create(&self, config: BatteryConfig) -> Result<String, ControlError> {
        self.ensure_open()?;
        config.check().map_err(ControlError::InvalidConfig)?;

        let mut loops = self.inner.loops.write();
        // shutdown drains under this lock, so a flag seen clear here stays
        // meaningful until the entry is inserted
        self.ensure_open()?;
        if loops.contains_key(&config.id) {
            return Err(ControlError::DuplicateId(config.id));
        }
        let id = config.id.clone();
        let profile = config.profile;
        let scenario = config.scenario;
        let shared = Arc::new(LoopShared::new(config, self.inner.ctx.clone()));
        let cancel = self.inner.root.child_token();
        let task = tokio::spawn(sim_loop::run(shared.clone(), cancel.clone()));
        loops.insert(
            id.clone(),
            LoopEntry {
                shared,
                cancel,
                task: Some(task),
                removing: false,
            },
        );
        info!(battery_id = %id, %profile, %scenario, "battery created");
        Ok(id)
    }

    pub fn start(&self, id: &str) -> Result<(), ControlError> {
        self.ensure_open()?;
        if self.with_loop(id, |l| l.start())? {
            info!(battery_id = %id, "simulation started");
        }
        Ok(())
    }

    pub fn pause(&self, id: &str) -> Result<(), ControlError> {
        if self.with_loop(id, |l| l.pause())? {
            info!(battery_id = %id, "simulation paused");
        }
        Ok(())
    }

    pub fn stop(&self, id: &str) -> Result<(), ControlError> {
        if self.with_loop(id, |l| Ok(l.stop()))? {
            info!(battery_id = %id, "simulation stopped");
        }
        Ok(())
    }

    /// Stop and forget a battery. Refused while it is running. The id can be
    /// reused once this returns.
    pub async fn remove(&self, id: &str) -> Result<(), ControlError> {
        let (cancel, task) = {
            let mut loops = self.inner.loops.write();
            let entry = loops
                .get_mut(id)
                .filter(|e| !e.removing)
                .ok_or_else(|| ControlError::NotFound(id.to_string()))?;
            let state = entry.shared.lifecycle();
            if state == LifecycleState::Running {
                return Err(ControlError::InvalidState {
                    id: id.to_string(),
                    operation: "remove",
                    state,
                });
            }
            entry.removing = true;
            entry.shared.stop();
            (entry.cancel.clone(), entry.task.take())
        };
        cancel.cancel();

        // Finish in a detached task so the id is released even if the caller
        // stops polling this future.
        let inner = self.inner.clone();
        let key = id.to_string();
        let finish = tokio::spawn(async move {
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(battery_id = %key, error = %e, "simulation task ended abnormally");
                }
            }
            inner.loops.write().remove(&key);
        });
        if let Err(e) = finish.await {
            warn!(battery_id = %id, error = %e, "removal task failed");
        }
        info!(battery_id = %id, "battery removed");
        Ok(())
    }

    /// Switch the environment without touching physical state. An ambient
    /// override pins the scenario's temperature.
    pub fn apply_scenario(
        &self,
        id: &str,
        scenario: EnvironmentalScenario,
        ambient_override_c: Option<f64>,
    ) -> Result<(), ControlError> {
        self.with_loop(id, |l| l.apply_scenario(scenario, ambient_override_c))?;
        info!(battery_id = %id, %scenario, ambient_override_c, "scenario applied");
        Ok(())
    }

    /// Drive a battery with a caller-supplied environment.
    pub fn apply_environment(
        &self,
        id: &str,
        environment: Arc<dyn Environment>,
    ) -> Result<(), ControlError> {
        let label = environment.label();
        self.with_loop(id, |l| l.set_environment(environment, "apply environment to"))?;
        info!(battery_id = %id, environment = %label, "custom environment applied");
        Ok(())
    }

    /// Revert to the scenario in the battery's configuration.
    pub fn clear_scenario(&self, id: &str) -> Result<(), ControlError> {
        self.with_loop(id, |l| l.clear_scenario())?;
        info!(battery_id = %id, "scenario override cleared");
        Ok(())
    }

    /// [`apply_scenario`](Self::apply_scenario) for several batteries at
    /// once. `None` targets every battery that is not stopped. Returns the
    /// ids that were switched, sorted.
    pub fn apply_scenario_fleet(
        &self,
        battery_ids: Option<&[String]>,
        scenario: EnvironmentalScenario,
        ambient_override_c: Option<f64>,
    ) -> Result<Vec<String>, ControlError> {
        let applied = self.for_each_target(battery_ids, |l| {
            l.apply_scenario(scenario, ambient_override_c)
        })?;
        info!(batteries = applied.len(), %scenario, ambient_override_c, "scenario applied to fleet");
        Ok(applied)
    }

    /// [`clear_scenario`](Self::clear_scenario) for several batteries at
    /// once, with the same targeting as
    /// [`apply_scenario_fleet`](Self::apply_scenario_fleet).
    pub fn clear_scenario_fleet(
        &self,
        battery_ids: Option<&[String]>,
    ) -> Result<Vec<String>, ControlError> {
        let cleared = self.for_each_target(battery_ids, |l| l.clear_scenario())?;
        info!(batteries = cleared.len(), "scenario overrides cleared for fleet");
        Ok(cleared)
    }

    /// Resolve every explicit id before touching any loop, so an unknown id
    /// changes nothing.
    fn for_each_target(
        &self,
        battery_ids: Option<&[String]>,
        op: impl Fn(&LoopShared) -> Result<(), ControlError>,
    ) -> Result<Vec<String>, ControlError> {
        let loops = self.inner.loops.read();
        let mut targets: Vec<&LoopShared> = match battery_ids {
            Some(ids) => ids
                .iter()
                .map(|id| match loops.get(id.as_str()) {
                    Some(entry) if !entry.removing => Ok(entry.shared.as_ref()),
                    _ => Err(ControlError::NotFound(id.clone())),
                })
                .collect::<Result<_, _>>()?,
            None => loops
                .values()
                .filter(|e| !e.removing && e.shared.lifecycle() != LifecycleState::Stopped)
                .map(|e| e.shared.as_ref())
                .collect(),
        };
        targets.sort_by(|a, b| a.id().cmp(b.id()));
        targets.dedup_by(|a, b| a.id() == b.id());

        let mut done = Vec::with_capacity(targets.len());
        for target in targets {
            op(target)?;
            done.push(target.id().to_string());
        }
        Ok(done)
    }

    /// Change profile, scenario or tick parameters of a created or paused battery.
    pub fn reconfigure(
        &self,
        id: &str,
        patch: &BatteryReconfig,
    ) -> Result<BatteryConfig, ControlError> {
        let config = self.with_loop(id, |l| l.reconfigure(patch))?;
        info!(
            battery_id = %id,
            profile = %config.profile,
            scenario = %config.scenario,
            tick_interval_ms = config.tick_interval_ms,
            "battery reconfigured"
        );
        Ok(config)
    }

    pub fn status(&self, id: &str) -> Result<BatteryStatus, ControlError> {
        self.with_loop(id, |l| Ok(l.status()))
    }

    /// Every battery, sorted by id.
    pub fn list_statuses(&self) -> Vec<BatteryStatus> {
        let mut statuses: Vec<_> = self
            .inner
            .loops
            .read()
            .values()
            .filter(|e| !e.removing)
            .map(|e| e.shared.status())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.inner.loops.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Stop every loop, wait for the tasks, end all subscriptions and drain
    /// the sink. No tick runs after this returns.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut loops = self.inner.loops.write();
            info!(batteries = loops.len(), "shutting down simulation manager");
            loops
                .drain()
                .filter_map(|(_, mut entry)| {
                    entry.shared.stop();
                    entry.task.take()
                })
                .collect()
        };
        self.inner.root.cancel();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "simulation task ended abnormally");
            }
        }

        self.inner.ctx.hub.close();

        self.inner.ctx.sink.write().take();
        let sink_task = self.inner.sink_task.lock().take();
        if let Some(task) = sink_task {
            if let Err(e) = task.await {
                warn!(error = %e, "sink forwarder ended abnormally");
            }
        }
        info!("simulation manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::DegradationProfile;

    fn manager() -> SimulationManager {
        SimulationManager::new(
            SimulationSettings::default(),
            ProfileTable::default(),
            AlertThresholds::default(),
        )
    }

    fn battery(id: &str) -> BatteryConfig {
        BatteryConfig::new(id, DegradationProfile::Healthy, EnvironmentalScenario::MildClimate)
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_invalid_create() {
        let m = manager();
        m.create(battery("B1")).unwrap();
        assert_eq!(
            m.create(battery("B1")),
            Err(ControlError::DuplicateId("B1".into()))
        );
        let mut bad = battery("B2");
        bad.initial_soh = 2.0;
        assert!(matches!(m.create(bad), Err(ControlError::InvalidConfig(_))));
        assert_eq!(m.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_rules() {
        let m = manager();
        m.create(battery("B1")).unwrap();

        assert!(matches!(m.pause("B1"), Err(ControlError::InvalidState { .. })));
        m.start("B1").unwrap();
        m.start("B1").unwrap();
        m.pause("B1").unwrap();
        m.pause("B1").unwrap();
        m.stop("B1").unwrap();
        m.stop("B1").unwrap();
        assert!(matches!(m.start("B1"), Err(ControlError::InvalidState { .. })));
        assert_eq!(m.status("B1").unwrap().lifecycle, LifecycleState::Stopped);
        assert_eq!(m.start("nope"), Err(ControlError::NotFound("nope".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_battery_can_be_removed() {
        let m = manager();
        m.create(battery("B1")).unwrap();
        m.remove("B1").await.unwrap();
        assert!(m.is_empty());
        assert_eq!(m.remove("B1").await, Err(ControlError::NotFound("B1".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_scenario_targets() {
        let m = manager();
        for id in ["B3", "B1", "B2"] {
            m.create(battery(id)).unwrap();
        }
        m.stop("B3").unwrap();

        let applied = m
            .apply_scenario_fleet(None, EnvironmentalScenario::HvacFailure, Some(40.0))
            .unwrap();
        assert_eq!(applied, ["B1", "B2"]);
        assert_eq!(m.status("B1").unwrap().environment, "hvac_failure@40.0C");
        assert_eq!(m.status("B3").unwrap().environment, "mild_climate");

        let unknown = ["B1".to_string(), "nope".to_string()];
        assert_eq!(
            m.clear_scenario_fleet(Some(unknown.as_slice())),
            Err(ControlError::NotFound("nope".into()))
        );
        // nothing was cleared
        assert_eq!(m.status("B1").unwrap().environment, "hvac_failure@40.0C");

        let only_b2 = ["B2".to_string()];
        assert_eq!(m.clear_scenario_fleet(Some(only_b2.as_slice())).unwrap(), ["B2"]);
        assert_eq!(m.status("B2").unwrap().environment, "mild_climate");
        assert_eq!(m.status("B1").unwrap().environment, "hvac_failure@40.0C");

        assert_eq!(m.clear_scenario_fleet(None).unwrap(), ["B1", "B2"]);
        assert_eq!(m.status("B1").unwrap().environment, "mild_climate");
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_after_shutdown() {
        let m = manager();
        m.create(battery("B1")).unwrap();
        m.shutdown().await;
        assert!(m.is_empty());
        assert_eq!(m.create(battery("B2")), Err(ControlError::ShuttingDown));
        assert!(m.hub().is_closed());
    }
}
