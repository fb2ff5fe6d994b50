use battery_telemetry_sim::config::SimulationSettings;
use battery_telemetry_sim::controller::alerts::AlertThresholds;
use battery_telemetry_sim::domain::{AlertMetric, BatteryReconfig, Severity};
use battery_telemetry_sim::persistence::MemorySink;
use battery_telemetry_sim::simulation::{Environment, EnvironmentSample, ProfileTable};
use battery_telemetry_sim::{
    BatteryConfig, ControlError, DegradationProfile, EnvironmentalScenario, LifecycleState,
    SimEvent, SimulationManager, Subscription, TelemetrySample,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn manager_with(settings: SimulationSettings) -> SimulationManager {
    SimulationManager::new(settings, ProfileTable::default(), AlertThresholds::default())
}

fn manager() -> SimulationManager {
    manager_with(SimulationSettings::default())
}

fn battery(id: &str) -> BatteryConfig {
    BatteryConfig::new(id, DegradationProfile::Healthy, EnvironmentalScenario::MildClimate)
        .with_tick_interval(Duration::from_secs(1))
}

async fn next_telemetry(sub: &mut Subscription) -> TelemetrySample {
    loop {
        match sub.recv().await.expect("hub open") {
            SimEvent::Telemetry(sample) => return sample,
            SimEvent::Alert(_) => continue,
        }
    }
}

/// Fails every sample: absolute zero is not reachable.
#[derive(Debug)]
struct FrozenEnvironment;

impl Environment for FrozenEnvironment {
    fn sample(&self, _elapsed_s: f64) -> EnvironmentSample {
        EnvironmentSample {
            ambient_temp_c: -300.0,
            c_rate: 0.0,
            humidity: 0.5,
        }
    }

    fn label(&self) -> String {
        "frozen".into()
    }
}

/// Returns garbage for the first `failures` samples, then steady conditions.
#[derive(Debug)]
struct FlakyEnvironment {
    calls: AtomicUsize,
    failures: usize,
}

impl Environment for FlakyEnvironment {
    fn sample(&self, _elapsed_s: f64) -> EnvironmentSample {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        EnvironmentSample {
            ambient_temp_c: if call < self.failures { f64::NAN } else { 25.0 },
            c_rate: 0.0,
            humidity: 0.5,
        }
    }

    fn label(&self) -> String {
        "flaky".into()
    }
}

#[tokio::test(start_paused = true)]
async fn start_then_immediate_stop_emits_no_sample() {
    let m = manager();
    let mut sub = m.subscribe();
    m.create(battery("B1")).unwrap();
    m.start("B1").unwrap();
    m.stop("B1").unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;

    let status = m.status("B1").unwrap();
    assert_eq!(status.lifecycle, LifecycleState::Stopped);
    assert_eq!(status.ticks, 0);
    assert!(status.last_sample.is_none());
    assert!(sub.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn pause_and_resume_continue_the_same_time_base() {
    let m = manager();
    let mut sub = m.subscribe();
    m.create(battery("B1")).unwrap();
    m.start("B1").unwrap();

    let first = next_telemetry(&mut sub).await;
    m.pause("B1").unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(sub.try_recv().is_none());
    assert_eq!(m.status("B1").unwrap().ticks, 1);

    m.start("B1").unwrap();
    let second = next_telemetry(&mut sub).await;
    assert_eq!(second.sequence, first.sequence + 1);
    assert_eq!(second.elapsed_s, first.elapsed_s + 1.0);
    assert!(second.timestamp > first.timestamp);
}

#[tokio::test(start_paused = true)]
async fn persistent_invalid_input_stops_loop_with_fault() {
    let m = manager();
    let mut sub = m.subscribe();
    m.create(battery("B1")).unwrap();
    m.apply_environment("B1", Arc::new(FrozenEnvironment)).unwrap();
    m.start("B1").unwrap();

    let mut warnings = 0;
    loop {
        match sub.recv().await.expect("hub open") {
            SimEvent::Alert(a) if a.metric == AlertMetric::ModelInput => {
                assert_eq!(a.severity, Severity::Warning);
                warnings += 1;
            }
            SimEvent::Alert(a) if a.metric == AlertMetric::SimulationFault => {
                assert_eq!(a.severity, Severity::Critical);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(warnings, 3);

    let status = m.status("B1").unwrap();
    assert_eq!(status.lifecycle, LifecycleState::Stopped);
    assert_eq!(status.fault.as_ref().map(|f| f.failures), Some(3));
    assert!(status.last_sample.is_none());

    // Stopped loops stay stopped
    assert!(matches!(m.start("B1"), Err(ControlError::InvalidState { .. })));
    m.remove("B1").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn transient_failures_do_not_stop_the_loop() {
    let m = manager();
    let mut sub = m.subscribe();
    m.create(battery("B1")).unwrap();
    m.apply_environment(
        "B1",
        Arc::new(FlakyEnvironment {
            calls: AtomicUsize::new(0),
            failures: 2,
        }),
    )
    .unwrap();
    m.start("B1").unwrap();

    let sample = next_telemetry(&mut sub).await;
    assert_eq!(sample.sequence, 1);
    // the two failed ticks did not advance simulated time
    assert_eq!(sample.elapsed_s, 1.0);

    let status = m.status("B1").unwrap();
    assert_eq!(status.lifecycle, LifecycleState::Running);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.ticks, 3);
    assert!(status.fault.is_none());
}

#[tokio::test(start_paused = true)]
async fn remove_requires_non_running_and_releases_id() {
    let m = manager();
    m.create(battery("B1")).unwrap();
    m.start("B1").unwrap();

    let err = m.remove("B1").await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::InvalidState {
            state: LifecycleState::Running,
            ..
        }
    ));

    m.stop("B1").unwrap();
    m.remove("B1").await.unwrap();
    assert!(matches!(m.status("B1"), Err(ControlError::NotFound(_))));

    m.create(battery("B1")).unwrap();
    assert_eq!(m.status("B1").unwrap().lifecycle, LifecycleState::Created);
}

#[tokio::test(start_paused = true)]
async fn paused_battery_can_be_removed() {
    let m = manager();
    m.create(battery("B1")).unwrap();
    m.start("B1").unwrap();
    m.pause("B1").unwrap();
    m.remove("B1").await.unwrap();
    assert!(m.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconfigure_only_when_not_running() {
    let m = manager();
    let mut sub = m.subscribe();
    m.create(battery("B1")).unwrap();
    m.start("B1").unwrap();
    next_telemetry(&mut sub).await;

    let patch = BatteryReconfig {
        profile: Some(DegradationProfile::Failing),
        tick_interval_ms: Some(500),
        ..Default::default()
    };
    assert!(matches!(
        m.reconfigure("B1", &patch),
        Err(ControlError::InvalidState { .. })
    ));

    m.pause("B1").unwrap();
    let updated = m.reconfigure("B1", &patch).unwrap();
    assert_eq!(updated.profile, DegradationProfile::Failing);

    let invalid = BatteryReconfig {
        tick_interval_ms: Some(0),
        ..Default::default()
    };
    assert!(matches!(
        m.reconfigure("B1", &invalid),
        Err(ControlError::InvalidConfig(_))
    ));

    m.start("B1").unwrap();
    let sample = next_telemetry(&mut sub).await;
    assert_eq!(sample.elapsed_s, 1.5);

    let status = m.status("B1").unwrap();
    assert_eq!(status.profile, DegradationProfile::Failing);
    assert_eq!(status.tick_interval_ms, 500);
}

#[tokio::test(start_paused = true)]
async fn apply_scenario_keeps_physical_state() {
    let m = manager();
    let mut sub = m.subscribe();
    m.create(battery("B1")).unwrap();
    m.start("B1").unwrap();

    let mut before = next_telemetry(&mut sub).await;
    for _ in 0..4 {
        before = next_telemetry(&mut sub).await;
    }

    m.apply_scenario("B1", EnvironmentalScenario::HighTemperature, None)
        .unwrap();
    let after = next_telemetry(&mut sub).await;
    assert_eq!(after.elapsed_s, before.elapsed_s + 1.0);
    assert!(after.soh <= before.soh);
    assert!(after.cycle_count >= before.cycle_count);
    assert!(after.ambient_temp_c > 40.0);
    assert_eq!(m.status("B1").unwrap().environment, "high_temperature");
    // configured scenario is untouched
    assert_eq!(
        m.status("B1").unwrap().scenario,
        EnvironmentalScenario::MildClimate
    );

    m.apply_scenario("B1", EnvironmentalScenario::NormalOperation, Some(52.0))
        .unwrap();
    let pinned = next_telemetry(&mut sub).await;
    assert_eq!(pinned.ambient_temp_c, 52.0);

    m.clear_scenario("B1").unwrap();
    assert_eq!(m.status("B1").unwrap().environment, "mild_climate");
}

#[tokio::test(start_paused = true)]
async fn idle_subscriber_does_not_affect_others() {
    let m = manager_with(SimulationSettings {
        subscriber_queue_capacity: 4,
        ..Default::default()
    });
    let mut idle = m.subscribe();
    let mut active = m.subscribe();
    m.create(battery("B1")).unwrap();
    m.start("B1").unwrap();

    for expected in 1..=20 {
        let sample = next_telemetry(&mut active).await;
        assert_eq!(sample.sequence, expected);
    }
    assert_eq!(active.dropped_count(), 0);

    let oldest = next_telemetry(&mut idle).await;
    assert!(oldest.sequence > 1);
    assert!(idle.dropped_count() > 0);
}

#[tokio::test(start_paused = true)]
async fn many_batteries_tick_independently() {
    let m = manager();
    let mut sub = m.subscribe();
    for n in 0..8 {
        let id = format!("B{n}");
        let cfg = battery(&id).with_tick_interval(Duration::from_millis(250 * (n + 1)));
        m.create(cfg).unwrap();
        m.start(&id).unwrap();
    }

    let mut last: std::collections::HashMap<String, TelemetrySample> = Default::default();
    for _ in 0..200 {
        let sample = next_telemetry(&mut sub).await;
        if let Some(prev) = last.get(&sample.battery_id) {
            assert_eq!(sample.sequence, prev.sequence + 1);
            assert!(sample.timestamp > prev.timestamp);
            assert!(sample.elapsed_s > prev.elapsed_s);
        }
        last.insert(sample.battery_id.clone(), sample);
    }
    assert_eq!(last.len(), 8);

    let statuses = m.list_statuses();
    let ids: Vec<_> = statuses.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["B0", "B1", "B2", "B3", "B4", "B5", "B6", "B7"]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_loops_and_ends_subscriptions() {
    let m = manager();
    let sink = Arc::new(MemorySink::new());
    m.attach_sink(sink.clone());

    let mut sub = m.subscribe();
    m.create(battery("B1")).unwrap();
    m.create(battery("B2")).unwrap();
    m.start("B1").unwrap();
    m.start("B2").unwrap();
    for _ in 0..4 {
        next_telemetry(&mut sub).await;
    }

    m.shutdown().await;

    // whatever was already queued drains, then the stream ends
    while sub.recv().await.is_some() {}
    assert!(sub.is_closed());
    assert!(m.is_empty());
    assert!(matches!(
        m.create(battery("B3")),
        Err(ControlError::ShuttingDown)
    ));

    let persisted = sink
        .events()
        .iter()
        .filter(|e| matches!(e, SimEvent::Telemetry(_)))
        .count();
    assert!(persisted >= 4, "persisted {persisted}");

    // no ticks after shutdown
    tokio::time::sleep(Duration::from_secs(10)).await;
    let after = sink.events().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sink.events().len(), after);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_of_one_id_admit_exactly_one() {
    let m = manager();
    let barrier = Arc::new(tokio::sync::Barrier::new(8));
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let m = m.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                m.create(battery("X"))
            })
        })
        .collect();

    let mut created = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(id) => {
                assert_eq!(id, "X");
                created += 1;
            }
            Err(e) => assert_eq!(e, ControlError::DuplicateId("X".into())),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(m.len(), 1);
    m.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_racing_shutdown_leaves_nothing_behind() {
    for round in 0..20 {
        let m = manager();
        let barrier = Arc::new(tokio::sync::Barrier::new(9));
        let creators: Vec<_> = (0..8)
            .map(|i| {
                let m = m.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    m.create(battery(&format!("R{round}-{i}")))
                })
            })
            .collect();
        let stopper = {
            let m = m.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                m.shutdown().await;
            })
        };

        stopper.await.unwrap();
        for creator in creators {
            match creator.await.unwrap() {
                Ok(_) | Err(ControlError::ShuttingDown) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(m.is_empty(), "round {round}: {} batteries left", m.len());
        assert!(m.list_statuses().is_empty());
    }
}
