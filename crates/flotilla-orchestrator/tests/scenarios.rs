//! End-to-end rollout scenarios against the simulated fleet.
//!
//! Every test runs on paused tokio time, so drain waits, probe intervals
//! and metrics windows complete instantly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flotilla_audit::{AuditLogger, InMemoryBackend};
use flotilla_core::{
    DeployState, DeploymentPlan, DeploymentRecord, DeploymentStatus, HealthCheckPolicy,
    RollbackScope, RollbackThresholds, RollbackTrigger, RunState, ServerSpec, Slot, Strategy,
    TrafficState,
};
use flotilla_orchestrator::testing::{FleetCall, SimulatedFleet};
use flotilla_orchestrator::{
    DeploymentEvent, DeploymentOrchestrator, DeploymentReport, ErrorKind, HistoryStore,
    InMemoryHistory, OrchestratorError, RollbackOutcome,
};
use tokio_util::sync::CancellationToken;

const ENV: &str = "prod";

// =============================================================================
// Helpers
// =============================================================================

fn servers(count: usize) -> Vec<ServerSpec> {
    (1..=count)
        .map(|i| ServerSpec::new(format!("web-{i:02}"), format!("10.0.0.{i}:8080")))
        .collect()
}

fn slotted() -> Vec<ServerSpec> {
    let mut all = Vec::new();
    for i in 1..=3 {
        all.push(ServerSpec::new(format!("blue-{i}"), format!("10.0.1.{i}:8080")).in_slot(Slot::Blue));
        all.push(ServerSpec::new(format!("green-{i}"), format!("10.0.2.{i}:8080")).in_slot(Slot::Green));
    }
    all
}

fn fast_health() -> HealthCheckPolicy {
    HealthCheckPolicy {
        endpoint: "/health".to_string(),
        interval_seconds: 1,
        max_attempts: 3,
        required_consecutive_successes: 2,
        timeout_seconds: 1,
    }
}

fn plan(version: &str, strategy: Strategy, servers: Vec<ServerSpec>, batch_size: usize) -> DeploymentPlan {
    DeploymentPlan::builder(ENV, version)
        .strategy(strategy)
        .batch_size(batch_size)
        .drain_seconds(5)
        .health_check(fast_health())
        .monitor(60, 10)
        .post_deploy_monitor(false)
        .servers(servers)
        .build_unchecked()
}

fn success(version: &str, strategy: Strategy, active_slot: Option<Slot>) -> DeploymentRecord {
    DeploymentRecord::new(ENV, version, strategy, Utc::now())
        .with_active_slot(active_slot)
        .finish(DeploymentStatus::Success, Utc::now())
}

struct Harness {
    fleet: SimulatedFleet,
    history: Arc<InMemoryHistory>,
    audit: Arc<InMemoryBackend>,
    orchestrator: DeploymentOrchestrator,
}

impl Harness {
    fn new(fleet: SimulatedFleet, records: Vec<DeploymentRecord>) -> Self {
        let history = Arc::new(InMemoryHistory::with_records(records));
        let audit = Arc::new(InMemoryBackend::new());
        let logger = AuditLogger::builder().with_backend(audit.clone()).build();
        let orchestrator = DeploymentOrchestrator::builder(fleet.collaborators())
            .history(history.clone())
            .audit(Arc::new(logger))
            .build();
        Self {
            fleet,
            history,
            audit,
            orchestrator,
        }
    }

    /// Fleet running 1.0.0 with a recorded successful rolling deploy of it.
    fn with_baseline(servers: &[ServerSpec]) -> Self {
        Self::new(
            SimulatedFleet::new(servers, "1.0.0"),
            vec![success("1.0.0", Strategy::Rolling, None)],
        )
    }

    async fn deploy(&self, plan: DeploymentPlan) -> DeploymentReport {
        self.orchestrator
            .deploy(plan, CancellationToken::new())
            .await
            .expect("run should reach a terminal state")
    }

    fn versions(&self, ids: &[&str]) -> Vec<Option<String>> {
        ids.iter().map(|id| self.fleet.version_of(id)).collect()
    }

    fn deployed_to(&self, server_id: &str, version: &str) -> bool {
        self.fleet
            .deployed()
            .iter()
            .any(|(id, v)| id == server_id && v == version)
    }

    fn transitions(&self) -> Vec<String> {
        self.audit
            .json_events()
            .iter()
            .filter_map(|e| e["toState"].as_str().map(ToString::to_string))
            .collect()
    }
}

fn assert_active_implies_healthy(report: &DeploymentReport) {
    for server in &report.servers {
        if server.traffic_state == TrafficState::Active {
            assert_eq!(
                server.deploy_state,
                DeployState::Healthy,
                "{} is active but {}",
                server.spec.id,
                server.deploy_state
            );
        }
    }
}

fn position(calls: &[FleetCall], wanted: &FleetCall) -> usize {
    calls
        .iter()
        .position(|c| c == wanted)
        .unwrap_or_else(|| panic!("call {wanted:?} not found"))
}

fn availability(server_id: &str, available: bool) -> FleetCall {
    FleetCall::Availability {
        server_id: server_id.to_string(),
        available,
    }
}

// =============================================================================
// Rolling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rolling_six_servers_in_three_batches() {
    let harness = Harness::with_baseline(&servers(6));

    let report = harness
        .deploy(plan("2.0.0", Strategy::Rolling, servers(6), 2))
        .await;

    assert!(report.is_success());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.final_state, RunState::Completed);
    assert_eq!(report.batches_total, 3);
    assert_eq!(report.batches_completed, 3);
    for server in &report.servers {
        assert_eq!(server.traffic_state, TrafficState::Active);
        assert_eq!(server.deploy_state, DeployState::Healthy);
        assert_eq!(server.version.as_deref(), Some("2.0.0"));
    }
    assert!(harness.fleet.violations().is_empty(), "{:?}", harness.fleet.violations());

    let records = harness.history.records(ENV).await.unwrap();
    let successes = records.iter().filter(|r| r.is_success() && r.version == "2.0.0").count();
    assert_eq!(successes, 1);
    assert_eq!(records.last().unwrap().backup_reference, Some(records[0].id));
}

#[tokio::test(start_paused = true)]
async fn test_rolling_batches_are_sequential() {
    let harness = Harness::with_baseline(&servers(6));
    harness
        .deploy(plan("2.0.0", Strategy::Rolling, servers(6), 2))
        .await;

    let calls = harness.fleet.calls();
    for (done, next) in [(["web-01", "web-02"], "web-03"), (["web-03", "web-04"], "web-05")] {
        let next_drain = position(&calls, &availability(next, false));
        for id in done {
            assert!(position(&calls, &availability(id, true)) < next_drain);
        }
    }

    // Each server leaves rotation before its deploy and returns after it.
    for spec in servers(6) {
        let deploy = position(
            &calls,
            &FleetCall::Deploy {
                server_id: spec.id.clone(),
                version: "2.0.0".to_string(),
            },
        );
        assert!(position(&calls, &availability(&spec.id, false)) < deploy);
        assert!(position(&calls, &availability(&spec.id, true)) > deploy);
    }
}

#[tokio::test(start_paused = true)]
async fn test_health_failure_rolls_back_only_its_batch() {
    let harness = Harness::with_baseline(&servers(6));
    harness.fleet.fail_health("web-04", "2.0.0");

    let report = harness
        .deploy(plan("2.0.0", Strategy::Rolling, servers(6), 2))
        .await;

    assert_eq!(report.record.status, DeploymentStatus::Failed);
    assert_eq!(report.final_state, RunState::Failed);
    assert_eq!(report.exit_code(), 1);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::HealthCheckTimeout);
    assert!(failure.message.contains("web-04"));
    assert!(failure.message.contains("3 probes"));

    let decision = report.decision.as_ref().unwrap();
    assert_eq!(decision.scope, RollbackScope::Batch);
    assert_eq!(decision.triggered_by, RollbackTrigger::HealthCheckFailure);

    assert_eq!(
        harness.versions(&["web-01", "web-02", "web-03", "web-04", "web-05", "web-06"]),
        vec![
            Some("2.0.0".to_string()),
            Some("2.0.0".to_string()),
            Some("1.0.0".to_string()),
            Some("1.0.0".to_string()),
            Some("1.0.0".to_string()),
            Some("1.0.0".to_string()),
        ]
    );
    assert!(!harness.deployed_to("web-05", "2.0.0"));
    assert!(!harness.deployed_to("web-06", "2.0.0"));
    assert!(!harness.deployed_to("web-01", "1.0.0"));
    assert!(harness.deployed_to("web-03", "1.0.0"));
    for id in ["web-01", "web-02", "web-03", "web-04"] {
        assert_eq!(harness.fleet.traffic_of(id), Some(TrafficState::Active));
    }
    assert_active_implies_healthy(&report);
    assert!(harness.fleet.violations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failure_without_rollback_target_needs_operator() {
    let harness = Harness::new(SimulatedFleet::new(&servers(4), "1.0.0"), Vec::new());
    harness.fleet.fail_deploy("web-02", "2.0.0");

    let err = harness
        .orchestrator
        .deploy(plan("2.0.0", Strategy::Rolling, servers(4), 2), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NoRollbackTarget);
    assert!(err.requires_intervention());
    let latest = harness.history.latest(ENV).await.unwrap().unwrap();
    assert_eq!(latest.status, DeploymentStatus::Failed);
    assert!(!harness.deployed_to("web-03", "2.0.0"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_restore_needs_operator() {
    let harness = Harness::with_baseline(&servers(4));
    harness.fleet.fail_health("web-03", "2.0.0");
    harness.fleet.fail_health("web-03", "1.0.0");
    let mut events = harness.orchestrator.subscribe();

    let err = harness
        .orchestrator
        .deploy(plan("2.0.0", Strategy::Rolling, servers(4), 2), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RollbackFailure);
    assert!(err.requires_intervention());
    assert_eq!(err.exit_code(), 1);
    match &err {
        OrchestratorError::RollbackFailure { servers, .. } => {
            assert_eq!(servers, &vec!["web-03".to_string()]);
        }
        other => panic!("unexpected error {other:?}"),
    }

    // One deploy of the new version, one restore attempt, no retry.
    let web03: Vec<String> = harness
        .fleet
        .deployed()
        .into_iter()
        .filter(|(id, _)| id == "web-03")
        .map(|(_, v)| v)
        .collect();
    assert_eq!(web03, vec!["2.0.0".to_string(), "1.0.0".to_string()]);
    assert_eq!(harness.fleet.version_of("web-04").as_deref(), Some("1.0.0"));
    assert_eq!(harness.fleet.traffic_of("web-04"), Some(TrafficState::Active));
    assert_ne!(harness.fleet.traffic_of("web-03"), Some(TrafficState::Active));

    let latest = harness.history.latest(ENV).await.unwrap().unwrap();
    assert_eq!(latest.status, DeploymentStatus::Failed);
    assert!(matches!(
        events.try_recv().unwrap(),
        DeploymentEvent::RollbackFailed { .. }
    ));
    assert!(harness.fleet.violations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_monitor_window_is_rejected() {
    let harness = Harness::with_baseline(&servers(4));
    let mut plan = plan("2.0.0", Strategy::Canary, servers(4), 2);
    plan.canary_percent = Some(25.0);
    plan.monitor_window_seconds = u64::MAX;

    let err = harness
        .orchestrator
        .deploy(plan, CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert!(err.to_string().contains("monitorWindowSeconds"));
    assert!(harness.fleet.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_deployer_errors_are_retried() {
    let harness = Harness::with_baseline(&servers(2));
    harness.fleet.unreachable_deployer("web-01", 2);

    let report = harness
        .deploy(plan("2.0.0", Strategy::Rolling, servers(2), 2))
        .await;

    assert!(report.is_success());
    assert_eq!(harness.fleet.version_of("web-01").as_deref(), Some("2.0.0"));
}

#[tokio::test(start_paused = true)]
async fn test_worker_pool_is_bounded() {
    let harness = Harness::new(SimulatedFleet::new(&servers(6), "1.0.0"), Vec::new());
    let mut plan = plan("2.0.0", Strategy::Rolling, servers(6), 6);
    plan.max_parallelism = 2;

    let report = harness.deploy(plan).await;

    assert!(report.is_success());
    assert_eq!(harness.fleet.max_concurrent_deploys(), 2);
}

// =============================================================================
// Metrics monitoring
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_post_deploy_breach_rolls_back_environment() {
    let harness = Harness::with_baseline(&servers(5));
    for id in ["web-01", "web-02", "web-03"] {
        harness.fleet.overload_cpu(id, "2.0.0", 97.0);
    }
    let mut plan = plan("2.0.0", Strategy::Rolling, servers(5), 5);
    plan.post_deploy_monitor = true;

    let report = harness.deploy(plan).await;

    assert_eq!(report.record.status, DeploymentStatus::RolledBack);
    assert_eq!(report.final_state, RunState::RolledBack);
    let decision = report.decision.as_ref().unwrap();
    assert_eq!(decision.triggered_by, RollbackTrigger::ThresholdBreach);
    assert_eq!(decision.scope, RollbackScope::Environment);
    assert!(decision.reason.contains("3 of 5"));
    for spec in servers(5) {
        assert_eq!(harness.fleet.version_of(&spec.id).as_deref(), Some("1.0.0"));
        assert_eq!(harness.fleet.traffic_of(&spec.id), Some(TrafficState::Active));
    }
    assert_active_implies_healthy(&report);
}

#[tokio::test(start_paused = true)]
async fn test_breach_during_next_batch_covers_it() {
    let harness = Harness::with_baseline(&servers(4));
    harness.fleet.overload_cpu("web-01", "2.0.0", 97.0);
    harness.fleet.overload_cpu("web-02", "2.0.0", 97.0);
    let mut plan = plan("2.0.0", Strategy::Rolling, servers(4), 2);
    plan.post_deploy_monitor = true;

    let report = harness.deploy(plan).await;

    assert_eq!(report.record.status, DeploymentStatus::RolledBack);
    assert_eq!(report.decision.as_ref().unwrap().scope, RollbackScope::Environment);
    assert_eq!(report.batches_completed, 1);
    // Batch 2 was touched, so it is restored too.
    assert!(harness.deployed_to("web-03", "1.0.0"));
    for spec in servers(4) {
        assert_eq!(harness.fleet.version_of(&spec.id).as_deref(), Some("1.0.0"));
    }
    assert!(harness.fleet.violations().is_empty());
}

// =============================================================================
// Canary
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_canary_breach_leaves_rest_untouched() {
    let harness = Harness::with_baseline(&servers(20));
    harness.fleet.degrade_version("2.0.0", 12.0);
    let mut plan = plan("2.0.0", Strategy::Canary, servers(20), 4);
    plan.canary_percent = Some(10.0);
    plan.monitor_window_seconds = 300;
    plan.rollback_thresholds = RollbackThresholds {
        error_rate: 10.0,
        ..RollbackThresholds::default()
    };

    let report = harness.deploy(plan).await;

    assert_eq!(report.record.status, DeploymentStatus::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::ThresholdBreach);
    let decision = report.decision.as_ref().unwrap();
    assert_eq!(decision.scope, RollbackScope::Canary);
    assert_eq!(decision.triggered_by, RollbackTrigger::ThresholdBreach);

    let touched: Vec<String> = harness
        .fleet
        .deployed()
        .into_iter()
        .filter(|(_, v)| v == "2.0.0")
        .map(|(id, _)| id)
        .collect();
    assert_eq!(touched.len(), 2);
    assert!(touched.contains(&"web-01".to_string()));
    assert!(touched.contains(&"web-02".to_string()));
    for spec in servers(20) {
        assert_eq!(harness.fleet.version_of(&spec.id).as_deref(), Some("1.0.0"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_clean_canary_continues_to_rest() {
    let harness = Harness::with_baseline(&servers(10));
    let mut plan = plan("2.0.0", Strategy::Canary, servers(10), 4);
    plan.canary_percent = Some(20.0);

    let report = harness.deploy(plan).await;

    assert!(report.is_success());
    assert_eq!(report.batches_total, 3);
    assert_eq!(report.batches_completed, 3);
    for spec in servers(10) {
        assert_eq!(harness.fleet.version_of(&spec.id).as_deref(), Some("2.0.0"));
    }
    let transitions = harness.transitions();
    let first_watch = transitions.iter().position(|s| s == "Monitoring").unwrap();
    let second_batch = transitions
        .iter()
        .enumerate()
        .filter(|(_, s)| *s == "BatchInProgress")
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    assert!(first_watch < second_batch);
}

// =============================================================================
// Blue-green
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_blue_green_switches_pointer() {
    let harness = Harness::new(SimulatedFleet::blue_green(&slotted(), Slot::Blue, "1.0.0"), Vec::new());

    let report = harness
        .deploy(plan("2.0.0", Strategy::BlueGreen, slotted(), 1))
        .await;

    assert!(report.is_success());
    assert_eq!(report.record.active_slot, Some(Slot::Green));
    assert_eq!(harness.fleet.pointer(), Some(Slot::Green));
    for i in 1..=3 {
        assert_eq!(harness.fleet.version_of(&format!("green-{i}")).as_deref(), Some("2.0.0"));
        assert_eq!(harness.fleet.version_of(&format!("blue-{i}")).as_deref(), Some("1.0.0"));
    }
    let blue_touched = harness.fleet.calls().iter().any(|c| match c {
        FleetCall::Availability { server_id, .. } | FleetCall::Deploy { server_id, .. } => {
            server_id.starts_with("blue")
        }
        FleetCall::Switch(_) => false,
    });
    assert!(!blue_touched);
    assert_active_implies_healthy(&report);
    assert!(harness.fleet.violations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_blue_green_failed_tests_keep_pointer() {
    let harness = Harness::new(SimulatedFleet::blue_green(&slotted(), Slot::Blue, "1.0.0"), Vec::new());
    harness.fleet.fail_tests("checkout smoke test failed");

    let report = harness
        .deploy(plan("2.0.0", Strategy::BlueGreen, slotted(), 1))
        .await;

    assert_eq!(report.record.status, DeploymentStatus::Failed);
    assert_eq!(report.failure.as_ref().unwrap().kind, ErrorKind::DeploymentFailure);
    assert_eq!(harness.fleet.pointer(), Some(Slot::Blue));
    assert!(!harness.fleet.calls().iter().any(|c| matches!(c, FleetCall::Switch(_))));
}

#[tokio::test(start_paused = true)]
async fn test_blue_green_breach_switches_back() {
    let harness = Harness::new(SimulatedFleet::blue_green(&slotted(), Slot::Blue, "1.0.0"), Vec::new());
    harness.fleet.degrade_version("2.0.0", 40.0);
    let mut plan = plan("2.0.0", Strategy::BlueGreen, slotted(), 1);
    plan.post_deploy_monitor = true;

    let report = harness.deploy(plan).await;

    assert_eq!(report.record.status, DeploymentStatus::RolledBack);
    assert_eq!(report.record.active_slot, Some(Slot::Blue));
    assert_eq!(harness.fleet.pointer(), Some(Slot::Blue));
    let switches: Vec<FleetCall> = harness
        .fleet
        .calls()
        .into_iter()
        .filter(|c| matches!(c, FleetCall::Switch(_)))
        .collect();
    assert_eq!(switches, vec![FleetCall::Switch(Slot::Green), FleetCall::Switch(Slot::Blue)]);
    assert_active_implies_healthy(&report);
}

// =============================================================================
// Cancellation and mutual exclusion
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_rolls_back_touched_servers() {
    let harness = Harness::with_baseline(&servers(6));
    let cancel = CancellationToken::new();
    harness.fleet.cancel_on_deploy(3, cancel.clone());

    let report = harness
        .orchestrator
        .deploy(plan("2.0.0", Strategy::Rolling, servers(6), 2), cancel)
        .await
        .unwrap();

    assert_eq!(report.final_state, RunState::RolledBack);
    assert_eq!(report.record.status, DeploymentStatus::RolledBack);
    assert_eq!(
        report.decision.as_ref().unwrap().triggered_by,
        RollbackTrigger::OperatorCancel
    );
    assert!(!harness.deployed_to("web-05", "2.0.0"));
    for id in ["web-01", "web-02", "web-03", "web-04"] {
        assert_eq!(harness.fleet.version_of(id).as_deref(), Some("1.0.0"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_deploy_rejected() {
    let harness = Harness::with_baseline(&servers(4));
    let orchestrator = harness.orchestrator.clone();
    let first = tokio::spawn(async move {
        orchestrator
            .deploy(plan("2.0.0", Strategy::Rolling, servers(4), 2), CancellationToken::new())
            .await
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = harness
        .orchestrator
        .deploy(plan("2.1.0", Strategy::Rolling, servers(4), 2), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::DeploymentInProgress { .. }));
    assert_eq!(err.exit_code(), 1);

    let report = first.await.unwrap().unwrap();
    assert!(report.is_success());
    assert!(!harness.deployed_to("web-01", "2.1.0"));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_plan_touches_nothing() {
    let harness = Harness::with_baseline(&servers(2));

    let err = harness
        .orchestrator
        .deploy(plan("2.0.0", Strategy::Rolling, servers(2), 0), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
    assert_eq!(err.exit_code(), 2);
    assert!(harness.fleet.calls().is_empty());
}

// =============================================================================
// Manual rollback
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_manual_rollback_is_idempotent() {
    let harness = Harness::new(
        SimulatedFleet::new(&servers(4), "1.1.0"),
        vec![success("1.0.0", Strategy::Rolling, None)],
    );
    let inventory = plan("1.1.0", Strategy::Rolling, servers(4), 2);

    let first = harness.orchestrator.rollback(inventory.clone()).await.unwrap();
    let RollbackOutcome::Restored(record) = &first else {
        panic!("expected a restore, got {first:?}");
    };
    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert_eq!(record.version, "1.0.0");
    assert!(record.is_rollback());
    for spec in servers(4) {
        assert_eq!(harness.fleet.version_of(&spec.id).as_deref(), Some("1.0.0"));
    }
    let deploys = harness.fleet.deploy_count();

    let second = harness.orchestrator.rollback(inventory).await.unwrap();
    assert!(matches!(second, RollbackOutcome::AlreadyRestored(_)));
    assert_eq!(second.record().id, record.id);
    assert_eq!(harness.fleet.deploy_count(), deploys);
}

#[tokio::test(start_paused = true)]
async fn test_manual_rollback_without_history() {
    let harness = Harness::new(SimulatedFleet::new(&servers(2), "1.0.0"), Vec::new());

    let err = harness
        .orchestrator
        .rollback(plan("1.0.0", Strategy::Rolling, servers(2), 1))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NoRollbackTarget);
    assert!(harness.fleet.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_manual_blue_green_rollback_moves_pointer() {
    let harness = Harness::new(
        SimulatedFleet::blue_green(&slotted(), Slot::Green, "1.0.0"),
        vec![success("1.0.0", Strategy::BlueGreen, Some(Slot::Blue))],
    );

    let outcome = harness
        .orchestrator
        .rollback(plan("2.0.0", Strategy::BlueGreen, slotted(), 1))
        .await
        .unwrap();

    assert_eq!(outcome.record().active_slot, Some(Slot::Blue));
    assert_eq!(harness.fleet.pointer(), Some(Slot::Blue));
    assert_eq!(harness.fleet.deploy_count(), 0);
}

// =============================================================================
// Audit, events and status
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transitions_are_audited_and_event_published() {
    let harness = Harness::with_baseline(&servers(2));
    let mut events = harness.orchestrator.subscribe();

    let report = harness
        .deploy(plan("2.0.0", Strategy::Rolling, servers(2), 1))
        .await;

    let transitions = harness.transitions();
    assert_eq!(transitions.first().map(String::as_str), Some("Planning"));
    assert_eq!(transitions.last().map(String::as_str), Some("Completed"));
    assert_eq!(transitions.iter().filter(|s| *s == "BatchInProgress").count(), 2);
    for event in harness.audit.json_events() {
        if event.get("toState").is_some() {
            assert_eq!(event["environment"], ENV);
            assert!(event.get("fromState").is_some());
            assert!(event.get("timestamp").is_some());
        }
    }

    match events.try_recv().unwrap() {
        DeploymentEvent::Completed {
            deployment_id,
            version,
            ..
        } => {
            assert_eq!(deployment_id, report.record.id);
            assert_eq!(version, "2.0.0");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_status_reports_history_and_slot() {
    let harness = Harness::new(
        SimulatedFleet::blue_green(&slotted(), Slot::Green, "1.0.0"),
        vec![success("1.0.0", Strategy::BlueGreen, Some(Slot::Green))],
    );

    let status = harness
        .orchestrator
        .status(&plan("1.0.0", Strategy::BlueGreen, slotted(), 1))
        .await
        .unwrap();

    assert_eq!(status.active_slot, Some(Slot::Green));
    assert_eq!(status.servers.len(), 6);
    assert_eq!(status.last_success.as_ref().unwrap().version, "1.0.0");
    assert!(status.lock_holder.is_none());
}
