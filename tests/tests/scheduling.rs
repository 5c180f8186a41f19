//! End-to-end scheduling scenarios on a paused clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use accel_foundation::{RetryConfig, Scheduler};
use accel_kernel::{ModelDescriptor, ModelRegistry, RunStatus, SchedulerError, run_fn};
use accel_testing::{
    MockGateway, ScriptedExecutor, assert_gateway_calls, wait_for_status, wait_for_terminal,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const TEN_MIN: Duration = Duration::from_secs(600);

fn registry(models: Vec<ModelDescriptor>) -> ModelRegistry {
    ModelRegistry::from_descriptors(models).unwrap()
}

fn scheduler(budget: u64, models: Vec<ModelDescriptor>, gateway: &MockGateway) -> Scheduler {
    Scheduler::builder(registry(models), Arc::new(gateway.clone()), budget)
        .build()
        .unwrap()
}

fn sleeper(secs: u64) -> accel_kernel::RunFn {
    run_fn(move || async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(json!({ "slept": secs }))
    })
}

#[tokio::test(start_paused = true)]
async fn idle_model_is_evicted_for_another() {
    accel_testing::init_tracing();
    let gateway = MockGateway::new();
    let s = scheduler(
        32,
        vec![
            ModelDescriptor::on_demand("aurora", 20, TEN_MIN),
            ModelDescriptor::on_demand("graphcast", 20, TEN_MIN),
        ],
        &gateway,
    );

    let a = s.submit("aurora", run_fn(|| async { Ok(json!("a")) }));
    wait_for_status(&s, &a, RunStatus::Completed).await;

    let b = s.submit("graphcast", run_fn(|| async { Ok(json!("b")) }));
    wait_for_status(&s, &b, RunStatus::Completed).await;

    assert_gateway_calls!(gateway, ["activate aurora", "deactivate aurora", "activate graphcast"]);

    let stats = s.stats().await;
    assert_eq!(stats.used, 20);
    assert_eq!(stats.active_models, 1);
    assert_eq!(stats.completed_runs, 2);
    assert!(!gateway.is_active("aurora").await);
}

#[tokio::test(start_paused = true)]
async fn always_on_model_blocks_admission_when_budget_is_short() {
    let gateway = MockGateway::new();
    let s = scheduler(
        10,
        vec![
            ModelDescriptor::always_on("fcn3", 10),
            ModelDescriptor::on_demand("tc_tracker", 5, TEN_MIN),
        ],
        &gateway,
    );
    s.start().await;

    let run = s.submit("tc_tracker", sleeper(1));
    let record = wait_for_status(&s, &run, RunStatus::Failed).await;
    assert_eq!(
        record.error,
        Some(SchedulerError::InsufficientBudget {
            model_id: "tc_tracker".into(),
            required: 5,
            available: 0,
        })
    );
    assert!(record.started_at.is_none());

    assert_gateway_calls!(gateway, ["activate fcn3"]);
    assert_eq!(s.stats().await.used, 10);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_extends_idle_window() {
    let gateway = MockGateway::new();
    let s = scheduler(
        32,
        vec![ModelDescriptor::on_demand(
            "stormcast",
            16,
            Duration::from_secs(5),
        )],
        &gateway,
    );

    s.ensure_active("stormcast").await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(s.heartbeat("stormcast").await.unwrap());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(gateway.is_active("stormcast").await, "reaped too early");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!gateway.is_active("stormcast").await);
    assert_eq!(s.stats().await.used, 0);

    // Heartbeat never reactivates.
    assert!(!s.heartbeat("stormcast").await.unwrap());
    assert_eq!(gateway.activation_count("stormcast").await, 1);
}

#[tokio::test(start_paused = true)]
async fn queued_run_can_be_cancelled() {
    let gateway = MockGateway::new();
    let s = Scheduler::builder(
        registry(vec![
            ModelDescriptor::on_demand("atlas", 12, TEN_MIN),
            ModelDescriptor::on_demand("sfno", 12, TEN_MIN),
        ]),
        Arc::new(gateway.clone()),
        32,
    )
    .max_concurrent_runs(1)
    .build()
    .unwrap();

    let first = s.submit("atlas", sleeper(10));
    wait_for_status(&s, &first, RunStatus::Running).await;

    let executed = Arc::new(AtomicBool::new(false));
    let flag = executed.clone();
    let second = s.submit(
        "sfno",
        run_fn(move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(json!(null))
        }),
    );

    assert!(s.cancel_run(&second));
    let record = wait_for_status(&s, &second, RunStatus::Failed).await;
    assert_eq!(record.error, Some(SchedulerError::Cancelled));
    assert!(record.started_at.is_none());

    // The running run is past the queue and cannot be cancelled.
    assert!(!s.cancel_run(&first));
    wait_for_status(&s, &first, RunStatus::Completed).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(!executed.load(Ordering::SeqCst));
    assert_eq!(gateway.activation_count("sfno").await, 0);
    assert!(!gateway.is_active("sfno").await);
    assert_gateway_calls!(gateway, ["activate atlas"]);
}

#[tokio::test(start_paused = true)]
async fn caller_token_cancels_queued_run() {
    let gateway = MockGateway::new();
    let s = Scheduler::builder(
        registry(vec![ModelDescriptor::on_demand("atlas", 12, TEN_MIN)]),
        Arc::new(gateway.clone()),
        32,
    )
    .max_concurrent_runs(1)
    .build()
    .unwrap();

    let blocker = s.submit("atlas", sleeper(10));
    wait_for_status(&s, &blocker, RunStatus::Running).await;

    let token = CancellationToken::new();
    let queued = s.submit_with_cancel("atlas", sleeper(1), token.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    let record = wait_for_terminal(&s, &queued).await;
    assert_eq!(record.error, Some(SchedulerError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn queue_timeout_fails_waiting_runs() {
    let gateway = MockGateway::new();
    let s = Scheduler::builder(
        registry(vec![ModelDescriptor::on_demand("atlas", 12, TEN_MIN)]),
        Arc::new(gateway.clone()),
        32,
    )
    .max_concurrent_runs(1)
    .queue_timeout(Some(Duration::from_secs(5)))
    .build()
    .unwrap();

    let blocker = s.submit("atlas", sleeper(60));
    wait_for_status(&s, &blocker, RunStatus::Running).await;
    let waiting = s.submit("atlas", sleeper(1));

    let record = wait_for_terminal(&s, &waiting).await;
    assert_eq!(record.error, Some(SchedulerError::Cancelled));
    assert_eq!(s.get_run(&blocker).unwrap().status, RunStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_never_exceed_limit() {
    let gateway = MockGateway::new();
    let s = Scheduler::builder(
        registry(vec![ModelDescriptor::on_demand("atlas", 12, TEN_MIN)]),
        Arc::new(gateway.clone()),
        32,
    )
    .max_concurrent_runs(3)
    .build()
    .unwrap();

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let ids: Vec<_> = (0..10)
        .map(|_| {
            let current = current.clone();
            let peak = peak.clone();
            s.submit(
                "atlas",
                run_fn(move || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }),
            )
        })
        .collect();

    for id in &ids {
        wait_for_status(&s, id, RunStatus::Completed).await;
    }
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(gateway.activation_count("atlas").await, 1);
    assert_eq!(s.stats().await.completed_runs, 10);
}

#[tokio::test(start_paused = true)]
async fn busy_model_is_never_evicted() {
    let gateway = MockGateway::new();
    let s = scheduler(
        32,
        vec![
            ModelDescriptor::on_demand("aurora", 20, TEN_MIN),
            ModelDescriptor::on_demand("graphcast", 20, TEN_MIN),
        ],
        &gateway,
    );

    let long = s.submit("aurora", sleeper(30));
    wait_for_status(&s, &long, RunStatus::Running).await;

    let blocked = s.submit("graphcast", sleeper(1));
    let record = wait_for_status(&s, &blocked, RunStatus::Failed).await;
    assert!(matches!(
        record.error,
        Some(SchedulerError::InsufficientBudget { .. })
    ));
    assert!(gateway.is_active("aurora").await);

    wait_for_status(&s, &long, RunStatus::Completed).await;
    let retry = s.submit("graphcast", sleeper(1));
    wait_for_status(&s, &retry, RunStatus::Completed).await;
    assert!(!gateway.is_active("aurora").await);
}

#[tokio::test(start_paused = true)]
async fn transient_activation_failures_are_retried() {
    let gateway = MockGateway::new();
    gateway.fail_activation_times("pangu", 2).await;
    let s = Scheduler::builder(
        registry(vec![ModelDescriptor::on_demand("pangu", 16, TEN_MIN)]),
        Arc::new(gateway.clone()),
        32,
    )
    .activation_retry(RetryConfig::fixed(3, 500))
    .build()
    .unwrap();

    let run = s.submit("pangu", sleeper(1));
    wait_for_status(&s, &run, RunStatus::Completed).await;
    assert_eq!(gateway.activation_count("pangu").await, 3);
    assert_eq!(s.stats().await.used, 16);
}

#[tokio::test(start_paused = true)]
async fn failed_activation_reserves_nothing() {
    let gateway = MockGateway::new();
    gateway.fail_activation("fuxi").await;
    let s = scheduler(
        32,
        vec![ModelDescriptor::on_demand("fuxi", 14, TEN_MIN)],
        &gateway,
    );

    let run = s.submit("fuxi", sleeper(1));
    let record = wait_for_status(&s, &run, RunStatus::Failed).await;
    assert!(matches!(
        record.error,
        Some(SchedulerError::ActivationFailed { .. })
    ));
    assert_eq!(s.stats().await.used, 0);
    assert_eq!(gateway.activation_count("fuxi").await, 1);
}

#[tokio::test(start_paused = true)]
async fn payload_runs_go_through_the_executor() {
    let gateway = MockGateway::new();
    let executor = ScriptedExecutor::new().with_delay(Duration::from_secs(2));
    executor.set_output("sfno", json!({ "frames": 40 })).await;
    executor.set_failure("corrdiff", "out of memory").await;

    let s = Scheduler::builder(
        registry(vec![
            ModelDescriptor::on_demand("sfno", 12, TEN_MIN),
            ModelDescriptor::on_demand("corrdiff", 14, TEN_MIN),
        ]),
        Arc::new(gateway.clone()),
        32,
    )
    .executor(Arc::new(executor.clone()))
    .build()
    .unwrap();

    let ok = s.submit_run("sfno", json!({ "lead_hours": 6 }));
    let bad = s.submit_run("corrdiff", json!({ "region": "conus" }));

    let record = wait_for_status(&s, &ok, RunStatus::Completed).await;
    assert_eq!(record.output, Some(json!({ "frames": 40 })));
    assert!(record.duration().is_some());

    let record = wait_for_status(&s, &bad, RunStatus::Failed).await;
    assert_eq!(
        record.error,
        Some(SchedulerError::ExecutionFailed {
            reason: "out of memory".into()
        })
    );
    assert_eq!(executor.history().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn start_adopts_reported_models() {
    let gateway = MockGateway::new();
    gateway.preactivate(&["pangu", "fcn3", "legacy"]).await;
    let s = scheduler(
        32,
        vec![
            ModelDescriptor::always_on("fcn3", 8),
            ModelDescriptor::always_on("stormscope", 6),
            ModelDescriptor::on_demand("pangu", 16, TEN_MIN),
        ],
        &gateway,
    );

    let report = s.start().await;
    assert_eq!(report.adoption.adopted, vec!["fcn3", "pangu"]);
    assert_eq!(report.adoption.unknown, vec!["legacy"]);
    assert_eq!(report.activated, vec!["stormscope"]);

    assert_gateway_calls!(gateway, ["activate stormscope"]);
    assert_eq!(s.stats().await.used, 30);
}

#[tokio::test(start_paused = true)]
async fn administrative_deactivation_rules() {
    let gateway = MockGateway::new();
    let s = scheduler(
        32,
        vec![
            ModelDescriptor::always_on("fcn3", 8),
            ModelDescriptor::on_demand("atlas", 12, TEN_MIN),
        ],
        &gateway,
    );
    s.start().await;

    assert_eq!(
        s.deactivate("fcn3").await,
        Err(SchedulerError::CannotDeactivateAlwaysOn {
            model_id: "fcn3".into()
        })
    );
    assert_eq!(
        s.deactivate("graphcast").await,
        Err(SchedulerError::model_not_found("graphcast"))
    );

    let run = s.submit("atlas", sleeper(10));
    wait_for_status(&s, &run, RunStatus::Running).await;
    assert!(matches!(
        s.deactivate("atlas").await,
        Err(SchedulerError::ModelBusy { .. })
    ));

    wait_for_status(&s, &run, RunStatus::Completed).await;
    s.deactivate("atlas").await.unwrap();
    assert_eq!(s.stats().await.used, 8);
}

#[tokio::test(start_paused = true)]
async fn ledger_tracks_active_set_through_mixed_workload() {
    let gateway = MockGateway::new();
    let s = scheduler(
        32,
        vec![
            ModelDescriptor::always_on("fcn3", 8),
            ModelDescriptor::on_demand("atlas", 12, TEN_MIN),
            ModelDescriptor::on_demand("corrdiff", 14, TEN_MIN),
            ModelDescriptor::on_demand("tc_tracker", 8, TEN_MIN),
            ModelDescriptor::on_demand("aurora", 20, TEN_MIN),
        ],
        &gateway,
    );
    s.start().await;

    for model in ["atlas", "tc_tracker", "corrdiff", "aurora", "atlas", "tc_tracker"] {
        let run = s.submit(model, sleeper(1));
        wait_for_terminal(&s, &run).await;

        let models = s.list_models().await;
        let stats = s.stats().await;
        let active_cost: u64 = models
            .iter()
            .filter(|m| m.active)
            .map(|m| m.memory_cost)
            .sum();
        assert_eq!(stats.used, active_cost, "after run on {model}");
        assert!(stats.used <= stats.total_budget);
        assert!(models.iter().any(|m| m.model_id == "fcn3" && m.active));
    }
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_and_deactivates() {
    accel_testing::init_tracing();
    let gateway = MockGateway::new();
    let s = Scheduler::builder(
        registry(vec![
            ModelDescriptor::always_on("fcn3", 8),
            ModelDescriptor::on_demand("atlas", 12, TEN_MIN),
        ]),
        Arc::new(gateway.clone()),
        32,
    )
    .max_concurrent_runs(1)
    .build()
    .unwrap();
    s.start().await;

    let running = s.submit("atlas", sleeper(5));
    wait_for_status(&s, &running, RunStatus::Running).await;
    let queued = s.submit("atlas", sleeper(1));

    let report = s.shutdown().await;
    assert_eq!(report.cancelled_runs, 1);
    assert_eq!(report.deactivated, vec!["fcn3", "atlas"]);

    assert_eq!(s.get_run(&running).unwrap().status, RunStatus::Completed);
    assert_eq!(
        s.get_run(&queued).unwrap().error,
        Some(SchedulerError::Cancelled)
    );
    assert!(!gateway.is_active("fcn3").await);
    assert!(!gateway.is_active("atlas").await);

    let late = s.submit("fcn3", sleeper(1));
    assert_eq!(
        s.get_run(&late).unwrap().error,
        Some(SchedulerError::ShuttingDown)
    );
    assert_eq!(
        s.ensure_active("fcn3").await.unwrap_err(),
        SchedulerError::ShuttingDown
    );
}

#[tokio::test(start_paused = true)]
async fn old_finished_runs_are_pruned_while_live_runs_stay() {
    let gateway = MockGateway::new();
    let s = Scheduler::builder(
        registry(vec![ModelDescriptor::on_demand("atlas", 12, TEN_MIN)]),
        Arc::new(gateway.clone()),
        32,
    )
    .max_concurrent_runs(1)
    .build()
    .unwrap();

    let mut finished = Vec::new();
    for i in 0..50 {
        let id = if i % 5 == 0 {
            s.submit("atlas", run_fn(|| async { Err("bad input".to_string()) }))
        } else {
            s.submit("atlas", run_fn(|| async { Ok(json!(null)) }))
        };
        wait_for_terminal(&s, &id).await;
        finished.push(id);
    }

    let running = s.submit("atlas", sleeper(7_200));
    wait_for_status(&s, &running, RunStatus::Running).await;
    let queued = s.submit("atlas", sleeper(1));

    tokio::time::sleep(Duration::from_secs(3_600)).await;
    assert_eq!(s.prune_finished(TEN_MIN), 50);

    assert!(finished.iter().all(|id| s.get_run(id).is_none()));
    assert_eq!(s.get_run(&running).unwrap().status, RunStatus::Running);
    assert_eq!(s.get_run(&queued).unwrap().status, RunStatus::Pending);
    assert_eq!(s.list_runs().len(), 2);

    // Nothing left old enough to drop.
    assert_eq!(s.prune_finished(TEN_MIN), 0);
    s.shutdown().await;
}
