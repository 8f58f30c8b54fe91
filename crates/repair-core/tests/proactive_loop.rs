//! Proactive loop, schedules and the service facade.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use repair_core::notify::MESSAGE_SIGNAL_KIND;
use repair_core::{
    CyclePhase, FireResult, LoopConfig, NotificationTarget, ProactiveLoop, RepairError,
    RepairService, ScheduleManager, ScheduleSpec, Scheduler,
};
use repair_state::CycleStore;

use common::{fast_config, Harness, RecordingNotifier};

fn loop_config(interval: Duration, max_cycles: Option<u32>) -> LoopConfig {
    LoopConfig {
        interval,
        max_cycles,
        ..LoopConfig::default()
    }
}

// ── Loop ──

#[tokio::test(start_paused = true)]
async fn loop_runs_fresh_cycles_until_max() {
    let h = Harness::new(2, &[1.0]);
    let handle = ProactiveLoop::new(
        h.orchestrator.clone(),
        "watch",
        fast_config(),
        loop_config(Duration::from_secs(3600), Some(3)),
    )
    .unwrap()
    .spawn();

    let status = handle.wait().await.unwrap();
    assert!(status.finished);
    assert_eq!(status.iteration, 3);
    let runs: Vec<&str> = status.history.iter().map(|s| s.run_id.as_str()).collect();
    assert_eq!(runs, ["watch-cycle-1", "watch-cycle-2", "watch-cycle-3"]);
    assert!(status
        .history
        .iter()
        .all(|s| s.phase == Some(CyclePhase::ReportCompleted) && s.error.is_none()));
    assert_eq!(h.detector.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn history_is_bounded() {
    let h = Harness::new(1, &[1.0]);
    let config = LoopConfig {
        history_limit: 2,
        ..loop_config(Duration::from_secs(60), Some(5))
    };
    let status = ProactiveLoop::new(h.orchestrator.clone(), "short", fast_config(), config)
        .unwrap()
        .spawn()
        .wait()
        .await
        .unwrap();
    assert_eq!(status.iteration, 5);
    assert_eq!(status.history.len(), 2);
    assert_eq!(status.history.back().unwrap().run_id, "short-cycle-5");
}

#[tokio::test(start_paused = true)]
async fn same_problem_set_is_notified_once() {
    let h = Harness::new(2, &[1.0]);
    let notifier = Arc::new(RecordingNotifier::default());
    let status = ProactiveLoop::new(
        h.orchestrator.clone(),
        "dedupe",
        fast_config(),
        loop_config(Duration::from_secs(600), Some(3)),
    )
    .unwrap()
    .with_notifier(notifier.clone())
    .spawn()
    .wait()
    .await
    .unwrap();

    assert_eq!(notifier.count(), 1);
    let flags: Vec<bool> = status.history.iter().map(|s| s.notified).collect();
    assert_eq!(flags, [true, false, false]);
    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent[0].run_id, "dedupe-cycle-1");
    assert_eq!(sent[0].units.len(), 2);
}

#[tokio::test]
async fn request_exit_while_waiting_ends_the_loop() {
    let h = Harness::new(1, &[1.0]);
    let handle = ProactiveLoop::new(
        h.orchestrator.clone(),
        "exit",
        fast_config(),
        loop_config(Duration::from_secs(24 * 3600), None),
    )
    .unwrap()
    .spawn();

    let waiting = handle
        .wait_until(|s| s.phase == CyclePhase::WaitingForNextCycle)
        .await
        .unwrap();
    assert_eq!(waiting.iteration, 1);
    assert!(waiting.next_cycle_at.is_some());

    handle.request_exit().unwrap();
    let status = handle.wait().await.unwrap();
    assert!(status.finished);
    assert!(status.exit_requested);
    assert_eq!(status.iteration, 1);
}

#[tokio::test]
async fn stop_waiting_starts_the_next_cycle() {
    let h = Harness::new(1, &[1.0]);
    let handle = ProactiveLoop::new(
        h.orchestrator.clone(),
        "nudge",
        fast_config(),
        loop_config(Duration::from_secs(24 * 3600), Some(2)),
    )
    .unwrap()
    .spawn();

    handle
        .wait_until(|s| s.phase == CyclePhase::WaitingForNextCycle)
        .await
        .unwrap();
    handle.stop_waiting().unwrap();

    let status = handle.wait().await.unwrap();
    assert_eq!(status.iteration, 2);
    assert_eq!(status.history.len(), 2);
}

#[tokio::test]
async fn exit_requested_mid_cycle_finishes_that_cycle_first() {
    let h = Harness::new(1, &[0.5]);
    let handle = ProactiveLoop::new(
        h.orchestrator.clone(),
        "midway",
        fast_config(),
        loop_config(Duration::from_secs(60), None),
    )
    .unwrap()
    .spawn();

    handle
        .wait_until(|s| s.phase == CyclePhase::PendingApproval)
        .await
        .unwrap();
    handle.request_exit().unwrap();
    handle
        .wait_until(|s| s.exit_requested)
        .await
        .unwrap();

    h.orchestrator
        .signal_approval(
            "midway-cycle-1",
            repair_core::ApprovalSignal::approve(Some("frank".into()), None),
        )
        .await
        .unwrap();
    let status = handle.wait().await.unwrap();
    assert_eq!(status.iteration, 1);
    assert_eq!(status.history[0].phase, Some(CyclePhase::ReportCompleted));
    assert_eq!(status.history[0].repaired, 1);
}

// ── Schedules ──

#[tokio::test]
async fn schedule_skips_firing_while_previous_run_is_unfinished() {
    let h = Harness::new(1, &[0.5]);
    let scheduler = Scheduler::new(h.orchestrator.clone(), Duration::from_secs(1));
    scheduler
        .manager()
        .create(ScheduleSpec::new("every-minute", Duration::from_secs(60)).with_cycle(fast_config()))
        .await
        .unwrap();

    let t1 = Utc::now() + chrono::Duration::minutes(2);
    let results = scheduler.tick_once(t1).await.unwrap();
    let first_run = format!("every-minute-{}", t1.timestamp());
    assert_eq!(
        results,
        vec![(
            "every-minute".to_string(),
            FireResult::Fired {
                run_id: first_run.clone()
            }
        )]
    );

    let t2 = t1 + chrono::Duration::minutes(2);
    let results = scheduler.tick_once(t2).await.unwrap();
    assert_eq!(
        results[0].1,
        FireResult::SkippedOverlap {
            previous_run_id: first_run.clone()
        }
    );

    h.orchestrator.cancel(&first_run).await.unwrap();
    for _ in 0..200 {
        if h.orchestrator.query_status(&first_run).await.unwrap().is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let t3 = t2 + chrono::Duration::minutes(2);
    let results = scheduler.tick_once(t3).await.unwrap();
    assert_eq!(
        results[0].1,
        FireResult::Fired {
            run_id: format!("every-minute-{}", t3.timestamp())
        }
    );
    let status = h.orchestrator.query_status(&first_run).await.unwrap();
    assert_eq!(status.correlation_id.as_deref(), Some("every-minute"));
}

#[tokio::test]
async fn manual_trigger_fires_immediately() {
    let h = Harness::new(1, &[1.0]);
    let manager = ScheduleManager::new(h.orchestrator.clone());
    manager
        .create(ScheduleSpec::new("nightly", Duration::from_secs(86_400)).with_cycle(fast_config()))
        .await
        .unwrap();

    let FireResult::Fired { run_id } = manager.trigger("nightly").await.unwrap() else {
        panic!("expected a firing");
    };
    assert!(run_id.starts_with("nightly-"));
    let view = manager.describe("nightly").await.unwrap();
    assert_eq!(view.last_run_id.as_deref(), Some(run_id.as_str()));

    manager.delete("nightly").await.unwrap();
    let err = manager.trigger("nightly").await.unwrap_err();
    assert!(matches!(err, RepairError::ScheduleNotFound { .. }));
}

// ── Service ──

#[tokio::test]
async fn proactive_callback_forwards_into_another_inbox() {
    let h = Harness::new(2, &[1.0]);
    let service = RepairService::new(h.orchestrator.clone(), "harry")
        .with_cycle_config(fast_config())
        .with_loop_config(loop_config(Duration::from_secs(3600), Some(1)));

    let started = service
        .initiate_proactive(Some(NotificationTarget::Signal {
            run_id: "watcher".into(),
        }))
        .await
        .unwrap();
    assert!(started.proactive);
    let correlation_id = started.correlation_id.unwrap();
    assert!(correlation_id.starts_with("proactive-harry-"));
    assert_eq!(started.run_id, format!("{correlation_id}-cycle-1"));

    for _ in 0..200 {
        if service.loop_status(&correlation_id).unwrap().finished {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = service.loop_status(&correlation_id).unwrap();
    assert!(status.finished);

    let inbox = h.store.take_signals("watcher", MESSAGE_SIGNAL_KIND).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].payload["correlation_id"], correlation_id.as_str());
}

#[tokio::test]
async fn service_approve_and_report() {
    let h = Harness::new(2, &[0.7]);
    let service = RepairService::new(h.orchestrator.clone(), "ginny").with_cycle_config(fast_config());

    let started = service.initiate_repair().await.unwrap();
    let run_id = started.run_id;
    for _ in 0..200 {
        if service.status(&run_id).await.unwrap().phase == CyclePhase::PendingApproval {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let plan = service.describe_plan(&run_id).await.unwrap();
    assert_eq!(plan.plan.unwrap().action_count(), 2);
    let confidence = service.problems_confidence(&run_id).await.unwrap();
    assert_eq!(confidence.problems_confidence_percent, Some(90.0));

    service
        .approve(&run_id, None, Some("checked with the warehouse".to_string()))
        .await
        .unwrap();
    for _ in 0..200 {
        if service.status(&run_id).await.unwrap().is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = service.status(&run_id).await.unwrap();
    let approval = status.approval.unwrap();
    assert_eq!(approval.actor.as_deref(), Some("ginny"));
    assert_eq!(approval.note.as_deref(), Some("checked with the warehouse"));
    let report = service.report(&run_id).await.unwrap().unwrap();
    assert_eq!(report.repaired, 2);

    let orders = service.get_orders().await.unwrap();
    assert!(orders
        .orders
        .iter()
        .all(|o| o.status == "approved-preparing-shipment"));
}
