// tests/phase_and_trigger.rs

use std::time::Duration;

use tokio::sync::mpsc;

use fieldgen::errors::TriggerError;
use fieldgen::schedule::{KeyPhase, PhaseTable, SchedulerEvent, TaskTrigger, TokioTaskTrigger};

#[test]
fn phases_follow_the_run_cycle() {
    let mut phases = PhaseTable::new();
    assert_eq!(phases.phase(1), KeyPhase::Idle);

    assert!(phases.arm(1));
    assert!(!phases.arm(1), "already armed");
    assert!(phases.start(1));
    assert!(!phases.arm(1), "running fields are flagged, not armed");

    assert!(phases.finish(1, true, false));
    assert_eq!(phases.phase(1), KeyPhase::Armed);
    assert!(phases.start(1));
    assert!(phases.finish(1, false, false));
    assert_eq!(phases.phase(1), KeyPhase::Idle);
    assert!(phases.is_idle());
}

#[test]
fn disabled_wins_over_reschedule_until_enabled() {
    let mut phases = PhaseTable::new();
    assert!(phases.start(2), "timers armed elsewhere are accepted");
    assert!(phases.finish(2, true, true));
    assert_eq!(phases.phase(2), KeyPhase::Disabled);
    assert!(phases.is_idle());
    assert!(!phases.arm(2));

    assert!(phases.enable(2));
    assert!(!phases.enable(2));
    assert!(phases.arm(2));
    assert_eq!(phases.count(KeyPhase::Armed), 1);

    phases.disable(2);
    assert_eq!(phases.count(KeyPhase::Disabled), 1);
}

#[test]
fn finish_without_start_is_ignored() {
    let mut phases = PhaseTable::new();
    assert!(!phases.finish(3, false, false));
    assert!(phases.arm(3));
    assert!(!phases.finish(3, false, false));
    assert_eq!(phases.phase(3), KeyPhase::Armed);
}

#[tokio::test(start_paused = true)]
async fn trigger_fires_once_per_pending_field() {
    let (tx, mut rx) = mpsc::channel(8);
    let trigger = TokioTaskTrigger::new(tx);

    trigger.schedule(1, Duration::from_secs(3)).unwrap();
    assert_eq!(
        trigger.schedule(1, Duration::from_secs(1)),
        Err(TriggerError::Duplicate(1))
    );
    trigger.schedule(2, Duration::from_secs(1)).unwrap();
    assert!(trigger.is_pending(1));

    assert_eq!(rx.recv().await, Some(SchedulerEvent::TimerFired { field: 2 }));
    assert_eq!(rx.recv().await, Some(SchedulerEvent::TimerFired { field: 1 }));
    assert!(!trigger.is_pending(1));

    // Once fired, the field can be armed again.
    trigger.schedule(1, Duration::ZERO).unwrap();
    assert_eq!(rx.recv().await, Some(SchedulerEvent::TimerFired { field: 1 }));
}

#[tokio::test(start_paused = true)]
async fn trigger_refuses_when_the_runtime_is_gone() {
    let (tx, rx) = mpsc::channel(8);
    let trigger = TokioTaskTrigger::new(tx);
    drop(rx);

    assert_eq!(trigger.schedule(1, Duration::from_secs(1)), Err(TriggerError::Closed));
    assert!(!trigger.is_pending(1));
}

#[test]
fn trigger_outside_a_runtime_is_closed() {
    let (tx, _rx) = mpsc::channel(8);
    let trigger = TokioTaskTrigger::new(tx);
    assert_eq!(trigger.schedule(1, Duration::ZERO), Err(TriggerError::Closed));
}
