//! End-to-end pipeline runs against in-process collaborators

use crate::support::{
    controller, initial_state, profile_ids, stepping_guard, FakeDriver, FakeEdgeStore, Harness,
};
use chrono::{TimeZone, Utc};
use connection_harvest::checkpoint::{CheckpointStore, SqliteCheckpointStore};
use connection_harvest::collaborators::CollaboratorError;
use connection_harvest::pipeline::{run_pipeline, PipelineSettings, RunOutcome, RunReport};
use connection_harvest::recovery::{FailureClass, HealingPlan};
use connection_harvest::state::{
    ActionBudgetGuard, AdvisoryCeilings, Category, HealPhase, RunState,
};
use connection_harvest::HarvestError;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn no_stop() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

async fn run_once(
    harness: &Harness,
    state: RunState,
    store: &mut SqliteCheckpointStore,
    guard: &mut ActionBudgetGuard,
) -> connection_harvest::Result<RunOutcome> {
    run_pipeline(
        state,
        harness.collaborators(),
        store,
        guard,
        &PipelineSettings::default(),
        &controller(3),
        no_stop(),
    )
    .await
}

fn expect_completed(outcome: RunOutcome) -> RunReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {:?}", other),
    }
}

fn expect_healing(outcome: RunOutcome) -> HealingPlan {
    match outcome {
        RunOutcome::Healing(plan) => plan,
        other => panic!("expected a healing plan, got {:?}", other),
    }
}

#[tokio::test]
async fn test_crash_mid_batch_resumes_at_failed_item() {
    let harness = Harness::new(FakeDriver::with_mutuals(150).fail_once(
        "p130",
        CollaboratorError::SessionCrashed("browser tab died".to_string()),
    ));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let plan = expect_healing(
        run_once(&harness, initial_state(), &mut store, &mut guard)
            .await
            .unwrap(),
    );

    assert_eq!(plan.class, FailureClass::Session);
    assert_eq!(plan.state.heal_phase, Some(HealPhase::Session));
    assert_eq!(plan.state.attempt_count, 1);
    assert_eq!(plan.state.current_category, Some(Category::Mutual));
    assert_eq!(plan.state.current_batch, 1);
    assert_eq!(plan.state.current_index, 30);
    assert_eq!(plan.state.completed_batches, BTreeSet::from([0]));
    assert_eq!(harness.store.len(), 130);

    // The committed batch is durable in the checkpoint
    let handle = plan.state.checkpoint_handle.clone().unwrap();
    let index = store.load_index(&handle).unwrap();
    let mutual = index.category(Category::Mutual).unwrap();
    assert_eq!(mutual.total_entities, 150);
    assert_eq!(mutual.completed_batches, BTreeSet::from([0]));

    harness.driver.clear_fetched();
    let report = expect_completed(
        run_once(&harness, plan.state, &mut store, &mut guard)
            .await
            .unwrap(),
    );

    let expected: Vec<String> = (130..150).map(|i| format!("p{}", i)).collect();
    assert_eq!(harness.driver.fetched(), expected);
    assert_eq!(report.processed(), 20);
    assert_eq!(report.errors(), 0);
    assert_eq!(report.ingested, 20);
    assert_eq!(harness.store.len(), 150);
    assert_eq!(report.state.current_category, None);
    assert_eq!(report.state.attempt_count, 1);

    // The enumeration was not repeated on resume
    let mutual_enumerations = harness
        .driver
        .resumes
        .lock()
        .unwrap()
        .iter()
        .filter(|(category, _)| *category == Category::Mutual)
        .count();
    assert_eq!(mutual_enumerations, 1);
}

#[tokio::test]
async fn test_existing_edges_are_skipped() {
    let existing = profile_ids(50);
    let harness = Harness::with_store(
        FakeDriver::with_mutuals(60),
        FakeEdgeStore::preloaded(&existing),
    );
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let report = expect_completed(
        run_once(&harness, initial_state(), &mut store, &mut guard)
            .await
            .unwrap(),
    );

    assert_eq!(report.skipped(), 50);
    assert_eq!(report.processed(), 10);
    assert_eq!(harness.driver.fetched().len(), 10);
    assert!(harness.driver.fetched().iter().all(|id| !existing.contains(id)));
}

#[tokio::test]
async fn test_rerunning_finished_checkpoint_fetches_nothing() {
    let harness = Harness::new(FakeDriver::with_mutuals(12));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let first = expect_completed(
        run_once(&harness, initial_state(), &mut store, &mut guard)
            .await
            .unwrap(),
    );
    assert_eq!(first.processed(), 12);

    harness.driver.clear_fetched();
    let second = expect_completed(
        run_once(&harness, first.state, &mut store, &mut guard)
            .await
            .unwrap(),
    );

    assert!(harness.driver.fetched().is_empty());
    assert_eq!(second.processed(), 0);
    assert!(second.batches.is_empty());
}

#[tokio::test]
async fn test_missing_profile_is_recorded_and_run_continues() {
    let harness = Harness::new(FakeDriver::with_mutuals(10).fail_always(
        "p5",
        CollaboratorError::Other("profile not found".to_string()),
    ));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let report = expect_completed(
        run_once(&harness, initial_state(), &mut store, &mut guard)
            .await
            .unwrap(),
    );

    assert_eq!(report.processed(), 9);
    assert_eq!(report.errors(), 1);
    assert!(harness.store.edge("p5").is_none());
    assert!(harness.store.edge("p6").is_some());
    assert_eq!(harness.monitor.statistics().errors, 1);
}

#[tokio::test]
async fn test_budget_exhaustion_hands_off_with_cooling_off() {
    let harness = Harness::new(FakeDriver::with_mutuals(10));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();

    // Frozen clock: every action lands in the same minute
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let mut guard = ActionBudgetGuard::with_advisory(AdvisoryCeilings {
        per_minute: Some(3),
        ..Default::default()
    })
    .with_clock(Arc::new(move || now));

    let plan = expect_healing(
        run_once(&harness, initial_state(), &mut store, &mut guard)
            .await
            .unwrap(),
    );

    // login, enumerate mutual, p0; p1 is refused
    assert_eq!(plan.class, FailureClass::AdmissionDenied);
    assert_eq!(plan.state.heal_phase, Some(HealPhase::RateLimitCooldown));
    assert!(plan.cooling_off >= Duration::from_secs(60));
    assert_eq!(plan.state.current_batch, 0);
    assert_eq!(plan.state.current_index, 1);
    assert_eq!(harness.driver.fetched(), vec!["p0".to_string()]);
    assert_eq!(guard.log_len(), 3);
}

#[tokio::test]
async fn test_unknown_checkpoint_is_not_healed() {
    let harness = Harness::new(FakeDriver::with_mutuals(5));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let mut state = initial_state();
    state.checkpoint_handle = Some("no-such-checkpoint".to_string());

    let error = run_once(&harness, state, &mut store, &mut guard)
        .await
        .unwrap_err();

    assert!(matches!(error, HarvestError::Checkpoint(_)));
    assert!(harness.driver.fetched().is_empty());
}

#[tokio::test]
async fn test_invalid_state_is_rejected_before_any_action() {
    let harness = Harness::new(FakeDriver::with_mutuals(5));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let mut state = initial_state();
    state.credentials_ref = None;

    let error = run_once(&harness, state, &mut store, &mut guard)
        .await
        .unwrap_err();

    assert!(matches!(error, HarvestError::InvalidState(_)));
    assert!(harness.driver.logins.lock().unwrap().is_empty());
    assert_eq!(guard.log_len(), 0);
}

#[tokio::test]
async fn test_interrupted_enumeration_resumes_from_partial_list() {
    let harness = Harness::new(FakeDriver::with_mutuals(40).interrupt_once(
        Category::Mutual,
        CollaboratorError::EnumerationInterrupted {
            expansion_passes: 2,
            partial: profile_ids(10),
            reason: "show more button stopped responding".to_string(),
        },
    ));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let plan = expect_healing(
        run_once(&harness, initial_state(), &mut store, &mut guard)
            .await
            .unwrap(),
    );

    assert_eq!(plan.class, FailureClass::Enumeration);
    assert_eq!(plan.state.heal_phase, Some(HealPhase::ListCreation));
    let list_creation = plan.state.list_creation.clone().unwrap();
    assert_eq!(list_creation.category, Category::Mutual);
    assert_eq!(list_creation.expansion_passes, 2);
    assert!(list_creation.partial_ref.is_some());
    assert!(harness.driver.fetched().is_empty());

    let report = expect_completed(
        run_once(&harness, plan.state, &mut store, &mut guard)
            .await
            .unwrap(),
    );

    let resumes = harness.driver.resumes.lock().unwrap().clone();
    let (category, resume) = &resumes[1];
    assert_eq!(*category, Category::Mutual);
    let resume = resume.as_ref().unwrap();
    assert_eq!(resume.expansion_passes, 2);
    assert_eq!(resume.known, profile_ids(10));

    assert_eq!(report.processed(), 40);
    assert!(report.state.list_creation.is_none());
}

#[tokio::test]
async fn test_stop_flag_leaves_state_at_next_item() {
    let stop = Arc::new(AtomicBool::new(false));
    let harness = Harness::new(FakeDriver::with_mutuals(10).stop_after("p4", stop.clone()));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let outcome = run_pipeline(
        initial_state(),
        harness.collaborators(),
        &mut store,
        &mut guard,
        &PipelineSettings::default(),
        &controller(3),
        stop,
    )
    .await
    .unwrap();

    let stopped = match outcome {
        RunOutcome::Stopped(state) => state,
        other => panic!("expected a stopped run, got {:?}", other),
    };
    assert_eq!(stopped.current_category, Some(Category::Mutual));
    assert_eq!(stopped.current_batch, 0);
    assert_eq!(stopped.current_index, 5);
    assert_eq!(stopped.attempt_count, 0);
    assert_eq!(harness.store.len(), 5);

    let report = expect_completed(
        run_once(&harness, stopped, &mut store, &mut guard)
            .await
            .unwrap(),
    );
    assert_eq!(report.processed(), 5);
    assert_eq!(harness.driver.fetched(), profile_ids(10));
}

#[tokio::test]
async fn test_history_sweep_writes_messages() {
    let harness = Harness::new(
        FakeDriver::with_mutuals(3)
            .with_list(Category::OutgoingRequest, vec!["q1".to_string()])
            .with_conversation("p1", "Thanks for connecting!")
            .with_conversation("q1", "Hello there"),
    );
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let report = expect_completed(
        run_once(&harness, initial_state(), &mut store, &mut guard)
            .await
            .unwrap(),
    );

    assert_eq!(report.history_written, 2);

    let (status, extra) = harness.store.edge("q1").unwrap();
    assert_eq!(status, "outgoing");
    let messages = &extra.unwrap()["messages"];
    assert_eq!(messages[0]["body"], "Hello there");

    let (status, _) = harness.store.edge("p1").unwrap();
    assert_eq!(status, "ally");
}

#[tokio::test]
async fn test_history_failure_does_not_fail_the_run() {
    let harness = Harness::new(
        FakeDriver::with_mutuals(3)
            .with_conversation("p1", "hi")
            .failing_history(),
    );
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let report = expect_completed(
        run_once(&harness, initial_state(), &mut store, &mut guard)
            .await
            .unwrap(),
    );

    assert_eq!(report.processed(), 3);
    assert_eq!(report.history_written, 0);
}

#[tokio::test]
async fn test_only_configured_categories_are_ingested() {
    let harness = Harness::new(
        FakeDriver::with_mutuals(2)
            .with_list(Category::IncomingRequest, vec!["in1".to_string()])
            .with_list(Category::OutgoingRequest, vec!["out1".to_string()]),
    );
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let report = expect_completed(
        run_once(&harness, initial_state(), &mut store, &mut guard)
            .await
            .unwrap(),
    );

    assert_eq!(report.processed(), 4);
    assert_eq!(report.ingested, 3);

    let mut ingested = harness.ingest.calls.lock().unwrap().clone();
    ingested.sort();
    assert_eq!(ingested, vec!["out1", "p0", "p1"]);
    assert_eq!(harness.store.edge("in1").unwrap().0, "incoming");
}

#[tokio::test]
async fn test_session_token_reaches_remote_store() {
    let harness = Harness::new(FakeDriver::with_mutuals(1));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let mut state = initial_state();
    state.session_token = Some("edge-token".to_string());

    expect_completed(run_once(&harness, state, &mut store, &mut guard).await.unwrap());

    assert_eq!(
        harness.store.token.lock().unwrap().as_deref(),
        Some("edge-token")
    );
    assert_eq!(
        harness.driver.logins.lock().unwrap().as_slice(),
        ["vault://test/primary".to_string()]
    );
}

#[tokio::test]
async fn test_resume_never_enters_earlier_batches() {
    let harness = Harness::new(FakeDriver::with_mutuals(300));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    // The cursor alone says batches 0 and 1 are behind us
    let mut state = initial_state();
    state.current_category = Some(Category::Mutual);
    state.current_batch = 2;
    assert!(state.completed_batches.is_empty());

    let report = expect_completed(
        run_once(&harness, state, &mut store, &mut guard)
            .await
            .unwrap(),
    );

    let expected: Vec<String> = (200..300).map(|i| format!("p{}", i)).collect();
    assert_eq!(harness.driver.fetched(), expected);

    let committed: Vec<u32> = report
        .batches
        .iter()
        .filter(|b| b.category == Category::Mutual)
        .map(|b| b.batch_number)
        .collect();
    assert_eq!(committed, vec![2]);
    assert_eq!(harness.store.len(), 100);
}

#[tokio::test]
async fn test_committed_batches_only_grow_across_resumes() {
    let stop = Arc::new(AtomicBool::new(false));
    let harness = Harness::new(FakeDriver::with_mutuals(450).stop_every(70, stop.clone()));
    let mut store = SqliteCheckpointStore::new_in_memory().unwrap();
    let mut guard = stepping_guard();

    let mut state = initial_state();
    let mut snapshots: Vec<(i64, BTreeSet<u32>)> = Vec::new();
    let report = loop {
        stop.store(false, Ordering::SeqCst);
        let outcome = run_pipeline(
            state,
            harness.collaborators(),
            &mut store,
            &mut guard,
            &PipelineSettings::default(),
            &controller(3),
            stop.clone(),
        )
        .await
        .unwrap();

        match outcome {
            RunOutcome::Stopped(stopped) => {
                // The durable index agrees with the state at every stop
                let handle = stopped.checkpoint_handle.clone().unwrap();
                let index = store.load_index(&handle).unwrap();
                assert_eq!(
                    index.category(Category::Mutual).unwrap().completed_batches,
                    stopped.completed_batches
                );

                snapshots.push((stopped.current_batch, stopped.completed_batches.clone()));
                state = stopped;
            }
            RunOutcome::Completed(report) => break report,
            other => panic!("expected a stop or completion, got {:?}", other),
        }
    };

    assert_eq!(snapshots.len(), 6);
    for pair in snapshots.windows(2) {
        let (earlier_batch, earlier) = &pair[0];
        let (later_batch, later) = &pair[1];
        assert!(earlier.is_subset(later), "{:?} shrank to {:?}", earlier, later);
        assert!(earlier_batch <= later_batch);
    }
    assert_eq!(
        snapshots.last().unwrap().1,
        BTreeSet::from([0, 1, 2, 3])
    );

    // Every profile fetched once, in order
    assert_eq!(harness.driver.fetched(), profile_ids(450));
    assert_eq!(report.state.current_category, None);
    assert_eq!(harness.store.len(), 450);
}
