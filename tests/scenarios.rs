mod common;

use std::sync::Arc;

use khonsu_uow::prelude::*;

use common::{Journal, enlist, healthy_mocks};

#[tokio::test]
async fn test_all_participants_commit() {
    // Scenario A: 3 participants, every phase succeeds.
    let uow = DistributedUnitOfWork::new();
    let journal = Journal::new();
    let mocks = healthy_mocks(3);
    let ids = enlist(&uow, &mocks, &journal);

    let snapshot = uow.execute().await.unwrap();

    assert_eq!(snapshot.status, TransactionStatus::Committed);
    assert_eq!(snapshot.prepared_count, 3);
    assert_eq!(snapshot.committed_count, 3);
    assert_eq!(snapshot.rolled_back_count, 0);
    assert_eq!(snapshot.failed_count, 0);
    assert_eq!(snapshot.committed, ids);
    for mock in &mocks {
        assert_eq!(mock.prepare_calls(), 1);
        assert_eq!(mock.commit_calls(), 1);
        assert_eq!(mock.rollback_calls(), 0);
    }
    assert!(journal.phase_barrier_holds(Phase::Prepare, Phase::Commit));
}

#[tokio::test]
async fn test_second_prepare_failure_rolls_back_the_others() {
    // Scenario B: participant #2 votes no.
    let uow = DistributedUnitOfWork::new();
    let journal = Journal::new();
    let mocks = vec![
        Arc::new(MockParticipant::new()),
        Arc::new(MockParticipant::failing_prepare("constraint violated")),
        Arc::new(MockParticipant::new()),
    ];
    let ids = enlist(&uow, &mocks, &journal);

    let err = uow.execute().await.unwrap_err();
    let failure = err.failure().expect("aggregate failure");
    let snapshot = &failure.snapshot;

    assert_eq!(snapshot.status, TransactionStatus::RolledBack);
    assert_eq!(snapshot.prepared_count, 2);
    assert_eq!(snapshot.rolled_back_count, 2);
    assert_eq!(snapshot.committed_count, 0);
    assert_eq!(snapshot.rolled_back, vec![ids[0], ids[2]]);
    assert_eq!(snapshot.failures.len(), 1);
    assert_eq!(snapshot.failures[0].participant_id, ids[1]);
    assert_eq!(snapshot.failures[0].participant_name, "p2");
    assert_eq!(snapshot.failures[0].phase, Phase::Prepare);
    assert_eq!(
        snapshot.failures[0].error,
        ParticipantError::Rejected("constraint violated".to_string())
    );

    assert!(journal.called(Phase::Commit).is_empty());
    assert_eq!(mocks[0].rollback_calls(), 1);
    assert_eq!(mocks[1].rollback_calls(), 0);
    assert_eq!(mocks[2].rollback_calls(), 1);
    assert!(journal.phase_barrier_holds(Phase::Prepare, Phase::Rollback));
}

#[tokio::test]
async fn test_commit_failure_is_a_partial_failure() {
    // Scenario C: both prepare, participant #1 fails to commit.
    let uow = DistributedUnitOfWork::new();
    let journal = Journal::new();
    let mocks = vec![
        Arc::new(MockParticipant::failing_commit("disk full")),
        Arc::new(MockParticipant::new()),
    ];
    let ids = enlist(&uow, &mocks, &journal);

    let err = uow.execute().await.unwrap_err();
    let snapshot = &err.failure().unwrap().snapshot;

    assert_eq!(snapshot.status, TransactionStatus::Failed);
    assert_eq!(snapshot.prepared_count, 2);
    assert_eq!(snapshot.committed_count, 1);
    assert_eq!(snapshot.committed, vec![ids[1]]);
    assert_eq!(snapshot.failures.len(), 1);
    assert_eq!(snapshot.failures[0].participant_id, ids[0]);
    assert_eq!(snapshot.failures[0].phase, Phase::Commit);
    assert_eq!(snapshot.failures_in(Phase::Commit).count(), 1);
    // No compensation after the commit decision.
    assert!(journal.called(Phase::Rollback).is_empty());
}

#[tokio::test]
async fn test_empty_transaction_commits() {
    // Scenario D: nothing registered.
    let uow = DistributedUnitOfWork::new();

    let snapshot = uow.execute().await.unwrap();

    assert_eq!(snapshot.status, TransactionStatus::Committed);
    assert_eq!(snapshot.prepared_count, 0);
    assert_eq!(snapshot.committed_count, 0);
    assert_eq!(snapshot.rolled_back_count, 0);
    assert_eq!(snapshot.failed_count, 0);
    assert!(snapshot.failures.is_empty());
}

#[tokio::test]
async fn test_panicking_prepare_behaves_like_a_failed_prepare() {
    // Scenario E: same outcome as Scenario B, with a panic instead of an error.
    let uow = DistributedUnitOfWork::new();
    let journal = Journal::new();
    let mocks = vec![
        Arc::new(MockParticipant::new()),
        Arc::new(MockParticipant::panicking_prepare("connection pool poisoned")),
        Arc::new(MockParticipant::new()),
    ];
    enlist(&uow, &mocks, &journal);

    let err = uow.execute().await.unwrap_err();
    let snapshot = &err.failure().unwrap().snapshot;

    assert_eq!(snapshot.status, TransactionStatus::RolledBack);
    assert_eq!(snapshot.prepared_count, 2);
    assert_eq!(snapshot.rolled_back_count, 2);
    assert_eq!(snapshot.committed_count, 0);
    assert_eq!(snapshot.failures.len(), 1);
    assert_eq!(snapshot.failures[0].phase, Phase::Prepare);
    assert_eq!(
        snapshot.failures[0].error,
        ParticipantError::Panicked("connection pool poisoned".to_string())
    );
    assert!(journal.called(Phase::Commit).is_empty());
    assert_eq!(mocks[1].rollback_calls(), 0);
}

#[tokio::test]
async fn test_failed_rollback_ends_failed() {
    let uow = DistributedUnitOfWork::new();
    let journal = Journal::new();
    let mocks = vec![
        Arc::new(MockParticipant::failing_rollback("lock lost")),
        Arc::new(MockParticipant::failing_prepare("no")),
    ];
    let ids = enlist(&uow, &mocks, &journal);

    let err = uow.execute().await.unwrap_err();
    let snapshot = &err.failure().unwrap().snapshot;

    assert_eq!(snapshot.status, TransactionStatus::Failed);
    assert_eq!(snapshot.prepared, vec![ids[0]]);
    assert_eq!(snapshot.rolled_back_count, 0);
    let phases: Vec<_> = snapshot.failures.iter().map(|f| f.phase).collect();
    assert_eq!(phases, vec![Phase::Prepare, Phase::Rollback]);
}

#[tokio::test]
async fn test_status_is_stable_after_completion() {
    let uow = DistributedUnitOfWork::new();
    let journal = Journal::new();
    enlist(&uow, &healthy_mocks(2), &journal);
    uow.execute().await.unwrap();

    let first = uow.get_transaction_status();
    let second = uow.get_transaction_status();
    assert_eq!(first, second);
    assert!(first.is_terminal());
    assert_eq!(first.transaction_id, *uow.transaction_id());
}

#[tokio::test]
async fn test_coordinator_is_single_use() {
    let uow = DistributedUnitOfWork::new();
    uow.execute().await.unwrap();

    let err = uow
        .register_participant("late", Arc::new(MockParticipant::new()))
        .unwrap_err();
    assert!(matches!(
        err,
        UowError::InvalidState {
            status: TransactionStatus::Committed,
            ..
        }
    ));

    let err = uow.execute().await.unwrap_err();
    assert!(matches!(err, UowError::InvalidState { .. }));
    assert!(matches!(
        uow.commit().await,
        Err(UowError::InvalidState { .. })
    ));
    assert!(matches!(
        uow.rollback().await,
        Err(UowError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_duplicate_and_empty_names_are_rejected() {
    let uow = DistributedUnitOfWork::new();
    let first = uow
        .register_participant("orders", Arc::new(MockParticipant::new()))
        .unwrap();

    let err = uow
        .register_participant("orders", Arc::new(MockParticipant::new()))
        .unwrap_err();
    assert!(matches!(err, UowError::DuplicateParticipant(ref name) if name == "orders"));

    let err = uow
        .register_participant("", Arc::new(MockParticipant::new()))
        .unwrap_err();
    assert!(matches!(err, UowError::EmptyParticipantName));

    let second = uow
        .register_participant("events", Arc::new(MockParticipant::new()))
        .unwrap();
    assert_eq!(
        uow.participants(),
        vec![(first, "orders".to_string()), (second, "events".to_string())]
    );
    assert_eq!(uow.participant_id("events"), Some(second));
    assert_eq!(uow.participant_id("cache"), None);
    assert_eq!(uow.participant_count(), 2);
}

#[tokio::test]
async fn test_membership_is_kept_after_completion() {
    let mut registry = ParticipantRegistry::new();
    assert!(registry.is_empty());
    let id = registry
        .register("ledger".to_string(), Arc::new(MockParticipant::new()))
        .unwrap();
    assert_eq!(registry.id_of("ledger"), Some(id));
    assert_eq!(registry.len(), 1);

    let uow = DistributedUnitOfWork::new();
    uow.register_participant("ledger", Arc::new(MockParticipant::new()))
        .unwrap();
    uow.execute().await.unwrap();

    // Handles are released at completion, names and ids stay queryable.
    assert_eq!(uow.participant_count(), 1);
    assert_eq!(uow.participant_id("ledger"), Some(id));
}

#[tokio::test]
async fn test_registration_closes_once_prepare_starts() {
    let uow = DistributedUnitOfWork::new();
    uow.register_participant("db", Arc::new(MockParticipant::new()))
        .unwrap();

    assert_eq!(uow.begin().await.unwrap(), TransactionStatus::Prepared);

    let err = uow
        .register_participant("cache", Arc::new(MockParticipant::new()))
        .unwrap_err();
    assert!(matches!(
        err,
        UowError::InvalidState {
            status: TransactionStatus::Prepared,
            ..
        }
    ));
    assert!(matches!(uow.begin().await, Err(UowError::InvalidState { .. })));

    assert_eq!(uow.commit().await.unwrap(), TransactionStatus::Committed);
}

#[tokio::test]
async fn test_explicit_rollback_after_prepare() {
    let uow = DistributedUnitOfWork::new();
    let journal = Journal::new();
    let mocks = healthy_mocks(2);
    enlist(&uow, &mocks, &journal);

    uow.begin().await.unwrap();
    assert_eq!(uow.rollback().await.unwrap(), TransactionStatus::RolledBack);

    let snapshot = uow.get_transaction_status();
    assert_eq!(snapshot.rolled_back_count, 2);
    assert_eq!(snapshot.committed_count, 0);
    assert!(mocks.iter().all(|mock| mock.commit_calls() == 0));
    assert!(matches!(uow.commit().await, Err(UowError::InvalidState { .. })));
}

#[tokio::test]
async fn test_commit_before_prepare_is_rejected() {
    let uow = DistributedUnitOfWork::new();
    let err = uow.commit().await.unwrap_err();
    assert!(matches!(
        err,
        UowError::InvalidState {
            operation: "commit",
            status: TransactionStatus::Pending,
        }
    ));
    assert_eq!(
        uow.get_transaction_status().status,
        TransactionStatus::Pending
    );
}

#[tokio::test]
async fn test_aggregate_error_reports_failures() {
    let uow = DistributedUnitOfWork::new();
    uow.register_participant("ledger", Arc::new(MockParticipant::failing_prepare("frozen")))
        .unwrap();

    let err = uow.execute().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains(uow.transaction_id().as_str()));
    assert!(message.contains("ROLLED_BACK"));
    assert!(message.contains("1 participant failure(s)"));
}
