//! PostgreSQL storage integration tests.
//!
//! Run with: `cargo test -p rollout-tests --test store_tests --features integration`

#![cfg(feature = "integration")]

use rollout_core::Error;
use rollout_core::ports::{ApplicationStore, RetriggerEntry, RetriggerQueue};
use rollout_core::version::RevisionId;
use rollout_core::JobId;
use rollout_core::job::JobType;
use rollout_scheduler::{DeploymentTrigger, SchedulerConfig};
use rollout_tests::{
    InMemoryHealthMonitor, InMemoryJobController, InMemoryRetriggerQueue, InMemorySystemVersion,
    ManualClock, TestContext, fixtures,
};
use std::sync::Arc;

#[tokio::test]
async fn test_application_crud() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let store = ctx.db.application_store();

    let application = fixtures::application("app", fixtures::TWO_REGIONS).unwrap();
    store
        .create(&application)
        .await
        .expect("Failed to create application");
    assert!(store.create(&application).await.is_err());

    let found = store
        .get(&application.id)
        .await
        .expect("Failed to get application")
        .expect("Application not found");
    assert_eq!(found, application);
    assert_eq!(store.list().await.unwrap(), vec![application.id.clone()]);

    assert!(store.delete(&application.id).await.unwrap());
    assert!(store.get(&application.id).await.unwrap().is_none());
    assert!(!store.delete(&application.id).await.unwrap());
}

#[tokio::test]
async fn test_locked_application_is_stored_on_store_only() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let store = ctx.db.application_store();
    let application = fixtures::application("app", fixtures::TWO_REGIONS).unwrap();
    store.create(&application).await.unwrap();

    // Dropped without storing: rolled back.
    let locked = store.lock(&application.id).await.unwrap();
    drop(locked);
    let found = store.get(&application.id).await.unwrap().unwrap();
    assert_eq!(found.latest_revision, None);

    let locked = store.lock(&application.id).await.unwrap();
    let updated = locked
        .application()
        .clone()
        .with_new_submission(2, RevisionId::new(5));
    locked.store(updated).await.unwrap();
    let found = store.get(&application.id).await.unwrap().unwrap();
    assert_eq!(found.latest_revision, Some(RevisionId::new(5)));
    assert_eq!(found.project_id, Some(2));
}

#[tokio::test]
async fn test_lock_times_out_while_held() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let store = ctx.db.application_store();
    let application = fixtures::application("app", fixtures::TWO_REGIONS).unwrap();
    store.create(&application).await.unwrap();

    let held = store.lock(&application.id).await.unwrap();
    let result = store.lock(&application.id).await;
    assert!(matches!(result, Err(Error::Lock(_))));

    drop(held);
    assert!(store.lock(&application.id).await.is_ok());
}

#[tokio::test]
async fn test_lock_of_unknown_application() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let store = ctx.db.application_store();
    let result = store.lock(&fixtures::application_id("missing")).await;
    assert!(matches!(result, Err(Error::ApplicationNotFound(_))));
}

#[tokio::test]
async fn test_retrigger_queue_round_trip() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let queue = ctx.db.retrigger_queue();
    let job = JobId::new(
        fixtures::application_id("app").instance("default"),
        JobType::ProductionDeployment("us-east-3".into()),
    );

    let locked = queue.lock().await.unwrap();
    assert!(locked.entries().is_empty());
    locked
        .write(vec![RetriggerEntry::new(job.clone(), 4)])
        .await
        .unwrap();

    let locked = queue.lock().await.unwrap();
    assert_eq!(locked.entries(), &[RetriggerEntry::new(job, 4)]);
    locked.write(Vec::new()).await.unwrap();

    assert!(queue.lock().await.unwrap().entries().is_empty());
}

#[tokio::test]
async fn test_trigger_over_postgres() {
    let ctx = TestContext::new().await.expect("Failed to create context");
    let applications = Arc::new(ctx.db.application_store());
    let application = fixtures::application("app", fixtures::TWO_REGIONS).unwrap();
    applications.create(&application).await.unwrap();

    let clock = Arc::new(ManualClock::new(fixtures::start()));
    let jobs = Arc::new(InMemoryJobController::new(clock.clone()));
    let trigger = DeploymentTrigger::new(
        applications.clone(),
        jobs.clone(),
        Arc::new(ctx.db.retrigger_queue()),
        Arc::new(InMemoryHealthMonitor::new()),
        Arc::new(InMemorySystemVersion::new(fixtures::version(
            fixtures::SYSTEM_VERSION,
        ))),
        clock,
        SchedulerConfig::default(),
    );

    trigger
        .notify_of_submission(&application.id, RevisionId::new(1), 1)
        .await
        .unwrap();
    assert_eq!(trigger.trigger_ready_jobs().await.unwrap(), 2);
    assert_eq!(trigger.process_retrigger_queue().await.unwrap(), 0);

    let stored = applications.get(&application.id).await.unwrap().unwrap();
    let instance = stored.instance(&"default".into()).unwrap();
    assert_eq!(instance.change.revision, Some(RevisionId::new(1)));
    assert_eq!(jobs.running().len(), 2);
}
