//! Operator and maintenance entry points of the deployment trigger.
//!
//! Run with: `cargo test -p rollout-tests --test trigger_tests`

use chrono::Duration;
use pretty_assertions::assert_eq;
use rollout_core::change::Change;
use rollout_core::job::{JobType, ZoneId};
use rollout_core::ports::{Clock, RetriggerEntry};
use rollout_core::run::RunStatus;
use rollout_core::version::RevisionId;
use rollout_core::{ApplicationId, Error, InstanceId, JobId};
use rollout_scheduler::{ChangesToCancel, Sweeper};
use rollout_tests::{DeploymentTester, fixtures};
use std::time::Duration as StdDuration;
use tokio::sync::watch;

fn prod(region: &str) -> JobType {
    JobType::ProductionDeployment(region.into())
}

fn job(instance: &InstanceId, job_type: JobType) -> JobId {
    JobId::new(instance.clone(), job_type)
}

/// A tester with a submitted application, and its instance.
async fn submitted(spec: &str) -> (DeploymentTester, ApplicationId, InstanceId) {
    let tester = DeploymentTester::new();
    let app = tester
        .new_application("app", spec)
        .expect("Failed to create application");
    tester.submit(&app, 1).await.expect("Failed to submit");
    let instance = app.instance("default");
    (tester, app, instance)
}

/// Run the tests of the current change to success.
async fn pass_tests(tester: &DeploymentTester, instance: &InstanceId) {
    tester.sweep().await.expect("Failed to sweep");
    tester
        .succeed(&job(instance, JobType::SystemTest))
        .await
        .expect("System test not running");
    tester
        .succeed(&job(instance, JobType::StagingTest))
        .await
        .expect("Staging test not running");
}

#[tokio::test]
async fn test_trigger_is_idempotent() {
    let (tester, _, _) = submitted(fixtures::TWO_REGIONS).await;

    let ready = tester.trigger.compute_ready_jobs().await.unwrap();
    assert_eq!(ready.len(), 2);
    assert!(tester.trigger.trigger(&ready[0]).await.unwrap());
    assert!(!tester.trigger.trigger(&ready[0]).await.unwrap());
    assert_eq!(tester.running(), vec![ready[0].job()]);
}

#[tokio::test]
async fn test_only_one_test_job_of_each_type_per_sweep() {
    let tester = DeploymentTester::new();
    let first = tester.new_application("first", fixtures::TWO_REGIONS).unwrap();
    let second = tester.new_application("second", fixtures::TWO_REGIONS).unwrap();
    tester.submit(&first, 1).await.unwrap();
    tester.submit(&second, 1).await.unwrap();

    assert_eq!(tester.trigger.compute_ready_jobs().await.unwrap().len(), 4);
    assert_eq!(tester.sweep().await.unwrap(), 2);
    let mut types: Vec<JobType> = tester.running().into_iter().map(|job| job.job_type).collect();
    types.sort();
    assert_eq!(types, vec![JobType::SystemTest, JobType::StagingTest]);

    // The others get their turn.
    for running in tester.running() {
        tester.succeed(&running).await.unwrap();
    }
    tester.sweep().await.unwrap();
    assert!(tester.running().iter().any(|job| job.job_type.is_test()));
}

#[tokio::test]
async fn test_paused_job_waits_until_pause_ends() {
    let (tester, _, instance) = submitted(fixtures::TWO_REGIONS).await;
    let until = tester.clock.now() + Duration::hours(2);
    tester
        .trigger
        .pause_job(&instance, &prod("us-east-3"), until)
        .await
        .expect("Failed to pause");

    pass_tests(&tester, &instance).await;
    assert_eq!(tester.sweep().await.unwrap(), 0);
    assert_eq!(
        tester.instance(&instance).unwrap().job_pauses.get(&prod("us-east-3")),
        Some(&until)
    );

    tester.advance(Duration::hours(2));
    assert_eq!(tester.sweep().await.unwrap(), 1);
    assert_eq!(tester.running_types(&instance), vec![prod("us-east-3")]);
    assert!(tester.instance(&instance).unwrap().job_pauses.is_empty());
}

#[tokio::test]
async fn test_outdated_run_goes_on_while_its_next_run_is_paused() {
    let (tester, app, instance) = submitted(fixtures::TWO_REGIONS_LATEST).await;
    let us_east = job(&instance, prod("us-east-3"));
    pass_tests(&tester, &instance).await;
    assert_eq!(tester.sweep().await.unwrap(), 1);
    assert_eq!(tester.running(), vec![us_east.clone()]);

    let until = tester.clock.now() + Duration::hours(2);
    tester
        .trigger
        .pause_job(&instance, &prod("us-east-3"), until)
        .await
        .unwrap();
    tester.submit(&app, 2).await.unwrap();
    pass_tests(&tester, &instance).await;

    // Revision 2 is verified, but may not deploy yet, so revision 1 is left running.
    assert_eq!(tester.sweep().await.unwrap(), 0);
    let run = tester.jobs.last_run(&us_east).unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.versions.target_revision, RevisionId::new(1));

    tester.advance(Duration::hours(2));
    assert_eq!(tester.sweep().await.unwrap(), 0);
    assert_eq!(tester.jobs.last_run(&us_east).unwrap().status, RunStatus::Aborted);

    assert_eq!(tester.sweep().await.unwrap(), 1);
    let run = tester.jobs.last_run(&us_east).unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.versions.target_revision, RevisionId::new(2));
}

#[tokio::test]
async fn test_pause_is_bounded_and_can_be_resumed() {
    let (tester, _, instance) = submitted(fixtures::TWO_REGIONS).await;
    let max_pause = tester.trigger.config().max_pause();

    let too_long = tester.clock.now() + max_pause + Duration::seconds(1);
    let result = tester
        .trigger
        .pause_job(&instance, &prod("us-east-3"), too_long)
        .await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    tester
        .trigger
        .pause_job(&instance, &prod("us-east-3"), tester.clock.now() + max_pause)
        .await
        .unwrap();
    tester.trigger.resume_job(&instance, &prod("us-east-3")).await.unwrap();
    assert!(tester.instance(&instance).unwrap().job_pauses.is_empty());

    pass_tests(&tester, &instance).await;
    assert_eq!(tester.sweep().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_applications() {
    let tester = DeploymentTester::new();
    let unknown = fixtures::application_id("unknown");

    tester
        .trigger
        .notify_of_submission(&unknown, RevisionId::new(1), 1)
        .await
        .expect("Submission of unknown application should be ignored");
    tester
        .trigger
        .notify_of_completion(&unknown.instance("default"))
        .await
        .expect("Completion for unknown application should be ignored");

    let result = tester
        .trigger
        .pause_job(
            &unknown.instance("default"),
            &prod("us-east-3"),
            tester.clock.now() + Duration::hours(1),
        )
        .await;
    assert!(matches!(result, Err(Error::ApplicationNotFound(_))));
}

#[tokio::test]
async fn test_re_trigger_requires_earlier_run() {
    let (tester, _, instance) = submitted(fixtures::TWO_REGIONS).await;
    let result = tester.trigger.re_trigger(&instance, &prod("us-east-3")).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn test_running_deployment_is_aborted_and_queued() {
    let (tester, _, instance) = submitted(fixtures::TWO_REGIONS).await;
    tester.deploy().await.unwrap();
    let us_east = job(&instance, prod("us-east-3"));
    let zone = ZoneId::prod("us-east-3");

    // Idle: triggered right away, with the versions of the last run.
    let triggered = tester
        .trigger
        .re_trigger_or_add_to_queue(&instance, &zone)
        .await
        .unwrap();
    assert_eq!(triggered, Some(us_east.clone()));
    let runs = tester.jobs.runs(&us_east);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].versions, runs[0].versions);

    // Running: aborted, and queued.
    let triggered = tester
        .trigger
        .re_trigger_or_add_to_queue(&instance, &zone)
        .await
        .unwrap();
    assert_eq!(triggered, None);
    assert_eq!(
        tester.jobs.last_run(&us_east).unwrap().status,
        RunStatus::Aborted
    );
    assert_eq!(
        tester.queue.entries().await,
        vec![RetriggerEntry::new(us_east.clone(), 3)]
    );

    assert_eq!(tester.sweep().await.unwrap(), 1);
    assert_eq!(tester.jobs.runs(&us_east).len(), 3);
    assert!(tester.queue.entries().await.is_empty());

    // Satisfied entries are dropped without triggering.
    tester.succeed(&us_east).await.unwrap();
    assert_eq!(tester.trigger.process_retrigger_queue().await.unwrap(), 0);
}

#[tokio::test]
async fn test_force_trigger_runs_tests_first_when_required() {
    let (tester, _, instance) = submitted(fixtures::TWO_REGIONS).await;
    let triggered = tester
        .trigger
        .force_trigger(&instance, &prod("us-east-3"), "operator", true)
        .await
        .unwrap();
    assert_eq!(
        triggered,
        vec![
            job(&instance, JobType::SystemTest),
            job(&instance, JobType::StagingTest)
        ]
    );
    assert_eq!(tester.running(), triggered);
}

#[tokio::test]
async fn test_force_trigger_without_tests() {
    let (tester, _, instance) = submitted(fixtures::TWO_REGIONS).await;
    let triggered = tester
        .trigger
        .force_trigger(&instance, &prod("eu-west-1"), "operator", false)
        .await
        .unwrap();
    assert_eq!(triggered, vec![job(&instance, prod("eu-west-1"))]);
    let run = tester.jobs.last_run(&triggered[0]).unwrap();
    assert_eq!(run.versions, fixtures::versions(fixtures::SYSTEM_VERSION, 1));
}

#[tokio::test]
async fn test_cancelled_revision_stops_production_until_picked_up_again() {
    let (tester, _, instance) = submitted(fixtures::TWO_REGIONS).await;
    tester.sweep().await.unwrap();

    tester
        .trigger
        .cancel_change(&instance, ChangesToCancel::Revision)
        .await
        .unwrap();
    assert!(tester.instance(&instance).unwrap().change.is_empty());

    // The tests already running finish, but production does not start.
    tester.succeed(&job(&instance, JobType::SystemTest)).await.unwrap();
    tester.succeed(&job(&instance, JobType::StagingTest)).await.unwrap();
    assert_eq!(tester.trigger.trigger_ready_jobs().await.unwrap(), 0);
    assert!(tester.running().is_empty());

    // The revision is still the next one for the instance, so a full sweep rolls it out again.
    assert_eq!(tester.sweep().await.unwrap(), 1);
    assert_eq!(
        tester.instance(&instance).unwrap().change,
        Change::of_revision(RevisionId::new(1))
    );
    assert_eq!(tester.running_types(&instance), vec![prod("us-east-3")]);
}

#[tokio::test]
async fn test_change_updates() {
    let (tester, app, instance) = submitted(fixtures::TWO_REGIONS).await;
    tester.submit(&app, 2).await.unwrap();
    let revision = |revision| Change::of_revision(RevisionId::new(revision));

    // Only when there is no change already.
    tester.trigger.trigger_change(&instance, &revision(2)).await.unwrap();
    assert_eq!(tester.instance(&instance).unwrap().change, revision(1));

    tester.trigger.force_change(&instance, &revision(2)).await.unwrap();
    assert_eq!(tester.instance(&instance).unwrap().change, revision(2));

    tester
        .trigger
        .cancel_change(&instance, ChangesToCancel::Versions)
        .await
        .unwrap();
    let change = tester.instance(&instance).unwrap().change;
    assert!(!change.has_targets());
    assert!(change.is_pinned());

    tester
        .trigger
        .cancel_change(&instance, ChangesToCancel::Pin)
        .await
        .unwrap();
    assert!(tester.instance(&instance).unwrap().change.is_empty());
}

#[tokio::test]
async fn test_sweeper_runs_once() {
    let (tester, _, _) = submitted(fixtures::TWO_REGIONS).await;
    Sweeper::new(tester.trigger.clone()).run_once().await;
    assert_eq!(tester.running().len(), 2);
}

#[tokio::test]
async fn test_sweeper_stops_on_shutdown() {
    let (tester, _, _) = submitted(fixtures::TWO_REGIONS).await;
    let sweeper = Sweeper::new(tester.trigger.clone()).with_interval(StdDuration::from_millis(10));
    let (shutdown, receiver) = watch::channel(false);

    let handle = tokio::spawn(async move { sweeper.run(receiver).await });
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    shutdown.send(true).unwrap();

    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("Sweeper did not stop")
        .unwrap();
    assert_eq!(tester.running().len(), 2);
}
