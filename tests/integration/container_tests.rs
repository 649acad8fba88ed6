//! Bulk operations over job containers.

use std::sync::Arc;
use std::time::Duration;

use rusty_jobs::{Error, Job, JobContainer, JobDescription, JobState, WaitMode};
use tempfile::TempDir;

use super::common::local_service;

fn sleeper(service: &Arc<rusty_jobs::JobService>, secs: &str) -> Arc<Job> {
    Arc::new(Job::new(service, JobDescription::new("/bin/sleep").arg(secs)))
}

#[tokio::test]
async fn membership_bookkeeping() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;
    let a = sleeper(&service, "1");
    let b = sleeper(&service, "1");

    let mut container = JobContainer::new();
    assert!(container.is_empty());
    assert!(container.add(a.clone()));
    assert!(!container.add(a.clone()));
    assert!(container.add(b.clone()));
    assert_eq!(container.len(), 2);
    assert!(container.contains(&a));

    assert!(container.remove(&a));
    assert!(!container.remove(&a));
    assert!(!container.contains(&a));
    assert_eq!(container.len(), 1);
    assert_eq!(container.jobs()[0].handle_id(), b.handle_id());
    service.close().await;
}

#[tokio::test]
async fn run_and_wait_for_all() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let mut container = JobContainer::new();
    container.add(sleeper(&service, "1"));
    container.add(Arc::new(Job::new(&service, JobDescription::new("/bin/false"))));
    container.add(sleeper(&service, "2"));

    container.run().await.unwrap();
    assert!(container.jobs().iter().all(|job| job.id().is_some()));

    let finished = container
        .wait(WaitMode::All, Some(Duration::from_secs(20)))
        .await
        .unwrap();
    assert_eq!(finished.len(), 3);

    let states = container.get_states().await.unwrap();
    assert_eq!(states, vec![JobState::Done, JobState::Failed, JobState::Done]);
    let codes: Vec<Option<i32>> = container.jobs().iter().map(|job| job.exit_code()).collect();
    assert_eq!(codes, vec![Some(0), Some(1), Some(0)]);
    service.close().await;
}

#[tokio::test]
async fn states_keep_insertion_order() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let unsubmitted = sleeper(&service, "1");
    let running = sleeper(&service, "60");
    let done = Arc::new(Job::new(&service, JobDescription::new("/bin/true")));
    running.run().await.unwrap();
    done.run().await.unwrap();
    done.wait(None).await.unwrap();

    let mut container = JobContainer::new();
    container.add(done.clone());
    container.add(unsubmitted);
    container.add(running.clone());

    let states = container.get_states().await.unwrap();
    assert_eq!(states[0], JobState::Done);
    assert_eq!(states[1], JobState::New);
    assert!(matches!(states[2], JobState::New | JobState::Running));

    running.cancel().await.unwrap();
    service.close().await;
}

#[tokio::test]
async fn wait_any_then_cancel_the_rest() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let quick = Arc::new(Job::new(&service, JobDescription::new("/bin/true")));
    let slow_a = sleeper(&service, "60");
    let slow_b = sleeper(&service, "60");
    let mut container = JobContainer::new();
    container.add(slow_a.clone());
    container.add(quick.clone());
    container.add(slow_b.clone());
    container.run().await.unwrap();

    let finished = container
        .wait(WaitMode::Any, Some(Duration::from_secs(20)))
        .await
        .unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].handle_id(), quick.handle_id());

    container.cancel().await.unwrap();
    assert_eq!(slow_a.cached_state(), JobState::Canceled);
    assert_eq!(slow_b.cached_state(), JobState::Canceled);
    // already final before the cancel, untouched by it
    assert_eq!(quick.cached_state(), JobState::Done);
    service.close().await;
}

#[tokio::test]
async fn wait_times_out_without_disturbing_jobs() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let mut container = JobContainer::new();
    let job = sleeper(&service, "60");
    container.add(job.clone());
    container.run().await.unwrap();

    let err = container
        .wait(WaitMode::All, Some(Duration::from_millis(400)))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Timeout { .. }), "got {:?}", err);
    assert!(!job.cached_state().is_final());

    container.cancel().await.unwrap();
    assert_eq!(job.cached_state(), JobState::Canceled);
    service.close().await;
}

#[tokio::test]
async fn jobs_purged_behind_the_container_are_invalid() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = sleeper(&service, "60");
    job.run().await.unwrap();
    let mut container = JobContainer::new();
    container.add(job.clone());

    // finish and purge it without telling the mirror
    let id = job.id().unwrap();
    while service.state(&id).await.unwrap() == JobState::New {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    service.cancel(&id).await.unwrap();
    while !service.state(&id).await.unwrap().is_final() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    service.purge(Some(&id)).await.unwrap();
    assert_eq!(job.cached_state(), JobState::New);
    let err = container.get_states().await.unwrap_err();
    assert!(matches!(err, Error::InvalidJob(_)), "got {:?}", err);
    service.close().await;
}

#[tokio::test]
async fn jobs_on_separate_services_are_tracked_together() {
    let store_a = TempDir::new().unwrap();
    let store_b = TempDir::new().unwrap();
    let service_a = local_service(&store_a).await;
    let service_b = local_service(&store_b).await;

    let mut container = JobContainer::new();
    container.add(Arc::new(Job::new(&service_a, JobDescription::new("/bin/true"))));
    container.add(Arc::new(Job::new(&service_b, JobDescription::new("/bin/false"))));
    container.run().await.unwrap();
    container
        .wait(WaitMode::All, Some(Duration::from_secs(20)))
        .await
        .unwrap();
    assert_eq!(
        container.get_states().await.unwrap(),
        vec![JobState::Done, JobState::Failed]
    );

    service_a.close().await;
    service_b.close().await;
}

#[tokio::test]
async fn empty_container_is_trivially_done() {
    let container = JobContainer::new();
    assert!(container.wait(WaitMode::All, None).await.unwrap().is_empty());
    assert!(container.wait(WaitMode::Any, None).await.unwrap().is_empty());
    assert!(container.get_states().await.unwrap().is_empty());
    container.run().await.unwrap();
    container.cancel().await.unwrap();
}

#[tokio::test]
async fn unsubmitted_members_are_refused_by_wait_and_cancel() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let submitted = sleeper(&service, "60");
    submitted.run().await.unwrap();
    let pending = sleeper(&service, "1");
    let mut container = JobContainer::new();
    container.add(submitted.clone());
    container.add(pending.clone());

    // answered up front, not after a poll loop or the cancel grace period
    let quick = Duration::from_secs(2);
    let err = tokio::time::timeout(quick, container.wait(WaitMode::All, None))
        .await
        .expect("wait returned promptly")
        .err()
        .unwrap();
    assert!(matches!(err, Error::IncorrectState(_)), "got {:?}", err);

    let err = tokio::time::timeout(quick, container.cancel())
        .await
        .expect("cancel returned promptly")
        .unwrap_err();
    assert!(matches!(err, Error::IncorrectState(_)), "got {:?}", err);
    // nothing was signalled
    assert!(!submitted.state().await.unwrap().is_final());
    assert_eq!(pending.cached_state(), JobState::New);

    container.remove(&pending);
    container.cancel().await.unwrap();
    assert_eq!(submitted.cached_state(), JobState::Canceled);
    service.close().await;
}
