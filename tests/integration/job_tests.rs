//! Job mirrors against a local supervisor.

use std::time::Duration;

use rusty_jobs::{Error, Job, JobDescription, JobId, JobState};
use tempfile::TempDir;

use super::common::local_service;

#[tokio::test]
async fn description_sets_arguments_environment_and_directory() {
    let store = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let description = JobDescription::new("/bin/sh")
        .args(["-c", "echo \"$GREETING from $(pwd)\"; echo 'with spaces' \"$1\"", "job", "it's quoted"])
        .env("GREETING", "hello world")
        .working_directory(work.path().to_string_lossy())
        .output("result.txt");
    let job = Job::new(&service, description);
    assert_eq!(job.cached_state(), JobState::New);
    assert!(job.id().is_none());

    job.run().await.unwrap();
    assert!(job.id().is_some());
    assert!(job.created().is_some());
    assert_eq!(job.wait(Some(Duration::from_secs(20))).await.unwrap(), JobState::Done);
    assert_eq!(job.exit_code(), Some(0));
    assert!(job.started().is_some());
    assert!(job.finished().is_some());

    let written = std::fs::read_to_string(work.path().join("result.txt")).unwrap();
    let cwd = std::fs::canonicalize(work.path()).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("hello world from "), "{}", lines[0]);
    assert_eq!(
        std::fs::canonicalize(lines[0].trim_start_matches("hello world from ")).unwrap(),
        cwd
    );
    assert_eq!(lines[1], "with spaces it's quoted");
    service.close().await;
}

#[tokio::test]
async fn failing_job_reports_its_exit_code() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/sh").args(["-c", "exit 5"]));
    job.run().await.unwrap();
    assert_eq!(job.wait(None).await.unwrap(), JobState::Failed);
    assert_eq!(job.exit_code(), Some(5));
    service.close().await;
}

#[tokio::test]
async fn wait_timeout_leaves_the_job_running() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/sleep").arg("3"));
    job.run().await.unwrap();
    let err = job.wait(Some(Duration::from_millis(300))).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got {:?}", err);
    assert!(err.is_recoverable());
    assert!(!job.cached_state().is_final());

    assert_eq!(job.wait(Some(Duration::from_secs(20))).await.unwrap(), JobState::Done);
    service.close().await;
}

#[tokio::test]
async fn cancel_ends_in_canceled() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/sleep").arg("60"));
    job.run().await.unwrap();
    // no wait in between: the job may still be NEW here
    job.cancel().await.unwrap();
    assert_eq!(job.cached_state(), JobState::Canceled);
    assert_eq!(job.exit_code(), Some(137));

    let err = job.cancel().await.unwrap_err();
    assert!(matches!(err, Error::IncorrectState(_)), "got {:?}", err);
    service.close().await;
}

#[tokio::test]
async fn suspend_and_resume_through_the_mirror() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/sleep").arg("60"));
    job.run().await.unwrap();
    while job.state().await.unwrap() == JobState::New {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    job.suspend().await.unwrap();
    assert_eq!(job.cached_state(), JobState::Suspended);
    assert_eq!(job.state().await.unwrap(), JobState::Suspended);
    job.resume().await.unwrap();
    assert_eq!(job.state().await.unwrap(), JobState::Running);
    job.cancel().await.unwrap();
    service.close().await;
}

#[tokio::test]
async fn a_job_runs_only_once() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/true"));
    job.run().await.unwrap();
    let err = job.run().await.unwrap_err();
    assert!(matches!(err, Error::IncorrectState(_)), "got {:?}", err);
    job.wait(None).await.unwrap();
    service.close().await;
}

#[tokio::test]
async fn operations_before_run_are_incorrect_state() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/true"));
    assert_eq!(job.state().await.unwrap(), JobState::New);
    assert!(matches!(job.suspend().await, Err(Error::IncorrectState(_))));
    assert!(matches!(job.cancel().await, Err(Error::IncorrectState(_))));
    assert!(matches!(job.stdout().await, Err(Error::IncorrectState(_))));
    service.close().await;
}

#[tokio::test]
async fn invalid_description_is_rejected_before_submission() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/echo").arg("two\nlines"));
    let err = job.run().await.unwrap_err();
    assert!(matches!(err, Error::BadParameter(_)), "got {:?}", err);
    assert!(job.id().is_none());
    assert!(service.list().await.unwrap().is_empty());
    service.close().await;
}

#[tokio::test]
async fn final_state_is_served_from_cache_after_purge() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/sh").args(["-c", "exit 3"]));
    job.run().await.unwrap();
    job.wait(None).await.unwrap();
    let id = job.id().unwrap();
    assert_eq!(service.purge(Some(&id)).await.unwrap(), 1);

    assert_eq!(job.state().await.unwrap(), JobState::Failed);
    assert_eq!(job.exit_code(), Some(3));

    // a fresh mirror cannot find it any more
    let err = Job::attach(&service, id).await.err().unwrap();
    assert!(matches!(err, Error::InvalidJob(_)), "got {:?}", err);
    service.close().await;
}

#[tokio::test]
async fn attach_mirrors_an_existing_job() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let id = service.run_job(&["/bin/echo", "attached"]).await.unwrap();
    let job = Job::attach(&service, id.clone()).await.unwrap();
    assert_eq!(job.id(), Some(id));
    assert!(job.description().is_none());
    assert!(matches!(job.run().await, Err(Error::IncorrectState(_))));

    assert_eq!(job.wait(None).await.unwrap(), JobState::Done);
    assert_eq!(job.stdout().await.unwrap(), b"attached\n");
    assert_eq!(job.stderr().await.unwrap(), b"");

    let ghost: JobId = "999998".parse().unwrap();
    assert!(matches!(Job::attach(&service, ghost).await, Err(Error::InvalidJob(_))));
    service.close().await;
}

#[tokio::test]
async fn stdin_reaches_the_workload() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/sh").args(["-c", "sleep 1; exec cat"]));
    job.run().await.unwrap();
    job.write_stdin(b"line one\n").await.unwrap();
    job.write_stdin(b"line two\n").await.unwrap();
    assert_eq!(job.wait(None).await.unwrap(), JobState::Done);
    assert_eq!(job.stdout().await.unwrap(), b"line one\nline two\n");
    service.close().await;
}

#[tokio::test]
async fn info_serializes_the_cached_state() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;

    let job = Job::new(&service, JobDescription::new("/bin/true"));
    let before = serde_json::to_value(job.info()).unwrap();
    assert_eq!(before["state"], "NEW");
    assert!(before["id"].is_null());

    job.run().await.unwrap();
    job.wait(None).await.unwrap();
    let after = serde_json::to_value(job.info()).unwrap();
    assert_eq!(after["state"], "DONE");
    assert_eq!(after["exit_code"], 0);
    assert_eq!(after["id"], job.id().unwrap().as_str());
    service.close().await;
}

#[tokio::test]
async fn dropped_service_makes_jobs_unusable() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;
    let job = Job::new(&service, JobDescription::new("/bin/true"));
    service.close().await;
    drop(service);

    let err = job.run().await.unwrap_err();
    assert!(matches!(err, Error::IncorrectState(_)), "got {:?}", err);
}

#[tokio::test]
async fn handles_are_distinct() {
    let store = TempDir::new().unwrap();
    let service = local_service(&store).await;
    let a = Job::new(&service, JobDescription::new("/bin/true"));
    let b = Job::new(&service, JobDescription::new("/bin/true"));
    assert_ne!(a.handle_id(), b.handle_id());
    service.close().await;
}
