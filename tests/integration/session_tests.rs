//! Shell session behavior against a local `/bin/sh` on a pty.

use std::sync::Arc;
use std::time::Duration;

use portable_pty::CommandBuilder;
use rusty_jobs::config::SessionConfig;
use rusty_jobs::shell::{CopyPath, LauncherRegistry, ShellLauncher, Transport};
use rusty_jobs::{ConnectParams, Endpoint, Error, IoMode, ShellSession};

use super::common::local_session;

/// Starts an arbitrary program instead of a shell.
struct ScriptLauncher {
    script: &'static str,
}

impl ShellLauncher for ScriptLauncher {
    fn transport(&self) -> Transport {
        Transport::Fork
    }

    fn shell_command(&self, _endpoint: &Endpoint, _params: &ConnectParams, _shell: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.args(["-c", self.script]);
        cmd
    }

    fn copy_command(
        &self,
        _endpoint: &Endpoint,
        _params: &ConnectParams,
        _source: CopyPath<'_>,
        _target: CopyPath<'_>,
        _recursive: bool,
    ) -> Option<Vec<String>> {
        None
    }
}

async fn open_scripted(script: &'static str, connect_timeout_secs: u64) -> rusty_jobs::Result<ShellSession> {
    let mut registry = LauncherRegistry::empty();
    registry.register("scripted", Arc::new(ScriptLauncher { script }));
    let config = SessionConfig {
        connect_timeout_secs,
        ..SessionConfig::default()
    };
    let endpoint = Endpoint::parse("scripted://localhost").unwrap();
    ShellSession::open_with(&registry, endpoint, ConnectParams::default(), config).await
}

#[tokio::test]
async fn echo_returns_output_and_status() {
    let session = local_session().await;

    let out = session.run_sync("echo hello", None).await.unwrap();
    assert_eq!(out.exit_code, Some(0));
    assert_eq!(out.stdout, "hello\n");
    assert!(out.success());

    let out = session.run_sync("false", None).await.unwrap();
    assert_eq!(out.exit_code, Some(1));
    assert_eq!(out.stdout, "");

    let out = session.run_sync("(exit 42)", None).await.unwrap();
    assert_eq!(out.exit_code, Some(42));

    session.finalize(false).await;
}

#[tokio::test]
async fn multi_line_output_is_kept_in_order() {
    let session = local_session().await;
    let out = session
        .run_sync("for i in 1 2 3; do echo line$i; done", None)
        .await
        .unwrap();
    assert_eq!(out.stdout, "line1\nline2\nline3\n");
    session.finalize(true).await;
}

#[tokio::test]
async fn separate_mode_splits_stderr() {
    let session = local_session().await;
    let out = session
        .run_sync_with("echo to-out; echo to-err >&2; (exit 3)", IoMode::Separate, None)
        .await
        .unwrap();
    assert_eq!(out.exit_code, Some(3));
    assert_eq!(out.stdout, "to-out\n");
    assert_eq!(out.stderr, "to-err\n");

    // merged mode sees both streams in one
    let out = session.run_sync("echo a; echo b >&2", None).await.unwrap();
    assert!(out.stdout.contains('a'));
    assert!(out.stdout.contains('b'));
    assert_eq!(out.stderr, "");
    session.finalize(true).await;
}

#[tokio::test]
async fn run_async_accepts_follow_up_input() {
    let session = local_session().await;
    let mut pending = session.run_async("cat <<'EOF'").await.unwrap();
    pending.send("first\n").unwrap();
    pending.send("second\nEOF\n").unwrap();
    let out = pending.find_prompt(None).await.unwrap();
    assert_eq!(out.stdout, "first\nsecond\n");
    assert_eq!(out.exit_code, Some(0));
    session.finalize(true).await;
}

#[tokio::test]
async fn timeout_keeps_session_usable() {
    let session = local_session().await;

    let err = session
        .run_sync("sleep 2; echo late", Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got {:?}", err);
    assert!(err.is_recoverable());
    assert!(session.alive());

    // the late output of the abandoned command must not leak into this one
    let out = session.run_sync("echo next", None).await.unwrap();
    assert_eq!(out.stdout, "next\n");
    assert_eq!(out.exit_code, Some(0));
    session.finalize(true).await;
}

#[tokio::test]
async fn concurrent_callers_are_serialized() {
    let session = Arc::new(local_session().await);
    let a = session.clone();
    let b = session.clone();

    let (left, right) = tokio::join!(
        async move { a.run_sync("sleep 0.3; echo left", None).await },
        async move { b.run_sync("echo right", None).await },
    );
    assert_eq!(left.unwrap().stdout, "left\n");
    assert_eq!(right.unwrap().stdout, "right\n");
    session.finalize(true).await;
}

#[tokio::test]
async fn finalize_is_idempotent() {
    let session = local_session().await;
    assert!(session.alive());
    assert!(session.pid().is_some());

    session.finalize(false).await;
    session.finalize(false).await;
    session.finalize(true).await;
    assert!(!session.alive());

    let err = session.run_sync("echo nope", None).await.unwrap_err();
    assert!(matches!(err, Error::IncorrectState(_)), "got {:?}", err);
}

#[tokio::test]
async fn exiting_shell_marks_session_dead() {
    let session = local_session().await;
    let err = session.run_sync("exit", Some(Duration::from_secs(5))).await.unwrap_err();
    assert!(matches!(err, Error::IncorrectState(_)), "got {:?}", err);
    assert!(!session.alive());

    let err = session.run_sync("echo again", None).await.unwrap_err();
    assert!(matches!(err, Error::IncorrectState(_)), "got {:?}", err);
}

#[tokio::test]
async fn invalid_prompt_pattern_is_rejected() {
    let session = local_session().await;
    let err = session.set_prompt("([unclosed").await.unwrap_err();
    assert!(matches!(err, Error::BadParameter(_)), "got {:?}", err);

    // the session prompt is still in effect
    let out = session.run_sync("echo ok", None).await.unwrap();
    assert_eq!(out.stdout, "ok\n");
    session.finalize(true).await;
}

#[tokio::test]
async fn unsupported_scheme_is_bad_parameter() {
    let endpoint = Endpoint::parse("gopher://localhost").unwrap();
    let err = ShellSession::open(endpoint, ConnectParams::default(), SessionConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::BadParameter(_)), "got {:?}", err);
}

#[tokio::test]
async fn rejected_login_is_connection_error() {
    let err = open_scripted("echo 'alice@host: Permission denied (publickey).'; sleep 5", 10)
        .await
        .err()
        .unwrap();
    match err {
        Error::Connection(message) => assert!(message.contains("Permission denied"), "{}", message),
        other => panic!("expected a connection error, got {:?}", other),
    }
}

#[tokio::test]
async fn silent_login_times_out_as_connection_error() {
    let err = open_scripted("sleep 30", 1).await.err().unwrap();
    assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
}

#[tokio::test]
async fn early_exit_during_login_is_connection_error() {
    let err = open_scripted("echo goodbye", 10).await.err().unwrap();
    assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
}

#[tokio::test]
async fn session_reports_its_transport() {
    let session = local_session().await;
    assert_eq!(session.transport(), Transport::Fork);
    assert_eq!(session.endpoint().scheme, "fork");
    session.finalize(true).await;
}
