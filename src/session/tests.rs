//! Tests for the session registry, event loop and service API

use super::record::SessionTimers;
use super::signal::{SessionSignal, TimerKind};
use super::*;
use crate::config::BridgeConfig;
use crate::error::ErrorCode;
use crate::events::{EventErrorCode, InfoType, OutputEvent};
use crate::subprocess::{ExitOutcome, KillSignal, MockFailure};
use crate::testing::{test_config, RejectingValidator, StaticLocator, TestHarness};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn progress_count(harness: &TestHarness) -> usize {
    harness
        .events()
        .iter()
        .filter(|e| matches!(e, OutputEvent::Info { kind: InfoType::Progress, .. }))
        .count()
}

fn responses(harness: &TestHarness) -> Vec<(String, Vec<String>)> {
    harness
        .events()
        .into_iter()
        .filter_map(|e| match e {
            OutputEvent::Response { data, tools, .. } => Some((data, tools)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_session_id_format() {
    let pattern = Regex::new(r"^session_\d+_[a-z0-9]{9}$").unwrap();
    let a = SessionId::generate();
    let b = SessionId::generate();
    assert!(pattern.is_match(a.as_str()), "{a}");
    assert_ne!(a, b);
    assert_eq!(serde_json::to_value(&a).unwrap(), serde_json::json!(a.as_str()));
}

#[test]
fn test_status_terminal_states() {
    assert!(!SessionStatus::Starting.is_terminal());
    assert!(!SessionStatus::Running.is_terminal());
    for status in [
        SessionStatus::Completed,
        SessionStatus::Error,
        SessionStatus::Aborted,
        SessionStatus::Terminated,
    ] {
        assert!(status.is_terminal(), "{status}");
    }
    assert_eq!(
        serde_json::to_value(SessionStatus::Terminated).unwrap(),
        "terminated"
    );
}

#[test]
fn test_start_request_deserialization() {
    let request: StartRequest = serde_json::from_value(serde_json::json!({
        "command": "chat --trust-all-tools",
        "workingDir": "/tmp/project",
        "resume": true,
        "timeout": "5s"
    }))
    .unwrap();
    assert_eq!(
        request,
        StartRequest::new("chat --trust-all-tools", "/tmp/project")
            .with_resume(true)
            .with_timeout(Duration::from_secs(5))
    );
    assert!(request.model.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timers_ignore_superseded_fires() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = SessionId::from_string("session_1_timers000".to_string());
    let mut timers = SessionTimers::new(id.clone(), tx);

    timers.arm(TimerKind::StdoutFlush, Duration::from_millis(200));
    timers.arm(TimerKind::StdoutFlush, Duration::from_millis(200));
    assert!(timers.is_armed(TimerKind::StdoutFlush));

    tokio::time::sleep(Duration::from_millis(250)).await;
    let (fired_id, signal) = rx.recv().await.unwrap();
    assert_eq!(fired_id, id);
    let SessionSignal::Timer(kind, generation) = signal else {
        panic!("expected a timer signal");
    };
    assert_eq!(kind, TimerKind::StdoutFlush);
    assert!(!timers.take_fired(kind, generation - 1));
    assert!(timers.take_fired(kind, generation));
    assert!(!timers.is_armed(kind));
    assert!(rx.try_recv().is_err());

    timers.arm(TimerKind::Removal, Duration::from_secs(5));
    timers.clear();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_start_then_double_abort() {
    let harness = TestHarness::new();
    let (id, process) = harness.start_chat("/tmp/project").await.unwrap();

    let pattern = Regex::new(r"^session_\d+_[a-z0-9]{9}$").unwrap();
    assert!(pattern.is_match(id.as_str()));
    let launches = harness.launcher.launches();
    assert_eq!(launches[0].program, "/usr/local/bin/q");
    assert_eq!(launches[0].args, vec!["chat".to_string()]);

    assert!(harness.service.abort(&id, "user"));
    assert!(!harness.service.abort(&id, "user"));
    assert_eq!(process.signals(), vec![KillSignal::Terminate]);

    tokio::time::advance(Duration::from_secs(4)).await;
    harness.settle().await;
    assert_eq!(process.signals(), vec![KillSignal::Terminate]);

    tokio::time::advance(Duration::from_secs(2)).await;
    harness.settle().await;
    assert_eq!(process.signals(), vec![KillSignal::Terminate, KillSignal::Kill]);

    let aborted = harness.events_named("session:aborted");
    assert_eq!(aborted.len(), 1);
    assert!(matches!(
        &aborted[0],
        OutputEvent::SessionAborted { reason, exit_code: None, .. } if reason == "user"
    ));
    assert!(harness.service.status(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_thinking_tool_and_exit() {
    let harness = TestHarness::new();
    let (id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.write_stdout("Thinking...\n").await;
    process.write_stdout("Thinking....\n").await;
    harness.settle().await;
    process
        .write_stdout("🛠️ Using tool: fs_read\nHello\n")
        .await;
    harness.settle().await;

    process.exit(ExitOutcome::Code(0));
    process.close_output();
    harness.settle().await;

    assert_eq!(progress_count(&harness), 1);
    assert_eq!(
        responses(&harness),
        vec![("Hello\n\n".to_string(), vec!["fs_read".to_string()])]
    );
    let complete = harness.events_named("complete");
    assert_eq!(complete.len(), 1);
    assert!(matches!(
        complete[0],
        OutputEvent::Complete { exit_code: Some(0), .. }
    ));

    assert_eq!(harness.events().last().map(|e| e.name()), Some("complete"));

    let snapshot = harness.service.status(&id).unwrap();
    assert_eq!(snapshot.status, SessionStatus::Terminated);
    assert_eq!(snapshot.tools_used, vec!["fs_read".to_string()]);
    assert_eq!(snapshot.exit, Some(ExitOutcome::Code(0)));
}

#[tokio::test(start_paused = true)]
async fn test_terminated_session_removed_after_grace() {
    let harness = TestHarness::new();
    let (id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.exit(ExitOutcome::Code(0));
    process.close_output();
    harness.settle().await;
    assert_eq!(
        harness.service.status(&id).map(|s| s.status),
        Some(SessionStatus::Terminated)
    );
    assert!(!harness.service.abort(&id, "late"));

    tokio::time::advance(Duration::from_secs(5)).await;
    harness.settle().await;
    assert!(harness.service.status(&id).is_none());
    assert_eq!(harness.service.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_init_banner_aggregated_from_stderr() {
    let harness = TestHarness::new();
    let (_id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.write_stderr("Welcome to Amazon Q!\n").await;
    process.write_stderr("✓ github loaded in 0.42 s\n").await;
    process.write_stderr("✓ fetch loaded in 1.10 s\n").await;
    process
        .write_stderr("✓ 2 of 2 mcp servers initialized.\n")
        .await;
    harness.settle().await;
    assert!(harness.events().is_empty());

    tokio::time::advance(Duration::from_millis(1000)).await;
    harness.settle().await;

    let events = harness.events();
    assert_eq!(events.len(), 1);
    let OutputEvent::Info { message, kind, .. } = &events[0] else {
        panic!("unexpected {:?}", events[0]);
    };
    assert_eq!(*kind, InfoType::Initialization);
    assert!(message.contains("Welcome to Amazon Q!"));
    assert!(message.contains("github"));
    assert!(message.contains("fetch"));

    // Superseded idle timers must not produce a second banner.
    tokio::time::advance(Duration::from_secs(20)).await;
    harness.settle().await;
    assert_eq!(harness.events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_answer_text_closes_banner_phase() {
    let harness = TestHarness::new();
    let (_id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process
        .write_stdout("Sure, here is the plan.\n! run the tests first\n\n")
        .await;
    harness.settle().await;

    assert_eq!(
        responses(&harness),
        vec![(
            "Sure, here is the plan.\n! run the tests first\n\n".to_string(),
            Vec::new()
        )]
    );

    tokio::time::advance(Duration::from_secs(16)).await;
    harness.settle().await;
    assert!(!harness
        .events()
        .iter()
        .any(|e| matches!(e, OutputEvent::Info { kind: InfoType::Initialization, .. })));
}

#[tokio::test(start_paused = true)]
async fn test_banner_released_before_first_answer() {
    let harness = TestHarness::new();
    let (_id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.write_stderr("Welcome to Amazon Q!\n").await;
    harness.settle().await;
    process.write_stdout("Hello there\n\n").await;
    harness.settle().await;

    let names: Vec<&str> = harness.events().iter().map(OutputEvent::name).collect();
    assert_eq!(names, vec!["info", "response"]);
}

#[tokio::test(start_paused = true)]
async fn test_input_resets_thinking() {
    let harness = TestHarness::new();
    let (id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.write_stdout("Thinking...\nThinking...\n").await;
    harness.settle().await;
    assert_eq!(progress_count(&harness), 1);

    harness.service.send_input(&id, "what next?").unwrap();
    harness.settle().await;
    assert_eq!(process.read_stdin().await, "what next?\n");

    process.write_stdout("Thinking...\n").await;
    harness.settle().await;
    assert_eq!(progress_count(&harness), 2);
}

#[tokio::test(start_paused = true)]
async fn test_banner_from_input_precedes_reply() {
    let harness = TestHarness::new();
    let (id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.write_stderr("Welcome to Amazon Q!\n").await;
    harness.settle().await;
    assert!(harness.events().is_empty());

    harness.service.send_input(&id, "hello").unwrap();
    process.write_stdout("Hi! How can I help?\n\n").await;
    harness.settle().await;

    let events = harness.events();
    let names: Vec<&str> = events.iter().map(OutputEvent::name).collect();
    assert_eq!(names, vec!["info", "response"]);
    assert!(matches!(
        &events[0],
        OutputEvent::Info { kind: InfoType::Initialization, .. }
    ));
    assert_eq!(process.read_stdin().await, "hello\n");
}

#[tokio::test(start_paused = true)]
async fn test_prompt_fragment_resets_thinking() {
    let harness = TestHarness::new();
    let (_id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.write_stdout("Thinking...\nAnswer\n\n> ").await;
    harness.settle().await;
    tokio::time::advance(Duration::from_millis(200)).await;
    harness.settle().await;

    process.write_stdout("Thinking...\n").await;
    harness.settle().await;

    assert_eq!(progress_count(&harness), 2);
    assert_eq!(responses(&harness), vec![("Answer\n\n".to_string(), vec![])]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_fragment_flushed_after_delay() {
    let harness = TestHarness::new();
    let (_id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.write_stdout("Hello th").await;
    harness.settle().await;
    tokio::time::advance(Duration::from_millis(100)).await;
    process.write_stdout("ere").await;
    harness.settle().await;
    tokio::time::advance(Duration::from_millis(150)).await;
    harness.settle().await;
    assert!(responses(&harness).is_empty());

    tokio::time::advance(Duration::from_millis(60)).await;
    harness.settle().await;
    assert_eq!(responses(&harness), vec![("Hello there\n\n".to_string(), vec![])]);
}

#[tokio::test(start_paused = true)]
async fn test_tool_only_paragraph_attaches_to_next_response() {
    let harness = TestHarness::new();
    let (id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process
        .write_stdout("🛠️ Using tool: fs_write (trusted)\n\nFile written.\n\n")
        .await;
    harness.settle().await;

    assert_eq!(
        responses(&harness),
        vec![("File written.\n\n".to_string(), vec!["fs_write".to_string()])]
    );
    let snapshot = harness.service.status(&id).unwrap();
    assert_eq!(snapshot.tools_used, vec!["fs_write".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_stderr_classification_and_info_dedup() {
    let harness = TestHarness::new();
    let (_id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.write_stderr("Error: connection refused\n").await;
    process.write_stderr("⠋\n").await;
    process.write_stderr("Checking for updates\n").await;
    process.write_stderr("Checking for updates\n").await;
    harness.settle().await;

    let errors = harness.events_named("error");
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        OutputEvent::Error { code: EventErrorCode::StderrOutput, error, .. }
            if error == "Error: connection refused"
    ));
    assert_eq!(harness.events_named("info").len(), 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    process.write_stderr("Checking for updates\n").await;
    harness.settle().await;
    assert_eq!(harness.events_named("info").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_process_error_reported() {
    let harness = TestHarness::new();
    let (id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.fail("child vanished");
    harness.settle().await;

    let errors = harness.events_named("error");
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        OutputEvent::Error { code: EventErrorCode::ProcessError, .. }
    ));
    assert_eq!(
        harness.service.status(&id).map(|s| s.status),
        Some(SessionStatus::Error)
    );
    assert!(harness.service.send_input(&id, "hi").is_err());

    process.close_output();
    harness.settle().await;
    let complete = harness.events_named("complete");
    assert!(matches!(
        complete.as_slice(),
        [OutputEvent::Complete { exit_code: None, .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_send_input_rejections() {
    let harness = TestHarness::new();
    let unknown = SessionId::from_string("session_0_missing00".to_string());
    let err = harness.service.send_input(&unknown, "hi").unwrap_err();
    assert_eq!(err.code(), ErrorCode::SESSION_NOT_FOUND);

    let (id, mut process) = harness.start_chat("/tmp/project").await.unwrap();
    process.exit(ExitOutcome::Code(0));
    harness.settle().await;

    let err = harness.service.send_input(&id, "hi").unwrap_err();
    assert_eq!(err.code(), ErrorCode::SESSION_INVALID_STATE);
    assert!(!harness.service.abort(&id, "user"));
}

#[tokio::test(start_paused = true)]
async fn test_start_failures_never_register() {
    let rejecting = TestHarness::with_collaborators(
        test_config(),
        Arc::new(RejectingValidator("outside workspace".to_string())),
        Arc::new(StaticLocator::available("/usr/local/bin/q")),
    );
    let err = rejecting.start_chat("/etc").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SESSION_INVALID_PATH);
    assert!(err.is_startup_failure());
    assert_eq!(rejecting.launcher.launch_count(), 0);

    let missing_cli = TestHarness::with_collaborators(
        test_config(),
        Arc::new(crate::testing::AcceptingValidator),
        Arc::new(StaticLocator::unavailable("q not on PATH")),
    );
    let err = missing_cli.start_chat("/tmp/project").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SESSION_CLI_UNAVAILABLE);

    let harness = TestHarness::new();
    harness.launcher.fail_next(MockFailure::SpawnError);
    let err = harness.start_chat("/tmp/project").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::EXEC_SPAWN_FAILED);

    harness.launcher.fail_next(MockFailure::Hang);
    let err = harness
        .service
        .start(StartRequest::new("chat", "/tmp/project").with_timeout(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::EXEC_TIMEOUT);

    assert_eq!(harness.service.session_count(), 0);
    assert!(harness.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resume_argument_appended() {
    let harness = TestHarness::new();
    harness
        .service
        .start(StartRequest::new("  chat   --trust-all-tools ", "/tmp/project").with_resume(true))
        .await
        .unwrap();
    assert_eq!(
        harness.launcher.launches()[0].args,
        vec!["chat", "--trust-all-tools", "--resume"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_idle_sweep_terminates_session() {
    let config = BridgeConfig {
        inactivity_timeout: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(10),
        ..test_config()
    };
    let harness = TestHarness::with_config(config);
    let (id, process) = harness.start_chat("/tmp/project").await.unwrap();

    tokio::time::sleep(Duration::from_secs(55)).await;
    assert_eq!(harness.service.session_count(), 1);

    tokio::time::sleep(Duration::from_secs(20)).await;
    harness.settle().await;
    assert!(harness.service.status(&id).is_none());
    assert_eq!(process.signals().first(), Some(&KillSignal::Terminate));
    assert!(matches!(
        harness.events_named("error").as_slice(),
        [OutputEvent::Error { code: EventErrorCode::SessionTimeout, .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_everything() {
    let harness = TestHarness::new();
    let (_a, first) = harness.start_chat("/tmp/a").await.unwrap();
    let (_b, second) = harness.start_chat("/tmp/b").await.unwrap();
    assert_eq!(harness.service.list_sessions().len(), 2);

    harness.service.shutdown();

    assert_eq!(harness.service.session_count(), 0);
    let aborted = harness.events_named("session:aborted");
    assert_eq!(aborted.len(), 2);
    assert!(aborted.iter().all(|e| matches!(
        e,
        OutputEvent::SessionAborted { reason, .. } if reason == "shutdown"
    )));
    assert_eq!(first.signals(), vec![KillSignal::Terminate]);
    assert_eq!(second.signals(), vec![KillSignal::Terminate]);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_serialization() {
    let harness = TestHarness::new();
    let (id, process) = harness
        .service
        .start(StartRequest::new("chat", "/tmp/project").with_model("claude"))
        .await
        .map(|id| (id, harness.launcher.take_process().unwrap()))
        .unwrap();

    let value = serde_json::to_value(harness.service.status(&id).unwrap()).unwrap();
    assert_eq!(value["id"], id.as_str());
    assert_eq!(value["status"], "running");
    assert_eq!(value["workingDir"], "/tmp/project");
    assert_eq!(value["model"], "claude");
    assert_eq!(value["pid"], process.pid());
    assert!(value["resources"].is_null());
}
