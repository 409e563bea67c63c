//! End-to-end session flows against mock children through the public API.

use qchat_bridge::events::{InfoType, OutputEvent};
use qchat_bridge::session::{SessionStatus, StartRequest};
use qchat_bridge::subprocess::{ExitOutcome, KillSignal};
use qchat_bridge::testing::TestHarness;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_full_conversation_flow() {
    let harness = TestHarness::new();
    let (id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    // Startup banner on stderr, decorated
    process
        .write_stderr("\x1b[1mWelcome to Amazon Q!\x1b[0m\n")
        .await;
    process.write_stderr("✓ github loaded in 0.42 s\n").await;
    process
        .write_stderr("✓ 1 of 1 mcp servers initialized.\n")
        .await;
    harness.settle().await;
    tokio::time::advance(Duration::from_millis(1000)).await;
    harness.settle().await;

    harness.service.send_input(&id, "list files").unwrap();
    harness.settle().await;
    assert_eq!(process.read_stdin().await, "list files\n");

    process
        .write_stderr("⠋ Thinking...\n⠙ Thinking...\n")
        .await;
    harness.settle().await;

    process
        .write_stdout("🛠️ Using tool: fs_read (trusted)\n\nHere are the files:\n- a.txt\n- b.txt\n\n")
        .await;
    process.write_stdout("> ").await;
    harness.settle().await;
    tokio::time::advance(Duration::from_millis(200)).await;
    harness.settle().await;

    process.exit(ExitOutcome::Code(0));
    process.close_output();
    harness.settle().await;

    let events = harness.events();
    let names: Vec<&str> = events.iter().map(OutputEvent::name).collect();
    assert_eq!(names, vec!["info", "info", "response", "complete"]);

    match &events[0] {
        OutputEvent::Info { message, kind, .. } => {
            assert_eq!(*kind, InfoType::Initialization);
            assert!(message.starts_with("Welcome to Amazon Q!"));
            assert!(message.contains("github"));
            assert!(!message.contains('\x1b'));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        &events[1],
        OutputEvent::Info { kind: InfoType::Progress, message, .. } if message == "Thinking..."
    ));
    match &events[2] {
        OutputEvent::Response {
            data,
            tools,
            has_tool_content,
            ..
        } => {
            assert_eq!(data, "Here are the files:\n- a.txt\n- b.txt\n\n");
            assert_eq!(tools, &vec!["fs_read".to_string()]);
            assert!(has_tool_content);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        events[3],
        OutputEvent::Complete { exit_code: Some(0), .. }
    ));
    assert!(events.iter().all(|e| e.session_id() == &id));
}

#[tokio::test(start_paused = true)]
async fn test_output_split_across_chunks() {
    let harness = TestHarness::new();
    let (_id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    let text = "First paragraph line one\nline two\n\nSecond 🦀 paragraph\n\n".as_bytes();
    for chunk in text.chunks(3) {
        process.write_stdout(chunk).await;
        harness.settle().await;
    }

    let data: Vec<String> = harness
        .events()
        .into_iter()
        .filter_map(|e| match e {
            OutputEvent::Response { data, .. } => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(
        data,
        vec![
            "First paragraph line one\nline two\n\n".to_string(),
            "Second 🦀 paragraph\n\n".to_string()
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_signal_terminated_child_completes_without_code() {
    let harness = TestHarness::new();
    let (id, mut process) = harness.start_chat("/tmp/project").await.unwrap();

    process.write_stdout("partial answer").await;
    harness.settle().await;
    process.exit(ExitOutcome::Signal(9));
    process.close_output();
    harness.settle().await;

    let events = harness.events();
    assert!(matches!(
        &events[0],
        OutputEvent::Response { data, .. } if data == "partial answer\n\n"
    ));
    assert!(matches!(
        events.last(),
        Some(OutputEvent::Complete { exit_code: None, .. })
    ));
    assert_eq!(
        harness.service.status(&id).map(|s| s.status),
        Some(SessionStatus::Terminated)
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sessions_are_isolated() {
    let harness = TestHarness::new();
    let (first_id, mut first) = harness.start_chat("/tmp/a").await.unwrap();
    let (second_id, mut second) = harness
        .service
        .start(StartRequest::new("chat", "/tmp/b"))
        .await
        .map(|id| (id, harness.launcher.take_process().unwrap()))
        .unwrap();
    assert_ne!(first_id, second_id);

    first.write_stdout("Thinking...\n").await;
    second.write_stdout("Thinking...\n").await;
    first.write_stdout("from first\n\n").await;
    second.write_stdout("from second\n\n").await;
    harness.settle().await;

    for id in [&first_id, &second_id] {
        let events: Vec<OutputEvent> = harness
            .events()
            .into_iter()
            .filter(|e| e.session_id() == id)
            .collect();
        assert_eq!(events.len(), 2, "{id}");
    }

    assert!(harness.service.abort(&first_id, "user"));
    assert_eq!(first.signals(), vec![KillSignal::Terminate]);
    assert!(second.signals().is_empty());
    assert_eq!(harness.service.list_sessions().len(), 1);
}
