// CommandRunner against real shell-script agents: invocation on stdin,
// marker parsing, answers, timeout, and cancellation.

use std::sync::Arc;
use std::time::Duration;

use hydra_agent::runner::CommandRunner;
use hydra_core::agent::{AgentIo, AgentRunner, WorkerEvent};
use hydra_core::types::{AgentInvocation, AgentVerdict, WorkerRole, WorkerStatus};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn write_agent(dir: &TempDir, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write agent script");
    let mut perms = std::fs::metadata(&path).expect("stat").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path.to_string_lossy().into_owned()
}

fn invocation(issue: u64) -> AgentInvocation {
    AgentInvocation {
        role: WorkerRole::Implement,
        issue,
        pr: None,
        branch: None,
        feedback: None,
    }
}

struct Io {
    io: AgentIo,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    answers: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

fn wire_io() -> Io {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (answer_tx, answer_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    Io {
        io: AgentIo {
            events: event_tx,
            answers: answer_rx,
            cancel: cancel.clone(),
        },
        events: event_rx,
        answers: answer_tx,
        cancel,
    }
}

#[tokio::test]
async fn marker_stream_produces_status_and_transcript_events() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(
        &dir,
        r#"read invocation
echo "::hydra:status planning"
echo "working on it"
echo "::hydra:status testing"
echo '::hydra:result {"verdict":"ok","pr":200,"branch":"issue-1"}'"#,
    );

    let mut io = wire_io();
    let runner = CommandRunner::new(agent);
    let outcome = runner
        .run(invocation(1), io.io)
        .await
        .expect("runner succeeds");

    assert_eq!(outcome.verdict, AgentVerdict::Ok);
    assert_eq!(outcome.pr, Some(200));
    assert_eq!(outcome.branch.as_deref(), Some("issue-1"));

    let mut statuses = Vec::new();
    let mut transcript = Vec::new();
    while let Ok(event) = io.events.try_recv() {
        match event {
            WorkerEvent::Status(s) => statuses.push(s),
            WorkerEvent::Transcript(t) => transcript.push(t),
            WorkerEvent::Question(_) => {}
        }
    }
    assert_eq!(statuses, vec![WorkerStatus::Planning, WorkerStatus::Testing]);
    assert_eq!(transcript, vec!["working on it".to_string()]);
}

#[tokio::test]
async fn invocation_arrives_as_json_on_stdin() {
    let dir = TempDir::new().expect("tempdir");
    // Echo the invocation back so it shows up as transcript.
    let agent = write_agent(
        &dir,
        r#"read invocation
echo "got: $invocation"
echo '::hydra:result {"verdict":"ok"}'"#,
    );

    let mut io = wire_io();
    let runner = CommandRunner::new(agent);
    let outcome = runner
        .run(invocation(7), io.io)
        .await
        .expect("runner succeeds");
    assert_eq!(outcome.verdict, AgentVerdict::Ok);

    let mut echoed = String::new();
    while let Ok(event) = io.events.try_recv() {
        if let WorkerEvent::Transcript(t) = event {
            echoed.push_str(&t);
        }
    }
    assert!(echoed.contains(r#""issue_number":7"#), "stdin payload missing: {echoed}");
    assert!(echoed.contains(r#""role":"implement""#));
}

#[tokio::test]
async fn nonzero_exit_is_failed() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(
        &dir,
        r#"read invocation
echo "boom"
exit 3"#,
    );

    let io = wire_io();
    let runner = CommandRunner::new(agent);
    let outcome = runner.run(invocation(2), io.io).await.expect("runner succeeds");
    assert_eq!(outcome.verdict, AgentVerdict::Failed);
    assert!(outcome.cause.unwrap_or_default().contains("status 3"));
}

#[tokio::test]
async fn clean_exit_without_result_is_failed() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(
        &dir,
        r#"read invocation
echo "did things"
exit 0"#,
    );

    let io = wire_io();
    let runner = CommandRunner::new(agent);
    let outcome = runner.run(invocation(3), io.io).await.expect("runner succeeds");
    assert_eq!(outcome.verdict, AgentVerdict::Failed);
    assert!(outcome.cause.unwrap_or_default().contains("without a result"));
}

#[tokio::test]
async fn malformed_result_is_failed() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(
        &dir,
        r#"read invocation
echo '::hydra:result {broken'
exit 0"#,
    );

    let io = wire_io();
    let runner = CommandRunner::new(agent);
    let outcome = runner.run(invocation(4), io.io).await.expect("runner succeeds");
    assert_eq!(outcome.verdict, AgentVerdict::Failed);
    assert!(outcome.cause.unwrap_or_default().contains("invalid result payload"));
}

#[tokio::test]
async fn overrunning_agent_is_timed_out() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(
        &dir,
        r#"read invocation
sleep 30"#,
    );

    let io = wire_io();
    let runner = CommandRunner::new(agent).with_timeout(Duration::from_secs(1));
    let started = std::time::Instant::now();
    let outcome = runner.run(invocation(5), io.io).await.expect("runner succeeds");
    assert_eq!(outcome.verdict, AgentVerdict::Failed);
    assert!(outcome.cause.unwrap_or_default().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio::test]
async fn cancellation_terminates_the_agent() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(
        &dir,
        r#"read invocation
sleep 30"#,
    );

    let io = wire_io();
    let cancel = io.cancel.clone();
    let runner = Arc::new(CommandRunner::new(agent));

    let handle = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.run(invocation(6), io.io).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let outcome = handle.await.expect("join").expect("runner succeeds");
    assert_eq!(outcome.verdict, AgentVerdict::Failed);
    assert_eq!(outcome.cause.as_deref(), Some("canceled"));
}

#[tokio::test]
async fn answers_reach_the_agent_stdin() {
    let dir = TempDir::new().expect("tempdir");
    let agent = write_agent(
        &dir,
        r#"read invocation
echo "::hydra:question which database?"
read answer
echo "answer: $answer"
echo '::hydra:result {"verdict":"ok"}'"#,
    );

    let mut io = wire_io();
    let answers = io.answers.clone();
    let runner = Arc::new(CommandRunner::new(agent));
    let handle = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.run(invocation(8), io.io).await })
    };

    // Reply as soon as the question arrives.
    let mut transcript = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, io.events.recv())
            .await
            .expect("agent went quiet")
            .expect("event stream open");
        match event {
            WorkerEvent::Question(q) => {
                assert_eq!(q, "which database?");
                answers.send("postgres".into()).expect("send answer");
            }
            WorkerEvent::Transcript(t) => {
                let done = t.starts_with("answer:");
                transcript.push(t);
                if done {
                    break;
                }
            }
            WorkerEvent::Status(_) => {}
        }
    }

    let outcome = handle.await.expect("join").expect("runner succeeds");
    assert_eq!(outcome.verdict, AgentVerdict::Ok);
    assert!(transcript.iter().any(|t| t == "answer: postgres"));
}
