// Marker grammar: status, question, and result lines, plus the
// schema-violation collapse to a failed outcome.

use hydra_agent::wire::{parse_line, parse_result, Line};
use hydra_core::types::{AgentVerdict, WorkerStatus};

#[test]
fn status_markers_parse_to_worker_statuses() {
    for (input, expected) in [
        ("::hydra:status planning", WorkerStatus::Planning),
        ("::hydra:status testing", WorkerStatus::Testing),
        ("::hydra:status committing", WorkerStatus::Committing),
        ("::hydra:status reviewing", WorkerStatus::Reviewing),
        ("::hydra:status quality_fix", WorkerStatus::QualityFix),
    ] {
        match parse_line(input) {
            Line::Status(status) => assert_eq!(status, expected, "for {input:?}"),
            other => panic!("expected status for {input:?}, got {other:?}"),
        }
    }
}

#[test]
fn unknown_status_marker_falls_through_to_transcript() {
    match parse_line("::hydra:status daydreaming") {
        Line::Text(text) => assert!(text.contains("daydreaming")),
        other => panic!("expected transcript, got {other:?}"),
    }
}

#[test]
fn question_marker_carries_the_question_text() {
    match parse_line("::hydra:question Which table should hold the badge?") {
        Line::Question(q) => assert_eq!(q, "Which table should hold the badge?"),
        other => panic!("expected question, got {other:?}"),
    }
}

#[test]
fn plain_lines_are_transcript() {
    match parse_line("compiling 3 crates...") {
        Line::Text(text) => assert_eq!(text, "compiling 3 crates..."),
        other => panic!("expected transcript, got {other:?}"),
    }
}

#[test]
fn result_parses_verdict_and_pr() {
    let outcome =
        parse_result(r#"{"verdict":"ok","pr":200,"pr_url":"https://h/pulls/200","branch":"issue-1"}"#);
    assert_eq!(outcome.verdict, AgentVerdict::Ok);
    assert_eq!(outcome.pr, Some(200));
    assert_eq!(outcome.branch.as_deref(), Some("issue-1"));
}

#[test]
fn result_verdict_aliases() {
    assert_eq!(parse_result(r#"{"verdict":"success"}"#).verdict, AgentVerdict::Ok);
    assert_eq!(parse_result(r#"{"verdict":"done"}"#).verdict, AgentVerdict::Ok);
    assert_eq!(parse_result(r#"{"verdict":"failed"}"#).verdict, AgentVerdict::Failed);
    assert_eq!(
        parse_result(r#"{"verdict":"escalated","cause":"needs design input"}"#).verdict,
        AgentVerdict::Escalated
    );
    assert_eq!(
        parse_result(r#"{"verdict":"credits_exhausted"}"#).verdict,
        AgentVerdict::Credits
    );
}

#[test]
fn escalation_carries_cause_and_memory_flag() {
    let outcome = parse_result(r#"{"verdict":"escalated","cause":"remember: prefer sqlx","memory_suggestion":true}"#);
    assert_eq!(outcome.verdict, AgentVerdict::Escalated);
    assert!(outcome.memory_suggestion);
    assert_eq!(outcome.cause.as_deref(), Some("remember: prefer sqlx"));
}

#[test]
fn malformed_result_json_is_a_failed_outcome() {
    let outcome = parse_result("{not json");
    assert_eq!(outcome.verdict, AgentVerdict::Failed);
    assert!(outcome.cause.unwrap_or_default().contains("invalid result payload"));
}

#[test]
fn unknown_verdict_is_a_failed_outcome() {
    let outcome = parse_result(r#"{"verdict":"shrug"}"#);
    assert_eq!(outcome.verdict, AgentVerdict::Failed);
    assert!(outcome.cause.unwrap_or_default().contains("shrug"));
}

#[test]
fn result_line_routes_through_parse_line() {
    match parse_line(r#"::hydra:result {"verdict":"ok"}"#) {
        Line::Result(outcome) => assert_eq!(outcome.verdict, AgentVerdict::Ok),
        other => panic!("expected result, got {other:?}"),
    }
}
