// Pipeline store invariants: unique stage membership, idempotent terminal
// merges, reconciliation upserts, and pipeline_update emission.

use hydra_core::bus::EventBus;
use hydra_core::event::EventKind;
use hydra_core::store::PipelineStore;
use hydra_core::types::{Issue, IssueStatus, PullRequest, Stage};

fn issue(n: u64) -> Issue {
    Issue::new(n, format!("issue {n}"), format!("https://host.example/issues/{n}"))
}

async fn membership_count(store: &PipelineStore, number: u64) -> usize {
    let snapshot = store.snapshot().await;
    snapshot
        .values()
        .map(|bucket| bucket.iter().filter(|i| i.number == number).count())
        .sum()
}

#[tokio::test]
async fn issue_lives_in_exactly_one_stage() {
    let bus = EventBus::new();
    let store = PipelineStore::new(bus);

    store.upsert(issue(7), Stage::Triage, IssueStatus::Queued).await;
    assert_eq!(membership_count(&store, 7).await, 1);

    store
        .move_issue(7, Some(Stage::Triage), Stage::Plan, IssueStatus::Queued)
        .await;
    assert_eq!(membership_count(&store, 7).await, 1);

    store.move_issue(7, None, Stage::Hitl, IssueStatus::Hitl).await;
    assert_eq!(membership_count(&store, 7).await, 1);

    let snapshot = store.snapshot().await;
    assert!(snapshot[&Stage::Hitl].iter().any(|i| i.number == 7));
}

#[tokio::test]
async fn move_without_from_searches_all_stages() {
    let bus = EventBus::new();
    let store = PipelineStore::new(bus);

    store.upsert(issue(3), Stage::Implement, IssueStatus::Active).await;
    assert!(store.move_issue(3, None, Stage::Review, IssueStatus::Queued).await);

    let snapshot = store.snapshot().await;
    assert!(snapshot[&Stage::Review].iter().any(|i| i.number == 3));
    assert!(snapshot[&Stage::Implement].is_empty());
}

#[tokio::test]
async fn terminal_merge_is_recorded_for_untracked_issue() {
    let bus = EventBus::new();
    let store = PipelineStore::new(bus);

    // A merge observed for an issue the pipeline never saw still lands.
    assert!(store.move_issue(42, None, Stage::Merged, IssueStatus::Done).await);
    assert_eq!(membership_count(&store, 42).await, 1);

    // Repeating the terminal move stays single-membership.
    assert!(store.move_issue(42, None, Stage::Merged, IssueStatus::Done).await);
    assert_eq!(membership_count(&store, 42).await, 1);
}

#[tokio::test]
async fn move_of_unknown_issue_to_working_stage_is_rejected() {
    let bus = EventBus::new();
    let store = PipelineStore::new(bus);
    assert!(!store.move_issue(9, None, Stage::Plan, IssueStatus::Queued).await);
    assert_eq!(membership_count(&store, 9).await, 0);
}

#[tokio::test]
async fn upsert_is_a_noop_for_tracked_issues() {
    let bus = EventBus::new();
    let store = PipelineStore::new(bus);

    assert!(store.upsert(issue(5), Stage::Triage, IssueStatus::Queued).await);
    // Already tracked, even in another stage: no second insert.
    store
        .move_issue(5, Some(Stage::Triage), Stage::Implement, IssueStatus::Active)
        .await;
    assert!(!store.upsert(issue(5), Stage::Triage, IssueStatus::Queued).await);
    assert_eq!(membership_count(&store, 5).await, 1);
}

#[tokio::test]
async fn remove_closed_drops_the_issue() {
    let bus = EventBus::new();
    let store = PipelineStore::new(bus);

    store.upsert(issue(11), Stage::Plan, IssueStatus::Queued).await;
    let removed = store.remove_closed(11).await;
    assert!(removed.is_some());
    assert_eq!(membership_count(&store, 11).await, 0);
    assert!(store.remove_closed(11).await.is_none());
}

#[tokio::test]
async fn mutations_emit_pipeline_updates() {
    let bus = EventBus::new();
    let store = PipelineStore::new(bus.clone());

    let mut sub = bus.subscribe(None).await;
    store.upsert(issue(2), Stage::Triage, IssueStatus::Queued).await;
    store.set_status(2, IssueStatus::Active).await;
    store
        .move_issue(2, Some(Stage::Triage), Stage::Plan, IssueStatus::Queued)
        .await;

    let mut updates = 0;
    for _ in 0..3 {
        let event = sub.rx.recv().await.expect("pipeline_update expected");
        if matches!(event.kind, EventKind::PipelineUpdate { issue: 2, .. }) {
            updates += 1;
        }
    }
    assert_eq!(updates, 3);
}

#[tokio::test]
async fn pr_lifecycle_is_idempotent() {
    let bus = EventBus::new();
    let store = PipelineStore::new(bus);

    store.upsert(issue(8), Stage::Review, IssueStatus::Queued).await;
    store
        .record_pr(PullRequest {
            pr: 200,
            issue: 8,
            branch: "issue-8".into(),
            url: "https://host.example/pulls/200".into(),
            draft: false,
            merged: false,
        })
        .await;

    let (_, tracked) = store.get(8).await.expect("issue tracked");
    assert_eq!(tracked.pr, Some(200));
    assert_eq!(store.open_prs().await.len(), 1);

    assert_eq!(store.mark_merged(200).await, Some((8, true)));
    // Second observation is an idempotent no-op.
    assert_eq!(store.mark_merged(200).await, Some((8, false)));
    assert!(store.open_prs().await.is_empty());
}
