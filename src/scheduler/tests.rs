use super::*;
use crate::model::WorkItem;
use crate::testing::{Harness, settings};
use crate::triage::Classification;

fn exclusive(id: u64) -> WorkItem {
    let mut item = WorkItem::new(id, &format!("Migrate {id}"), Status::Ready);
    item.exclusive = true;
    item
}

#[test]
fn ready_item_is_assigned_and_claimed() {
    let mut h = Harness::new(settings(2));
    h.board.ready(42);

    let report = h.scheduler.tick();

    assert_eq!(report.assigned, vec![42]);
    let token = h.workers.token_for(42);
    let record = h.scheduler.ledger().get(42).unwrap();
    assert_eq!(record.status, AssignmentStatus::InProgress);
    assert_eq!(record.instance_token.as_deref(), Some(token.as_str()));
    assert_eq!(record.branch, "issue-42-item-42");
    assert!(record.remote_synced);
    assert_eq!(h.board.status(42), Status::InProgress);
    assert_eq!(h.board.claim(42), Some(token));
}

#[test]
fn silent_exit_with_passing_review_is_dev_complete() {
    let mut h = Harness::new(settings(2));
    h.board.ready(7);
    h.scheduler.tick();

    h.workers.exit(7, "made some changes\n");
    h.reviewer.pass();
    let report = h.scheduler.tick();

    assert_eq!(report.completed, vec![7]);
    assert_eq!(report.archived, vec![7]);
    assert_eq!(h.board.status(7), Status::DevComplete);
    assert_eq!(h.board.claim(7), None);
    assert!(!h.scheduler.ledger().contains(7));
    assert!(h.board.comments_on(7)[0].contains("ready for review"));
}

#[test]
fn marker_from_running_worker_completes_and_stops_it() {
    let mut h = Harness::new(settings(2));
    h.board.ready(12);
    h.scheduler.tick();

    h.workers.print(12, "opened it\n<promise>COMPLETE: PR #31</promise>\n");
    let report = h.scheduler.tick();

    assert_eq!(report.completed, vec![12]);
    assert!(h.workers.running().is_empty());
    assert_eq!(h.board.status(12), Status::DevComplete);
    assert!(h.board.comments_on(12)[0].contains("PR #31"));
}

#[test]
fn running_worker_with_completion_talk_keeps_running() {
    let mut h = Harness::new(settings(2));
    h.board.ready(13);
    h.scheduler.tick();

    h.workers.print(13, "All tasks are complete.\n");
    let report = h.scheduler.tick();

    assert!(report.completed.is_empty());
    assert_eq!(h.workers.running(), vec![13]);
}

#[test]
fn dead_worker_with_completion_talk_completes_without_review() {
    let mut h = Harness::new(settings(2));
    h.board.ready(14);
    h.scheduler.tick();

    h.workers.exit(14, "All tasks are complete.\n");
    let report = h.scheduler.tick();

    assert_eq!(report.completed, vec![14]);
    assert!(h.reviewer.0.borrow().is_empty());
}

#[test]
fn blocked_item_waits_for_a_human() {
    let mut h = Harness::new(settings(2));
    h.board.ready(5);
    h.scheduler.tick();

    h.workers.exit(5, "<promise>BLOCKED: needs an API key</promise>");
    let report = h.scheduler.tick();
    assert_eq!(report.blocked, vec![5]);
    assert_eq!(h.board.status(5), Status::Blocked);
    assert_eq!(h.board.claim(5), None);
    let record = h.scheduler.ledger().get(5).unwrap();
    assert_eq!(record.status, AssignmentStatus::Blocked);
    assert_eq!(record.outcome.as_deref(), Some("needs an API key"));
    assert!(h.board.comments_on(5)[0].contains("needs an API key"));

    h.scheduler.tick();
    assert_eq!(h.workers.started_count(), 1);

    h.board.edit(5, |i| i.status = Status::Ready);
    let reconciled = h.scheduler.reconcile();
    assert_eq!(reconciled.requeued, vec![5]);
    assert!(h.scheduler.ledger().is_empty());

    let report = h.scheduler.tick();
    assert_eq!(report.assigned, vec![5]);
    assert_eq!(h.workers.started_count(), 2);
}

#[test]
fn failed_marker_is_published() {
    let mut h = Harness::new(settings(2));
    h.board.ready(6);
    h.scheduler.tick();

    h.workers.exit(6, "<promise>FAILED: tests cannot run</promise>");
    let report = h.scheduler.tick();

    assert_eq!(report.failed, vec![6]);
    assert_eq!(h.board.status(6), Status::Failed);
}

#[test]
fn failing_review_resurrects_with_notes_and_history() {
    let mut h = Harness::new(settings(2));
    h.board.ready(8);
    h.scheduler.tick();
    let first = h.workers.token_for(8);

    h.workers.exit(8, "<summary>added the parser</summary>");
    h.reviewer.fail(&["handle empty input"]);
    let report = h.scheduler.tick();

    assert_eq!(report.resurrected, vec![8]);
    let second = h.workers.token_for(8);
    assert_ne!(first, second);
    assert_eq!(h.board.claim(8), Some(second.clone()));

    let prompt = h.workers.prompt_for(8);
    assert!(prompt.contains("handle empty input"));
    assert!(prompt.contains("added the parser"));

    let record = h.scheduler.ledger().get(8).unwrap();
    assert_eq!(record.sessions.len(), 2);
    assert_eq!(record.sessions[0].summary.as_deref(), Some("added the parser"));
    assert!(record.sessions[0].ended_at.is_some());
    assert_eq!(record.instance_token.as_deref(), Some(second.as_str()));
    assert!(record.continuation.is_empty());
}

#[test]
fn reviewer_error_fails_open() {
    let mut h = Harness::new(settings(2));
    h.board.ready(9);
    h.scheduler.tick();

    h.workers.exit(9, "");
    h.reviewer.error();
    let report = h.scheduler.tick();

    assert_eq!(report.resurrected, vec![9]);
    assert_eq!(h.workers.running(), vec![9]);
}

#[test]
fn without_reviewer_silent_exits_are_resurrected() {
    let mut h = Harness::without_reviewer(settings(2));
    h.board.ready(10);
    h.scheduler.tick();

    h.workers.exit(10, "");
    let report = h.scheduler.tick();

    assert_eq!(report.resurrected, vec![10]);
}

#[test]
fn resurrection_budget_is_enforced() {
    let mut s = settings(2);
    s.max_resurrections = 1;
    let mut h = Harness::without_reviewer(s);
    h.board.ready(3);
    h.scheduler.tick();

    h.workers.exit(3, "");
    assert_eq!(h.scheduler.tick().resurrected, vec![3]);

    h.workers.exit(3, "");
    let report = h.scheduler.tick();
    assert_eq!(report.abandoned, vec![3]);
    assert_eq!(
        h.scheduler.ledger().get(3).unwrap().status,
        AssignmentStatus::Blocked
    );
    assert_eq!(h.board.status(3), Status::Blocked);
    assert_eq!(h.board.claim(3), None);
    assert!(h.board.comments_on(3).iter().any(|c| c.contains("giving up")));
    assert_eq!(h.workers.started_count(), 2);
}

#[test]
fn abandoned_item_is_not_readopted_when_board_writes_fail() {
    let mut s = settings(2);
    s.max_resurrections = 0;
    s.reconcile_every = 1;
    let mut h = Harness::without_reviewer(s);
    h.board.ready(3);
    h.scheduler.tick();

    h.board.0.borrow_mut().fail_writes = true;
    h.workers.exit(3, "");
    let report = h.scheduler.tick();

    assert_eq!(report.abandoned, vec![3]);
    assert!(report.reconcile.unwrap().reconstructed.is_empty());
    let record = h.scheduler.ledger().get(3).unwrap();
    assert_eq!(record.status, AssignmentStatus::Blocked);
    assert!(!record.remote_synced);
    assert_eq!(h.board.status(3), Status::InProgress);

    h.board.0.borrow_mut().fail_writes = false;
    h.scheduler.tick();
    assert_eq!(h.board.status(3), Status::Blocked);
    assert_eq!(h.board.claim(3), None);
    assert!(h.scheduler.ledger().get(3).unwrap().remote_synced);
    assert_eq!(h.workers.started_count(), 1);
}

#[test]
fn exclusive_item_runs_alone() {
    let mut h = Harness::new(settings(3));
    h.board.ready(1);
    h.board.add(exclusive(2));
    h.board.add(exclusive(3));

    assert_eq!(h.scheduler.tick().assigned, vec![2]);
    assert!(h.scheduler.tick().assigned.is_empty());

    h.workers.exit(2, "<promise>COMPLETE</promise>");
    let report = h.scheduler.tick();
    assert_eq!(report.completed, vec![2]);
    assert_eq!(report.assigned, vec![3]);
    assert!(h.scheduler.tick().assigned.is_empty());

    h.workers.exit(3, "<promise>COMPLETE</promise>");
    h.scheduler.tick();
    assert_eq!(h.workers.running(), vec![1]);
}

#[test]
fn dead_exclusive_worker_is_restarted_and_keeps_blocking() {
    let mut h = Harness::without_reviewer(settings(3));
    h.board.add(exclusive(2));
    h.board.ready(4);
    h.scheduler.tick();

    h.workers.exit(2, "");
    let report = h.scheduler.tick();

    assert_eq!(report.resurrected, vec![2]);
    assert!(report.assigned.is_empty());
    assert_eq!(h.workers.running(), vec![2]);
}

#[test]
fn active_count_never_exceeds_limit() {
    let mut h = Harness::new(settings(2));
    for id in 1..=5 {
        h.board.ready(id);
    }

    for _ in 0..4 {
        h.scheduler.tick();
        assert!(h.scheduler.ledger().count_active("claude") <= 2);
    }
    assert_eq!(h.scheduler.ledger().active_ids(), vec![1, 2]);

    h.workers.exit(1, "<promise>COMPLETE</promise>");
    let report = h.scheduler.tick();
    assert_eq!(report.assigned, vec![3]);
    assert_eq!(h.scheduler.ledger().count_active("claude"), 2);
}

#[test]
fn unavailable_worker_class_starts_nothing() {
    let mut h = Harness::new(settings(2));
    h.board.ready(1);
    h.workers.0.borrow_mut().unavailable.insert("claude".into());

    assert!(h.scheduler.tick().assigned.is_empty());
    assert!(h.scheduler.ledger().is_empty());
}

#[test]
fn failed_start_is_rolled_back_and_retried() {
    let mut h = Harness::new(settings(2));
    h.board.ready(4);
    h.workers.0.borrow_mut().fail_start = true;

    let report = h.scheduler.tick();
    assert!(report.assigned.is_empty());
    assert_eq!(report.errors, 1);
    assert!(h.scheduler.ledger().is_empty());
    assert_eq!(h.board.status(4), Status::Ready);
    assert_eq!(h.board.writes(), 0);

    h.workers.0.borrow_mut().fail_start = false;
    assert_eq!(h.scheduler.tick().assigned, vec![4]);
}

#[test]
fn listing_failure_means_no_new_work() {
    let mut h = Harness::new(settings(2));
    h.board.ready(1);
    h.board.0.borrow_mut().fail_listing = true;

    let report = h.scheduler.tick();

    assert!(report.assigned.is_empty());
    assert!(report.errors >= 1);
    assert_eq!(h.workers.started_count(), 0);
}

#[test]
fn unpublished_claim_is_retried_without_double_assignment() {
    let mut h = Harness::new(settings(2));
    h.board.ready(6);
    h.board.0.borrow_mut().fail_writes = true;

    assert_eq!(h.scheduler.tick().assigned, vec![6]);
    assert!(!h.scheduler.ledger().get(6).unwrap().remote_synced);
    assert_eq!(h.board.status(6), Status::Ready);

    h.scheduler.tick();
    assert_eq!(h.workers.started_count(), 1);

    h.board.0.borrow_mut().fail_writes = false;
    let reconciled = h.scheduler.reconcile();
    assert_eq!(reconciled.republished, vec![6]);
    assert_eq!(h.board.status(6), Status::InProgress);
    assert_eq!(h.board.claim(6), Some(h.workers.token_for(6)));
    assert!(h.scheduler.ledger().get(6).unwrap().remote_synced);
}

#[test]
fn unpublished_record_yields_to_human_status_change() {
    let mut h = Harness::new(settings(2));
    h.board.ready(6);
    h.board.0.borrow_mut().fail_writes = true;
    assert_eq!(h.scheduler.tick().assigned, vec![6]);
    let token = h.workers.token_for(6);

    h.board.0.borrow_mut().fail_writes = false;
    h.board.edit(6, |i| i.status = Status::Done);
    let report = h.scheduler.tick();

    assert_eq!(report.withdrawn, vec![6]);
    assert_eq!(h.board.status(6), Status::Done);
    assert_eq!(h.board.claim(6), None);
    assert!(!h.scheduler.ledger().contains(6));
    assert!(h.workers.0.borrow().stopped.contains(&token));
}

#[test]
fn resurrection_skips_items_a_human_closed() {
    let mut h = Harness::without_reviewer(settings(2));
    h.board.ready(8);
    h.scheduler.tick();

    h.board.edit(8, |i| i.status = Status::Done);
    h.workers.exit(8, "");
    let report = h.scheduler.tick();

    assert!(report.resurrected.is_empty());
    assert_eq!(report.errors, 1);
    assert_eq!(h.workers.started_count(), 1);
    assert_eq!(h.board.status(8), Status::Done);

    let reconciled = h.scheduler.reconcile();
    assert_eq!(reconciled.withdrawn, vec![8]);
    assert!(h.scheduler.ledger().is_empty());
}

#[test]
fn triage_moves_items_on() {
    let mut h = Harness::new(settings(0));
    h.board.add(WorkItem::new(20, "Speed up search", Status::NeedsTriage));
    h.board.add(WorkItem::new(21, "It is broken", Status::NeedsTriage));
    h.classifier
        .0
        .borrow_mut()
        .insert(20, Classification::Ready);
    h.classifier
        .0
        .borrow_mut()
        .insert(21, Classification::NeedsInfo("Which browser?".into()));

    let report = h.scheduler.tick();

    assert_eq!(report.triaged, vec![20, 21]);
    assert_eq!(h.board.status(20), Status::Ready);
    assert_eq!(h.board.status(21), Status::NeedsInfo);
    assert_eq!(h.board.comments_on(21), vec!["Which browser?".to_string()]);
}

#[test]
fn triage_disabled_leaves_items_alone() {
    let mut s = settings(0);
    s.triage = false;
    let mut h = Harness::new(s);
    h.board.add(WorkItem::new(20, "Speed up search", Status::NeedsTriage));
    h.classifier
        .0
        .borrow_mut()
        .insert(20, Classification::Ready);

    assert!(h.scheduler.tick().triaged.is_empty());
    assert_eq!(h.board.status(20), Status::NeedsTriage);
}

#[test]
fn assignment_runs_on_its_cadence() {
    let mut s = settings(2);
    s.assign_every = 2;
    let mut h = Harness::new(s);

    h.scheduler.tick();
    h.board.ready(1);
    assert!(h.scheduler.tick().assigned.is_empty());
    assert_eq!(h.scheduler.tick().assigned, vec![1]);
}

#[test]
fn shutdown_stops_workers_and_keeps_records() {
    let mut h = Harness::new(settings(2));
    h.board.ready(1);
    h.board.ready(2);
    h.scheduler.tick();

    h.scheduler.shutdown();

    assert!(h.workers.running().is_empty());
    assert_eq!(h.scheduler.ledger().active_ids(), vec![1, 2]);
}

#[test]
fn run_returns_once_stopped() {
    let mut h = Harness::new(settings(2));
    h.board.ready(1);
    let stop = AtomicBool::new(true);

    h.scheduler.run(&stop);

    assert_eq!(h.workers.started_count(), 0);
}

#[test]
fn unassign_stops_worker_and_requeues() {
    let mut h = Harness::new(settings(2));
    h.board.ready(9);
    h.scheduler.tick();
    let token = h.workers.token_for(9);

    let record = h.scheduler.unassign(9, true).unwrap();

    assert_eq!(record.item_id, 9);
    assert!(h.scheduler.ledger().is_empty());
    assert!(h.workers.0.borrow().stopped.contains(&token));
    assert_eq!(h.board.status(9), Status::Ready);
    assert_eq!(h.board.claim(9), None);
}

#[test]
fn unassign_unknown_item_is_an_error() {
    let mut h = Harness::new(settings(2));
    let err = h.scheduler.unassign(404, false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<LedgerError>(),
        Some(LedgerError::NotFound(404))
    ));
}
