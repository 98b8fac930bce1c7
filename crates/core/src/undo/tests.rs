use super::*;
use serde_json::json;

fn action(kind: UndoKind, project_id: &str, before: i64, after: i64, ts: i64, version: Option<i64>) -> UndoAction {
    UndoAction {
        kind,
        project_id: project_id.to_string(),
        data: UndoData {
            before: json!({ "title": before }),
            after: json!({ "title": after }),
        },
        timestamp_ms: ts,
        project_version: version,
    }
}

#[test]
fn replay_refuses_when_remote_moved_two_versions() {
    let mut stack = UndoStack::new(UndoConfig::default());
    stack.record(action(UndoKind::TaskUpdate, "p1", 1, 2, 0, Some(5)));

    let outcome = stack.undo(Some(7));
    assert_eq!(
        outcome,
        ReplayOutcome::VersionMismatch {
            recorded_version: 5,
            current_version: 7,
        }
    );
    assert!(outcome.is_version_mismatch());
    assert_eq!(stack.undo_len(), 1, "refused entry stays available");

    match stack.undo(Some(6)) {
        ReplayOutcome::Applied { snapshot, action } => {
            assert_eq!(snapshot, json!({ "title": 1 }));
            assert_eq!(action.project_version, Some(5));
        }
        other => panic!("expected applied undo, got {other:?}"),
    }
    assert!(stack.can_redo());
}

#[test]
fn forced_replay_reports_the_delta() {
    let mut stack = UndoStack::new(UndoConfig::default());
    stack.record(action(UndoKind::TaskUpdate, "p1", 1, 2, 0, Some(5)));
    match stack.force_undo(Some(9)) {
        ReplayOutcome::Forced { version_delta, snapshot, .. } => {
            assert_eq!(version_delta, 4);
            assert_eq!(snapshot, json!({ "title": 1 }));
        }
        other => panic!("expected forced replay, got {other:?}"),
    }
    assert!(!stack.can_undo());
}

#[test]
fn unknown_versions_replay_freely() {
    let mut stack = UndoStack::new(UndoConfig::default());
    stack.record(action(UndoKind::TaskUpdate, "p1", 1, 2, 0, None));
    assert!(matches!(stack.undo(Some(100)), ReplayOutcome::Applied { .. }));
    assert!(matches!(stack.redo(None), ReplayOutcome::Applied { .. }));
    assert!(matches!(stack.undo(None), ReplayOutcome::Applied { .. }));
    assert_eq!(stack.undo(None), ReplayOutcome::Empty);
    assert!(!stack.redo(Some(1)).is_version_mismatch());
}

#[test]
fn rapid_edits_coalesce_within_the_merge_window() {
    let mut stack = UndoStack::new(UndoConfig {
        merge_window_ms: 500,
        ..UndoConfig::default()
    });
    stack.record(action(UndoKind::TaskUpdate, "p1", 1, 2, 0, Some(3)));
    stack.record(action(UndoKind::TaskUpdate, "p1", 2, 3, 400, Some(4)));
    stack.record(action(UndoKind::TaskUpdate, "p1", 3, 4, 800, Some(5)));
    assert_eq!(stack.undo_len(), 1);

    let top = stack.peek_undo().expect("entry");
    assert_eq!(top.data.before, json!({ "title": 1 }));
    assert_eq!(top.data.after, json!({ "title": 4 }));
    assert_eq!(top.project_version, Some(3));

    // Outside the window, different kind, or different project: new entries.
    stack.record(action(UndoKind::TaskUpdate, "p1", 4, 5, 2_000, None));
    stack.record(action(UndoKind::TaskMove, "p1", 5, 6, 2_100, None));
    stack.record(action(UndoKind::TaskMove, "p2", 6, 7, 2_200, None));
    assert_eq!(stack.undo_len(), 4);
}

#[test]
fn debounced_recording_commits_once_after_quiet_period() {
    let mut stack = UndoStack::new(UndoConfig {
        debounce_ms: 300,
        merge_window_ms: 0,
        ..UndoConfig::default()
    });
    stack.record_debounced(action(UndoKind::TaskUpdate, "p1", 1, 2, 0, None), 0);
    stack.record_debounced(action(UndoKind::TaskUpdate, "p1", 2, 3, 200, None), 200);
    assert!(!stack.flush_debounced(400));
    assert_eq!(stack.undo_len(), 0);
    assert!(stack.flush_debounced(500));
    assert_eq!(stack.undo_len(), 1);
    let top = stack.peek_undo().expect("entry");
    assert_eq!(top.data.before, json!({ "title": 1 }));
    assert_eq!(top.data.after, json!({ "title": 3 }));
    assert!(!stack.has_pending());
}

#[test]
fn a_different_debounced_target_commits_the_previous_one() {
    let mut stack = UndoStack::new(UndoConfig {
        merge_window_ms: 0,
        ..UndoConfig::default()
    });
    stack.record_debounced(action(UndoKind::TaskUpdate, "p1", 1, 2, 0, None), 0);
    stack.record_debounced(action(UndoKind::TaskUpdate, "p2", 1, 2, 10, None), 10);
    assert_eq!(stack.undo_len(), 1);
    assert!(stack.has_pending());

    // Undo flushes the pending entry first.
    assert!(matches!(stack.undo(None), ReplayOutcome::Applied { ref action, .. } if action.project_id == "p2"));
}

#[test]
fn recording_clears_redo_and_stack_is_bounded() {
    let mut stack = UndoStack::new(UndoConfig {
        max_entries: 3,
        merge_window_ms: 0,
        ..UndoConfig::default()
    });
    for index in 0..5 {
        stack.record(action(UndoKind::TaskCreate, "p1", index, index + 1, index * 10, None));
    }
    assert_eq!(stack.undo_len(), 3);
    assert!(matches!(stack.undo(None), ReplayOutcome::Applied { .. }));
    assert!(stack.can_redo());
    stack.record(action(UndoKind::TaskDelete, "p1", 0, 0, 1_000, None));
    assert!(!stack.can_redo());
}

#[test]
fn outdated_history_is_pruned_per_project() {
    let mut stack = UndoStack::new(UndoConfig {
        merge_window_ms: 0,
        ..UndoConfig::default()
    });
    stack.record(action(UndoKind::TaskUpdate, "p1", 1, 2, 0, Some(2)));
    stack.record(action(UndoKind::TaskUpdate, "p1", 2, 3, 10, Some(6)));
    stack.record(action(UndoKind::TaskUpdate, "p2", 1, 2, 20, Some(1)));
    stack.record(action(UndoKind::TaskUpdate, "p1", 3, 4, 30, None));

    assert_eq!(stack.clear_outdated_history("p1", 7), 1);
    assert_eq!(stack.undo_len(), 3);
    assert_eq!(stack.clear_outdated_history("p1", 7), 0);
}
