//! End-to-end engine scenarios using real subprocesses (`sh`, `sleep`,
//! `printf`) as stand-in linters.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use squint::settings::{GlobalSettings, SettingsSnapshot};
use squint::spec::{IoStrategy, LinterSpec};
use squint::store::EngineEvent;
use squint::{
    DocumentId, DocumentSnapshot, LintEngine, LinterRegistry, Revision, TriggerReason,
};

const PATTERN: &str = r"^(?P<file>[^:]+):(?P<line>\d+):(?P<col>\d+): (?P<code>[A-Z]\d+) (?P<message>.+)$";

fn registry_with_script(script: &str) -> LinterRegistry {
    let mut registry = LinterRegistry::new();
    registry
        .register(LinterSpec::new(
            "fakelint",
            &["sh", "-c", script],
            "source.python",
            PATTERN,
        ))
        .unwrap();
    registry
}

fn settings(delay_ms: u64) -> SettingsSnapshot {
    SettingsSnapshot {
        version: 1,
        global: GlobalSettings {
            delay: delay_ms,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn snapshot(id: u64, revision: u64, text: &str) -> DocumentSnapshot {
    DocumentSnapshot::new(DocumentId(id), Revision(revision), text, "source.python")
        .with_path("/work/test.py")
}

async fn next_matching(
    events: &mut broadcast::Receiver<EngineEvent>,
    wait: Duration,
    mut pred: impl FnMut(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await
                }
            }
        }
    })
    .await
    .ok()
}

#[tokio::test]
async fn lints_a_document_end_to_end() {
    let registry =
        registry_with_script("printf 'test.py:12:8: W601 deprecated form\\ntest.py:3:1: E999 syntax error\\n'");
    let engine = LintEngine::new(registry, settings(10));
    let mut events = engine.subscribe();

    engine.notify(snapshot(1, 1, "x = 1\n"), TriggerReason::Save);

    let result = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LinterResult { .. })
    })
    .await
    .expect("a result should be published");

    match result {
        EngineEvent::LinterResult { linter, revision, count, .. } => {
            assert_eq!(linter, "fakelint");
            assert_eq!(revision, Revision(1));
            assert_eq!(count, 2);
        }
        _ => unreachable!(),
    }

    let set = engine.diagnostics(DocumentId(1)).unwrap();
    assert_eq!(set.revision, Revision(1));
    let diags = &set.by_linter["fakelint"];
    assert_eq!(diags[0].line, 11);
    assert_eq!(diags[0].col, Some(7));
    assert_eq!(diags[0].code.as_deref(), Some("W601"));
    assert_eq!(diags[0].message, "deprecated form");
}

#[tokio::test]
async fn debounce_coalesces_rapid_edits() {
    let registry = registry_with_script("printf 'test.py:1:1: E100 found\\n'");
    let engine = LintEngine::new(registry, settings(150));
    let mut events = engine.subscribe();

    // five keystrokes inside one debounce window
    for revision in 1..=5u64 {
        engine.notify(
            snapshot(1, revision, &format!("rev {revision}\n")),
            TriggerReason::Modify,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::RunStarted { .. })
    })
    .await
    .expect("one run should start");

    // the single dispatched request snapshots the revision current at
    // dispatch time, not at the first keystroke
    match started {
        EngineEvent::RunStarted { revision, .. } => assert_eq!(revision, Revision(5)),
        _ => unreachable!(),
    }

    // no second run follows
    let extra = next_matching(&mut events, Duration::from_millis(600), |e| {
        matches!(e, EngineEvent::RunStarted { .. })
    })
    .await;
    assert!(extra.is_none(), "rapid edits must coalesce into one run");
}

#[tokio::test]
async fn out_of_order_completion_discards_stale_run() {
    // the mock linter sleeps for however long the buffer's first line
    // says, so an older revision can finish after a newer one
    let registry = registry_with_script(
        "read -r delay; sleep \"$delay\"; printf 'test.py:1:1: E100 delay %s\\n' \"$delay\"",
    );
    let engine = LintEngine::new(registry, settings(10));
    let mut events = engine.subscribe();

    engine.lint(snapshot(1, 1, "0.4\n"), None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.lint(snapshot(1, 2, "0\n"), None);

    // revision 2 publishes first
    let first = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LinterResult { .. })
    })
    .await
    .expect("the fast run should publish");
    match first {
        EngineEvent::LinterResult { revision, .. } => assert_eq!(revision, Revision(2)),
        _ => unreachable!(),
    }

    // revision 1 limps in afterwards and must be dropped silently
    let stale = next_matching(&mut events, Duration::from_millis(800), |e| {
        matches!(e, EngineEvent::LinterResult { .. })
    })
    .await;
    assert!(stale.is_none(), "the stale run must not publish");

    let set = engine.diagnostics(DocumentId(1)).unwrap();
    assert_eq!(set.revision, Revision(2));
    assert_eq!(set.by_linter["fakelint"][0].message, "delay 0");
}

#[tokio::test]
async fn edit_during_background_run_discards_its_result() {
    // revision 1 starts a background run; the user edits to revision 2
    // while it is in flight; only the second run's result may ever be
    // published
    let registry = registry_with_script(
        "read -r delay; sleep \"$delay\"; printf 'test.py:1:1: E100 delay %s\\n' \"$delay\"",
    );
    let engine = LintEngine::new(registry, settings(10));
    let mut events = engine.subscribe();

    engine.notify(snapshot(1, 1, "0.4\n"), TriggerReason::Modify);
    // let the first dispatch get past its debounce and spawn
    next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::RunStarted { .. })
    })
    .await
    .expect("first run should start");

    engine.notify(snapshot(1, 2, "0\n"), TriggerReason::Modify);

    let result = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LinterResult { .. })
    })
    .await
    .expect("the second run should publish");
    match result {
        EngineEvent::LinterResult { revision, .. } => assert_eq!(revision, Revision(2)),
        _ => unreachable!(),
    }

    // wait out the slow first process; nothing else may arrive
    let stale = next_matching(&mut events, Duration::from_millis(800), |e| {
        matches!(e, EngineEvent::LinterResult { .. })
    })
    .await;
    assert!(stale.is_none());
    assert_eq!(
        engine.diagnostics(DocumentId(1)).unwrap().by_linter["fakelint"][0].message,
        "delay 0"
    );
}

#[tokio::test]
async fn missing_executable_deactivates_linter() {
    let mut registry = LinterRegistry::new();
    registry
        .register(LinterSpec::new(
            "ghost",
            &["definitely-not-on-path-xyz"],
            "source.python",
            PATTERN,
        ))
        .unwrap();
    let engine = LintEngine::new(registry, settings(10));
    let mut events = engine.subscribe();

    engine.notify(snapshot(1, 1, "x\n"), TriggerReason::Save);

    let failed = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LinterFailed { .. })
    })
    .await
    .expect("a configuration failure should be reported");
    match failed {
        EngineEvent::LinterFailed { linter, reason, .. } => {
            assert_eq!(linter, "ghost");
            assert!(reason.contains("cannot locate"));
        }
        _ => unreachable!(),
    }

    // reported once: the next trigger stays quiet while settings are
    // unchanged
    engine.notify(snapshot(1, 2, "y\n"), TriggerReason::Save);
    let again = next_matching(&mut events, Duration::from_millis(500), |e| {
        matches!(e, EngineEvent::LinterFailed { .. })
    })
    .await;
    assert!(again.is_none(), "deactivated linter must not re-report");

    // a settings change re-validates
    engine.update_settings(SettingsSnapshot { version: 2, ..settings(10) });
    engine.notify(snapshot(1, 3, "z\n"), TriggerReason::Save);
    let revalidated = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LinterFailed { .. })
    })
    .await;
    assert!(revalidated.is_some());
}

#[tokio::test]
async fn timeout_is_reported_as_failure() {
    let registry = registry_with_script("sleep 30");
    let engine = LintEngine::new(
        registry,
        SettingsSnapshot {
            version: 1,
            global: GlobalSettings {
                delay: 10,
                process_timeout: 1,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    let mut events = engine.subscribe();

    engine.notify(snapshot(1, 1, "x\n"), TriggerReason::Save);

    let failed = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LinterFailed { .. })
    })
    .await
    .expect("the timeout should surface as a failure");
    match failed {
        EngineEvent::LinterFailed { reason, .. } => assert!(reason.contains("timed out")),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn disk_only_linter_skips_dirty_buffers() {
    let mut registry = LinterRegistry::new();
    let mut spec = LinterSpec::new(
        "diskonly",
        &["sh", "-c", "printf 'test.py:1:1: E100 ran anyway\\n'"],
        "source.python",
        PATTERN,
    );
    spec.strategy = IoStrategy::DiskOnly;
    registry.register(spec).unwrap();
    let engine = LintEngine::new(registry, settings(10));
    let mut events = engine.subscribe();

    engine.notify(
        snapshot(1, 1, "unsaved\n").with_dirty(true),
        TriggerReason::Save,
    );

    // the skip is silent: neither a result nor a failure
    let anything = next_matching(&mut events, Duration::from_millis(800), |e| {
        matches!(
            e,
            EngineEvent::LinterResult { .. } | EngineEvent::LinterFailed { .. }
        )
    })
    .await;
    assert!(anything.is_none());
}

#[tokio::test]
async fn sibling_linter_failure_is_isolated() {
    let mut registry = LinterRegistry::new();
    registry
        .register(LinterSpec::new(
            "healthy",
            &["sh", "-c", "printf 'test.py:2:1: E200 real finding\\n'"],
            "source.python",
            PATTERN,
        ))
        .unwrap();
    registry
        .register(LinterSpec::new(
            "crashy",
            &["sh", "-c", "echo boom >&2; exit 2"],
            "source.python",
            PATTERN,
        ))
        .unwrap();
    let engine = LintEngine::new(registry, settings(10));
    let mut events = engine.subscribe();

    engine.notify(snapshot(1, 1, "x\n"), TriggerReason::Save);

    let result = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LinterResult { linter, .. } if linter == "healthy")
    })
    .await;
    assert!(result.is_some(), "the healthy linter must still publish");

    let set = engine.diagnostics(DocumentId(1)).unwrap();
    assert_eq!(set.by_linter["healthy"].len(), 1);
}

#[tokio::test]
async fn run_lifecycle_events_are_emitted() {
    let registry = registry_with_script("printf 'test.py:1:1: E100 x\\n'");
    let engine = LintEngine::new(registry, settings(10));
    let mut events = engine.subscribe();

    engine.notify(snapshot(1, 1, "x\n"), TriggerReason::Load);

    let started = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::RunStarted { .. })
    })
    .await
    .expect("run-started");
    let sequence = match started {
        EngineEvent::RunStarted { sequence, linters, .. } => {
            assert_eq!(linters, vec!["fakelint".to_string()]);
            sequence
        }
        _ => unreachable!(),
    };

    let ended = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::RunEnded { .. })
    })
    .await
    .expect("run-ended");
    match ended {
        EngineEvent::RunEnded { sequence: end_seq, .. } => assert_eq!(end_seq, sequence),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn closing_a_document_tears_down_its_state() {
    let registry = registry_with_script("printf 'test.py:1:1: E100 x\\n'");
    let engine = LintEngine::new(registry, settings(10));
    let mut events = engine.subscribe();

    engine.notify(snapshot(7, 1, "x\n"), TriggerReason::Save);
    next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LinterResult { .. })
    })
    .await
    .expect("first result");

    engine.close(DocumentId(7));
    assert!(engine.diagnostics(DocumentId(7)).is_none());

    let unassigned = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LintersAssigned { linters, .. } if linters.is_empty())
    })
    .await;
    assert!(unassigned.is_some());
}

#[tokio::test]
async fn manual_lint_filters_to_requested_linters() {
    let mut registry = LinterRegistry::new();
    for name in ["alpha", "beta"] {
        registry
            .register(LinterSpec::new(
                name,
                &["sh", "-c", &format!("printf 'test.py:1:1: E100 from {name}\\n'")],
                "source.python",
                PATTERN,
            ))
            .unwrap();
    }
    let engine = LintEngine::new(registry, settings(10));
    let mut events = engine.subscribe();

    engine.lint(snapshot(1, 1, "x\n"), Some(vec!["beta".to_string()]));

    let result = next_matching(&mut events, Duration::from_secs(5), |e| {
        matches!(e, EngineEvent::LinterResult { .. })
    })
    .await
    .expect("the requested linter should run");
    match result {
        EngineEvent::LinterResult { linter, .. } => assert_eq!(linter, "beta"),
        _ => unreachable!(),
    }

    let extra = next_matching(&mut events, Duration::from_millis(500), |e| {
        matches!(e, EngineEvent::LinterResult { linter, .. } if linter == "alpha")
    })
    .await;
    assert!(extra.is_none(), "unrequested linters must not run");
}
