//! Loop-level tests for full evolve lifecycle scenarios.
//!
//! These drive `run_loop` with a scripted model against a temporary
//! workspace and check the files it leaves behind: sandboxed writes, the
//! desires document, ledger, state snapshot and session log.

use std::fs;

use evolve::core::digest::content_hash;
use evolve::core::types::{FailurePolicy, Phase};
use evolve::io::bootstrap::NoHook;
use evolve::io::config::LoopSettings;
use evolve::io::model::TransportError;
use evolve::io::session_log::Outcome;
use evolve::iteration::IterationOutcome;
use evolve::looping::{LoopOutcome, LoopStop, run_loop};
use evolve::test_support::{ScriptedModel, Workspace};

fn run(ws: &Workspace, max: u32, policy: FailurePolicy, model: &ScriptedModel) -> LoopOutcome {
    run_loop(
        ws.paths(),
        &LoopSettings::new(max, policy),
        model,
        &NoHook,
        |_| {},
    )
    .expect("loop")
}

/// Unchanged desires with a file write: the file lands under the base, the
/// desires document is untouched, and one ledger entry records the write.
#[test]
fn unchanged_desires_still_write_files() {
    let ws = Workspace::with_desires("A").expect("workspace");
    let model = ScriptedModel::replying(&[
        r#"{"desires":"A","files":[{"path":"x/y.txt","content":"hello"}]}"#,
    ]);

    let outcome = run(&ws, 1, FailurePolicy::Abort, &model);

    assert_eq!(outcome.applied, 1);
    assert_eq!(ws.read("x/y.txt"), "hello");
    assert_eq!(ws.desires(), "A", "desires must stay byte-identical");

    let ledger = ws.ledger();
    assert_eq!(ledger.matches("## Iteration ").count(), 1);
    assert!(ledger.contains("## Iteration 1\n"));
    assert!(ledger.contains("- desires_changed: false\n"));
    assert!(ledger.contains("- files_changed: [\"x/y.txt\"]\n"));

    let state = ws.state();
    assert_eq!(state.iteration_count, 1);
    assert_eq!(
        state.last_applied_file_hashes.get("x/y.txt"),
        Some(&content_hash("hello"))
    );
    assert_eq!(state.last_desires_hash, Some(content_hash("A")));
}

/// A traversal path rejects the whole response: nothing is written, ledger
/// and state are not created, and the session log records the rejection.
#[test]
fn traversal_path_writes_nothing() {
    let ws = Workspace::with_desires("A").expect("workspace");
    let before = ws.tree();
    let model = ScriptedModel::replying(&[
        r#"{"desires":"B","files":[{"path":"ok.txt","content":"fine"},{"path":"../../etc/passwd","content":"x"}]}"#,
    ]);

    let outcome = run(&ws, 1, FailurePolicy::Abort, &model);

    assert_eq!(
        outcome.stop,
        LoopStop::Aborted {
            iteration: 1,
            kind: "sandbox_violation"
        }
    );
    let mut expected = before;
    expected.push("work/session.jsonl".to_string());
    expected.push("work/state.json.lock".to_string());
    expected.sort();
    assert_eq!(ws.tree(), expected);
    assert_eq!(ws.desires(), "A");

    let records = ws.session_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Failed);
    let error = records[0].error.as_ref().expect("error");
    assert_eq!(error.kind, "sandbox_violation");
    assert!(error.message.contains("../../etc/passwd"));
    assert!(records[0].raw_response.is_some());
}

/// The run stops at the budget whatever the model keeps proposing.
#[test]
fn budget_of_one_runs_exactly_one_iteration() {
    let ws = Workspace::with_desires("A").expect("workspace");
    let reply = r#"{"desires":"more work needed","files":[]}"#;
    let model = ScriptedModel::replying(&[reply, reply, reply]);

    let outcome = run(&ws, 1, FailurePolicy::Skip, &model);

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.stop, LoopStop::BudgetExhausted);
    assert_eq!(model.calls(), 1);
    assert_eq!(ws.state().iteration_count, 1);
    assert_eq!(ws.session_records().len(), 1);
}

/// A non-JSON reply leaves ledger and state byte-identical.
#[test]
fn unparseable_reply_leaves_ledger_and_state_untouched() {
    let ws = Workspace::with_desires("A").expect("workspace");
    let first = ScriptedModel::replying(&[r#"{"desires":"A"}"#]);
    run(&ws, 1, FailurePolicy::Abort, &first);
    let ledger_before = ws.read_bytes(&ws.paths().ledger);
    let state_before = ws.read_bytes(&ws.paths().state);
    assert!(!ledger_before.is_empty() && !state_before.is_empty());

    let second = ScriptedModel::replying(&["not json"]);
    let outcome = run(&ws, 2, FailurePolicy::Abort, &second);

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].kind, "parse_error");
    assert_eq!(ws.read_bytes(&ws.paths().ledger), ledger_before);
    assert_eq!(ws.read_bytes(&ws.paths().state), state_before);

    let records = ws.session_records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].iteration, 2);
    assert_eq!(records[1].raw_response.as_deref(), Some("not json"));
    assert_eq!(records[1].error.as_ref().expect("error").kind, "parse_error");
}

#[test]
fn changed_desires_are_rewritten() {
    let ws = Workspace::with_desires("old goal\n").expect("workspace");
    let model = ScriptedModel::replying(&[r#"{"desires":"new goal","files":null}"#]);

    run(&ws, 1, FailurePolicy::Abort, &model);

    assert_eq!(ws.desires(), "new goal\n");
    assert!(ws.ledger().contains("- desires_changed: true\n"));
    assert!(ws.ledger().contains("- files_changed: []\n"));
    assert_eq!(ws.state().last_desires_hash, Some(content_hash("new goal\n")));
    assert_eq!(ws.session_records()[0].desires_changed, Some(true));
}

/// Every proposed file is written once with exactly the proposed bytes.
#[test]
fn all_proposed_files_are_written_verbatim() {
    let ws = Workspace::with_desires("A").expect("workspace");
    let model = ScriptedModel::replying(&[r#"{"desires":"A","files":[
        {"path":"one.txt","content":"1"},
        {"path":"deep/er/two.md","content":"line\n\ttabbed\n"},
        {"path":"unicode.txt","content":"héllo ✓"}
    ]}"#]);

    run(&ws, 1, FailurePolicy::Abort, &model);

    assert_eq!(ws.read("one.txt"), "1");
    assert_eq!(ws.read("deep/er/two.md"), "line\n\ttabbed\n");
    assert_eq!(ws.read("unicode.txt"), "héllo ✓");
    let record = &ws.session_records()[0];
    let paths: Vec<&str> = record.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["one.txt", "deep/er/two.md", "unicode.txt"]);
}

/// The same reply applied in two fresh workspaces produces the same files.
#[test]
fn identical_replies_produce_identical_content() {
    let reply = r#"{"desires":"A","files":[{"path":"a/b.txt","content":"same"}]}"#;
    let first = Workspace::with_desires("A").expect("workspace");
    let second = Workspace::with_desires("A").expect("workspace");
    run(&first, 1, FailurePolicy::Abort, &ScriptedModel::replying(&[reply]));
    run(&second, 1, FailurePolicy::Abort, &ScriptedModel::replying(&[reply]));

    assert_eq!(first.read("a/b.txt"), second.read("a/b.txt"));
    assert_eq!(first.state().last_applied_file_hashes, second.state().last_applied_file_hashes);
}

/// Ledger entries accumulate in order across resumed runs and the count
/// never passes the maximum.
#[test]
fn ledger_grows_monotonically_across_runs() {
    let ws = Workspace::with_desires("A").expect("workspace");
    let reply = r#"{"desires":"A","files":[{"path":"n.txt","content":"x"}]}"#;

    run(&ws, 2, FailurePolicy::Abort, &ScriptedModel::replying(&[reply, reply]));
    let after_two = ws.ledger();
    run(&ws, 3, FailurePolicy::Abort, &ScriptedModel::replying(&[reply, reply]));
    let after_three = ws.ledger();
    let outcome = run(&ws, 3, FailurePolicy::Abort, &ScriptedModel::replying(&[reply]));

    assert!(after_three.starts_with(&after_two));
    assert_eq!(after_three.matches("## Iteration ").count(), 3);
    let positions: Vec<usize> = (1..=3)
        .map(|n| after_three.find(&format!("## Iteration {n}\n")).expect("entry"))
        .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(ws.state().iteration_count, 3);
    assert_eq!(outcome.stop, LoopStop::AlreadyComplete);
}

/// Context is reloaded every iteration, so a file written by one iteration
/// shows up in the next prompt.
#[test]
fn context_is_rebuilt_each_iteration() {
    let ws = Workspace::with_desires("A").expect("workspace");
    let model = ScriptedModel::replying(&[
        r#"{"desires":"A","files":[{"path":"notes.md","content":"remember the milk"}]}"#,
        r#"{"desires":"A"}"#,
    ]);
    let mut settings = LoopSettings::new(2, FailurePolicy::Abort);
    settings.context = vec!["notes.md".into()];

    run_loop(ws.paths(), &settings, &model, &NoHook, |_| {}).expect("loop");

    let prompts = model.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("[unavailable]"));
    assert!(!prompts[0].contains("remember the milk"));
    assert!(prompts[1].contains("remember the milk"));
    assert!(prompts[1].contains("## Iteration 1"));

    let records = ws.session_records();
    assert!(!records[0].context[0].available);
    assert!(records[1].context[0].available);
}

#[test]
fn run_files_cannot_be_overwritten_by_the_model() {
    let ws = Workspace::with_desires("A").expect("workspace");
    let model = ScriptedModel::replying(&[
        r#"{"desires":"A","files":[{"path":"desires.md","content":"hijacked"}]}"#,
        r#"{"desires":"A","files":[{"path":"./state.json","content":"{}"}]}"#,
    ]);

    let outcome = run(&ws, 2, FailurePolicy::Skip, &model);

    assert_eq!(outcome.applied, 0);
    assert!(outcome.failures.iter().all(|f| f.kind == "sandbox_violation"));
    assert_eq!(ws.desires(), "A");
    assert!(!ws.paths().state.exists());
}

#[test]
fn transport_failure_is_recorded_without_response() {
    let ws = Workspace::with_desires("A").expect("workspace");
    let model = ScriptedModel::new(vec![Err(TransportError::Timeout {
        url: "http://localhost:1234/v1/chat/completions".to_string(),
        timeout_secs: 30,
    })]);

    let outcome = run(&ws, 1, FailurePolicy::Skip, &model);

    assert_eq!(outcome.failures[0].kind, "transport_error");
    let record = &ws.session_records()[0];
    assert_eq!(record.raw_response, None);
    assert!(record.prompt_bytes.is_some());
    assert!(!ws.paths().ledger.exists());
    assert!(fs::read_to_string(&ws.paths().session_log)
        .expect("log")
        .contains("timed out after 30s"));
}

/// A batch that cannot be written is a failed iteration like any other:
/// ledger and state stay as they were, one record is logged, and the skip
/// policy moves on to the next attempt.
#[test]
fn write_failure_is_recorded_and_skipped() {
    let ws = Workspace::with_desires("A").expect("workspace");
    run(&ws, 1, FailurePolicy::Abort, &ScriptedModel::replying(&[r#"{"desires":"A"}"#]));
    fs::create_dir(ws.base().join("taken")).expect("create dir");
    let ledger_before = ws.read_bytes(&ws.paths().ledger);
    let state_before = ws.read_bytes(&ws.paths().state);

    let model = ScriptedModel::replying(&[
        r#"{"desires":"A","files":[{"path":"fine.txt","content":"1"},{"path":"taken","content":"2"}]}"#,
        r#"{"desires":"A","files":[{"path":"later.txt","content":"3"}]}"#,
    ]);
    let mut after_failure = None;
    let outcome = run_loop(
        ws.paths(),
        &LoopSettings::new(3, FailurePolicy::Skip),
        &model,
        &NoHook,
        |report| {
            if let IterationOutcome::Failed(err) = &report.outcome {
                assert_eq!(err.kind(), "write_error");
                after_failure = Some((
                    ws.read_bytes(&ws.paths().ledger),
                    ws.read_bytes(&ws.paths().state),
                ));
            }
        },
    )
    .expect("loop");

    let (ledger_then, state_then) = after_failure.expect("a failed attempt");
    assert_eq!(ledger_then, ledger_before);
    assert_eq!(state_then, state_before);
    assert!(!ws.base().join("fine.txt").exists());
    assert_eq!(ws.read("later.txt"), "3");
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.stop, LoopStop::BudgetExhausted);
    assert_eq!(ws.state().iteration_count, 2);

    let records = ws.session_records();
    assert_eq!(records.len(), 3);
    let error = records[1].error.as_ref().expect("error");
    assert_eq!(error.kind, "write_error");
    assert_eq!(error.phase, Phase::Apply);
    assert_eq!(records[1].iteration, 2);
    assert_eq!(records[2].iteration, 2);
}

/// Losing the state write after files were committed ends the run even
/// under the skip policy.
#[test]
fn failed_state_write_aborts_under_skip() {
    let ws = Workspace::with_desires("A").expect("workspace");
    // The state file is replaced through `<state>.tmp`; a directory there
    // makes the save fail after the ledger append.
    fs::create_dir(ws.base().join("state.json.tmp")).expect("create dir");
    let reply = r#"{"desires":"A","files":[{"path":"out.txt","content":"x"}]}"#;
    let model = ScriptedModel::replying(&[reply, reply, reply]);

    let outcome = run(&ws, 3, FailurePolicy::Skip, &model);

    assert_eq!(
        outcome.stop,
        LoopStop::Aborted {
            iteration: 1,
            kind: "persistence_error"
        }
    );
    assert_eq!(model.calls(), 1);
    assert!(!ws.paths().state.exists());
    let records = ws.session_records();
    assert_eq!(records.len(), 1);
    let error = records[0].error.as_ref().expect("error");
    assert_eq!(error.kind, "persistence_error");
    assert_eq!(error.phase, Phase::Record);
}

/// An unreadable run file fails the attempt before the model is asked; the
/// failure is logged and the skip policy still applies.
#[test]
fn unreadable_ledger_is_a_recorded_iteration_failure() {
    let ws = Workspace::with_desires("A").expect("workspace");
    fs::write(&ws.paths().ledger, [0xff, 0xfe]).expect("write ledger");
    let model = ScriptedModel::replying(&[r#"{"desires":"A"}"#]);

    let outcome = run(&ws, 2, FailurePolicy::Skip, &model);

    assert_eq!(model.calls(), 0);
    assert_eq!(outcome.stop, LoopStop::BudgetExhausted);
    assert_eq!(outcome.failures.len(), 2);
    assert!(outcome.failures.iter().all(|f| f.kind == "load_context_error"));
    assert_eq!(ws.read_bytes(&ws.paths().ledger), vec![0xff, 0xfe]);

    let records = ws.session_records();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.iteration, 1);
        assert_eq!(record.prompt_bytes, None);
        let error = record.error.as_ref().expect("error");
        assert_eq!(error.kind, "load_context_error");
        assert_eq!(error.phase, Phase::LoadContext);
        assert!(error.message.contains("ledger"), "message: {}", error.message);
    }
}
