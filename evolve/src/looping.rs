//! Bounded multi-iteration driver for `evolve run`.

use std::thread;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::core::budget::IterationBudget;
use crate::core::types::FailurePolicy;
use crate::io::bootstrap::{BootstrapHook, HookContext};
use crate::io::config::LoopSettings;
use crate::io::lock::RunLock;
use crate::io::model::ModelClient;
use crate::iteration::{IterationController, IterationOutcome, IterationReport, RunPaths};

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every attempt the budget allowed was made.
    BudgetExhausted,
    /// The persisted count had already reached the maximum; nothing ran.
    AlreadyComplete,
    /// An iteration failed under the abort policy, or failed in a way no
    /// policy can skip.
    Aborted { iteration: u32, kind: &'static str },
    /// The bootstrap hook failed before `iteration`.
    BootstrapFailed { iteration: u32 },
}

/// A failed attempt, as listed in the loop summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationFailure {
    pub iteration: u32,
    pub attempt: u32,
    pub kind: &'static str,
    pub message: String,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Committed iteration count when the run began.
    pub started_at_count: u32,
    pub attempts: u32,
    pub applied: u32,
    pub failures: Vec<IterationFailure>,
    pub stop: LoopStop,
}

/// Run iterations until the budget is spent or a failure stops the run.
///
/// Holds the run lock throughout. Each attempt runs the bootstrap hook first;
/// a hook failure is logged to the session log and ends the run. Other
/// failures follow `settings.failure_policy`.
pub fn run_loop<M, H, F>(
    paths: &RunPaths,
    settings: &LoopSettings,
    model: &M,
    hook: &H,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    M: ModelClient + ?Sized,
    H: BootstrapHook + ?Sized,
    F: FnMut(&IterationReport),
{
    let _lock = RunLock::acquire(&paths.lock)?;
    let controller = IterationController::new(paths, settings, model)?;
    let started_at_count = controller.load_state()?.iteration_count;
    let budget = IterationBudget::new(settings.max_iterations, started_at_count);

    let mut outcome = LoopOutcome {
        started_at_count,
        attempts: 0,
        applied: 0,
        failures: Vec::new(),
        stop: LoopStop::BudgetExhausted,
    };
    if budget.is_exhausted() {
        info!(
            iteration_count = started_at_count,
            max_iterations = settings.max_iterations,
            "iteration budget already reached"
        );
        outcome.stop = LoopStop::AlreadyComplete;
        return Ok(outcome);
    }

    for attempt in 1..=budget.attempts_allowed() {
        if attempt > 1 && !settings.interval.is_zero() {
            thread::sleep(settings.interval);
        }
        outcome.attempts = attempt;

        // Only committed iterations advance the persisted count.
        let iteration = started_at_count + outcome.applied + 1;
        let started_at = Utc::now();
        let clock = Instant::now();
        if let Err(err) = hook.run_pre_iteration(&HookContext {
            iteration,
            paths,
            base_dir: controller.base_dir(),
            source: &settings.source,
        }) {
            warn!(iteration, err = %err, "bootstrap failed; stopping run");
            let report =
                controller.record_failure(iteration, attempt, started_at, clock, err.into())?;
            push_failure(&mut outcome, &report);
            on_iteration(&report);
            outcome.stop = LoopStop::BootstrapFailed { iteration };
            return Ok(outcome);
        }

        let report = controller.run_iteration(iteration, attempt)?;
        on_iteration(&report);
        match &report.outcome {
            IterationOutcome::Applied { .. } => outcome.applied += 1,
            IterationOutcome::Failed(err) => {
                push_failure(&mut outcome, &report);
                if err.is_fatal() || settings.failure_policy == FailurePolicy::Abort {
                    outcome.stop = LoopStop::Aborted {
                        iteration: report.iteration,
                        kind: err.kind(),
                    };
                    return Ok(outcome);
                }
            }
        }
    }
    Ok(outcome)
}

fn push_failure(outcome: &mut LoopOutcome, report: &IterationReport) {
    if let IterationOutcome::Failed(err) = &report.outcome {
        outcome.failures.push(IterationFailure {
            iteration: report.iteration,
            attempt: report.attempt,
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}
