//! Iteration budget arithmetic for a bounded run.

/// Attempts a run may make given the configured maximum and the committed
/// iteration count it resumes from.
///
/// Every attempt consumes one unit whether it commits or fails, so the
/// persisted count can never pass `max_iterations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    max_iterations: u32,
    completed: u32,
}

impl IterationBudget {
    pub fn new(max_iterations: u32, completed: u32) -> Self {
        Self {
            max_iterations,
            completed,
        }
    }

    /// Number of attempts this run may make.
    pub fn attempts_allowed(&self) -> u32 {
        self.max_iterations.saturating_sub(self.completed)
    }

    /// Whether a run starting from this budget has nothing to do.
    pub fn is_exhausted(&self) -> bool {
        self.attempts_allowed() == 0
    }
}
