//! One iteration of the evolve loop.
//!
//! `LoadContext -> Invoke -> Parse -> Apply -> Record`. Ledger and state are
//! only touched after the whole batch (files plus desires) has been committed;
//! every attempt, successful or not, leaves one session record.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::digest::content_hash;
use crate::core::ledger_block::summarize;
use crate::core::response::{ResponseError, parse_response};
use crate::core::types::{AppliedFile, LedgerEntry, Phase, StateSnapshot};
use crate::io::apply::{ApplyError, Sandbox, SandboxViolation};
use crate::io::bootstrap::BootstrapError;
use crate::io::config::LoopSettings;
use crate::io::context::{ContextBundle, ContextSummary, load_context};
use crate::io::ledger::LedgerStore;
use crate::io::model::{ModelClient, ModelRequest, TransportError};
use crate::io::prompt::{PromptBuilder, PromptInputs, SYSTEM_PROMPT};
use crate::io::session_log::{ErrorRecord, Outcome, SessionLog, SessionRecord};
use crate::io::state_store::StateStore;

/// The four run files plus the lock derived from the state path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub desires: PathBuf,
    pub ledger: PathBuf,
    pub state: PathBuf,
    pub session_log: PathBuf,
    /// `<state>.lock`
    pub lock: PathBuf,
}

impl RunPaths {
    pub fn new(
        desires: impl Into<PathBuf>,
        ledger: impl Into<PathBuf>,
        state: impl Into<PathBuf>,
        session_log: impl Into<PathBuf>,
    ) -> Self {
        let state = state.into();
        let mut lock: OsString = state.clone().into_os_string();
        lock.push(".lock");
        Self {
            desires: desires.into(),
            ledger: ledger.into(),
            state,
            session_log: session_log.into(),
            lock: PathBuf::from(lock),
        }
    }

    /// Directory holding the desires document; the write boundary.
    pub fn base_dir(&self) -> &Path {
        match self.desires.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

/// Why an iteration did not commit.
#[derive(Debug, Error)]
pub enum IterationError {
    /// A run file could not be read, or the prompt could not be built.
    #[error("loading iteration inputs failed: {message}")]
    LoadContext { message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("response is not valid JSON: {message}")]
    Parse { message: String },
    #[error("response does not match schema at {pointer}: {message}")]
    Schema { pointer: String, message: String },
    #[error(transparent)]
    SandboxViolation(SandboxViolation),
    #[error("write {path}: {message}")]
    Write { path: String, message: String },
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    /// Files were committed but the ledger or state could not be updated.
    #[error("recording iteration failed: {message}")]
    Persistence { message: String },
}

impl IterationError {
    /// Stable snake_case name used in session records and progress output.
    pub fn kind(&self) -> &'static str {
        match self {
            IterationError::LoadContext { .. } => "load_context_error",
            IterationError::Transport(_) => "transport_error",
            IterationError::Parse { .. } => "parse_error",
            IterationError::Schema { .. } => "schema_error",
            IterationError::SandboxViolation(_) => "sandbox_violation",
            IterationError::Write { .. } => "write_error",
            IterationError::Bootstrap(_) => "bootstrap_error",
            IterationError::Persistence { .. } => "persistence_error",
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            IterationError::Bootstrap(_) => Phase::Init,
            IterationError::LoadContext { .. } => Phase::LoadContext,
            IterationError::Transport(_) => Phase::Invoke,
            IterationError::Parse { .. } | IterationError::Schema { .. } => Phase::Parse,
            IterationError::SandboxViolation(_) | IterationError::Write { .. } => Phase::Apply,
            IterationError::Persistence { .. } => Phase::Record,
        }
    }

    fn load_context(err: anyhow::Error) -> Self {
        IterationError::LoadContext {
            message: format!("{err:#}"),
        }
    }

    /// Failures that end the run whatever the failure policy says.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IterationError::Bootstrap(_) | IterationError::Persistence { .. }
        )
    }
}

impl From<ResponseError> for IterationError {
    fn from(err: ResponseError) -> Self {
        match err {
            ResponseError::Parse { message } => IterationError::Parse { message },
            ResponseError::Schema { pointer, message } => {
                IterationError::Schema { pointer, message }
            }
        }
    }
}

impl From<ApplyError> for IterationError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Sandbox(violation) => IterationError::SandboxViolation(violation),
            ApplyError::Write { path, message } => IterationError::Write { path, message },
        }
    }
}

#[derive(Debug)]
pub enum IterationOutcome {
    Applied {
        desires_changed: bool,
        files: Vec<AppliedFile>,
    },
    Failed(IterationError),
}

/// What one attempt did, handed to the loop's progress callback.
#[derive(Debug)]
pub struct IterationReport {
    /// Iteration number the attempt committed or would have committed.
    pub iteration: u32,
    /// 1-indexed attempt within this run.
    pub attempt: u32,
    pub duration: Duration,
    pub outcome: IterationOutcome,
}

impl IterationReport {
    pub fn is_applied(&self) -> bool {
        matches!(self.outcome, IterationOutcome::Applied { .. })
    }
}

struct Applied {
    desires_changed: bool,
    desires_after: String,
    files: Vec<AppliedFile>,
}

/// Everything read from disk before the model is asked.
struct Inputs {
    state: StateSnapshot,
    desires: String,
    bundle: ContextBundle,
    prompt: String,
}

/// Session record fields gathered while an attempt runs.
#[derive(Default)]
struct Transcript {
    context: Vec<ContextSummary>,
    prompt_bytes: Option<u64>,
    raw_response: Option<String>,
}

/// Drives single iterations against one set of run files.
pub struct IterationController<'a, M: ModelClient + ?Sized> {
    paths: &'a RunPaths,
    settings: &'a LoopSettings,
    model: &'a M,
    sandbox: Sandbox,
    prompts: PromptBuilder,
    ledger: LedgerStore,
    state_store: StateStore,
    session_log: SessionLog,
}

impl<'a, M: ModelClient + ?Sized> IterationController<'a, M> {
    pub fn new(paths: &'a RunPaths, settings: &'a LoopSettings, model: &'a M) -> Result<Self> {
        let state_store = StateStore::new(&paths.state);
        let sandbox = Sandbox::new(paths.base_dir())?
            .protect(&paths.desires, "desires document")
            .protect(&paths.ledger, "ledger")
            .protect(&paths.state, "state file")
            .protect(&state_store.temp_path(), "state file")
            .protect(&paths.session_log, "session log")
            .protect(&paths.lock, "run lock");
        Ok(Self {
            paths,
            settings,
            model,
            sandbox,
            prompts: PromptBuilder::new(
                settings.limits.prompt_budget_bytes,
                settings.limits.context_file_limit_bytes,
            ),
            ledger: LedgerStore::new(&paths.ledger),
            state_store,
            session_log: SessionLog::new(&paths.session_log),
        })
    }

    pub fn load_state(&self) -> Result<StateSnapshot> {
        self.state_store.load()
    }

    pub fn base_dir(&self) -> &Path {
        self.sandbox.base()
    }

    /// Run one attempt from the persisted state.
    ///
    /// `iteration` is the number this attempt commits if it succeeds; the
    /// loop derives it from the count it started at plus what it applied.
    /// Every per-iteration failure, including unreadable run files while the
    /// prompt is assembled, comes back as [`IterationOutcome::Failed`] with a
    /// session record. The `Err` path is reserved for a session log that
    /// cannot be written.
    #[instrument(skip(self))]
    pub fn run_iteration(&self, iteration: u32, attempt: u32) -> Result<IterationReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut transcript = Transcript::default();

        let outcome = match self.load_inputs(&mut transcript) {
            Ok(inputs) => match self.attempt(&inputs, &mut transcript) {
                Ok(applied) => self.commit(&inputs.state, iteration, started_at, applied),
                Err(err) => IterationOutcome::Failed(err),
            },
            Err(err) => IterationOutcome::Failed(err),
        };

        let record = session_record(
            iteration,
            attempt,
            &self.settings.source,
            started_at,
            Utc::now(),
            &outcome,
            transcript,
        );
        self.session_log.append(&record)?;

        match &outcome {
            IterationOutcome::Applied {
                desires_changed,
                files,
            } => info!(desires_changed, files = files.len(), "iteration applied"),
            IterationOutcome::Failed(err) => {
                warn!(kind = err.kind(), err = %err, "iteration failed");
            }
        }
        Ok(IterationReport {
            iteration,
            attempt,
            duration: clock.elapsed(),
            outcome,
        })
    }

    /// Log an attempt that never got past `Init`, e.g. a failed bootstrap.
    ///
    /// `started_at` and `clock` are taken by the caller before the hook ran.
    pub fn record_failure(
        &self,
        iteration: u32,
        attempt: u32,
        started_at: DateTime<Utc>,
        clock: Instant,
        error: IterationError,
    ) -> Result<IterationReport> {
        let outcome = IterationOutcome::Failed(error);
        let record = session_record(
            iteration,
            attempt,
            &self.settings.source,
            started_at,
            Utc::now(),
            &outcome,
            Transcript::default(),
        );
        self.session_log.append(&record)?;
        Ok(IterationReport {
            iteration,
            attempt,
            duration: clock.elapsed(),
            outcome,
        })
    }

    /// Read state, desires and ledger tail, then render the prompt.
    fn load_inputs(&self, transcript: &mut Transcript) -> Result<Inputs, IterationError> {
        let state = self.state_store.load().map_err(IterationError::load_context)?;
        let desires = read_desires(&self.paths.desires).map_err(IterationError::load_context)?;
        let bundle = load_context(self.base_dir(), &self.settings.context);
        transcript.context = bundle.summaries();

        let ledger_tail = self
            .ledger
            .read_tail(self.settings.limits.ledger_tail_entries)
            .map_err(IterationError::load_context)?;
        let prompt = self
            .prompts
            .build(&PromptInputs {
                desires: &desires,
                ledger_tail: &ledger_tail,
                state: &state,
                context: &bundle,
            })
            .map_err(IterationError::load_context)?;
        transcript.prompt_bytes = Some(prompt.len() as u64);

        Ok(Inputs {
            state,
            desires,
            bundle,
            prompt,
        })
    }

    fn attempt(
        &self,
        inputs: &Inputs,
        transcript: &mut Transcript,
    ) -> Result<Applied, IterationError> {
        let Inputs {
            desires,
            bundle,
            prompt,
            ..
        } = inputs;
        let raw = self.model.invoke(&ModelRequest {
            system: SYSTEM_PROMPT,
            prompt,
            context: bundle,
        })?;
        transcript.raw_response = Some(raw.clone());

        let response = parse_response(&raw)?;

        let desires_changed = response.desires.trim() != desires.trim();
        let mut batch = self.sandbox.prepare(&response.files)?;
        let desires_after = if desires_changed {
            let rewritten = format!("{}\n", response.desires.trim_end());
            batch = batch.with_document(&self.paths.desires, rewritten.clone())?;
            rewritten
        } else {
            desires.to_string()
        };
        let files = batch.commit()?;
        Ok(Applied {
            desires_changed,
            desires_after,
            files,
        })
    }

    fn commit(
        &self,
        state: &StateSnapshot,
        iteration: u32,
        started_at: DateTime<Utc>,
        applied: Applied,
    ) -> IterationOutcome {
        let timestamp = rfc3339(started_at);
        let entry = LedgerEntry {
            iteration,
            timestamp: timestamp.clone(),
            source: self.settings.source.clone(),
            desires_changed: applied.desires_changed,
            files_changed: applied.files.iter().map(|f| f.path.clone()).collect(),
            summary: summarize(applied.desires_changed, &applied.files),
        };
        let next = state.advance(
            content_hash(&applied.desires_after),
            &applied.files,
            rfc3339(Utc::now()),
        );

        let recorded = self
            .ledger
            .append(&entry)
            .and_then(|()| self.state_store.save(&next));
        match recorded {
            Ok(()) => IterationOutcome::Applied {
                desires_changed: applied.desires_changed,
                files: applied.files,
            },
            Err(err) => IterationOutcome::Failed(IterationError::Persistence {
                message: format!("{err:#}"),
            }),
        }
    }
}

fn session_record(
    iteration: u32,
    attempt: u32,
    source: &str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: &IterationOutcome,
    transcript: Transcript,
) -> SessionRecord {
    let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
    let (outcome, error, desires_changed, files) = match outcome {
        IterationOutcome::Applied {
            desires_changed,
            files,
        } => (Outcome::Applied, None, Some(*desires_changed), files.clone()),
        IterationOutcome::Failed(err) => (
            Outcome::Failed,
            Some(ErrorRecord {
                kind: err.kind().to_string(),
                phase: err.phase(),
                message: err.to_string(),
            }),
            None,
            Vec::new(),
        ),
    };
    SessionRecord {
        iteration,
        attempt,
        source: source.to_string(),
        started_at: rfc3339(started_at),
        finished_at: rfc3339(finished_at),
        duration_ms,
        outcome,
        error,
        context: transcript.context,
        prompt_bytes: transcript.prompt_bytes,
        raw_response: transcript.raw_response,
        desires_changed,
        files,
    }
}

/// Desires text, or empty when the document does not exist yet.
fn read_desires(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("read desires {}", path.display())),
    }
}

pub(crate) fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
