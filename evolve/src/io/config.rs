//! Evolve configuration loaded from an optional TOML file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::FailurePolicy;

/// Evolve configuration (TOML).
///
/// Every field has a default except the two run choices that must be made
/// explicitly: `run.max_iterations` and `run.failure_policy`. Command-line
/// flags override whatever the file says.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvolveConfig {
    /// Label recorded with every ledger entry and session record.
    pub source: String,
    pub model: ModelConfig,
    pub run: RunConfig,
    pub limits: LimitsConfig,
}

/// Inference endpoint settings for the chat-completions client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL; `/v1/chat/completions` is appended.
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Extra attempts for retryable transport failures.
    pub retries: u32,
    /// Ask the endpoint to constrain output to the response schema.
    pub structured_output: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub max_iterations: Option<u32>,
    /// Pause between iterations.
    pub interval_secs: u64,
    pub failure_policy: Option<FailurePolicy>,
    /// Context files, relative to the desires directory unless absolute.
    pub context: Vec<PathBuf>,
    /// Executable run before every iteration.
    pub bootstrap: Option<PathBuf>,
    pub bootstrap_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Context file content beyond this many bytes is truncated in the prompt.
    pub context_file_limit_bytes: usize,
    /// Ledger blocks shown to the model.
    pub ledger_tail_entries: usize,
    /// Rendered prompt size before optional sections are dropped.
    pub prompt_budget_bytes: usize,
    /// Truncate captured bootstrap output beyond this many bytes.
    pub hook_output_limit_bytes: usize,
}

impl Default for EvolveConfig {
    fn default() -> Self {
        Self {
            source: "evolve".to_string(),
            model: ModelConfig::default(),
            run: RunConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:1234".to_string(),
            model: "local-model".to_string(),
            temperature: 0.7,
            max_tokens: 512,
            timeout_secs: 30,
            retries: 0,
            structured_output: false,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: None,
            interval_secs: 0,
            failure_policy: None,
            context: Vec::new(),
            bootstrap: None,
            bootstrap_timeout_secs: 5 * 60,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            context_file_limit_bytes: 64 * 1024,
            ledger_tail_entries: 5,
            prompt_budget_bytes: 60_000,
            hook_output_limit_bytes: 100_000,
        }
    }
}

impl EvolveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(anyhow!("source must not be empty"));
        }
        let api_base = self.model.api_base.trim();
        if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
            return Err(anyhow!(
                "model.api_base must be an http(s) URL (got '{}')",
                self.model.api_base
            ));
        }
        if self.model.model.trim().is_empty() {
            return Err(anyhow!("model.model must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(anyhow!("model.temperature must be within 0.0..=2.0"));
        }
        if self.model.max_tokens == 0 {
            return Err(anyhow!("model.max_tokens must be > 0"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.run.max_iterations == Some(0) {
            return Err(anyhow!("run.max_iterations must be >= 1"));
        }
        if self.run.bootstrap_timeout_secs == 0 {
            return Err(anyhow!("run.bootstrap_timeout_secs must be > 0"));
        }
        if self.limits.context_file_limit_bytes == 0 {
            return Err(anyhow!("limits.context_file_limit_bytes must be > 0"));
        }
        if self.limits.prompt_budget_bytes == 0 {
            return Err(anyhow!("limits.prompt_budget_bytes must be > 0"));
        }
        if self.limits.hook_output_limit_bytes == 0 {
            return Err(anyhow!("limits.hook_output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Resolve into loop settings, refusing to guess the run choices.
    pub fn loop_settings(&self) -> Result<LoopSettings> {
        self.validate()?;
        let max_iterations = self.run.max_iterations.ok_or_else(|| {
            anyhow!("max iterations not set (pass --max-iterations or set run.max_iterations)")
        })?;
        let failure_policy = self.run.failure_policy.ok_or_else(|| {
            anyhow!(
                "failure policy not set (pass --on-failure abort|skip or set run.failure_policy)"
            )
        })?;
        Ok(LoopSettings {
            source: self.source.trim().to_string(),
            max_iterations,
            failure_policy,
            interval: Duration::from_secs(self.run.interval_secs),
            context: self.run.context.clone(),
            limits: self.limits.clone(),
        })
    }
}

/// Fully resolved settings the loop runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSettings {
    pub source: String,
    pub max_iterations: u32,
    pub failure_policy: FailurePolicy,
    pub interval: Duration,
    pub context: Vec<PathBuf>,
    pub limits: LimitsConfig,
}

impl LoopSettings {
    /// Settings with default limits and no context, for callers that build
    /// their own loop.
    pub fn new(max_iterations: u32, failure_policy: FailurePolicy) -> Self {
        Self {
            source: "evolve".to_string(),
            max_iterations,
            failure_policy,
            interval: Duration::ZERO,
            context: Vec::new(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Load config from a TOML file, or defaults when no file is given.
///
/// An explicitly named file that does not exist is an error.
pub fn load_config(path: Option<&Path>) -> Result<EvolveConfig> {
    let Some(path) = path else {
        return Ok(EvolveConfig::default());
    };
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EvolveConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}
