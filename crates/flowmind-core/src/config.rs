use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalPolicy;
use crate::error::{FlowError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: RunLimits,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub approval: ApprovalPolicy,
    /// Forwarded untouched to the model capability with every request.
    #[serde(default)]
    pub model: Option<ModelConfig>,
}

/// Bounds applied to every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    /// Default cap on model turns inside one LLM node's tool-call loop.
    #[serde(default = "default_max_tool_steps")]
    pub max_tool_steps: usize,
    /// Default fan-out worker pool width.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Maximum node executions per run.
    #[serde(default = "default_max_run_steps")]
    pub max_run_steps: usize,
    /// Tool output fed back to the model is truncated past this many characters.
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_tool_steps: default_max_tool_steps(),
            max_workers: default_max_workers(),
            max_run_steps: default_max_run_steps(),
            max_tool_output_chars: default_max_tool_output_chars(),
        }
    }
}

fn default_max_tool_steps() -> usize { 10 }
fn default_max_workers() -> usize { 4 }
fn default_max_run_steps() -> usize { 1000 }
fn default_max_tool_output_chars() -> usize { 16_000 }

/// Retry configuration for model transport and structured-output failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 8000 }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

impl EngineConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_workers == 0 {
            return Err(FlowError::Config("engine.max_workers must be at least 1".into()));
        }
        if self.engine.max_tool_steps == 0 {
            return Err(FlowError::Config("engine.max_tool_steps must be at least 1".into()));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
