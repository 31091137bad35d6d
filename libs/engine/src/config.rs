//! TOML-based engine configuration
//!
//! Provides declarative wiring for a workflow: identity, optional pool
//! bounds, optional retry policy. Durations are expressed in
//! milliseconds. Parsing and validation fail fast with
//! [`EngineError::InvalidConfig`]; pool bounds are the exception and are
//! auto-corrected at start rather than rejected.

use crate::error::EngineError;
use crate::pool::PoolConfig;
use crate::retry::RetryConfig;
use crate::workflow::WorkflowConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    pub workflow: WorkflowSection,

    /// Present only for pooling workflows
    pub pool: Option<PoolSection>,

    /// Present only when failed messages should be retried
    pub retry: Option<RetrySection>,
}

/// Workflow identity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowSection {
    pub id: String,
    pub channel_id: String,
}

/// Worker pool bounds, all optional with pool defaults
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PoolSection {
    pub pool_size: Option<usize>,
    pub min_idle: Option<usize>,
    pub max_idle: Option<usize>,
    pub init_wait_ms: Option<u64>,
    pub shutdown_wait_ms: Option<u64>,
}

/// Retry policy; a missing `retry_limit` retries forever
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RetrySection {
    pub retry_limit: Option<u32>,
    pub retry_interval_ms: Option<u64>,
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml(toml_str: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = toml::from_str(toml_str)
            .map_err(|e| EngineError::invalid_config(format!("TOML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.workflow_config().validate()?;
        self.retry_config().validate()?;
        // Pool bounds are deliberately not validated here; they are
        // auto-corrected with a warning when the pool starts.
        Ok(())
    }

    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig::new(&self.workflow.id, &self.workflow.channel_id)
    }

    pub fn pool_config(&self) -> PoolConfig {
        let defaults = PoolConfig::default();
        match &self.pool {
            None => defaults,
            Some(section) => PoolConfig {
                pool_size: section.pool_size.unwrap_or(defaults.pool_size),
                min_idle: section.min_idle.unwrap_or(defaults.min_idle),
                max_idle: section.max_idle.unwrap_or(defaults.max_idle),
                init_wait: section
                    .init_wait_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.init_wait),
                shutdown_wait: section
                    .shutdown_wait_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.shutdown_wait),
            },
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        match &self.retry {
            None => defaults,
            Some(section) => RetryConfig {
                retry_limit: section.retry_limit,
                retry_interval: section
                    .retry_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry_interval),
            },
        }
    }
}
