//! VM configuration.

use serde::Deserialize;
use thiserror::Error;

/// Default hard limit on call stack nesting.
const DEFAULT_MAX_CALL_DEPTH: usize = 4096;

/// Default operand stack size limit.
const DEFAULT_MAX_STACK_SIZE: usize = 1 << 20;

/// Async trace segments link weakly to their parent every this many segments.
const DEFAULT_ASYNC_TRACE_WEAK_PERIOD: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse VM configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid VM configuration: {0}")]
    Invalid(&'static str),
}

/// Limits and switches of a VM.
///
/// Can be read from TOML:
///
/// ```toml
/// max_call_depth = 512
/// profiling = true
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_stack_size: usize,
    /// Record call counts and time per function.
    pub profiling: bool,
    pub async_trace_weak_period: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            profiling: false,
            async_trace_weak_period: DEFAULT_ASYNC_TRACE_WEAK_PERIOD,
        }
    }
}

impl VmConfig {
    /// Parse a configuration document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: VmConfig = toml::from_str(s)?;
        if config.max_call_depth == 0 {
            return Err(ConfigError::Invalid("max_call_depth must be positive"));
        }
        if config.async_trace_weak_period == 0 {
            return Err(ConfigError::Invalid("async_trace_weak_period must be positive"));
        }
        Ok(config)
    }
}
