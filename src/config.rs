//! Runtime configuration types.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Runtime configuration for a VM instance.
///
/// Every field has a default, so a TOML file only needs to name what it
/// overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the operand/locals stack, in values.
    pub stack_size: usize,
    /// Maximum number of simultaneously active frames.
    pub max_call_depth: usize,
    /// Upper bound the verifier accepts for one function's operand depth.
    pub max_stack_per_function: usize,
    /// Collect once this many objects have been allocated since the last cycle.
    pub gc_threshold_objects: usize,
    /// Collect once this many bytes have been allocated since the last cycle.
    pub gc_threshold_bytes: usize,
    /// Whether GC is enabled (default: true)
    pub gc_enabled: bool,
    /// Print `[GC]` statistics to stderr when the VM is dropped.
    pub gc_stats: bool,
    /// Hard limit on heap size in bytes (None = unlimited)
    pub heap_limit: Option<usize>,
    /// Hard limit on the number of live objects (None = unlimited)
    pub max_objects: Option<usize>,
    /// Instruction budget for a single host call.
    pub max_instructions: Option<u64>,
    /// Wall-clock budget for a single host call, in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Print every executed instruction to stderr.
    pub trace_execution: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: 1024,
            max_call_depth: 256,
            max_stack_per_function: 256,
            gc_threshold_objects: 1024,
            gc_threshold_bytes: 1024 * 1024,
            gc_enabled: true,
            gc_stats: false,
            heap_limit: None,
            max_objects: None,
            max_instructions: None,
            timeout_ms: None,
            trace_execution: false,
        }
    }
}

impl RuntimeConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml(&content).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        let config: Self =
            toml::from_str(content).map_err(|e| format!("failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {}", e))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.stack_size == 0 {
            return Err("stack_size must be positive".to_string());
        }
        if self.max_call_depth == 0 {
            return Err("max_call_depth must be positive".to_string());
        }
        if self.max_stack_per_function == 0 {
            return Err("max_stack_per_function must be positive".to_string());
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml("stack_size = 64\ngc_stats = true\n").unwrap();
        assert_eq!(config.stack_size, 64);
        assert!(config.gc_stats);
        assert_eq!(config.max_call_depth, RuntimeConfig::default().max_call_depth);
        assert!(config.gc_enabled);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = RuntimeConfig {
            heap_limit: Some(4096),
            timeout_ms: Some(250),
            ..RuntimeConfig::default()
        };
        let text = config.to_toml().unwrap();
        assert_eq!(RuntimeConfig::from_toml(&text).unwrap(), config);
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_rejects_zero_stack() {
        let err = RuntimeConfig::from_toml("stack_size = 0").unwrap_err();
        assert!(err.contains("stack_size"));
    }

    #[test]
    fn test_unknown_field_type_is_error() {
        assert!(RuntimeConfig::from_toml("stack_size = \"big\"").is_err());
    }
}
