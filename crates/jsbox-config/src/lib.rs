#![warn(missing_docs)]

//! # jsbox-config
//!
//! Configuration loading for the jsbox JavaScript sandbox service.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! worker_bin = "${JSBOX_HOME}/bin/jsbox-worker"
//! connect_timeout_secs = 5
//! max_ipc_message_size_mb = 64
//! debug_worker = false
//!
//! [isolate]
//! max_heap_mb = 128
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level jsbox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsboxConfig {
    /// Helper process and connection settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Defaults applied to newly created isolates.
    #[serde(default)]
    pub isolate: IsolateOverrides,
}

/// Sandbox connection overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Absolute path of the helper binary.
    #[serde(default)]
    pub worker_bin: Option<PathBuf>,

    /// How long `connect` waits for the helper handshake, in seconds.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    /// Maximum size of a single IPC frame in megabytes.
    #[serde(default)]
    pub max_ipc_message_size_mb: Option<usize>,

    /// Inherit the helper's stderr instead of discarding it.
    #[serde(default)]
    pub debug_worker: Option<bool>,
}

/// Isolate startup overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IsolateOverrides {
    /// Default per-isolate heap ceiling in megabytes (0 = helper default).
    #[serde(default)]
    pub max_heap_mb: Option<u64>,
}

impl JsboxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: JsboxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bin) = &self.sandbox.worker_bin {
            if !bin.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.worker_bin must be an absolute path, got '{}'",
                    bin.display()
                )));
            }
        }
        if self.sandbox.connect_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.connect_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.sandbox.max_ipc_message_size_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_ipc_message_size_mb must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unresolved placeholders are left in place
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_sandbox_overrides() {
        let toml = r#"
            [sandbox]
            worker_bin = "/opt/jsbox/jsbox-worker"
            connect_timeout_secs = 10
            max_ipc_message_size_mb = 16
            debug_worker = true
        "#;

        let config = JsboxConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.sandbox.worker_bin.as_deref(),
            Some(Path::new("/opt/jsbox/jsbox-worker"))
        );
        assert_eq!(config.sandbox.connect_timeout_secs, Some(10));
        assert_eq!(config.sandbox.max_ipc_message_size_mb, Some(16));
        assert_eq!(config.sandbox.debug_worker, Some(true));
    }

    #[test]
    fn config_parses_isolate_overrides() {
        let toml = r#"
            [isolate]
            max_heap_mb = 128
        "#;

        let config = JsboxConfig::from_toml(toml).unwrap();
        assert_eq!(config.isolate.max_heap_mb, Some(128));
    }

    #[test]
    fn config_uses_defaults_when_absent() {
        let config = JsboxConfig::from_toml("").unwrap();
        assert!(config.sandbox.worker_bin.is_none());
        assert!(config.sandbox.connect_timeout_secs.is_none());
        assert!(config.sandbox.max_ipc_message_size_mb.is_none());
        assert!(config.sandbox.debug_worker.is_none());
        assert!(config.isolate.max_heap_mb.is_none());
    }

    #[test]
    fn config_rejects_relative_worker_bin() {
        let toml = r#"
            [sandbox]
            worker_bin = "./jsbox-worker"
        "#;

        let err = JsboxConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("absolute"), "got: {err}");
    }

    #[test]
    fn config_rejects_zero_timeout() {
        let toml = r#"
            [sandbox]
            connect_timeout_secs = 0
        "#;

        let err = JsboxConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("connect_timeout_secs"));
    }

    #[test]
    fn config_rejects_zero_ipc_limit() {
        let toml = r#"
            [sandbox]
            max_ipc_message_size_mb = 0
        "#;

        let err = JsboxConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("max_ipc_message_size_mb"));
    }

    #[test]
    fn config_rejects_unparseable_toml() {
        let err = JsboxConfig::from_toml("[sandbox\nworker_bin = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn config_expands_environment_variables() {
        std::env::set_var("JSBOX_TEST_HOME", "/srv/jsbox");
        let toml = r#"
            [sandbox]
            worker_bin = "${JSBOX_TEST_HOME}/bin/jsbox-worker"
        "#;

        let config = JsboxConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.sandbox.worker_bin.as_deref(),
            Some(Path::new("/srv/jsbox/bin/jsbox-worker"))
        );
        std::env::remove_var("JSBOX_TEST_HOME");
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jsbox.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            connect_timeout_secs = 3
        "#,
        )
        .unwrap();

        let config = JsboxConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.connect_timeout_secs, Some(3));
    }

    #[test]
    fn config_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsboxConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        let result = expand_env_vars("no variables here");
        assert_eq!(result, "no variables here");
    }
}
