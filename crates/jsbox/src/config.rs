//! Host-side connection settings.

use std::path::PathBuf;
use std::time::Duration;

use jsbox_config::JsboxConfig;

use crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE;
use crate::params::IsolateStartupParameters;

/// Default time allowed for the helper handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`Sandbox::connect`](crate::Sandbox::connect).
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Explicit helper binary. When unset the binary is discovered.
    pub worker_bin: Option<PathBuf>,
    /// How long to wait for the handshake.
    pub connect_timeout: Duration,
    /// Largest IPC frame accepted from the helper.
    pub max_ipc_message_size: usize,
    /// Inherit the helper's stderr.
    pub debug_worker: bool,
    /// Parameters used by [`Sandbox::create_isolate`](crate::Sandbox::create_isolate).
    pub default_isolate_parameters: IsolateStartupParameters,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worker_bin: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
            debug_worker: false,
            default_isolate_parameters: IsolateStartupParameters::default(),
        }
    }
}

impl SandboxConfig {
    /// Apply overrides from a parsed config file on top of the defaults.
    pub fn from_overrides(config: &JsboxConfig) -> Self {
        let mut out = Self::default();
        let sandbox = &config.sandbox;

        if let Some(bin) = &sandbox.worker_bin {
            out.worker_bin = Some(bin.clone());
        }
        if let Some(secs) = sandbox.connect_timeout_secs {
            out.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(mb) = sandbox.max_ipc_message_size_mb {
            out.max_ipc_message_size = mb.saturating_mul(1024 * 1024);
        }
        if let Some(debug) = sandbox.debug_worker {
            out.debug_worker = debug;
        }
        if let Some(mb) = config.isolate.max_heap_mb {
            out.default_isolate_parameters = IsolateStartupParameters::new()
                .with_max_heap_bytes(mb.saturating_mul(1024 * 1024));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.max_ipc_message_size, 64 * 1024 * 1024);
        assert!(config.worker_bin.is_none());
        assert!(!config.debug_worker);
        assert!(!config.default_isolate_parameters.has_heap_cap());
    }

    #[test]
    fn overrides_are_applied() {
        let file = JsboxConfig::from_toml(
            r#"
            [sandbox]
            worker_bin = "/opt/jsbox/jsbox-worker"
            connect_timeout_secs = 12
            max_ipc_message_size_mb = 8
            debug_worker = true

            [isolate]
            max_heap_mb = 100
            "#,
        )
        .unwrap();

        let config = SandboxConfig::from_overrides(&file);
        assert_eq!(
            config.worker_bin.as_deref(),
            Some(std::path::Path::new("/opt/jsbox/jsbox-worker"))
        );
        assert_eq!(config.connect_timeout, Duration::from_secs(12));
        assert_eq!(config.max_ipc_message_size, 8 * 1024 * 1024);
        assert!(config.debug_worker);
        assert_eq!(
            config.default_isolate_parameters.max_heap_bytes(),
            100 * 1024 * 1024
        );
    }

    #[test]
    fn empty_file_keeps_defaults() {
        let config = SandboxConfig::from_overrides(&JsboxConfig::default());
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.max_ipc_message_size, DEFAULT_MAX_IPC_MESSAGE_SIZE);
    }
}
