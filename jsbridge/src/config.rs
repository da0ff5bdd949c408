//! Configuration for the QuickJS host bridge

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default engine heap ceiling (64 MB)
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Default engine stack ceiling (1 MB)
pub const DEFAULT_MAX_STACK_BYTES: usize = 1024 * 1024;

/// Default HTTP timeout for script downloads (30 seconds)
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

/// Tuning and policy knobs for an engine session.
///
/// All fields have conservative defaults; `BridgeConfig::default()` yields a
/// usable sandbox with no script root and no bootstrap scripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Engine heap ceiling in bytes
    pub memory_limit_bytes: usize,

    /// Engine stack ceiling in bytes
    pub max_stack_bytes: usize,

    /// Directory packaged scripts and ES module imports resolve against.
    /// When unset, packaged loads fail and module imports are disabled.
    pub script_root: Option<PathBuf>,

    /// Packaged scripts run in order during initialization, before the
    /// debugger attach step
    pub bootstrap: Vec<String>,

    /// Whether a debugger attach failure aborts initialization.
    /// When false the failure is logged and startup continues.
    pub fail_on_debug_attach_error: bool,

    /// Timeout applied to script downloads, in milliseconds
    pub http_timeout_ms: u64,

    /// User-Agent header sent with script downloads
    pub user_agent: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            max_stack_bytes: DEFAULT_MAX_STACK_BYTES,
            script_root: None,
            bootstrap: Vec::new(),
            fail_on_debug_attach_error: true,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            user_agent: default_user_agent(),
        }
    }
}

impl BridgeConfig {
    /// Create a configuration with default limits
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory packaged scripts resolve against
    pub fn with_script_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.script_root = Some(root.into());
        self
    }

    /// Append a packaged script to run during initialization
    pub fn with_bootstrap_script(mut self, name: impl Into<String>) -> Self {
        self.bootstrap.push(name.into());
        self
    }
}

fn default_user_agent() -> String {
    concat!("jsbridge/", env!("CARGO_PKG_VERSION")).to_string()
}
