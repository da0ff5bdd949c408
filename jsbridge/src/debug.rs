//! Debugger attach step
//!
//! Attaching happens last during setup, after bindings and bootstrap
//! scripts, so an attached debugger observes the fully built environment.
//! Whether an attach failure aborts setup is a policy knob on
//! [`BridgeConfig`](crate::BridgeConfig).

/// What the engine looks like at attach time
#[derive(Debug)]
pub struct AttachInfo<'a> {
    /// Engine heap ceiling in bytes
    pub memory_limit_bytes: usize,
    /// Engine stack ceiling in bytes
    pub max_stack_bytes: usize,
    /// Names of the bootstrap scripts that ran, in order
    pub bootstrap: &'a [String],
}

/// Collaborator notified when an engine session finishes setup.
///
/// Returning `Err` either aborts setup or is logged and ignored, depending
/// on `fail_on_debug_attach_error`.
pub trait Debugger: Send {
    fn attach(&mut self, info: &AttachInfo<'_>) -> Result<(), String>;
}

/// Default debugger: records the attach in the log and always succeeds
#[derive(Debug, Default)]
pub struct TracingDebugger;

impl Debugger for TracingDebugger {
    fn attach(&mut self, info: &AttachInfo<'_>) -> Result<(), String> {
        tracing::info!(
            memory_limit_bytes = info.memory_limit_bytes,
            max_stack_bytes = info.max_stack_bytes,
            bootstrap_scripts = info.bootstrap.len(),
            "engine session attached"
        );
        Ok(())
    }
}
