//! Engine session: an owned runtime, its context, and the drain machinery
//!
//! A session is single-threaded; it holds `Rc` state shared with the glue
//! hooks and is deliberately not `Send`. The async host handle owns each
//! session on a dedicated worker thread and serializes access through a
//! channel.

use std::cell::RefCell;
use std::rc::Rc;

use rquickjs::{Context, Function, Runtime, Value};

use crate::bindings::{self, BindingEntry, HostBindings, HostObject, NativeCallback, ObjectTable};
use crate::bridge;
use crate::builtins::{self, DeferredQueue, FIRE_FN, STASH_FN, TAKE_FN};
use crate::config::BridgeConfig;
use crate::debug::{AttachInfo, Debugger, TracingDebugger};
use crate::error::{ProjectionError, ScriptError, SetupError};
use crate::loader::ModuleResolver;
use crate::source::SourceContextAllocator;

/// Options for bringing up an engine session
pub struct InitOptions {
    /// Host bindings projected during setup, in insertion order
    pub bindings: HostBindings,
    /// Debugger collaborator consulted at the end of setup
    pub debugger: Box<dyn Debugger>,
}

impl InitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carrying the given bindings and the default debugger
    pub fn with_bindings(bindings: HostBindings) -> Self {
        Self {
            bindings,
            debugger: Box::new(TracingDebugger),
        }
    }
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            bindings: HostBindings::new(),
            debugger: Box::new(TracingDebugger),
        }
    }
}

/// A packaged script resolved to text, ready to run during setup
pub(crate) struct BootstrapScript {
    pub(crate) name: String,
    pub(crate) text: String,
}

/// Counters describing a session's activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Script executions, bootstrap scripts included
    pub scripts_executed: u64,
    /// Engine continuation jobs drained
    pub jobs_drained: u64,
    /// Deferred callbacks invoked
    pub deferred_invoked: u64,
}

/// A live engine session.
///
/// Field order matters: the context must release before the runtime when
/// the session drops.
pub(crate) struct EngineSession {
    context: Context,
    runtime: Runtime,
    sources: SourceContextAllocator,
    deferred: Rc<RefCell<DeferredQueue>>,
    objects: Rc<RefCell<ObjectTable>>,
    jobs_drained: u64,
    deferred_invoked: u64,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession").finish_non_exhaustive()
    }
}

impl EngineSession {
    /// Bring up a full engine session.
    ///
    /// Setup steps run in a fixed order and each failure names its step:
    /// runtime, context, context activation, continuation hooks, binding
    /// projection (console and window first, then caller bindings in
    /// insertion order), bootstrap scripts, debugger attach.
    pub(crate) fn open(
        config: &BridgeConfig,
        options: InitOptions,
        scripts: Vec<BootstrapScript>,
    ) -> Result<Self, SetupError> {
        let InitOptions {
            bindings,
            mut debugger,
        } = options;
        let HostBindings { entries, console } = bindings;

        let runtime = Runtime::new().map_err(|e| SetupError::RuntimeCreate(e.to_string()))?;
        runtime.set_memory_limit(config.memory_limit_bytes);
        runtime.set_max_stack_size(config.max_stack_bytes);

        let context =
            Context::full(&runtime).map_err(|e| SetupError::ContextCreate(e.to_string()))?;

        // Activation probe: enter the fresh context once and touch its
        // global object before anything else runs in it
        context
            .with(|ctx| -> rquickjs::Result<()> {
                let _global: Value = ctx.globals().get("globalThis")?;
                Ok(())
            })
            .map_err(|e| SetupError::ContextActivate(e.to_string()))?;

        if let Some(root) = &config.script_root {
            runtime.set_loader(
                ModuleResolver::new(root.clone()),
                rquickjs::loader::ScriptLoader::default(),
            );
        }

        let deferred = Rc::new(RefCell::new(DeferredQueue::default()));
        let objects = Rc::new(RefCell::new(ObjectTable::default()));
        context
            .with(|ctx| builtins::install_hooks(&ctx, deferred.clone(), objects.clone()))
            .map_err(|e| SetupError::ContinuationHook(e.to_string()))?;

        context
            .with(|ctx| builtins::install_console(&ctx, console.clone()))
            .map_err(|e| SetupError::Projection {
                name: "console".to_string(),
                detail: e.to_string(),
            })?;
        context
            .with(|ctx| builtins::install_window(&ctx, console))
            .map_err(|e| SetupError::Projection {
                name: "window".to_string(),
                detail: e.to_string(),
            })?;

        let mut session = Self {
            context,
            runtime,
            sources: SourceContextAllocator::new(),
            deferred,
            objects,
            jobs_drained: 0,
            deferred_invoked: 0,
        };

        for entry in entries {
            match entry {
                BindingEntry::Function { name, callback } => session
                    .define_function(&name, callback)
                    .map_err(|e| SetupError::Projection {
                        name: name.clone(),
                        detail: e.to_string(),
                    })?,
                BindingEntry::Object { name, object } => session
                    .define_object(&name, object)
                    .map_err(|e| SetupError::Projection {
                        name: name.clone(),
                        detail: e.to_string(),
                    })?,
            }
        }

        let script_names: Vec<String> =
            scripts.iter().map(|script| script.name.clone()).collect();
        for script in &scripts {
            tracing::debug!(name = %script.name, "running bootstrap script");
            session
                .run(&script.text)
                .map_err(|e| SetupError::ScriptReference {
                    name: script.name.clone(),
                    detail: e.to_string(),
                })?;
        }

        let info = AttachInfo {
            memory_limit_bytes: config.memory_limit_bytes,
            max_stack_bytes: config.max_stack_bytes,
            bootstrap: &script_names,
        };
        match debugger.attach(&info) {
            Ok(()) => {}
            Err(detail) if config.fail_on_debug_attach_error => {
                return Err(SetupError::DebuggerAttach(detail));
            }
            Err(detail) => {
                tracing::warn!(%detail, "debugger attach failed, continuing without debugger");
            }
        }

        Ok(session)
    }

    /// Execute script text and render its completion value as text.
    ///
    /// The completion value is parked while continuations drain, then
    /// converted with the guest's own string coercion, so continuations
    /// observe and can affect the final state but not the chosen value.
    pub(crate) fn run(&mut self, source: &str) -> Result<String, ScriptError> {
        let source_context = self.sources.next();
        let span = tracing::debug_span!("run_script", source_context = source_context.value());
        let _entered = span.enter();
        tracing::trace!(bytes = source.len(), "evaluating script");

        self.context
            .with(|ctx| match ctx.eval::<Value, _>(source.as_bytes()) {
                Ok(value) => {
                    let stash: Function = ctx
                        .globals()
                        .get(STASH_FN)
                        .map_err(|e| ScriptError::internal(e.to_string()))?;
                    stash
                        .call::<_, ()>((value,))
                        .map_err(|e| ScriptError::internal(e.to_string()))
                }
                Err(error) => Err(bridge::failure_from_eval(&ctx, error)),
            })?;

        self.drain_continuations()?;

        self.context.with(|ctx| {
            let take: Function = ctx
                .globals()
                .get(TAKE_FN)
                .map_err(|e| ScriptError::internal(e.to_string()))?;
            let value: Value = take
                .call(())
                .map_err(|e| ScriptError::internal(e.to_string()))?;
            bridge::coerce_to_string(&ctx, value)
        })
    }

    /// Run engine jobs and deferred callbacks until both queues are empty.
    ///
    /// Engine jobs (promise reactions) always run before deferred
    /// callbacks, and a callback that schedules more work extends the
    /// drain. A failing continuation fails the whole run.
    fn drain_continuations(&mut self) -> Result<(), ScriptError> {
        loop {
            loop {
                match self.runtime.execute_pending_job() {
                    Ok(true) => self.jobs_drained += 1,
                    Ok(false) => break,
                    Err(error) => {
                        return Err(ScriptError::ContinuationFailed(format!("{error:?}")));
                    }
                }
            }

            let Some(timer) = self.deferred.borrow_mut().pop_due() else {
                break;
            };

            self.context.with(|ctx| -> Result<(), ScriptError> {
                let fire: Function = ctx
                    .globals()
                    .get(FIRE_FN)
                    .map_err(|e| ScriptError::internal(e.to_string()))?;
                match fire.call::<_, ()>((timer,)) {
                    Ok(()) => Ok(()),
                    Err(error) => Err(match bridge::failure_from_eval(&ctx, error) {
                        ScriptError::Evaluation { message } => {
                            ScriptError::ContinuationFailed(message)
                        }
                        other => other,
                    }),
                }
            })?;
            self.deferred_invoked += 1;
        }
        Ok(())
    }

    /// Install a native function binding on the live session
    pub(crate) fn define_function(
        &mut self,
        name: &str,
        callback: NativeCallback,
    ) -> Result<(), ProjectionError> {
        self.context
            .with(|ctx| bindings::install_function(&ctx, name, callback))
    }

    /// Project a host object binding on the live session
    pub(crate) fn define_object(
        &mut self,
        name: &str,
        object: Box<dyn HostObject>,
    ) -> Result<(), ProjectionError> {
        self.context
            .with(|ctx| bindings::project_object(&ctx, &self.objects, name, object))
    }

    pub(crate) fn stats(&self) -> HostStats {
        HostStats {
            scripts_executed: self.sources.issued(),
            jobs_drained: self.jobs_drained,
            deferred_invoked: self.deferred_invoked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::ConsoleLevel;
    use std::sync::{Arc, Mutex};

    fn open_default() -> EngineSession {
        EngineSession::open(&BridgeConfig::default(), InitOptions::default(), Vec::new())
            .expect("open session")
    }

    #[test]
    fn test_run_simple_expression() {
        let mut session = open_default();
        assert_eq!(session.run("1 + 1").expect("run"), "2");
    }

    #[test]
    fn test_run_renders_result_with_guest_coercion() {
        let mut session = open_default();
        assert_eq!(
            session.run("'hello ' + 'world'").expect("run"),
            "hello world"
        );
        assert_eq!(session.run("undefined").expect("run"), "undefined");
        assert_eq!(session.run("[1, 2, 3]").expect("run"), "1,2,3");
        assert_eq!(
            session
                .run("({ toString() { return 'widget'; } })")
                .expect("run"),
            "widget"
        );
    }

    #[test]
    fn test_run_surfaces_guest_exception_message() {
        let mut session = open_default();
        let error = session.run("nosuchthing()").expect_err("should fail");
        match error {
            ScriptError::Evaluation { message } => {
                assert!(message.contains("not defined"), "got: {message}");
            }
            other => panic!("expected evaluation error, got {other:?}"),
        }
    }

    #[test]
    fn test_session_survives_a_failed_run() {
        let mut session = open_default();
        session.run("throw new Error('first')").expect_err("fails");
        assert_eq!(session.run("6 * 7").expect("run"), "42");
    }

    #[test]
    fn test_promise_continuations_run_before_result_returns() {
        let mut session = open_default();
        let result = session
            .run("globalThis.settled = false; Promise.resolve().then(function () { settled = true; }); 'scheduled'")
            .expect("run");
        assert_eq!(result, "scheduled");
        assert_eq!(session.run("settled").expect("run"), "true");
    }

    #[test]
    fn test_every_continuation_registered_before_drain_runs() {
        let mut session = open_default();
        session
            .run(
                "globalThis.order = [];\n\
                 Promise.resolve().then(function () { order.push('first'); });\n\
                 Promise.resolve().then(function () { order.push('second'); });\n\
                 'scheduled'",
            )
            .expect("run");
        assert_eq!(session.run("order.join(',')").expect("run"), "first,second");
    }

    #[test]
    fn test_promise_chains_drain_to_completion() {
        let mut session = open_default();
        session
            .run(
                "globalThis.total = 0;\n\
                 Promise.resolve(1)\n\
                     .then(function (n) { return n + 1; })\n\
                     .then(function (n) { return n * 10; })\n\
                     .then(function (n) { total = n; });\n\
                 'chained'",
            )
            .expect("run");
        assert_eq!(session.run("total").expect("run"), "20");
    }

    #[test]
    fn test_deferred_callbacks_run_after_jobs_in_delay_order() {
        let mut session = open_default();
        session
            .run(
                "globalThis.order = [];\n\
                 setTimeout(function () { order.push('slow'); }, 50);\n\
                 setTimeout(function () { order.push('fast'); }, 10);\n\
                 Promise.resolve().then(function () { order.push('job'); });\n\
                 'scheduled'",
            )
            .expect("run");
        assert_eq!(
            session.run("order.join(',')").expect("run"),
            "job,fast,slow"
        );
    }

    #[test]
    fn test_deferred_callback_can_extend_the_drain() {
        let mut session = open_default();
        session
            .run(
                "globalThis.log = [];\n\
                 setTimeout(function () {\n\
                     log.push('outer');\n\
                     setTimeout(function () { log.push('inner'); }, 0);\n\
                 }, 0);\n\
                 'scheduled'",
            )
            .expect("run");
        assert_eq!(session.run("log.join(',')").expect("run"), "outer,inner");
    }

    #[test]
    fn test_failing_deferred_callback_fails_the_run() {
        let mut session = open_default();
        let error = session
            .run("setTimeout(function () { throw new Error('late failure'); }, 0); 'ok'")
            .expect_err("should fail");
        match error {
            ScriptError::ContinuationFailed(detail) => assert_eq!(detail, "late failure"),
            other => panic!("expected continuation failure, got {other:?}"),
        }
        // The session stays usable afterwards
        assert_eq!(session.run("2 + 2").expect("run"), "4");
    }

    #[test]
    fn test_cleared_timeout_never_fires() {
        let mut session = open_default();
        session
            .run(
                "globalThis.fired = false;\n\
                 var t = setTimeout(function () { fired = true; }, 0);\n\
                 clearTimeout(t);\n\
                 'cleared'",
            )
            .expect("run");
        assert_eq!(session.run("fired").expect("run"), "false");
    }

    #[test]
    fn test_result_value_chosen_before_continuations_mutate_state() {
        let mut session = open_default();
        let result = session
            .run(
                "globalThis.tag = 'before';\n\
                 Promise.resolve().then(function () { tag = 'after'; });\n\
                 tag",
            )
            .expect("run");
        assert_eq!(result, "before");
        assert_eq!(session.run("tag").expect("run"), "after");
    }

    #[test]
    fn test_bootstrap_scripts_run_in_order() {
        let scripts = vec![
            BootstrapScript {
                name: "first.js".to_string(),
                text: "globalThis.boot = ['first'];".to_string(),
            },
            BootstrapScript {
                name: "second.js".to_string(),
                text: "boot.push('second');".to_string(),
            },
        ];
        let mut session =
            EngineSession::open(&BridgeConfig::default(), InitOptions::default(), scripts)
                .expect("open session");
        assert_eq!(session.run("boot.join(',')").expect("run"), "first,second");
    }

    #[test]
    fn test_failing_bootstrap_script_names_itself() {
        let scripts = vec![BootstrapScript {
            name: "broken.js".to_string(),
            text: "throw new Error('bad bootstrap');".to_string(),
        }];
        let error =
            EngineSession::open(&BridgeConfig::default(), InitOptions::default(), scripts)
                .expect_err("should fail");
        match error {
            SetupError::ScriptReference { name, detail } => {
                assert_eq!(name, "broken.js");
                assert!(detail.contains("bad bootstrap"), "got: {detail}");
            }
            other => panic!("expected script reference error, got {other:?}"),
        }
    }

    struct FailingDebugger;

    impl Debugger for FailingDebugger {
        fn attach(&mut self, _info: &AttachInfo<'_>) -> Result<(), String> {
            Err("no debug transport".to_string())
        }
    }

    #[test]
    fn test_debug_attach_failure_is_fatal_by_default() {
        let options = InitOptions {
            bindings: HostBindings::new(),
            debugger: Box::new(FailingDebugger),
        };
        let error = EngineSession::open(&BridgeConfig::default(), options, Vec::new())
            .expect_err("should fail");
        assert_eq!(
            error.to_string(),
            "failed to start debugging: no debug transport"
        );
    }

    #[test]
    fn test_debug_attach_failure_can_be_tolerated() {
        let config = BridgeConfig {
            fail_on_debug_attach_error: false,
            ..BridgeConfig::default()
        };
        let options = InitOptions {
            bindings: HostBindings::new(),
            debugger: Box::new(FailingDebugger),
        };
        let mut session =
            EngineSession::open(&config, options, Vec::new()).expect("open session");
        assert_eq!(session.run("'still alive'").expect("run"), "still alive");
    }

    struct RecordingDebugger {
        seen: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl Debugger for RecordingDebugger {
        fn attach(&mut self, info: &AttachInfo<'_>) -> Result<(), String> {
            self.seen.lock().unwrap().push(info.bootstrap.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_debugger_attaches_once_after_bootstrap() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let options = InitOptions {
            bindings: HostBindings::new(),
            debugger: Box::new(RecordingDebugger { seen: seen.clone() }),
        };
        let scripts = vec![BootstrapScript {
            name: "boot.js".to_string(),
            text: "globalThis.ready = true;".to_string(),
        }];
        EngineSession::open(&BridgeConfig::default(), options, scripts).expect("open session");
        let attaches = seen.lock().unwrap();
        assert_eq!(attaches.len(), 1);
        assert_eq!(attaches[0], vec!["boot.js".to_string()]);
    }

    #[test]
    fn test_bindings_are_projected_before_bootstrap_runs() {
        let captured: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink_captured = captured.clone();
        let bindings = HostBindings::new()
            .function("record", move |args| {
                let text = args
                    .first()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(serde_json::Value::String(text))
            })
            .console_sink(move |_level, message| {
                sink_captured.lock().unwrap().push(message.to_string());
            });
        let scripts = vec![BootstrapScript {
            name: "boot.js".to_string(),
            text: "console.log(record('from bootstrap'));".to_string(),
        }];
        EngineSession::open(
            &BridgeConfig::default(),
            InitOptions::with_bindings(bindings),
            scripts,
        )
        .expect("open session");
        assert_eq!(
            captured.lock().unwrap().as_slice(),
            &["from bootstrap".to_string()]
        );
    }

    #[test]
    fn test_console_default_sink_does_not_fail_runs() {
        let mut session = open_default();
        assert_eq!(
            session
                .run("console.log('plain log'); console.error('bad news'); 'logged'")
                .expect("run"),
            "logged"
        );
    }

    #[test]
    fn test_window_alert_reaches_console_sink() {
        let captured: Arc<Mutex<Vec<(ConsoleLevel, String)>>> = Arc::default();
        let sink_captured = captured.clone();
        let bindings = HostBindings::new().console_sink(move |level, message| {
            sink_captured.lock().unwrap().push((level, message.to_string()));
        });
        let mut session = EngineSession::open(
            &BridgeConfig::default(),
            InitOptions::with_bindings(bindings),
            Vec::new(),
        )
        .expect("open session");
        session.run("window.alert('look out'); 'done'").expect("run");
        assert_eq!(
            captured.lock().unwrap().as_slice(),
            &[(ConsoleLevel::Warn, "look out".to_string())]
        );
    }

    #[test]
    fn test_stats_count_runs_jobs_and_deferred() {
        let mut session = open_default();
        session
            .run("Promise.resolve().then(function () {}); setTimeout(function () {}, 0); 'x'")
            .expect("run");
        session.run("'y'").expect("run");
        let stats = session.stats();
        assert_eq!(stats.scripts_executed, 2);
        assert!(stats.jobs_drained >= 1);
        assert_eq!(stats.deferred_invoked, 1);
    }

    #[test]
    fn test_bootstrap_counts_toward_scripts_executed() {
        let scripts = vec![BootstrapScript {
            name: "boot.js".to_string(),
            text: "1".to_string(),
        }];
        let session =
            EngineSession::open(&BridgeConfig::default(), InitOptions::default(), scripts)
                .expect("open session");
        assert_eq!(session.stats().scripts_executed, 1);
    }

    #[test]
    fn test_module_import_resolves_inside_script_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("lib.js"), "export const fourteen = 14;")
            .expect("write module");
        let config = BridgeConfig::new().with_script_root(dir.path());
        let mut session =
            EngineSession::open(&config, InitOptions::default(), Vec::new()).expect("open");
        session
            .run(
                "import('lib.js').then(function (m) { globalThis.fourteen = m.fourteen; }); 'importing'",
            )
            .expect("run");
        assert_eq!(session.run("fourteen").expect("run"), "14");
    }

    #[test]
    fn test_module_import_outside_root_rejects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = BridgeConfig::new().with_script_root(dir.path());
        let mut session =
            EngineSession::open(&config, InitOptions::default(), Vec::new()).expect("open");
        session
            .run(
                "globalThis.blocked = false;\n\
                 import('../escape.js').catch(function () { blocked = true; });\n\
                 'checking'",
            )
            .expect("run");
        assert_eq!(session.run("blocked").expect("run"), "true");
    }

    #[test]
    fn test_source_contexts_increase_across_runs() {
        let mut session = open_default();
        session.run("1").expect("run");
        session.run("2").expect("run");
        session.run("3").expect("run");
        assert_eq!(session.stats().scripts_executed, 3);
    }
}
