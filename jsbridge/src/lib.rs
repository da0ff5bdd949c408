//! Embedded QuickJS host bridge
//!
//! Owns a JavaScript engine on a dedicated worker thread and exposes an
//! async, cloneable handle for executing scripts, projecting host bindings
//! into the guest, and retrieving script text from disk or over HTTP.
//!
//! # Architecture
//!
//! - One OS thread per engine. The engine is single-threaded by contract;
//!   all access serializes through a request channel to the owning thread.
//! - Scripts evaluate to a text rendering of their completion value, using
//!   the guest's own string coercion.
//! - After every execution, promise reactions and deferred callbacks drain
//!   to quiescence before the result is rendered. Every registered
//!   continuation runs; none are lost when several queue up back to back.
//! - Host bindings exchange JSON with the guest. Projected objects keep
//!   live property semantics: each guest read or write dispatches to the
//!   host object.
//! - Script retrieval (packaged files, HTTP downloads) happens on the
//!   caller's runtime, never on the engine thread.
//!
//! # Example
//!
//! ```rust,no_run
//! use jsbridge::{BridgeConfig, InitOptions, JsHost};
//!
//! # async fn example() -> jsbridge::Result<()> {
//! let host = JsHost::new(BridgeConfig::default());
//! host.initialize(InitOptions::default()).await?;
//!
//! let result = host.run("6 * 7").await?;
//! assert_eq!(result, "42");
//! # Ok(())
//! # }
//! ```

mod bindings;
mod bridge;
mod builtins;
mod config;
mod debug;
mod error;
mod loader;
mod session;
mod source;

pub use bindings::{
    tracing_sink, ConsoleLevel, ConsoleSink, HostBindings, HostObject, NativeCallback,
};
pub use config::BridgeConfig;
pub use debug::{AttachInfo, Debugger, TracingDebugger};
pub use error::{
    BridgeError, ExtractionStep, LoadError, ProjectionError, Result, ScriptError, SetupError,
};
pub use loader::{DefaultScriptLoader, ScriptLoader};
pub use session::{HostStats, InitOptions};
pub use source::{SourceContextAllocator, SourceContextId};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;

use tokio::sync::oneshot;

use session::{BootstrapScript, EngineSession};

/// Requests handled by the engine worker thread
enum BridgeRequest {
    Initialize {
        options: InitOptions,
        scripts: Vec<BootstrapScript>,
        reply: oneshot::Sender<Result<(), SetupError>>,
    },
    Run {
        source: String,
        label: Option<String>,
        reply: oneshot::Sender<Result<String, ScriptError>>,
    },
    DefineFunction {
        name: String,
        callback: NativeCallback,
        reply: oneshot::Sender<Result<()>>,
    },
    DefineObject {
        name: String,
        object: Box<dyn HostObject>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<HostStats>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Async handle to an engine worker thread.
///
/// Cheap to clone; clones share the same engine. The worker stops when
/// [`close`](JsHost::close) is called or when every handle is dropped.
#[derive(Clone)]
pub struct JsHost {
    sender: mpsc::Sender<BridgeRequest>,
    loader: Arc<dyn ScriptLoader>,
    config: BridgeConfig,
}

impl JsHost {
    /// Spawn an engine worker using the default loader built from `config`
    pub fn new(config: BridgeConfig) -> Self {
        let loader: Arc<dyn ScriptLoader> = Arc::new(DefaultScriptLoader::new(&config));
        Self::with_loader(config, loader)
    }

    /// Spawn an engine worker with a custom script loader
    pub fn with_loader(config: BridgeConfig, loader: Arc<dyn ScriptLoader>) -> Self {
        let (sender, receiver) = mpsc::channel();
        let worker_config = config.clone();
        thread::Builder::new()
            .name("js-engine".to_string())
            .spawn(move || worker_loop(worker_config, receiver))
            .expect("failed to spawn engine worker thread");
        Self {
            sender,
            loader,
            config,
        }
    }

    /// Bring up the engine session: runtime, context, hooks, bindings,
    /// bootstrap scripts from the configured list, then the debugger
    /// attach.
    ///
    /// Bootstrap script text is resolved through the loader before the
    /// engine sees any of it, so retrieval failures surface without
    /// touching engine state and initialization can be retried.
    pub async fn initialize(&self, options: InitOptions) -> Result<()> {
        let mut scripts = Vec::with_capacity(self.config.bootstrap.len());
        for name in &self.config.bootstrap {
            let text = self.loader.read_packaged(name).await.map_err(|error| {
                BridgeError::Setup(SetupError::ScriptReference {
                    name: name.clone(),
                    detail: error.to_string(),
                })
            })?;
            scripts.push(BootstrapScript {
                name: name.clone(),
                text,
            });
        }
        self.request(|reply| BridgeRequest::Initialize {
            options,
            scripts,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Execute script text and return its completion value rendered as text
    pub async fn run(&self, source: &str) -> Result<String> {
        let source = source.to_string();
        let result = self
            .request(|reply| BridgeRequest::Run {
                source,
                label: None,
                reply,
            })
            .await??;
        Ok(result)
    }

    /// Load a packaged script by name and run it
    pub async fn add_script_reference(&self, name: &str) -> Result<String> {
        let source = self.loader.read_packaged(name).await?;
        let label = Some(name.to_string());
        let result = self
            .request(|reply| BridgeRequest::Run {
                source,
                label,
                reply,
            })
            .await??;
        Ok(result)
    }

    /// Download a script from a URL and run it
    pub async fn add_script_http_reference(&self, url: &str) -> Result<String> {
        let source = self.loader.download(url).await?;
        let label = Some(url.to_string());
        let result = self
            .request(|reply| BridgeRequest::Run {
                source,
                label,
                reply,
            })
            .await??;
        Ok(result)
    }

    /// Install a native function binding on the live engine
    pub async fn define_function(
        &self,
        name: &str,
        callback: impl FnMut(&[serde_json::Value]) -> Result<serde_json::Value, String>
            + Send
            + 'static,
    ) -> Result<()> {
        let name = name.to_string();
        let callback: NativeCallback = Box::new(callback);
        self.request(|reply| BridgeRequest::DefineFunction {
            name,
            callback,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Project a host object binding on the live engine
    pub async fn define_object(
        &self,
        name: &str,
        object: impl HostObject + 'static,
    ) -> Result<()> {
        let name = name.to_string();
        let object: Box<dyn HostObject> = Box::new(object);
        self.request(|reply| BridgeRequest::DefineObject {
            name,
            object,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Counters for the live session (all zeros before initialization)
    pub async fn stats(&self) -> Result<HostStats> {
        self.request(|reply| BridgeRequest::Stats { reply }).await
    }

    /// Stop the engine worker. Later calls on any clone fail with a worker
    /// error.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| BridgeRequest::Close { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> BridgeRequest,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .map_err(|_| BridgeError::Worker("engine worker is gone".to_string()))?;
        response
            .await
            .map_err(|_| BridgeError::Worker("engine worker dropped the request".to_string()))
    }
}

fn worker_loop(config: BridgeConfig, requests: mpsc::Receiver<BridgeRequest>) {
    let mut session: Option<EngineSession> = None;

    while let Ok(request) = requests.recv() {
        match request {
            BridgeRequest::Initialize {
                options,
                scripts,
                reply,
            } => {
                let result = if session.is_some() {
                    Err(SetupError::AlreadyInitialized)
                } else {
                    match catch_unwind(AssertUnwindSafe(|| {
                        EngineSession::open(&config, options, scripts)
                    })) {
                        Ok(Ok(opened)) => {
                            session = Some(opened);
                            Ok(())
                        }
                        Ok(Err(error)) => Err(error),
                        Err(panic) => Err(SetupError::Internal(panic_message(panic))),
                    }
                };
                let _ = reply.send(result);
            }
            BridgeRequest::Run {
                source,
                label,
                reply,
            } => {
                let result = match session.as_mut() {
                    None => Err(ScriptError::NoActiveContext),
                    Some(live) => {
                        if let Some(name) = &label {
                            tracing::debug!(name = %name, "running script reference");
                        }
                        match catch_unwind(AssertUnwindSafe(|| live.run(&source))) {
                            Ok(result) => result,
                            Err(panic) => Err(ScriptError::internal(panic_message(panic))),
                        }
                    }
                };
                let _ = reply.send(result);
            }
            BridgeRequest::DefineFunction {
                name,
                callback,
                reply,
            } => {
                let result = match session.as_mut() {
                    None => Err(BridgeError::Script(ScriptError::NoActiveContext)),
                    Some(live) => live
                        .define_function(&name, callback)
                        .map_err(BridgeError::from),
                };
                let _ = reply.send(result);
            }
            BridgeRequest::DefineObject {
                name,
                object,
                reply,
            } => {
                let result = match session.as_mut() {
                    None => Err(BridgeError::Script(ScriptError::NoActiveContext)),
                    Some(live) => live
                        .define_object(&name, object)
                        .map_err(BridgeError::from),
                };
                let _ = reply.send(result);
            }
            BridgeRequest::Stats { reply } => {
                let stats = session.as_ref().map(EngineSession::stats).unwrap_or_default();
                let _ = reply.send(stats);
            }
            BridgeRequest::Close { reply } => {
                session = None;
                let _ = reply.send(());
                break;
            }
        }
    }

    tracing::debug!("engine worker stopped");
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "engine worker panicked".to_string()
    }
}
