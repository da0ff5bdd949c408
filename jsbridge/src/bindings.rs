//! Host bindings: native functions and projected objects
//!
//! Bindings are declared on [`HostBindings`] before initialization and
//! installed in insertion order, or added later through the host handle.
//! Values cross the boundary as JSON; host-side failures surface in the
//! guest as thrown exceptions carrying the failure message.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use rquickjs::function::{Func, Rest};
use rquickjs::{Ctx, Function, Value};

use crate::bridge::{js_to_json, json_to_js, throw_host_error};
use crate::builtins::PROJECT_FN;
use crate::error::ProjectionError;

/// Signature for host functions callable from the guest.
///
/// Arguments arrive JSON-marshaled and the return value travels back the
/// same way. Returning `Err` raises the message as a guest exception.
pub type NativeCallback =
    Box<dyn FnMut(&[serde_json::Value]) -> Result<serde_json::Value, String> + Send>;

/// Severity of a guest console emission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    pub(crate) fn method_name(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        }
    }
}

/// Destination for guest console output
pub type ConsoleSink = Arc<dyn Fn(ConsoleLevel, &str) + Send + Sync>;

/// Console sink that forwards guest output to `tracing`
pub fn tracing_sink() -> ConsoleSink {
    Arc::new(|level, message| match level {
        ConsoleLevel::Error => tracing::error!(target: "jsbridge::guest", "{message}"),
        ConsoleLevel::Warn => tracing::warn!(target: "jsbridge::guest", "{message}"),
        ConsoleLevel::Debug => tracing::debug!(target: "jsbridge::guest", "{message}"),
        ConsoleLevel::Log | ConsoleLevel::Info => {
            tracing::info!(target: "jsbridge::guest", "{message}")
        }
    })
}

/// Host object projected into the guest scope.
///
/// Declared properties get live semantics: every guest read calls [`get`]
/// and every guest write calls [`set`], so host-side state changes are
/// visible without re-projection. Declared methods dispatch to [`invoke`].
///
/// [`get`]: HostObject::get
/// [`set`]: HostObject::set
pub trait HostObject: Send {
    /// Property names exposed with live get/set semantics
    fn properties(&self) -> Vec<String> {
        Vec::new()
    }

    /// Method names exposed as callable members
    fn methods(&self) -> Vec<String> {
        Vec::new()
    }

    /// Read a property. Called on every guest access.
    fn get(&mut self, property: &str) -> Result<serde_json::Value, String> {
        Err(format!("unknown property '{property}'"))
    }

    /// Write a property. Returning `Err` makes the guest assignment throw.
    fn set(&mut self, property: &str, _value: serde_json::Value) -> Result<(), String> {
        Err(format!("unknown property '{property}'"))
    }

    /// Invoke a method with JSON-marshaled arguments
    fn invoke(
        &mut self,
        method: &str,
        _args: &[serde_json::Value],
    ) -> Result<serde_json::Value, String> {
        Err(format!("unknown method '{method}'"))
    }
}

pub(crate) enum BindingEntry {
    Function { name: String, callback: NativeCallback },
    Object { name: String, object: Box<dyn HostObject> },
}

/// Host bindings to install during initialization, in insertion order.
pub struct HostBindings {
    pub(crate) entries: Vec<BindingEntry>,
    pub(crate) console: ConsoleSink,
}

impl HostBindings {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            console: tracing_sink(),
        }
    }

    /// Add a native function reachable as a global
    pub fn function(
        mut self,
        name: impl Into<String>,
        callback: impl FnMut(&[serde_json::Value]) -> Result<serde_json::Value, String>
            + Send
            + 'static,
    ) -> Self {
        self.entries.push(BindingEntry::Function {
            name: name.into(),
            callback: Box::new(callback),
        });
        self
    }

    /// Add a projected host object reachable as a global
    pub fn object(mut self, name: impl Into<String>, object: impl HostObject + 'static) -> Self {
        self.entries.push(BindingEntry::Object {
            name: name.into(),
            object: Box::new(object),
        });
        self
    }

    /// Replace the console sink (defaults to forwarding into `tracing`)
    pub fn console_sink(
        mut self,
        sink: impl Fn(ConsoleLevel, &str) + Send + Sync + 'static,
    ) -> Self {
        self.console = Arc::new(sink);
        self
    }
}

impl Default for HostBindings {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns projected host objects; guest dispatch reaches them by table index.
#[derive(Default)]
pub(crate) struct ObjectTable {
    objects: Vec<Box<dyn HostObject>>,
}

impl ObjectTable {
    pub(crate) fn insert(&mut self, object: Box<dyn HostObject>) -> u32 {
        let id = self.objects.len() as u32;
        self.objects.push(object);
        id
    }

    fn entry(&mut self, id: u32) -> Result<&mut Box<dyn HostObject>, String> {
        self.objects
            .get_mut(id as usize)
            .ok_or_else(|| format!("unknown host object {id}"))
    }

    pub(crate) fn get(&mut self, id: u32, property: &str) -> Result<serde_json::Value, String> {
        self.entry(id)?.get(property)
    }

    pub(crate) fn set(
        &mut self,
        id: u32,
        property: &str,
        value: serde_json::Value,
    ) -> Result<(), String> {
        self.entry(id)?.set(property, value)
    }

    pub(crate) fn invoke(
        &mut self,
        id: u32,
        method: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, String> {
        self.entry(id)?.invoke(method, args)
    }
}

/// Binding names become global identifiers; restrict to ASCII identifier shape
pub(crate) fn validate_binding_name(name: &str) -> Result<(), ProjectionError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid_start && valid_rest {
        Ok(())
    } else {
        Err(ProjectionError::InvalidName(name.to_string()))
    }
}

/// Install a native function under `name` in the global scope
pub(crate) fn install_function<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    callback: NativeCallback,
) -> Result<(), ProjectionError> {
    validate_binding_name(name)?;
    let callback = RefCell::new(callback);
    let func = Func::from(
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let mut json_args = Vec::with_capacity(args.0.len());
            for value in args.0 {
                match js_to_json(&ctx, value) {
                    Ok(json) => json_args.push(json),
                    Err(error) => return Err(throw_host_error(&ctx, error.to_string())),
                }
            }
            let result = match (callback.borrow_mut())(&json_args) {
                Ok(result) => result,
                Err(message) => return Err(throw_host_error(&ctx, message)),
            };
            match json_to_js(&ctx, &result) {
                Ok(value) => Ok(value),
                Err(error) => Err(throw_host_error(&ctx, error.to_string())),
            }
        },
    );
    ctx.globals().set(name, func).map_err(|e| install_error(name, e))
}

/// Project a host object under `name` in the global scope.
///
/// The guest-side shape is built by the dispatch glue: declared methods
/// become forwarding functions and declared properties resolve through the
/// live dispatch hooks on every access.
pub(crate) fn project_object(
    ctx: &Ctx<'_>,
    table: &Rc<RefCell<ObjectTable>>,
    name: &str,
    object: Box<dyn HostObject>,
) -> Result<(), ProjectionError> {
    validate_binding_name(name)?;
    let properties = object.properties();
    let methods = object.methods();

    let mut seen = HashSet::new();
    for member in properties.iter().chain(methods.iter()) {
        if validate_binding_name(member).is_err() {
            return Err(ProjectionError::Unrepresentable {
                name: member.clone(),
                reason: "member name is not a valid identifier".to_string(),
            });
        }
        if !seen.insert(member.as_str()) {
            return Err(ProjectionError::Unrepresentable {
                name: member.clone(),
                reason: "member name is declared twice".to_string(),
            });
        }
    }

    let object_id = table.borrow_mut().insert(object);
    let shape = serde_json::json!({ "properties": properties, "methods": methods });
    let shape_value = json_to_js(ctx, &shape)?;
    let project: Function = ctx
        .globals()
        .get(PROJECT_FN)
        .map_err(|e| install_error(name, e))?;
    let proxy: Value = project
        .call((object_id, shape_value))
        .map_err(|e| install_error(name, e))?;
    ctx.globals().set(name, proxy).map_err(|e| install_error(name, e))
}

fn install_error(name: &str, error: rquickjs::Error) -> ProjectionError {
    ProjectionError::Install {
        name: name.to_string(),
        detail: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn with_ctx<T>(f: impl for<'js> FnOnce(&Ctx<'js>) -> T) -> T {
        let runtime = Runtime::new().expect("runtime");
        let context = Context::full(&runtime).expect("context");
        context.with(|ctx| f(&ctx))
    }

    #[test]
    fn test_binding_names_must_be_identifiers() {
        assert!(validate_binding_name("peopleManager").is_ok());
        assert!(validate_binding_name("_private").is_ok());
        assert!(validate_binding_name("$jquery").is_ok());
        assert!(validate_binding_name("v2").is_ok());
        assert!(validate_binding_name("").is_err());
        assert!(validate_binding_name("2fast").is_err());
        assert!(validate_binding_name("not valid").is_err());
        assert!(validate_binding_name("dash-ed").is_err());
    }

    #[test]
    fn test_native_function_round_trips_json() {
        with_ctx(|ctx| {
            install_function(
                ctx,
                "double",
                Box::new(|args| {
                    let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
                    Ok(serde_json::json!(n * 2))
                }),
            )
            .expect("install");
            let result: i64 = ctx.eval("double(21)".as_bytes()).expect("eval");
            assert_eq!(result, 42);
        });
    }

    #[test]
    fn test_native_function_error_becomes_guest_exception() {
        with_ctx(|ctx| {
            install_function(ctx, "explode", Box::new(|_| Err("no fuel".to_string())))
                .expect("install");
            let caught: String = ctx
                .eval("(function () { try { explode(); } catch (e) { return String(e); } })()".as_bytes())
                .expect("eval");
            assert_eq!(caught, "no fuel");
        });
    }

    #[test]
    fn test_native_function_called_once_with_no_arguments() {
        use std::sync::{Arc, Mutex};

        with_ctx(|ctx| {
            let calls: Arc<Mutex<Vec<usize>>> = Arc::default();
            let recorded = calls.clone();
            install_function(
                ctx,
                "ping",
                Box::new(move |args| {
                    recorded.lock().unwrap().push(args.len());
                    Ok(serde_json::Value::Null)
                }),
            )
            .expect("install");
            ctx.eval::<(), _>("ping()".as_bytes()).expect("eval");
            assert_eq!(calls.lock().unwrap().as_slice(), &[0]);
        });
    }

    #[test]
    fn test_redefining_a_binding_overwrites_it() {
        with_ctx(|ctx| {
            install_function(ctx, "answer", Box::new(|_| Ok(serde_json::json!("old"))))
                .expect("install");
            install_function(ctx, "answer", Box::new(|_| Ok(serde_json::json!("new"))))
                .expect("reinstall");
            let result: String = ctx.eval("answer()".as_bytes()).expect("eval");
            assert_eq!(result, "new");
        });
    }

    #[test]
    fn test_invalid_function_name_is_rejected() {
        with_ctx(|ctx| {
            let error = install_function(ctx, "bad name", Box::new(|_| Ok(serde_json::Value::Null)))
                .expect_err("should reject");
            assert!(matches!(error, ProjectionError::InvalidName(_)));
        });
    }

    #[test]
    fn test_object_table_dispatches_by_id() {
        struct Counter {
            count: i64,
        }

        impl HostObject for Counter {
            fn properties(&self) -> Vec<String> {
                vec!["count".to_string()]
            }

            fn methods(&self) -> Vec<String> {
                vec!["increment".to_string()]
            }

            fn get(&mut self, property: &str) -> Result<serde_json::Value, String> {
                match property {
                    "count" => Ok(serde_json::json!(self.count)),
                    other => Err(format!("unknown property '{other}'")),
                }
            }

            fn invoke(
                &mut self,
                method: &str,
                _args: &[serde_json::Value],
            ) -> Result<serde_json::Value, String> {
                match method {
                    "increment" => {
                        self.count += 1;
                        Ok(serde_json::json!(self.count))
                    }
                    other => Err(format!("unknown method '{other}'")),
                }
            }
        }

        let mut table = ObjectTable::default();
        let id = table.insert(Box::new(Counter { count: 0 }));
        assert_eq!(table.invoke(id, "increment", &[]), Ok(serde_json::json!(1)));
        assert_eq!(table.get(id, "count"), Ok(serde_json::json!(1)));
        assert!(table.get(id, "missing").is_err());
        assert!(table.get(id + 1, "count").is_err());
        assert!(table
            .set(id, "count", serde_json::json!(5))
            .is_err());
    }
}
