//! Built-in guest surface: timers, dispatch glue, console, and window
//!
//! The glue prelude keeps all callbacks on the guest side of the boundary.
//! The host never holds a reference to a guest function; timers live in a
//! guest-side map and the host fires them by id, and projected objects
//! resolve through numbered dispatch hooks.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;

use rquickjs::function::{Func, Rest};
use rquickjs::{Coerced, Ctx, Object, Value};

use crate::bindings::{ConsoleLevel, ConsoleSink, ObjectTable};
use crate::bridge::{js_to_json, json_to_js, throw_host_error};

/// Guest global that turns a host object id and shape into a proxy
pub(crate) const PROJECT_FN: &str = "__jsbridge_project";

/// Guest global the drain loop calls to run one deferred callback
pub(crate) const FIRE_FN: &str = "__jsbridge_fire";

/// Guest global that parks a completion value while continuations drain
pub(crate) const STASH_FN: &str = "__jsbridge_stash";

/// Guest global that returns the parked completion value and clears it
pub(crate) const TAKE_FN: &str = "__jsbridge_take";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DeferredEntry {
    delay_ms: u64,
    seq: u64,
    id: u32,
}

/// Pending deferred callbacks, ordered by requested delay then scheduling
/// order.
///
/// The bridge runs without a timer wheel; delays establish relative order
/// within a drain rather than wall-clock waits. Every scheduled callback
/// keeps its own entry, none are lost when several are registered before
/// the drain runs.
#[derive(Debug, Default)]
pub(crate) struct DeferredQueue {
    heap: BinaryHeap<Reverse<DeferredEntry>>,
    live: HashSet<u32>,
    next_id: u32,
    next_seq: u64,
}

impl DeferredQueue {
    /// Register a callback id and return it. Ids are unique per session.
    pub(crate) fn schedule(&mut self, delay_ms: u64) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(id);
        self.heap.push(Reverse(DeferredEntry { delay_ms, seq, id }));
        id
    }

    pub(crate) fn cancel(&mut self, id: u32) {
        self.live.remove(&id);
    }

    /// Pop the next live entry, discarding cancelled ones
    pub(crate) fn pop_due(&mut self) -> Option<u32> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            if self.live.remove(&entry.id) {
                return Some(entry.id);
            }
        }
        None
    }
}

const GLUE_PRELUDE: &str = r#"
(function () {
    "use strict";
    var timers = new Map();
    var resultSlot;

    globalThis.__jsbridge_stash = function (value) {
        resultSlot = value;
    };

    globalThis.__jsbridge_take = function () {
        var value = resultSlot;
        resultSlot = undefined;
        return value;
    };

    globalThis.setTimeout = function (callback, delay) {
        if (typeof callback !== "function") {
            throw new TypeError("setTimeout callback must be a function");
        }
        var args = Array.prototype.slice.call(arguments, 2);
        var id = __jsbridge_schedule(Number(delay) || 0);
        timers.set(id, function () { callback.apply(undefined, args); });
        return id;
    };

    globalThis.clearTimeout = function (id) {
        if (typeof id === "number") {
            timers.delete(id);
            __jsbridge_cancel(id);
        }
    };

    globalThis.__jsbridge_fire = function (id) {
        var entry = timers.get(id);
        if (entry !== undefined) {
            timers.delete(id);
            entry();
        }
    };

    globalThis.__jsbridge_project = function (objectId, shape) {
        var target = {};
        shape.methods.forEach(function (method) {
            target[method] = function () {
                return __jsbridge_invoke(objectId, method, Array.prototype.slice.call(arguments));
            };
        });
        var properties = shape.properties;
        return new Proxy(target, {
            get: function (t, key, receiver) {
                if (typeof key === "string" && properties.indexOf(key) !== -1) {
                    return __jsbridge_get(objectId, key);
                }
                return Reflect.get(t, key, receiver);
            },
            set: function (t, key, value) {
                if (typeof key === "string" && properties.indexOf(key) !== -1) {
                    __jsbridge_set(objectId, key, value);
                    return true;
                }
                return Reflect.set(t, key, value);
            },
            has: function (t, key) {
                return (typeof key === "string" && properties.indexOf(key) !== -1) || Reflect.has(t, key);
            },
            ownKeys: function (t) {
                return Reflect.ownKeys(t).concat(properties);
            },
            getOwnPropertyDescriptor: function (t, key) {
                if (typeof key === "string" && properties.indexOf(key) !== -1) {
                    return { enumerable: true, configurable: true, writable: true, value: __jsbridge_get(objectId, key) };
                }
                return Reflect.getOwnPropertyDescriptor(t, key);
            }
        });
    };
})();
"#;

/// Install the native dispatch hooks and evaluate the glue prelude.
///
/// Must run before any bindings are projected and before guest code that
/// uses `setTimeout`.
pub(crate) fn install_hooks<'js>(
    ctx: &Ctx<'js>,
    deferred: Rc<RefCell<DeferredQueue>>,
    objects: Rc<RefCell<ObjectTable>>,
) -> rquickjs::Result<()> {
    let schedule_queue = deferred.clone();
    let schedule = Func::from(move |delay: f64| -> u32 {
        let delay_ms = if delay.is_finite() && delay > 0.0 {
            delay as u64
        } else {
            0
        };
        schedule_queue.borrow_mut().schedule(delay_ms)
    });
    ctx.globals().set("__jsbridge_schedule", schedule)?;

    let cancel_queue = deferred;
    let cancel = Func::from(move |id: u32| {
        cancel_queue.borrow_mut().cancel(id);
    });
    ctx.globals().set("__jsbridge_cancel", cancel)?;

    let get_table = objects.clone();
    let get = Func::from(
        move |ctx: Ctx<'js>, object_id: u32, property: String| -> rquickjs::Result<Value<'js>> {
            let result = get_table
                .borrow_mut()
                .get(object_id, &property)
                .map_err(|message| throw_host_error(&ctx, message))?;
            json_to_js(&ctx, &result).map_err(|error| throw_host_error(&ctx, error.to_string()))
        },
    );
    ctx.globals().set("__jsbridge_get", get)?;

    let set_table = objects.clone();
    let set = Func::from(
        move |ctx: Ctx<'js>, object_id: u32, property: String, value: Value<'js>| -> rquickjs::Result<()> {
            let json =
                js_to_json(&ctx, value).map_err(|error| throw_host_error(&ctx, error.to_string()))?;
            set_table
                .borrow_mut()
                .set(object_id, &property, json)
                .map_err(|message| throw_host_error(&ctx, message))
        },
    );
    ctx.globals().set("__jsbridge_set", set)?;

    let invoke_table = objects;
    let invoke = Func::from(
        move |ctx: Ctx<'js>, object_id: u32, method: String, args: Value<'js>| -> rquickjs::Result<Value<'js>> {
            let json_args = match js_to_json(&ctx, args) {
                Ok(serde_json::Value::Array(items)) => items,
                Ok(other) => vec![other],
                Err(error) => return Err(throw_host_error(&ctx, error.to_string())),
            };
            let result = invoke_table
                .borrow_mut()
                .invoke(object_id, &method, &json_args)
                .map_err(|message| throw_host_error(&ctx, message))?;
            json_to_js(&ctx, &result).map_err(|error| throw_host_error(&ctx, error.to_string()))
        },
    );
    ctx.globals().set("__jsbridge_invoke", invoke)?;

    ctx.eval::<(), _>(GLUE_PRELUDE.as_bytes())
}

/// Install the `console` global, routing each level through the sink
pub(crate) fn install_console(ctx: &Ctx<'_>, sink: ConsoleSink) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    for level in [
        ConsoleLevel::Log,
        ConsoleLevel::Info,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
        ConsoleLevel::Debug,
    ] {
        let sink = sink.clone();
        let method = Func::from(move |args: Rest<Coerced<String>>| {
            let message = args
                .0
                .into_iter()
                .map(|Coerced(text)| text)
                .collect::<Vec<_>>()
                .join(" ");
            (*sink)(level, &message);
        });
        console.set(level.method_name(), method)?;
    }
    ctx.globals().set("console", console)
}

/// Install the `window` global with an `alert` routed through the sink
pub(crate) fn install_window(ctx: &Ctx<'_>, sink: ConsoleSink) -> rquickjs::Result<()> {
    let window = Object::new(ctx.clone())?;
    let alert = Func::from(move |message: Coerced<String>| {
        (*sink)(ConsoleLevel::Warn, &message.0);
    });
    window.set("alert", alert)?;
    ctx.globals().set("window", window)
}
