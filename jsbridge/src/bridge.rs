//! Value marshaling and exception extraction at the host/guest boundary
//!
//! Host callbacks and projected objects exchange `serde_json::Value` with
//! the guest; conversions route through the engine's own JSON builtins so
//! guest semantics (key ordering, number formatting) stay authoritative.

use rquickjs::{Coerced, Ctx, Exception, FromJs, IntoJs, Value};

use crate::error::{ExtractionStep, ProjectionError, ScriptError};

/// Convert a `serde_json::Value` to a guest value
pub(crate) fn json_to_js<'js>(
    ctx: &Ctx<'js>,
    json: &serde_json::Value,
) -> Result<Value<'js>, ProjectionError> {
    let json_str = serde_json::to_string(json)
        .map_err(|e| ProjectionError::marshal(format!("failed to serialize JSON: {e}")))?;
    ctx.json_parse(json_str)
        .map_err(|e| ProjectionError::marshal(format!("failed to parse JSON in guest: {e}")))
}

/// Convert a guest value to a `serde_json::Value`.
///
/// `undefined` and functions have no JSON representation and collapse to
/// `Null`, matching what the guest's own `JSON.stringify` would drop.
pub(crate) fn js_to_json<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> Result<serde_json::Value, ProjectionError> {
    if value.is_undefined() || value.is_null() || value.is_function() {
        return Ok(serde_json::Value::Null);
    }

    match ctx.json_stringify(value) {
        Ok(Some(js_string)) => {
            let json_str: String = js_string.to_string().map_err(|e| {
                ProjectionError::marshal(format!("failed to read stringified value: {e}"))
            })?;
            serde_json::from_str(&json_str)
                .map_err(|e| ProjectionError::marshal(format!("failed to parse guest JSON: {e}")))
        }
        Ok(None) => Ok(serde_json::Value::Null),
        Err(e) => Err(ProjectionError::marshal(format!(
            "failed to stringify guest value: {e}"
        ))),
    }
}

/// Render a completed script's result value as text, using the guest's own
/// string coercion
pub(crate) fn coerce_to_string<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
) -> Result<String, ScriptError> {
    match Coerced::<String>::from_js(ctx, value) {
        Ok(Coerced(text)) => Ok(text),
        Err(error) => Err(ScriptError::ResultConversion(error.to_string())),
    }
}

/// Map an eval failure to a script error.
///
/// `Error::Exception` means the guest raised and the exception is pending in
/// the context; anything else is a host-side engine failure.
pub(crate) fn failure_from_eval(ctx: &Ctx<'_>, error: rquickjs::Error) -> ScriptError {
    match error {
        rquickjs::Error::Exception => exception_to_error(ctx),
        other => ScriptError::internal(other.to_string()),
    }
}

/// Retrieve and describe the pending exception.
///
/// Three steps, each with its own failure diagnostic: retrieve-and-clear the
/// pending value, locate its message, convert the message to text.
pub(crate) fn exception_to_error(ctx: &Ctx<'_>) -> ScriptError {
    let caught = ctx.catch();
    if caught.is_undefined() {
        return ScriptError::Extraction(ExtractionStep::Retrieve);
    }

    if let Ok(obj) = caught.clone().try_into_object() {
        if let Some(exception) = Exception::from_object(obj.clone()) {
            if let Some(stack) = exception.stack() {
                tracing::debug!(%stack, "guest exception stack");
            }
            if let Some(message) = exception.message() {
                return ScriptError::evaluation(message);
            }
        }

        // Plain thrown objects may still carry a message property
        let message: Value = match obj.get("message") {
            Ok(value) => value,
            Err(_) => return ScriptError::Extraction(ExtractionStep::Message),
        };
        if !message.is_undefined() {
            return match Coerced::<String>::from_js(ctx, message) {
                Ok(Coerced(text)) => ScriptError::evaluation(text),
                Err(_) => ScriptError::Extraction(ExtractionStep::Convert),
            };
        }
    }

    match Coerced::<String>::from_js(ctx, caught) {
        Ok(Coerced(text)) => ScriptError::evaluation(text),
        Err(_) => ScriptError::Extraction(ExtractionStep::Convert),
    }
}

/// Raise a host-side failure into the guest as an exception
pub(crate) fn throw_host_error(ctx: &Ctx<'_>, message: String) -> rquickjs::Error {
    match message.into_js(ctx) {
        Ok(value) => ctx.throw(value),
        Err(error) => error,
    }
}
