//! Value marshalling across the guest boundary.
//!
//! Guest → host conversion is eager and deep so results outlive the context
//! they came from. Host → guest literal emission exists solely to bake the
//! event argument into Python/Ruby trampolines; it is not a general data
//! channel.

use crate::engine::GuestValue;
use serde_json::{Map, Number, Value};

/// Converts a guest value into host-native data.
///
/// Conversion order: null, string, boolean, integral, floating, host-value
/// passthrough, array-like, `keys()`/`[]` mapping, member-keyed object
/// (preferring item access), display-string fallback. Maps keep the guest's
/// insertion order.
pub fn to_host(value: &dyn GuestValue) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    if let Some(text) = value.as_str() {
        return Value::String(text);
    }
    if let Some(flag) = value.as_bool() {
        return Value::Bool(flag);
    }
    if let Some(int) = value.as_i64() {
        return Value::Number(Number::from(int));
    }
    if let Some(float) = value.as_f64() {
        return Number::from_f64(float)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(float.to_string()));
    }
    if let Some(host) = value.as_host_value() {
        return host;
    }
    if let Some(elements) = value.array_elements() {
        return Value::Array(elements.iter().map(|e| to_host(e.as_ref())).collect());
    }
    if let Some(keys) = value.mapping_keys() {
        let mut object = Map::new();
        for key in keys {
            let key_text = key
                .as_str()
                .unwrap_or_else(|| key.display());
            let entry = value
                .get_item(&key_text)
                .map(|v| to_host(v.as_ref()))
                .unwrap_or(Value::Null);
            object.insert(key_text, entry);
        }
        return Value::Object(object);
    }
    let members = value.member_keys();
    if !members.is_empty() {
        let mut object = Map::new();
        for name in members {
            let entry = value
                .get_item(&name)
                .or_else(|| value.member(&name))
                .map(|v| to_host(v.as_ref()))
                .unwrap_or(Value::Null);
            object.insert(name, entry);
        }
        return Value::Object(object);
    }
    Value::String(value.display())
}

// =============================================================================
// Literal Emission
// =============================================================================

/// Emits a Python expression evaluating to `value`.
pub fn to_python_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_single(s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(to_python_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(entries) => {
            let inner: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}: {}", quote_single(k), to_python_literal(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

/// Emits a Ruby expression evaluating to `value`.
pub fn to_ruby_literal(value: &Value) -> String {
    match value {
        Value::Null => "nil".to_string(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_single(s),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(to_ruby_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(entries) => {
            let inner: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{} => {}", quote_single(k), to_ruby_literal(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

/// Single-quoted string with `\`, `'`, newline, carriage return, and tab
/// escaped. The escape set is shared by the Python and Ruby grammars.
fn quote_single(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}
