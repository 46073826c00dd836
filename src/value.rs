//! Stored value representation and read-time coercion.
//!
//! Every scope stores opaque `serde_json::Value`s. Typed access goes through
//! [`State`](crate::State) and [`Signal`](crate::Signal) handles, which decode
//! the stored value into the type fixed at declaration time. Values that
//! arrive from the client may not match that type exactly (a number typed
//! into a text input arrives as a string, a JS number arrives as `42.0`), so
//! decoding tries a small set of compatible representations before giving up
//! and returning the declared initial value.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Number, Value};

/// Types that can be held in a scope.
///
/// Blanket-implemented for anything that round-trips through `serde` and can
/// be shared across threads.
pub trait StoreValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Encode a typed value into its stored form.
///
/// # Errors
///
/// Returns `serde_json::Error` if `T`'s `Serialize` impl fails (for example
/// a map with non-string keys).
pub(crate) fn encode<T: StoreValue>(value: &T) -> serde_json::Result<Value> {
    serde_json::to_value(value)
}

/// Decode a stored value into `T`, coercing compatible representations.
///
/// Tries the raw value first, then each alternative produced by
/// [`alternatives`]. If none decode, logs a warning and returns a clone of
/// `initial`. Never fails.
///
/// # Arguments
///
/// * `key` - Declaration id, used only for the log line.
/// * `raw` - The stored value.
/// * `initial` - Declared initial value, returned on incompatible input.
pub(crate) fn coerce<T: StoreValue>(key: &str, raw: &Value, initial: &T) -> T {
    if let Ok(value) = T::deserialize(raw) {
        return value;
    }
    for alt in alternatives(raw) {
        if let Ok(value) = T::deserialize(&alt) {
            return value;
        }
    }
    tracing::warn!(
        key,
        value = %raw,
        "stored value does not fit declared type, using initial value"
    );
    initial.clone()
}

/// Representations a raw value may legitimately stand for.
///
/// Ordered from most to least specific so that `"42"` becomes an integer
/// before it becomes a float.
fn alternatives(raw: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    match raw {
        Value::String(s) => {
            let s = s.trim();
            match s {
                "true" => out.push(Value::Bool(true)),
                "false" => out.push(Value::Bool(false)),
                _ => {}
            }
            if let Ok(n) = s.parse::<i64>() {
                out.push(Value::from(n));
            } else if let Ok(n) = s.parse::<u64>() {
                out.push(Value::from(n));
            } else if let Ok(f) = s.parse::<f64>()
                && let Some(n) = Number::from_f64(f)
            {
                out.extend(integral(f));
                out.push(Value::Number(n));
            }
        }
        Value::Number(n) => {
            if n.is_f64()
                && let Some(f) = n.as_f64()
            {
                out.extend(integral(f));
            }
            out.push(Value::String(n.to_string()));
        }
        Value::Bool(b) => out.push(Value::String(b.to_string())),
        _ => {}
    }
    out
}

/// The integer form of `f`, if it has no fractional part and fits an `i64`.
/// `i64::MAX as f64` rounds up to 2^63, which does not fit.
fn integral(f: f64) -> Option<Value> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}
