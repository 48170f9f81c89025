//! JSON conversion for host values.
//!
//! Follows the host's `JSON.stringify` conventions: functions and
//! `undefined` are skipped inside objects and become `null` inside arrays,
//! non-finite numbers become `null`, and a cyclic structure throws a
//! `TypeError`. Byte arrays serialize as arrays of numbers.

use serde_json::{Map, Number, Value};

use crate::error::CallError;
use crate::types::HostValue;

/// Convert `value` to JSON.
pub fn to_json(value: &HostValue) -> Result<Value, CallError> {
    let mut path = Vec::new();
    Ok(convert(value, &mut path)?.unwrap_or(Value::Null))
}

/// Serialize `value` to compact JSON text.
pub fn stringify(value: &HostValue) -> Result<String, CallError> {
    Ok(to_json(value)?.to_string())
}

/// Parse JSON text into a host value, throwing a `SyntaxError` on bad input.
pub fn parse(text: &str) -> Result<HostValue, CallError> {
    let json: Value = serde_json::from_str(text)
        .map_err(|e| CallError::Thrown(HostValue::error("SyntaxError", e.to_string())))?;
    Ok(from_json(&json))
}

/// Convert parsed JSON into host values.
pub fn from_json(json: &Value) -> HostValue {
    match json {
        Value::Null => HostValue::Null,
        Value::Bool(b) => HostValue::Bool(*b),
        Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => HostValue::string(s),
        Value::Array(items) => HostValue::array(items.iter().map(from_json).collect()),
        Value::Object(map) => {
            let obj = HostValue::object();
            if let HostValue::Object(props) = &obj {
                for (k, v) in map {
                    props.set(k, from_json(v));
                }
            }
            obj
        }
    }
}

/// `None` means "omit": the value has no JSON representation.
fn convert(value: &HostValue, path: &mut Vec<usize>) -> Result<Option<Value>, CallError> {
    let json = match value {
        HostValue::Undefined | HostValue::Function(_) => return Ok(None),
        HostValue::Null => Value::Null,
        HostValue::Bool(b) => Value::Bool(*b),
        HostValue::Number(n) => number(*n),
        HostValue::String(s) => Value::String(s.to_string()),
        HostValue::Bytes(bytes) => {
            Value::Array(bytes.to_vec().into_iter().map(Value::from).collect())
        }
        HostValue::Error(_) | HostValue::Promise(_) => Value::Object(Map::new()),
        HostValue::Array(arr) => {
            enter(path, arr.addr())?;
            let mut items = Vec::with_capacity(arr.len());
            for item in arr.to_vec() {
                items.push(convert(&item, path)?.unwrap_or(Value::Null));
            }
            path.pop();
            Value::Array(items)
        }
        HostValue::Object(obj) => {
            enter(path, obj.addr())?;
            let mut map = Map::new();
            for (key, item) in obj.entries() {
                if let Some(v) = convert(&item, path)? {
                    map.insert(key, v);
                }
            }
            path.pop();
            Value::Object(map)
        }
    };
    Ok(Some(json))
}

fn enter(path: &mut Vec<usize>, addr: usize) -> Result<(), CallError> {
    if path.contains(&addr) {
        return Err(CallError::type_error("converting circular structure to JSON"));
    }
    path.push(addr);
    Ok(())
}

fn number(n: f64) -> Value {
    if n.is_finite() && n == n.trunc() && n.abs() < 9.007_199_254_740_992e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}
