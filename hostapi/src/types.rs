//! Host-side values that guest code can name through handles.
//!
//! `HostValue` is a closed set of variants rather than an untyped container:
//! primitives and strings are held by value, everything else by a
//! single-threaded shared reference. Because the references are `Rc`, a
//! `HostValue` is `!Send`: host objects cannot leak from one guest instance's
//! execution context into another's.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::closure::Callable;
use crate::error::CallError;
use crate::promise::PromiseRef;

/// Maximum nesting depth rendered by [`HostValue::debug_string`].
const MAX_RENDER_DEPTH: usize = 16;

/// A value living on the host side of the boundary.
#[derive(Clone, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Object(ObjectRef),
    Array(ArrayRef),
    Bytes(BytesRef),
    Error(Rc<ErrorValue>),
    Function(Callable),
    Promise(PromiseRef),
}

/// Name and message of a host-side error object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
}

/// Shared reference to a plain object. Properties keep insertion order.
#[derive(Clone, Default)]
pub struct ObjectRef(Rc<RefCell<Vec<(String, HostValue)>>>);

/// Shared reference to an array of host values.
#[derive(Clone, Default)]
pub struct ArrayRef(Rc<RefCell<Vec<HostValue>>>);

/// Shared reference to a host-side byte array.
#[derive(Clone, Default)]
pub struct BytesRef(Rc<RefCell<Vec<u8>>>);

impl HostValue {
    /// Build a string value.
    pub fn string(s: impl AsRef<str>) -> Self {
        Self::String(Rc::from(s.as_ref()))
    }

    /// Build an error value.
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(Rc::new(ErrorValue {
            name: name.into(),
            message: message.into(),
        }))
    }

    /// Build an empty plain object.
    pub fn object() -> Self {
        Self::Object(ObjectRef::default())
    }

    /// Build an array from `items`.
    pub fn array(items: Vec<HostValue>) -> Self {
        Self::Array(ArrayRef(Rc::new(RefCell::new(items))))
    }

    /// Build a byte array from `bytes`.
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Self::Bytes(BytesRef(Rc::new(RefCell::new(bytes))))
    }

    // ── Type tests ──

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// `undefined` or `null`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    /// True for every non-null reference that is not a function.
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            Self::Object(_) | Self::Array(_) | Self::Bytes(_) | Self::Error(_) | Self::Promise(_)
        )
    }

    /// The `typeof`-style name of this value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "object",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Function(_) => "function",
            _ => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Self::Function(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&PromiseRef> {
        match self {
            Self::Promise(p) => Some(p),
            _ => None,
        }
    }

    // ── Property protocol ──

    /// Read property `key`. Reading from `undefined` or `null` throws a
    /// `TypeError`; a missing property reads as `undefined`.
    pub fn get_property(&self, key: &str) -> Result<HostValue, CallError> {
        let value = match self {
            Self::Undefined | Self::Null => {
                return Err(CallError::type_error(format!(
                    "cannot read properties of {} (reading '{key}')",
                    self.debug_string()
                )));
            }
            Self::Object(obj) => obj.get(key).unwrap_or_default(),
            Self::Array(arr) => match key {
                "length" => Self::Number(arr.len() as f64),
                _ => index_of(key)
                    .and_then(|i| arr.get(i))
                    .unwrap_or_default(),
            },
            Self::Bytes(bytes) => match key {
                "length" => Self::Number(bytes.len() as f64),
                _ => index_of(key)
                    .and_then(|i| bytes.get(i))
                    .map(|b| Self::Number(b as f64))
                    .unwrap_or_default(),
            },
            Self::Error(err) => match key {
                "name" => Self::string(&err.name),
                "message" => Self::string(&err.message),
                _ => Self::Undefined,
            },
            Self::String(s) if key == "length" => Self::Number(s.encode_utf16().count() as f64),
            Self::Function(f) if key == "name" => Self::string(f.name()),
            _ => Self::Undefined,
        };
        Ok(value)
    }

    /// Write property `key`. Returns `false` when the target cannot hold
    /// properties (primitives), mirroring a failed reflective set.
    pub fn set_property(&self, key: &str, value: HostValue) -> Result<bool, CallError> {
        match self {
            Self::Undefined | Self::Null => Err(CallError::type_error(format!(
                "cannot set properties of {} (setting '{key}')",
                self.debug_string()
            ))),
            Self::Object(obj) => {
                obj.set(key, value);
                Ok(true)
            }
            Self::Array(arr) => match index_of(key) {
                Some(i) => {
                    arr.set(i, value);
                    Ok(true)
                }
                None => Ok(false),
            },
            Self::Bytes(bytes) => match (index_of(key), value.as_number()) {
                (Some(i), Some(n)) if i < bytes.len() => {
                    bytes.0.borrow_mut()[i] = to_byte(n);
                    Ok(true)
                }
                _ => Ok(false),
            },
            _ => Ok(false),
        }
    }

    /// Test for property `key`. Only objects can be queried; anything else
    /// throws a `TypeError`, as the reflective `has` does.
    pub fn has_property(&self, key: &str) -> Result<bool, CallError> {
        let found = match self {
            Self::Object(obj) => obj.has(key),
            Self::Array(arr) => key == "length" || index_of(key).is_some_and(|i| i < arr.len()),
            Self::Bytes(bytes) => {
                key == "length" || index_of(key).is_some_and(|i| i < bytes.len())
            }
            Self::Error(_) => matches!(key, "name" | "message"),
            Self::Function(_) => key == "name",
            Self::Promise(_) => false,
            _ => {
                return Err(CallError::type_error(format!(
                    "cannot use 'in' operator to search for '{key}' in {}",
                    self.debug_string()
                )));
            }
        };
        Ok(found)
    }

    /// Best-effort human-readable rendering for diagnostics.
    pub fn debug_string(&self) -> String {
        render(self, 0)
    }
}

fn index_of(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    key.parse().ok()
}

/// Byte-array element conversion: truncate, then wrap modulo 256.
/// `NaN` and the infinities store 0.
fn to_byte(n: f64) -> u8 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(256.0) as u8
}

/// Format a number the way the host's own `toString` would for the common
/// cases: integral values without a fraction, `NaN`, and `Infinity`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{n:.0}")
    } else {
        format!("{n}")
    }
}

fn render(value: &HostValue, depth: usize) -> String {
    match value {
        HostValue::Undefined => "undefined".to_string(),
        HostValue::Null => "null".to_string(),
        HostValue::Bool(b) => b.to_string(),
        HostValue::Number(n) => format_number(*n),
        HostValue::String(s) => format!("\"{s}\""),
        HostValue::Function(f) => {
            let name = f.name();
            if name.is_empty() {
                "Function".to_string()
            } else {
                format!("Function({name})")
            }
        }
        HostValue::Array(arr) => {
            if depth >= MAX_RENDER_DEPTH {
                return "[...]".to_string();
            }
            let items: Vec<String> = arr
                .to_vec()
                .iter()
                .map(|item| render(item, depth + 1))
                .collect();
            format!("[{}]", items.join(", "))
        }
        HostValue::Object(_) => match crate::json::to_json(value) {
            Ok(json) => format!("Object({json})"),
            Err(_) => "Object".to_string(),
        },
        HostValue::Bytes(_) => "Uint8Array".to_string(),
        HostValue::Error(err) => format!("{}: {}", err.name, err.message),
        HostValue::Promise(_) => "Promise".to_string(),
    }
}

impl PartialEq for HostValue {
    /// Strict equality: primitives and strings compare by value, references
    /// by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(&a.0, &b.0),
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(&a.0, &b.0),
            (Self::Bytes(a), Self::Bytes(b)) => Rc::ptr_eq(&a.0, &b.0),
            (Self::Error(a), Self::Error(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => a == b,
            (Self::Promise(a), Self::Promise(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.debug_string())
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        Self::string(s)
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        Self::String(Rc::from(s))
    }
}

impl From<Callable> for HostValue {
    fn from(c: Callable) -> Self {
        Self::Function(c)
    }
}

// ── Reference types ──

impl ObjectRef {
    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.0
            .borrow()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn set(&self, key: &str, value: HostValue) {
        let mut props = self.0.borrow_mut();
        match props.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => props.push((key.to_string(), value)),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.borrow().iter().any(|(k, _)| k == key)
    }

    /// Snapshot of the properties in insertion order.
    pub fn entries(&self) -> Vec<(String, HostValue)> {
        self.0.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl ArrayRef {
    pub fn get(&self, index: usize) -> Option<HostValue> {
        self.0.borrow().get(index).cloned()
    }

    /// Store at `index`, padding any gap with `undefined`.
    pub fn set(&self, index: usize, value: HostValue) {
        let mut items = self.0.borrow_mut();
        if index >= items.len() {
            items.resize(index + 1, HostValue::Undefined);
        }
        items[index] = value;
    }

    pub fn push(&self, value: HostValue) {
        self.0.borrow_mut().push(value);
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn to_vec(&self) -> Vec<HostValue> {
        self.0.borrow().clone()
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl BytesRef {
    pub fn get(&self, index: usize) -> Option<u8> {
        self.0.borrow().get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    /// Replace the contents with `bytes`.
    pub fn replace(&self, bytes: &[u8]) {
        let mut buf = self.0.borrow_mut();
        buf.clear();
        buf.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_equality() {
        assert_eq!(HostValue::string("hello"), HostValue::string("hello"));
        assert_eq!(HostValue::Number(1.0), HostValue::Number(1.0));
        assert_ne!(HostValue::Number(f64::NAN), HostValue::Number(f64::NAN));
        assert_ne!(HostValue::object(), HostValue::object());

        let obj = HostValue::object();
        assert_eq!(obj.clone(), obj);
        assert_ne!(HostValue::Undefined, HostValue::Null);
    }

    #[test]
    fn test_type_tests() {
        assert!(HostValue::object().is_object());
        assert!(HostValue::error("Error", "x").is_object());
        assert!(!HostValue::Null.is_object());
        assert!(HostValue::string("s").is_string());
        assert!(HostValue::Undefined.is_undefined());
        assert_eq!(HostValue::Null.type_name(), "object");
        assert_eq!(HostValue::Bool(true).type_name(), "boolean");
    }

    #[test]
    fn test_object_properties_keep_insertion_order() {
        let obj = ObjectRef::default();
        obj.set("b", HostValue::Number(2.0));
        obj.set("a", HostValue::Number(1.0));
        obj.set("b", HostValue::Number(3.0));
        let keys: Vec<String> = obj.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(obj.get("b"), Some(HostValue::Number(3.0)));
    }

    #[test]
    fn test_get_property_on_undefined_throws_type_error() {
        let err = HostValue::Undefined.get_property("x").unwrap_err();
        let thrown = err.as_thrown().unwrap().debug_string();
        assert!(thrown.starts_with("TypeError:"), "{thrown}");
    }

    #[test]
    fn test_missing_property_is_undefined() {
        let obj = HostValue::object();
        assert_eq!(obj.get_property("nope").unwrap(), HostValue::Undefined);
        assert!(!obj.has_property("nope").unwrap());
    }

    #[test]
    fn test_has_property_on_primitive_throws() {
        assert!(HostValue::Number(1.0).has_property("x").is_err());
    }

    #[test]
    fn test_array_index_and_length() {
        let arr = HostValue::array(vec![HostValue::Bool(true)]);
        assert!(arr.set_property("2", HostValue::Null).unwrap());
        assert_eq!(arr.get_property("length").unwrap(), HostValue::Number(3.0));
        assert_eq!(arr.get_property("1").unwrap(), HostValue::Undefined);
        assert_eq!(arr.get_property("2").unwrap(), HostValue::Null);
        assert!(!arr.set_property("01", HostValue::Null).unwrap());
    }

    #[test]
    fn test_string_length_counts_utf16_units() {
        let s = HostValue::string("a\u{1F600}");
        assert_eq!(s.get_property("length").unwrap(), HostValue::Number(3.0));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(format_number(1e20), "100000000000000000000");
        assert_eq!(format_number(-2f64.powi(63)), "-9223372036854775808");
    }

    #[test]
    fn test_byte_element_writes_wrap() {
        let bytes = HostValue::bytes(vec![0; 6]);
        for (i, n) in [256.0, -1.0, 257.9, f64::NAN, f64::INFINITY, 1e20].into_iter().enumerate() {
            assert!(bytes.set_property(&i.to_string(), HostValue::Number(n)).unwrap());
        }
        match &bytes {
            HostValue::Bytes(b) => assert_eq!(b.to_vec(), vec![0, 255, 1, 0, 0, 0]),
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[test]
    fn test_debug_string_rendering() {
        assert_eq!(HostValue::string("hi").debug_string(), "\"hi\"");
        assert_eq!(HostValue::Null.debug_string(), "null");
        let arr = HostValue::array(vec![HostValue::Number(1.0), HostValue::Bool(false)]);
        assert_eq!(arr.debug_string(), "[1, false]");

        let obj = HostValue::object();
        obj.set_property("a", HostValue::Number(1.0)).unwrap();
        assert_eq!(obj.debug_string(), "Object({\"a\":1})");
    }

    #[test]
    fn test_self_referencing_array_renders() {
        let arr = HostValue::array(vec![]);
        if let HostValue::Array(inner) = &arr {
            inner.push(arr.clone());
        }
        assert!(arr.debug_string().contains("[...]"));
    }
}
