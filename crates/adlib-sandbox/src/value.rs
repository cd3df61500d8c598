//! Runtime value model for the restricted interpreter.
//!
//! Values are owned and cloned freely; snippets are short and small. Dicts
//! preserve insertion order and use equality-based key lookup, which keeps
//! key types flexible (strings, integers, tuples) without a hash
//! implementation over floats.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value as Json};

/// The capabilities reachable from snippet code. Only these two names carry
/// host authority; everything else in the environment is plain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The tenant- and collection-scoped record store.
    Store,
    /// The reply constructor.
    MakeResponse,
}

/// Type tags for `isinstance` checks and constructor identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    /// `bool`
    Bool,
    /// `int`
    Int,
    /// `float`
    Float,
    /// `str`
    Str,
    /// `list`
    List,
    /// `tuple`
    Tuple,
    /// `set`
    Set,
    /// `dict`
    Dict,
}

impl TypeTag {
    /// Resolve a builtin type name to its tag.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(Self::Bool),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "str" => Some(Self::Str),
            "list" => Some(Self::List),
            "tuple" => Some(Self::Tuple),
            "set" => Some(Self::Set),
            "dict" => Some(Self::Dict),
            _ => None,
        }
    }
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    /// `None`
    None,
    /// A boolean.
    Bool(bool),
    /// A 64-bit integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A string.
    Str(String),
    /// A list.
    List(Vec<Value>),
    /// A tuple.
    Tuple(Vec<Value>),
    /// A set with insertion order and equality-based dedup.
    Set(Vec<Value>),
    /// A dict with insertion order and equality-based key lookup.
    Dict(Vec<(Value, Value)>),
    /// A lazy `range(start, stop, step)`; never materialized wholesale.
    Range(i64, i64, i64),
    /// A capability reference (`store`, `make_response`).
    Capability(Capability),
    /// A builtin type object (`dict`, `str`, ...), used by `isinstance`.
    Type(TypeTag),
}

impl Value {
    /// Convert from transport JSON.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Json::String(s) => Value::Str(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (Value::Str(k.clone()), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to transport JSON. Tuples and sets become arrays; non-string
    /// dict keys are coerced to their string form, as `json.dumps` does.
    /// Capabilities, type objects, and ranges are not serializable.
    pub fn to_json(&self) -> Result<Json, String> {
        match self {
            Value::None => Ok(Json::Null),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Int(i) => Ok(Json::Number(Number::from(*i))),
            Value::Float(f) => Number::from_f64(*f)
                .map(Json::Number)
                .ok_or_else(|| "non-finite float is not JSON serializable".to_string()),
            Value::Str(s) => Ok(Json::String(s.clone())),
            Value::List(items) | Value::Tuple(items) | Value::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.to_json()?);
                }
                Ok(Json::Array(out))
            }
            Value::Dict(pairs) => {
                let mut map = Map::new();
                for (key, value) in pairs {
                    let key = match key {
                        Value::Str(s) => s.clone(),
                        other => other.py_str(),
                    };
                    map.insert(key, value.to_json()?);
                }
                Ok(Json::Object(map))
            }
            Value::Range(..) => Err("range is not JSON serializable".to_string()),
            Value::Capability(_) | Value::Type(_) => {
                Err("object is not JSON serializable".to_string())
            }
        }
    }

    /// Python truthiness.
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(v) | Value::Tuple(v) | Value::Set(v) => !v.is_empty(),
            Value::Dict(pairs) => !pairs.is_empty(),
            Value::Range(start, stop, step) => range_len(*start, *stop, *step) > 0,
            Value::Capability(_) | Value::Type(_) => true,
        }
    }

    /// The type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Range(..) => "range",
            Value::Capability(_) => "capability",
            Value::Type(_) => "type",
        }
    }

    /// Does this value match a type tag? Unlike Python, `bool` does not
    /// match `int`; generated code branching on payload shapes means the
    /// distinction when it asks for it.
    pub fn is_instance(&self, tag: TypeTag) -> bool {
        matches!(
            (self, tag),
            (Value::Bool(_), TypeTag::Bool)
                | (Value::Int(_), TypeTag::Int)
                | (Value::Float(_), TypeTag::Float)
                | (Value::Str(_), TypeTag::Str)
                | (Value::List(_), TypeTag::List)
                | (Value::Tuple(_), TypeTag::Tuple)
                | (Value::Set(_), TypeTag::Set)
                | (Value::Dict(_), TypeTag::Dict)
        )
    }

    /// `str(value)`.
    pub fn py_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.py_repr(),
        }
    }

    /// `repr(value)`.
    pub fn py_repr(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
                    format!("{f:.1}")
                } else {
                    format!("{f}")
                }
            }
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::py_repr).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(Value::py_repr).collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Value::Set(items) => {
                if items.is_empty() {
                    "set()".to_string()
                } else {
                    let parts: Vec<String> = items.iter().map(Value::py_repr).collect();
                    format!("{{{}}}", parts.join(", "))
                }
            }
            Value::Dict(pairs) => {
                let parts: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.py_repr(), v.py_repr()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Range(start, stop, step) => {
                if *step == 1 {
                    format!("range({start}, {stop})")
                } else {
                    format!("range({start}, {stop}, {step})")
                }
            }
            Value::Capability(Capability::Store) => "<store>".to_string(),
            Value::Capability(Capability::MakeResponse) => "<make_response>".to_string(),
            Value::Type(tag) => format!("<class '{}'>", type_tag_name(tag)),
        }
    }
}

fn type_tag_name(tag: &TypeTag) -> &'static str {
    match tag {
        TypeTag::Bool => "bool",
        TypeTag::Int => "int",
        TypeTag::Float => "float",
        TypeTag::Str => "str",
        TypeTag::List => "list",
        TypeTag::Tuple => "tuple",
        TypeTag::Set => "set",
        TypeTag::Dict => "dict",
    }
}

/// Number of elements a range yields.
pub fn range_len(start: i64, stop: i64, step: i64) -> u64 {
    if step > 0 && stop > start {
        ((stop - start) as u64).div_ceil(step as u64)
    } else if step < 0 && stop < start {
        ((start - stop) as u64).div_ceil(step.unsigned_abs())
    } else {
        0
    }
}

/// Python `==`. Numbers compare across int/float; bools equal ints as in
/// Python (`True == 1`). Everything else requires matching shapes.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y))
        | (Value::Tuple(x), Value::Tuple(y))
        | (Value::Set(x), Value::Set(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.iter()
                        .find(|(k2, _)| values_equal(k, k2))
                        .is_some_and(|(_, v2)| values_equal(v, v2))
                })
        }
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

/// Python `<`/`>` ordering. `None` when the operands do not order.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::List(x), Value::List(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                match compare_values(left, right)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(x.len().cmp(&y.len()))
        }
        _ => {
            let (x, y) = (numeric(a)?, numeric(b)?);
            x.partial_cmp(&y)
        }
    }
}

/// Membership lookup used by `in`, set dedup, and dict keys.
pub fn contains_value(haystack: &[Value], needle: &Value) -> bool {
    haystack.iter().any(|v| values_equal(v, needle))
}

/// Look up a dict entry by key equality.
pub fn dict_get<'a>(pairs: &'a [(Value, Value)], key: &Value) -> Option<&'a Value> {
    pairs
        .iter()
        .find(|(k, _)| values_equal(k, key))
        .map(|(_, v)| v)
}

/// Insert or replace a dict entry, preserving insertion order.
pub fn dict_set(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    if let Some(slot) = pairs.iter_mut().find(|(k, _)| values_equal(k, &key)) {
        slot.1 = value;
    } else {
        pairs.push((key, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        let json = json!({"name": "Alice", "age": 30, "tags": ["a", "b"], "ok": true, "x": null});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn tuples_and_sets_serialize_as_arrays() {
        let v = Value::Tuple(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(v.to_json().unwrap(), json!([1, 2]));
        let v = Value::Set(vec![Value::Str("a".into())]);
        assert_eq!(v.to_json().unwrap(), json!(["a"]));
    }

    #[test]
    fn truthiness_matches_python() {
        assert!(!Value::None.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(!Value::List(vec![]).truthy());
        assert!(!Value::Dict(vec![]).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(Value::Str(" ".into()).truthy());
        assert!(!Value::Range(0, 0, 1).truthy());
        assert!(Value::Range(0, 3, 1).truthy());
    }

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0)));
        assert!(values_equal(&Value::Bool(true), &Value::Int(1)));
        assert!(!values_equal(&Value::Str("1".into()), &Value::Int(1)));
    }

    #[test]
    fn ordering_is_numeric_or_lexicographic() {
        assert_eq!(
            compare_values(&Value::Int(1), &Value::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&Value::Str("a".into()), &Value::Str("b".into())),
            Some(Ordering::Less)
        );
        assert_eq!(compare_values(&Value::Str("a".into()), &Value::Int(1)), None);
    }

    #[test]
    fn str_rendering_uses_python_spellings() {
        assert_eq!(Value::Bool(true).py_str(), "True");
        assert_eq!(Value::None.py_str(), "None");
        assert_eq!(Value::Float(1.0).py_str(), "1.0");
        assert_eq!(Value::Float(99.99).py_str(), "99.99");
        assert_eq!(
            Value::List(vec![Value::Str("a".into()), Value::Int(1)]).py_str(),
            "['a', 1]"
        );
    }

    #[test]
    fn range_len_handles_directions() {
        assert_eq!(range_len(0, 10, 1), 10);
        assert_eq!(range_len(0, 10, 3), 4);
        assert_eq!(range_len(10, 0, -1), 10);
        assert_eq!(range_len(0, 10, -1), 0);
        assert_eq!(range_len(5, 5, 1), 0);
    }

    #[test]
    fn dict_ops_use_key_equality() {
        let mut pairs = Vec::new();
        dict_set(&mut pairs, Value::Str("a".into()), Value::Int(1));
        dict_set(&mut pairs, Value::Str("a".into()), Value::Int(2));
        assert_eq!(pairs.len(), 1);
        assert!(matches!(
            dict_get(&pairs, &Value::Str("a".into())),
            Some(Value::Int(2))
        ));
        assert!(dict_get(&pairs, &Value::Str("b".into())).is_none());
    }
}
