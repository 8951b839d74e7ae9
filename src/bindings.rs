//! Argument bindings between tasks.
//!
//! A task argument may be a reference to an upstream task's result:
//!
//! ```json
//! {"text": {"$from": "t2", "pointer": "/content"}}
//! ```
//!
//! `pointer` is an RFC 6901 JSON pointer into the upstream `output`
//! (empty or absent means the whole output). The source must be a declared
//! dependency; the validator enforces that. At dispatch time references are
//! replaced by the upstream value, or `null` when the upstream produced
//! nothing (a Skipped dependency of a best-effort task).

use serde_json::{Map, Value};

use crate::mission::TaskId;

pub const FROM_KEY: &str = "$from";
pub const POINTER_KEY: &str = "pointer";

/// A parsed reference to an upstream result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub source: TaskId,
    pub pointer: String,
}

/// Parse `value` as a binding, if it is one.
pub fn parse_binding(value: &Value) -> Option<Binding> {
    let obj = value.as_object()?;
    let source = obj.get(FROM_KEY)?.as_str()?;
    let pointer = match obj.get(POINTER_KEY) {
        None => String::new(),
        Some(Value::String(p)) => p.clone(),
        Some(_) => return None,
    };
    if obj.keys().any(|k| k != FROM_KEY && k != POINTER_KEY) {
        return None;
    }
    Some(Binding {
        source: TaskId::from(source),
        pointer,
    })
}

pub fn is_binding(value: &Value) -> bool {
    parse_binding(value).is_some()
}

/// Every binding found anywhere inside `args`, in document order.
pub fn collect_bindings(args: &Value) -> Vec<Binding> {
    let mut out = Vec::new();
    walk(args, &mut out);
    out
}

fn walk(value: &Value, out: &mut Vec<Binding>) {
    if let Some(binding) = parse_binding(value) {
        out.push(binding);
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
        Value::Object(map) => map.values().for_each(|v| walk(v, out)),
        _ => {}
    }
}

/// Replace every binding with the referenced upstream value.
///
/// `lookup` returns the upstream output for a task id, or `None` when the
/// task produced no result.
pub fn resolve_bindings<'a, F>(args: &Value, lookup: &F) -> Value
where
    F: Fn(&TaskId) -> Option<&'a Value>,
{
    if let Some(binding) = parse_binding(args) {
        return lookup(&binding.source)
            .and_then(|output| {
                if binding.pointer.is_empty() {
                    Some(output)
                } else {
                    output.pointer(&binding.pointer)
                }
            })
            .cloned()
            .unwrap_or(Value::Null);
    }
    match args {
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_bindings(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_bindings(v, lookup)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_binding_shapes() {
        assert_eq!(
            parse_binding(&json!({"$from": "t2", "pointer": "/content"})),
            Some(Binding {
                source: TaskId::from("t2"),
                pointer: "/content".to_string()
            })
        );
        assert!(is_binding(&json!({"$from": "t1"})));
        assert!(!is_binding(&json!({"$from": "t1", "other": 1})));
        assert!(!is_binding(&json!({"$from": 3})));
        assert!(!is_binding(&json!("t1")));
    }

    #[test]
    fn test_collect_nested() {
        let args = json!({
            "a": {"$from": "x"},
            "list": [1, {"$from": "y", "pointer": "/0"}],
        });
        let sources: Vec<String> = collect_bindings(&args)
            .into_iter()
            .map(|b| b.source.to_string())
            .collect();
        assert_eq!(sources, vec!["x", "y"]);
    }

    #[test]
    fn test_resolve_with_pointer_and_missing_upstream() {
        let t2 = json!({"content": "hello", "lines": 1});
        let lookup = |id: &TaskId| if id.as_str() == "t2" { Some(&t2) } else { None };

        let resolved = resolve_bindings(
            &json!({
                "text": {"$from": "t2", "pointer": "/content"},
                "all": {"$from": "t2"},
                "gone": {"$from": "t9"},
                "bad_pointer": {"$from": "t2", "pointer": "/nope"},
                "plain": 5
            }),
            &lookup,
        );

        assert_eq!(resolved["text"], json!("hello"));
        assert_eq!(resolved["all"], t2);
        assert_eq!(resolved["gone"], Value::Null);
        assert_eq!(resolved["bad_pointer"], Value::Null);
        assert_eq!(resolved["plain"], json!(5));
    }
}
