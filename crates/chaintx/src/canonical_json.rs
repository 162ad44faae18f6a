//! Canonical JSON: object keys sorted bytewise, no insignificant whitespace,
//! numbers written exactly as parsed.
//!
//! Used for request hashing and for outbox payloads, where the stored bytes
//! are what gets signed and delivered.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn to_vec(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(&mut out, value);
    out
}

pub fn to_string(value: &Value) -> String {
    // write_value only emits valid UTF-8.
    String::from_utf8_lossy(&to_vec(value)).into_owned()
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key);
                out.push(b':');
                write_value(out, &map[key]);
            }
            out.push(b'}');
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    // Serializing a str cannot fail.
    let encoded = serde_json::to_string(s).unwrap_or_default();
    out.extend_from_slice(encoded.as_bytes());
}

/// Remove object members whose value is null, recursively.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, {"y": null, "x": "s"}]}});
        assert_eq!(
            to_string(&value),
            r#"{"a":{"m":[3,{"x":"s","y":null}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn strings_are_escaped() {
        let value = json!({"k": "quote\" and \\ newline\n"});
        assert_eq!(to_string(&value), r#"{"k":"quote\" and \\ newline\n"}"#);
    }

    #[test]
    fn null_members_are_stripped() {
        let value = json!({"a": null, "b": {"c": null, "d": 1}, "e": [null]});
        assert_eq!(to_string(&strip_nulls(value)), r#"{"b":{"d":1},"e":[null]}"#);
    }

    #[test]
    fn insertion_order_does_not_change_bytes() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(to_vec(&a), to_vec(&b));
        assert_eq!(sha256_hex(&to_vec(&a)), sha256_hex(&to_vec(&b)));
    }
}
