//! Structural equality over JSON values.
//!
//! The deduplication gate compares the serialized form of a candidate value
//! against the serialized form of the current one, so user types need no
//! `PartialEq` implementation. This comparator differs from `Value`'s own
//! `PartialEq` in one place: numbers are compared by numeric value, so `1`
//! and `1.0` are equal.

use serde_json::Value;

/// Recursive structural equality over two JSON trees.
///
/// Arrays are compared element-wise, objects key-wise (insertion order does
/// not matter), numbers numerically, everything else by value.
pub fn structural_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            // Out-of-f64-range u64/i64 mix; fall back to exact comparison.
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| structural_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| structural_eq(x, y)))
        }
        _ => a == b,
    }
}
