//! Purpose: Comparison rules for dynamically typed record values.
//! Exports: `values_equal`, `compare_values`, `sort_order`.
//! Role: Single place where the query layer decides equality and ordering.
//! Invariants: Numbers compare by numeric value regardless of integer/float encoding.
//! Invariants: `compare_values` returns `None` for incomparable pairs; it never panics.
//! Invariants: `sort_order` is a total order (type rank first, then value).
use std::cmp::Ordering;

use serde_json::{Number, Value};

/// Structural equality with numeric comparison by value (`1 == 1.0`).
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b) == Ordering::Equal,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => left == right,
    }
}

/// Ordering used by `<`, `<=`, `>`, `>=` predicates.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => Some(compare_numbers(a, b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b) {
                match compare_values(x, y)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => None,
    }
}

/// Total order for sorting mixed data: null < bool < number < string < array < object.
pub fn sort_order(left: &Value, right: &Value) -> Ordering {
    let rank = kind_rank(left).cmp(&kind_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }
    match (left, right) {
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b) {
                let ord = sort_order(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b) {
                let ord = ka.cmp(kb).then_with(|| sort_order(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => compare_values(left, right).unwrap_or(Ordering::Equal),
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.total_cmp(&y)
}

#[cfg(test)]
mod tests {
    use super::{compare_values, sort_order, values_equal};
    use serde_json::json;
    use std::cmp::Ordering;

    #[test]
    fn integers_and_floats_are_equal_by_value() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({"t": [1, 2]}), &json!({"t": [1.0, 2]})));
        assert!(!values_equal(&json!(1), &json!("1")));
        assert!(!values_equal(&json!(true), &json!(1)));
    }

    #[test]
    fn mixed_types_are_incomparable() {
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
        assert_eq!(compare_values(&json!(null), &json!(null)), None);
        assert_eq!(compare_values(&json!({}), &json!({})), None);
    }

    #[test]
    fn strings_compare_lexicographically() {
        assert_eq!(
            compare_values(&json!("2024-01-02"), &json!("2024-01-10")),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn arrays_compare_elementwise_then_by_length() {
        assert_eq!(compare_values(&json!([1, 2]), &json!([1, 3])), Some(Ordering::Less));
        assert_eq!(compare_values(&json!([1, 2]), &json!([1])), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!([1, "a"]), &json!([1, 2])), None);
    }

    #[test]
    fn large_unsigned_values_compare_exactly() {
        let big = json!(u64::MAX);
        let smaller = json!(u64::MAX - 1);
        assert_eq!(compare_values(&smaller, &big), Some(Ordering::Less));
    }

    #[test]
    fn sort_order_ranks_types() {
        let mut values = vec![json!("b"), json!(3), json!(null), json!(""), json!(true)];
        values.sort_by(sort_order);
        assert_eq!(values, vec![json!(null), json!(true), json!(3), json!(""), json!("b")]);
    }
}
