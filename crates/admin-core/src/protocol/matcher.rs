//! Structural matching of JSON values.
//!
//! A pending request names the message it waits for plus an optional partial
//! payload. An inbound payload satisfies it when every key of the partial
//! payload is present with a structurally equal value.

use serde_json::Value;

/// Deep equality over tagged JSON values.
///
/// Objects need equal key sets and equal values per key, arrays need equal
/// length and pairwise equal items. Numbers compare by value, so `1` equals `1.0`.
pub fn structurally_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                a == b
            } else if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                a == b
            } else {
                a.as_f64() == b.as_f64()
            }
        }
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| structurally_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, a)| {
                    b.get(key).is_some_and(|b| structurally_equal(a, b))
                })
        }
        _ => false,
    }
}

/// Whether `received` satisfies the partial expectation `expected`.
///
/// An absent or `null` expectation matches anything. An object expectation
/// matches when each of its keys is present in the received object with a
/// structurally equal value; extra received keys are ignored. Any other
/// expectation must equal the whole received payload.
pub fn matches_partial(expected: Option<&Value>, received: Option<&Value>) -> bool {
    match expected {
        None | Some(Value::Null) => true,
        Some(Value::Object(expected)) => {
            let Some(Value::Object(received)) = received else {
                return false;
            };
            expected.iter().all(|(key, value)| {
                received
                    .get(key)
                    .is_some_and(|other| structurally_equal(value, other))
            })
        }
        Some(expected) => received.is_some_and(|received| structurally_equal(expected, received)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_expectation_matches_everything() {
        assert!(matches_partial(None, None));
        assert!(matches_partial(None, Some(&json!({"x": 1}))));
        assert!(matches_partial(Some(&Value::Null), Some(&json!([1]))));
    }

    #[test]
    fn test_partial_object_ignores_extra_keys() {
        let expected = json!({"contextId": "web", "filePath": "/a.txt"});
        let received = json!({"contextId": "web", "filePath": "/a.txt", "content": "aGVsbG8="});
        assert!(matches_partial(Some(&expected), Some(&received)));
    }

    #[test]
    fn test_partial_object_requires_every_key() {
        let expected = json!({"contextId": "web", "filePath": "/a.txt"});
        let received = json!({"contextId": "web"});
        assert!(!matches_partial(Some(&expected), Some(&received)));
        assert!(!matches_partial(Some(&expected), None));
        assert!(!matches_partial(Some(&expected), Some(&json!("web"))));
    }

    #[test]
    fn test_nested_objects_need_equal_key_sets() {
        let expected = json!({"change": {"id": "web"}});
        let received = json!({"change": {"id": "web", "extra": true}});
        assert!(!matches_partial(Some(&expected), Some(&received)));
    }

    #[test]
    fn test_arrays_compare_pairwise_with_length() {
        let expected = json!({"newFiles": ["/a", "/b"]});
        assert!(matches_partial(Some(&expected), Some(&json!({"newFiles": ["/a", "/b"]}))));
        assert!(!matches_partial(Some(&expected), Some(&json!({"newFiles": ["/a"]}))));
        assert!(!matches_partial(Some(&expected), Some(&json!({"newFiles": ["/b", "/a"]}))));
    }

    #[test]
    fn test_scalars_are_strict() {
        assert!(structurally_equal(&json!(1), &json!(1.0)));
        assert!(!structurally_equal(&json!(1), &json!("1")));
        assert!(!structurally_equal(&json!(null), &json!(false)));
        assert!(!structurally_equal(&json!(true), &json!(1)));
    }
}
