//! Request body fingerprinting.
//!
//! The hash is computed over a canonical JSON encoding (object keys sorted,
//! no insignificant whitespace) so two bodies that differ only in key order
//! are the same request.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 (hex) of the canonical encoding of `body`.
pub fn body_hash(body: &Value) -> String {
    let mut canonical = Vec::with_capacity(128);
    write_canonical(body, &mut canonical);
    hex::encode(Sha256::digest(&canonical))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push(b'{');
            for (idx, (key, item)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(item, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Writing into a Vec cannot fail.
    let _ = serde_json::to_writer(&mut *out, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn identical_bodies_hash_identically() {
        let a = json!({ "entityId": "r1", "payload": { "value": 10 } });
        let b = json!({ "entityId": "r1", "payload": { "value": 10 } });
        assert_eq!(body_hash(&a), body_hash(&b));
    }

    #[test]
    fn different_bodies_hash_differently() {
        let a = json!({ "entityId": "r1", "payload": { "value": 10 } });
        let b = json!({ "entityId": "r1", "payload": { "value": 11 } });
        assert_ne!(body_hash(&a), body_hash(&b));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let h = body_hash(&json!(null));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest! {
        #[test]
        fn key_order_does_not_matter(
            entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let forward: serde_json::Map<String, Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reversed: serde_json::Map<String, Value> =
                entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();

            prop_assert_eq!(
                body_hash(&Value::Object(forward)),
                body_hash(&Value::Object(reversed))
            );
        }
    }
}
