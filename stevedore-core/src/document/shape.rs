//! 保留文档中显式写出的空值。
//!
//! 模型序列化时会省略 None / false / 空列表；若原文件显式写了 `null`、`false`、`[]`
//! 或 `{}`，写回时按原位置补回，使 Save(Load(doc)) 与原文档一致。

use serde_json::{Map, Value};

/// 以 `shape`（上次读到的原始 JSON）为参照，补回被省略的显式空值。
pub(crate) fn restore_explicit_empties(value: Value, shape: &Value) -> Value {
    match (value, shape) {
        (Value::Object(mut fresh), Value::Object(original)) => {
            let mut merged = Map::new();
            // 先按原文件的键顺序
            for (key, old) in original {
                match fresh.remove(key) {
                    Some(v) => {
                        merged.insert(key.clone(), restore_explicit_empties(v, old));
                    }
                    None if is_explicit_empty(old) => {
                        merged.insert(key.clone(), old.clone());
                    }
                    None => {}
                }
            }
            merged.extend(fresh);
            Value::Object(merged)
        }
        (Value::Array(fresh), Value::Array(original)) => Value::Array(
            fresh
                .into_iter()
                .enumerate()
                .map(|(i, v)| match original.get(i) {
                    Some(old) if same_record(&v, old) => restore_explicit_empties(v, old),
                    _ => v,
                })
                .collect(),
        ),
        (v, _) => v,
    }
}

/// 与模型省略规则对应的“空”值。
fn is_explicit_empty(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// 同一位置的列表元素按标识键比对，标识不同则不套用旧形状。
fn same_record(fresh: &Value, original: &Value) -> bool {
    for key in ["id", "name", "containerPort", "containerPath"] {
        if let (Some(a), Some(b)) = (fresh.get(key), original.get(key)) {
            return a == b;
        }
    }
    true
}
