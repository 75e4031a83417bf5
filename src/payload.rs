use serde_json::{Map, Value};

/// Lay `second` over `first`.
///
/// Keys present in both take the value from `second`; nested objects merge
/// recursively and keys unique to either side survive. If either side is not
/// a JSON object, `first` is returned untouched.
pub fn merge_json(first: &str, second: &str) -> String {
    let (Ok(Value::Object(mut base)), Ok(Value::Object(overlay))) = (
        serde_json::from_str::<Value>(first),
        serde_json::from_str::<Value>(second),
    ) else {
        return first.to_string();
    };
    merge_objects(&mut base, overlay);
    Value::Object(base).to_string()
}

fn merge_objects(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_objects(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
