//! Layer merging
//!
//! - Objects: deep-merge by key
//! - Arrays: replaced by the later layer
//! - Scalars: later layer wins

use serde_json::Value;

/// Deep merge `overlay` into `base`
///
/// A `null` in the overlay removes nothing; it overrides like any scalar.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Merge layers in precedence order (last wins)
pub fn merge_layers(layers: Vec<Value>) -> Value {
    layers.into_iter().fold(Value::Null, deep_merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_override() {
        let result = deep_merge(json!({"region": "us-east-1"}), json!({"region": "eu-west-1"}));
        assert_eq!(result["region"], "eu-west-1");
    }

    #[test]
    fn test_sections_merge_by_key() {
        let base = json!({"monitor": {"poll_interval_ms": 5000, "jitter_ms": 1000}});
        let overlay = json!({"monitor": {"jitter_ms": 0}});
        let result = deep_merge(base, overlay);

        assert_eq!(result["monitor"]["poll_interval_ms"], 5000);
        assert_eq!(result["monitor"]["jitter_ms"], 0);
    }

    #[test]
    fn test_arrays_replace() {
        let base = json!({"bundle": {"exclude": ["*.log", "dist/"]}});
        let overlay = json!({"bundle": {"exclude": ["tmp/"]}});
        let result = deep_merge(base, overlay);

        assert_eq!(result["bundle"]["exclude"], json!(["tmp/"]));
    }

    #[test]
    fn test_env_maps_accumulate() {
        let base = json!({"env": {"LOG_LEVEL": "info"}});
        let overlay = json!({"env": {"MODEL_ID": "m1"}});
        let result = deep_merge(base, overlay);

        assert_eq!(result["env"]["LOG_LEVEL"], "info");
        assert_eq!(result["env"]["MODEL_ID"], "m1");
    }

    #[test]
    fn test_merge_layers_precedence() {
        let builtin = json!({"region": "us-east-1", "retry": {"max_retries": 5}});
        let host = json!({"region": "us-west-2"});
        let project = json!({"retry": {"max_retries": 2}});
        let cli = json!({"region": "eu-central-1"});

        let result = merge_layers(vec![builtin, host, project, cli]);

        assert_eq!(result["region"], "eu-central-1");
        assert_eq!(result["retry"]["max_retries"], 2);
    }
}
