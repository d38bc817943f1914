//! Loosely typed option mappings handed to solvers and backends.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// Option mapping: names to JSON values.
pub type Dict = serde_json::Map<String, Value>;

/// Deserializes a typed settings struct from `dict`.
///
/// Settings structs use `#[serde(default, deny_unknown_fields)]`, so missing
/// keys fall back to defaults and misspelled keys are rejected.
pub fn settings_from_dict<T: DeserializeOwned>(dict: &Dict) -> Result<T> {
    serde_json::from_value(Value::Object(dict.clone())).map_err(Error::InvalidOptions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(default, deny_unknown_fields)]
    struct Sample {
        steps: usize,
        label: String,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                steps: 3,
                label: "x".to_string(),
            }
        }
    }

    fn dict(value: Value) -> Dict {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn missing_keys_take_defaults() {
        let s: Sample = settings_from_dict(&dict(json!({ "steps": 7 }))).unwrap();
        assert_eq!(
            s,
            Sample {
                steps: 7,
                label: "x".to_string()
            }
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = settings_from_dict::<Sample>(&dict(json!({ "stpes": 7 }))).unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }
}
