//! Structured-output schema validation.

use serde_json::Value;

/// Validate a value against a JSON schema, collecting every violation into
/// one message. A schema that does not compile rejects everything: a run
/// that asked for structured output must not silently lose validation.
pub fn validate_against(schema: &Value, value: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|err| format!("output schema does not compile: {err}"))?;
    let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"total": {"type": "number"}},
            "required": ["total"],
            "additionalProperties": false,
        })
    }

    #[test]
    fn conforming_value_passes() {
        assert!(validate_against(&schema(), &json!({"total": 7})).is_ok());
    }

    #[test]
    fn violations_are_reported() {
        let err = validate_against(&schema(), &json!({"total": "seven"})).unwrap_err();
        assert!(err.contains("seven") || err.contains("number"));
        assert!(validate_against(&schema(), &json!({})).is_err());
        assert!(validate_against(&schema(), &json!({"total": 1, "extra": true})).is_err());
    }

    #[test]
    fn broken_schema_rejects() {
        let broken = json!({"type": "not-a-real-type"});
        assert!(validate_against(&broken, &json!(1)).is_err());
    }
}
