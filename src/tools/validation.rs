use jsonschema::JSONSchema;
use serde_json::Value;

/// Compiles a tool's input schema once at registration.
pub fn compile_schema(tool: &str, schema: &Value) -> Result<JSONSchema, String> {
    JSONSchema::compile(schema).map_err(|error| format!("invalid input schema for {}: {}", tool, error))
}

/// Every schema violation in `input`, prefixed with its instance path.
pub fn input_errors(schema: &JSONSchema, input: &Value) -> Vec<String> {
    schema
        .validate(input)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}
