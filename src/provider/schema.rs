//! Tool parameter schema normalization.

use serde_json::{Map, Value};

/// Keywords vendor function-calling dialects reject.
const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "$ref",
    "$schema",
    "$id",
    "$defs",
    "$comment",
    "definitions",
    "additionalProperties",
    "patternProperties",
    "unevaluatedProperties",
    "propertyNames",
    "dependentSchemas",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "examples",
    "if",
    "then",
    "else",
    "not",
];

/// Strip unsupported keywords from a tool parameter schema, recursively.
///
/// Keys of a `properties` map are property names, not keywords, and are kept
/// as-is even when they collide with a keyword. `const` becomes a single-value
/// `enum`.
pub fn sanitize_tool_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => {
            let mut out = Map::new();
            for (key, value) in obj {
                if UNSUPPORTED_KEYWORDS.contains(&key.as_str()) {
                    continue;
                }
                match key.as_str() {
                    "properties" => {
                        out.insert(key.clone(), sanitize_properties(value));
                    }
                    "const" => {
                        out.entry("enum")
                            .or_insert_with(|| Value::Array(vec![value.clone()]));
                    }
                    _ => {
                        out.insert(key.clone(), sanitize_tool_schema(value));
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_tool_schema).collect()),
        _ => schema.clone(),
    }
}

fn sanitize_properties(properties: &Value) -> Value {
    match properties {
        Value::Object(props) => Value::Object(
            props
                .iter()
                .map(|(name, schema)| (name.clone(), sanitize_tool_schema(schema)))
                .collect(),
        ),
        other => sanitize_tool_schema(other),
    }
}
