//! Trim tool definitions before they are sent to the model.

use serde_json::{Map, Value};

use concierge_types::ToolSpec;

pub const MAX_DESCRIPTION_CHARS: usize = 100;

/// Shorten the description and strip per-property descriptions from the schema.
pub fn minimize(spec: &ToolSpec) -> ToolSpec {
    let description = if spec.description.is_empty() {
        spec.name.clone()
    } else {
        truncate_description(&spec.description)
    };
    ToolSpec {
        name: spec.name.clone(),
        description,
        input_schema: minimize_schema(&spec.input_schema),
    }
}

fn truncate_description(text: &str) -> String {
    if text.chars().count() <= MAX_DESCRIPTION_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_DESCRIPTION_CHARS).collect();
    format!("{}…", cut.trim_end())
}

fn minimize_schema(schema: &Value) -> Value {
    let mut schema = match schema {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    schema
        .entry("type")
        .or_insert_with(|| Value::String("object".into()));
    let properties = schema
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(properties) = properties {
        for property in properties.values_mut() {
            if let Value::Object(property) = property {
                property.remove("description");
            }
        }
    }
    Value::Object(schema)
}
