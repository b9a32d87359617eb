//! `${name}` variable interpolation against the payload's merged variable
//! map (§4.9 step 3's "resolve `${name}` variable interpolation against the
//! merged variable map"). The merge itself (script-over-project) already
//! happened control-plane side at dispatch time (§3's Variable note); the
//! worker only substitutes.

use serde_json::Value as Json;
use std::collections::HashMap;

/// Recursively substitutes `${name}` occurrences inside every string found
/// in `value` (including nested objects/arrays, as step `params` commonly
/// are), leaving non-string values untouched.
pub fn interpolate_value(value: &Json, variables: &HashMap<String, Json>) -> Json {
    match value {
        Json::String(s) => Json::String(interpolate_str(s, variables)),
        Json::Array(items) => Json::Array(items.iter().map(|v| interpolate_value(v, variables)).collect()),
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, variables));
            }
            Json::Object(out)
        }
        other => other.clone(),
    }
}

/// Replaces every `${name}` with the variable's string form. An unresolved
/// name is left in place verbatim rather than substituted with an empty
/// string, so a missing variable is visible in the recorded step params.
pub fn interpolate_str(input: &str, variables: &HashMap<String, Json>) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                match variables.get(name) {
                    Some(value) => out.push_str(&json_as_string(value)),
                    None => out.push_str(&input[i..i + 3 + end]),
                }
                i += 3 + end;
                continue;
            }
        }
        let ch_len = input[i..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&input[i..i + ch_len]);
        i += ch_len;
    }

    out
}

fn json_as_string(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> HashMap<String, Json> {
        let mut map = HashMap::new();
        map.insert("username".to_string(), json!("alice"));
        map.insert("retries".to_string(), json!(3));
        map
    }

    #[test]
    fn substitutes_known_variable() {
        assert_eq!(interpolate_str("hello ${username}", &vars()), "hello alice");
    }

    #[test]
    fn leaves_unknown_variable_untouched() {
        assert_eq!(interpolate_str("hello ${missing}", &vars()), "hello ${missing}");
    }

    #[test]
    fn substitutes_non_string_values_by_their_json_form() {
        assert_eq!(interpolate_str("attempt ${retries}", &vars()), "attempt 3");
    }

    #[test]
    fn recurses_into_nested_objects_and_arrays() {
        let params = json!({"selector": "#${username}", "tags": ["${username}", "static"]});
        let resolved = interpolate_value(&params, &vars());
        assert_eq!(resolved["selector"], json!("#alice"));
        assert_eq!(resolved["tags"][0], json!("alice"));
        assert_eq!(resolved["tags"][1], json!("static"));
    }
}
