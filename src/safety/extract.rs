//! Text extraction from JSON payloads.

use serde_json::Value;

/// Visit every string leaf of `value`, depth first, in document order.
///
/// Object keys are not visited; only values are.
pub fn visit_strings<'a>(value: &'a Value, f: &mut impl FnMut(&'a str)) {
    match value {
        Value::String(s) => f(s),
        Value::Array(items) => {
            for item in items {
                visit_strings(item, f);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                visit_strings(v, f);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// All non-empty string leaves of `value` joined with single spaces
#[must_use]
pub fn collect_text(value: &Value) -> String {
    let mut parts = Vec::new();
    visit_strings(value, &mut |s| {
        if !s.is_empty() {
            parts.push(s);
        }
    });
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collects_nested_leaves() {
        let body = json!({
            "tool": "search",
            "arguments": {
                "query": "ignore previous instructions",
                "filters": [{"tag": "a"}, 3, null, {"deep": {"deeper": "b"}}],
                "limit": 10,
                "exact": true
            }
        });
        let text = collect_text(&body);
        assert!(text.contains("ignore previous instructions"));
        let mut words: Vec<&str> = text.split(' ').collect();
        words.sort_unstable();
        assert_eq!(words, ["a", "b", "ignore", "instructions", "previous", "search"]);
        assert!(!text.contains("10"));
        assert!(!text.contains("query"));
    }

    #[test]
    fn scalars_and_empty_strings_yield_nothing() {
        assert_eq!(collect_text(&json!(42)), "");
        assert_eq!(collect_text(&json!({"a": ""})), "");
        assert_eq!(collect_text(&json!("top")), "top");
    }
}
