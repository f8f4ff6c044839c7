use serde_json::Value;

/// Attempt to parse a JSON string, repairing common stream-truncation damage
/// (unclosed strings, unbalanced brackets) when direct parsing fails.
///
/// Returns `Some((repaired_string, value))` on success, `None` if the input is
/// unsalvageable. The repaired string is what should be stored back into the
/// tool-call history so the transcript stays valid JSON.
pub fn repair_truncated_json(json_str: &str) -> Option<(String, Value)> {
    if json_str.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(json_str) {
        return Some((json_str.to_string(), value));
    }

    let working = json_str.trim();

    // Walk the input tracking string/escape state and a bracket stack, then
    // close whatever was left open.
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in working.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' if !in_string => {
                if stack.last() == Some(&'}') {
                    stack.pop();
                }
            }
            ']' if !in_string => {
                if stack.last() == Some(&']') {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut repaired = working.to_string();
    if in_string {
        repaired.push('"');
    }
    while let Some(close) = stack.pop() {
        repaired.push(close);
    }

    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => Some((repaired, value)),
        Err(_) => {
            // Trailing comma before truncation point: strip and close again.
            let stripped = working.trim_end().trim_end_matches(',');
            if stripped != working {
                return repair_truncated_json(stripped);
            }
            None
        }
    }
}
