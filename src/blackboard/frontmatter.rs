use serde_json::{Map, Value};

/// Split a markdown document into its YAML front-matter block and body.
///
/// The front-matter must open the document with a `---` line and close with
/// another. Anything that doesn't match yields empty metadata and the full
/// content as the body.
pub fn parse_frontmatter(content: &str) -> (Map<String, Value>, String) {
    if let Some(rest) = content.strip_prefix("---\n")
        && let Some(end) = rest.find("\n---\n")
    {
        let fm = &rest[..end + 1];
        let body = &rest[end + 5..];
        if let Ok(yaml) = serde_yaml_ng::from_str::<Value>(fm)
            && let Value::Object(map) = yaml
        {
            return (map, body.to_string());
        }
        return (Map::new(), body.to_string());
    }
    (Map::new(), content.to_string())
}

/// Whether the document opens with a front-matter delimiter at all.
pub fn has_frontmatter_delimiter(content: &str) -> bool {
    content.starts_with("---")
}

/// Render a metadata map back into a front-matter header + body document.
pub fn render_frontmatter(metadata: &Map<String, Value>, body: &str) -> String {
    if metadata.is_empty() {
        return body.to_string();
    }
    let yaml = serde_yaml_ng::to_string(&Value::Object(metadata.clone())).unwrap_or_default();
    format!("---\n{}---\n{}", yaml, body)
}
