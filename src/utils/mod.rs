pub mod json_repair;

/// Current wall clock as fractional epoch seconds, matching the registry and
/// mailbox on-disk timestamp format.
pub fn unix_time_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Truncate a string to at most `max` characters, appending a notice with the
/// original size when anything was dropped.
pub fn truncate_with_notice(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max).collect();
    format!(
        "{}\n\n[Output truncated due to length... original size: {} characters]",
        head,
        s.chars().count()
    )
}
