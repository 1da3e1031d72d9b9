/// Maximum number of characters of process output kept in logs
pub const OUTPUT_PREVIEW_CHARS: usize = 4096;

/// Truncate program output for logging, marking the cut
pub fn preview(output: &str) -> String {
    let mut chars = output.chars();
    let head: String = chars.by_ref().take(OUTPUT_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}... [truncated]", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_output_unchanged() {
        assert_eq!(preview("0.5\n"), "0.5\n");
    }

    #[test]
    fn test_preview_truncates_long_output() {
        let long = "x".repeat(OUTPUT_PREVIEW_CHARS + 10);
        let shown = preview(&long);
        assert!(shown.ends_with("... [truncated]"));
        assert_eq!(shown.chars().filter(|c| *c == 'x').count(), OUTPUT_PREVIEW_CHARS);
    }
}
