use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^```(?:json)?\s*(.*?)\s*```$").expect("valid fenced block regex")
});

/// Pull the JSON object out of an LLM response.
///
/// Models frequently wrap the payload in ```json fences or add commentary
/// before and after it; everything outside the outermost braces is dropped.
pub fn extract_json_object(raw: &str) -> Option<String> {
    let mut text = raw.trim();
    if let Some(captures) = FENCED_BLOCK.captures(text)
        && let Some(inner) = captures.get(1)
    {
        text = inner.as_str().trim();
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(text[start..=end].to_string())
}

/// Truncate to at most `max_chars` characters, marking the cut with an ellipsis.
pub fn clip(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", kept.trim_end())
}

/// Case-insensitive de-duplication that keeps first occurrences and order.
pub fn dedupe_preserving_order<I, S>(items: I, max_items: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let value = item.as_ref().trim();
        if value.is_empty() || !seen.insert(value.to_lowercase()) {
            continue;
        }
        out.push(value.to_string());
        if out.len() >= max_items {
            break;
        }
    }
    out
}
