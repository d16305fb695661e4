//! Prompt templates for MGL LLM operations.
//!
//! Every prompt is a plain `&str` with `{placeholder}` slots filled by
//! [`render_template`]. Literal JSON braces are left alone because only the
//! listed keys are substituted.

/// Structured extraction of entities, relationships and events.
pub const EXTRACTION_SYSTEM: &str = "You are a memory extraction AI. Return only valid JSON.";

pub const EXTRACTION_USER: &str = r#"Analyze this conversation transcript and extract memory elements.

Transcript: "{transcript}"

Extract and return ONLY a JSON object with this exact structure:
{
  "entities": [{"name": "entity name", "type": "person|place|organization|concept", "context": "brief context"}],
  "relationships": [{"subject": "entity name", "predicate": "relationship verb", "object": "entity name", "confidence": 0.0-1.0}],
  "events": [{"description": "what happened", "participants": ["entity names"]}]
}

Return valid JSON only, no explanation."#;

/// Weekly rollup of recent events.
pub const SUMMARY_SYSTEM: &str = "You are a memory summarizer. Be concise.";

pub const SUMMARY_USER: &str = r"Summarize these memory events into 2-3 concise sentences:
{events}";

/// Memory-grounded question answering.
pub const ANSWER_SYSTEM: &str = "You are a memory-aware AI assistant.";

pub const ANSWER_USER: &str = r#"{memory_context}

Based on this memory context, answer:
"{question}"
Be specific and cite memory evidence."#;

/// Simple template interpolation for prompts.
///
/// Replaces `{key}` with the corresponding value.
#[must_use]
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{key}}}"), value);
    }
    result
}

/// Locate the outermost brace-delimited block in free-form model output.
///
/// Models like to wrap JSON in prose or code fences; this returns the slice
/// from the first `{` to the last `}` (inclusive), or `None` when there is
/// no such block.
#[must_use]
pub fn extract_json_block(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Truncate `text` to at most `max_chars` characters, on a char boundary.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_only_listed_keys() {
        let out = render_template(EXTRACTION_USER, &[("transcript", "Sarah works with Tom.")]);
        assert!(out.contains("Transcript: \"Sarah works with Tom.\""));
        assert!(out.contains("\"entities\": [{\"name\""));
        assert!(!out.contains("{transcript}"));
    }

    #[test]
    fn json_block_inside_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"entities\": [{\"name\": \"Tom\"}]}\n```\nAnything else?";
        assert_eq!(
            extract_json_block(raw),
            Some("{\"entities\": [{\"name\": \"Tom\"}]}")
        );
    }

    #[test]
    fn json_block_absent() {
        assert_eq!(extract_json_block("no json here"), None);
        assert_eq!(extract_json_block("} backwards {"), None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("short", 500), "short");
        assert_eq!(truncate_chars("", 3), "");
    }
}
