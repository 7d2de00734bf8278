use once_cell::sync::Lazy;
use regex::Regex;

static THINK_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<think>[\s\S]*?</think>|<think\s*/>").unwrap());

static REASONING_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<reasoning>[\s\S]*?</reasoning>").unwrap());

static CODE_FENCE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").unwrap());

static MULTIPLE_NEWLINES_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Removes reasoning blocks some models emit before their answer.
pub fn clean_llm_response(response: &str) -> String {
    let cleaned = THINK_TAG_PATTERN.replace_all(response, "");
    let cleaned = REASONING_TAG_PATTERN.replace_all(&cleaned, "");
    let cleaned = cleaned.trim();
    MULTIPLE_NEWLINES_PATTERN
        .replace_all(cleaned, "\n\n")
        .to_string()
}

/// Returns the body of the first fenced block, or the whole text when there is none.
pub fn unwrap_code_fence(response: &str) -> String {
    match CODE_FENCE_PATTERN.captures(response) {
        Some(caps) => caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        None => response.trim().to_string(),
    }
}

/// Cleanup applied to every generator reply before it is parsed.
pub fn clean_generated_sql(response: &str) -> String {
    let body = unwrap_code_fence(&clean_llm_response(response));
    body.trim().trim_end_matches(';').trim_end().to_string()
}
