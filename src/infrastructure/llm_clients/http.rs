//! Request plumbing shared by the chat and embedding clients.

use crate::domain::error::{AppError, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Provider error bodies are cut to this many characters before they reach
/// an error message.
const ERROR_BODY_LIMIT: usize = 300;

pub fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Posts `body` as JSON and decodes a JSON reply. `wrap` picks the error
/// variant. URLs are stripped from transport errors because some providers
/// take the API key as a query parameter.
pub async fn send_json<B, T>(
    request: RequestBuilder,
    body: &B,
    wrap: fn(String) -> AppError,
) -> Result<T>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| wrap(format!("Request failed: {}", e.without_url())))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(wrap(format!(
            "Provider returned {}: {}",
            status,
            truncate(&text, ERROR_BODY_LIMIT)
        )));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| wrap(format!("Unreadable provider response: {}", e.without_url())))
}

/// Joins a base URL and a path without doubling or dropping the slash.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://api.openai.com/v1/", "/embeddings"),
            "https://api.openai.com/v1/embeddings"
        );
        assert_eq!(
            join_url("http://localhost:11434", "api/embeddings"),
            "http://localhost:11434/api/embeddings"
        );
    }

    #[test]
    fn test_truncate_long_error_body() {
        let body = "x".repeat(400);
        let cut = truncate(&body, ERROR_BODY_LIMIT);
        assert_eq!(cut.len(), ERROR_BODY_LIMIT + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate("  short  ", ERROR_BODY_LIMIT), "short");
    }
}
