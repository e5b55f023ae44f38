use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde_json::{json, Value};

use super::{AiError, AiProvider, OverlayUpdate};
use crate::capture::encode::EncodedFrame;

const DEFAULT_RETRY_AFTER_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AzureVisionClient {
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
    /// When true, use `Authorization: Bearer` instead of `api-key` header.
    use_bearer: bool,
    max_output_tokens: u32,
}

impl AzureVisionClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            client: build_http_client(DEFAULT_REQUEST_TIMEOUT),
            use_bearer: false,
            max_output_tokens: 400,
        }
    }

    /// Bound every HTTP exchange, including the streamed body, by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_http_client(timeout);
        self
    }

    /// Create a client that uses Bearer token auth (for Entra ID / AAD).
    pub fn with_bearer(mut self) -> Self {
        self.use_bearer = true;
        self
    }

    fn responses_url(&self) -> String {
        format!(
            "{}/openai/v1/responses?api-version=preview",
            self.endpoint.trim_end_matches('/'),
        )
    }

    fn build_request_body(&self, frame: &EncodedFrame, system_prompt: &str) -> Value {
        json!({
            "model": self.model,
            "input": [
                {
                    "type": "message",
                    "role": "user",
                    "content": [
                        { "type": "input_text", "text": ANALYSIS_REQUEST },
                        { "type": "input_image", "image_url": frame.data_url() }
                    ]
                }
            ],
            "instructions": system_prompt,
            "stream": true,
            "max_output_tokens": self.max_output_tokens,
            "truncation": "auto"
        })
    }
}

/// Appended to every frame so the reply can be parsed as an `OverlayUpdate`.
const ANALYSIS_REQUEST: &str = "Analyze this frame. Reply with a single JSON object using \
the keys stressLevel (0-100), criticalWarning, guidance, objectCount, warnings (array of \
strings) and confidence (0-1). Omit keys you cannot determine.";

#[async_trait]
impl AiProvider for AzureVisionClient {
    async fn analyze_frame(
        &self,
        frame: &EncodedFrame,
        system_prompt: &str,
    ) -> Result<OverlayUpdate, AiError> {
        let body = self.build_request_body(frame, system_prompt);

        let mut req = self
            .client
            .post(self.responses_url())
            .header("Content-Type", "application/json");

        req = if self.use_bearer {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        } else {
            req.header("api-key", &self.api_key)
        };

        let response = req
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::ConnectionError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".into());
            return Err(map_error_status(
                status.as_u16(),
                &error_body,
                retry_after.as_deref(),
            ));
        }

        let mut stream = ResponsesTextStream::new(response);
        let mut text = String::new();
        while let Some(chunk) = stream.next_chunk().await {
            text.push_str(&chunk?);
        }
        log::debug!("Vision reply complete ({} chars)", text.len());

        parse_overlay_update(&text)
    }

    fn name(&self) -> &str {
        "azure-openai-vision"
    }
}

fn build_http_client(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        log::warn!("Falling back to default HTTP client: {}", e);
        Client::new()
    })
}

/// Map a non-success HTTP status onto the error taxonomy.
fn map_error_status(status: u16, body: &str, retry_after: Option<&str>) -> AiError {
    match status {
        401 | 403 => AiError::AuthError(body.to_string()),
        429 if body.contains("insufficient_quota") => AiError::QuotaExceeded(body.to_string()),
        429 => AiError::RateLimited {
            retry_after_ms: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(DEFAULT_RETRY_AFTER_MS),
        },
        500..=599 => AiError::ModelError(format!("HTTP {}: {}", status, body)),
        _ => AiError::ConnectionError(format!("HTTP {}: {}", status, body)),
    }
}

/// Parse the model's accumulated reply into an `OverlayUpdate`.
///
/// Models like to wrap JSON in a fenced code block even when told not to,
/// so a surrounding fence is stripped first.
pub fn parse_overlay_update(text: &str) -> Result<OverlayUpdate, AiError> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    if unfenced.is_empty() {
        return Err(AiError::InvalidResponse("empty reply".into()));
    }

    serde_json::from_str(unfenced)
        .map_err(|e| AiError::InvalidResponse(format!("reply is not an overlay object: {}", e)))
}

/// Raw bytes from the wire, split into complete lines before decoding so a
/// UTF-8 sequence cut across two chunks survives intact.
#[derive(Debug, Default)]
struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line[..pos]);
        Some(text.trim_end_matches('\r').to_string())
    }

    /// Whatever is left after the stream ends, without a trailing newline.
    fn take_rest(&mut self) -> String {
        let rest = std::mem::take(&mut self.bytes);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

/// Streaming SSE reader for Azure OpenAI Responses API
struct ResponsesTextStream {
    buffer: LineBuffer,
    done: bool,
    response: Option<reqwest::Response>,
}

impl ResponsesTextStream {
    fn new(response: reqwest::Response) -> Self {
        Self {
            buffer: LineBuffer::default(),
            done: false,
            response: Some(response),
        }
    }

    /// Get the next text chunk. Returns None when the stream is complete.
    async fn next_chunk(&mut self) -> Option<Result<String, AiError>> {
        if self.done {
            return None;
        }

        loop {
            if let Some(line) = self.buffer.next_line() {
                if let Some(data) = line.strip_prefix("data: ") {
                    match parse_sse_data(data) {
                        ParseResult::Delta(text) => return Some(Ok(text)),
                        ParseResult::Done => {
                            self.done = true;
                            return None;
                        }
                        ParseResult::Skip => continue,
                        ParseResult::Error(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }

                // Skip blank and non-data SSE lines (comments, event:, id:, retry:)
                continue;
            }

            let response = match self.response.as_mut() {
                Some(r) => r,
                None => {
                    self.done = true;
                    return None;
                }
            };

            match response.chunk().await {
                Ok(Some(bytes)) => {
                    self.buffer.push(&bytes);
                }
                Ok(None) => {
                    self.done = true;
                    let remaining = self.buffer.take_rest();
                    return match remaining.trim().strip_prefix("data: ").map(parse_sse_data) {
                        Some(ParseResult::Delta(text)) => Some(Ok(text)),
                        Some(ParseResult::Error(e)) => Some(Err(e)),
                        _ => None,
                    };
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(AiError::ConnectionError(format!(
                        "Stream read error: {}",
                        e
                    ))));
                }
            }
        }
    }
}

/// Outcome of parsing a single SSE `data:` payload from the Responses API.
#[derive(Debug)]
enum ParseResult {
    Delta(String),
    Done,
    Skip,
    Error(AiError),
}

fn parse_sse_data(data: &str) -> ParseResult {
    let trimmed = data.trim();
    if trimmed == "[DONE]" {
        return ParseResult::Done;
    }

    let parsed: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            return ParseResult::Error(AiError::InvalidResponse(format!(
                "Invalid JSON in SSE: {}",
                e
            )));
        }
    };

    let event_type = parsed.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "response.output_text.delta" => {
            let delta = parsed.get("delta").and_then(|d| d.as_str()).unwrap_or("");
            if delta.is_empty() {
                ParseResult::Skip
            } else {
                ParseResult::Delta(delta.to_string())
            }
        }
        "response.output_text.done" | "response.completed" => ParseResult::Done,
        "response.failed" | "error" => {
            let message = parsed
                .pointer("/response/error/message")
                .or_else(|| parsed.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("model reported a failure");
            ParseResult::Error(AiError::ModelError(message.to_string()))
        }
        _ => ParseResult::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> EncodedFrame {
        EncodedFrame {
            data: "base64data".into(),
            width: 1024,
            height: 768,
            byte_len: 10,
        }
    }

    #[test]
    fn test_request_body_structure() {
        let client = AzureVisionClient::new("https://test.openai.azure.com", "test-key", "gpt-4o");

        let body = client.build_request_body(&frame(), "You are helpful.");

        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["max_output_tokens"], json!(400));
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["instructions"], "You are helpful.");
        assert!(body.get("previous_response_id").is_none());

        let input = body["input"].as_array().unwrap();
        assert_eq!(input.len(), 1);
        let content = input[0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "input_text");
        assert!(content[0]["text"].as_str().unwrap().contains("stressLevel"));
        assert_eq!(content[1]["type"], "input_image");
        assert_eq!(content[1]["image_url"], "data:image/jpeg;base64,base64data");
    }

    #[test]
    fn test_parse_sse_data_delta() {
        let data = r#"{"type":"response.output_text.delta","output_index":0,"delta":"{\"stress"}"#;
        match parse_sse_data(data) {
            ParseResult::Delta(text) => assert_eq!(text, "{\"stress"),
            other => panic!("expected Delta, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_sse_data_done_variants() {
        assert!(matches!(parse_sse_data("[DONE]"), ParseResult::Done));
        assert!(matches!(
            parse_sse_data(r#"{"type":"response.completed","response":{"id":"r"}}"#),
            ParseResult::Done
        ));
        assert!(matches!(
            parse_sse_data(r#"{"type":"response.output_text.done","text":"{}"}"#),
            ParseResult::Done
        ));
    }

    #[test]
    fn test_parse_sse_data_failed_is_model_error() {
        let data = r#"{"type":"response.failed","response":{"error":{"message":"content filtered"}}}"#;
        match parse_sse_data(data) {
            ParseResult::Error(AiError::ModelError(msg)) => assert_eq!(msg, "content filtered"),
            other => panic!("expected ModelError, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_sse_data_unknown_event_skipped() {
        let data = r#"{"type":"response.output_item.added","item":{}}"#;
        assert!(matches!(parse_sse_data(data), ParseResult::Skip));
    }

    #[test]
    fn test_parse_sse_data_invalid_json() {
        assert!(matches!(
            parse_sse_data("not valid json{{{"),
            ParseResult::Error(AiError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_overlay_update_plain_and_fenced() {
        let plain = parse_overlay_update(r#"{"stressLevel": 12, "objectCount": 2}"#).unwrap();
        assert_eq!(plain.stress_level, Some(12.0));
        assert_eq!(plain.object_count, Some(2));

        let fenced = "```json\n{\"criticalWarning\": \"Loose panel\"}\n```";
        let update = parse_overlay_update(fenced).unwrap();
        assert_eq!(update.critical_warning.as_deref(), Some("Loose panel"));
    }

    #[test]
    fn test_parse_overlay_update_rejects_prose() {
        assert!(matches!(
            parse_overlay_update("I see a kitchen."),
            Err(AiError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_overlay_update("   "),
            Err(AiError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_error_status_mapping() {
        assert!(matches!(map_error_status(401, "no", None), AiError::AuthError(_)));
        assert!(matches!(map_error_status(403, "no", None), AiError::AuthError(_)));
        assert_eq!(
            map_error_status(429, "slow down", Some("3")),
            AiError::RateLimited { retry_after_ms: 3000 }
        );
        assert_eq!(
            map_error_status(429, "slow down", None),
            AiError::RateLimited { retry_after_ms: 1000 }
        );
        assert!(matches!(
            map_error_status(429, r#"{"code":"insufficient_quota"}"#, Some("3")),
            AiError::QuotaExceeded(_)
        ));
        assert!(matches!(map_error_status(503, "busy", None), AiError::ModelError(_)));
        assert!(matches!(map_error_status(404, "nope", None), AiError::ConnectionError(_)));
    }

    #[test]
    fn test_huge_retry_after_saturates() {
        assert_eq!(
            map_error_status(429, "slow down", Some("18446744073709551615")),
            AiError::RateLimited {
                retry_after_ms: u64::MAX
            }
        );
    }

    #[test]
    fn test_line_buffer_keeps_split_multibyte_chars() {
        let line = "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Stufe größer\"}\n";
        let bytes = line.as_bytes();
        // Cut inside the two-byte 'ö'.
        let cut = line.find('ö').unwrap() + 1;

        let mut buffer = LineBuffer::default();
        buffer.push(&bytes[..cut]);
        assert!(buffer.next_line().is_none());
        buffer.push(&bytes[cut..]);

        let decoded = buffer.next_line().unwrap();
        assert!(!decoded.contains('\u{FFFD}'));
        match parse_sse_data(decoded.strip_prefix("data: ").unwrap()) {
            ParseResult::Delta(text) => assert_eq!(text, "Stufe größer"),
            other => panic!("expected Delta, got {:?}", other),
        }
        assert!(buffer.next_line().is_none());
        assert_eq!(buffer.take_rest(), "");
    }

    #[test]
    fn test_line_buffer_strips_carriage_returns() {
        let mut buffer = LineBuffer::default();
        buffer.push(b"event: x\r\ndata: [DONE]\r\ntail");
        assert_eq!(buffer.next_line().as_deref(), Some("event: x"));
        assert_eq!(buffer.next_line().as_deref(), Some("data: [DONE]"));
        assert!(buffer.next_line().is_none());
        assert_eq!(buffer.take_rest(), "tail");
    }

    #[test]
    fn test_client_name() {
        let client = AzureVisionClient::new("https://test.openai.azure.com", "k", "d");
        assert_eq!(client.name(), "azure-openai-vision");
    }

    #[test]
    fn test_endpoint_url_construction() {
        let client = AzureVisionClient::new("https://steady.openai.azure.com/", "key", "gpt-4o");
        assert_eq!(
            client.responses_url(),
            "https://steady.openai.azure.com/openai/v1/responses?api-version=preview"
        );
    }
}
