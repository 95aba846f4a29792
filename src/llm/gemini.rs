//! Hosted Gemini `generateContent` client.
//!
//! One wrapper around the REST endpoint: buffered generation with function
//! declarations, and incremental generation via `streamGenerateContent`
//! with SSE framing. Transient transport failures get a small bounded
//! retry with exponential backoff; HTTP 4xx never retries.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::client::{LlmClient, FRAGMENT_CHANNEL_CAPACITY};
use super::types::{Completion, GenerationRequest, ToolCall, ToolDecl};
use super::LlmError;

const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Low temperature keeps answers factual against the patient record.
const TEMPERATURE: f64 = 0.3;

/// Retries for transient transport failures (connect errors, 5xx).
const MAX_RETRIES: u32 = 2;

/// Base delay for exponential backoff between retries.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str, timeout: Duration) -> Self {
        Self::with_base_url(DEFAULT_ENDPOINT, api_key, model, timeout)
    }

    /// Point the client at a different endpoint (tests use a local stub).
    pub fn with_base_url(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}:{}", self.base_url, self.model, method)
    }

    fn map_send_error(&self, err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout(self.timeout_secs)
        } else {
            LlmError::Http(err.to_string())
        }
    }

    /// POST a body, retrying transient failures with exponential backoff.
    async fn post_with_retry(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &GenerateBody,
    ) -> Result<reqwest::Response, LlmError> {
        let mut attempt = 0u32;
        loop {
            let result = self
                .client
                .post(url)
                .query(query)
                .header("x-goog-api-key", &self.api_key)
                .json(body)
                .send()
                .await;

            let error = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    let upstream = LlmError::Upstream {
                        status: status.as_u16(),
                        body: body_text,
                    };
                    if !status.is_server_error() {
                        return Err(upstream);
                    }
                    upstream
                }
                Err(e) if e.is_timeout() || e.is_connect() => self.map_send_error(e),
                Err(e) => return Err(self.map_send_error(e)),
            };

            if attempt >= MAX_RETRIES {
                return Err(error);
            }
            let delay = backoff_delay(attempt);
            tracing::warn!(error = %error, attempt, delay_ms = delay.as_millis() as u64,
                "Transient LLM failure, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Exponential backoff with jitter: `base * 2^attempt + [0, base/2)`.
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_BASE.as_millis() as u64 / 2);
    BACKOFF_BASE * 2u32.pow(attempt) + Duration::from_millis(jitter)
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody {
    contents: Vec<Content>,
    system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolsEntry>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            function_call: None,
            function_response: None,
        }
    }
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Serialize)]
struct WireFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolsEntry {
    function_declarations: Vec<ToolDecl>,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
}

fn build_body(request: &GenerationRequest) -> GenerateBody {
    let mut contents = vec![Content {
        role: Some("user"),
        parts: vec![Part::text(request.prompt.clone())],
    }];

    // Replay prior tool rounds so a re-invocation sees what its tools returned.
    for exchange in &request.tool_results {
        contents.push(Content {
            role: Some("model"),
            parts: vec![Part {
                text: None,
                function_call: Some(WireFunctionCall {
                    name: exchange.call.name.clone(),
                    args: exchange.call.arguments.clone(),
                }),
                function_response: None,
            }],
        });
        contents.push(Content {
            role: Some("user"),
            parts: vec![Part {
                text: None,
                function_call: None,
                function_response: Some(WireFunctionResponse {
                    name: exchange.call.name.clone(),
                    response: exchange.response.clone(),
                }),
            }],
        });
    }

    GenerateBody {
        contents,
        system_instruction: Content {
            role: None,
            parts: vec![Part::text(request.system.clone())],
        },
        tools: if request.tools.is_empty() {
            vec![]
        } else {
            vec![ToolsEntry {
                function_declarations: request.tools.clone(),
            }]
        },
        generation_config: GenerationConfig {
            temperature: TEMPERATURE,
        },
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    text: Option<String>,
    function_call: Option<CandidateFunctionCall>,
}

#[derive(Deserialize)]
struct CandidateFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

fn parse_completion(response: GenerateResponse) -> Result<Completion, LlmError> {
    let candidate = response.candidates.into_iter().next().ok_or(LlmError::EmptyResponse)?;
    let mut completion = Completion::default();

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text {
            completion.text.push_str(&text);
        }
        if let Some(call) = part.function_call {
            completion.tool_calls.push(ToolCall {
                name: call.name,
                arguments: call.args,
            });
        }
    }

    Ok(completion)
}

/// Extract the JSON payload from one SSE line, if it carries one.
fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim).filter(|d| !d.is_empty())
}

/// Concatenated text of a streamed frame, `None` when it carries none.
fn chunk_text(frame: GenerateResponse) -> Option<String> {
    let text: String = frame
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .filter_map(|p| p.text)
        .collect();
    (!text.is_empty()).then_some(text)
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Completion, LlmError> {
        let url = self.method_url("generateContent");
        let body = build_body(request);
        let response = self.post_with_retry(&url, &[], &body).await?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseParsing(e.to_string()))?;
        parse_completion(parsed)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        let url = self.method_url("streamGenerateContent");
        let body = build_body(request);
        let response = self.post_with_retry(&url, &[("alt", "sse")], &body).await?;

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Http(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim_end_matches('\r').to_string();
                    buffer.drain(..=newline);

                    let Some(data) = sse_data(&line) else { continue };
                    // Frames without text (usage metadata, keepalives) are
                    // skipped; only unparseable frames are errors.
                    let fragment = match serde_json::from_str::<GenerateResponse>(data) {
                        Ok(frame) => match chunk_text(frame) {
                            Some(text) => Ok(text),
                            None => continue,
                        },
                        Err(e) => Err(LlmError::ResponseParsing(e.to_string())),
                    };

                    // A closed receiver means the peer is gone: stop
                    // consuming upstream tokens immediately.
                    if tx.send(fragment).await.is_err() {
                        tracing::debug!("Stream consumer gone, aborting LLM stream");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
