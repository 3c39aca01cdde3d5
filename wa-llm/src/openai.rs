use crate::error::{LlmError, Result};
use crate::provider::{ChunkStream, CompletionProvider};
use crate::types::{CompletionRequest, Message, Part, Role, StreamChunk, ToolDefinition, Usage};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Streaming client for any endpoint speaking the OpenAI chat-completions
/// protocol.
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatProvider {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::InvalidInput(format!("http client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream> {
        let body = ChatRequest::new(&self.model, request);

        let mut builder = self.http.post(self.completions_url()).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let stream = futures_util::stream::unfold(
            (sse, StreamState::default()),
            |(mut sse, mut state)| async move {
                loop {
                    if let Some(chunk) = state.ready.pop_front() {
                        return Some((Ok(chunk), (sse, state)));
                    }
                    if state.finished {
                        return None;
                    }
                    match sse.as_mut().next().await {
                        Some(Ok(data)) => {
                            if let Err(e) = state.absorb(&data) {
                                state.finished = true;
                                return Some((Err(e), (sse, state)));
                            }
                        }
                        Some(Err(e)) => {
                            state.finished = true;
                            return Some((Err(e), (sse, state)));
                        }
                        None => {
                            // Some servers close without a [DONE] sentinel.
                            state.finish();
                        }
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Default)]
struct ToolCallState {
    id: Option<String>,
    name: Option<String>,
    started: bool,
    /// Argument fragments that arrived before the call could be announced.
    buffered: String,
}

#[derive(Debug, Default)]
struct StreamState {
    tool_calls: HashMap<u32, ToolCallState>,
    usage: Option<Usage>,
    ready: VecDeque<StreamChunk>,
    finished: bool,
}

impl StreamState {
    fn absorb(&mut self, data: &str) -> Result<()> {
        if data.trim() == "[DONE]" {
            self.finish();
            return Ok(());
        }

        let chunk: StreamResponseChunk = serde_json::from_str(data)
            .map_err(|e| LlmError::StreamParse(format!("chunk json error={e} data={data}")))?;

        if let Some(u) = chunk.usage {
            self.usage = Some(Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            self.ready.push_back(StreamChunk::Delta { content });
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let entry = self.tool_calls.entry(tc.index.unwrap_or(0)).or_default();
            if entry.id.is_none() {
                entry.id = tc.id;
            }
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            if entry.name.is_none() {
                entry.name = name;
            }

            if !entry.started {
                entry.buffered.push_str(&arguments);
                let (Some(id), Some(name)) = (entry.id.clone(), entry.name.clone()) else {
                    continue;
                };
                entry.started = true;
                self.ready.push_back(StreamChunk::ToolCallStart { id, name });
                if !entry.buffered.is_empty() {
                    self.ready.push_back(StreamChunk::ToolCallDelta {
                        arguments: std::mem::take(&mut entry.buffered),
                    });
                }
                continue;
            }

            if !arguments.is_empty() {
                self.ready.push_back(StreamChunk::ToolCallDelta { arguments });
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let usage = self.usage.clone().unwrap_or_default();
        self.ready.push_back(StreamChunk::Done { usage });
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl ChatRequest {
    fn new(model: &str, request: &CompletionRequest) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(WireMessage::plain("system", request.system_prompt.clone()));
        }
        let answered = answered_call_ids(&request.messages);
        for m in &request.messages {
            messages.extend(to_wire_messages(m, &answered));
        }
        let tools: Vec<WireTool> = request.tools.iter().map(to_wire_tool).collect();
        let tool_choice = (!tools.is_empty()).then(|| "auto".to_string());
        Self {
            model: model.to_string(),
            messages,
            tools,
            tool_choice,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: String,
    function: WireToolFunction,
}

#[derive(Debug, Serialize)]
struct WireToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_wire_tool(t: &ToolDefinition) -> WireTool {
    WireTool {
        r#type: "function".to_string(),
        function: WireToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl WireMessage {
    fn plain(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct WireToolCall {
    id: String,
    r#type: String,
    function: WireToolCallFunction,
}

#[derive(Debug, Serialize, PartialEq)]
struct WireToolCallFunction {
    name: String,
    arguments: String,
}

/// Call ids that have a matching action result somewhere in the conversation.
fn answered_call_ids(messages: &[Message]) -> HashSet<&str> {
    messages
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match p {
            Part::ActionResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect()
}

/// One conversation message can fan out into several wire messages: every
/// action result becomes its own `tool` message. Proposed actions that were
/// never answered (cancelled or discarded) are left out, since the API
/// rejects a tool call without a matching tool message.
fn to_wire_messages(m: &Message, answered: &HashSet<&str>) -> Vec<WireMessage> {
    let text = m.text();
    match m.role {
        Role::Model => {
            let tool_calls: Vec<WireToolCall> = m
                .proposed_actions()
                .filter(|a| answered.contains(a.id.as_str()))
                .map(|a| WireToolCall {
                    id: a.id.clone(),
                    r#type: "function".to_string(),
                    function: WireToolCallFunction {
                        name: a.name.clone(),
                        arguments: serde_json::Value::Object(a.args.clone()).to_string(),
                    },
                })
                .collect();
            if text.is_empty() && tool_calls.is_empty() {
                return Vec::new();
            }
            vec![WireMessage {
                role: "assistant".to_string(),
                content: Some(text).filter(|s| !s.is_empty()),
                tool_calls,
                tool_call_id: None,
            }]
        }
        Role::User => {
            let mut out = Vec::new();
            for part in &m.parts {
                if let Part::ActionResult {
                    call_id, result, ..
                } = part
                {
                    out.push(WireMessage {
                        role: "tool".to_string(),
                        content: Some(result.to_string()),
                        tool_calls: Vec::new(),
                        tool_call_id: Some(call_id.clone()),
                    });
                }
            }
            if !text.is_empty() {
                out.push(WireMessage::plain("user", text));
            }
            out
        }
    }
}

/// Position and length of the blank line ending the first complete event.
/// Accepts LF, CRLF and CR line endings.
fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    (0..buffer.len()).find_map(|i| {
        let rest = &buffer[i..];
        if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else if rest.starts_with(b"\n\n") || rest.starts_with(b"\r\r") {
            Some((i, 2))
        } else {
            None
        }
    })
}

/// Joined `data:` lines of one event, or `None` for comment-only events.
fn event_data(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let data: Vec<&str> = text
        .split(['\r', '\n'])
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

// Bytes stay raw until a whole event is buffered so multi-byte characters
// split across chunks decode intact.
fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, BytesMut::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some((idx, sep)) = event_boundary(&buffer) {
                    let raw = buffer.split_to(idx + sep);
                    match event_data(&raw[..idx]) {
                        Some(data) => return Some((Ok(data), (stream, buffer))),
                        None => continue,
                    }
                }

                match stream.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Unreachable(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

#[derive(Debug, Deserialize)]
struct StreamResponseChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamDeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamDeltaToolFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamDeltaToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProposedAction;
    use serde_json::json;

    fn drain(state: &mut StreamState) -> Vec<StreamChunk> {
        state.ready.drain(..).collect()
    }

    #[test]
    fn tool_call_arguments_in_first_fragment_are_not_lost() {
        let mut state = StreamState::default();
        state
            .absorb(
                &json!({"choices":[{"delta":{"tool_calls":[{
                    "index":0,"id":"call_1",
                    "function":{"name":"delete_asset","arguments":"{\"assetType\":"}
                }]}}]})
                .to_string(),
            )
            .expect("absorb first fragment");
        state
            .absorb(
                &json!({"choices":[{"delta":{"tool_calls":[{
                    "index":0,"function":{"arguments":"\"plugin\"}"}
                }]}}]})
                .to_string(),
            )
            .expect("absorb second fragment");
        state.absorb("[DONE]").expect("absorb done");

        let chunks = drain(&mut state);
        assert_eq!(chunks.len(), 4);
        assert!(matches!(
            &chunks[0],
            StreamChunk::ToolCallStart { id, name } if id == "call_1" && name == "delete_asset"
        ));
        let args: String = chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::ToolCallDelta { arguments } => Some(arguments.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(args, "{\"assetType\":\"plugin\"}");
        assert!(matches!(chunks[3], StreamChunk::Done { .. }));
    }

    async fn sse_of(chunks: Vec<Vec<u8>>) -> Vec<String> {
        let parts: Vec<std::result::Result<Bytes, reqwest::Error>> =
            chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
        decode_sse(futures_util::stream::iter(parts))
            .map(|e| e.unwrap())
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn characters_split_across_chunks_decode_intact() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n\n".as_bytes();
        let split = body.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let events = sse_of(vec![body[..split].to_vec(), body[split..].to_vec()]).await;
        assert_eq!(
            events,
            vec!["{\"choices\":[{\"delta\":{\"content\":\"café\"}}]}".to_string()]
        );
    }

    #[tokio::test]
    async fn crlf_framed_events_are_split() {
        let events = sse_of(vec![
            b": keep-alive\r\n\r\ndata: {\"a\":1}\r\n\r".to_vec(),
            b"\ndata: [DONE]\r\n\r\n".to_vec(),
        ])
        .await;
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn malformed_chunk_is_a_stream_parse_error() {
        let mut state = StreamState::default();
        let err = state.absorb("{not json").unwrap_err();
        assert!(matches!(err, LlmError::StreamParse(_)));
    }

    #[test]
    fn action_results_become_tool_messages() {
        let mut args = serde_json::Map::new();
        args.insert("assetType".to_string(), json!("plugin"));
        let model = Message::new(
            Role::Model,
            vec![Part::ProposedAction(ProposedAction {
                id: "call_9".to_string(),
                name: "list_assets".to_string(),
                args,
            })],
        );
        let result = Message::new(
            Role::User,
            vec![Part::ActionResult {
                call_id: "call_9".to_string(),
                name: "list_assets".to_string(),
                result: json!({"assets": []}),
            }],
        );

        let answered = answered_call_ids(std::slice::from_ref(&result));
        let wire_model = to_wire_messages(&model, &answered);
        assert_eq!(wire_model.len(), 1);
        assert_eq!(wire_model[0].role, "assistant");
        assert_eq!(wire_model[0].content, None);
        assert_eq!(wire_model[0].tool_calls[0].function.name, "list_assets");

        let wire_result = to_wire_messages(&result, &answered);
        assert_eq!(wire_result.len(), 1);
        assert_eq!(wire_result[0].role, "tool");
        assert_eq!(wire_result[0].tool_call_id.as_deref(), Some("call_9"));
    }

    #[test]
    fn system_prompt_leads_the_request() {
        let request = CompletionRequest {
            system_prompt: "be careful".to_string(),
            messages: vec![Message::user_text("hi")],
            tools: vec![],
        };
        let body = ChatRequest::new("gpt-test", &request);
        assert_eq!(body.messages[0].role, "system");
        assert_eq!(body.messages[1].content.as_deref(), Some("hi"));
        assert!(body.tool_choice.is_none());
    }

    #[test]
    fn unanswered_actions_are_dropped_from_the_wire() {
        let cancelled = Message::new(
            Role::Model,
            vec![Part::ProposedAction(ProposedAction {
                id: "call_cancelled".to_string(),
                name: "delete_asset".to_string(),
                args: serde_json::Map::new(),
            })],
        );
        let request = CompletionRequest {
            system_prompt: String::new(),
            messages: vec![
                Message::user_text("delete akismet"),
                cancelled,
                Message::model_text("Action delete_asset cancelled."),
                Message::user_text("never mind"),
            ],
            tools: vec![],
        };
        let body = ChatRequest::new("gpt-test", &request);
        let roles: Vec<&str> = body.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert!(body.messages.iter().all(|m| m.tool_calls.is_empty()));
    }
}
