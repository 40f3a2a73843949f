use super::{
    ChatMessage, CompletionEvent, CompletionRequest, CompletionService, CompletionStream, ContentBlock, FinalMessage,
    StopReason,
};
use crate::config::CompletionConfig;
use crate::errors::{AppError, AppResult};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

pub const API_VERSION: &str = "2023-06-01";

/// Messages API client that streams over server-sent events.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(config: &CompletionConfig) -> AppResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| AppError::Config("ANTHROPIC_API_KEY is not set".to_string()))?;
        let endpoint = Url::parse(&config.base_url)
            .and_then(|base| base.join("v1/messages"))
            .map_err(|err| AppError::Config(format!("invalid completion base URL: {}", err)))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_sec))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    pub fn request_body(&self, request: &CompletionRequest) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": request.system,
            "tools": request.tools,
            "messages": request.messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": true,
        })
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    json!({ "role": message.role, "content": message.content })
}

#[async_trait]
impl CompletionService for AnthropicClient {
    async fn stream(&self, request: CompletionRequest) -> AppResult<CompletionStream> {
        let builder = self
            .http
            .post(self.endpoint.clone())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.request_body(&request));
        let mut source = EventSource::new(builder)
            .map_err(|err| AppError::Completion(format!("failed to open completion stream: {}", err)))?;
        source.set_retry_policy(Box::new(Never));
        tracing::debug!(model = %self.model, messages = request.messages.len(), "completion stream opened");

        let state = SseState {
            source,
            accumulator: StreamAccumulator::default(),
            done: false,
        };
        let events = stream::unfold(state, next_batch)
            .map(stream::iter)
            .flatten()
            .boxed();
        Ok(events)
    }
}

struct SseState {
    source: EventSource,
    accumulator: StreamAccumulator,
    done: bool,
}

async fn next_batch(mut state: SseState) -> Option<(Vec<AppResult<CompletionEvent>>, SseState)> {
    if state.done {
        return None;
    }
    loop {
        let batch = match state.source.next().await {
            Some(Ok(Event::Open)) => continue,
            Some(Ok(Event::Message(message))) => match state.accumulator.ingest(&message.data) {
                Ok(events) if events.is_empty() && !state.accumulator.is_finished() => continue,
                Ok(events) => {
                    if state.accumulator.is_finished() {
                        state.done = true;
                    }
                    events.into_iter().map(Ok).collect()
                }
                Err(error) => {
                    state.done = true;
                    vec![Err(error)]
                }
            },
            None | Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                state.done = true;
                state.accumulator.finish().map(|()| Vec::new()).unwrap_or_else(|error| vec![Err(error)])
            }
            Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                state.done = true;
                let body = response.text().await.unwrap_or_default();
                vec![Err(AppError::Completion(format!("completion request failed with {}: {}", status, body)))]
            }
            Some(Err(error)) => {
                state.done = true;
                vec![Err(AppError::Completion(format!("completion stream failed: {}", error)))]
            }
        };
        if state.done {
            state.source.close();
        }
        return Some((batch, state));
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SseEvent {
    MessageStart,
    ContentBlockStart { index: usize, content_block: StartBlock },
    ContentBlockDelta { index: usize, delta: BlockDelta },
    ContentBlockStop { index: usize },
    MessageDelta { delta: MessageDeltaBody },
    MessageStop,
    Ping,
    Error { error: ErrorBody },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, input: Value, json: String },
    Skipped,
}

/// Folds raw stream events into text deltas and one assembled final message.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    blocks: Vec<PartialBlock>,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl StreamAccumulator {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consumes one event's `data` payload.
    pub fn ingest(&mut self, data: &str) -> AppResult<Vec<CompletionEvent>> {
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let event: SseEvent = serde_json::from_str(data)
            .map_err(|err| AppError::Completion(format!("malformed stream event: {}", err)))?;

        match event {
            SseEvent::MessageStart => {
                self.blocks.clear();
                self.stop_reason = None;
            }
            SseEvent::ContentBlockStart { index, content_block } => {
                let block = match content_block {
                    StartBlock::Text { text } => PartialBlock::Text(text),
                    StartBlock::ToolUse { id, name, input } => PartialBlock::ToolUse {
                        id,
                        name,
                        input,
                        json: String::new(),
                    },
                    StartBlock::Other => PartialBlock::Skipped,
                };
                if index > self.blocks.len() {
                    return Err(AppError::Completion(format!(
                        "content block {} started before block {}",
                        index,
                        self.blocks.len()
                    )));
                }
                if index == self.blocks.len() {
                    self.blocks.push(block);
                } else {
                    self.blocks[index] = block;
                }
            }
            SseEvent::ContentBlockDelta { index, delta } => match (self.blocks.get_mut(index), delta) {
                (Some(PartialBlock::Text(text)), BlockDelta::TextDelta { text: chunk }) => {
                    text.push_str(&chunk);
                    if !chunk.is_empty() {
                        return Ok(vec![CompletionEvent::TextDelta(chunk)]);
                    }
                }
                (Some(PartialBlock::ToolUse { json, .. }), BlockDelta::InputJsonDelta { partial_json }) => {
                    json.push_str(&partial_json);
                }
                (None, _) => {
                    return Err(AppError::Completion(format!("delta for unknown content block {}", index)));
                }
                _ => {}
            },
            SseEvent::ContentBlockStop { index } => {
                if let Some(PartialBlock::ToolUse { input, json, name, .. }) = self.blocks.get_mut(index) {
                    if !json.trim().is_empty() {
                        *input = serde_json::from_str(json).map_err(|err| {
                            AppError::Completion(format!("invalid input for tool {}: {}", name, err))
                        })?;
                    }
                    if input.is_null() {
                        *input = json!({});
                    }
                }
            }
            SseEvent::MessageDelta { delta } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
            }
            SseEvent::MessageStop => {
                self.finished = true;
                return Ok(vec![CompletionEvent::Completed(self.final_message())]);
            }
            SseEvent::Error { error } => {
                return Err(AppError::Completion(format!("{}: {}", error.kind, error.message)));
            }
            SseEvent::Ping | SseEvent::Unknown => {}
        }
        Ok(Vec::new())
    }

    /// Called when the transport ends; a stream without `message_stop` is a failure.
    pub fn finish(&self) -> AppResult<()> {
        if self.finished {
            Ok(())
        } else {
            Err(AppError::Completion("completion stream ended before message_stop".to_string()))
        }
    }

    fn final_message(&self) -> FinalMessage {
        let content = self
            .blocks
            .iter()
            .filter_map(|block| match block {
                PartialBlock::Text(text) => Some(ContentBlock::Text { text: text.clone() }),
                PartialBlock::ToolUse { id, name, input, .. } => Some(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: if input.is_null() { json!({}) } else { input.clone() },
                }),
                PartialBlock::Skipped => None,
            })
            .collect();
        FinalMessage {
            content,
            stop_reason: self.stop_reason.clone(),
        }
    }
}
