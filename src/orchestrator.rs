//! The per-turn completion and tool loop.

use crate::completion::{
    ChatMessage, ChatRole, CompletionEvent, CompletionRequest, CompletionService, ContentBlock, FinalMessage,
    ToolInvocation,
};
use crate::config::DEFAULT_MAX_TOOL_ROUNDS;
use crate::errors::{AppError, AppResult};
use crate::models::{Message, MessageRole, PromptMutation, StreamEvent, ToolContext, ToolResult};
use crate::prompt::{PromptBuilder, PromptContext};
use crate::tools::ToolRegistry;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Receives `text`, `tool_result` and `done` events as a turn progresses.
pub trait EventSink: Send {
    fn emit(&mut self, event: StreamEvent);
}

impl EventSink for Vec<StreamEvent> {
    fn emit(&mut self, event: StreamEvent) {
        self.push(event);
    }
}

/// Forwards events to a transport task; a dropped receiver means the caller stopped listening.
pub struct ChannelSink {
    tx: UnboundedSender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<StreamEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&mut self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event receiver dropped; continuing turn without forwarding");
        }
    }
}

/// Everything the loop needs to know about the conversation for one turn.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub tool: ToolContext,
    pub current_page: Option<String>,
    pub company_name: Option<String>,
    pub visitor_name: Option<String>,
    pub mutation: Option<PromptMutation>,
}

impl AgentContext {
    fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            current_page: self.current_page.as_deref(),
            company_name: self.company_name.as_deref(),
            visitor_name: self.visitor_name.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutput {
    /// Text of the terminal round.
    pub reply: String,
    /// Every tool result in execution order, displayed or not.
    pub tool_results: Vec<ToolResult>,
    pub tool_calls: Vec<ToolInvocation>,
}

pub struct Orchestrator {
    completion: Arc<dyn CompletionService>,
    tools: Arc<ToolRegistry>,
    prompts: Arc<PromptBuilder>,
    max_tool_rounds: usize,
}

impl Orchestrator {
    pub fn new(completion: Arc<dyn CompletionService>, tools: Arc<ToolRegistry>, prompts: Arc<PromptBuilder>) -> Self {
        Self {
            completion,
            tools,
            prompts,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    /// Tool rounds executed before further tool requests are ignored. At least one.
    pub fn with_max_tool_rounds(mut self, max_tool_rounds: usize) -> Self {
        self.max_tool_rounds = max_tool_rounds.max(1);
        self
    }

    /// Runs one visitor turn to a terminal reply.
    ///
    /// Completion failures abort the turn without emitting `done`; tool failures are fed
    /// back to the model as results.
    pub async fn run(
        &self,
        utterance: &str,
        history: &[Message],
        context: &AgentContext,
        sink: &mut dyn EventSink,
    ) -> AppResult<TurnOutput> {
        let system = self.prompts.build(context.mutation.as_ref(), &context.prompt_context());
        let tools = self.tools.specs();
        let mut messages = history_messages(history);
        messages.push(ChatMessage::text(ChatRole::User, utterance));

        let mut output = TurnOutput::default();
        let mut round = 0;
        loop {
            let request = CompletionRequest {
                system: system.clone(),
                tools: tools.clone(),
                messages: messages.clone(),
            };
            let (text, final_message) = self.stream_round(request, sink).await?;
            round += 1;

            let invocations = final_message.tool_invocations();
            let exhausted = round > self.max_tool_rounds;
            if exhausted && !invocations.is_empty() {
                tracing::warn!(
                    conversation_id = %context.tool.conversation_id,
                    max_tool_rounds = self.max_tool_rounds,
                    ignored = invocations.len(),
                    "tool round limit reached; closing turn without running further tools"
                );
            }
            if exhausted || !final_message.requests_tools() || invocations.is_empty() {
                output.reply = text;
                sink.emit(StreamEvent::Done);
                tracing::info!(
                    conversation_id = %context.tool.conversation_id,
                    rounds = round,
                    tool_calls = output.tool_calls.len(),
                    "turn completed"
                );
                return Ok(output);
            }

            let mut result_blocks = Vec::with_capacity(invocations.len());
            for invocation in &invocations {
                let result = self
                    .tools
                    .execute(&invocation.name, invocation.input.clone(), &context.tool)
                    .await;
                if result.should_display() {
                    sink.emit(StreamEvent::ToolResult { tool: result.clone() });
                }
                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: invocation.id.clone(),
                    content: serde_json::to_string(&result)?,
                });
                output.tool_results.push(result);
            }
            output.tool_calls.extend(invocations);

            messages.push(ChatMessage {
                role: ChatRole::Assistant,
                content: final_message.content,
            });
            messages.push(ChatMessage {
                role: ChatRole::User,
                content: result_blocks,
            });
        }
    }

    async fn stream_round(
        &self,
        request: CompletionRequest,
        sink: &mut dyn EventSink,
    ) -> AppResult<(String, FinalMessage)> {
        let mut stream = self.completion.stream(request).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event? {
                CompletionEvent::TextDelta(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    text.push_str(&chunk);
                    sink.emit(StreamEvent::Text { content: chunk });
                }
                CompletionEvent::Completed(message) => return Ok((text, message)),
            }
        }
        Err(AppError::Completion(
            "completion stream ended without a final message".to_string(),
        ))
    }
}

/// Stored turns as provider messages, skipping blank entries.
pub fn history_messages(history: &[Message]) -> Vec<ChatMessage> {
    history
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| {
            let role = match message.role {
                MessageRole::Visitor => ChatRole::User,
                MessageRole::Agent => ChatRole::Assistant,
            };
            ChatMessage::text(role, message.content.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionStream, StopReason, ToolSpec};
    use crate::tools::{CalculateRoiTool, ToolHandler};
    use async_trait::async_trait;
    use chrono::Utc;
    use futures::stream;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Round = Vec<Result<CompletionEvent, String>>;

    #[derive(Default)]
    struct Scripted {
        rounds: Mutex<VecDeque<Round>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(rounds: Vec<Round>) -> Self {
            Self {
                rounds: Mutex::new(rounds.into()),
                requests: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl CompletionService for Scripted {
        async fn stream(&self, request: CompletionRequest) -> AppResult<CompletionStream> {
            self.requests.lock().expect("lock").push(request);
            let round = self
                .rounds
                .lock()
                .expect("lock")
                .pop_front()
                .ok_or_else(|| AppError::Completion("no scripted round".to_string()))?;
            Ok(stream::iter(round.into_iter().map(|item| item.map_err(AppError::Completion))).boxed())
        }
    }

    struct Quiet;

    #[async_trait]
    impl ToolHandler for Quiet {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "quiet".to_string(),
                description: "records nothing visible".to_string(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn call(&self, _input: Value, _context: &ToolContext) -> ToolResult {
            ToolResult::ok(json!({"noted": true}), "noted", false)
        }
    }

    fn text(chunk: &str) -> Result<CompletionEvent, String> {
        Ok(CompletionEvent::TextDelta(chunk.to_string()))
    }

    fn done(content: Vec<ContentBlock>, stop: StopReason) -> Result<CompletionEvent, String> {
        Ok(CompletionEvent::Completed(FinalMessage {
            content,
            stop_reason: Some(stop),
        }))
    }

    fn tool_use(id: &str, name: &str, input: Value) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    fn orchestrator(script: Arc<Scripted>) -> Orchestrator {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculateRoiTool)).expect("roi");
        registry.register(Arc::new(Quiet)).expect("quiet");
        Orchestrator::new(script, Arc::new(registry), Arc::new(PromptBuilder::new("BASE")))
    }

    fn message(role: MessageRole, content: &str) -> Message {
        Message {
            id: "m".to_string(),
            conversation_id: "c".to_string(),
            role,
            content: content.to_string(),
            tool_calls: None,
            tool_results: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn plain_reply_streams_then_completes() {
        let script = Arc::new(Scripted::new(vec![vec![
            text("Hi "),
            text("there"),
            done(vec![ContentBlock::Text { text: "Hi there".to_string() }], StopReason::EndTurn),
        ]]));
        let orchestrator = orchestrator(script.clone());
        let history = vec![
            message(MessageRole::Visitor, "hello"),
            message(MessageRole::Agent, "   "),
            message(MessageRole::Agent, "welcome"),
        ];
        let context = AgentContext {
            current_page: Some("/pricing".to_string()),
            ..AgentContext::default()
        };

        let mut events = Vec::new();
        let output = orchestrator.run("what do you do?", &history, &context, &mut events).await.expect("turn");

        assert_eq!(output.reply, "Hi there");
        assert!(output.tool_results.is_empty());
        assert_eq!(
            events,
            vec![
                StreamEvent::Text { content: "Hi ".to_string() },
                StreamEvent::Text { content: "there".to_string() },
                StreamEvent::Done,
            ]
        );

        let requests = script.requests.lock().expect("lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 3);
        assert_eq!(requests[0].messages[2], ChatMessage::text(ChatRole::User, "what do you do?"));
        assert!(requests[0].system.starts_with("BASE"));
        assert!(requests[0].system.contains("The visitor is currently on: /pricing"));
        assert_eq!(requests[0].tools.len(), 2);
    }

    #[tokio::test]
    async fn tool_round_feeds_results_back_in_request_order() {
        let script = Arc::new(Scripted::new(vec![
            vec![
                text("Let me run the numbers."),
                done(
                    vec![
                        ContentBlock::Text { text: "Let me run the numbers.".to_string() },
                        tool_use("t1", "quiet", json!({})),
                        tool_use("t2", "calculate_roi", json!({"employeeCount": 1000})),
                        tool_use("t3", "launch_rockets", json!({})),
                    ],
                    StopReason::ToolUse,
                ),
            ],
            vec![
                text("That is $12.0 million."),
                done(
                    vec![ContentBlock::Text { text: "That is $12.0 million.".to_string() }],
                    StopReason::EndTurn,
                ),
            ],
        ]));
        let orchestrator = orchestrator(script.clone());

        let mut events = Vec::new();
        let output = orchestrator
            .run("ROI for 1000 people?", &[], &AgentContext::default(), &mut events)
            .await
            .expect("turn");

        assert_eq!(output.reply, "That is $12.0 million.");
        assert_eq!(output.tool_results.len(), 3);
        assert!(output.tool_results[0].success);
        assert!(output.tool_results[1].success);
        assert_eq!(output.tool_results[2].message, "Unknown tool: launch_rockets");
        assert_eq!(output.tool_calls.iter().map(|call| call.id.as_str()).collect::<Vec<_>>(), vec!["t1", "t2", "t3"]);

        assert_eq!(events.len(), 4);
        assert_eq!(events[0], StreamEvent::Text { content: "Let me run the numbers.".to_string() });
        match &events[1] {
            StreamEvent::ToolResult { tool } => assert_eq!(tool.data.as_ref().expect("data")["roiMultiple"], "480x"),
            other => panic!("expected tool result, got {:?}", other),
        }
        assert_eq!(events[3], StreamEvent::Done);

        let requests = script.requests.lock().expect("lock");
        let second = &requests[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].role, ChatRole::Assistant);
        assert_eq!(second[2].role, ChatRole::User);
        let ids: Vec<&str> = second[2]
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn upstream_failure_is_fatal_without_done() {
        let script = Arc::new(Scripted::new(vec![vec![text("Partial"), Err("overloaded".to_string())]]));
        let orchestrator = orchestrator(script);
        let mut events = Vec::new();
        let err = orchestrator
            .run("hi", &[], &AgentContext::default(), &mut events)
            .await
            .expect_err("should fail");
        assert!(err.is_upstream());
        assert!(!events.contains(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let script = Arc::new(Scripted::new(vec![vec![text("Hel")]]));
        let err = orchestrator(script)
            .run("hi", &[], &AgentContext::default(), &mut Vec::new())
            .await
            .expect_err("should fail");
        assert!(matches!(err, AppError::Completion(_)));
    }

    #[tokio::test]
    async fn tool_requests_past_the_round_limit_close_the_turn() {
        let mut rounds: Vec<Round> = (0..3)
            .map(|i| vec![done(vec![tool_use(&format!("t{}", i), "quiet", json!({}))], StopReason::ToolUse)])
            .collect();
        rounds.push(vec![
            text("Here is what I found."),
            done(
                vec![
                    ContentBlock::Text { text: "Here is what I found.".to_string() },
                    tool_use("t3", "quiet", json!({})),
                ],
                StopReason::ToolUse,
            ),
        ]);
        let script = Arc::new(Scripted::new(rounds));
        let mut events = Vec::new();
        let output = orchestrator(script.clone())
            .with_max_tool_rounds(3)
            .run("hi", &[], &AgentContext::default(), &mut events)
            .await
            .expect("turn completes");

        assert_eq!(output.reply, "Here is what I found.");
        assert_eq!(output.tool_results.len(), 3);
        assert_eq!(output.tool_calls.len(), 3);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert_eq!(script.requests.lock().expect("lock").len(), 4);
    }

    #[tokio::test]
    async fn many_tool_rounds_below_the_limit_reach_the_final_reply() {
        let mut rounds: Vec<Round> = (0..12)
            .map(|i| vec![done(vec![tool_use(&format!("t{}", i), "quiet", json!({}))], StopReason::ToolUse)])
            .collect();
        rounds.push(vec![
            text("All set."),
            done(vec![ContentBlock::Text { text: "All set.".to_string() }], StopReason::EndTurn),
        ]);
        let script = Arc::new(Scripted::new(rounds));
        let output = orchestrator(script)
            .run("hi", &[], &AgentContext::default(), &mut Vec::new())
            .await
            .expect("turn completes");
        assert_eq!(output.reply, "All set.");
        assert_eq!(output.tool_results.len(), 12);
    }

    #[tokio::test]
    async fn channel_sink_forwards_and_survives_a_closed_receiver() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        let script = Arc::new(Scripted::new(vec![
            vec![text("Hi"), done(vec![ContentBlock::Text { text: "Hi".to_string() }], StopReason::EndTurn)],
            vec![text("Again"), done(vec![ContentBlock::Text { text: "Again".to_string() }], StopReason::EndTurn)],
        ]));
        let orchestrator = orchestrator(script);

        orchestrator.run("hi", &[], &AgentContext::default(), &mut sink).await.expect("turn");
        assert_eq!(rx.recv().await, Some(StreamEvent::Text { content: "Hi".to_string() }));
        assert_eq!(rx.recv().await, Some(StreamEvent::Done));

        drop(rx);
        let output = orchestrator.run("again", &[], &AgentContext::default(), &mut sink).await.expect("turn");
        assert_eq!(output.reply, "Again");
    }

    #[tokio::test]
    async fn tool_use_without_invocations_is_terminal() {
        let script = Arc::new(Scripted::new(vec![vec![
            text("Done."),
            done(vec![ContentBlock::Text { text: "Done.".to_string() }], StopReason::ToolUse),
        ]]));
        let output = orchestrator(script)
            .run("hi", &[], &AgentContext::default(), &mut Vec::new())
            .await
            .expect("turn");
        assert_eq!(output.reply, "Done.");
    }
}
