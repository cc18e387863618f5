//! The agent loop: recursive chat + tool dispatch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::client::{Client, Error};
use crate::model::{ChatRequest, Message, Thinking, ToolCall, Usage};
use crate::tool::{Tool, ToolSchema};

/// A streaming chunk or final response from the agent.
///
/// During streaming: partial content/thinking deltas, tool calls as they
/// are issued, and tool results as they complete. When `done` is set, the
/// event carries the complete accumulated content and thinking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub content: String,
    pub thinking: String,
    /// Non-nil when the model requested a tool call.
    pub tool: Option<ToolCall>,
    /// Non-nil after a locally-run tool produced output.
    pub tool_result: Option<ToolResult>,
    pub done: bool,
}

/// Echo of a completed tool run, paired to its call by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub content: String,
}

impl Event {
    fn content_delta(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            ..Self::default()
        }
    }

    fn thinking_delta(text: impl Into<String>) -> Self {
        Self {
            thinking: text.into(),
            ..Self::default()
        }
    }
}

/// Drives chat turns to completion, executing tools in between.
///
/// The conversation history is owned by the agent: it starts empty (or
/// seeded through the builder), is appended to by the loop, and can be
/// cleared explicitly.
pub struct Agent {
    client: Arc<Client>,
    provider: Option<String>,
    model: String,
    thinking: Thinking,
    tools: Vec<Arc<dyn Tool>>,
    max_steps: usize,
    messages: RwLock<Vec<Message>>,
    usage: Mutex<Option<Usage>>,
}

pub struct AgentBuilder {
    client: Arc<Client>,
    provider: Option<String>,
    model: String,
    thinking: Thinking,
    tools: Vec<Arc<dyn Tool>>,
    messages: Vec<Message>,
    max_steps: usize,
}

impl AgentBuilder {
    /// Route requests to a specific provider instead of resolving the
    /// model against every provider's listing.
    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn thinking(mut self, level: Thinking) -> Self {
        self.thinking = level;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// Seed the conversation history.
    pub fn messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    /// Bound the number of provider turns per chat call. Zero means
    /// unlimited.
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            client: self.client,
            provider: self.provider,
            model: self.model,
            thinking: self.thinking,
            tools: self.tools,
            max_steps: self.max_steps,
            messages: RwLock::new(self.messages),
            usage: Mutex::new(None),
        }
    }
}

impl Agent {
    pub fn builder(client: Arc<Client>) -> AgentBuilder {
        AgentBuilder {
            client,
            provider: None,
            model: String::new(),
            thinking: Thinking::default(),
            tools: Vec::new(),
            messages: Vec::new(),
            max_steps: 0,
        }
    }

    /// A snapshot of the conversation history.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.read().expect("messages lock poisoned").clone()
    }

    /// The most recent token usage reported by the provider, if any.
    pub fn usage(&self) -> Option<Usage> {
        *self.usage.lock().expect("usage lock poisoned")
    }

    /// Reset the conversation history.
    pub fn clear(&self) {
        self.messages.write().expect("messages lock poisoned").clear();
        *self.usage.lock().expect("usage lock poisoned") = None;
    }

    fn push(&self, message: Message) {
        self.messages.write().expect("messages lock poisoned").push(message);
    }

    /// Send a message and stream back events.
    ///
    /// Handles the tool loop internally: tool calls issued within one turn
    /// run in parallel, their results are appended to the history in call
    /// order, and the conversation continues until the model finishes a
    /// turn without calling a tool (or the step bound is hit). The final
    /// event has `done = true` and carries the accumulated content and
    /// thinking. Dropping the stream cancels the in-flight request and any
    /// running tools.
    pub fn chat(&self, prompt: impl Into<String>) -> impl Stream<Item = Result<Event, Error>> + '_ {
        let prompt = prompt.into();
        try_stream! {
            self.push(Message::user(prompt));

            let schemas: Vec<ToolSchema> = self.tools.iter().map(|t| t.schema()).collect();
            let mut catalog: HashMap<String, Arc<dyn Tool>> = HashMap::new();
            for (tool, schema) in self.tools.iter().zip(&schemas) {
                catalog.insert(schema.function.name.clone(), tool.clone());
            }

            let mut total_content = String::new();
            let mut total_thinking = String::new();
            let mut step = 0usize;

            loop {
                step += 1;
                debug!(step, model = %self.model, "agent: requesting turn");

                let req = ChatRequest {
                    model: self.model.clone(),
                    thinking: self.thinking,
                    tools: schemas.clone(),
                    messages: self.messages(),
                };

                let mut turn_content = String::new();
                let mut turn_thinking = String::new();
                let mut calls: Vec<ToolCall> = Vec::new();
                let mut batch: Batch<Message> = Batch::new();

                {
                    let stream = self.client.chat(self.provider.as_deref(), req);
                    futures::pin_mut!(stream);
                    while let Some(response) = stream.next().await {
                        let response = response?;

                        if !response.thinking.is_empty() {
                            turn_thinking.push_str(&response.thinking);
                            total_thinking.push_str(&response.thinking);
                            yield Event::thinking_delta(response.thinking);
                        }

                        if !response.content.is_empty() {
                            // Separate the thinking block from the answer.
                            if turn_content.is_empty() && !turn_thinking.is_empty() {
                                total_content.push_str("\n\n");
                                yield Event::content_delta("\n\n");
                            }
                            turn_content.push_str(&response.content);
                            total_content.push_str(&response.content);
                            yield Event::content_delta(response.content);
                        }

                        if let Some(call) = response.tool_call {
                            yield Event {
                                tool: Some(call.clone()),
                                ..Event::default()
                            };
                            let tool = catalog.get(&call.name).cloned();
                            if tool.is_none() {
                                warn!(tool = %call.name, "agent: model called unknown tool");
                            }
                            let scheduled = call.clone();
                            batch.spawn(async move { Ok(run_tool(tool, scheduled).await) });
                            calls.push(call);
                        }

                        if let Some(usage) = response.usage {
                            *self.usage.lock().expect("usage lock poisoned") = Some(usage);
                        }

                        if response.done {
                            break;
                        }
                    }
                }

                // Record the assistant turn. With tool calls, each call gets
                // its own assistant message; the first also carries the
                // turn's content and thinking.
                if calls.is_empty() {
                    self.push(
                        Message::assistant(turn_content.clone()).with_thinking(turn_thinking.clone()),
                    );
                    yield Event {
                        content: total_content.clone(),
                        thinking: total_thinking.clone(),
                        done: true,
                        ..Event::default()
                    };
                    return;
                }

                for (index, call) in calls.iter().enumerate() {
                    let mut message = if index == 0 {
                        Message::assistant(turn_content.clone()).with_thinking(turn_thinking.clone())
                    } else {
                        Message::assistant("")
                    };
                    message.tool_call = Some(call.clone());
                    self.push(message);
                }

                // A batch failure does not end the chat: every scheduled
                // call still gets a result message so the model can
                // recover on the next turn.
                let results = match batch.wait().await {
                    Ok(results) => results,
                    Err(err) => {
                        warn!(%err, "agent: tool batch failed");
                        calls
                            .iter()
                            .map(|call| Message::tool(call.id.clone(), format!("Error: {err}")))
                            .collect()
                    }
                };
                for (call, message) in calls.iter().zip(results) {
                    yield Event {
                        tool_result: Some(ToolResult {
                            id: message.tool_call_id.clone(),
                            name: call.name.clone(),
                            content: message.content.clone(),
                        }),
                        ..Event::default()
                    };
                    self.push(message);
                }

                if self.max_steps > 0 && step >= self.max_steps {
                    debug!(max_steps = self.max_steps, "agent: step limit reached");
                    yield Event {
                        content: total_content.clone(),
                        thinking: total_thinking.clone(),
                        done: true,
                        ..Event::default()
                    };
                    return;
                }

                // Readability separator between a tool turn and the next
                // assistant output.
                if !turn_content.is_empty() {
                    total_content.push_str("\n\n");
                    yield Event::content_delta("\n\n");
                }
            }
        }
    }
}

async fn run_tool(tool: Option<Arc<dyn Tool>>, call: ToolCall) -> Message {
    let Some(tool) = tool else {
        return Message::tool(
            call.id,
            format!("Error: {}", Error::UnknownTool(call.name.clone())),
        );
    };
    debug!(tool = %call.name, args = %call.arguments, "agent: running tool");
    match tool.run(&call.arguments).await {
        Ok(output) => Message::tool(call.id, output),
        Err(err) => Message::tool(call.id, format!("Error: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatResponse, Model, Role};
    use crate::provider::{ChatStream, Provider};
    use crate::tool::{func, Parameters, Property};
    use async_stream::try_stream;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted provider: each chat call plays back the next turn's deltas.
    struct Scripted {
        turns: Mutex<VecDeque<Vec<ChatResponse>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl Scripted {
        fn new(turns: Vec<Vec<ChatResponse>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn models(&self) -> Result<Vec<Model>, Error> {
            Ok(vec![Model {
                provider: "scripted".to_string(),
                id: "test-model".to_string(),
                meta: None,
            }])
        }

        fn chat(&self, req: ChatRequest) -> ChatStream<'_> {
            self.requests.lock().expect("lock").push(req);
            let turn = self
                .turns
                .lock()
                .expect("lock")
                .pop_front();
            Box::pin(try_stream! {
                let turn = turn.ok_or_else(|| Error::Provider("script exhausted".to_string()))?;
                for response in turn {
                    yield response;
                }
            })
        }
    }

    fn agent_for(provider: Arc<Scripted>) -> AgentBuilder {
        let client = Arc::new(Client::new(vec![provider as Arc<dyn Provider>]));
        Agent::builder(client).model("test-model")
    }

    #[derive(Deserialize)]
    struct Pair {
        a: i64,
        b: i64,
    }

    fn add_tool() -> Arc<dyn Tool> {
        func(
            "add",
            "adds two numbers",
            Parameters::new()
                .property("a", Property::integer().required())
                .property("b", Property::integer().required()),
            |input: Pair| async move {
                // Finish after multiply even when scheduled first.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(input.a + input.b)
            },
        )
    }

    fn multiply_tool() -> Arc<dyn Tool> {
        func(
            "multiply",
            "multiplies two numbers",
            Parameters::new()
                .property("a", Property::integer().required())
                .property("b", Property::integer().required()),
            |input: Pair| async move { Ok(input.a * input.b) },
        )
    }

    #[derive(Deserialize)]
    struct SecretIn {
        #[serde(default)]
        secret: String,
    }

    fn secret_word_tool() -> Arc<dyn Tool> {
        func(
            "secret_word",
            "returns the secret word",
            Parameters::new().property("secret", Property::string().required()),
            |input: SecretIn| async move {
                if input.secret != "noodles" {
                    return Err(Error::Tool {
                        tool: "secret_word".to_string(),
                        message: "wrong guess, the secret is noodles".to_string(),
                    });
                }
                Ok("noodles".to_string())
            },
        )
    }

    #[derive(Deserialize)]
    struct NoArgs {}

    fn panicking_tool() -> Arc<dyn Tool> {
        func(
            "explode",
            "always panics",
            Parameters::new(),
            |_: NoArgs| async move {
                if true {
                    panic!("tool exploded");
                }
                Ok(String::new())
            },
        )
    }

    fn call(id: &str, name: &str, args: &str) -> ToolCall {
        ToolCall::new(id, name, args)
    }

    async fn collect(agent: &Agent, prompt: &str) -> Vec<Event> {
        let stream = agent.chat(prompt);
        futures::pin_mut!(stream);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.expect("event"));
        }
        events
    }

    #[tokio::test]
    async fn simple_content_turn() {
        let provider = Scripted::new(vec![vec![
            ChatResponse::content("4"),
            ChatResponse::done(),
        ]]);
        let agent = agent_for(provider).build();

        let events = collect(&agent, "What is 2+2? Reply with just the number.").await;
        let last = events.last().expect("final event");
        assert!(last.done);
        assert!(last.content.contains('4'));

        let history = agent.messages();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "4");
    }

    #[tokio::test]
    async fn single_tool_call() {
        let provider = Scripted::new(vec![
            vec![
                ChatResponse::tool_call(call("call_1", "add", r#"{"a":17,"b":25}"#)),
                ChatResponse::done(),
            ],
            vec![ChatResponse::content("The result is 42."), ChatResponse::done()],
        ]);
        let agent = agent_for(provider.clone()).tool(add_tool()).build();

        let events = collect(&agent, "Use add to add 17 and 25.").await;

        let tool_events: Vec<_> = events.iter().filter_map(|e| e.tool.as_ref()).collect();
        assert_eq!(tool_events.len(), 1);
        assert_eq!(tool_events[0].name, "add");
        assert_eq!(tool_events[0].arguments, r#"{"a":17,"b":25}"#);

        let result_events: Vec<_> = events.iter().filter_map(|e| e.tool_result.as_ref()).collect();
        assert_eq!(result_events.len(), 1);
        assert_eq!(result_events[0].content, "42");

        assert!(events.last().expect("final").content.contains("42"));

        // Tool id echo: exactly one tool message answers call_1.
        let history = agent.messages();
        let answers: Vec<_> = history
            .iter()
            .filter(|m| m.role == Role::Tool && m.tool_call_id == "call_1")
            .collect();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].content, "42");

        // The second request sees the tool result.
        let requests = provider.requests.lock().expect("lock");
        assert_eq!(requests.len(), 2);
        assert!(requests[1].messages.iter().any(|m| m.role == Role::Tool));
    }

    #[tokio::test]
    async fn parallel_tools_keep_call_order() {
        let provider = Scripted::new(vec![
            vec![
                ChatResponse::tool_call(call("c1", "add", r#"{"a":10,"b":5}"#)),
                ChatResponse::tool_call(call("c2", "multiply", r#"{"a":3,"b":4}"#)),
                ChatResponse::done(),
            ],
            vec![
                ChatResponse::content("add gave 15 and multiply gave 12"),
                ChatResponse::done(),
            ],
        ]);
        let agent = agent_for(provider)
            .tool(add_tool())
            .tool(multiply_tool())
            .build();

        let events = collect(&agent, "add 10 and 5, and multiply 3 and 4").await;

        // add sleeps 50ms, multiply returns instantly; results still arrive
        // in call order.
        let results: Vec<_> = events
            .iter()
            .filter_map(|e| e.tool_result.as_ref())
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!((results[0].id.as_str(), results[0].content.as_str()), ("c1", "15"));
        assert_eq!((results[1].id.as_str(), results[1].content.as_str()), ("c2", "12"));

        let last = events.last().expect("final");
        assert!(last.content.contains("15") && last.content.contains("12"));

        // History: tool results in call order too.
        let history = agent.messages();
        let tool_ids: Vec<_> = history
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_call_id.clone())
            .collect();
        assert_eq!(tool_ids, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn serial_tools_across_turns() {
        let provider = Scripted::new(vec![
            vec![
                ChatResponse::tool_call(call("c1", "add", r#"{"a":10,"b":5}"#)),
                ChatResponse::done(),
            ],
            vec![
                ChatResponse::tool_call(call("c2", "multiply", r#"{"a":15,"b":2}"#)),
                ChatResponse::done(),
            ],
            vec![ChatResponse::content("30"), ChatResponse::done()],
        ]);
        let agent = agent_for(provider.clone())
            .tool(add_tool())
            .tool(multiply_tool())
            .build();

        let events = collect(&agent, "First add 10 and 5. Then multiply the result by 2.").await;
        assert!(events.last().expect("final").content.contains("30"));

        let requests = provider.requests.lock().expect("lock");
        assert_eq!(requests.len(), 3);
    }

    #[tokio::test]
    async fn tool_failure_is_fed_back() {
        let provider = Scripted::new(vec![
            vec![
                ChatResponse::tool_call(call("c1", "secret_word", r#"{"secret":"pasta"}"#)),
                ChatResponse::done(),
            ],
            vec![
                ChatResponse::tool_call(call("c2", "secret_word", r#"{"secret":"noodles"}"#)),
                ChatResponse::done(),
            ],
            vec![
                ChatResponse::content("The secret word is noodles."),
                ChatResponse::done(),
            ],
        ]);
        let agent = agent_for(provider).tool(secret_word_tool()).build();

        let events = collect(&agent, "Use secret_word to return the secret word").await;

        let results: Vec<_> = events
            .iter()
            .filter_map(|e| e.tool_result.as_ref())
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].content.starts_with("Error: "));
        assert!(results[0].content.contains("the secret is noodles"));
        assert_eq!(results[1].content, "\"noodles\"");

        assert!(events.last().expect("final").content.contains("noodles"));
    }

    #[tokio::test]
    async fn unknown_tool_recovers() {
        let provider = Scripted::new(vec![
            vec![
                ChatResponse::tool_call(call("c1", "nope", "{}")),
                ChatResponse::done(),
            ],
            vec![ChatResponse::content("ok"), ChatResponse::done()],
        ]);
        let agent = agent_for(provider).build();

        let events = collect(&agent, "call something odd").await;
        let results: Vec<_> = events
            .iter()
            .filter_map(|e| e.tool_result.as_ref())
            .collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].content.contains("unknown tool"));
        assert!(results[0].content.starts_with("Error: "));
        assert!(events.last().expect("final").done);
    }

    #[tokio::test]
    async fn batch_failure_is_recovered() {
        let provider = Scripted::new(vec![
            vec![
                ChatResponse::tool_call(call("c1", "explode", "{}")),
                ChatResponse::done(),
            ],
            vec![ChatResponse::content("recovered"), ChatResponse::done()],
        ]);
        let agent = agent_for(provider).tool(panicking_tool()).build();

        let events = collect(&agent, "go").await;

        // The panicked task still produces a result event and message, and
        // the loop keeps going instead of ending the stream.
        let results: Vec<_> = events
            .iter()
            .filter_map(|e| e.tool_result.as_ref())
            .collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "c1");
        assert!(results[0].content.starts_with("Error: "));

        let last = events.last().expect("final");
        assert!(last.done);
        assert!(last.content.contains("recovered"));

        let history = agent.messages();
        assert!(history
            .iter()
            .any(|m| m.role == Role::Tool && m.tool_call_id == "c1"));
    }

    #[tokio::test]
    async fn thinking_then_content_gets_separator() {
        let provider = Scripted::new(vec![vec![
            ChatResponse::thinking("pondering"),
            ChatResponse::content("answer"),
            ChatResponse::done(),
        ]]);
        let agent = agent_for(provider).build();

        let events = collect(&agent, "think first").await;
        let contents: Vec<_> = events
            .iter()
            .filter(|e| !e.content.is_empty() && !e.done)
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(contents, vec!["\n\n", "answer"]);

        let last = events.last().expect("final");
        assert_eq!(last.thinking, "pondering");
        assert_eq!(last.content, "\n\nanswer");
    }

    #[tokio::test]
    async fn step_limit_terminates_loop() {
        let provider = Scripted::new(vec![vec![
            ChatResponse::tool_call(call("c1", "add", r#"{"a":1,"b":1}"#)),
            ChatResponse::done(),
        ]]);
        let agent = agent_for(provider).tool(add_tool()).max_steps(1).build();

        let events = collect(&agent, "loop forever").await;
        // Tool ran, then the loop ended normally instead of issuing a
        // second request (which would have exhausted the script).
        assert!(events.iter().any(|e| e.tool_result.is_some()));
        assert!(events.last().expect("final").done);
    }

    #[tokio::test]
    async fn provider_error_terminates_stream() {
        let provider = Scripted::new(vec![]);
        let agent = agent_for(provider).build();

        let stream = agent.chat("hello");
        futures::pin_mut!(stream);
        let mut saw_error = false;
        while let Some(event) = stream.next().await {
            if event.is_err() {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn usage_is_remembered() {
        let provider = Scripted::new(vec![vec![
            ChatResponse::usage(Usage::new(10, 5)),
            ChatResponse::content("hi"),
            ChatResponse {
                usage: Some(Usage::new(12, 7)),
                done: true,
                ..ChatResponse::default()
            },
        ]]);
        let agent = agent_for(provider).build();

        let _ = collect(&agent, "hello").await;
        let usage = agent.usage().expect("usage");
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 7);
    }

    #[tokio::test]
    async fn clear_resets_history() {
        let provider = Scripted::new(vec![vec![
            ChatResponse::content("hi"),
            ChatResponse::done(),
        ]]);
        let agent = agent_for(provider).build();

        let _ = collect(&agent, "hello").await;
        assert!(!agent.messages().is_empty());
        agent.clear();
        assert!(agent.messages().is_empty());
        assert!(agent.usage().is_none());
    }
}
