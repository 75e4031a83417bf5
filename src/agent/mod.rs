use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{BroadcastChannel, Subscription};
use crate::config::ChatConfig;
use crate::context::{
    parse_scopes, ChatContext, ContextCollector, PromptMemory, PromptSections, Scope,
};
use crate::error::{ChatError, ChatResult};
use crate::function::{ChatFunction, FunctionCallEngine, FunctionRegistry};
use crate::provider::{ModelClient, ModelRequest};
use crate::token::TokenCounter;
use crate::types::*;

/// A conversation with a model that can call functions.
///
/// Every request publishes its progress on [`ChatAgent::events`]: text
/// deltas as they stream, each function call phase, and a marker per round.
pub struct ChatAgent {
    client: Arc<dyn ModelClient>,
    config: ChatConfig,
    system_prompt: String,
    functions: FunctionRegistry,
    collectors: Vec<Arc<dyn ContextCollector>>,
    memory: PromptMemory,
    events: BroadcastChannel<ChatEvent>,
    history: Vec<Message>,
}

impl ChatAgent {
    pub fn new(client: Arc<dyn ModelClient>, config: ChatConfig) -> Self {
        let memory = PromptMemory::new(TokenCounter::default(), &config);
        Self {
            client,
            config,
            system_prompt: String::new(),
            functions: FunctionRegistry::new(),
            collectors: Vec::new(),
            memory,
            events: BroadcastChannel::new(),
            history: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.memory = PromptMemory::new(counter, &self.config);
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_collector(mut self, collector: Arc<dyn ContextCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn register_function(&mut self, function: impl ChatFunction) {
        self.functions.register(function);
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn events(&self) -> &BroadcastChannel<ChatEvent> {
        &self.events
    }

    pub fn subscribe(&self) -> Subscription<ChatEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Send a user message and run until the model stops calling functions.
    ///
    /// A leading `@scope+scope ` prefix is stripped and handed to the
    /// collectors. Returns the messages this request added to the history.
    /// Cancelling `cancel` aborts the model call and fails any running
    /// function call.
    pub async fn send(
        &mut self,
        content: impl Into<String>,
        cancel: CancellationToken,
    ) -> ChatResult<Vec<Message>> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.events.send(ChatEvent::RequestStarted {
            request_id: request_id.clone(),
        });

        match self.run(content.into(), &cancel).await {
            Ok(messages) => {
                self.events.send(ChatEvent::RequestFinished {
                    request_id,
                    messages: messages.clone(),
                });
                Ok(messages)
            }
            Err(e) => {
                if e.is_cancelled() {
                    tracing::info!("request {request_id} cancelled");
                } else {
                    tracing::warn!("request {request_id} failed: {e}");
                }
                self.events.send(ChatEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(
        &mut self,
        mut content: String,
        cancel: &CancellationToken,
    ) -> ChatResult<Vec<Message>> {
        let scopes = parse_scopes(&mut content);
        let user_message = Message::user(content.clone());
        self.history.push(user_message.clone());
        let mut new_messages = vec![user_message];

        let context = self.collect_context(&scopes, &content).await;
        let mut functions = self.functions.clone();
        functions.extend(context.functions.iter().cloned());
        let engine = FunctionCallEngine::new(functions, self.events.clone());
        let schemas = engine.registry().schemas();
        let parameters = self.config.request_parameters();

        let mut round = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ChatError::Cancelled);
            }

            let prompt = self
                .memory
                .assemble(PromptSections {
                    system_prompt: &self.system_prompt,
                    context_system_prompt: &context.system_prompt,
                    functions: &schemas,
                    history: &self.history,
                    retrieved: &context.retrieved_content,
                })
                .await?;
            if prompt.over_budget() {
                tracing::warn!(
                    "prompt exceeds token budget by {} tokens",
                    -prompt.remaining_tokens
                );
            }

            let request = ModelRequest {
                messages: prompt.messages,
                functions: schemas.clone(),
                parameters: parameters.clone(),
            };
            tracing::debug!("round {} started", round + 1);
            let mut assistant = self.stream_reply(&request, cancel).await?;
            assistant.references = prompt.references;

            self.history.push(assistant.clone());
            new_messages.push(assistant.clone());
            round += 1;
            self.events.send(ChatEvent::RoundFinished {
                round,
                message: assistant.clone(),
            });

            let calls = assistant.function_calls();
            if calls.is_empty() || !self.config.run_functions_automatically {
                break;
            }

            let invocations =
                futures::future::join_all(calls.iter().map(|call| engine.dispatch(call, cancel)))
                    .await;
            for invocation in invocations {
                let (result, is_error) = invocation.result_content();
                let message = Message::tool_result(invocation.id, result, is_error);
                self.history.push(message.clone());
                new_messages.push(message);
            }

            if round >= self.config.max_function_rounds {
                tracing::warn!("stopping after {round} function rounds");
                break;
            }
        }

        Ok(new_messages)
    }

    async fn collect_context(
        &self,
        scopes: &HashSet<Scope>,
        content: &str,
    ) -> ChatContext {
        let mut contexts = Vec::with_capacity(self.collectors.len());
        for collector in &self.collectors {
            match collector
                .generate_context(&self.history, scopes, content, &self.config)
                .await
            {
                Ok(context) => contexts.push(context),
                Err(e) => tracing::warn!("context collector failed, continuing without it: {e}"),
            }
        }
        ChatContext::merge(contexts)
    }

    /// One streamed completion, forwarding text deltas as events.
    async fn stream_reply(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> ChatResult<Message> {
        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel();
        let message_id = uuid::Uuid::new_v4().to_string();

        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(delta) = delta_rx.recv().await {
                match delta {
                    StreamDelta::TextDelta { text } => events.send(ChatEvent::TextDelta {
                        message_id: message_id.clone(),
                        text,
                    }),
                    StreamDelta::FunctionCallDelta { name, .. } => {
                        tracing::trace!("function call delta for {name}");
                    }
                }
            }
        });

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            reply = self.client.stream(request, delta_tx) => reply,
        };
        forwarder.await.ok();
        reply
    }
}
