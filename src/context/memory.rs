use serde::Serialize;

use super::RetrievedContent;
use crate::config::ChatConfig;
use crate::error::ChatResult;
use crate::token::TokenCounter;
use crate::types::{ContentBlock, FunctionSchema, Message, Reference};

/// Costs a single token with most encoders
pub const DOCUMENT_SEPARATOR: &str = "================================";

const RETRIEVED_CONTENT_HEADER: &str =
    "Here are the information you know about the system and the project, separated by ";

/// every reply is primed with <|start|>assistant<|message|>
const REPLY_PRIMING_TOKENS: usize = 3;

const MESSAGE_FRAMING_TOKENS: usize = 3;

const TOOL_CALL_TOKENS: usize = 4;

/// Tokens spent per prompt section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub system_prompt: usize,
    pub context_system_prompt: usize,
    pub functions: usize,
    pub messages: usize,
    pub retrieved_content: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.system_prompt
            + self.context_system_prompt
            + self.functions
            + self.messages
            + self.retrieved_content
    }
}

/// A prompt ready for the model client
#[derive(Debug, Clone)]
pub struct Prompt {
    pub messages: Vec<Message>,
    /// Retrieved documents that made it into the prompt
    pub references: Vec<Reference>,
    pub usage: TokenUsage,
    /// Negative when even the mandatory sections overflow the budget
    pub remaining_tokens: i64,
}

impl Prompt {
    pub fn over_budget(&self) -> bool {
        self.remaining_tokens < 0
    }
}

/// Inputs to one prompt assembly
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptSections<'a> {
    pub system_prompt: &'a str,
    pub context_system_prompt: &'a str,
    pub functions: &'a [FunctionSchema],
    /// Conversation so far; the last entry is the newest message
    pub history: &'a [Message],
    pub retrieved: &'a [RetrievedContent],
}

/// Fits a conversation into the context window.
///
/// Layout: system prompt, history, retrieved content, context system prompt,
/// newest message. The system prompts, function schemas and newest message
/// are always sent. Retrieved content is budgeted next, up to its share of
/// the window, and history takes what is left, newest first.
#[derive(Debug, Clone)]
pub struct PromptMemory {
    counter: TokenCounter,
    max_tokens: usize,
    minimum_reply_tokens: usize,
    max_number_of_messages: Option<usize>,
    retrieved_content_limit: usize,
}

impl PromptMemory {
    pub fn new(counter: TokenCounter, config: &ChatConfig) -> Self {
        Self {
            counter,
            max_tokens: config.max_tokens,
            minimum_reply_tokens: config.minimum_reply_tokens,
            max_number_of_messages: config.max_number_of_messages,
            retrieved_content_limit: config.retrieved_content_limit(),
        }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub async fn assemble(&self, sections: PromptSections<'_>) -> ChatResult<Prompt> {
        let system_message = Message::system(sections.system_prompt);
        let context_message = Message::user(sections.context_system_prompt);

        let mut usage = TokenUsage {
            system_prompt: self.count_message(&system_message).await?,
            ..TokenUsage::default()
        };
        if !sections.context_system_prompt.is_empty() {
            usage.context_system_prompt = self.count_message(&context_message).await?;
        }
        for function in sections.functions {
            usage.functions += self.count_function(function).await?;
        }

        let (newest, older) = match sections.history.split_last() {
            Some((newest, older)) => (Some(newest), older),
            None => (None, &[][..]),
        };
        let newest_tokens = match newest {
            Some(message) => self.count_message(message).await?,
            None => 0,
        };

        let mandatory = usage.system_prompt
            + usage.context_system_prompt
            + usage.functions
            + REPLY_PRIMING_TOKENS
            + newest_tokens;
        let available =
            self.max_tokens as i64 - self.minimum_reply_tokens as i64 - mandatory as i64;

        let retrieved_limit = (available.max(0) as usize).min(self.retrieved_content_limit);
        let (retrieved_message, references, retrieved_tokens) =
            self.retrieved_content_message(sections.retrieved, retrieved_limit).await?;
        usage.retrieved_content = retrieved_tokens;

        let history_budget = available - retrieved_tokens as i64;
        let max_older = self.max_number_of_messages.map(|n| n.saturating_sub(1));
        let mut kept: Vec<&Message> = Vec::new();
        let mut history_tokens = 0usize;
        for message in older.iter().rev() {
            if max_older.is_some_and(|max| kept.len() >= max) {
                break;
            }
            if message.is_empty() {
                continue;
            }
            let tokens = self.count_message(message).await?;
            if (history_tokens + tokens) as i64 > history_budget {
                break;
            }
            history_tokens += tokens;
            kept.push(message);
        }
        kept.reverse();
        usage.messages = history_tokens + newest_tokens;

        let messages: Vec<Message> = std::iter::once(system_message)
            .chain(kept.into_iter().cloned())
            .chain([retrieved_message, context_message])
            .chain(newest.cloned())
            .filter(|m| !m.is_empty())
            .collect();

        tracing::debug!(
            system_prompt = usage.system_prompt,
            context_system_prompt = usage.context_system_prompt,
            functions = usage.functions,
            messages = usage.messages,
            retrieved_content = usage.retrieved_content,
            total = usage.total(),
            "prompt token usage"
        );

        Ok(Prompt {
            messages,
            references,
            remaining_tokens: history_budget - history_tokens as i64,
            usage,
        })
    }

    /// Message tokens: framing, optional name, then every content block.
    pub async fn count_message(&self, message: &Message) -> ChatResult<usize> {
        let mut total = MESSAGE_FRAMING_TOKENS;
        if let Some(name) = &message.name {
            total += 1 + self.counter.count_tokens(name).await?;
        }
        for block in &message.content {
            total += match block {
                ContentBlock::Text { text } => self.counter.count_tokens(text).await?,
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    TOOL_CALL_TOKENS
                        + self.counter.count_tokens(id).await?
                        + self.counter.count_tokens(name).await?
                        + self.counter.count_tokens(arguments).await?
                }
                ContentBlock::ToolResult { content, .. } => {
                    self.counter.count_tokens(content).await?
                }
            };
        }
        Ok(total)
    }

    pub async fn count_function(&self, function: &FunctionSchema) -> ChatResult<usize> {
        Ok(self.counter.count_tokens(&function.name).await?
            + self.counter.count_tokens(&function.description).await?
            + self
                .counter
                .count_tokens(&function.parameters.to_string())
                .await?)
    }

    /// The retrieved-content message, the references it carries and its
    /// token count.
    ///
    /// Documents go in by descending priority. When they don't all fit in
    /// `limit`, the longest fitting prefix is found by binary search.
    pub(crate) async fn retrieved_content_message(
        &self,
        retrieved: &[RetrievedContent],
        limit: usize,
    ) -> ChatResult<(Message, Vec<Reference>, usize)> {
        let mut ordered: Vec<&RetrievedContent> = retrieved
            .iter()
            .filter(|r| !r.document.content.is_empty())
            .collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        let documents: Vec<Reference> = ordered.into_iter().map(|r| r.document.clone()).collect();

        let full = Message::user(render_retrieved_content(&documents));
        if self.fits(&full, limit).await? {
            let tokens = self.count_retrieved(&full).await?;
            return Ok((full, documents, tokens));
        }

        // largest prefix length in lo..=hi that fits; the empty prefix always does
        let (mut lo, mut hi) = (0, documents.len().saturating_sub(1));
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            let candidate = Message::user(render_retrieved_content(&documents[..mid]));
            if self.fits(&candidate, limit).await? {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        let included = documents[..lo].to_vec();
        let message = Message::user(render_retrieved_content(&included));
        let tokens = self.count_retrieved(&message).await?;
        Ok((message, included, tokens))
    }

    async fn fits(&self, message: &Message, limit: usize) -> ChatResult<bool> {
        // one token per character: the count is known without a round through the counter
        if matches!(self.counter, TokenCounter::Characters) {
            let tokens = MESSAGE_FRAMING_TOKENS + message.text_content().chars().count();
            return Ok(tokens <= limit);
        }
        Ok(self.count_message(message).await? <= limit)
    }

    async fn count_retrieved(&self, message: &Message) -> ChatResult<usize> {
        if message.is_empty() {
            return Ok(0);
        }
        self.count_message(message).await
    }
}

/// Render documents as the retrieved-content message body.
pub fn render_retrieved_content(documents: &[Reference]) -> String {
    let mut text = String::new();
    for (index, document) in documents.iter().enumerate() {
        if index == 0 {
            text.push_str(RETRIEVED_CONTENT_HEADER);
            text.push_str(DOCUMENT_SEPARATOR);
        }
        text.push_str(&format!(
            "\n\n{DOCUMENT_SEPARATOR}[DOCUMENT {index}]\n\n{}",
            document.content
        ));
    }
    text
}
