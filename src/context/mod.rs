mod memory;
mod retrieval;
mod scope;

pub use memory::{
    render_retrieved_content, Prompt, PromptMemory, PromptSections, TokenUsage,
    DOCUMENT_SEPARATOR,
};
pub use retrieval::{index_documents, reindex_if_changed, RetrievalCollector};
pub use scope::{parse_scopes, Scope};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ChatConfig;
use crate::error::ChatResult;
use crate::function::DynFunction;
use crate::types::{Message, Reference};

/// A document offered for the prompt. Higher priority survives trimming longer.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedContent {
    pub document: Reference,
    pub priority: i32,
}

impl RetrievedContent {
    pub fn new(document: Reference, priority: i32) -> Self {
        Self { document, priority }
    }
}

/// What one collector contributes to a request
#[derive(Clone, Default)]
pub struct ChatContext {
    pub system_prompt: String,
    pub retrieved_content: Vec<RetrievedContent>,
    /// Extra functions the model may call during this request
    pub functions: Vec<Arc<dyn DynFunction>>,
}

impl ChatContext {
    pub fn is_empty(&self) -> bool {
        self.system_prompt.is_empty()
            && self.retrieved_content.is_empty()
            && self.functions.is_empty()
    }

    /// Combine contexts in order. Non-empty system prompts are joined by
    /// newlines.
    pub fn merge(contexts: impl IntoIterator<Item = ChatContext>) -> ChatContext {
        let mut merged = ChatContext::default();
        let mut prompts = Vec::new();
        for context in contexts {
            if !context.system_prompt.is_empty() {
                prompts.push(context.system_prompt);
            }
            merged.retrieved_content.extend(context.retrieved_content);
            merged.functions.extend(context.functions);
        }
        merged.system_prompt = prompts.join("\n");
        merged
    }
}

impl std::fmt::Debug for ChatContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let functions: Vec<&str> = self.functions.iter().map(|f| f.function_name()).collect();
        f.debug_struct("ChatContext")
            .field("system_prompt", &self.system_prompt)
            .field("retrieved_content", &self.retrieved_content)
            .field("functions", &functions)
            .finish()
    }
}

/// Supplies context for each request
#[async_trait]
pub trait ContextCollector: Send + Sync {
    /// `history` ends with the new user message, whose text (scope prefix
    /// removed) is `content`.
    async fn generate_context(
        &self,
        history: &[Message],
        scopes: &HashSet<Scope>,
        content: &str,
        config: &ChatConfig,
    ) -> ChatResult<ChatContext>;
}
