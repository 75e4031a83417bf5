mod engine;

pub use engine::FunctionCallEngine;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::broadcast::BroadcastChannel;
use crate::error::{ChatError, ChatResult};
use crate::types::{ChatEvent, FunctionCallRequest, FunctionSchema};

// ─── Phases ─────────────────────────────────────────────────────────────────

/// Why a call ended in [`FunctionCallPhase::Failed`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FunctionCallError {
    #[error("function not found: {name}")]
    NotFound { name: String },

    #[error("bad arguments: {message}")]
    BadArguments { message: String },

    #[error("{message}")]
    Execution { message: String },

    #[error("cancelled")]
    Cancelled,
}

/// Lifecycle of one call: `Detected → Processing → Ended | Failed`.
/// `Failed` may also follow `Detected` directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum FunctionCallPhase {
    Detected,
    Processing {
        arguments: String,
    },
    Ended {
        arguments: String,
        result: String,
    },
    Failed {
        arguments: String,
        error: FunctionCallError,
    },
}

impl FunctionCallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FunctionCallPhase::Ended { .. } | FunctionCallPhase::Failed { .. }
        )
    }

    fn can_advance_to(&self, next: &FunctionCallPhase) -> bool {
        use FunctionCallPhase::*;
        matches!(
            (self, next),
            (Detected, Processing { .. })
                | (Detected, Failed { .. })
                | (Processing { .. }, Ended { .. })
                | (Processing { .. }, Failed { .. })
        )
    }
}

/// One phase transition as seen by observers
#[derive(Debug, Clone, Serialize)]
pub struct FunctionCallEvent {
    pub call_id: String,
    pub function_name: String,
    pub phase: FunctionCallPhase,
    /// Human-readable rendering of `phase`
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Fallback rendering for functions that don't provide their own.
pub fn default_message(name: &str, phase: &FunctionCallPhase) -> String {
    match phase {
        FunctionCallPhase::Detected => format!("Calling {name}"),
        FunctionCallPhase::Processing { .. } => format!("Running {name}"),
        FunctionCallPhase::Ended { .. } => format!("Finished {name}"),
        FunctionCallPhase::Failed { error, .. } => format!("{name} failed: {error}"),
    }
}

// ─── Invocation ─────────────────────────────────────────────────────────────

/// A tracked call. Only the engine advances it.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionCallInvocation {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub phase: FunctionCallPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FunctionCallInvocation {
    pub fn new(request: &FunctionCallRequest) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            arguments: request.arguments.clone(),
            phase: FunctionCallPhase::Detected,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to `next`. Returns false, leaving the phase alone, for a
    /// transition the lifecycle does not allow.
    pub(crate) fn advance(&mut self, next: FunctionCallPhase) -> bool {
        if !self.phase.can_advance_to(&next) {
            tracing::warn!(
                "ignoring invalid transition for call {}: {:?} -> {:?}",
                self.id,
                self.phase,
                next
            );
            return false;
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.phase = next;
        true
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Text to hand back to the model, and whether it reports an error
    pub fn result_content(&self) -> (String, bool) {
        match &self.phase {
            FunctionCallPhase::Ended { result, .. } => (result.clone(), false),
            FunctionCallPhase::Failed { error, .. } => (error.to_string(), true),
            _ => (String::new(), true),
        }
    }

    /// The result of a finished call, or its failure as a [`ChatError`]
    pub fn into_result(self) -> ChatResult<String> {
        match self.phase {
            FunctionCallPhase::Ended { result, .. } => Ok(result),
            FunctionCallPhase::Failed { error, .. } => Err(error.into_chat_error(self.name)),
            phase => Err(ChatError::FunctionExecution {
                name: self.name,
                message: format!("call {} has not finished ({phase:?})", self.id),
            }),
        }
    }
}

impl FunctionCallError {
    /// Attach the function name the failure belongs to
    pub fn into_chat_error(self, name: impl Into<String>) -> ChatError {
        let name = name.into();
        match self {
            FunctionCallError::NotFound { name } => ChatError::FunctionNotFound { name },
            FunctionCallError::BadArguments { message } => ChatError::BadArguments { name, message },
            FunctionCallError::Execution { message } => {
                ChatError::FunctionExecution { name, message }
            }
            FunctionCallError::Cancelled => ChatError::Cancelled,
        }
    }
}

// ─── Function Definitions ───────────────────────────────────────────────────

/// Output of a function, rendered for the model
pub trait FunctionResult: Send {
    fn bot_readable_content(&self) -> String;
}

impl FunctionResult for String {
    fn bot_readable_content(&self) -> String {
        self.clone()
    }
}

impl FunctionResult for serde_json::Value {
    fn bot_readable_content(&self) -> String {
        self.to_string()
    }
}

/// Streams status text from a running function to observers.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    call_id: String,
    function_name: String,
    events: Option<BroadcastChannel<ChatEvent>>,
}

impl ProgressReporter {
    pub(crate) fn new(
        call_id: impl Into<String>,
        function_name: impl Into<String>,
        events: BroadcastChannel<ChatEvent>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            function_name: function_name.into(),
            events: Some(events),
        }
    }

    /// A reporter that drops everything
    pub fn disabled() -> Self {
        Self {
            call_id: String::new(),
            function_name: String::new(),
            events: None,
        }
    }

    pub fn report(&self, message: impl Into<String>) {
        if let Some(events) = &self.events {
            events.send(ChatEvent::FunctionProgress {
                call_id: self.call_id.clone(),
                function_name: self.function_name.clone(),
                message: message.into(),
            });
        }
    }
}

/// A function the model can call.
#[async_trait]
pub trait ChatFunction: Send + Sync + 'static {
    type Arguments: DeserializeOwned + Send + 'static;
    type Output: FunctionResult;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of [`Self::Arguments`]
    fn argument_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    /// Called once the call is detected, before arguments are decoded.
    async fn prepare(&self, _progress: &ProgressReporter) {}

    async fn call(
        &self,
        arguments: Self::Arguments,
        progress: &ProgressReporter,
    ) -> anyhow::Result<Self::Output>;

    fn message(&self, phase: &FunctionCallPhase) -> String {
        default_message(self.name(), phase)
    }
}

/// Type-erased [`ChatFunction`], as stored in a [`FunctionRegistry`].
#[async_trait]
pub trait DynFunction: Send + Sync {
    fn function_name(&self) -> &str;

    fn schema(&self) -> FunctionSchema;

    fn render(&self, phase: &FunctionCallPhase) -> String;

    async fn prepare_call(&self, progress: &ProgressReporter);

    /// Decode `arguments` and return the pending call. An empty string
    /// decodes as `{}`.
    fn bind<'a>(
        &'a self,
        arguments: &str,
        progress: ProgressReporter,
    ) -> Result<BoxFuture<'a, anyhow::Result<String>>, String>;
}

#[async_trait]
impl<F: ChatFunction> DynFunction for F {
    fn function_name(&self) -> &str {
        ChatFunction::name(self)
    }

    fn schema(&self) -> FunctionSchema {
        FunctionSchema {
            name: ChatFunction::name(self).to_string(),
            description: self.description().to_string(),
            parameters: self.argument_schema(),
        }
    }

    fn render(&self, phase: &FunctionCallPhase) -> String {
        ChatFunction::message(self, phase)
    }

    async fn prepare_call(&self, progress: &ProgressReporter) {
        ChatFunction::prepare(self, progress).await
    }

    fn bind<'a>(
        &'a self,
        arguments: &str,
        progress: ProgressReporter,
    ) -> Result<BoxFuture<'a, anyhow::Result<String>>, String> {
        let raw = if arguments.trim().is_empty() {
            "{}"
        } else {
            arguments
        };
        let decoded: F::Arguments = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        Ok(Box::pin(async move {
            let output = self.call(decoded, &progress).await?;
            Ok(output.bot_readable_content())
        }))
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Functions available to the model, keyed by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn DynFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `function`, replacing any earlier one with the same name.
    pub fn register(&mut self, function: impl ChatFunction) {
        self.register_dyn(Arc::new(function));
    }

    pub fn register_dyn(&mut self, function: Arc<dyn DynFunction>) {
        let name = function.function_name().to_string();
        if self.functions.insert(name.clone(), function).is_some() {
            tracing::debug!("function {name} re-registered, replacing previous definition");
        }
    }

    /// Register every function of `other`, overwriting by name.
    pub fn extend(&mut self, other: impl IntoIterator<Item = Arc<dyn DynFunction>>) {
        for function in other {
            self.register_dyn(function);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynFunction>> {
        self.functions.get(name).cloned()
    }

    /// Schemas for the model, sorted by name
    pub fn schemas(&self) -> Vec<FunctionSchema> {
        let mut schemas: Vec<FunctionSchema> =
            self.functions.values().map(|f| f.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize)]
    pub(crate) struct EchoArgs {
        pub message: String,
    }

    pub(crate) struct Echo;

    #[async_trait]
    impl ChatFunction for Echo {
        type Arguments = EchoArgs;
        type Output = String;

        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo back the message"
        }

        fn argument_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            })
        }

        async fn call(&self, args: EchoArgs, _progress: &ProgressReporter) -> anyhow::Result<String> {
            Ok(args.message)
        }
    }

    #[derive(Deserialize)]
    pub(crate) struct NoArgs {}

    pub(crate) struct Ping;

    #[async_trait]
    impl ChatFunction for Ping {
        type Arguments = NoArgs;
        type Output = String;

        fn name(&self) -> &str {
            "ping"
        }

        fn description(&self) -> &str {
            "Reply with pong"
        }

        async fn call(&self, _args: NoArgs, _progress: &ProgressReporter) -> anyhow::Result<String> {
            Ok("pong".into())
        }

        fn message(&self, phase: &FunctionCallPhase) -> String {
            match phase {
                FunctionCallPhase::Ended { result, .. } => format!("ping -> {result}"),
                other => default_message("ping", other),
            }
        }
    }

    #[test]
    fn registry_last_registration_wins() {
        struct Loud;

        #[async_trait]
        impl ChatFunction for Loud {
            type Arguments = NoArgs;
            type Output = String;
            fn name(&self) -> &str {
                "echo"
            }
            fn description(&self) -> &str {
                "louder echo"
            }
            async fn call(&self, _: NoArgs, _: &ProgressReporter) -> anyhow::Result<String> {
                Ok("LOUD".into())
            }
        }

        let mut registry = FunctionRegistry::new();
        registry.register(Echo);
        registry.register(Ping);
        registry.register(Loud);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["echo", "ping"]);
        let schemas = registry.schemas();
        assert_eq!(schemas[0].description, "louder echo");
    }

    #[test]
    fn default_schema_is_empty_object() {
        let schema = DynFunction::schema(&Ping);
        assert_eq!(schema.parameters, json!({"type": "object", "properties": {}}));
        assert_eq!(schema.name, "ping");
    }

    #[tokio::test]
    async fn bind_decodes_arguments() {
        let call = Echo
            .bind(r#"{"message":"hi"}"#, ProgressReporter::disabled())
            .unwrap();
        assert_eq!(call.await.unwrap(), "hi");

        assert!(Echo.bind("{}", ProgressReporter::disabled()).is_err());
        assert!(Echo.bind("not json", ProgressReporter::disabled()).is_err());
    }

    #[tokio::test]
    async fn empty_arguments_decode_as_empty_object() {
        let call = Ping.bind("", ProgressReporter::disabled()).unwrap();
        assert_eq!(call.await.unwrap(), "pong");
    }

    #[test]
    fn invocation_rejects_leaving_terminal_phase() {
        let mut invocation =
            FunctionCallInvocation::new(&FunctionCallRequest::new("c1", "ping", ""));
        assert!(!invocation.advance(FunctionCallPhase::Ended {
            arguments: String::new(),
            result: "skip".into(),
        }));
        assert!(invocation.advance(FunctionCallPhase::Processing {
            arguments: String::new()
        }));
        assert!(invocation.advance(FunctionCallPhase::Ended {
            arguments: String::new(),
            result: "pong".into(),
        }));
        assert!(invocation.is_finished());
        assert!(invocation.finished_at.is_some());
        assert!(!invocation.advance(FunctionCallPhase::Failed {
            arguments: String::new(),
            error: FunctionCallError::Cancelled,
        }));
        assert_eq!(invocation.result_content(), ("pong".to_string(), false));
    }

    #[test]
    fn phase_messages() {
        let failed = FunctionCallPhase::Failed {
            arguments: "{}".into(),
            error: FunctionCallError::NotFound { name: "x".into() },
        };
        assert_eq!(default_message("x", &failed), "x failed: function not found: x");
        let ended = FunctionCallPhase::Ended {
            arguments: "{}".into(),
            result: "pong".into(),
        };
        assert_eq!(Ping.render(&ended), "ping -> pong");
    }

    #[test]
    fn phase_serializes_tagged() {
        let json = serde_json::to_value(FunctionCallPhase::Processing {
            arguments: "{}".into(),
        })
        .unwrap();
        assert_eq!(json, json!({"phase": "processing", "arguments": "{}"}));
    }
}
