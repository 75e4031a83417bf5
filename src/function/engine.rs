use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::{
    default_message, ChatFunction, DynFunction, FunctionCallError, FunctionCallEvent,
    FunctionCallInvocation, FunctionCallPhase, FunctionRegistry, ProgressReporter,
};
use crate::broadcast::BroadcastChannel;
use crate::error::ChatResult;
use crate::types::{ChatEvent, FunctionCallRequest};

/// Runs function calls and publishes each phase transition.
///
/// Invocations are independent: `dispatch` takes `&self`, so any number may
/// run at once, each with its own ordered phase sequence.
#[derive(Debug, Clone)]
pub struct FunctionCallEngine {
    registry: FunctionRegistry,
    events: BroadcastChannel<ChatEvent>,
}

impl FunctionCallEngine {
    pub fn new(registry: FunctionRegistry, events: BroadcastChannel<ChatEvent>) -> Self {
        Self { registry, events }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn register(&mut self, function: impl ChatFunction) {
        self.registry.register(function);
    }

    pub fn events(&self) -> &BroadcastChannel<ChatEvent> {
        &self.events
    }

    /// Run `name` outside a model turn, publishing the same phases as a
    /// model-requested call.
    pub async fn call(
        &self,
        name: &str,
        arguments: &str,
        cancel: &CancellationToken,
    ) -> ChatResult<String> {
        let request = FunctionCallRequest::new(uuid::Uuid::new_v4().to_string(), name, arguments);
        self.dispatch(&request, cancel).await.into_result()
    }

    /// Drive `request` to a terminal phase.
    ///
    /// Lookup and decode failures short-circuit to `Failed` without passing
    /// through `Processing`. Cancellation while preparing or running resolves
    /// the call as `Failed(Cancelled)`.
    pub async fn dispatch(
        &self,
        request: &FunctionCallRequest,
        cancel: &CancellationToken,
    ) -> FunctionCallInvocation {
        let mut invocation = FunctionCallInvocation::new(request);
        let arguments = request.arguments.clone();

        let Some(function) = self.registry.get(&request.name) else {
            tracing::warn!("model called unknown function {}", request.name);
            self.publish(&invocation, None);
            self.transition(
                &mut invocation,
                None,
                FunctionCallPhase::Failed {
                    arguments,
                    error: FunctionCallError::NotFound {
                        name: request.name.clone(),
                    },
                },
            );
            return invocation;
        };
        let function = function.as_ref();

        tracing::info!("dispatching {} ({})", request.name, request.id);
        self.publish(&invocation, Some(function));

        let progress = ProgressReporter::new(&request.id, &request.name, self.events.clone());
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = function.prepare_call(&progress) => true,
        };
        if !prepared {
            self.transition(
                &mut invocation,
                Some(function),
                FunctionCallPhase::Failed {
                    arguments,
                    error: FunctionCallError::Cancelled,
                },
            );
            return invocation;
        }

        let call = match function.bind(&arguments, progress) {
            Ok(call) => call,
            Err(message) => {
                self.transition(
                    &mut invocation,
                    Some(function),
                    FunctionCallPhase::Failed {
                        arguments,
                        error: FunctionCallError::BadArguments { message },
                    },
                );
                return invocation;
            }
        };

        if cancel.is_cancelled() {
            self.transition(
                &mut invocation,
                Some(function),
                FunctionCallPhase::Failed {
                    arguments,
                    error: FunctionCallError::Cancelled,
                },
            );
            return invocation;
        }

        self.transition(
            &mut invocation,
            Some(function),
            FunctionCallPhase::Processing {
                arguments: arguments.clone(),
            },
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FunctionCallError::Cancelled),
            result = call => result.map_err(|e| FunctionCallError::Execution {
                message: format!("{e:#}"),
            }),
        };

        let terminal = match outcome {
            Ok(result) => FunctionCallPhase::Ended { arguments, result },
            Err(error) => {
                tracing::warn!("function {} failed: {error}", request.name);
                FunctionCallPhase::Failed { arguments, error }
            }
        };
        self.transition(&mut invocation, Some(function), terminal);
        invocation
    }

    fn transition(
        &self,
        invocation: &mut FunctionCallInvocation,
        function: Option<&dyn DynFunction>,
        next: FunctionCallPhase,
    ) {
        if invocation.advance(next) {
            tracing::debug!("call {} -> {:?}", invocation.id, invocation.phase);
            self.publish(invocation, function);
        }
    }

    fn publish(&self, invocation: &FunctionCallInvocation, function: Option<&dyn DynFunction>) {
        let message = match function {
            Some(f) => f.render(&invocation.phase),
            None => default_message(&invocation.name, &invocation.phase),
        };
        self.events.send(ChatEvent::FunctionCall(FunctionCallEvent {
            call_id: invocation.id.clone(),
            function_name: invocation.name.clone(),
            phase: invocation.phase.clone(),
            message,
            timestamp: Utc::now(),
        }));
    }
}
