//! # chat-runtime
//!
//! Streaming chat orchestration for tool-augmented assistants: the model
//! calls functions, the prompt stays inside its token budget, retrieved
//! documents are ranked in, and every step is published to observers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use chat_runtime::provider::ModelClient;
//! use chat_runtime::{ChatAgent, ChatConfig, ChatEvent};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(client: Arc<dyn ModelClient>) -> chat_runtime::ChatResult<()> {
//! let mut agent = ChatAgent::new(client, ChatConfig::default())
//!     .with_system_prompt("You are a careful code reviewer");
//!
//! let mut events = agent.subscribe();
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         if let ChatEvent::TextDelta { text, .. } = event {
//!             print!("{text}");
//!         }
//!     }
//! });
//!
//! agent.send("@file explain this function", CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Core types: `Message`, `Role`, `ContentBlock`, `ChatEvent` |
//! | [`config`] | `ChatConfig` with TOML loading and request parameter overlays |
//! | [`agent`] | `ChatAgent`: the request loop of prompt, stream, function calls, resubmit |
//! | [`function`] | Typed `ChatFunction` trait, registry and the dispatching `FunctionCallEngine` |
//! | [`context`] | Context collectors, scope prefixes and budgeted prompt assembly |
//! | [`token`] | Token counting: character estimate, remote counter, exact BPE |
//! | [`vector`] | Approximate nearest-neighbour index, text splitter, persistent document store |
//! | [`broadcast`] | Multi-subscriber event channel with cancellable subscriptions |
//! | [`change`] | Content-fingerprint change detection for watched files |
//! | [`provider`] | `ModelClient` and `EmbeddingProvider` interfaces |
//! | [`error`] | Error types with thiserror |

pub mod agent;
pub mod broadcast;
pub mod change;
pub mod config;
pub mod context;
pub mod error;
pub mod function;
pub mod payload;
pub mod provider;
pub mod token;
pub mod types;
pub mod vector;

pub use agent::ChatAgent;
pub use config::ChatConfig;
pub use error::{ChatError, ChatResult};
pub use types::*;
