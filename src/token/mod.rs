//! Token accounting.
//!
//! [`TokenCounter`] is the single entry point. Approximate backends count
//! directly; the exact [`BpeEncoder`] backend materializes token ids from a
//! rank table loaded once per process (see [`load_vocabulary`]).

mod bpe;

pub use bpe::{load_vocabulary, reset_vocabulary_cache, BpeEncoder, Vocabulary};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ChatResult;

/// A token-counting service reached over the network (e.g. a provider's
/// count-tokens endpoint).
#[async_trait]
pub trait RemoteTokenCounter: Send + Sync {
    async fn count_tokens(&self, text: &str) -> ChatResult<usize>;
}

/// Token counting backend
#[derive(Clone)]
pub enum TokenCounter {
    /// One token per character; cheap and pessimistic
    Characters,
    /// Remote count, falling back to [`TokenCounter::Characters`] on failure
    Remote(Arc<dyn RemoteTokenCounter>),
    /// Exact byte-pair encoding
    Bpe(BpeEncoder),
}

impl TokenCounter {
    pub fn remote(counter: impl RemoteTokenCounter + 'static) -> Self {
        TokenCounter::Remote(Arc::new(counter))
    }

    pub fn bpe(vocabulary_path: impl Into<std::path::PathBuf>) -> Self {
        TokenCounter::Bpe(BpeEncoder::new(vocabulary_path))
    }

    /// Count the tokens of `text`.
    ///
    /// Only the exact backend can fail, and only when its vocabulary cannot
    /// be loaded.
    pub async fn count_tokens(&self, text: &str) -> ChatResult<usize> {
        match self {
            TokenCounter::Characters => Ok(character_count(text)),
            TokenCounter::Remote(remote) => match remote.count_tokens(text).await {
                Ok(count) => Ok(count),
                Err(e) => {
                    tracing::warn!("remote token count failed, counting characters: {e}");
                    Ok(character_count(text))
                }
            },
            TokenCounter::Bpe(encoder) => encoder.count_tokens(text).await,
        }
    }

    /// The exact encoder, if this backend has one
    pub fn encoder(&self) -> Option<&BpeEncoder> {
        match self {
            TokenCounter::Bpe(encoder) => Some(encoder),
            _ => None,
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        TokenCounter::Characters
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenCounter::Characters => write!(f, "Characters"),
            TokenCounter::Remote(_) => write!(f, "Remote"),
            TokenCounter::Bpe(encoder) => f.debug_tuple("Bpe").field(encoder).finish(),
        }
    }
}

fn character_count(text: &str) -> usize {
    text.chars().count()
}
