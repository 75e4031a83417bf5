//! Byte-level BPE over a tiktoken-style rank file.
//!
//! Each line of the file is `<base64 token bytes> <rank>`. All 256 single
//! bytes must be present so any input can be encoded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::OnceCell;

use crate::error::{ChatError, ChatResult};

/// Pre-tokenization split, cl100k style.
const SPLIT_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+";

type VocabularySlot = Arc<OnceCell<Arc<Vocabulary>>>;

static VOCABULARIES: Lazy<DashMap<PathBuf, VocabularySlot>> = Lazy::new(DashMap::new);

/// Load the vocabulary at `path`, sharing one load across the process.
///
/// Concurrent first callers wait on the same in-flight load. A failed load
/// leaves the slot empty so a later call can retry.
pub async fn load_vocabulary(path: &Path) -> ChatResult<Arc<Vocabulary>> {
    // clone the slot out so the map shard is not held across the await
    let slot = VOCABULARIES
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(OnceCell::new()))
        .clone();
    let vocabulary = slot
        .get_or_try_init(|| async {
            tracing::info!("loading token vocabulary from {}", path.display());
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| vocabulary_error(path, e))?;
            Vocabulary::parse(&content)
                .map(Arc::new)
                .map_err(|message| vocabulary_error(path, message))
        })
        .await?;
    Ok(vocabulary.clone())
}

/// Drop every cached vocabulary.
pub fn reset_vocabulary_cache() {
    VOCABULARIES.clear();
}

fn vocabulary_error(path: &Path, message: impl std::fmt::Display) -> ChatError {
    ChatError::VocabularyLoad {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}

/// A loaded rank table
pub struct Vocabulary {
    ranks: HashMap<Vec<u8>, u32>,
    tokens: HashMap<u32, Vec<u8>>,
    split: Regex,
}

impl Vocabulary {
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut ranks = HashMap::new();
        let mut tokens = HashMap::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (encoded, rank) = line
                .split_once(' ')
                .ok_or_else(|| format!("line {}: expected `<token> <rank>`", line_no + 1))?;
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|e| format!("line {}: {e}", line_no + 1))?;
            let rank: u32 = rank
                .trim()
                .parse()
                .map_err(|e| format!("line {}: {e}", line_no + 1))?;
            tokens.insert(rank, bytes.clone());
            ranks.insert(bytes, rank);
        }
        if let Some(missing) = (0..=255u8).find(|b| !ranks.contains_key([*b].as_slice())) {
            return Err(format!("missing single-byte token 0x{missing:02x}"));
        }
        let split = Regex::new(SPLIT_PATTERN).map_err(|e| e.to_string())?;
        Ok(Self {
            ranks,
            tokens,
            split,
        })
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut out = Vec::new();
        for piece in self.split.find_iter(text) {
            self.encode_piece(piece.as_str().as_bytes(), &mut out);
        }
        out
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|id| self.tokens.get(id))
            .flatten()
            .copied()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn encode_piece(&self, piece: &[u8], out: &mut Vec<u32>) {
        if let Some(&rank) = self.ranks.get(piece) {
            out.push(rank);
            return;
        }
        // boundaries between current parts; merge the lowest-ranked adjacent pair until none merge
        let mut parts: Vec<usize> = (0..=piece.len()).collect();
        loop {
            let mut best: Option<(u32, usize)> = None;
            for i in 0..parts.len().saturating_sub(2) {
                if let Some(&rank) = self.ranks.get(&piece[parts[i]..parts[i + 2]]) {
                    if best.map_or(true, |(r, _)| rank < r) {
                        best = Some((rank, i));
                    }
                }
            }
            match best {
                Some((_, i)) => {
                    parts.remove(i + 1);
                }
                None => break,
            }
        }
        out.extend(
            parts
                .windows(2)
                .filter_map(|w| self.ranks.get(&piece[w[0]..w[1]]).copied()),
        );
    }
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("len", &self.ranks.len())
            .finish()
    }
}

/// Exact token encoder backed by a vocabulary file
#[derive(Debug, Clone)]
pub struct BpeEncoder {
    path: PathBuf,
}

impl BpeEncoder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn encode(&self, text: &str) -> ChatResult<Vec<u32>> {
        let vocabulary = load_vocabulary(&self.path).await?;
        Ok(vocabulary.encode(text))
    }

    pub async fn count_tokens(&self, text: &str) -> ChatResult<usize> {
        Ok(self.encode(text).await?.len())
    }
}
