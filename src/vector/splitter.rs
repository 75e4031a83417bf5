use std::sync::Arc;

use regex::Regex;

use super::store::Document;
use crate::error::{ChatError, ChatResult};

/// Where text may be cut. An empty literal cuts between characters.
#[derive(Debug, Clone)]
pub enum Separator {
    Literal(String),
    Pattern(Regex),
}

impl Separator {
    pub fn pattern(pattern: &str) -> ChatResult<Self> {
        Regex::new(pattern)
            .map(Separator::Pattern)
            .map_err(|e| ChatError::Config(format!("bad separator pattern {pattern:?}: {e}")))
    }

    fn is_empty(&self) -> bool {
        matches!(self, Separator::Literal(s) if s.is_empty())
    }

    fn is_found_in(&self, text: &str) -> bool {
        match self {
            Separator::Literal(s) => s.is_empty() || text.contains(s.as_str()),
            Separator::Pattern(re) => re.find_iter(text).any(|m| !m.as_str().is_empty()),
        }
    }

    /// Byte offsets where a non-empty match starts
    fn match_starts(&self, text: &str) -> Vec<usize> {
        match self {
            Separator::Literal(s) => text.match_indices(s.as_str()).map(|(i, _)| i).collect(),
            Separator::Pattern(re) => re
                .find_iter(text)
                .filter(|m| !m.as_str().is_empty())
                .map(|m| m.start())
                .collect(),
        }
    }
}

impl From<&str> for Separator {
    fn from(s: &str) -> Self {
        Separator::Literal(s.to_string())
    }
}

impl From<String> for Separator {
    fn from(s: String) -> Self {
        Separator::Literal(s)
    }
}

enum Entry {
    Lit(&'static str),
    Re(&'static str),
}

use Entry::{Lit, Re};

const LINES: [Entry; 6] = [Lit("\n\n"), Lit("\r\n"), Lit("\n"), Lit("\r"), Lit(" "), Lit("")];

const RUST: &[Entry] = &[
    Re(r"\n(?:pub(?:\([\w:]+\))? )?(?:unsafe )?(?:impl|trait|struct|enum|mod|union)\b"),
    Re(r"\n(?:pub(?:\([\w:]+\))? )?(?:const |async |unsafe |extern \S+ )*fn "),
    Re(r"\n#\[\w+"),
    Lit("\nconst "),
    Lit("\nstatic "),
    Lit("\n    fn "),
    Lit("\n    pub fn "),
    Lit("\n    if "),
    Lit("\n    for "),
    Lit("\n    while "),
    Lit("\n    loop "),
    Lit("\n    match "),
    Lit("\n    let "),
];

const PYTHON: &[Entry] = &[
    Re(r"\n(?:async )?(?:class|def) "),
    Re(r"\n@\w+"),
    Re(r"\n[ \t]+(?:async )?def "),
];

const SWIFT: &[Entry] = &[
    Re(r"\n@\w+\s"),
    Re(r"\n#\w+\s"),
    Re(r"\n(?:public|private|fileprivate|internal|open|final) "),
    Re(r"\n(?:class|struct|enum|extension|protocol|actor) "),
    Re(r"\n(?:static |func |init)"),
    Re(r"\n(?:if|for|while|do|switch|case) "),
];

const GO: &[Entry] = &[
    Re(r"\n(?:func|var|const|type) "),
    Re(r"\n(?:if|for|switch|case) "),
];

const JAVASCRIPT: &[Entry] = &[
    Re(r"\n(?:export (?:default )?)?(?:async )?(?:function|class) "),
    Re(r"\n(?:export )?(?:const|let|var) "),
    Re(r"\n(?:if|for|while|switch|case|default) "),
];

const MARKDOWN: &[Entry] = &[
    Re(r"\n#{2,6} "),
    Lit("```\n\n"),
    Re(r"\n\n(?:\*\*\*|---|___)\n\n"),
];

/// Separator presets, most specific boundary first. Code presets cut along
/// declarations before falling back to blank lines, lines and spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeparatorSet {
    #[default]
    Plain,
    Rust,
    Python,
    Swift,
    Go,
    JavaScript,
    Markdown,
}

impl SeparatorSet {
    /// Preset for a file extension, [`SeparatorSet::Plain`] when unknown.
    pub fn from_extension(extension: &str) -> Self {
        match extension.to_ascii_lowercase().as_str() {
            "rs" => SeparatorSet::Rust,
            "py" | "pyi" => SeparatorSet::Python,
            "swift" => SeparatorSet::Swift,
            "go" => SeparatorSet::Go,
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" => SeparatorSet::JavaScript,
            "md" | "markdown" => SeparatorSet::Markdown,
            _ => SeparatorSet::Plain,
        }
    }

    pub fn separators(&self) -> Vec<Separator> {
        let specific: &[Entry] = match self {
            SeparatorSet::Plain => &[],
            SeparatorSet::Rust => RUST,
            SeparatorSet::Python => PYTHON,
            SeparatorSet::Swift => SWIFT,
            SeparatorSet::Go => GO,
            SeparatorSet::JavaScript => JAVASCRIPT,
            SeparatorSet::Markdown => MARKDOWN,
        };
        specific
            .iter()
            .chain(LINES.iter())
            .filter_map(|entry| match entry {
                Lit(s) => Some(Separator::from(*s)),
                Re(p) => match Separator::pattern(p) {
                    Ok(separator) => Some(separator),
                    Err(e) => {
                        tracing::warn!("skipping separator: {e}");
                        None
                    }
                },
            })
            .collect()
    }
}

/// Measures text for chunk sizing. Characters by default; plug a token
/// count in to size chunks for an embedding model.
pub type LengthFunction = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Recursive character splitter.
///
/// Splits on the first separator present in the text, literal or regex.
/// Pieces shorter than `chunk_size` are packed back together up to
/// `chunk_size`; longer pieces are split again with the remaining separators. Each separator stays at the
/// start of the piece that follows it.
#[derive(Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<Separator>,
    length: LengthFunction,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self::new(4000, 200)
    }
}

impl std::fmt::Debug for TextSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextSplitter")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_overlap", &self.chunk_overlap)
            .field("separators", &self.separators)
            .finish()
    }
}

impl TextSplitter {
    /// Overlap is ignored when it is not smaller than the chunk size.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap: if chunk_overlap < chunk_size { chunk_overlap } else { 0 },
            separators: SeparatorSet::Plain.separators(),
            length: Arc::new(|s: &str| s.chars().count()),
        }
    }

    pub fn with_separators<S: Into<Separator>>(
        mut self,
        separators: impl IntoIterator<Item = S>,
    ) -> Self {
        self.separators = separators.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_separator_set(mut self, set: SeparatorSet) -> Self {
        self.separators = set.separators();
        self
    }

    pub fn with_length_function(
        mut self,
        length: impl Fn(&str) -> usize + Send + Sync + 'static,
    ) -> Self {
        self.length = Arc::new(length);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
            .into_iter()
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// Split every document, copying its metadata onto each chunk.
    pub fn split_documents(&self, documents: &[Document]) -> Vec<Document> {
        documents
            .iter()
            .flat_map(|doc| {
                self.split(&doc.content).into_iter().map(|chunk| Document {
                    content: chunk,
                    metadata: doc.metadata.clone(),
                })
            })
            .collect()
    }

    fn split_with(&self, text: &str, separators: &[Separator]) -> Vec<String> {
        let empty = Separator::from("");
        let (separator, rest) = match separators.iter().position(|s| s.is_found_in(text)) {
            Some(i) => (&separators[i], &separators[i + 1..]),
            None => (&empty, &[][..]),
        };

        let mut chunks = Vec::new();
        let mut good = Vec::new();
        for piece in split_keeping_separator(text, separator) {
            if (self.length)(piece) < self.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                chunks.extend(self.merge(&good));
                good.clear();
            }
            if rest.is_empty() {
                chunks.push(piece.to_string());
            } else {
                chunks.extend(self.split_with(piece, rest));
            }
        }
        if !good.is_empty() {
            chunks.extend(self.merge(&good));
        }
        chunks
    }

    /// Pack small pieces into chunks, carrying trailing pieces that fit in
    /// the overlap into the next chunk.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut overlap: Vec<&str> = Vec::new();
        let mut size = 0;

        for &piece in pieces {
            let len = (self.length)(piece);
            if size + len > self.chunk_size && !current.is_empty() {
                chunks.push(join(&overlap, &current));

                overlap.clear();
                let mut overlap_size = 0;
                for &prev in current.iter().rev() {
                    let prev_len = (self.length)(prev);
                    if overlap_size + prev_len > self.chunk_overlap
                        || overlap_size + prev_len + len > self.chunk_size
                    {
                        break;
                    }
                    overlap_size += prev_len;
                    overlap.insert(0, prev);
                }
                size = overlap_size + len;
                current = vec![piece];
            } else {
                size += len;
                current.push(piece);
            }
        }
        if !current.is_empty() {
            chunks.push(join(&overlap, &current));
        }
        chunks
    }
}

fn join(overlap: &[&str], current: &[&str]) -> String {
    let joined: String = overlap.iter().chain(current).copied().collect();
    joined.trim().to_string()
}

/// Split before every occurrence of `separator`; an empty separator splits
/// into characters.
fn split_keeping_separator<'a>(text: &'a str, separator: &Separator) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    for i in separator.match_starts(text) {
        if i > start {
            pieces.push(&text[start..i]);
            start = i;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}
