mod index;
mod splitter;
mod store;

pub use index::{IndexConfig, IndexSnapshot, Metric, VectorIndex};
pub use splitter::{LengthFunction, Separator, SeparatorSet, TextSplitter};
pub use store::{Document, DocumentStore, EmbeddedDocument};
