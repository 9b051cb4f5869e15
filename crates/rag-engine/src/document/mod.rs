mod chunker;

pub use chunker::{Chunk, SemanticChunker};
