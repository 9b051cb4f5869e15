mod index;
mod vector_store;

pub use index::FlatIndex;
pub use vector_store::{SearchResult, VectorStore};
