mod file;
mod memory;

pub use file::{FileBlobStore, FileQueueStore};
pub use memory::{MemoryBlobStore, MemoryQueueStore};
