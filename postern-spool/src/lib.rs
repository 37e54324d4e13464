pub mod backends;
pub mod config;
pub mod directory;
pub mod error;
pub mod message;
pub mod queue;
pub mod spool;
pub mod store;

pub use backends::{FileBlobStore, FileQueueStore, MemoryBlobStore, MemoryQueueStore};
pub use config::{DirectoryConfig, SpoolConfig, StoreConfig};
pub use directory::{Directory, DirectoryData, MemoryDirectory, RcptHost, Route, User};
pub use error::{DirectoryError, DirectoryResult, Result, SerializationError, SpoolError};
pub use message::{
    BlobKey, MessageId, QueueStatus, QueuedMessage, RETURN_PATH_NULL, RETURN_PATH_TRIPLE_BOUNCE,
};
pub use queue::{DELIVERY_TOPIC, Job, MemoryWorkQueue, WorkQueue};
pub use spool::{Spool, Submission};
pub use store::{BlobStore, QueueStore};
