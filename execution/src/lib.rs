//! The remote-execution service core: the message bridge between Git
//! trees and Remote Execution directories, the upstream client stack, the
//! tree upload pipeline, and the server-side services.

pub mod api;
pub mod blob;
pub mod bridge;
pub mod remote;
pub mod service;
pub mod tree;
pub mod upload;

pub use api::{CacheFlag, DummyExecutionApi, ExecutionAction, ExecutionApi, ExecutionResponse};
pub use blob::Blob;
pub use remote::{RemoteExecutionClient, MAX_BATCH_TRANSFER_SIZE};
pub use service::{OperationCache, ServerConfig, TlsAuth};
pub use tree::{BlobTree, DirectoryEntry, DirectoryTree};

/// Exit code for missing or unparsable configuration and credential
/// files.
pub const EXIT_CONFIG_ERROR: i32 = 71;
