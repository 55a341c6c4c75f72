//! The six gRPC services of the execution endpoint and their assembly.

pub mod ac;
pub mod bytestream;
pub mod capabilities;
pub mod cas;
pub mod execution;
pub mod operations;
pub mod server;

pub use execution::ExecutionService;
pub use operations::OperationCache;
pub use server::{ServerConfig, TlsAuth};
